//! Aggregate health/performance reporting and the HTTP health endpoint.
//! Grounded on the teacher's periodic
//! `tick_heartbeat`/`cleanup_expired_sessions` loop in shape (a background
//! thread on a fixed interval), generalized from per-client heartbeats to
//! a whole-process telemetry snapshot, plus a small `tiny_http` server for
//! the health check itself since the teacher has no HTTP surface at all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tempolink_store::{BackendKind, Store, StoreManager};

use crate::sync::SyncEngine;

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryReport {
    pub active_sessions: u64,
    pub connected_members: u64,
    pub backend: String,
    pub degraded: bool,
    pub mean_latency_ms: u32,
    pub p95_latency_ms: u32,
    pub migrations: u64,
}

/// Runs the periodic aggregate-report loop and the `/healthz` HTTP
/// endpoint, both as detached background threads stopped on `Drop`.
pub struct TelemetryBus {
    store_manager: Arc<StoreManager>,
    sync: Arc<SyncEngine>,
    shutdown: Arc<AtomicBool>,
    report_handle: Option<JoinHandle<()>>,
    health_handle: Option<JoinHandle<()>>,
}

impl TelemetryBus {
    pub fn start(
        store_manager: Arc<StoreManager>,
        sync: Arc<SyncEngine>,
        report_interval: Duration,
        health_port: u16,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));

        let report_handle = {
            let store_manager = store_manager.clone();
            let sync = sync.clone();
            let shutdown = shutdown.clone();
            Some(thread::spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    thread::sleep(report_interval);
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let report = snapshot(&store_manager, &sync);
                    log::info!(
                        target: "telemetry",
                        "sessions={} members={} backend={} degraded={} mean_latency_ms={} p95_latency_ms={} migrations={}",
                        report.active_sessions,
                        report.connected_members,
                        report.backend,
                        report.degraded,
                        report.mean_latency_ms,
                        report.p95_latency_ms,
                        report.migrations
                    );
                }
            }))
        };

        let health_handle = if health_port == 0 {
            None
        } else {
            let store_manager = store_manager.clone();
            let sync = sync.clone();
            let shutdown = shutdown.clone();
            Some(thread::spawn(move || {
                run_health_server(store_manager, sync, shutdown, health_port)
            }))
        };

        Self {
            store_manager,
            sync,
            shutdown,
            report_handle,
            health_handle,
        }
    }

    pub fn snapshot(&self) -> TelemetryReport {
        snapshot(&self.store_manager, &self.sync)
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.report_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.health_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TelemetryBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn snapshot(store_manager: &Arc<StoreManager>, sync: &Arc<SyncEngine>) -> TelemetryReport {
    let sessions = store_manager.list_sessions().unwrap_or_default();
    let connected_members = sessions
        .iter()
        .map(|s| store_manager.member_count(&s.session_id).unwrap_or(0) as u64)
        .sum();
    let latency = sync.latency_stats();

    TelemetryReport {
        active_sessions: sessions.len() as u64,
        connected_members,
        backend: match store_manager.active_backend_kind() {
            BackendKind::Durable => "durable".to_string(),
            BackendKind::InMemory => "memory".to_string(),
        },
        degraded: store_manager.is_degraded(),
        mean_latency_ms: latency.mean_ms,
        p95_latency_ms: latency.p95_ms,
        migrations: store_manager.migration_count(),
    }
}

fn run_health_server(
    store_manager: Arc<StoreManager>,
    sync: Arc<SyncEngine>,
    shutdown: Arc<AtomicBool>,
    port: u16,
) {
    let server = match tiny_http::Server::http(("0.0.0.0", port)) {
        Ok(server) => server,
        Err(e) => {
            log::error!(target: "telemetry", "failed to bind health endpoint on port {port}: {e}");
            return;
        }
    };

    while !shutdown.load(Ordering::SeqCst) {
        match server.recv_timeout(Duration::from_millis(500)) {
            Ok(Some(request)) => {
                let report = snapshot(&store_manager, &sync);
                let body = serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string());
                let header = tiny_http::Header::from_bytes(
                    &b"Content-Type"[..],
                    &b"application/json"[..],
                )
                .expect("static header is valid");
                let response = tiny_http::Response::from_string(body).with_header(header);
                let _ = request.respond(response);
            }
            Ok(None) => continue,
            Err(e) => {
                log::warn!(target: "telemetry", "health endpoint recv error: {e}");
                break;
            }
        }
    }
}
