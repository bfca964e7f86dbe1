//! Process entry point: loads configuration, binds the wire server, and
//! blocks until told to stop.
//!
//! Grounded on `marmikshah-rtsp-rs/crates/cli/src/main.rs`'s bin-crate
//! shape (parsed CLI args, construct-and-run, block on stdin then stop) —
//! adapted to this codebase's `log`/`env_logger` stack rather than the
//! unrelated example's `tracing`, per the "stay aligned with the teacher's
//! own logging choice" rule in DESIGN.md.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use tempolink_core::config::Config;
use tempolink_core::Coordinator;
use tempolink_net::{CoordinatorServer, ServerConfig};

#[derive(Parser)]
#[command(name = "tempolink-server", about = "Musical session coordination server")]
struct Args {
    /// Bind address (host:port); overrides TEMPOLINK_PORT/config.toml when given.
    #[arg(long)]
    bind: Option<String>,
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    let config = Config::load();
    let addr = args.bind.unwrap_or_else(|| format!("0.0.0.0:{}", config.port()));

    let server_config = ServerConfig {
        heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs()),
        heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs()),
    };

    let idle_sweep_interval = Duration::from_secs(config.idle_sweep_interval_secs());

    let server = match CoordinatorServer::bind(&addr, server_config, |sink| {
        Coordinator::new(&config, sink)
    }) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            log::error!(target: "server", "failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    spawn_idle_sweep(server.coordinator(), idle_sweep_interval);

    let accept_server = server.clone();
    let accept_handle = thread::spawn(move || accept_server.serve());

    log::info!(target: "server", "tempolink coordinator listening on {addr} — press Enter to stop");
    let mut input = String::new();
    let _ = io::stdin().read_line(&mut input);

    server.shutdown();
    let _ = accept_handle.join();
}

/// Background thread running `SessionRegistry`'s idle sweep on a fixed
/// interval for the lifetime of the process.
fn spawn_idle_sweep(coordinator: Arc<Coordinator>, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        coordinator.run_idle_sweep();
    });
}
