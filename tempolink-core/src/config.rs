//! Embedded-TOML-defaults-plus-environment-override configuration loader.
//! Follows this codebase's existing pattern of shipping sane defaults as a
//! compile-time-embedded TOML document and layering overrides on top at
//! `Config::load` time — the only difference from the desktop-tool original
//! is that the override source is environment variables rather than a user
//! config file, since this is a server process.

use std::str::FromStr;

use serde::Deserialize;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Deserialize, Default, Clone)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    heartbeat: HeartbeatConfig,
    #[serde(default)]
    transport: TransportConfig,
    #[serde(default)]
    telemetry: TelemetryConfig,
}

#[derive(Deserialize, Default, Clone)]
struct ServerConfig {
    port: Option<u16>,
    allowed_origins: Option<Vec<String>>,
}

#[derive(Deserialize, Default, Clone)]
struct StoreConfig {
    backend: Option<String>,
    redis_url: Option<String>,
    session_ttl_secs: Option<u64>,
    idle_sweep_interval_secs: Option<u64>,
    reconnect_probe_interval_secs: Option<u64>,
    reconnect_max_attempts: Option<u64>,
}

#[derive(Deserialize, Default, Clone)]
struct SessionConfig {
    max_members: Option<u32>,
}

#[derive(Deserialize, Default, Clone)]
struct HeartbeatConfig {
    interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
}

#[derive(Deserialize, Default, Clone)]
struct TransportConfig {
    tick_period_ms: Option<u64>,
}

#[derive(Deserialize, Default, Clone)]
struct TelemetryConfig {
    health_port: Option<u16>,
    report_interval_secs: Option<u64>,
}

/// Which durable backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackendKind {
    Durable,
    Memory,
}

/// Fully resolved runtime configuration, embedded defaults merged with
/// `TEMPOLINK_*` environment overrides.
pub struct Config {
    file: ConfigFile,
}

impl Config {
    /// Loads the embedded defaults, then overrides any field present as a
    /// `TEMPOLINK_*` environment variable. A malformed environment value is
    /// logged and the existing (default or already-set) value is kept,
    /// mirroring this codebase's "ignore malformed, warn, keep base" merge
    /// policy for user overrides.
    pub fn load() -> Self {
        let mut file: ConfigFile =
            toml::from_str(DEFAULT_CONFIG).expect("failed to parse embedded config.toml");

        override_opt(&mut file.server.port, "TEMPOLINK_PORT");
        override_origins(&mut file.server.allowed_origins, "TEMPOLINK_ALLOWED_ORIGINS");
        override_string(&mut file.store.backend, "TEMPOLINK_STORE_BACKEND");
        override_string(&mut file.store.redis_url, "TEMPOLINK_REDIS_URL");
        override_opt(&mut file.store.session_ttl_secs, "TEMPOLINK_SESSION_TTL_SECS");
        override_opt(
            &mut file.store.idle_sweep_interval_secs,
            "TEMPOLINK_IDLE_SWEEP_INTERVAL_SECS",
        );
        override_opt(
            &mut file.store.reconnect_probe_interval_secs,
            "TEMPOLINK_RECONNECT_PROBE_INTERVAL_SECS",
        );
        override_opt(
            &mut file.store.reconnect_max_attempts,
            "TEMPOLINK_RECONNECT_MAX_ATTEMPTS",
        );
        override_opt(&mut file.session.max_members, "TEMPOLINK_MAX_MEMBERS");
        override_opt(
            &mut file.heartbeat.interval_secs,
            "TEMPOLINK_HEARTBEAT_INTERVAL_SECS",
        );
        override_opt(
            &mut file.heartbeat.timeout_secs,
            "TEMPOLINK_HEARTBEAT_TIMEOUT_SECS",
        );
        override_opt(&mut file.transport.tick_period_ms, "TEMPOLINK_TICK_PERIOD_MS");
        override_opt(&mut file.telemetry.health_port, "TEMPOLINK_HEALTH_PORT");
        override_opt(
            &mut file.telemetry.report_interval_secs,
            "TEMPOLINK_TELEMETRY_REPORT_INTERVAL_SECS",
        );

        Self { file }
    }

    pub fn port(&self) -> u16 {
        self.file.server.port.unwrap_or(7890)
    }

    /// Empty means unrestricted.
    pub fn allowed_origins(&self) -> &[String] {
        self.file.server.allowed_origins.as_deref().unwrap_or(&[])
    }

    pub fn store_backend(&self) -> StoreBackendKind {
        match self.file.store.backend.as_deref() {
            Some("durable") => StoreBackendKind::Durable,
            _ => StoreBackendKind::Memory,
        }
    }

    pub fn redis_url(&self) -> Option<&str> {
        self.file
            .store
            .redis_url
            .as_deref()
            .filter(|s| !s.is_empty())
    }

    pub fn session_ttl_secs(&self) -> u64 {
        self.file.store.session_ttl_secs.unwrap_or(1800)
    }

    pub fn idle_sweep_interval_secs(&self) -> u64 {
        self.file.store.idle_sweep_interval_secs.unwrap_or(300)
    }

    pub fn reconnect_probe_interval_secs(&self) -> u64 {
        self.file.store.reconnect_probe_interval_secs.unwrap_or(10)
    }

    /// 0 means unbounded.
    pub fn reconnect_max_attempts(&self) -> u64 {
        self.file.store.reconnect_max_attempts.unwrap_or(0)
    }

    pub fn default_max_members(&self) -> u32 {
        self.file.session.max_members.unwrap_or(8)
    }

    pub fn heartbeat_interval_secs(&self) -> u64 {
        self.file.heartbeat.interval_secs.unwrap_or(5)
    }

    pub fn heartbeat_timeout_secs(&self) -> u64 {
        self.file.heartbeat.timeout_secs.unwrap_or(15)
    }

    pub fn tick_period_ms(&self) -> u64 {
        self.file.transport.tick_period_ms.unwrap_or(100)
    }

    pub fn health_port(&self) -> u16 {
        self.file.telemetry.health_port.unwrap_or(8787)
    }

    pub fn telemetry_report_interval_secs(&self) -> u64 {
        self.file.telemetry.report_interval_secs.unwrap_or(5)
    }
}

fn override_opt<T: FromStr>(slot: &mut Option<T>, var: &str) {
    let Ok(raw) = std::env::var(var) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(v) => *slot = Some(v),
        Err(_) => {
            log::warn!(target: "config", "ignoring malformed {var}={raw:?}, keeping default")
        }
    }
}

fn override_string(slot: &mut Option<String>, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        *slot = Some(raw);
    }
}

fn override_origins(slot: &mut Option<Vec<String>>, var: &str) {
    let Ok(raw) = std::env::var(var) else {
        return;
    };
    *slot = Some(
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_embedded_defaults() {
        std::env::remove_var("TEMPOLINK_PORT");
        let config = Config::load();
        assert_eq!(config.port(), 7890);
        assert_eq!(config.store_backend(), StoreBackendKind::Memory);
        assert_eq!(config.session_ttl_secs(), 1800);
        assert_eq!(config.default_max_members(), 8);
        assert_eq!(config.tick_period_ms(), 100);
        assert_eq!(config.health_port(), 8787);
        assert!(config.allowed_origins().is_empty());
    }

    #[test]
    fn malformed_env_override_is_ignored() {
        std::env::set_var("TEMPOLINK_MAX_MEMBERS", "not-a-number");
        let config = Config::load();
        assert_eq!(config.default_max_members(), 8);
        std::env::remove_var("TEMPOLINK_MAX_MEMBERS");
    }

    #[test]
    fn valid_env_override_wins() {
        std::env::set_var("TEMPOLINK_TICK_PERIOD_MS", "50");
        let config = Config::load();
        assert_eq!(config.tick_period_ms(), 50);
        std::env::remove_var("TEMPOLINK_TICK_PERIOD_MS");
    }
}
