use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::limits::*;
use crate::model::Ms;

/// Server settings, read once from `RESERVD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub retention_ms: Ms,
    pub reaper_interval: Duration,
    pub slot_step_ms: Ms,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "reservd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            retention_ms: engine.retention_ms,
            reaper_interval: Duration::from_secs(5),
            slot_step_ms: engine.slot_step_ms,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to the default
    /// with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let reaper_interval_ms = parsed(&lookup, "RESERVD_REAPER_INTERVAL_MS", d.reaper_interval.as_millis() as u64);
        Self {
            port: parsed(&lookup, "RESERVD_PORT", d.port),
            bind: lookup("RESERVD_BIND").unwrap_or(d.bind),
            data_dir: lookup("RESERVD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("RESERVD_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "RESERVD_MAX_CONNECTIONS", d.max_connections).max(1),
            compact_threshold: parsed(&lookup, "RESERVD_COMPACT_THRESHOLD", d.compact_threshold),
            retention_ms: parsed(&lookup, "RESERVD_RETENTION_MS", d.retention_ms).max(0),
            reaper_interval: Duration::from_millis(reaper_interval_ms.max(1)),
            slot_step_ms: parsed(&lookup, "RESERVD_SLOT_STEP_MS", d.slot_step_ms).max(MIN_SLOT_STEP_MS),
            metrics_port: lookup("RESERVD_METRICS_PORT").and_then(|s| s.parse().ok()),
            tls_cert: lookup("RESERVD_TLS_CERT"),
            tls_key: lookup("RESERVD_TLS_KEY"),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            slot_step_ms: self.slot_step_ms,
            retention_ms: self.retention_ms,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr + Copy>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring invalid {key}={raw:?}");
            default
        }),
    }
}
