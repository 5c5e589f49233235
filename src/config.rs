use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::{MAX_FLOORS, MAX_FLOOR_NAME_LEN, MAX_SLOTS_PER_FLOOR};
use crate::model::FloorLayout;

/// Server configuration, read from `PARKEASE_*` environment variables.
/// Unparseable numbers fall back to their defaults; the floor layout is
/// clamped to the limits in `limits`.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub layout: FloorLayout,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "parkease".into(),
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_millis(3000),
            layout: FloorLayout::default(),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let floors: Vec<String> = lookup("PARKEASE_FLOORS")
            .map(|s| {
                s.split(',')
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty() && f.len() <= MAX_FLOOR_NAME_LEN)
                    .take(MAX_FLOORS)
                    .collect()
            })
            .filter(|v: &Vec<String>| !v.is_empty())
            .unwrap_or(defaults.layout.floors);
        let slots_per_floor = parse_var(&lookup, "PARKEASE_SLOTS_PER_FLOOR")
            .filter(|n: &u32| *n > 0)
            .map(|n| n.min(MAX_SLOTS_PER_FLOOR))
            .unwrap_or(defaults.layout.slots_per_floor);

        Self {
            bind: lookup("PARKEASE_BIND").unwrap_or(defaults.bind),
            port: parse_var(&lookup, "PARKEASE_PORT").unwrap_or(defaults.port),
            data_dir: lookup("PARKEASE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("PARKEASE_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&lookup, "PARKEASE_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "PARKEASE_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            sweep_interval: parse_var(&lookup, "PARKEASE_SWEEP_INTERVAL_MS")
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            layout: FloorLayout { floors, slots_per_floor },
            metrics_port: parse_var(&lookup, "PARKEASE_METRICS_PORT"),
            tls_cert: lookup("PARKEASE_TLS_CERT"),
            tls_key: lookup("PARKEASE_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
