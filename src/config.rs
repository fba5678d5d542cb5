use std::path::PathBuf;
use std::time::Duration;

/// Daemon settings, read once at startup. Every value has a default; an unparseable
/// value falls back to it with a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let sweep_secs = parse_or(&lookup, "OCCUPANT_SWEEP_INTERVAL_SECS", defaults.sweep_interval.as_secs());
        Self {
            bind: lookup("OCCUPANT_BIND")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.bind),
            port: parse_or(&lookup, "OCCUPANT_PORT", defaults.port),
            data_dir: lookup("OCCUPANT_DATA_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parse_or(&lookup, "OCCUPANT_MAX_CONNECTIONS", defaults.max_connections).max(1),
            compact_threshold: parse_or(&lookup, "OCCUPANT_COMPACT_THRESHOLD", defaults.compact_threshold),
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
            metrics_port: lookup("OCCUPANT_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("occupant.wal")
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable setting, using default");
            default
        }),
    }
}
