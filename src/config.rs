use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::EngineConfig;
use crate::limits::DEFAULT_MAX_ROOM_NAME_LEN;

/// Process-wide settings, read once in `main` from `ROOMD_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub max_room_name_len: usize,
    /// Bootstrap administrator, created on start unless the e-mail exists.
    pub first_superuser: Option<(String, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            max_room_name_len: DEFAULT_MAX_ROOM_NAME_LEN,
            first_superuser: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparsable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let first_superuser = match (
            lookup("ROOMD_FIRST_SUPERUSER_EMAIL"),
            lookup("ROOMD_FIRST_SUPERUSER_PASSWORD"),
        ) {
            (Some(email), Some(password)) => Some((email, password)),
            _ => None,
        };
        Self {
            bind: lookup("ROOMD_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "ROOMD_PORT").unwrap_or(defaults.port),
            data_dir: lookup("ROOMD_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            max_connections: parsed(&lookup, "ROOMD_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "ROOMD_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "ROOMD_METRICS_PORT"),
            tls_cert: lookup("ROOMD_TLS_CERT"),
            tls_key: lookup("ROOMD_TLS_KEY"),
            max_room_name_len: parsed(&lookup, "ROOMD_MAX_ROOM_NAME_LEN").unwrap_or(defaults.max_room_name_len),
            first_superuser,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roomd.wal")
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            wal_path: self.wal_path(),
            max_room_name_len: self.max_room_name_len,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
