use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineConfig;

/// Server settings, read once from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// JSON account table; without it every login is refused.
    pub accounts: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            accounts: None,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let engine = EngineConfig {
            lock_timeout: parsed(&get, "SLOTBOOK_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.engine.lock_timeout),
            change_cutoff: parsed(&get, "SLOTBOOK_CHANGE_CUTOFF_MINUTES")
                .map(|m: u64| Duration::from_secs(m * 60))
                .unwrap_or(d.engine.change_cutoff),
            expansion_days: parsed(&get, "SLOTBOOK_EXPANSION_DAYS").unwrap_or(d.engine.expansion_days),
            default_booking_minutes: parsed(&get, "SLOTBOOK_DEFAULT_BOOKING_MINUTES")
                .unwrap_or(d.engine.default_booking_minutes),
        };
        Self {
            port: parsed(&get, "SLOTBOOK_PORT").unwrap_or(d.port),
            bind: get("SLOTBOOK_BIND").unwrap_or(d.bind),
            data_dir: get("SLOTBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            max_connections: parsed(&get, "SLOTBOOK_MAX_CONNECTIONS").unwrap_or(d.max_connections),
            compact_threshold: parsed(&get, "SLOTBOOK_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            metrics_port: parsed(&get, "SLOTBOOK_METRICS_PORT"),
            tls_cert: get("SLOTBOOK_TLS_CERT"),
            tls_key: get("SLOTBOOK_TLS_KEY"),
            accounts: get("SLOTBOOK_ACCOUNTS").map(PathBuf::from),
            engine,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let c = from_pairs(&[]);
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
        assert!(c.metrics_port.is_none());
        assert!(c.accounts.is_none());
        assert_eq!(c.engine.lock_timeout, Duration::from_secs(5));
        assert_eq!(c.engine.change_cutoff, Duration::from_secs(720 * 60));
        assert_eq!(c.engine.expansion_days, 28);
        assert_eq!(c.engine.default_booking_minutes, 30);
    }

    #[test]
    fn overrides_are_applied() {
        let c = from_pairs(&[
            ("SLOTBOOK_PORT", "6000"),
            ("SLOTBOOK_BIND", "127.0.0.1"),
            ("SLOTBOOK_METRICS_PORT", " 9100 "),
            ("SLOTBOOK_ACCOUNTS", "/etc/slotbook/accounts.json"),
            ("SLOTBOOK_LOCK_TIMEOUT_MS", "250"),
            ("SLOTBOOK_CHANGE_CUTOFF_MINUTES", "60"),
            ("SLOTBOOK_EXPANSION_DAYS", "14"),
        ]);
        assert_eq!(c.listen_addr(), "127.0.0.1:6000");
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.accounts, Some(PathBuf::from("/etc/slotbook/accounts.json")));
        assert_eq!(c.engine.lock_timeout, Duration::from_millis(250));
        assert_eq!(c.engine.change_cutoff, Duration::from_secs(3600));
        assert_eq!(c.engine.expansion_days, 14);
    }

    #[test]
    fn every_variable_is_read() {
        let c = from_pairs(&[
            ("SLOTBOOK_PORT", "7000"),
            ("SLOTBOOK_BIND", "10.0.0.1"),
            ("SLOTBOOK_DATA_DIR", "/var/lib/slotbook"),
            ("SLOTBOOK_MAX_CONNECTIONS", "64"),
            ("SLOTBOOK_COMPACT_THRESHOLD", "500"),
            ("SLOTBOOK_METRICS_PORT", "9200"),
            ("SLOTBOOK_TLS_CERT", "/etc/tls/cert.pem"),
            ("SLOTBOOK_TLS_KEY", "/etc/tls/key.pem"),
            ("SLOTBOOK_ACCOUNTS", "accounts.json"),
            ("SLOTBOOK_LOCK_TIMEOUT_MS", "100"),
            ("SLOTBOOK_CHANGE_CUTOFF_MINUTES", "30"),
            ("SLOTBOOK_EXPANSION_DAYS", "7"),
            ("SLOTBOOK_DEFAULT_BOOKING_MINUTES", "45"),
        ]);
        assert_eq!(c.port, 7000);
        assert_eq!(c.bind, "10.0.0.1");
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/slotbook"));
        assert_eq!(c.max_connections, 64);
        assert_eq!(c.compact_threshold, 500);
        assert_eq!(c.metrics_port, Some(9200));
        assert_eq!(c.tls_cert.as_deref(), Some("/etc/tls/cert.pem"));
        assert_eq!(c.tls_key.as_deref(), Some("/etc/tls/key.pem"));
        assert_eq!(c.accounts, Some(PathBuf::from("accounts.json")));
        assert_eq!(c.engine.lock_timeout, Duration::from_millis(100));
        assert_eq!(c.engine.change_cutoff, Duration::from_secs(30 * 60));
        assert_eq!(c.engine.expansion_days, 7);
        assert_eq!(c.engine.default_booking_minutes, 45);
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let c = from_pairs(&[("SLOTBOOK_PORT", "http"), ("SLOTBOOK_MAX_CONNECTIONS", "-1")]);
        assert_eq!(c.port, 5433);
        assert_eq!(c.max_connections, 256);
    }
}
