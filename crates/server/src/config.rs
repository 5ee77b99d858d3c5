// Server configuration.
//
// Environment variable parsing with defaults for local development. Pool
// sizing lives in `db::pool::PoolConfig`.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use ctxsync_common::redact::DEFAULT_MAX_SCAN_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Core server configuration, built by [`ServerConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Durable store connection string. Unset means in-memory stores.
    pub database_url: Option<String>,
    /// Token cache connection string; falls back to `database_url`.
    pub cache_url: Option<String>,
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Largest joined file text the redactor will scan.
    pub max_scan_bytes: usize,
    /// Optional TOML file overriding the token policy table.
    pub policy_file: Option<PathBuf>,
    /// How often expired cache entries and idle workspace locks are swept.
    pub purge_interval: Duration,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CTXSYNC_HOST` | `0.0.0.0` |
    /// | `CTXSYNC_PORT` | `8080` |
    /// | `CTXSYNC_DATABASE_URL` | *(none)* |
    /// | `CTXSYNC_CACHE_URL` | `CTXSYNC_DATABASE_URL` |
    /// | `CTXSYNC_LOG_FILTER` | `info` |
    /// | `CTXSYNC_LOG_FORMAT` | `pretty` (`json` accepted) |
    /// | `CTXSYNC_MAX_SCAN_BYTES` | 4 MiB |
    /// | `CTXSYNC_POLICY_FILE` | *(none)* |
    /// | `CTXSYNC_PURGE_INTERVAL_SECS` | `60` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("CTXSYNC_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("CTXSYNC_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("CTXSYNC_DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        let cache_url = env("CTXSYNC_CACHE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| database_url.clone());

        let log_filter = env("CTXSYNC_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("CTXSYNC_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let max_scan_bytes = env("CTXSYNC_MAX_SCAN_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &usize| *v > 0)
            .unwrap_or(DEFAULT_MAX_SCAN_BYTES);

        let policy_file = env("CTXSYNC_POLICY_FILE").ok().map(PathBuf::from);

        let purge_interval = env("CTXSYNC_PURGE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &u64| *v > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));

        Self {
            listen_addr,
            database_url,
            cache_url,
            log_filter,
            log_format,
            max_scan_bytes,
            policy_file,
            purge_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:8080");
        assert!(cfg.database_url.is_none());
        assert!(cfg.cache_url.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        assert_eq!(cfg.max_scan_bytes, DEFAULT_MAX_SCAN_BYTES);
        assert!(cfg.policy_file.is_none());
        assert_eq!(cfg.purge_interval, Duration::from_secs(60));
    }

    #[test]
    fn cache_url_falls_back_to_database_url() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::from([(
            "CTXSYNC_DATABASE_URL",
            "postgres://db/ctxsync?sslmode=require",
        )])));
        assert_eq!(cfg.cache_url, cfg.database_url);

        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::from([
            ("CTXSYNC_DATABASE_URL", "postgres://db/ctxsync?sslmode=require"),
            ("CTXSYNC_CACHE_URL", "postgres://cache/ctxsync?sslmode=require"),
        ])));
        assert_eq!(cfg.cache_url.as_deref(), Some("postgres://cache/ctxsync?sslmode=require"));
    }

    #[test]
    fn custom_values_are_parsed() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::from([
            ("CTXSYNC_HOST", "127.0.0.1"),
            ("CTXSYNC_PORT", "9000"),
            ("CTXSYNC_LOG_FORMAT", "JSON"),
            ("CTXSYNC_MAX_SCAN_BYTES", "1024"),
            ("CTXSYNC_POLICY_FILE", "/etc/ctxsync/policy.toml"),
            ("CTXSYNC_PURGE_INTERVAL_SECS", "5"),
        ])));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.max_scan_bytes, 1024);
        assert_eq!(cfg.policy_file, Some(PathBuf::from("/etc/ctxsync/policy.toml")));
        assert_eq!(cfg.purge_interval, Duration::from_secs(5));
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::from([
            ("CTXSYNC_PORT", "not-a-port"),
            ("CTXSYNC_MAX_SCAN_BYTES", "0"),
            ("CTXSYNC_PURGE_INTERVAL_SECS", "-1"),
        ])));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.max_scan_bytes, DEFAULT_MAX_SCAN_BYTES);
        assert_eq!(cfg.purge_interval, Duration::from_secs(60));
    }
}
