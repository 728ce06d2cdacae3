//! Runtime configuration.
//!
//! Loaded from a YAML file (path from `SHELLY_MANAGER_CONFIG`, default
//! `/etc/shelly-manager/config.yaml`), with every knob overridable via
//! `SHELLY_MANAGER_*` environment variables. Missing file means defaults.

use std::path::PathBuf;

use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/shelly-manager/config.yaml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub discovery: DiscoverySettings,
    pub metrics: MetricsConfig,
    pub plugins: PluginsConfig,
    pub auth: AuthSettings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 8090 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Provider name; empty means the default sqlite path.
    pub provider: String,
    pub path: PathBuf,
    pub dsn: Option<String>,
    pub max_connections: u32,
    pub slow_query_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            path: PathBuf::from("/data/shelly-manager.db"),
            dsn: None,
            max_connections: 4,
            slow_query_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub networks: Vec<String>,
    pub concurrent_scans: usize,
    pub probe_timeout_secs: u64,
    pub ttl_secs: u64,
    /// How often the TTL sweep for discovered rows runs.
    pub cleanup_interval_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            networks: Vec::new(),
            concurrent_scans: 10,
            probe_timeout_secs: 1,
            ttl_secs: 300,
            cleanup_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 1 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub output_dir: PathBuf,
    /// Bounded concurrency for drift runs.
    pub drift_workers: usize,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self { output_dir: PathBuf::from("/data/exports"), drift_workers: 5 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Bearer key; `None` leaves the API open.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("SHELLY_MANAGER_{}", suffix)).ok().filter(|v| !v.is_empty())
}

impl AppConfig {
    /// Load the YAML file, then apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = env_var("CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            tracing::info!(path = %path.display(), "loaded config file");
            serde_yaml::from_str(&raw)?
        } else {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(port) = env_var("HTTP_PORT").and_then(|v| v.parse().ok()) {
            self.http.port = port;
        }
        if let Some(provider) = env_var("DB_PROVIDER") {
            self.database.provider = provider;
        }
        if let Some(path) = env_var("DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(dsn) = env_var("DB_DSN") {
            self.database.dsn = Some(dsn);
        }
        if let Some(ms) = env_var("SLOW_QUERY_MS").and_then(|v| v.parse().ok()) {
            self.database.slow_query_ms = ms;
        }
        if let Some(networks) = env_var("SCAN_NETWORKS") {
            self.discovery.networks =
                networks.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(n) = env_var("CONCURRENT_SCANS").and_then(|v| v.parse().ok()) {
            self.discovery.concurrent_scans = n;
        }
        if let Some(secs) = env_var("DISCOVERY_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.discovery.ttl_secs = secs;
        }
        if let Some(secs) = env_var("METRICS_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.metrics.interval_secs = secs;
        }
        if let Some(dir) = env_var("EXPORT_DIR") {
            self.plugins.output_dir = PathBuf::from(dir);
        }
        if let Some(key) = env_var("API_KEY") {
            self.auth.api_key = Some(key);
        }
        if let Some(level) = env_var("LOG_LEVEL") {
            self.log.level = level;
        }
    }

    pub fn discovery_options(&self) -> crate::discovery::DiscoveryOptions {
        crate::discovery::DiscoveryOptions {
            concurrent_scans: self.discovery.concurrent_scans,
            probe_timeout: std::time::Duration::from_secs(self.discovery.probe_timeout_secs),
            ttl: std::time::Duration::from_secs(self.discovery.ttl_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.http.port, 8090);
        assert_eq!(config.discovery.concurrent_scans, 10);
        assert_eq!(config.metrics.interval_secs, 1);
        assert!(config.auth.api_key.is_none());
    }

    #[test]
    fn test_yaml_parse_partial() {
        let raw = "
http:
  port: 9000
discovery:
  networks: [\"192.168.1.0/24\"]
  concurrent_scans: 20
auth:
  api_key: sekrit
";
        let config: AppConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.http.port, 9000);
        assert_eq!(config.discovery.networks, vec!["192.168.1.0/24".to_string()]);
        assert_eq!(config.discovery.concurrent_scans, 20);
        // Untouched sections keep defaults.
        assert_eq!(config.database.slow_query_ms, 500);
        assert_eq!(config.auth.api_key.as_deref(), Some("sekrit"));
    }
}
