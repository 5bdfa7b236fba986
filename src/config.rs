use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::level_filters::LevelFilter;

/// Top-level configuration for the exporter.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// YARN ResourceManager connection configuration.
    #[serde(default)]
    pub yarn: YarnConfig,

    /// Spark history/UI connection configuration.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Prometheus exposition server configuration.
    #[serde(default)]
    pub exporter: ExporterConfig,

    /// Delay between scrape cycles. Default: 30s.
    #[serde(default = "default_scrape_interval", with = "humantime_serde")]
    pub scrape_interval: Duration,
}

/// YARN ResourceManager connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct YarnConfig {
    /// ResourceManager hostname.
    #[serde(default)]
    pub host: String,

    /// ResourceManager web port. Default: 8088.
    #[serde(default = "default_yarn_port")]
    pub port: u16,

    /// Full base URL (e.g. "https://rm.example:8090"). Overrides host/port.
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_yarn_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Spark history server / live UI configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// History server hostname. Default: the YARN host.
    #[serde(default)]
    pub host: String,

    /// Ports probed in order. Default: [18080, 4040, 4041].
    #[serde(default = "default_history_ports")]
    pub ports: Vec<u16>,

    /// Explicit base URLs probed in order. Overrides host/ports when set.
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Per-endpoint request timeout. Default: 5s.
    #[serde(default = "default_history_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Prometheus exposition server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_exporter_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_scrape_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_yarn_port() -> u16 {
    8088
}

fn default_yarn_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_history_ports() -> Vec<u16> {
    vec![18080, 4040, 4041]
}

fn default_history_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_exporter_addr() -> String {
    ":8080".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            yarn: YarnConfig::default(),
            history: HistoryConfig::default(),
            exporter: ExporterConfig::default(),
            scrape_interval: default_scrape_interval(),
        }
    }
}

impl Default for YarnConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_yarn_port(),
            endpoint: String::new(),
            timeout: default_yarn_timeout(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            ports: default_history_ports(),
            endpoints: Vec::new(),
            timeout: default_history_timeout(),
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            addr: default_exporter_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Parse `log_level` as a single verbosity level.
    ///
    /// Level names are case-insensitive; `WARNING` is accepted as `warn`.
    pub fn log_level_filter(&self) -> Result<LevelFilter> {
        let level = self.log_level.trim();
        let level = if level.eq_ignore_ascii_case("warning") {
            "warn"
        } else {
            level
        };

        level.parse::<LevelFilter>().with_context(|| {
            format!(
                "invalid log level {:?} (expected trace, debug, info, warn or error)",
                self.log_level
            )
        })
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.log_level_filter()?;

        if self.yarn.host.is_empty() && self.yarn.endpoint.is_empty() {
            bail!("yarn.host is required (or set yarn.endpoint)");
        }

        if self.yarn.timeout.is_zero() {
            bail!("yarn.timeout must be positive");
        }

        if self.history.timeout.is_zero() {
            bail!("history.timeout must be positive");
        }

        if self.history.timeout > self.yarn.timeout {
            bail!(
                "history.timeout {:?} must not exceed yarn.timeout {:?}",
                self.history.timeout,
                self.yarn.timeout
            );
        }

        if self.history_base_urls().is_empty() {
            bail!("history.ports or history.endpoints must list at least one candidate");
        }

        if self.scrape_interval.is_zero() {
            bail!("scrape_interval must be positive");
        }

        if self.exporter.addr.is_empty() {
            bail!("exporter.addr is required");
        }

        Ok(())
    }

    /// Base URL of the ResourceManager REST API.
    pub fn yarn_base_url(&self) -> String {
        if !self.yarn.endpoint.is_empty() {
            return self.yarn.endpoint.trim_end_matches('/').to_string();
        }

        format!("http://{}:{}", self.yarn.host, self.yarn.port)
    }

    /// Ordered candidate base URLs for the Spark REST API.
    pub fn history_base_urls(&self) -> Vec<String> {
        if !self.history.endpoints.is_empty() {
            return self
                .history
                .endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect();
        }

        let host = if self.history.host.is_empty() {
            &self.yarn.host
        } else {
            &self.history.host
        };

        if host.is_empty() {
            return Vec::new();
        }

        self.history
            .ports
            .iter()
            .map(|port| format!("http://{host}:{port}"))
            .collect()
    }
}
