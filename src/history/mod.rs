use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::Config;
use crate::export::MetricsCallback;

/// Spark monitoring REST API prefix.
pub const API_PREFIX: &str = "/api/v1/applications";

/// Upstream label used for request metrics.
const UPSTREAM: &str = "history";

/// Application record from the Spark REST API.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AppDetail {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attempts: Vec<AppAttempt>,
}

impl AppDetail {
    /// Spark version reported by the most recent attempt.
    pub fn spark_version(&self) -> Option<&str> {
        self.attempts
            .iter()
            .find_map(|a| a.app_spark_version.as_deref())
    }
}

/// One attempt of a Spark application.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AppAttempt {
    #[serde(rename = "attemptId", default)]
    pub attempt_id: Option<String>,
    #[serde(rename = "sparkUser", default)]
    pub spark_user: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(rename = "appSparkVersion", default)]
    pub app_spark_version: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
}

/// Executor record from the Spark REST API.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExecutorSummary {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "hostPort", default)]
    pub host_port: Option<String>,
    /// Storage memory in use, bytes.
    #[serde(rename = "memoryUsed", default)]
    pub memory_used: Option<f64>,
    #[serde(rename = "totalCores", default)]
    pub total_cores: Option<f64>,
    #[serde(rename = "totalTasks", default)]
    pub total_tasks: Option<f64>,
}

impl ExecutorSummary {
    /// Host part of `hostPort`.
    pub fn host(&self) -> &str {
        let host_port = self.host_port.as_deref().unwrap_or_default();
        match host_port.split_once(':') {
            Some((host, _)) => host,
            None => host_port,
        }
    }
}

/// One executor entry as returned by the Spark REST API.
///
/// Entries are decoded individually so that a malformed entry is reported
/// against its application rather than failing the whole listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorRecord {
    raw: serde_json::Value,
}

impl ExecutorRecord {
    pub fn from_value(raw: serde_json::Value) -> Self {
        Self { raw }
    }

    /// Executor id, or "unknown" when absent or not a string.
    pub fn id(&self) -> &str {
        self.raw
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
    }

    /// Decode the typed fields of this entry.
    pub fn decode(&self) -> Result<ExecutorSummary> {
        ExecutorSummary::deserialize(&self.raw)
            .with_context(|| format!("decoding Spark executor {}", self.id()))
    }
}

/// Why a single candidate endpoint was skipped.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("requesting {url}: {source}")]
    Transport { url: String, source: reqwest::Error },

    #[error("unexpected status {status} from {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("decoding response from {url}: {source}")]
    Decode { url: String, source: reqwest::Error },
}

impl FetchError {
    /// Short label for request metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { source, .. } if source.is_timeout() => "timeout",
            Self::Transport { .. } => "transport",
            Self::Status { .. } => "status",
            Self::Decode { .. } => "decode",
        }
    }
}

/// Source of per-application runtime detail.
///
/// Both lookups are best-effort: a missing record is a normal outcome, not
/// an error.
pub trait DetailResolver: Send + Sync {
    /// Fetch the application record.
    fn get_detail(
        &self,
        app_id: &str,
    ) -> impl std::future::Future<Output = Option<AppDetail>> + Send;

    /// Fetch the application's executors, undecoded.
    fn get_workers(
        &self,
        app_id: &str,
    ) -> impl std::future::Future<Output = Vec<ExecutorRecord>> + Send;
}

/// HTTP client probing an ordered list of Spark REST endpoints.
///
/// Finished applications live in the history server while running ones are
/// served by the driver UI, whose port depends on how many drivers share the
/// host, so each lookup walks the candidates until one answers.
pub struct Client {
    http: reqwest::Client,
    candidates: Vec<String>,
    metrics: Option<MetricsCallback>,
}

impl Client {
    /// Create a new client over the configured candidate endpoints.
    pub fn new(cfg: &Config) -> Result<Self> {
        let timeout = if cfg.history.timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            cfg.history.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            candidates: cfg.history_base_urls(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    /// The callback receives (upstream, status, duration).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    /// Candidate base URLs in probe order.
    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    fn record_request(&self, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(UPSTREAM, status, duration);
        }
    }

    /// GET `path` from each candidate in turn, returning the first success.
    async fn get_first<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        for base in &self.candidates {
            let start = Instant::now();
            match self.get_json::<T>(base, path).await {
                Ok(value) => {
                    self.record_request("success", start.elapsed());
                    return Some(value);
                }
                Err(e) => {
                    self.record_request(e.kind(), start.elapsed());
                    debug!(error = %e, "spark endpoint unavailable, trying next");
                }
            }
        }

        None
    }

    async fn get_json<T: DeserializeOwned>(&self, base: &str, path: &str) -> Result<T, FetchError> {
        let url = format!("{base}{path}");

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { url, status });
        }

        response
            .json()
            .await
            .map_err(|source| FetchError::Decode { url, source })
    }
}

impl DetailResolver for Client {
    async fn get_detail(&self, app_id: &str) -> Option<AppDetail> {
        let detail = self
            .get_first::<AppDetail>(&format!("{API_PREFIX}/{app_id}"))
            .await;
        if detail.is_none() {
            debug!(app_id, "no Spark detail available");
        }
        detail
    }

    async fn get_workers(&self, app_id: &str) -> Vec<ExecutorRecord> {
        match self
            .get_first::<Vec<serde_json::Value>>(&format!("{API_PREFIX}/{app_id}/executors"))
            .await
        {
            Some(executors) => executors.into_iter().map(ExecutorRecord::from_value).collect(),
            None => {
                debug!(app_id, "no Spark executors available");
                Vec::new()
            }
        }
    }
}
