use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use prometheus::Counter;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::export::MetricsCallback;

/// ResourceManager REST path listing applications.
pub const APPS_PATH: &str = "/ws/v1/cluster/apps";

/// Application states considered active.
pub const ACTIVE_STATES: &str = "RUNNING,SUBMITTED,ACCEPTED";

/// Application types requested from the ResourceManager.
pub const APPLICATION_TYPES: &str = "SPARK";

/// Upstream label used for request metrics.
const UPSTREAM: &str = "yarn";

/// One application record as returned by the ResourceManager.
///
/// The record is kept undecoded so that a malformed entry only fails its
/// own [`AppSummary::decode`] call, not the whole listing.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSummary {
    raw: serde_json::Value,
}

impl AppSummary {
    pub fn from_value(raw: serde_json::Value) -> Self {
        Self { raw }
    }

    /// Application id, or "unknown" when absent or not a string.
    pub fn id(&self) -> &str {
        self.raw
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
    }

    /// Decode the typed fields of this record.
    pub fn decode(&self) -> Result<AppRecord> {
        AppRecord::deserialize(&self.raw)
            .with_context(|| format!("decoding YARN application {}", self.id()))
    }
}

/// Typed view of a ResourceManager application record.
///
/// Absent and `null` fields decode to `None`; present fields of the wrong
/// type are an error.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AppRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(rename = "allocatedMB", default)]
    pub allocated_mb: Option<f64>,
    #[serde(rename = "reservedMB", default)]
    pub reserved_mb: Option<f64>,
    #[serde(rename = "allocatedVCores", default)]
    pub allocated_vcores: Option<f64>,
    #[serde(rename = "reservedVCores", default)]
    pub reserved_vcores: Option<f64>,
    #[serde(rename = "runningContainers", default)]
    pub running_containers: Option<f64>,
    #[serde(rename = "startedTime", default)]
    pub started_time: Option<i64>,
    #[serde(rename = "finishedTime", default)]
    pub finished_time: Option<i64>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(rename = "trackingUrl", default)]
    pub tracking_url: Option<String>,
    #[serde(rename = "applicationType", default)]
    pub application_type: Option<String>,
    #[serde(rename = "finalStatus", default)]
    pub final_status: Option<String>,
}

/// Source of the active application inventory.
pub trait InventoryClient: Send + Sync {
    /// List active Spark applications.
    ///
    /// Failures are logged and counted by the implementation and yield an
    /// empty list.
    fn list_active_jobs(&self) -> impl std::future::Future<Output = Vec<AppSummary>> + Send;
}

/// HTTP-based ResourceManager client.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    metrics: Option<MetricsCallback>,
    errors: Option<Counter>,
}

impl Client {
    /// Create a new ResourceManager client.
    pub fn new(cfg: &Config) -> Result<Self> {
        let timeout = if cfg.yarn.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.yarn.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            base_url: cfg.yarn_base_url(),
            metrics: None,
            errors: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    /// The callback receives (upstream, status, duration).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    /// Set the counter incremented whenever listing fails.
    pub fn with_error_counter(mut self, counter: Counter) -> Self {
        self.errors = Some(counter);
        self
    }

    fn record_request(&self, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(UPSTREAM, status, duration);
        }
    }

    /// Full URL of the filtered application listing.
    pub fn apps_url(&self) -> String {
        format!(
            "{}{}?states={}&applicationTypes={}",
            self.base_url, APPS_PATH, ACTIVE_STATES, APPLICATION_TYPES
        )
    }

    /// Fetch the active application listing, propagating failures.
    pub async fn fetch_apps(&self) -> Result<Vec<AppSummary>> {
        let start = Instant::now();
        let result = self.request_apps().await;
        let status = if result.is_ok() { "success" } else { "error" };
        self.record_request(status, start.elapsed());
        result
    }

    async fn request_apps(&self) -> Result<Vec<AppSummary>> {
        let url = self.apps_url();
        debug!(url = %url, "fetching YARN applications");

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("requesting {APPS_PATH}"))?;

        let status_code = response.status();

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {} from {}: {}", status_code, APPS_PATH, body);
        }

        let resp: AppsApiResponse = response
            .json()
            .await
            .with_context(|| format!("decoding response from {APPS_PATH}"))?;

        Ok(resp.into_summaries())
    }
}

impl InventoryClient for Client {
    async fn list_active_jobs(&self) -> Vec<AppSummary> {
        match self.fetch_apps().await {
            Ok(apps) => {
                info!(count = apps.len(), "found Spark applications in YARN");
                apps
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "error fetching YARN applications");
                if let Some(ref counter) = self.errors {
                    counter.inc();
                }
                Vec::new()
            }
        }
    }
}

// --- JSON response structures ---

#[derive(Debug, Deserialize)]
struct AppsApiResponse {
    #[serde(default)]
    apps: Option<AppsBody>,
}

#[derive(Debug, Deserialize)]
struct AppsBody {
    #[serde(default)]
    app: Option<OneOrMany>,
}

/// `app` is an array, or a bare object when exactly one app matches.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<serde_json::Value>),
    One(serde_json::Value),
}

impl AppsApiResponse {
    fn into_summaries(self) -> Vec<AppSummary> {
        let raw = match self.apps.and_then(|body| body.app) {
            Some(OneOrMany::Many(apps)) => apps,
            Some(OneOrMany::One(app)) => vec![app],
            None => Vec::new(),
        };

        raw.into_iter().map(AppSummary::from_value).collect()
    }
}

/// Parse a raw ResourceManager listing body.
pub fn parse_apps_response(body: &str) -> Result<Vec<AppSummary>> {
    let resp: AppsApiResponse =
        serde_json::from_str(body).context("decoding YARN applications response")?;
    Ok(resp.into_summaries())
}
