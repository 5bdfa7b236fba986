pub mod collector;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::snapshot::Snapshot;

use self::collector::SnapshotCollector;

/// Callback type for recording upstream request metrics.
/// Receives (upstream, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Category of an absorbed failure, used as the `source` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// Listing applications from the ResourceManager failed.
    Inventory,
    /// A single application record could not be processed.
    Processing,
    /// A whole cycle failed unexpectedly.
    General,
}

impl ErrorSource {
    pub const ALL: [ErrorSource; 3] = [Self::Inventory, Self::Processing, Self::General];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inventory => "inventory",
            Self::Processing => "processing",
            Self::General => "general",
        }
    }
}

/// Publishes the current snapshot and the exporter's own counters.
///
/// Owns the process-wide state shared between the cycle loop and the
/// exposition server: the current [`Snapshot`] behind an [`ArcSwap`] and
/// the cumulative counters. Both live from process start to exit.
pub struct Publisher {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    current: Arc<ArcSwap<Snapshot>>,

    /// Absorbed failures by source.
    pub scrape_errors: CounterVec,
    /// Applications processed successfully, across all cycles.
    pub apps_scraped: Counter,
    /// Upstream HTTP requests by upstream and status.
    pub upstream_requests_total: CounterVec,
    /// Upstream HTTP request duration by upstream.
    pub upstream_request_duration: HistogramVec,
    /// Wall time of a full scrape cycle.
    pub cycle_duration: Histogram,
    /// Completed scrape cycles.
    pub cycles_total: Counter,
    /// Unix time the last snapshot was published.
    pub last_cycle_timestamp: Gauge,
    /// Applications in the current snapshot.
    pub applications: Gauge,
}

impl Publisher {
    /// Creates the registry and metrics. `addr` is the listen address used
    /// by [`Publisher::start`].
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();
        let current = Arc::new(ArcSwap::from_pointee(Snapshot::empty()));

        let scrape_errors = CounterVec::new(
            Opts::new("scrape_errors_total", "Total number of scrape errors.")
                .namespace("spark_exporter"),
            &["source"],
        )?;
        let apps_scraped = Counter::with_opts(
            Opts::new(
                "apps_scraped_total",
                "Total number of applications scraped.",
            )
            .namespace("spark_exporter"),
        )?;
        let upstream_requests_total = CounterVec::new(
            Opts::new(
                "upstream_requests_total",
                "Total upstream API requests by upstream and status.",
            )
            .namespace("spark_exporter"),
            &["upstream", "status"],
        )?;
        let upstream_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "upstream_request_duration_seconds",
                "Upstream API request duration by upstream.",
            )
            .namespace("spark_exporter")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["upstream"],
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cycle_duration_seconds",
                "Time to run one scrape cycle.",
            )
            .namespace("spark_exporter")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let cycles_total = Counter::with_opts(
            Opts::new("cycles_total", "Total completed scrape cycles.")
                .namespace("spark_exporter"),
        )?;
        let last_cycle_timestamp = Gauge::with_opts(
            Opts::new(
                "last_cycle_timestamp_seconds",
                "Unix time of the last published snapshot.",
            )
            .namespace("spark_exporter"),
        )?;
        let applications = Gauge::with_opts(
            Opts::new(
                "applications",
                "Number of applications in the current snapshot.",
            )
            .namespace("spark_exporter"),
        )?;

        // Expose every error source from the start, even at zero.
        for source in ErrorSource::ALL {
            scrape_errors.with_label_values(&[source.as_str()]);
        }

        registry.register(Box::new(scrape_errors.clone()))?;
        registry.register(Box::new(apps_scraped.clone()))?;
        registry.register(Box::new(upstream_requests_total.clone()))?;
        registry.register(Box::new(upstream_request_duration.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(last_cycle_timestamp.clone()))?;
        registry.register(Box::new(applications.clone()))?;
        registry.register(Box::new(
            SnapshotCollector::new(Arc::clone(&current)).context("creating snapshot collector")?,
        ))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            current,
            scrape_errors,
            apps_scraped,
            upstream_requests_total,
            upstream_request_duration,
            cycle_duration,
            cycles_total,
            last_cycle_timestamp,
            applications,
        })
    }

    /// Replace the current snapshot. Readers see either the old or the new
    /// snapshot in full, never a mix.
    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.applications.set(snapshot.job_count() as f64);
        self.last_cycle_timestamp
            .set(chrono::Utc::now().timestamp_millis() as f64 / 1000.0);
        self.current.store(Arc::clone(&snapshot));
        snapshot
    }

    /// The snapshot currently being served.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Counter handle for one error source.
    pub fn error_counter(&self, source: ErrorSource) -> Counter {
        self.scrape_errors.with_label_values(&[source.as_str()])
    }

    pub fn record_error(&self, source: ErrorSource) {
        self.error_counter(source).inc();
    }

    /// Current value of the error counter for `source`.
    pub fn error_count(&self, source: ErrorSource) -> f64 {
        self.error_counter(source).get()
    }

    /// Build a callback feeding the upstream request metrics.
    pub fn request_metrics(self: &Arc<Self>) -> MetricsCallback {
        let publisher = Arc::clone(self);
        Box::new(move |upstream, status, duration| {
            publisher
                .upstream_requests_total
                .with_label_values(&[upstream, status])
                .inc();
            publisher
                .upstream_request_duration
                .with_label_values(&[upstream])
                .observe(duration.as_secs_f64());
        })
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// binding port 0.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":8080"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::snapshot::tests::{job, worker};
    use crate::snapshot::{JobEntry, SnapshotBuilder};

    fn one_job_snapshot(id: &str) -> Snapshot {
        let mut builder = SnapshotBuilder::new();
        builder.insert(JobEntry {
            job: job(id),
            duration_seconds: 3.0,
            detail: None,
            workers: vec![worker(id, "1")],
        });
        builder.build()
    }

    #[test]
    fn test_error_source_labels() {
        assert_eq!(ErrorSource::Inventory.as_str(), "inventory");
        assert_eq!(ErrorSource::Processing.as_str(), "processing");
        assert_eq!(ErrorSource::General.as_str(), "general");
    }

    #[test]
    fn test_error_counters_start_at_zero_and_render() {
        let publisher = Publisher::new(":0").expect("publisher");
        let text = publisher.render().expect("render");

        for source in ErrorSource::ALL {
            assert_eq!(publisher.error_count(source), 0.0);
            assert!(text.contains(&format!(
                "spark_exporter_scrape_errors_total{{source=\"{}\"}} 0",
                source.as_str()
            )));
        }

        publisher.record_error(ErrorSource::Processing);
        publisher.record_error(ErrorSource::Processing);
        assert_eq!(publisher.error_count(ErrorSource::Processing), 2.0);
        assert_eq!(publisher.error_count(ErrorSource::General), 0.0);
    }

    #[test]
    fn test_publish_swaps_current_snapshot() {
        let publisher = Publisher::new(":0").expect("publisher");
        assert!(publisher.current().is_empty());

        let held = publisher.current();
        publisher.publish(one_job_snapshot("a"));

        // A reader holding the previous snapshot keeps a consistent view.
        assert!(held.is_empty());
        assert_eq!(publisher.current().job_count(), 1);
        assert_eq!(publisher.applications.get(), 1.0);
        assert!(publisher.last_cycle_timestamp.get() > 0.0);

        publisher.publish(one_job_snapshot("b"));
        let current = publisher.current();
        assert!(current.job("a").is_none());
        assert!(current.job("b").is_some());
    }

    #[test]
    fn test_request_metrics_callback() {
        let publisher = Arc::new(Publisher::new(":0").expect("publisher"));
        let cb = publisher.request_metrics();

        cb("yarn", "success", Duration::from_millis(20));
        cb("yarn", "success", Duration::from_millis(30));
        cb("history", "timeout", Duration::from_secs(5));

        assert_eq!(
            publisher
                .upstream_requests_total
                .with_label_values(&["yarn", "success"])
                .get(),
            2.0
        );
        assert_eq!(
            publisher
                .upstream_request_duration
                .with_label_values(&["history"])
                .get_sample_count(),
            1
        );
    }

    #[tokio::test]
    async fn test_server_serves_metrics_and_healthz() {
        let publisher = Publisher::new("127.0.0.1:0").expect("publisher");
        publisher.publish(one_job_snapshot("application_1_0001"));
        publisher.apps_scraped.inc();

        let addr = publisher.start().await.expect("server starts");

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .expect("metrics request")
            .text()
            .await
            .expect("metrics body");
        assert!(body.contains("spark_exporter_apps_scraped_total 1"));
        assert!(body.contains("spark_application_memory_used_mb{"));
        assert!(body.contains("app_id=\"application_1_0001\""));
        assert!(body.contains("spark_executor_tasks_total{"));

        let health = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .expect("healthz request")
            .text()
            .await
            .expect("healthz body");
        assert_eq!(health, "ok");

        publisher.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_start_rejects_bad_address() {
        let publisher = Publisher::new("not-an-address").expect("publisher");
        let err = publisher.start().await.expect_err("bind fails");
        assert!(err.to_string().contains("listening on not-an-address"));
    }
}
