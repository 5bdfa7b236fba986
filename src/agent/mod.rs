use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregator::Aggregator;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::export::{ErrorSource, Publisher};
use crate::history::{self, DetailResolver};
use crate::yarn::{self, InventoryClient};

/// Agent wires the upstream clients, the aggregator and the metrics server,
/// and drives the periodic scrape loop.
pub struct Agent {
    cfg: Config,
    publisher: Arc<Publisher>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    scrape_loop: Option<JoinHandle<()>>,
    metrics_addr: Option<SocketAddr>,
}

impl Agent {
    /// Creates a new Agent, registering the exporter metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let publisher =
            Arc::new(Publisher::new(&cfg.exporter.addr).context("creating metrics publisher")?);

        Ok(Self {
            cfg,
            publisher,
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
            scrape_loop: None,
            metrics_addr: None,
        })
    }

    /// Replace the wall clock used for job durations.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// Address the metrics server is bound to, once started.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    /// Start the metrics server and the scrape loop.
    pub async fn start(&mut self) -> Result<()> {
        // Serve before the first cycle so probes respond immediately.
        let addr = self
            .publisher
            .start()
            .await
            .context("starting metrics server")?;
        self.metrics_addr = Some(addr);

        let inventory = self.create_yarn_client()?;
        let resolver = self.create_history_client()?;

        info!(
            yarn = %inventory.apps_url(),
            history = ?resolver.candidates(),
            interval = ?self.cfg.scrape_interval,
            "upstream clients configured",
        );

        let aggregator = Arc::new(Aggregator::new(
            inventory,
            resolver,
            Arc::clone(&self.clock),
            Arc::clone(&self.publisher),
        ));

        self.scrape_loop = Some(spawn_scrape_loop(
            aggregator,
            self.cfg.scrape_interval,
            self.cancel.clone(),
        ));

        info!(addr = %addr, "exporter fully started");

        Ok(())
    }

    /// Stop the scrape loop and the metrics server.
    ///
    /// A cycle in flight is abandoned; its partial snapshot is never
    /// published.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(handle) = self.scrape_loop.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "scrape loop terminated abnormally");
            }
        }

        self.publisher.stop().await?;

        Ok(())
    }

    /// Create a ResourceManager client reporting into the publisher.
    fn create_yarn_client(&self) -> Result<yarn::Client> {
        let client = yarn::Client::new(&self.cfg).context("creating YARN client")?;

        Ok(client
            .with_metrics(self.publisher.request_metrics())
            .with_error_counter(self.publisher.error_counter(ErrorSource::Inventory)))
    }

    /// Create a History Server client reporting into the publisher.
    fn create_history_client(&self) -> Result<history::Client> {
        let client = history::Client::new(&self.cfg).context("creating history client")?;

        Ok(client.with_metrics(self.publisher.request_metrics()))
    }
}

/// Spawn the periodic scrape loop.
///
/// The first cycle runs immediately. Cycles never overlap: a slow cycle
/// delays the next tick instead of queueing a burst.
fn spawn_scrape_loop<I, D>(
    aggregator: Arc<Aggregator<I, D>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    I: InventoryClient + 'static,
    D: DetailResolver + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let agg = Arc::clone(&aggregator);
            let mut cycle = tokio::spawn(async move {
                agg.run_cycle().await;
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    cycle.abort();
                    debug!("abandoned in-flight scrape cycle");
                    return;
                }
                res = &mut cycle => {
                    if let Err(e) = res {
                        error!(error = %e, "scrape cycle aborted");
                        aggregator.publisher().record_error(ErrorSource::General);
                    }
                }
            }
        }
    })
}
