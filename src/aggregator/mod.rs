use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::export::{ErrorSource, Publisher};
use crate::history::{DetailResolver, ExecutorRecord};
use crate::identity;
use crate::snapshot::{
    AppState, Job, JobDetail, JobEntry, Snapshot, SnapshotBuilder, Worker, BYTES_PER_MB,
};
use crate::yarn::{AppSummary, InventoryClient};

/// Whether a cycle is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Running,
}

/// Builds one snapshot per cycle from the inventory and detail sources and
/// hands it to the [`Publisher`].
///
/// A cycle never fails as a whole. Per-job failures skip the job; failures
/// of the cycle itself leave the previous snapshot in place.
pub struct Aggregator<I, D> {
    inventory: I,
    resolver: D,
    clock: Arc<dyn Clock>,
    publisher: Arc<Publisher>,
    running: AtomicBool,
}

/// Marks the aggregator running until dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<I: InventoryClient, D: DetailResolver> Aggregator<I, D> {
    pub fn new(inventory: I, resolver: D, clock: Arc<dyn Clock>, publisher: Arc<Publisher>) -> Self {
        Self {
            inventory,
            resolver,
            clock,
            publisher,
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> CycleState {
        if self.running.load(Ordering::SeqCst) {
            CycleState::Running
        } else {
            CycleState::Idle
        }
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// Run one scrape cycle and publish its snapshot.
    ///
    /// Returns the snapshot current after the cycle: the new one, or the
    /// previous one if the cycle failed.
    pub async fn run_cycle(&self) -> Arc<Snapshot> {
        let _running = RunningGuard::enter(&self.running);
        let start = Instant::now();

        match self.build_snapshot().await {
            Ok(snapshot) => {
                let snapshot = self.publisher.publish(snapshot);
                // One per distinct application in the published snapshot.
                self.publisher
                    .apps_scraped
                    .inc_by(snapshot.job_count() as f64);
                self.publisher.cycles_total.inc();
                self.publisher
                    .cycle_duration
                    .observe(start.elapsed().as_secs_f64());

                info!(
                    applications = snapshot.job_count(),
                    executors = snapshot.worker_count(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "updated metrics",
                );

                snapshot
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "scrape cycle failed");
                self.publisher.record_error(ErrorSource::General);
                self.publisher.current()
            }
        }
    }

    /// Build the next snapshot from the applications processed successfully.
    async fn build_snapshot(&self) -> Result<Snapshot> {
        let apps = self.inventory.list_active_jobs().await;

        let now = self.clock.now_millis();
        if now <= 0 {
            bail!("clock reports {now} ms since the Unix epoch");
        }

        let mut builder = SnapshotBuilder::new();

        for app in &apps {
            match self.process_job(app, now).await {
                Ok(entry) => builder.insert(entry),
                Err(e) => {
                    error!(
                        app_id = app.id(),
                        error = %format!("{e:#}"),
                        "error processing application",
                    );
                    self.publisher.record_error(ErrorSource::Processing);
                }
            }
        }

        Ok(builder.build())
    }

    async fn process_job(&self, app: &AppSummary, now: i64) -> Result<JobEntry> {
        let rec = app.decode()?;

        let id = rec
            .id
            .filter(|id| !id.is_empty())
            .context("application record has no id")?;
        let name = rec.name.unwrap_or_default();
        let tracking_url = rec.tracking_url.unwrap_or_default();
        let group_id = identity::extract_group_id(&name, &tracking_url);

        let job = Job {
            id,
            name,
            user: rec.user.unwrap_or_default(),
            queue: rec.queue.unwrap_or_default(),
            state: AppState::parse(rec.state.as_deref().unwrap_or_default()),
            allocated_mb: rec.allocated_mb.unwrap_or_default(),
            reserved_mb: rec.reserved_mb.unwrap_or_default(),
            allocated_vcores: rec.allocated_vcores.unwrap_or_default(),
            reserved_vcores: rec.reserved_vcores.unwrap_or_default(),
            running_containers: rec.running_containers.unwrap_or_default(),
            started_time: rec.started_time.unwrap_or_default(),
            finished_time: rec.finished_time.unwrap_or_default(),
            progress: rec.progress.unwrap_or_default(),
            tracking_url,
            application_type: rec.application_type.unwrap_or_default(),
            final_status: rec.final_status.unwrap_or_default(),
            group_id,
        };
        let duration_seconds = job.duration_seconds(now);

        let detail = self
            .resolver
            .get_detail(&job.id)
            .await
            .map(|detail| JobDetail {
                attempts: detail.attempts.len(),
                spark_version: detail.spark_version().unwrap_or_default().to_string(),
            });

        let workers = self
            .resolver
            .get_workers(&job.id)
            .await
            .iter()
            .map(|executor| to_worker(&job.id, executor))
            .collect::<Result<Vec<Worker>>>()?;

        debug!(
            app_id = %job.id,
            cluster_id = %job.group_id,
            executors = workers.len(),
            has_detail = detail.is_some(),
            "processed application",
        );

        Ok(JobEntry {
            job,
            duration_seconds,
            detail,
            workers,
        })
    }
}

/// Decode an executor record, defaulting missing numbers to zero.
fn to_worker(app_id: &str, record: &ExecutorRecord) -> Result<Worker> {
    let executor = record.decode()?;

    Ok(Worker {
        app_id: app_id.to_string(),
        executor_id: executor.id.clone().unwrap_or_default(),
        host: executor.host().to_string(),
        memory_used_mb: executor.memory_used.unwrap_or_default() / BYTES_PER_MB,
        cores: executor.total_cores.unwrap_or_default(),
        tasks: executor.total_tasks.unwrap_or_default(),
    })
}
