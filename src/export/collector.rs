use std::sync::Arc;

use arc_swap::ArcSwap;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, Opts};

use crate::snapshot::{JobEntry, Snapshot};

const JOB_LABELS: &[&str] = &["cluster_id", "app_id", "app_name", "user", "queue"];

const JOB_STATE_LABELS: &[&str] = &["cluster_id", "app_id", "app_name", "user", "queue", "state"];

const JOB_INFO_LABELS: &[&str] = &[
    "cluster_id",
    "app_id",
    "app_name",
    "user",
    "queue",
    "state",
    "started_time",
    "tracking_url",
    "application_type",
    "final_status",
    "spark_version",
];

const EXECUTOR_LABELS: &[&str] = &["cluster_id", "app_id", "executor_id", "host"];

/// Per-application and per-executor gauge families.
struct Families {
    info: GaugeVec,
    memory_used: GaugeVec,
    memory_reserved: GaugeVec,
    vcores_used: GaugeVec,
    vcores_reserved: GaugeVec,
    containers: GaugeVec,
    duration: GaugeVec,
    progress: GaugeVec,
    attempts: GaugeVec,
    executor_memory: GaugeVec,
    executor_cores: GaugeVec,
    executor_tasks: GaugeVec,
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> prometheus::Result<GaugeVec> {
    GaugeVec::new(Opts::new(name, help), labels)
}

impl Families {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            info: gauge_vec(
                "spark_application_info",
                "Spark application information.",
                JOB_INFO_LABELS,
            )?,
            memory_used: gauge_vec(
                "spark_application_memory_used_mb",
                "Memory used by Spark application in MB.",
                JOB_LABELS,
            )?,
            memory_reserved: gauge_vec(
                "spark_application_memory_reserved_mb",
                "Memory reserved by Spark application in MB.",
                JOB_LABELS,
            )?,
            vcores_used: gauge_vec(
                "spark_application_vcores_used",
                "vCores used by Spark application.",
                JOB_LABELS,
            )?,
            vcores_reserved: gauge_vec(
                "spark_application_vcores_reserved",
                "vCores reserved by Spark application.",
                JOB_LABELS,
            )?,
            containers: gauge_vec(
                "spark_application_containers_total",
                "Total containers used by Spark application.",
                JOB_LABELS,
            )?,
            duration: gauge_vec(
                "spark_application_duration_seconds",
                "Duration of Spark application in seconds.",
                JOB_STATE_LABELS,
            )?,
            progress: gauge_vec(
                "spark_application_progress_percent",
                "Progress of Spark application in percent.",
                JOB_LABELS,
            )?,
            attempts: gauge_vec(
                "spark_application_attempts",
                "Attempts reported by the Spark REST API.",
                JOB_LABELS,
            )?,
            executor_memory: gauge_vec(
                "spark_executor_memory_used_mb",
                "Memory used by Spark executor in MB.",
                EXECUTOR_LABELS,
            )?,
            executor_cores: gauge_vec(
                "spark_executor_cores_total",
                "Total cores allocated to Spark executor.",
                EXECUTOR_LABELS,
            )?,
            executor_tasks: gauge_vec(
                "spark_executor_tasks_total",
                "Total tasks completed by Spark executor.",
                EXECUTOR_LABELS,
            )?,
        })
    }

    fn all(&self) -> [&GaugeVec; 12] {
        [
            &self.info,
            &self.memory_used,
            &self.memory_reserved,
            &self.vcores_used,
            &self.vcores_reserved,
            &self.containers,
            &self.duration,
            &self.progress,
            &self.attempts,
            &self.executor_memory,
            &self.executor_cores,
            &self.executor_tasks,
        ]
    }

    fn record(&self, entry: &JobEntry) {
        let job = &entry.job;
        let labels = [
            job.group_id.as_str(),
            job.id.as_str(),
            job.name.as_str(),
            job.user.as_str(),
            job.queue.as_str(),
        ];
        let state = job.state.as_str();

        self.memory_used
            .with_label_values(&labels)
            .set(job.allocated_mb);
        self.memory_reserved
            .with_label_values(&labels)
            .set(job.reserved_mb);
        self.vcores_used
            .with_label_values(&labels)
            .set(job.allocated_vcores);
        self.vcores_reserved
            .with_label_values(&labels)
            .set(job.reserved_vcores);
        self.containers
            .with_label_values(&labels)
            .set(job.running_containers);
        self.progress.with_label_values(&labels).set(job.progress);

        let [cluster_id, app_id, app_name, user, queue] = labels;
        self.duration
            .with_label_values(&[cluster_id, app_id, app_name, user, queue, state])
            .set(entry.duration_seconds);

        let started_time = job.started_time.to_string();
        let spark_version = entry
            .detail
            .as_ref()
            .map(|d| d.spark_version.as_str())
            .unwrap_or_default();
        self.info
            .with_label_values(&[
                cluster_id,
                app_id,
                app_name,
                user,
                queue,
                state,
                started_time.as_str(),
                job.tracking_url.as_str(),
                job.application_type.as_str(),
                job.final_status.as_str(),
                spark_version,
            ])
            .set(1.0);

        if let Some(detail) = &entry.detail {
            self.attempts
                .with_label_values(&labels)
                .set(detail.attempts as f64);
        }

        for worker in &entry.workers {
            let labels = [
                cluster_id,
                worker.app_id.as_str(),
                worker.executor_id.as_str(),
                worker.host.as_str(),
            ];
            self.executor_memory
                .with_label_values(&labels)
                .set(worker.memory_used_mb);
            self.executor_cores
                .with_label_values(&labels)
                .set(worker.cores);
            self.executor_tasks
                .with_label_values(&labels)
                .set(worker.tasks);
        }
    }
}

/// Prometheus collector rendering the current [`Snapshot`].
///
/// Series are rebuilt from a single loaded snapshot on every gather, so a
/// scrape never mixes values from two cycles and series of applications
/// that disappeared are gone with the snapshot that held them.
pub struct SnapshotCollector {
    current: Arc<ArcSwap<Snapshot>>,
    // Only used for descriptors.
    template: Families,
}

impl SnapshotCollector {
    pub fn new(current: Arc<ArcSwap<Snapshot>>) -> prometheus::Result<Self> {
        Ok(Self {
            current,
            template: Families::new()?,
        })
    }
}

impl Collector for SnapshotCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.template
            .all()
            .into_iter()
            .flat_map(|family| family.desc())
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let snapshot = self.current.load();

        let families = match Families::new() {
            Ok(families) => families,
            Err(e) => {
                tracing::error!(error = %e, "building snapshot metric families");
                return Vec::new();
            }
        };

        for entry in snapshot.jobs() {
            families.record(entry);
        }

        families
            .all()
            .into_iter()
            .flat_map(|family| family.collect())
            .collect()
    }
}
