use std::collections::BTreeMap;
use std::fmt;

/// Bytes per MiB, used to report executor memory in MB.
pub const BYTES_PER_MB: f64 = 1_048_576.0;

/// YARN application lifecycle state.
///
/// States outside the YARN vocabulary are preserved verbatim so they still
/// surface as label values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppState {
    New,
    NewSaving,
    Submitted,
    Accepted,
    Running,
    Finished,
    Failed,
    Killed,
    Other(String),
}

impl AppState {
    /// Parse a state string as reported by the ResourceManager.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "NEW" => Self::New,
            "NEW_SAVING" => Self::NewSaving,
            "SUBMITTED" => Self::Submitted,
            "ACCEPTED" => Self::Accepted,
            "RUNNING" => Self::Running,
            "FINISHED" => Self::Finished,
            "FAILED" => Self::Failed,
            "KILLED" => Self::Killed,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "NEW",
            Self::NewSaving => "NEW_SAVING",
            Self::Submitted => "SUBMITTED",
            Self::Accepted => "ACCEPTED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One Spark application as seen by the ResourceManager in this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub user: String,
    pub queue: String,
    pub state: AppState,
    pub allocated_mb: f64,
    pub reserved_mb: f64,
    pub allocated_vcores: f64,
    pub reserved_vcores: f64,
    pub running_containers: f64,
    /// Epoch milliseconds.
    pub started_time: i64,
    /// Epoch milliseconds, 0 while running.
    pub finished_time: i64,
    pub progress: f64,
    pub tracking_url: String,
    pub application_type: String,
    pub final_status: String,
    /// Derived EMR cluster id, see [`crate::identity::extract_group_id`].
    pub group_id: String,
}

impl Job {
    /// Elapsed run time in seconds as of `now_millis`.
    pub fn duration_seconds(&self, now_millis: i64) -> f64 {
        duration_seconds(self.started_time, self.finished_time, now_millis)
    }
}

/// Run time in seconds of an application started at `started_ms`.
///
/// A non-zero `finished_ms` ends the interval, otherwise `now_ms` does.
/// Clock skew between the ResourceManager and this host can make the result
/// negative; it is reported as is.
pub fn duration_seconds(started_ms: i64, finished_ms: i64, now_ms: i64) -> f64 {
    let end = if finished_ms > 0 { finished_ms } else { now_ms };
    end.saturating_sub(started_ms) as f64 / 1000.0
}

/// One Spark executor belonging to a [`Job`].
#[derive(Debug, Clone, PartialEq)]
pub struct Worker {
    /// Id of the owning job.
    pub app_id: String,
    pub executor_id: String,
    pub host: String,
    pub memory_used_mb: f64,
    pub cores: f64,
    pub tasks: f64,
}

/// Detail reported by the Spark history/UI service for a job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDetail {
    pub attempts: usize,
    /// Spark version of the latest attempt, empty when not reported.
    pub spark_version: String,
}

/// Everything the snapshot records about a single job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEntry {
    pub job: Job,
    pub duration_seconds: f64,
    pub detail: Option<JobDetail>,
    pub workers: Vec<Worker>,
}

/// Immutable result of one aggregation cycle.
///
/// Jobs are keyed and iterated by application id, so two snapshots built
/// from the same upstream data compare equal and render identically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    jobs: BTreeMap<String, JobEntry>,
}

impl Snapshot {
    /// A snapshot with no jobs.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobEntry> {
        self.jobs.values()
    }

    pub fn job(&self, app_id: &str) -> Option<&JobEntry> {
        self.jobs.get(app_id)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn worker_count(&self) -> usize {
        self.jobs.values().map(|e| e.workers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Accumulates job entries for one cycle.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    jobs: BTreeMap<String, JobEntry>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job together with its workers.
    ///
    /// Workers whose `app_id` does not match the job are dropped. A second
    /// entry with the same application id replaces the first.
    pub fn insert(&mut self, mut entry: JobEntry) {
        let app_id = entry.job.id.clone();
        entry.workers.retain(|w| w.app_id == app_id);
        self.jobs.insert(app_id, entry);
    }

    pub fn build(self) -> Snapshot {
        Snapshot { jobs: self.jobs }
    }
}
