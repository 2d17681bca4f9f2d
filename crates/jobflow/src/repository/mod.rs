//! Storage abstraction (§4.1). `JobRepository` is the seam between the engine (scheduler,
//! processor, priority queue) and whatever durable store backs it; [`postgres::PostgresRepository`]
//! is the reference adapter used by the demo worker and the integration tests.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::JobError;
use crate::job::{JobId, JobRecord};

/// Filter used by `query_jobs` / `remove_jobs` / `distinct_job_names`. `None` fields are
/// unconstrained.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub name: Option<String>,
    pub disabled: Option<bool>,
    pub failed_only: bool,
}

/// Tie-break order the claim query applies after filtering to runnable rows (§4.2's `sort`
/// config knob).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimSort {
    #[default]
    NextRunThenPriority,
    PriorityThenNextRun,
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a `Normal` job, or upsert a `Single`/unique-keyed job. Debounce coalescing (§4.5)
    /// is applied here, against the currently stored row for the same `(name, unique_key)`.
    async fn save_job(&self, job: JobRecord) -> Result<JobRecord, JobError>;

    async fn get_job_by_id(&self, id: JobId) -> Result<Option<JobRecord>, JobError>;

    async fn query_jobs(&self, query: &JobQuery) -> Result<Vec<JobRecord>, JobError>;

    /// Returns the number of rows removed.
    async fn remove_jobs(&self, query: &JobQuery) -> Result<u64, JobError>;

    /// Remove a single job by id. Returns `true` if a row was removed.
    async fn remove_job(&self, id: JobId) -> Result<bool, JobError>;

    async fn distinct_job_names(&self) -> Result<Vec<String>, JobError>;

    /// Count of jobs with `next_run_at <= now` and not disabled, not locked — the runnable queue
    /// depth the processor consults before deciding whether to poll again immediately.
    async fn queue_size(&self, name: Option<&str>) -> Result<i64, JobError>;

    /// Conditionally re-lock a specific, already-known record: succeeds only if the stored row
    /// still matches `(id, name, next_run_at, disabled = false)` and is not already locked. Used
    /// for the notification fast path, where a sibling's `save()` already told this processor
    /// exactly which job became runnable and there is no need to re-scan.
    async fn lock_job(&self, record: &JobRecord, now: DateTime<Utc>) -> Result<Option<JobRecord>, JobError>;

    /// Release the lock without touching schedule/outcome fields (used when a job is pulled back
    /// into the in-memory queue without running, e.g. on shutdown).
    async fn unlock_job(&self, id: JobId) -> Result<(), JobError>;

    async fn unlock_jobs(&self, ids: &[JobId]) -> Result<(), JobError>;

    /// Atomically find and claim one runnable job of `name`: either freshly due
    /// (`locked_at IS NULL AND next_run_at <= next_scan_at`) or whose lock has gone stale
    /// (`locked_at <= lock_deadline`) regardless of `next_run_at` — a stale one-shot job whose
    /// `next_run_at` is still whatever it was before the crash must remain reclaimable. Sets
    /// `locked_at = now`. Returns `None` if nothing is runnable.
    async fn next_job_to_run(
        &self,
        name: &str,
        next_scan_at: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
        sort: ClaimSort,
    ) -> Result<Option<JobRecord>, JobError>;

    /// Persist the execution-state fields (`locked_at`, `progress`, fail/recurrence bookkeeping)
    /// for the lock-lifetime watchdog (`Job::touch`) and the processor's pre/post-run writes.
    async fn save_job_state(&self, job: &JobRecord) -> Result<(), JobError>;
}
