//! Error taxonomy (§7). Retryable vs. terminal failure is determined by `JobError::retryable`,
//! consulted by the processor before it applies a definition's backoff strategy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("no handler defined for job kind {0:?}")]
    NotDefined(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("lock lifetime exceeded with no touch after {0:?}")]
    Timeout(std::time::Duration),

    #[error("repository contention: claim missed")]
    Contention,

    #[error("repository error: {0}")]
    Repository(#[from] sqlx::Error),

    #[error("schedule parse error: {0}")]
    ScheduleParse(String),

    #[error("job record not found: {0}")]
    NotFound(String),

    #[error("job cancelled mid-run: {0}")]
    Cancelled(String),
}

impl JobError {
    /// §7: contention is silently retried, schedule-parse and not-defined are terminal, everything
    /// else is surfaced and left to the definition's backoff policy.
    pub fn retryable(&self) -> bool {
        matches!(self, JobError::Handler(_) | JobError::Timeout(_) | JobError::Repository(_))
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error("definition already registered for kind {0:?}")]
    DuplicateDefinition(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
