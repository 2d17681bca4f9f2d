pub mod backoff;
pub mod coalesce;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod fork;
pub mod job;
pub mod notify;
pub mod priority_queue;
pub mod processor;
pub mod repository;
pub mod schedule;
pub mod scheduler;

pub use backoff::{exponential, BackoffFn};
pub use error::{JobError, SchedulerError};
pub use events::{Event, EventBus};
pub use job::{DebounceOpts, DebounceStrategy, Job, JobId, JobRecord, JobState, JobType, Priority, RepeatInterval};
pub use notify::{JobNotification, JobStateKind, JobStateNotification, NotificationChannel};
pub use repository::{ClaimSort, JobQuery, JobRepository};
pub use scheduler::{DefineOptions, EveryOptions, JobDefinition, Scheduler, SchedulerConfig};
