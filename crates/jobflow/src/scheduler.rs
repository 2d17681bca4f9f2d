//! The public engine handle (§4.2, §4.3). `Scheduler` is the library's front door: register
//! handlers with `define`, enqueue work with `now`/`schedule`/`every`, and drive it with
//! `start`/`stop`/`drain`. Internally it's a thin `Arc<SchedulerInner>` so `Job` can hold a `Weak`
//! back-reference without creating a reference cycle (see DESIGN.md).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc, Weekday};
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffFn;
use crate::error::{JobError, SchedulerError};
use crate::events::{Event, EventBus};
use crate::job::{DebounceOpts, Job, JobId, JobRecord, JobType, Priority, RepeatInterval};
use crate::notify::{JobNotification, NotificationChannel};
use crate::processor::Processor;
use crate::repository::{ClaimSort, JobQuery, JobRepository};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, JobError>> + Send>>;
pub type HandlerFn = dyn Fn(Job) -> HandlerFuture + Send + Sync;

/// A registered job kind: its handler plus the execution policy the processor enforces.
pub struct JobDefinition {
    pub name: String,
    pub handler: Arc<HandlerFn>,
    pub concurrency: Arc<Semaphore>,
    pub lock_limit: usize,
    pub lock_lifetime: chrono::Duration,
    pub default_priority: Priority,
    pub should_save_result: bool,
    pub remove_on_complete: bool,
    pub backoff: Option<Arc<BackoffFn>>,
    pub fork_mode: bool,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub default_lock_lifetime: chrono::Duration,
    pub default_concurrency: usize,
    /// Process-wide cap on concurrently running handlers, across every defined kind.
    pub max_concurrency: usize,
    /// Default cap on jobs a single processor may hold claimed-but-not-yet-started at once.
    pub default_lock_limit: usize,
    pub poll_interval: std::time::Duration,
    pub sort: ClaimSort,
    /// Identifies this process in `last_modified_by`, for diagnosing who last touched a row.
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_lock_lifetime: chrono::Duration::minutes(10),
            default_concurrency: 5,
            max_concurrency: 20,
            default_lock_limit: 16,
            poll_interval: std::time::Duration::from_millis(5_000),
            sort: ClaimSort::NextRunThenPriority,
            name: "jobflow-worker".to_string(),
        }
    }
}

/// Options passed to `define`, mirroring the per-kind knobs named in §4.2's config table.
#[derive(Clone, Default)]
pub struct DefineOptions {
    pub concurrency: Option<usize>,
    pub lock_limit: Option<usize>,
    pub lock_lifetime: Option<chrono::Duration>,
    pub priority: Option<Priority>,
    /// Persist the handler's returned `Value` into the job's `data.result` on success.
    pub should_save_result: bool,
    /// Delete the row outright on a successful terminal (non-recurring) completion.
    pub remove_on_complete: bool,
    /// Opt-in retry strategy: `(attempt, error, name, data) -> Some(delay)` to retry, `None` to
    /// stop. A definition with no backoff configured never retries, regardless of error kind.
    pub backoff: Option<Arc<BackoffFn>>,
    /// Run this kind's handler in a forked child process instead of an in-process task.
    pub fork_mode: bool,
}

impl std::fmt::Debug for DefineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefineOptions")
            .field("concurrency", &self.concurrency)
            .field("lock_limit", &self.lock_limit)
            .field("lock_lifetime", &self.lock_lifetime)
            .field("priority", &self.priority)
            .field("should_save_result", &self.should_save_result)
            .field("remove_on_complete", &self.remove_on_complete)
            .field("backoff", &self.backoff.is_some())
            .field("fork_mode", &self.fork_mode)
            .finish()
    }
}

/// Options for `every()`'s recurrence window (§4.2).
#[derive(Debug, Clone, Default)]
pub struct EveryOptions {
    pub timezone: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub skip_weekdays: Vec<Weekday>,
}

pub struct SchedulerInner {
    pub(crate) repository: Arc<dyn JobRepository>,
    pub(crate) notify: Arc<dyn NotificationChannel>,
    pub(crate) events: EventBus,
    pub(crate) definitions: RwLock<HashMap<String, Arc<JobDefinition>>>,
    pub(crate) config: SchedulerConfig,
    pub(crate) global_concurrency: Arc<Semaphore>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SchedulerInner {
    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    pub async fn save_job(&self, job: JobRecord) -> Result<JobRecord, JobError> {
        let saved = self.repository.save_job(job).await?;
        let notification = JobNotification {
            job_id: saved.id,
            job_name: saved.name.clone(),
            next_run_at: saved.next_run_at,
            priority: saved.priority,
            timestamp: Utc::now(),
            source: Some(self.config.name.clone()),
        };
        let _ = self.notify.publish(notification).await;
        Ok(saved)
    }

    pub async fn remove_job(&self, id: JobId) -> Result<(), JobError> {
        self.repository.remove_job(id).await?;
        Ok(())
    }
}

/// Handle returned to library callers.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        notify: Arc<dyn NotificationChannel>,
        config: SchedulerConfig,
    ) -> Self {
        let global_concurrency = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let inner = Arc::new(SchedulerInner {
            repository,
            notify,
            events: EventBus::new(),
            definitions: RwLock::new(HashMap::new()),
            config,
            global_concurrency,
            shutdown: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        });
        Self { inner }
    }

    pub(crate) fn weak(&self) -> std::sync::Weak<SchedulerInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        self.inner.repository()
    }

    /// Register a handler for a job kind. Calling `define` twice for the same name is an error
    /// (§4.2: definitions are fixed at startup, not hot-swappable).
    pub async fn define<F, Fut>(
        &self,
        name: impl Into<String>,
        options: DefineOptions,
        handler: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        let name = name.into();
        let mut defs = self.inner.definitions.write().await;
        if defs.contains_key(&name) {
            return Err(SchedulerError::DuplicateDefinition(name));
        }

        let concurrency = options.concurrency.unwrap_or(self.inner.config.default_concurrency);
        let definition = JobDefinition {
            name: name.clone(),
            handler: Arc::new(move |job| Box::pin(handler(job))),
            concurrency: Arc::new(Semaphore::new(concurrency.max(1))),
            lock_limit: options.lock_limit.unwrap_or(self.inner.config.default_lock_limit),
            lock_lifetime: options.lock_lifetime.unwrap_or(self.inner.config.default_lock_lifetime),
            default_priority: options.priority.unwrap_or_default(),
            should_save_result: options.should_save_result,
            remove_on_complete: options.remove_on_complete,
            backoff: options.backoff,
            fork_mode: options.fork_mode,
        };
        defs.insert(name, Arc::new(definition));
        Ok(())
    }

    pub async fn definition_names(&self) -> Vec<String> {
        self.inner.definitions.read().await.keys().cloned().collect()
    }

    /// Look up a registered definition by kind. Used by the fork-mode child process entry point
    /// to find the handler for a job it was re-exec'd to run.
    pub async fn definition(&self, name: &str) -> Option<Arc<JobDefinition>> {
        self.inner.definitions.read().await.get(name).cloned()
    }

    /// Build an unsaved `Job` handle of the given kind, ready for the caller to configure and
    /// `save()`.
    pub fn create(&self, name: impl Into<String>, data: Value) -> Job {
        Job::new(JobRecord::new(name, data), self.weak())
    }

    /// Enqueue a one-off job to run as soon as possible.
    pub async fn now(&self, name: impl Into<String>, data: Value) -> Result<Job, JobError> {
        let mut job = self.create(name, data);
        job.record.next_run_at = Some(Utc::now());
        job.save().await?;
        Ok(job)
    }

    /// Enqueue a job for a specific time.
    pub async fn schedule(
        &self,
        when: DateTime<Utc>,
        name: impl Into<String>,
        data: Value,
    ) -> Result<Job, JobError> {
        let mut job = self.create(name, data);
        job.record.next_run_at = Some(when);
        job.save().await?;
        Ok(job)
    }

    /// Define (or redefine) a recurring `Single` job (§4.5 "every").
    pub async fn every(
        &self,
        interval: RepeatInterval,
        name: impl Into<String>,
        data: Value,
        options: EveryOptions,
    ) -> Result<Job, JobError> {
        let mut job = self.create(name, data);
        job.record.job_type = JobType::Single.as_str().to_string();
        job.repeat_every(interval);

        if let Some(tz) = options.timezone {
            job.repeat_timezone(tz);
        }
        if let Some(start) = options.start_date {
            job.start_date(start);
        }
        if let Some(end) = options.end_date {
            job.end_date(end);
        }
        if !options.skip_weekdays.is_empty() {
            job.skip_weekdays(&options.skip_weekdays);
        }

        crate::schedule::recompute_next_run(&mut job.record, Utc::now(), false);
        job.save().await?;
        Ok(job)
    }

    /// Unique + debounced enqueue: repeated calls within `opts.delay` collapse into one run
    /// (§4.5).
    pub async fn now_debounced(
        &self,
        name: impl Into<String>,
        data: Value,
        unique_key: Value,
        opts: DebounceOpts,
    ) -> Result<Job, JobError> {
        let mut job = self.create(name, data);
        job.unique(unique_key, false);
        job.debounce(opts);
        job.save().await?;
        Ok(job)
    }

    pub async fn cancel(&self, query: &JobQuery) -> Result<u64, JobError> {
        self.inner.repository.remove_jobs(query).await
    }

    pub async fn purge(&self) -> Result<u64, JobError> {
        self.inner
            .repository
            .remove_jobs(&JobQuery {
                name: None,
                disabled: None,
                failed_only: false,
            })
            .await
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, JobError> {
        self.inner.repository.get_job_by_id(id).await
    }

    pub async fn jobs(&self, query: &JobQuery) -> Result<Vec<JobRecord>, JobError> {
        self.inner.repository.query_jobs(query).await
    }

    async fn set_disabled(&self, name: &str, disabled: bool) -> Result<(), JobError> {
        let jobs = self
            .inner
            .repository
            .query_jobs(&JobQuery {
                name: Some(name.to_string()),
                disabled: None,
                failed_only: false,
            })
            .await?;
        for mut job in jobs {
            job.disabled = disabled;
            self.inner.repository.save_job(job).await?;
        }
        Ok(())
    }

    pub async fn enable(&self, name: &str) -> Result<(), JobError> {
        self.set_disabled(name, false).await
    }

    pub async fn disable(&self, name: &str) -> Result<(), JobError> {
        self.set_disabled(name, true).await
    }

    /// Register an event handler (§4.7). `event` is e.g. `"success"`, `"fail"`, `"retry"`;
    /// `job_name` narrows to a single kind (`event:<name>` in the original terminology).
    pub fn on<F>(&self, event: &str, job_name: Option<&str>, handler: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.inner.events.on(event, job_name, handler)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Start one processor loop per defined job kind.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let defs: Vec<Arc<JobDefinition>> = self.inner.definitions.read().await.values().cloned().collect();
        if defs.is_empty() {
            return Err(SchedulerError::Config("start() called with no definitions registered".into()));
        }

        let mut tasks = self.inner.tasks.lock().await;
        for def in defs {
            let processor = Processor::new(self.inner.clone(), def);
            tasks.push(tokio::spawn(async move { processor.run().await }));
        }
        Ok(())
    }

    /// Signal all processor loops to stop after their current in-flight jobs finish.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.drain().await;
    }

    /// Wait for all processor loops to exit.
    pub async fn drain(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}
