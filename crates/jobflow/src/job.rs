//! The on-store job record, its derived state, and the caller-facing `Job` handle.

use std::sync::Arc;
use std::sync::Weak;

use chrono::{DateTime, Utc, Weekday};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::JobError;
use crate::scheduler::SchedulerInner;

pub type JobId = Uuid;

/// `normal` jobs create a new record per call; `single` jobs upsert keyed by `name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    Normal,
    Single,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Normal => "normal",
            JobType::Single => "single",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "single" => JobType::Single,
            _ => JobType::Normal,
        }
    }
}

/// Priority presets named in the spec; any `i32` is a legal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub i32);

impl Priority {
    pub const HIGHEST: Priority = Priority(20);
    pub const HIGH: Priority = Priority(10);
    pub const NORMAL: Priority = Priority(0);
    pub const LOW: Priority = Priority(-10);
    pub const LOWEST: Priority = Priority(-20);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceStrategy {
    Leading,
    Trailing,
}

#[derive(Debug, Clone)]
pub struct DebounceOpts {
    pub delay: chrono::Duration,
    pub max_wait: Option<chrono::Duration>,
    pub strategy: DebounceStrategy,
}

impl DebounceOpts {
    pub fn trailing(delay: chrono::Duration) -> Self {
        Self {
            delay,
            max_wait: None,
            strategy: DebounceStrategy::Trailing,
        }
    }

    pub fn leading(delay: chrono::Duration) -> Self {
        Self {
            delay,
            max_wait: None,
            strategy: DebounceStrategy::Leading,
        }
    }

    pub fn max_wait(mut self, d: chrono::Duration) -> Self {
        self.max_wait = Some(d);
        self
    }
}

/// How a recurring job repeats: a fixed interval or a cron expression. Both carry the raw
/// source string so the repository round-trips it verbatim.
#[derive(Debug, Clone)]
pub enum RepeatInterval {
    Human(String),
    Cron(String),
}

/// Derived (not stored) lifecycle classification of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Scheduled,
    Queued,
    Completed,
    Failed,
    Repeating,
    Idle,
}

/// The on-store attributes. Mirrors the repository's row shape; `sqlx::FromRow` on the Postgres
/// adapter maps directly onto this struct's column names.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub job_type: String,
    pub data: Value,
    pub priority: i32,

    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    pub fail_reason: Option<String>,
    pub fail_count: i32,

    pub locked_at: Option<DateTime<Utc>>,

    pub repeat_interval: Option<String>,
    pub repeat_interval_is_cron: bool,
    pub repeat_timezone: Option<String>,
    pub repeat_at: Option<String>,

    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub skip_days: Vec<i16>,

    pub disabled: bool,

    pub unique_key: Option<Value>,
    pub unique_insert_only: bool,

    pub debounce_delay_ms: Option<i64>,
    pub debounce_max_wait_ms: Option<i64>,
    pub debounce_leading: bool,
    pub debounce_started_at: Option<DateTime<Utc>>,

    pub progress: Option<i32>,
    pub last_modified_by: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            job_type: JobType::Normal.as_str().to_string(),
            data,
            priority: Priority::NORMAL.0,
            next_run_at: None,
            last_run_at: None,
            last_finished_at: None,
            failed_at: None,
            fail_reason: None,
            fail_count: 0,
            locked_at: None,
            repeat_interval: None,
            repeat_interval_is_cron: false,
            repeat_timezone: None,
            repeat_at: None,
            start_date: None,
            end_date: None,
            skip_days: Vec::new(),
            disabled: false,
            unique_key: None,
            unique_insert_only: false,
            debounce_delay_ms: None,
            debounce_max_wait_ms: None,
            debounce_leading: false,
            debounce_started_at: None,
            progress: None,
            last_modified_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this record repeats (interval, cron, or daily time-of-day). One-shot jobs must
    /// never have `recompute_next_run` applied before their handler runs, or a crash mid-handler
    /// would leave `next_run_at` null and unreclaimable.
    pub fn is_recurring(&self) -> bool {
        self.repeat_interval.is_some() || self.repeat_at.is_some()
    }

    pub fn job_type(&self) -> JobType {
        JobType::from_str(&self.job_type)
    }

    pub fn skip_weekdays(&self) -> Vec<Weekday> {
        self.skip_days
            .iter()
            .filter_map(|d| weekday_from_i16(*d))
            .collect()
    }

    pub fn set_skip_weekdays(&mut self, days: &[Weekday]) {
        self.skip_days = days.iter().map(|d| d.num_days_from_monday() as i16).collect();
    }

    pub fn debounce(&self) -> Option<DebounceOpts> {
        let delay_ms = self.debounce_delay_ms?;
        Some(DebounceOpts {
            delay: chrono::Duration::milliseconds(delay_ms),
            max_wait: self.debounce_max_wait_ms.map(chrono::Duration::milliseconds),
            strategy: if self.debounce_leading {
                DebounceStrategy::Leading
            } else {
                DebounceStrategy::Trailing
            },
        })
    }

    pub fn set_debounce(&mut self, opts: &DebounceOpts) {
        self.debounce_delay_ms = Some(opts.delay.num_milliseconds());
        self.debounce_max_wait_ms = opts.max_wait.map(|d| d.num_milliseconds());
        self.debounce_leading = matches!(opts.strategy, DebounceStrategy::Leading);
    }

    /// Derived lifecycle state per §3 of the specification.
    pub fn state(&self) -> JobState {
        let now = Utc::now();

        let running = match (self.last_run_at, self.last_finished_at, self.locked_at) {
            (Some(_), None, _) => true,
            (_, Some(finished), Some(locked)) => locked > finished,
            _ => false,
        };
        if running {
            return JobState::Running;
        }

        if self.fail_reason.is_some() && self.last_finished_at.is_some() {
            return JobState::Failed;
        }

        if let Some(next) = self.next_run_at {
            if self.locked_at.is_none() {
                return if next > now {
                    JobState::Scheduled
                } else {
                    JobState::Queued
                };
            }
        }

        if self.last_finished_at.is_some() && self.fail_reason.is_none() && self.next_run_at.is_none() {
            return JobState::Completed;
        }

        if self.is_recurring() {
            return JobState::Repeating;
        }

        JobState::Idle
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), JobState::Running)
    }

    /// Mark this record failed; monotonic `fail_count`, matching §3 invariants.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.fail_reason = Some(reason.into());
        self.fail_count += 1;
        self.failed_at = Some(Utc::now());
    }
}

fn weekday_from_i16(d: i16) -> Option<Weekday> {
    match d {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}

/// Shared watchdog state a running `Job` and its processor cooperate through: `touch()` pushes
/// the deadline out, the watchdog task cancels `token` once `Utc::now()` passes it without a
/// fresh touch. Only present on a `Job` that's actually executing under a `Processor`.
#[derive(Clone)]
pub(crate) struct ExecutionGuard {
    pub token: CancellationToken,
    pub deadline: Arc<AsyncMutex<DateTime<Utc>>>,
    pub lock_lifetime: chrono::Duration,
}

/// Caller-facing handle: a copy of the stored attributes plus a weak back-reference to the
/// owning scheduler so `save`/`remove`/`touch` can reach the repository without `Job` holding a
/// strong reference (see DESIGN.md on the Job/Scheduler cycle).
#[derive(Clone)]
pub struct Job {
    pub record: JobRecord,
    pub(crate) scheduler: Weak<SchedulerInner>,
    pub(crate) execution: Option<ExecutionGuard>,
}

impl Job {
    pub(crate) fn new(record: JobRecord, scheduler: Weak<SchedulerInner>) -> Self {
        Self {
            record,
            scheduler,
            execution: None,
        }
    }

    pub(crate) fn with_execution_guard(mut self, guard: ExecutionGuard) -> Self {
        self.execution = Some(guard);
        self
    }

    pub fn id(&self) -> JobId {
        self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn is_running(&self) -> bool {
        self.record.is_running()
    }

    pub fn priority(&mut self, p: Priority) -> &mut Self {
        self.record.priority = p.0;
        self
    }

    pub fn schedule(&mut self, when: DateTime<Utc>) -> &mut Self {
        self.record.next_run_at = Some(when);
        self
    }

    pub fn disable(&mut self) -> &mut Self {
        self.record.disabled = true;
        self
    }

    pub fn enable(&mut self) -> &mut Self {
        self.record.disabled = false;
        self
    }

    pub fn repeat_every(&mut self, interval: RepeatInterval) -> &mut Self {
        match interval {
            RepeatInterval::Human(s) => {
                self.record.repeat_interval = Some(s);
                self.record.repeat_interval_is_cron = false;
            }
            RepeatInterval::Cron(s) => {
                self.record.repeat_interval = Some(s);
                self.record.repeat_interval_is_cron = true;
            }
        }
        self
    }

    pub fn repeat_at(&mut self, time_of_day: impl Into<String>) -> &mut Self {
        self.record.repeat_at = Some(time_of_day.into());
        self
    }

    /// IANA timezone the recurrence schedule is evaluated in (§4.2's `timezone` knob).
    pub fn repeat_timezone(&mut self, tz: impl Into<String>) -> &mut Self {
        self.record.repeat_timezone = Some(tz.into());
        self
    }

    /// Recurrence window: no occurrence before `when`.
    pub fn start_date(&mut self, when: DateTime<Utc>) -> &mut Self {
        self.record.start_date = Some(when);
        self
    }

    /// Recurrence window: no occurrence on or after `when`.
    pub fn end_date(&mut self, when: DateTime<Utc>) -> &mut Self {
        self.record.end_date = Some(when);
        self
    }

    /// Weekdays the recurrence schedule skips entirely.
    pub fn skip_weekdays(&mut self, days: &[Weekday]) -> &mut Self {
        self.record.set_skip_weekdays(days);
        self
    }

    pub fn unique(&mut self, key: Value, insert_only: bool) -> &mut Self {
        self.record.unique_key = Some(key);
        self.record.unique_insert_only = insert_only;
        self
    }

    pub fn debounce(&mut self, opts: DebounceOpts) -> &mut Self {
        self.record.set_debounce(&opts);
        self
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> &mut Self {
        self.record.fail(reason);
        self
    }

    fn scheduler(&self) -> Result<Arc<SchedulerInner>, JobError> {
        self.scheduler
            .upgrade()
            .ok_or_else(|| JobError::Cancelled("scheduler dropped".into()))
    }

    pub async fn save(&mut self) -> Result<(), JobError> {
        let scheduler = self.scheduler()?;
        let saved = scheduler.save_job(self.record.clone()).await?;
        self.record = saved;
        Ok(())
    }

    pub async fn remove(&self) -> Result<(), JobError> {
        let scheduler = self.scheduler()?;
        scheduler.remove_job(self.record.id).await
    }

    /// Extend the lock lifetime and report progress. §5: the engine never forcibly terminates a
    /// running handler, but once the watchdog has already declared the job cancelled (lock
    /// lifetime exceeded with no prior touch), any subsequent touch fails so a handler that keeps
    /// running past its deadline finds out on its next cooperative check.
    pub async fn touch(&mut self, progress: Option<i32>) -> Result<(), JobError> {
        if let Some(guard) = &self.execution {
            if guard.token.is_cancelled() {
                return Err(JobError::Cancelled(format!(
                    "{} was cancelled after exceeding its lock lifetime",
                    self.record.name
                )));
            }
        }

        let scheduler = self.scheduler()?;
        let now = Utc::now();
        self.record.locked_at = Some(now);
        self.record.progress = progress;
        scheduler.repository().save_job_state(&self.record).await?;

        if let Some(guard) = &self.execution {
            let mut deadline = guard.deadline.lock().await;
            *deadline = now + guard.lock_lifetime;
        }
        Ok(())
    }
}
