//! Polling loop + notification reactor (§4.3, §4.6). One `Processor` per defined job kind: it
//! claims runnable jobs from the repository, stages them in a [`PriorityQueue`] so execution order
//! still respects `(next_run_at, priority)` even when a claim batch pulls in more than one job,
//! and runs each under both the kind's and the scheduler's concurrency semaphores with a
//! lock-lifetime watchdog that never forcibly terminates the handler.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::events::Event;
use crate::job::{ExecutionGuard, Job, JobRecord};
use crate::notify::{JobStateKind, JobStateNotification};
use crate::priority_queue::PriorityQueue;
use crate::scheduler::{JobDefinition, SchedulerInner};

pub struct Processor {
    inner: Arc<SchedulerInner>,
    def: Arc<JobDefinition>,
    queue: AsyncMutex<PriorityQueue>,
}

impl Processor {
    pub fn new(inner: Arc<SchedulerInner>, def: Arc<JobDefinition>) -> Self {
        Self {
            inner,
            def,
            queue: AsyncMutex::new(PriorityQueue::new()),
        }
    }

    pub async fn run(self) {
        let mut notifications = self.inner.notify.subscribe();
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        let subscribed_at = Utc::now();

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    tracing::info!(kind = %self.def.name, "processor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.fill().await {
                        self.inner.events.emit(Event::Error(e.to_string()));
                        tracing::warn!(kind = %self.def.name, error = %e, "claim pass failed");
                    }
                }
                result = notifications.recv() => {
                    match result {
                        Ok(notification) if notification.job_name != self.def.name => continue,
                        Ok(notification) => {
                            if notification.timestamp < subscribed_at {
                                // MUST: ignore notifications older than this subscriber's startup.
                                continue;
                            }
                            if let Err(e) = self.fast_claim(&notification).await {
                                tracing::warn!(kind = %self.def.name, error = %e, "fast-path claim failed");
                            }
                            if let Err(e) = self.fill().await {
                                self.inner.events.emit(Event::Error(e.to_string()));
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }

            if let Err(e) = self.admit().await {
                tracing::warn!(kind = %self.def.name, error = %e, "admission pass failed");
            }
        }
    }

    /// Fast path for a notification naming a specific, already-known job: try to re-lock exactly
    /// that row instead of waiting for the next full scan.
    async fn fast_claim(&self, notification: &crate::notify::JobNotification) -> Result<(), crate::error::JobError> {
        let mut stub = JobRecord::new(&notification.job_name, Value::Null);
        stub.id = notification.job_id;
        stub.next_run_at = notification.next_run_at;

        if let Some(record) = self.inner.repository.lock_job(&stub, Utc::now()).await? {
            self.queue.lock().await.insert(record);
        }
        Ok(())
    }

    /// Claim runnable jobs up to this kind's `lock_limit`, staging them in the persistent queue.
    async fn fill(&self) -> Result<(), crate::error::JobError> {
        let now = Utc::now();
        let lock_deadline = now - self.def.lock_lifetime;

        let already_staged = self.queue.lock().await.len();
        let budget = self.def.lock_limit.saturating_sub(already_staged);

        let mut claimed = 0;
        for _ in 0..budget {
            match self
                .inner
                .repository
                .next_job_to_run(&self.def.name, now, lock_deadline, now, self.inner.config.sort)
                .await?
            {
                Some(job) => {
                    self.queue.lock().await.insert(job);
                    claimed += 1;
                }
                None => break,
            }
        }

        if claimed > 0 {
            self.inner.events.emit(Event::Ready);
        }
        Ok(())
    }

    /// Admit as many staged jobs as there are free slots, respecting both this kind's
    /// concurrency and the scheduler-wide cap.
    async fn admit(&self) -> Result<(), crate::error::JobError> {
        self.queue.lock().await.clear_handled();

        loop {
            let kind_permit = match self.def.concurrency.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => break,
            };
            let global_permit = match self.inner.global_concurrency.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    drop(kind_permit);
                    break;
                }
            };

            let mut queue = self.queue.lock().await;
            let idx = match queue.find_next_runnable(|_name| true) {
                Some(idx) => idx,
                None => {
                    drop(queue);
                    drop(kind_permit);
                    drop(global_permit);
                    break;
                }
            };
            let record = queue.take_at(idx);
            drop(queue);

            if record.disabled {
                let _ = self.inner.repository.unlock_job(record.id).await;
                drop(kind_permit);
                drop(global_permit);
                continue;
            }

            let inner = self.inner.clone();
            let def = self.def.clone();
            tokio::spawn(async move {
                let _permits = (kind_permit, global_permit);
                run_one(inner, def, record).await;
            });
        }
        Ok(())
    }
}

async fn notify_state(
    inner: &Arc<SchedulerInner>,
    kind: JobStateKind,
    record: &JobRecord,
    payload: Option<Value>,
) {
    let notification = JobStateNotification {
        kind,
        job_id: record.id,
        job_name: record.name.clone(),
        timestamp: Utc::now(),
        payload,
    };
    let _ = inner.notify.publish_state(notification).await;
}

enum HandlerOutcome {
    Finished(Result<Result<Value, crate::error::JobError>, tokio::task::JoinError>),
    TimedOut,
}

async fn run_one(inner: Arc<SchedulerInner>, def: Arc<JobDefinition>, record: JobRecord) {
    inner.events.emit(Event::Start(record.clone()));
    notify_state(&inner, JobStateKind::Start, &record, None).await;

    // Recurrence is computed and persisted before the handler runs, so a crash mid-handler never
    // loses the next scheduled occurrence. One-shot jobs are left alone here: nulling their
    // `next_run_at` before the handler runs would make a crash mid-handler permanently
    // unreclaimable (nothing left to match the claim query's due-time branch).
    let mut scheduled = record.clone();
    if scheduled.is_recurring() {
        crate::schedule::recompute_next_run(&mut scheduled, Utc::now(), true);
    }
    scheduled.last_modified_by = Some(inner.config.name.clone());
    if let Err(e) = inner.repository.save_job_state(&scheduled).await {
        tracing::error!(job = %record.name, error = %e, "failed to persist pre-run recurrence");
    }

    let outcome = if def.fork_mode {
        let current_exe = match std::env::current_exe() {
            Ok(p) => p,
            Err(e) => {
                handle_failure(
                    &inner,
                    &def,
                    scheduled,
                    crate::error::JobError::Handler(format!("could not resolve current executable: {e}")),
                )
                .await;
                return;
            }
        };
        let job_id = scheduled.id;
        HandlerOutcome::Finished(Ok(
            crate::fork::run_in_child(&current_exe, job_id).await.map(|_| Value::Null)
        ))
    } else {
        run_with_watchdog(&inner, &def, scheduled.clone()).await
    };

    let mut finished = scheduled.clone();
    finished.last_finished_at = Some(Utc::now());
    finished.locked_at = None;
    finished.last_modified_by = Some(inner.config.name.clone());

    match outcome {
        HandlerOutcome::Finished(Ok(Ok(result))) => {
            finished.fail_reason = None;

            if def.should_save_result {
                match finished.data.as_object_mut() {
                    Some(obj) => {
                        obj.insert("result".to_string(), result);
                    }
                    None => finished.data = serde_json::json!({ "result": result }),
                }
            }

            let remove_on_complete = def.remove_on_complete && !finished.is_recurring();
            if remove_on_complete {
                if let Err(e) = inner.repository.remove_job(finished.id).await {
                    tracing::error!(job = %record.name, error = %e, "failed to remove completed job");
                }
            } else if let Err(e) = inner.repository.save_job(finished.clone()).await {
                tracing::error!(job = %record.name, error = %e, "failed to persist success");
            }

            inner.events.emit(Event::Success(finished.clone()));
            notify_state(&inner, JobStateKind::Success, &finished, None).await;
            inner.events.emit(Event::Complete(finished.clone()));
            notify_state(&inner, JobStateKind::Complete, &finished, None).await;
        }
        HandlerOutcome::Finished(Ok(Err(e))) => handle_failure(&inner, &def, finished, e).await,
        HandlerOutcome::Finished(Err(join_err)) => {
            handle_failure(
                &inner,
                &def,
                finished,
                crate::error::JobError::Handler(format!("handler task panicked: {join_err}")),
            )
            .await
        }
        HandlerOutcome::TimedOut => {
            handle_failure(
                &inner,
                &def,
                finished,
                crate::error::JobError::Timeout(def.lock_lifetime.to_std().unwrap_or(std::time::Duration::from_secs(600))),
            )
            .await
        }
    }
}

/// Run the handler as its own task and race it against a watchdog that cancels a token once the
/// lock lifetime elapses without a `touch()`. The watchdog never aborts the handler task itself —
/// per §5 the engine does not forcibly terminate a running handler; it stops waiting for it and
/// lets the processor move on, while the handler (if it checks the token, e.g. via `touch`) can
/// notice and stop cooperatively.
async fn run_with_watchdog(inner: &Arc<SchedulerInner>, def: &Arc<JobDefinition>, scheduled: JobRecord) -> HandlerOutcome {
    let token = CancellationToken::new();
    let deadline = Arc::new(AsyncMutex::new(Utc::now() + def.lock_lifetime));
    let guard = ExecutionGuard {
        token: token.clone(),
        deadline: deadline.clone(),
        lock_lifetime: def.lock_lifetime,
    };

    let job = Job::new(scheduled, Arc::downgrade(inner)).with_execution_guard(guard);
    let handler = def.handler.clone();
    let mut handler_task = tokio::spawn(handler(job));

    let watchdog_token = token.clone();
    let mut watchdog = tokio::spawn(async move {
        loop {
            let remaining = {
                let dl = *deadline.lock().await;
                (dl - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO)
            };
            if remaining.is_zero() {
                watchdog_token.cancel();
                return;
            }
            tokio::time::sleep(remaining.min(std::time::Duration::from_secs(5))).await;
        }
    });

    let outcome = tokio::select! {
        res = &mut handler_task => {
            watchdog.abort();
            HandlerOutcome::Finished(res)
        }
        _ = token.cancelled() => {
            // The handler task is intentionally left running, detached — we stop waiting on it
            // rather than aborting it.
            HandlerOutcome::TimedOut
        }
    };
    outcome
}

async fn handle_failure(
    inner: &Arc<SchedulerInner>,
    def: &Arc<JobDefinition>,
    mut record: JobRecord,
    error: crate::error::JobError,
) {
    let reason = error.to_string();
    record.fail(reason.clone());

    inner.events.emit(Event::Fail(reason.clone(), record.clone()));
    notify_state(inner, JobStateKind::Fail, &record, Some(Value::String(reason.clone()))).await;

    let retry_delay = if error.retryable() {
        def.backoff
            .as_ref()
            .and_then(|backoff| backoff(record.fail_count, &error, &def.name, &record.data))
    } else {
        None
    };

    match retry_delay {
        Some(delay) => {
            let next_run_at = Utc::now() + delay;
            record.next_run_at = Some(next_run_at);
            if let Err(e) = inner.repository.save_job(record.clone()).await {
                tracing::error!(job = %record.name, error = %e, "failed to persist retry schedule");
            }
            inner.events.emit(Event::Retry {
                job: record.clone(),
                attempt: record.fail_count,
                delay_ms: delay.num_milliseconds(),
                next_run_at,
                error: reason,
            });
            notify_state(inner, JobStateKind::Retry, &record, None).await;
        }
        None => {
            // No backoff configured (or the error isn't retryable, or the strategy gave up): the
            // recurrence already computed before this run (if any) is left untouched so a
            // recurring job keeps ticking even though this occurrence won't be retried.
            if let Err(e) = inner.repository.save_job(record.clone()).await {
                tracing::error!(job = %record.name, error = %e, "failed to persist exhausted retry");
            }
            inner.events.emit(Event::RetryExhausted(reason, record.clone()));
            inner.events.emit(Event::Complete(record.clone()));
            notify_state(inner, JobStateKind::Complete, &record, None).await;
        }
    }
}

