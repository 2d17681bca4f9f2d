//! Event fanout (§4.7): a typed pub-sub. Each variant carries the job kind name so subscribers
//! registered with `on(name, handler)` can filter to `event:<name>` without a second channel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::job::JobRecord;

#[derive(Debug, Clone)]
pub enum Event {
    Ready,
    Error(String),
    Start(JobRecord),
    Success(JobRecord),
    Fail(String, JobRecord),
    Retry {
        job: JobRecord,
        attempt: i32,
        delay_ms: i64,
        next_run_at: DateTime<Utc>,
        error: String,
    },
    RetryExhausted(String, JobRecord),
    Complete(JobRecord),
}

impl Event {
    /// The generic event name (`start`, `success`, ...) used for the `<event>:<kind>` filter.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Event::Ready => "ready",
            Event::Error(_) => "error",
            Event::Start(_) => "start",
            Event::Success(_) => "success",
            Event::Fail(_, _) => "fail",
            Event::Retry { .. } => "retry",
            Event::RetryExhausted(_, _) => "retry exhausted",
            Event::Complete(_) => "complete",
        }
    }

    /// The job name this event pertains to, if any (engine-wide events like `Ready`/`Error` have
    /// none).
    pub fn job_name(&self) -> Option<&str> {
        match self {
            Event::Ready | Event::Error(_) => None,
            Event::Start(j) | Event::Success(j) | Event::Complete(j) => Some(&j.name),
            Event::Fail(_, j) | Event::RetryExhausted(_, j) => Some(&j.name),
            Event::Retry { job, .. } => Some(&job.name),
        }
    }
}

/// Broadcast-backed event bus. `on` spawns a filtering task so callers get a plain closure
/// interface instead of having to drive a `Receiver` themselves.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        // A lagging/absent subscriber must never block the processor; broadcast send failures
        // (no receivers) are expected and silently ignored.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Register a handler for a generic event (`event=None`) or for `event:<name>` (the per-kind
    /// variant). Returns a task handle the caller may abort to unsubscribe.
    pub fn on<F>(&self, event: &str, job_name: Option<&str>, handler: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        let event = event.to_string();
        let job_name = job_name.map(|s| s.to_string());
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        if ev.kind_name() != event {
                            continue;
                        }
                        if let Some(want) = &job_name {
                            if ev.job_name() != Some(want.as_str()) {
                                continue;
                            }
                        }
                        handler(ev);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
