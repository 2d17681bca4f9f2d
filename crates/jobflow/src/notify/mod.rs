//! Cross-process wake-up and state signalling (§6). A `NotificationChannel` lets one process's
//! `now()`/`save()` wake a sibling worker's poll loop immediately instead of waiting for its next
//! tick, and lets state observers watch job lifecycle events without subscribing to the in-process
//! [`crate::events::EventBus`] (which does not cross a process boundary).

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JobError;
use crate::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// "New work available" ping, published whenever a job is saved with a `next_run_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: JobId,
    pub job_name: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub priority: i32,
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStateKind {
    Start,
    Progress,
    Success,
    Fail,
    Complete,
    Retry,
}

/// Lifecycle event re-emitted for cross-process observers, mirroring [`crate::events::Event`]
/// but serializable and without the full `JobRecord` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStateNotification {
    pub kind: JobStateKind,
    pub job_id: JobId,
    pub job_name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Option<Value>,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn connect(&self) -> Result<(), JobError>;
    async fn disconnect(&self) -> Result<(), JobError>;
    fn state(&self) -> tokio::sync::watch::Receiver<ConnectionState>;

    /// Publish that new work is available (used to wake a sibling worker's poll loop
    /// immediately, or to fast-path a specific claim via `JobRepository::lock_job`). Must error
    /// if not connected.
    async fn publish(&self, notification: JobNotification) -> Result<(), JobError>;

    /// Subscribers MUST silently drop any notification whose `timestamp` predates their own
    /// subscribe call — a notification published before a subscriber existed is not "new work"
    /// from that subscriber's point of view.
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<JobNotification>;

    async fn publish_state(&self, notification: JobStateNotification) -> Result<(), JobError>;
    fn subscribe_state(&self) -> tokio::sync::broadcast::Receiver<JobStateNotification>;
}
