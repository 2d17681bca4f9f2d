//! Demo job handlers, grounded in the reference worker's handler set (`demo_ok`, `fail_me`,
//! `email_send`). These exist to exercise the engine end-to-end, not as production handlers.

use jobflow::{Job, JobError};
use serde_json::{json, Value};
use tracing::info;

pub async fn demo_ok(mut job: Job) -> Result<Value, JobError> {
    info!(job = job.name(), id = %job.id(), "demo_ok running");
    job.touch(Some(100)).await.ok();
    Ok(json!({ "ran_at": chrono::Utc::now().to_rfc3339() }))
}

pub async fn fail_me(job: Job) -> Result<Value, JobError> {
    info!(job = job.name(), id = %job.id(), "fail_me running");
    Err(JobError::Handler("fail_me always fails".into()))
}

pub async fn email_send(job: Job) -> Result<Value, JobError> {
    let to = job.record.data.get("to").and_then(|v| v.as_str()).unwrap_or("unknown");
    info!(job = job.name(), id = %job.id(), to, "sending email");
    Ok(json!({ "to": to, "sent": true }))
}
