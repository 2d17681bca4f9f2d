//! Optional fork-mode execution (§4.8, non-default): run a job's handler in a child process
//! instead of a task on the current runtime, for handlers that need OS-level isolation. The
//! child re-execs the current binary with `--run-forked-job <id>` and is expected to call
//! [`run_forked_job`] from its own `main`.

use std::process::Stdio;

use serde_json::Value;
use tokio::process::Command;

use crate::error::JobError;
use crate::job::JobId;
use crate::scheduler::Scheduler;

/// Spawn the current executable as a child process to run a single job by id, waiting for it to
/// exit. A non-zero exit status is reported as a handler error so the processor's normal
/// retry/DLQ path applies uniformly to in-process and forked jobs.
pub async fn run_in_child(current_exe: &std::path::Path, job_id: JobId) -> Result<(), JobError> {
    let status = Command::new(current_exe)
        .arg("--run-forked-job")
        .arg(job_id.to_string())
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| JobError::Handler(format!("failed to spawn forked job process: {e}")))?;

    if status.success() {
        Ok(())
    } else {
        Err(JobError::Handler(format!(
            "forked job process exited with {status}"
        )))
    }
}

/// Entry point a binary's `main` calls when invoked with `--run-forked-job <id>`: load the job,
/// resolve its kind's definition from a scheduler configured identically to the parent process,
/// and run the handler directly (no processor loop, no concurrency gating — the parent already
/// accounted for this as one slot).
pub async fn run_forked_job(scheduler: &Scheduler, job_id: JobId) -> Result<Value, JobError> {
    let record = scheduler
        .repository()
        .get_job_by_id(job_id)
        .await?
        .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

    let definition = scheduler
        .definition(&record.name)
        .await
        .ok_or_else(|| JobError::NotDefined(record.name.clone()))?;

    let job = crate::job::Job::new(record, scheduler.weak());
    (definition.handler)(job).await
}
