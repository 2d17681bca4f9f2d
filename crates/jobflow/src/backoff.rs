//! Retry backoff strategies. `Backoff` is the per-kind, opt-in `(attempt, error, name, data) ->
//! delay|None` function named in the glossary: a definition with no backoff configured does not
//! retry at all. [`exponential`] provides a ready-made strategy grounded in the teacher's
//! `jobs/retry.rs` (`RetryConfig`/`next_delay_seconds`: base 2s, 900s ceiling, 20% jitter).

use std::sync::Arc;

use rand::Rng;
use serde_json::Value;

use crate::error::JobError;

pub type BackoffFn = dyn Fn(i32, &JobError, &str, &Value) -> Option<chrono::Duration> + Send + Sync;

/// Exponential backoff with jitter, capped at `max_attempts`. Mirrors the teacher's
/// `RetryConfig { base_seconds: 2, max_seconds: 900, jitter_pct: 0.20 }`.
pub fn exponential(max_attempts: i32) -> Arc<BackoffFn> {
    Arc::new(move |attempt, error, _name, _data| {
        if attempt >= max_attempts || !error.retryable() {
            return None;
        }
        Some(delay_for_attempt(attempt))
    })
}

fn delay_for_attempt(attempt: i32) -> chrono::Duration {
    const BASE_SECONDS: i64 = 2;
    const MAX_SECONDS: i64 = 900;
    const JITTER_PCT: f64 = 0.20;

    let capped_attempt = attempt.clamp(0, 30) as u32;
    let seconds = BASE_SECONDS.checked_shl(capped_attempt).unwrap_or(MAX_SECONDS).min(MAX_SECONDS);

    let jitter_range = (seconds as f64 * JITTER_PCT) as i64;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(-jitter_range..=jitter_range)
    } else {
        0
    };

    chrono::Duration::seconds((seconds + jitter).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_retrying_past_max_attempts() {
        let backoff = exponential(3);
        let err = JobError::Handler("boom".into());
        assert!(backoff(2, &err, "job", &Value::Null).is_some());
        assert!(backoff(3, &err, "job", &Value::Null).is_none());
    }

    #[test]
    fn never_retries_non_retryable_errors() {
        let backoff = exponential(10);
        let err = JobError::ScheduleParse("bad cron".into());
        assert!(backoff(0, &err, "job", &Value::Null).is_none());
    }
}
