//! Unique/debounce coalescing rules (§4.5). Pure functions over `JobRecord` so they can be unit
//! tested without a database; the Postgres repository calls these between reading the existing
//! row (if any, by `(name, unique_key)`) and upserting.

use chrono::{DateTime, Utc};

use crate::job::{DebounceStrategy, JobRecord};

/// Apply debounce semantics to `incoming` given the `existing` stored row (if this unique key has
/// been seen before). `incoming.data` always wins (§4.5: "Job data is always overwritten by the
/// most recent save").
pub fn apply_debounce(incoming: &mut JobRecord, existing: Option<&JobRecord>, now: DateTime<Utc>) {
    let Some(opts) = incoming.debounce() else {
        return;
    };

    let Some(existing) = existing else {
        // First save of the burst.
        match opts.strategy {
            DebounceStrategy::Leading => {
                incoming.next_run_at = Some(now);
            }
            DebounceStrategy::Trailing => {
                incoming.next_run_at = Some(now + opts.delay);
                if opts.max_wait.is_some() {
                    incoming.debounce_started_at = Some(now);
                }
            }
        }
        return;
    };

    match opts.strategy {
        DebounceStrategy::Leading => {
            // Within `delay` of the first save: keep the original fire time, only `data` (and
            // whatever else the caller changed) updates.
            incoming.next_run_at = existing.next_run_at;
            incoming.debounce_started_at = existing.debounce_started_at;
        }
        DebounceStrategy::Trailing => {
            incoming.debounce_started_at = existing.debounce_started_at.or(Some(now));

            let started = incoming.debounce_started_at.unwrap_or(now);
            if let Some(max_wait) = opts.max_wait {
                if now - started >= max_wait {
                    incoming.next_run_at = Some(now);
                    incoming.debounce_started_at = None;
                    return;
                }
            }
            incoming.next_run_at = Some(now + opts.delay);
        }
    }
}

/// §3: a `Single`-type upsert whose existing `next_run_at` has already come due must not be
/// rescheduled backwards by a redundant `every(...)` call.
pub fn preserve_due_schedule(incoming: &mut JobRecord, existing: Option<&JobRecord>, now: DateTime<Utc>) {
    if incoming.debounce().is_some() {
        return;
    }
    if let Some(existing) = existing {
        if let Some(existing_next) = existing.next_run_at {
            if existing_next <= now {
                incoming.next_run_at = Some(existing_next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::DebounceOpts;
    use serde_json::json;

    fn record_with(data: serde_json::Value) -> JobRecord {
        JobRecord::new("burst", data)
    }

    #[test]
    fn trailing_debounce_pushes_next_run_at_later_each_save() {
        let now = Utc::now();
        let delay = chrono::Duration::milliseconds(1000);

        let mut first = record_with(json!({"n": 1}));
        first.set_debounce(&DebounceOpts::trailing(delay));
        apply_debounce(&mut first, None, now);
        assert_eq!(first.next_run_at, Some(now + delay));

        let t2 = now + chrono::Duration::milliseconds(100);
        let mut second = record_with(json!({"n": 2}));
        second.set_debounce(&DebounceOpts::trailing(delay));
        apply_debounce(&mut second, Some(&first), t2);
        assert_eq!(second.next_run_at, Some(t2 + delay));
        // Latest payload wins.
        assert_eq!(second.data, json!({"n": 2}));
    }

    #[test]
    fn trailing_debounce_forces_run_at_max_wait() {
        let now = Utc::now();
        let delay = chrono::Duration::milliseconds(1000);
        let max_wait = chrono::Duration::milliseconds(500);

        let mut first = record_with(json!({}));
        first.set_debounce(&DebounceOpts::trailing(delay).max_wait(max_wait));
        apply_debounce(&mut first, None, now);
        let started = first.debounce_started_at.unwrap();
        assert_eq!(started, now);

        let past_max_wait = now + chrono::Duration::milliseconds(600);
        let mut second = record_with(json!({}));
        second.set_debounce(&DebounceOpts::trailing(delay).max_wait(max_wait));
        apply_debounce(&mut second, Some(&first), past_max_wait);

        assert_eq!(second.next_run_at, Some(past_max_wait));
        assert_eq!(second.debounce_started_at, None);
    }

    #[test]
    fn leading_debounce_fires_immediately_then_holds() {
        let now = Utc::now();
        let delay = chrono::Duration::milliseconds(1000);

        let mut first = record_with(json!({"n": 1}));
        first.set_debounce(&DebounceOpts::leading(delay));
        apply_debounce(&mut first, None, now);
        assert_eq!(first.next_run_at, Some(now));

        let t2 = now + chrono::Duration::milliseconds(200);
        let mut second = record_with(json!({"n": 2}));
        second.set_debounce(&DebounceOpts::leading(delay));
        apply_debounce(&mut second, Some(&first), t2);

        // next_run_at unchanged, but data reflects the latest save.
        assert_eq!(second.next_run_at, Some(now));
        assert_eq!(second.data, json!({"n": 2}));
    }

    #[test]
    fn single_upsert_does_not_reschedule_backwards_once_due() {
        let now = Utc::now();
        let mut existing = record_with(json!({}));
        existing.next_run_at = Some(now - chrono::Duration::seconds(5));

        let mut incoming = record_with(json!({}));
        incoming.next_run_at = Some(now + chrono::Duration::minutes(5));

        preserve_due_schedule(&mut incoming, Some(&existing), now);
        assert_eq!(incoming.next_run_at, existing.next_run_at);
    }
}
