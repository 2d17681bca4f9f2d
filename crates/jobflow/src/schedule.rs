//! Schedule calculator (§4.4): interval / cron / repeat-at with timezone and windowing.

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

use crate::error::JobError;
use crate::job::JobRecord;

/// Compute the next `next_run_at` for a job that just finished (or is being saved for the first
/// time), honouring `repeat_interval` / `repeat_at`, timezone, and the start/end/skip-days
/// window. Mutates `record.next_run_at` (and clears it to `None` on failure, per §4.4) and calls
/// `record.fail()` on parse/compute errors instead of returning early, matching the teacher's
/// "leave the record for inspection" error policy (§7 schedule-parse).
pub fn recompute_next_run(record: &mut JobRecord, now: DateTime<Utc>, skip_immediate: bool) {
    match compute_next_run(record, now, skip_immediate) {
        Ok(next) => record.next_run_at = apply_window(record, next),
        Err(e) => {
            record.next_run_at = None;
            record.fail(e.to_string());
        }
    }
}

fn compute_next_run(
    record: &JobRecord,
    now: DateTime<Utc>,
    skip_immediate: bool,
) -> Result<Option<DateTime<Utc>>, JobError> {
    if let Some(raw) = &record.repeat_interval {
        if record.repeat_interval_is_cron {
            return Ok(Some(next_cron_tick(raw, record, now)?));
        }
        return Ok(Some(next_interval_tick(raw, record, now, skip_immediate)?));
    }

    if let Some(time_of_day) = &record.repeat_at {
        return Ok(Some(next_repeat_at_tick(time_of_day, now)?));
    }

    Ok(None)
}

fn next_interval_tick(
    raw: &str,
    record: &JobRecord,
    now: DateTime<Utc>,
    skip_immediate: bool,
) -> Result<DateTime<Utc>, JobError> {
    let dur = humantime::parse_duration(raw)
        .map_err(|e| JobError::ScheduleParse(format!("invalid interval {raw:?}: {e}")))?;
    let dur = chrono::Duration::from_std(dur)
        .map_err(|e| JobError::ScheduleParse(format!("interval too large: {e}")))?;

    if skip_immediate {
        if let Some(existing) = record.next_run_at {
            return Ok(existing + dur);
        }
    }

    let base = record.last_run_at.unwrap_or(now);
    Ok(std::cmp::max(now, base) + dur)
}

fn next_cron_tick(raw: &str, record: &JobRecord, now: DateTime<Utc>) -> Result<DateTime<Utc>, JobError> {
    let schedule = CronSchedule::from_str(raw)
        .map_err(|e| JobError::ScheduleParse(format!("invalid cron {raw:?}: {e}")))?;

    let tz = record
        .repeat_timezone
        .as_deref()
        .map(|name| {
            name.parse::<chrono_tz::Tz>()
                .map_err(|_| JobError::ScheduleParse(format!("unknown timezone {name:?}")))
        })
        .transpose()?
        .unwrap_or(chrono_tz::UTC);

    // If the last tick landed exactly on the boundary (or one ms before it), still advance to
    // the *next* occurrence rather than returning the same instant (§4.4).
    let anchor = match record.last_run_at {
        Some(last) if Some(last) == record.next_run_at => last + chrono::Duration::milliseconds(1),
        _ => now,
    };

    let local = anchor.with_timezone(&tz);
    let next_local = schedule
        .after(&local)
        .next()
        .ok_or_else(|| JobError::ScheduleParse("cron schedule has no future occurrence".into()))?;

    Ok(next_local.with_timezone(&Utc))
}

fn next_repeat_at_tick(time_of_day: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, JobError> {
    let t = parse_time_of_day(time_of_day)?;
    let today = now.date_naive().and_time(t);
    let today_utc = Utc.from_utc_datetime(&today);
    if today_utc > now {
        Ok(today_utc)
    } else {
        Ok(Utc.from_utc_datetime(&(today + chrono::Duration::days(1))))
    }
}

fn parse_time_of_day(s: &str) -> Result<NaiveTime, JobError> {
    let s = s.trim();
    for fmt in ["%H:%M", "%I:%M%P", "%I:%M %P", "%I%P"] {
        if let Ok(t) = NaiveTime::parse_from_str(s, fmt) {
            return Ok(t);
        }
    }
    Err(JobError::ScheduleParse(format!("invalid repeat_at time {s:?}")))
}

/// Apply `start_date`/`end_date`/`skip_days` windowing; returns `None` (terminal) if no instant
/// in the window can be found within a bounded number of interval advances.
fn apply_window(record: &JobRecord, next: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    let mut candidate = next?;
    let skip = record.skip_weekdays();

    for _ in 0..366 {
        if let Some(start) = record.start_date {
            if candidate < start {
                candidate = start;
                continue;
            }
        }
        if let Some(end) = record.end_date {
            if candidate > end {
                return None;
            }
        }
        if skip.contains(&weekday_of(candidate)) {
            candidate += chrono::Duration::days(1);
            continue;
        }
        return Some(candidate);
    }
    None
}

fn weekday_of(dt: DateTime<Utc>) -> Weekday {
    dt.weekday()
}
