mod common;

use chrono::Utc;
use jobflow::{DebounceOpts, JobRecord, JobRepository};
use serde_json::json;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn trailing_debounce_collapses_repeated_saves_into_one_row() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool);

    let key = json!({"user_id": 42});
    let delay = chrono::Duration::milliseconds(200);

    fn unique_and_debounce(job: &mut JobRecord, key: serde_json::Value, delay: chrono::Duration) {
        job.unique_key = Some(key);
        job.set_debounce(&DebounceOpts::trailing(delay));
    }

    let mut first = JobRecord::new("send_digest", json!({"version": 1}));
    unique_and_debounce(&mut first, key.clone(), delay);
    let saved_first = repo.save_job(first).await.unwrap();

    let mut second = JobRecord::new("send_digest", json!({"version": 2}));
    unique_and_debounce(&mut second, key.clone(), delay);
    let saved_second = repo.save_job(second).await.unwrap();

    assert_eq!(saved_first.id, saved_second.id, "same unique key must coalesce to one row");
    assert_eq!(saved_second.data, json!({"version": 2}), "latest payload wins");

    let rows = repo
        .query_jobs(&jobflow::JobQuery {
            name: Some("send_digest".to_string()),
            disabled: None,
            failed_only: false,
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
#[serial]
async fn single_type_job_upserts_by_name() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool);

    let mut first = JobRecord::new("nightly_cleanup", json!({}));
    first.job_type = jobflow::JobType::Single.as_str().to_string();
    first.next_run_at = Some(Utc::now());
    let saved_first = repo.save_job(first).await.unwrap();

    let mut second = JobRecord::new("nightly_cleanup", json!({}));
    second.job_type = jobflow::JobType::Single.as_str().to_string();
    second.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
    let saved_second = repo.save_job(second).await.unwrap();

    assert_eq!(saved_first.id, saved_second.id);
}

/// Two callers racing `save_job` for a brand new `Single` job must still collapse to one row —
/// the two-phase insert-then-fallback-to-update path in the Postgres adapter relies on the
/// database's own conflict resolution for this, not a check-then-insert in application code.
#[tokio::test]
#[serial]
async fn concurrent_single_type_saves_collapse_to_one_row() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool);

    let mut first = JobRecord::new("nightly_cleanup", json!({"from": "a"}));
    first.job_type = jobflow::JobType::Single.as_str().to_string();
    first.next_run_at = Some(Utc::now());

    let mut second = JobRecord::new("nightly_cleanup", json!({"from": "b"}));
    second.job_type = jobflow::JobType::Single.as_str().to_string();
    second.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));

    let (a, b) = tokio::join!(repo.save_job(first), repo.save_job(second));
    let saved_first = a.unwrap();
    let saved_second = b.unwrap();

    assert_eq!(saved_first.id, saved_second.id, "concurrent single-type saves must collapse to one row");

    let rows = repo
        .query_jobs(&jobflow::JobQuery {
            name: Some("nightly_cleanup".to_string()),
            disabled: None,
            failed_only: false,
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1, "exactly one row must exist after the race");
}

#[tokio::test]
#[serial]
async fn remove_jobs_filters_by_name() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool);

    common::insert_job(&repo, "keep_me", Utc::now(), 0).await;
    common::insert_job(&repo, "drop_me", Utc::now(), 0).await;

    let removed = repo
        .remove_jobs(&jobflow::JobQuery {
            name: Some("drop_me".to_string()),
            disabled: None,
            failed_only: false,
        })
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let remaining = repo.distinct_job_names().await.unwrap();
    assert_eq!(remaining, vec!["keep_me".to_string()]);
}
