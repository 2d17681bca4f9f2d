mod common;

use chrono::Utc;
use jobflow::repository::ClaimSort;
use jobflow::JobRepository;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn two_workers_never_claim_the_same_job() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool);
    common::insert_job(&repo, "send_email", Utc::now(), 0).await;

    let now = Utc::now();
    let lock_deadline = now - chrono::Duration::minutes(5);

    let (a, b) = tokio::join!(
        repo.next_job_to_run("send_email", now, lock_deadline, now, ClaimSort::NextRunThenPriority),
        repo.next_job_to_run("send_email", now, lock_deadline, now, ClaimSort::NextRunThenPriority),
    );

    let a = a.unwrap();
    let b = b.unwrap();
    assert!(a.is_some() ^ b.is_some(), "exactly one worker should claim the job");
}

#[tokio::test]
#[serial]
async fn lease_expires_then_another_worker_can_claim() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool);
    let job = common::insert_job(&repo, "send_email", Utc::now(), 0).await;

    let now = Utc::now();
    let lock_deadline = now - chrono::Duration::minutes(5);
    let first = repo
        .next_job_to_run("send_email", now, lock_deadline, now, ClaimSort::NextRunThenPriority)
        .await
        .unwrap();
    assert_eq!(first.unwrap().id, job.id);

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    // Re-claim immediately: the lease is still within its lifetime, so nothing should come back.
    let still_locked = repo
        .next_job_to_run("send_email", now, now - chrono::Duration::minutes(5), now, ClaimSort::NextRunThenPriority)
        .await
        .unwrap();
    assert!(still_locked.is_none());

    // A lock_deadline in the future (relative to when the job was locked) makes the stale lock
    // reclaimable, mirroring a worker whose lock lifetime has actually elapsed.
    let second = repo
        .next_job_to_run(
            "send_email",
            Utc::now(),
            Utc::now() + chrono::Duration::milliseconds(1),
            Utc::now(),
            ClaimSort::NextRunThenPriority,
        )
        .await
        .unwrap();
    assert_eq!(second.unwrap().id, job.id);
}

/// Reproduces the one-shot-crash-then-reclaim scenario: a one-shot job is claimed, then "crashes"
/// (its lock goes stale without `next_run_at` ever being touched), and must still be reclaimable
/// by a later scan even though `next_run_at` is unchanged and possibly far in the past.
#[tokio::test]
#[serial]
async fn crashed_one_shot_job_is_reclaimed_without_touching_next_run_at() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool);
    let original_next_run_at = Utc::now() - chrono::Duration::minutes(30);
    let job = common::insert_job(&repo, "one_shot", original_next_run_at, 0).await;

    let now = Utc::now();
    let claimed = repo
        .next_job_to_run("one_shot", now, now - chrono::Duration::minutes(5), now, ClaimSort::NextRunThenPriority)
        .await
        .unwrap()
        .expect("first claim should succeed");
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.next_run_at, Some(original_next_run_at), "next_run_at must be untouched by claiming");

    // Simulate the worker crashing: the lock is never released and `next_run_at` is never
    // recomputed, since this is a one-shot job (§processor: only recurring jobs get their
    // recurrence recomputed before the handler runs).
    let stale_lock_deadline = Utc::now() + chrono::Duration::milliseconds(1);
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let reclaimed = repo
        .next_job_to_run("one_shot", Utc::now(), stale_lock_deadline, Utc::now(), ClaimSort::NextRunThenPriority)
        .await
        .unwrap()
        .expect("a crashed one-shot job must remain reclaimable");
    assert_eq!(reclaimed.id, job.id);
}

#[tokio::test]
#[serial]
async fn workers_only_lease_from_their_own_queue() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool);
    common::insert_job(&repo, "queue_a", Utc::now(), 0).await;

    let now = Utc::now();
    let claimed = repo
        .next_job_to_run("queue_b", now, now - chrono::Duration::minutes(5), now, ClaimSort::NextRunThenPriority)
        .await
        .unwrap();
    assert!(claimed.is_none());
}

#[tokio::test]
#[serial]
async fn delayed_job_is_not_leased_before_its_run_at() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool);
    common::insert_job(&repo, "send_email", Utc::now() + chrono::Duration::minutes(10), 0).await;

    let now = Utc::now();
    let claimed = repo
        .next_job_to_run("send_email", now, now - chrono::Duration::minutes(5), now, ClaimSort::NextRunThenPriority)
        .await
        .unwrap();
    assert!(claimed.is_none());
}

#[tokio::test]
#[serial]
async fn leasing_respects_priority_then_run_at() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool);
    let now = Utc::now();

    common::insert_job(&repo, "send_email", now, 0).await;
    let high = common::insert_job(&repo, "send_email", now, 10).await;

    let claimed = repo
        .next_job_to_run("send_email", now, now - chrono::Duration::minutes(5), now, ClaimSort::PriorityThenNextRun)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, high.id);
}
