mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use jobflow::notify::memory::InMemoryNotificationChannel;
use jobflow::repository::postgres::PostgresRepository;
use jobflow::scheduler::{DefineOptions, SchedulerConfig};
use jobflow::{JobRepository, Scheduler};
use serde_json::json;
use serial_test::serial;

fn fast_scheduler(repo: PostgresRepository) -> Scheduler {
    let repository = Arc::new(repo);
    let notify = Arc::new(InMemoryNotificationChannel::new());
    let config = SchedulerConfig {
        poll_interval: StdDuration::from_millis(20),
        ..Default::default()
    };
    Scheduler::new(repository, notify, config)
}

async fn wait_until<F: Fn() -> bool>(cond: F, timeout: StdDuration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    cond()
}

async fn wait_until_async<F, Fut>(mut cond: F, timeout: StdDuration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return true;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    cond().await
}

/// SCN-2: exactly one `start` fires for a due job even with two processors racing for it (here
/// simulated as two scheduler instances sharing the same database).
#[tokio::test]
#[serial]
async fn exactly_one_start_fires_for_a_due_job() {
    let pool = common::setup_db().await;
    let starts = Arc::new(AtomicUsize::new(0));

    let scheduler_a = fast_scheduler(common::repository(pool.clone()));
    let scheduler_b = fast_scheduler(common::repository(pool.clone()));

    for scheduler in [&scheduler_a, &scheduler_b] {
        let starts = starts.clone();
        scheduler
            .define("race_job", DefineOptions::default(), move |_job| {
                let starts = starts.clone();
                async move {
                    starts.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, jobflow::JobError>(json!(null))
                }
            })
            .await
            .unwrap();
    }

    scheduler_a.now("race_job", json!({})).await.unwrap();

    scheduler_a.start().await.unwrap();
    scheduler_b.start().await.unwrap();

    wait_until(|| starts.load(Ordering::SeqCst) >= 1, StdDuration::from_secs(2)).await;
    tokio::time::sleep(StdDuration::from_millis(200)).await;

    scheduler_a.stop().await;
    scheduler_b.stop().await;

    assert_eq!(starts.load(Ordering::SeqCst), 1, "exactly one worker should have run the job");
}

/// SCN-3: a worker that claims a job and never unlocks it (simulating a crash) must not keep the
/// job locked forever — a second scheduler instance with a short lock lifetime reclaims it.
#[tokio::test]
#[serial]
async fn stale_lock_is_reclaimed_and_job_still_succeeds() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool.clone());
    let job = common::insert_job(&repo, "crash_job", chrono::Utc::now(), 0).await;

    // Simulate worker A crashing mid-handler: claim it directly via the repository and never
    // release, bypassing the processor entirely.
    let now = chrono::Utc::now();
    repo.next_job_to_run(
        "crash_job",
        now,
        now - chrono::Duration::minutes(5),
        now,
        jobflow::repository::ClaimSort::NextRunThenPriority,
    )
    .await
    .unwrap()
    .expect("worker A should claim the job");

    let succeeded = Arc::new(AtomicUsize::new(0));
    let config = SchedulerConfig {
        poll_interval: StdDuration::from_millis(20),
        default_lock_lifetime: chrono::Duration::milliseconds(50),
        ..Default::default()
    };
    let scheduler_b = Scheduler::new(
        Arc::new(common::repository(pool)),
        Arc::new(InMemoryNotificationChannel::new()),
        config,
    );
    let succeeded_cl = succeeded.clone();
    scheduler_b
        .define("crash_job", DefineOptions::default(), move |_job| {
            let succeeded = succeeded_cl.clone();
            async move {
                succeeded.fetch_add(1, Ordering::SeqCst);
                Ok::<_, jobflow::JobError>(json!(null))
            }
        })
        .await
        .unwrap();

    scheduler_b.start().await.unwrap();
    let ok = wait_until(|| succeeded.load(Ordering::SeqCst) >= 1, StdDuration::from_secs(3)).await;
    scheduler_b.stop().await;

    assert!(ok, "stale lock should have been reclaimed and the job run to success");

    let record = scheduler_b.get_job(job.id).await.unwrap().unwrap();
    assert!(record.last_finished_at.is_some());
}

/// SCN-9: removeOnComplete deletes the row once a one-shot job succeeds.
#[tokio::test]
#[serial]
async fn remove_on_complete_deletes_the_row_after_success() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool.clone());
    let job = common::insert_job(&repo, "cleanup_once", chrono::Utc::now(), 0).await;

    let scheduler = fast_scheduler(common::repository(pool));
    scheduler
        .define(
            "cleanup_once",
            DefineOptions {
                remove_on_complete: true,
                ..Default::default()
            },
            |_job| async move { Ok::<_, jobflow::JobError>(json!(null)) },
        )
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    let gone = wait_until_async(
        || async { scheduler.get_job(job.id).await.unwrap().is_none() },
        StdDuration::from_secs(2),
    )
    .await;
    scheduler.stop().await;

    assert!(gone, "job row should be removed once it completes");
}

/// SCN-10: a disabled job never starts; enabling it lets it run on a later tick.
#[tokio::test]
#[serial]
async fn disabled_job_does_not_run_until_enabled() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool.clone());
    let mut job = common::insert_job(&repo, "paused_job", chrono::Utc::now(), 0).await;
    job.disabled = true;
    repo.save_job(job.clone()).await.unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let scheduler = fast_scheduler(common::repository(pool));
    let ran_cl = ran.clone();
    scheduler
        .define("paused_job", DefineOptions::default(), move |_job| {
            let ran = ran_cl.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, jobflow::JobError>(json!(null))
            }
        })
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(200)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0, "a disabled job must not start");

    scheduler.enable("paused_job").await.unwrap();
    let started = wait_until(|| ran.load(Ordering::SeqCst) >= 1, StdDuration::from_secs(2)).await;
    scheduler.stop().await;

    assert!(started, "enabling the job should let it run on a later tick");
}

/// SCN-4: among jobs due at the same instant, higher priority starts first under concurrency=1.
#[tokio::test]
#[serial]
async fn higher_priority_runs_before_lower_at_the_same_instant() {
    let pool = common::setup_db().await;
    let repo = common::repository(pool.clone());
    let now = chrono::Utc::now();

    common::insert_job(&repo, "priority_job", now, -10).await;
    common::insert_job(&repo, "priority_job", now, 0).await;
    let high = common::insert_job(&repo, "priority_job", now, 10).await;

    let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let scheduler = Scheduler::new(
        Arc::new(common::repository(pool)),
        Arc::new(InMemoryNotificationChannel::new()),
        SchedulerConfig {
            poll_interval: StdDuration::from_millis(20),
            ..Default::default()
        },
    );
    let order_cl = order.clone();
    scheduler
        .define(
            "priority_job",
            DefineOptions {
                concurrency: Some(1),
                ..Default::default()
            },
            move |job| {
                let order = order_cl.clone();
                async move {
                    order.lock().await.push(job.record.priority);
                    tokio::time::sleep(StdDuration::from_millis(30)).await;
                    Ok::<_, jobflow::JobError>(json!(null))
                }
            },
        )
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    wait_until_async(|| async { order.lock().await.len() >= 3 }, StdDuration::from_secs(3)).await;
    scheduler.stop().await;

    let seen = order.lock().await.clone();
    assert_eq!(seen.first(), Some(&high.priority), "the highest-priority job should start first");
}
