mod handlers;

use std::sync::Arc;

use jobflow::config::Config;
use jobflow::notify::memory::InMemoryNotificationChannel;
use jobflow::repository::postgres::PostgresRepository;
use jobflow::scheduler::{DefineOptions, EveryOptions};
use jobflow::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Re-exec entry point for fork-mode jobs (`jobflow::fork::run_in_child`): this process was
    // spawned solely to run one job by id, then exit.
    let mut argv = std::env::args();
    if let Some(flag) = argv.nth(1) {
        if flag == "--run-forked-job" {
            let job_id: jobflow::JobId = argv
                .next()
                .expect("--run-forked-job requires a job id")
                .parse()
                .expect("--run-forked-job id must be a UUID");
            return run_forked_job(job_id).await;
        }
    }

    let config = Config::from_env();
    let pool = jobflow::db::make_pool(&config.database_url, config.max_db_connections).await?;
    jobflow::db::run_migrations(&pool).await?;

    let repository = Arc::new(PostgresRepository::new(pool));
    let notify = Arc::new(InMemoryNotificationChannel::new());
    let scheduler = Scheduler::new(repository, notify, config.scheduler_config());

    scheduler
        .define(
            "demo_ok",
            DefineOptions {
                should_save_result: true,
                remove_on_complete: true,
                ..Default::default()
            },
            handlers::demo_ok,
        )
        .await?;
    scheduler
        .define(
            "fail_me",
            DefineOptions {
                backoff: Some(jobflow::backoff::exponential(5)),
                ..Default::default()
            },
            handlers::fail_me,
        )
        .await?;
    scheduler
        .define(
            "email_send",
            DefineOptions {
                concurrency: Some(10),
                fork_mode: config.fork_mode,
                ..Default::default()
            },
            handlers::email_send,
        )
        .await?;

    scheduler.on("success", None, |event| {
        tracing::info!(?event, "job succeeded");
    });
    scheduler.on("fail", None, |event| {
        tracing::warn!(?event, "job failed");
    });

    scheduler.now("demo_ok", serde_json::json!({})).await?;
    scheduler
        .every(
            jobflow::RepeatInterval::Human("1 minute".into()),
            "demo_ok",
            serde_json::json!({}),
            EveryOptions::default(),
        )
        .await?;

    scheduler.start().await?;
    tracing::info!("worker started, polling for runnable jobs");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining in-flight jobs");
    scheduler.stop().await;

    Ok(())
}

async fn run_forked_job(job_id: jobflow::JobId) -> anyhow::Result<()> {
    let config = Config::from_env();
    let pool = jobflow::db::make_pool(&config.database_url, config.max_db_connections).await?;
    let repository = Arc::new(PostgresRepository::new(pool));
    let notify = Arc::new(InMemoryNotificationChannel::new());
    let scheduler = Scheduler::new(repository, notify, config.scheduler_config());

    scheduler
        .define(
            "email_send",
            DefineOptions {
                concurrency: Some(10),
                fork_mode: config.fork_mode,
                ..Default::default()
            },
            handlers::email_send,
        )
        .await?;

    jobflow::fork::run_forked_job(&scheduler, job_id).await?;
    Ok(())
}
