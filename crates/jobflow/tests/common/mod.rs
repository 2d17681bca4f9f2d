use jobflow::repository::postgres::PostgresRepository;
use jobflow::{JobRecord, JobRepository};
use sqlx::PgPool;

pub async fn setup_db() -> PgPool {
    dotenvy::dotenv().ok();
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests");
    let pool = jobflow::db::make_pool(&url, 5).await.expect("connect to test database");
    jobflow::db::run_migrations(&pool).await.expect("run migrations");
    sqlx::query("TRUNCATE jobs").execute(&pool).await.expect("truncate jobs");
    pool
}

pub fn repository(pool: PgPool) -> PostgresRepository {
    PostgresRepository::new(pool)
}

pub async fn insert_job(
    repo: &PostgresRepository,
    name: &str,
    next_run_at: chrono::DateTime<chrono::Utc>,
    priority: i32,
) -> JobRecord {
    let mut job = JobRecord::new(name, serde_json::json!({}));
    job.next_run_at = Some(next_run_at);
    job.priority = priority;
    repo.save_job(job).await.expect("insert job")
}
