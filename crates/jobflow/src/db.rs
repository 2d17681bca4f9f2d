//! Pool construction and migration bootstrap, grounded in the teacher's `db.rs`.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
