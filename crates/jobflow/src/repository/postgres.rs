//! Postgres reference adapter. The claim algorithm mirrors a `SELECT ... FOR UPDATE SKIP LOCKED`
//! followed by a conditional `UPDATE ... RETURNING`, so two workers racing `next_job_to_run` for
//! the same kind never return the same row. `save_job`'s upsert path for `Single`/unique-keyed
//! jobs relies on the DB's own conflict detection (`INSERT ... ON CONFLICT DO NOTHING`) rather
//! than a check-then-insert, so two concurrent first-saves of a brand new row can't both insert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::coalesce;
use crate::error::JobError;
use crate::job::{JobId, JobRecord};

use super::{ClaimSort, JobQuery, JobRepository};

pub struct PostgresRepository {
    pool: PgPool,
}

const JOB_COLUMNS: &str = r#"
    id, name, job_type, data, priority,
    next_run_at, last_run_at, last_finished_at, failed_at,
    fail_reason, fail_count, locked_at,
    repeat_interval, repeat_interval_is_cron, repeat_timezone, repeat_at,
    start_date, end_date, skip_days,
    disabled, unique_key, unique_insert_only,
    debounce_delay_ms, debounce_max_wait_ms, debounce_leading, debounce_started_at,
    progress, last_modified_by, created_at, updated_at
"#;

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Plain upsert-by-id, used for `Normal` jobs (no partial unique index applies) and for the
    /// second phase of the `Single`/unique-key path once the conflicting row's id is known.
    async fn upsert_by_id(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job: &JobRecord,
    ) -> Result<JobRecord, JobError> {
        let row = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            INSERT INTO jobs ({JOB_COLUMNS})
            VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9,
                $10, $11, $12,
                $13, $14, $15, $16,
                $17, $18, $19,
                $20, $21, $22,
                $23, $24, $25, $26,
                $27, $28, $29, $30
            )
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                data = EXCLUDED.data,
                priority = EXCLUDED.priority,
                next_run_at = EXCLUDED.next_run_at,
                last_run_at = EXCLUDED.last_run_at,
                last_finished_at = EXCLUDED.last_finished_at,
                failed_at = EXCLUDED.failed_at,
                fail_reason = EXCLUDED.fail_reason,
                fail_count = EXCLUDED.fail_count,
                locked_at = EXCLUDED.locked_at,
                repeat_interval = EXCLUDED.repeat_interval,
                repeat_interval_is_cron = EXCLUDED.repeat_interval_is_cron,
                repeat_timezone = EXCLUDED.repeat_timezone,
                repeat_at = EXCLUDED.repeat_at,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                skip_days = EXCLUDED.skip_days,
                disabled = EXCLUDED.disabled,
                unique_key = EXCLUDED.unique_key,
                unique_insert_only = EXCLUDED.unique_insert_only,
                debounce_delay_ms = EXCLUDED.debounce_delay_ms,
                debounce_max_wait_ms = EXCLUDED.debounce_max_wait_ms,
                debounce_leading = EXCLUDED.debounce_leading,
                debounce_started_at = EXCLUDED.debounce_started_at,
                progress = EXCLUDED.progress,
                last_modified_by = EXCLUDED.last_modified_by,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#
        ))
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.job_type)
        .bind(&job.data)
        .bind(job.priority)
        .bind(job.next_run_at)
        .bind(job.last_run_at)
        .bind(job.last_finished_at)
        .bind(job.failed_at)
        .bind(&job.fail_reason)
        .bind(job.fail_count)
        .bind(job.locked_at)
        .bind(&job.repeat_interval)
        .bind(job.repeat_interval_is_cron)
        .bind(&job.repeat_timezone)
        .bind(&job.repeat_at)
        .bind(job.start_date)
        .bind(job.end_date)
        .bind(&job.skip_days)
        .bind(job.disabled)
        .bind(&job.unique_key)
        .bind(job.unique_insert_only)
        .bind(job.debounce_delay_ms)
        .bind(job.debounce_max_wait_ms)
        .bind(job.debounce_leading)
        .bind(job.debounce_started_at)
        .bind(job.progress)
        .bind(&job.last_modified_by)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row)
    }

    /// Try to insert `job` as a brand new row, targeting whichever partial unique index applies.
    /// Returns `None` (instead of erroring) if a row already occupies that index slot — the
    /// caller then falls back to reading and updating the existing row.
    async fn try_insert_new(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job: &JobRecord,
    ) -> Result<Option<JobRecord>, JobError> {
        let conflict_clause = if job.job_type().as_str() == "single" {
            "ON CONFLICT (name) WHERE job_type = 'single' DO NOTHING"
        } else if job.unique_key.is_some() {
            "ON CONFLICT (name, unique_key) WHERE unique_key IS NOT NULL DO NOTHING"
        } else {
            "ON CONFLICT (id) DO NOTHING"
        };

        let row = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            INSERT INTO jobs ({JOB_COLUMNS})
            VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9,
                $10, $11, $12,
                $13, $14, $15, $16,
                $17, $18, $19,
                $20, $21, $22,
                $23, $24, $25, $26,
                $27, $28, $29, $30
            )
            {conflict_clause}
            RETURNING *
            "#
        ))
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.job_type)
        .bind(&job.data)
        .bind(job.priority)
        .bind(job.next_run_at)
        .bind(job.last_run_at)
        .bind(job.last_finished_at)
        .bind(job.failed_at)
        .bind(&job.fail_reason)
        .bind(job.fail_count)
        .bind(job.locked_at)
        .bind(&job.repeat_interval)
        .bind(job.repeat_interval_is_cron)
        .bind(&job.repeat_timezone)
        .bind(&job.repeat_at)
        .bind(job.start_date)
        .bind(job.end_date)
        .bind(&job.skip_days)
        .bind(job.disabled)
        .bind(&job.unique_key)
        .bind(job.unique_insert_only)
        .bind(job.debounce_delay_ms)
        .bind(job.debounce_max_wait_ms)
        .bind(job.debounce_leading)
        .bind(job.debounce_started_at)
        .bind(job.progress)
        .bind(&job.last_modified_by)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }

    async fn find_existing(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job: &JobRecord,
    ) -> Result<Option<JobRecord>, JobError> {
        let existing = if job.job_type().as_str() == "single" {
            sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE name = $1 AND job_type = 'single' FOR UPDATE")
                .bind(&job.name)
                .fetch_optional(&mut **tx)
                .await?
        } else if let Some(key) = &job.unique_key {
            sqlx::query_as::<_, JobRecord>(
                "SELECT * FROM jobs WHERE name = $1 AND unique_key = $2 FOR UPDATE",
            )
            .bind(&job.name)
            .bind(key)
            .fetch_optional(&mut **tx)
            .await?
        } else {
            None
        };
        Ok(existing)
    }
}

#[async_trait]
impl JobRepository for PostgresRepository {
    async fn save_job(&self, mut job: JobRecord) -> Result<JobRecord, JobError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let has_conflict_target = job.job_type().as_str() == "single" || job.unique_key.is_some();

        if !has_conflict_target {
            coalesce::apply_debounce(&mut job, None, now);
            coalesce::preserve_due_schedule(&mut job, None, now);
            job.updated_at = now;
            let row = Self::upsert_by_id(&mut tx, &job).await?;
            tx.commit().await?;
            return Ok(row);
        }

        // Phase 1: attempt a fresh insert. Postgres serializes concurrent inserts against the
        // same partial unique index internally, so exactly one of two racing callers wins here
        // even though neither has read an "existing" row yet.
        coalesce::apply_debounce(&mut job, None, now);
        coalesce::preserve_due_schedule(&mut job, None, now);
        job.updated_at = now;

        if let Some(row) = Self::try_insert_new(&mut tx, &job).await? {
            tx.commit().await?;
            return Ok(row);
        }

        // Phase 2: lost the race (or this is a genuine update of an existing Single/unique job).
        // Lock and re-read the row the conflict resolved to, then coalesce and update it by id.
        let existing = Self::find_existing(&mut tx, &job)
            .await?
            .ok_or_else(|| JobError::Repository(sqlx::Error::RowNotFound))?;

        if job.unique_insert_only {
            tx.commit().await?;
            return Ok(existing);
        }

        job.id = existing.id;
        job.created_at = existing.created_at;
        coalesce::apply_debounce(&mut job, Some(&existing), now);
        coalesce::preserve_due_schedule(&mut job, Some(&existing), now);
        job.updated_at = now;

        let row = Self::upsert_by_id(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn get_job_by_id(&self, id: JobId) -> Result<Option<JobRecord>, JobError> {
        let row = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn query_jobs(&self, query: &JobQuery) -> Result<Vec<JobRecord>, JobError> {
        let rows = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs
            WHERE ($1::text IS NULL OR name = $1)
              AND ($2::bool IS NULL OR disabled = $2)
              AND (NOT $3 OR fail_reason IS NOT NULL)
            ORDER BY next_run_at ASC NULLS LAST, priority DESC
            "#,
        )
        .bind(&query.name)
        .bind(query.disabled)
        .bind(query.failed_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn remove_jobs(&self, query: &JobQuery) -> Result<u64, JobError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE ($1::text IS NULL OR name = $1)
              AND ($2::bool IS NULL OR disabled = $2)
              AND (NOT $3 OR fail_reason IS NOT NULL)
            "#,
        )
        .bind(&query.name)
        .bind(query.disabled)
        .bind(query.failed_only)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn remove_job(&self, id: JobId) -> Result<bool, JobError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn distinct_job_names(&self) -> Result<Vec<String>, JobError> {
        let rows = sqlx::query("SELECT DISTINCT name FROM jobs ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("name")).collect())
    }

    async fn queue_size(&self, name: Option<&str>) -> Result<i64, JobError> {
        let row = sqlx::query(
            r#"
            SELECT count(*) AS n FROM jobs
            WHERE ($1::text IS NULL OR name = $1)
              AND disabled = false
              AND locked_at IS NULL
              AND next_run_at <= now()
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    async fn lock_job(&self, record: &JobRecord, now: DateTime<Utc>) -> Result<Option<JobRecord>, JobError> {
        let locked = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET locked_at = $4, last_run_at = $4
            WHERE id = $1
              AND name = $2
              AND locked_at IS NULL
              AND next_run_at IS NOT DISTINCT FROM $3
              AND disabled = false
            RETURNING *
            "#,
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(record.next_run_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(locked)
    }

    async fn unlock_job(&self, id: JobId) -> Result<(), JobError> {
        sqlx::query("UPDATE jobs SET locked_at = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unlock_jobs(&self, ids: &[JobId]) -> Result<(), JobError> {
        sqlx::query("UPDATE jobs SET locked_at = NULL WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn next_job_to_run(
        &self,
        name: &str,
        next_scan_at: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
        sort: ClaimSort,
    ) -> Result<Option<JobRecord>, JobError> {
        let order_by = match sort {
            ClaimSort::NextRunThenPriority => "next_run_at ASC NULLS LAST, priority DESC",
            ClaimSort::PriorityThenNextRun => "priority DESC, next_run_at ASC NULLS LAST",
        };

        let mut tx = self.pool.begin().await?;

        // The stale-reclaim branch is NOT gated on `next_run_at <= next_scan_at`: a crashed
        // one-shot job's `next_run_at` is whatever it was before the crash (possibly far in the
        // past, possibly untouched), and requiring it to also be due would make a stale lock on
        // such a row permanently unreclaimable once it's already claimed once.
        let candidate = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            SELECT * FROM jobs
            WHERE name = $1
              AND disabled = false
              AND (
                    (locked_at IS NULL AND next_run_at <= $2)
                 OR (locked_at IS NOT NULL AND locked_at <= $3)
                  )
            ORDER BY {order_by}
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(name)
        .bind(next_scan_at)
        .bind(lock_deadline)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(candidate) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let locked = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET locked_at = $2, last_run_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(candidate.id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(locked))
    }

    async fn save_job_state(&self, job: &JobRecord) -> Result<(), JobError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                last_run_at = $2,
                last_finished_at = $3,
                locked_at = $4,
                progress = $5,
                fail_count = $6,
                fail_reason = $7,
                failed_at = $8,
                next_run_at = $9,
                last_modified_by = $10,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.last_run_at)
        .bind(job.last_finished_at)
        .bind(job.locked_at)
        .bind(job.progress)
        .bind(job.fail_count)
        .bind(&job.fail_reason)
        .bind(job.failed_at)
        .bind(job.next_run_at)
        .bind(&job.last_modified_by)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(job.id.to_string()));
        }
        Ok(())
    }
}
