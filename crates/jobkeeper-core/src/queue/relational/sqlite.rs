//! SQLite dialect of the relational backend.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::job::{FailedJob, Job, JobId};

pub async fn create_pool(url: &str) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    Ok(pool)
}

pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            payload BLOB NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            reserved_at TEXT,
            available_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_queue_available ON jobs (queue, available_at);

        CREATE TABLE IF NOT EXISTS failed_jobs (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            payload BLOB NOT NULL,
            exception TEXT NOT NULL,
            failed_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn push(pool: &SqlitePool, queue: &str, payload: Vec<u8>, delay: Duration) -> Result<JobId> {
    let job = Job::fresh(queue, payload, delay);
    sqlx::query(
        "INSERT INTO jobs (id, queue, payload, attempts, reserved_at, available_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(job.id.0.clone())
    .bind(&job.queue)
    .bind(&job.payload)
    .bind(job.attempts as i64)
    .bind(job.reserved_at)
    .bind(job.available_at)
    .bind(job.created_at)
    .execute(pool)
    .await?;
    Ok(job.id)
}

pub async fn pop(pool: &SqlitePool, queue: &str, retry_after: Duration) -> Result<Option<Job>> {
    let now = Utc::now();
    let stale_before = now - retry_after;

    sqlx::query(
        "UPDATE jobs SET reserved_at = NULL
         WHERE queue = ?1 AND reserved_at IS NOT NULL AND reserved_at < ?2",
    )
    .bind(queue)
    .bind(stale_before)
    .execute(pool)
    .await?;

    for _ in 0..5 {
        let candidate = sqlx::query(
            "SELECT id FROM jobs
             WHERE queue = ?1 AND reserved_at IS NULL AND available_at <= ?2
             ORDER BY available_at ASC LIMIT 1",
        )
        .bind(queue)
        .bind(now)
        .fetch_optional(pool)
        .await?;

        let Some(row) = candidate else {
            return Ok(None);
        };
        let id: String = row.get("id");

        let result = sqlx::query(
            "UPDATE jobs SET reserved_at = ?1, attempts = attempts + 1
             WHERE id = ?2 AND reserved_at IS NULL",
        )
        .bind(now)
        .bind(&id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            continue;
        }

        let row = sqlx::query(
            "SELECT id, queue, payload, attempts, reserved_at, available_at, created_at
             FROM jobs WHERE id = ?1",
        )
        .bind(&id)
        .fetch_one(pool)
        .await?;

        return Ok(Some(row_to_job(row)));
    }

    Ok(None)
}

pub async fn delete(pool: &SqlitePool, queue: &str, id: &JobId) -> Result<()> {
    sqlx::query("DELETE FROM jobs WHERE id = ?1 AND queue = ?2")
        .bind(&id.0)
        .bind(queue)
        .execute(pool)
        .await?;
    Ok(())
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Job {
    let id: String = row.get("id");
    let queue: String = row.get("queue");
    let payload: Vec<u8> = row.get("payload");
    let attempts: i64 = row.get("attempts");
    let reserved_at: Option<DateTime<Utc>> = row.get("reserved_at");
    let available_at: DateTime<Utc> = row.get("available_at");
    let created_at: DateTime<Utc> = row.get("created_at");
    Job::rehydrate(
        JobId(id),
        queue,
        payload,
        attempts as u32,
        reserved_at,
        available_at,
        created_at,
    )
}

pub async fn release(pool: &SqlitePool, queue: &str, id: &JobId, delay: Duration) -> Result<()> {
    let available_at = Utc::now() + delay;
    sqlx::query(
        "UPDATE jobs SET reserved_at = NULL, available_at = ?1 WHERE id = ?2 AND queue = ?3",
    )
    .bind(available_at)
    .bind(&id.0)
    .bind(queue)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fail(pool: &SqlitePool, queue: &str, job: &Job, exception: String) -> Result<()> {
    let failed = FailedJob::new(job, exception);
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO failed_jobs (id, queue, payload, exception, failed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(&failed.id.0)
    .bind(&failed.queue)
    .bind(&failed.payload)
    .bind(&failed.exception)
    .bind(failed.failed_at)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM jobs WHERE id = ?1 AND queue = ?2")
        .bind(&job.id.0)
        .bind(queue)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn size(pool: &SqlitePool, queue: &str) -> Result<u64> {
    let row = sqlx::query("SELECT COUNT(*) as count FROM jobs WHERE queue = ?1 AND reserved_at IS NULL")
        .bind(queue)
        .fetch_one(pool)
        .await?;
    let count: i64 = row.get("count");
    Ok(count as u64)
}

pub async fn clear(pool: &SqlitePool, queue: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM jobs WHERE queue = ?1")
        .bind(queue)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn get_failed_jobs(pool: &SqlitePool, queue: Option<&str>) -> Result<Vec<FailedJob>> {
    let rows = if let Some(queue) = queue {
        sqlx::query(
            "SELECT id, queue, payload, exception, failed_at FROM failed_jobs
             WHERE queue = ?1 ORDER BY failed_at DESC",
        )
        .bind(queue)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query("SELECT id, queue, payload, exception, failed_at FROM failed_jobs ORDER BY failed_at DESC")
            .fetch_all(pool)
            .await?
    };

    Ok(rows.into_iter().map(row_to_failed_job).collect())
}

fn row_to_failed_job(row: sqlx::sqlite::SqliteRow) -> FailedJob {
    FailedJob {
        id: JobId(row.get("id")),
        queue: row.get("queue"),
        payload: row.get("payload"),
        exception: row.get("exception"),
        failed_at: row.get("failed_at"),
    }
}

pub async fn retry_failed_job(pool: &SqlitePool, id: &JobId) -> Result<Option<Job>> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query("SELECT id, queue, payload, exception, failed_at FROM failed_jobs WHERE id = ?1")
        .bind(&id.0)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let failed = row_to_failed_job(row);

    sqlx::query("DELETE FROM failed_jobs WHERE id = ?1")
        .bind(&id.0)
        .execute(&mut *tx)
        .await?;

    let job = failed.into_retried_job();
    sqlx::query(
        "INSERT INTO jobs (id, queue, payload, attempts, reserved_at, available_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(&job.id.0)
    .bind(&job.queue)
    .bind(&job.payload)
    .bind(job.attempts as i64)
    .bind(job.reserved_at)
    .bind(job.available_at)
    .bind(job.created_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(Some(job))
}

pub async fn forget_failed_job(pool: &SqlitePool, id: &JobId) -> Result<bool> {
    let result = sqlx::query("DELETE FROM failed_jobs WHERE id = ?1")
        .bind(&id.0)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn clear_failed_jobs(pool: &SqlitePool, queue: Option<&str>) -> Result<u64> {
    let result = if let Some(queue) = queue {
        sqlx::query("DELETE FROM failed_jobs WHERE queue = ?1")
            .bind(queue)
            .execute(pool)
            .await?
    } else {
        sqlx::query("DELETE FROM failed_jobs").execute(pool).await?
    };
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        ensure_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn push_then_pop_returns_the_job_with_one_attempt() {
        let pool = memory_pool().await;
        push(&pool, "default", b"{}".to_vec(), Duration::zero())
            .await
            .unwrap();

        let job = pop(&pool, "default", Duration::seconds(90))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.is_reserved());
    }

    #[tokio::test]
    async fn pop_does_not_return_a_freshly_reserved_job_twice() {
        let pool = memory_pool().await;
        push(&pool, "default", b"{}".to_vec(), Duration::zero())
            .await
            .unwrap();

        let first = pop(&pool, "default", Duration::seconds(90)).await.unwrap();
        assert!(first.is_some());
        let second = pop(&pool, "default", Duration::seconds(90)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn stale_reservation_is_swept_back_to_pending() {
        let pool = memory_pool().await;
        push(&pool, "default", b"{}".to_vec(), Duration::zero())
            .await
            .unwrap();
        pop(&pool, "default", Duration::zero()).await.unwrap();

        let reclaimed = pop(&pool, "default", Duration::zero()).await.unwrap();
        assert!(reclaimed.is_some());
        assert_eq!(reclaimed.unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn size_counts_only_unreserved_jobs() {
        let pool = memory_pool().await;
        push(&pool, "default", b"{}".to_vec(), Duration::zero()).await.unwrap();
        push(&pool, "default", b"{}".to_vec(), Duration::zero()).await.unwrap();
        pop(&pool, "default", Duration::seconds(90)).await.unwrap();

        assert_eq!(size(&pool, "default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fail_moves_job_into_failed_storage() {
        let pool = memory_pool().await;
        push(&pool, "default", b"{}".to_vec(), Duration::zero())
            .await
            .unwrap();
        let job = pop(&pool, "default", Duration::seconds(90))
            .await
            .unwrap()
            .unwrap();

        fail(&pool, "default", &job, "boom".to_string())
            .await
            .unwrap();

        assert_eq!(size(&pool, "default").await.unwrap(), 0);
        let failed = get_failed_jobs(&pool, None).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].exception, "boom");
    }
}
