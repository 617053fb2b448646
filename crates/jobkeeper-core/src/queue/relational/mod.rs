//! Relational Queue Backend: one SQL table holding Pending/Reserved
//! records, one holding failed records, across three sqlx dialects. The
//! donor's parallel `postgres`/`sqlite` submodules (each implementing
//! the same repository trait against its own `sqlx::Pool<T>`) are
//! generalized here into an enum-of-pools, since `PgPool`/`MySqlPool`/
//! `SqlitePool` are genuinely distinct Rust types sqlx does not unify
//! behind one generic connection type without an extra abstraction
//! layer this crate has no other use for.

pub mod mysql;
pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use chrono::Duration;

use crate::config::DatabaseAdapter;
use crate::error::Result;
use crate::job::{FailedJob, Job, JobId};
use crate::queue::QueueBackend;

/// Relational backend, holding a live pool for whichever dialect the
/// `database.adapter` configuration key names.
pub enum RelationalBackend {
    Postgres(::sqlx::PgPool),
    Mysql(::sqlx::MySqlPool),
    Sqlite(::sqlx::SqlitePool),
}

impl RelationalBackend {
    /// Connect and ensure the `jobs`/`failed_jobs` tables exist.
    pub async fn connect(adapter: DatabaseAdapter, url: &str) -> Result<Self> {
        match adapter {
            DatabaseAdapter::Pgsql => {
                let pool = postgres::create_pool(url).await?;
                postgres::ensure_schema(&pool).await?;
                Ok(Self::Postgres(pool))
            }
            DatabaseAdapter::Mysql => {
                let pool = mysql::create_pool(url).await?;
                mysql::ensure_schema(&pool).await?;
                Ok(Self::Mysql(pool))
            }
            DatabaseAdapter::Sqlite => {
                let pool = sqlite::create_pool(url).await?;
                sqlite::ensure_schema(&pool).await?;
                Ok(Self::Sqlite(pool))
            }
        }
    }
}

#[async_trait]
impl QueueBackend for RelationalBackend {
    async fn push(&self, queue: &str, payload: Vec<u8>, delay: Duration) -> Result<JobId> {
        match self {
            Self::Postgres(pool) => postgres::push(pool, queue, payload, delay).await,
            Self::Mysql(pool) => mysql::push(pool, queue, payload, delay).await,
            Self::Sqlite(pool) => sqlite::push(pool, queue, payload, delay).await,
        }
    }

    async fn pop(&self, queue: &str, retry_after: Duration) -> Result<Option<Job>> {
        match self {
            Self::Postgres(pool) => postgres::pop(pool, queue, retry_after).await,
            Self::Mysql(pool) => mysql::pop(pool, queue, retry_after).await,
            Self::Sqlite(pool) => sqlite::pop(pool, queue, retry_after).await,
        }
    }

    async fn delete(&self, queue: &str, id: &JobId) -> Result<()> {
        match self {
            Self::Postgres(pool) => postgres::delete(pool, queue, id).await,
            Self::Mysql(pool) => mysql::delete(pool, queue, id).await,
            Self::Sqlite(pool) => sqlite::delete(pool, queue, id).await,
        }
    }

    async fn release(&self, queue: &str, id: &JobId, delay: Duration) -> Result<()> {
        match self {
            Self::Postgres(pool) => postgres::release(pool, queue, id, delay).await,
            Self::Mysql(pool) => mysql::release(pool, queue, id, delay).await,
            Self::Sqlite(pool) => sqlite::release(pool, queue, id, delay).await,
        }
    }

    async fn fail(&self, queue: &str, job: &Job, exception: String) -> Result<()> {
        match self {
            Self::Postgres(pool) => postgres::fail(pool, queue, job, exception).await,
            Self::Mysql(pool) => mysql::fail(pool, queue, job, exception).await,
            Self::Sqlite(pool) => sqlite::fail(pool, queue, job, exception).await,
        }
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        match self {
            Self::Postgres(pool) => postgres::size(pool, queue).await,
            Self::Mysql(pool) => mysql::size(pool, queue).await,
            Self::Sqlite(pool) => sqlite::size(pool, queue).await,
        }
    }

    async fn clear(&self, queue: &str) -> Result<u64> {
        match self {
            Self::Postgres(pool) => postgres::clear(pool, queue).await,
            Self::Mysql(pool) => mysql::clear(pool, queue).await,
            Self::Sqlite(pool) => sqlite::clear(pool, queue).await,
        }
    }

    async fn get_failed_jobs(&self, queue: Option<&str>) -> Result<Vec<FailedJob>> {
        match self {
            Self::Postgres(pool) => postgres::get_failed_jobs(pool, queue).await,
            Self::Mysql(pool) => mysql::get_failed_jobs(pool, queue).await,
            Self::Sqlite(pool) => sqlite::get_failed_jobs(pool, queue).await,
        }
    }

    async fn retry_failed_job(&self, id: &JobId) -> Result<Option<Job>> {
        match self {
            Self::Postgres(pool) => postgres::retry_failed_job(pool, id).await,
            Self::Mysql(pool) => mysql::retry_failed_job(pool, id).await,
            Self::Sqlite(pool) => sqlite::retry_failed_job(pool, id).await,
        }
    }

    async fn forget_failed_job(&self, id: &JobId) -> Result<bool> {
        match self {
            Self::Postgres(pool) => postgres::forget_failed_job(pool, id).await,
            Self::Mysql(pool) => mysql::forget_failed_job(pool, id).await,
            Self::Sqlite(pool) => sqlite::forget_failed_job(pool, id).await,
        }
    }

    async fn clear_failed_jobs(&self, queue: Option<&str>) -> Result<u64> {
        match self {
            Self::Postgres(pool) => postgres::clear_failed_jobs(pool, queue).await,
            Self::Mysql(pool) => mysql::clear_failed_jobs(pool, queue).await,
            Self::Sqlite(pool) => sqlite::clear_failed_jobs(pool, queue).await,
        }
    }
}
