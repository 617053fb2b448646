//! Database connection and status-summary helpers for the relational
//! backend. Table creation itself lives next to each dialect's queries
//! in `queue::relational::{postgres,mysql,sqlite}::ensure_schema`; this
//! module is the thin layer the CLI's `stats` command talks to,
//! generalizing the donor's `Migrator::status`/`DbStatus` summary away
//! from a fixed migration-table ledger and onto the queue tables this
//! crate actually owns.

use std::collections::HashMap;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::queue::relational::RelationalBackend;
use crate::queue::QueueBackend;

pub async fn connect(config: &DatabaseConfig) -> Result<RelationalBackend> {
    RelationalBackend::connect(config.adapter, &config.connection_url()).await
}

/// Point-in-time counts across the configured queues, for `jobkeeper
/// stats`.
#[derive(Debug, Clone, Default)]
pub struct DbStatus {
    pub pending_by_queue: HashMap<String, u64>,
    pub failed_total: u64,
}

pub async fn status(backend: &RelationalBackend, queues: &[String]) -> Result<DbStatus> {
    let mut pending_by_queue = HashMap::new();
    for queue in queues {
        pending_by_queue.insert(queue.clone(), backend.size(queue).await?);
    }
    let failed_total = backend.get_failed_jobs(None).await?.len() as u64;
    Ok(DbStatus {
        pending_by_queue,
        failed_total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseAdapter;

    #[tokio::test]
    async fn status_reports_pending_and_failed_counts() {
        let config = DatabaseConfig {
            adapter: DatabaseAdapter::Sqlite,
            name: ":memory:".to_string(),
            host: None,
            port: None,
            user: None,
            pass: None,
            charset: "utf8mb4".to_string(),
        };
        let backend = connect(&config).await.unwrap();
        backend.push("default", b"{}".to_vec(), chrono::Duration::zero()).await.unwrap();

        let status = status(&backend, &["default".to_string()]).await.unwrap();
        assert_eq!(status.pending_by_queue["default"], 1);
        assert_eq!(status.failed_total, 0);
    }
}
