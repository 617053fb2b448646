pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod handler;
pub mod job;
pub mod manager;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use config::{Config, DatabaseAdapter, DatabaseConfig, QueueConfig, QueueDriver};
pub use error::{Error, JobError, Result};
pub use events::{Event, EventBus, EventListener, TracingListener};
pub use handler::{Args, Handler, HandlerRegistry, HandlerResult};
pub use job::{FailedJob, Job, JobId, Payload};
pub use manager::{QueueManager, QueueManagerConfig};
pub use queue::filesystem::FilesystemBackend;
pub use queue::relational::RelationalBackend;
pub use queue::sync::SyncBackend;
pub use queue::QueueBackend;
pub use scheduler::{ScheduleEntry, ScheduleFile, ScheduleFileEntry, Scheduler};
pub use worker::{ShutdownSignal, Worker, WorkerConfig};

/// Current version of jobkeeper-core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_available() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn error_creation_helpers_work() {
        let err = Error::config("bad setting");
        assert_eq!(err.category(), "config");
    }
}
