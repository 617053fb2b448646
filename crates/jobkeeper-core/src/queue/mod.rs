//! Queue Backend contract shared by the relational, filesystem, and
//! synchronous backends, plus the enum that dispatches to whichever one
//! is configured.

pub mod filesystem;
pub mod relational;
pub mod sync;

use async_trait::async_trait;
use chrono::Duration;

use crate::error::Result;
use crate::job::{FailedJob, Job, JobId};

/// Storage contract a Queue Manager drives. Implementations own the
/// atomicity of `pop` (I1: two concurrent pops on the same queue never
/// return the same Job Record) and the visibility-timeout sweep (I3).
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Insert a new Pending record, available after `delay`.
    async fn push(&self, queue: &str, payload: Vec<u8>, delay: Duration) -> Result<JobId>;

    /// Atomically reserve and return the oldest available record on
    /// `queue`, incrementing its attempts counter (I4). Records whose
    /// reservation has outlived `retry_after` are swept back to Pending
    /// before selection (I3). Returns `None` when nothing is available.
    async fn pop(&self, queue: &str, retry_after: Duration) -> Result<Option<Job>>;

    /// Release a successfully processed record: deletes it permanently.
    async fn delete(&self, queue: &str, id: &JobId) -> Result<()>;

    /// Clear a record's reservation without deleting it, making it
    /// immediately available again (used when a handler fails but the
    /// job has not yet reached `max_attempts`).
    async fn release(&self, queue: &str, id: &JobId, delay: Duration) -> Result<()>;

    /// Move a record to failed storage and delete it from `queue` (I5).
    async fn fail(&self, queue: &str, job: &Job, exception: String) -> Result<()>;

    /// Count of Pending (unreserved, available-or-delayed) records on
    /// `queue`. Reserved records are excluded — they are already in a
    /// worker's hands, not sitting in the queue.
    async fn size(&self, queue: &str) -> Result<u64>;

    /// Delete every record on `queue`, Pending or Reserved.
    async fn clear(&self, queue: &str) -> Result<u64>;

    /// List failed records, newest first.
    async fn get_failed_jobs(&self, queue: Option<&str>) -> Result<Vec<FailedJob>>;

    /// Re-enqueue a failed record as a fresh Pending Job Record, deleting
    /// it from failed storage.
    async fn retry_failed_job(&self, id: &JobId) -> Result<Option<Job>>;

    /// Permanently delete a failed record without retrying it.
    async fn forget_failed_job(&self, id: &JobId) -> Result<bool>;

    /// Delete every failed record, optionally scoped to one queue.
    async fn clear_failed_jobs(&self, queue: Option<&str>) -> Result<u64>;
}
