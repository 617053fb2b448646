//! Filesystem Queue Backend: one file per Job Record, directory mtime
//! order standing in for a queue index, `fs2` advisory exclusive locks
//! guarding the read-modify-write race a SQL backend would otherwise
//! need a transaction for. Locking style is grounded on the daemon
//! lifecycle module in the reference pack that takes an exclusive,
//! non-blocking lock via `fs2::FileExt::try_lock_exclusive` before
//! touching a file another process might also be polling.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::{FailedJob, Job, JobId};

pub struct FilesystemBackend {
    root: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct StoredJob {
    id: String,
    queue: String,
    payload: Vec<u8>,
    attempts: u32,
    reserved_at: Option<chrono::DateTime<Utc>>,
    available_at: chrono::DateTime<Utc>,
    created_at: chrono::DateTime<Utc>,
}

impl From<&Job> for StoredJob {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.0.clone(),
            queue: job.queue.clone(),
            payload: job.payload.clone(),
            attempts: job.attempts,
            reserved_at: job.reserved_at,
            available_at: job.available_at,
            created_at: job.created_at,
        }
    }
}

impl From<StoredJob> for Job {
    fn from(s: StoredJob) -> Self {
        Job::rehydrate(
            JobId(s.id),
            s.queue,
            s.payload,
            s.attempts,
            s.reserved_at,
            s.available_at,
            s.created_at,
        )
    }
}

#[derive(Serialize, Deserialize)]
struct StoredFailedJob {
    id: String,
    queue: String,
    payload: Vec<u8>,
    exception: String,
    failed_at: chrono::DateTime<Utc>,
}

impl From<&FailedJob> for StoredFailedJob {
    fn from(f: &FailedJob) -> Self {
        Self {
            id: f.id.0.clone(),
            queue: f.queue.clone(),
            payload: f.payload.clone(),
            exception: f.exception.clone(),
            failed_at: f.failed_at,
        }
    }
}

impl From<StoredFailedJob> for FailedJob {
    fn from(s: StoredFailedJob) -> Self {
        FailedJob {
            id: JobId(s.id),
            queue: s.queue,
            payload: s.payload,
            exception: s.exception,
            failed_at: s.failed_at,
        }
    }
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join("failed"))?;
        Ok(Self { root })
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join(queue)
    }

    fn failed_dir(&self) -> PathBuf {
        self.root.join("failed")
    }

    fn job_path(&self, queue: &str, id: &JobId) -> PathBuf {
        self.queue_dir(queue).join(format!("{}.json", id.0))
    }

    fn failed_path(&self, id: &JobId) -> PathBuf {
        self.failed_dir().join(format!("{}.json", id.0))
    }
}

/// Write `bytes` to `path` via a sibling temp file, fsync, then rename;
/// a reader never observes a partially written file.
fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("job")
    ));
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Directory entries sorted by last-modified time ascending, oldest
/// (and therefore earliest-pushed, in the common case) first.
fn mtime_sorted_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        entries.push((modified, path));
    }
    entries.sort_by_key(|(modified, _)| *modified);
    Ok(entries.into_iter().map(|(_, path)| path).collect())
}

fn read_stored<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

async fn in_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::other(format!("filesystem backend task panicked: {}", e)))?
}

impl FilesystemBackend {
    fn push_sync(&self, queue: &str, payload: Vec<u8>, delay: Duration) -> Result<JobId> {
        let job = Job::fresh(queue, payload, delay);
        let stored = StoredJob::from(&job);
        let path = self.job_path(queue, &job.id);
        atomic_write(&path, &serde_json::to_vec(&stored)?)?;
        Ok(job.id)
    }

    fn pop_sync(&self, queue: &str, retry_after: Duration) -> Result<Option<Job>> {
        let dir = self.queue_dir(queue);
        let now = Utc::now();

        for path in mtime_sorted_entries(&dir)? {
            let file = match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(f) => f,
                Err(_) => continue,
            };
            if file.try_lock_exclusive().is_err() {
                continue;
            }

            let stored: StoredJob = match read_stored(&path) {
                Ok(s) => s,
                Err(_) => {
                    let _ = fs2::FileExt::unlock(&file);
                    continue;
                }
            };

            let stale = stored
                .reserved_at
                .map(|r| now - r >= retry_after)
                .unwrap_or(false);
            let eligible = (stored.reserved_at.is_none() || stale) && stored.available_at <= now;

            if !eligible {
                let _ = fs2::FileExt::unlock(&file);
                continue;
            }

            let mut job: Job = stored.into();
            job.attempts += 1;
            job.reserved_at = Some(now);

            let updated = StoredJob::from(&job);
            atomic_write(&path, &serde_json::to_vec(&updated)?)?;
            let _ = fs2::FileExt::unlock(&file);
            return Ok(Some(job));
        }

        Ok(None)
    }

    fn delete_sync(&self, queue: &str, id: &JobId) -> Result<()> {
        let path = self.job_path(queue, id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn release_sync(&self, queue: &str, id: &JobId, delay: Duration) -> Result<()> {
        let path = self.job_path(queue, id);
        let mut stored: StoredJob = read_stored(&path)?;
        stored.reserved_at = None;
        stored.available_at = Utc::now() + delay;
        atomic_write(&path, &serde_json::to_vec(&stored)?)?;
        Ok(())
    }

    fn fail_sync(&self, queue: &str, job: &Job, exception: String) -> Result<()> {
        let failed = FailedJob::new(job, exception);
        let stored = StoredFailedJob::from(&failed);
        atomic_write(&self.failed_path(&failed.id), &serde_json::to_vec(&stored)?)?;
        self.delete_sync(queue, &job.id)?;
        Ok(())
    }

    fn size_sync(&self, queue: &str) -> Result<u64> {
        let count = mtime_sorted_entries(&self.queue_dir(queue))?
            .into_iter()
            .filter_map(|path| read_stored::<StoredJob>(&path).ok())
            .filter(|stored| stored.reserved_at.is_none())
            .count();
        Ok(count as u64)
    }

    fn clear_sync(&self, queue: &str) -> Result<u64> {
        let entries = mtime_sorted_entries(&self.queue_dir(queue))?;
        let count = entries.len() as u64;
        for path in entries {
            fs::remove_file(path)?;
        }
        Ok(count)
    }

    fn get_failed_jobs_sync(&self, queue: Option<&str>) -> Result<Vec<FailedJob>> {
        let mut jobs: Vec<FailedJob> = mtime_sorted_entries(&self.failed_dir())?
            .into_iter()
            .filter_map(|path| read_stored::<StoredFailedJob>(&path).ok())
            .map(FailedJob::from)
            .filter(|f| queue.map(|q| q == f.queue).unwrap_or(true))
            .collect();
        jobs.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        Ok(jobs)
    }

    fn retry_failed_job_sync(&self, id: &JobId) -> Result<Option<Job>> {
        let path = self.failed_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let stored: StoredFailedJob = read_stored(&path)?;
        let failed: FailedJob = stored.into();
        fs::remove_file(&path)?;

        let job = failed.into_retried_job();
        let restored = StoredJob::from(&job);
        atomic_write(&self.job_path(&job.queue, &job.id), &serde_json::to_vec(&restored)?)?;
        Ok(Some(job))
    }

    fn forget_failed_job_sync(&self, id: &JobId) -> Result<bool> {
        let path = self.failed_path(id);
        if path.exists() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn clear_failed_jobs_sync(&self, queue: Option<&str>) -> Result<u64> {
        let mut count = 0u64;
        for path in mtime_sorted_entries(&self.failed_dir())? {
            let matches = match queue {
                None => true,
                Some(q) => read_stored::<StoredFailedJob>(&path)
                    .map(|s| s.queue == q)
                    .unwrap_or(false),
            };
            if matches {
                fs::remove_file(&path)?;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait::async_trait]
impl super::QueueBackend for FilesystemBackend {
    async fn push(&self, queue: &str, payload: Vec<u8>, delay: Duration) -> Result<JobId> {
        let root = self.root.clone();
        let queue = queue.to_string();
        in_blocking(move || FilesystemBackend { root }.push_sync(&queue, payload, delay)).await
    }

    async fn pop(&self, queue: &str, retry_after: Duration) -> Result<Option<Job>> {
        let root = self.root.clone();
        let queue = queue.to_string();
        in_blocking(move || FilesystemBackend { root }.pop_sync(&queue, retry_after)).await
    }

    async fn delete(&self, queue: &str, id: &JobId) -> Result<()> {
        let root = self.root.clone();
        let queue = queue.to_string();
        let id = id.clone();
        in_blocking(move || FilesystemBackend { root }.delete_sync(&queue, &id)).await
    }

    async fn release(&self, queue: &str, id: &JobId, delay: Duration) -> Result<()> {
        let root = self.root.clone();
        let queue = queue.to_string();
        let id = id.clone();
        in_blocking(move || FilesystemBackend { root }.release_sync(&queue, &id, delay)).await
    }

    async fn fail(&self, queue: &str, job: &Job, exception: String) -> Result<()> {
        let root = self.root.clone();
        let queue = queue.to_string();
        let job = job.clone();
        in_blocking(move || FilesystemBackend { root }.fail_sync(&queue, &job, exception)).await
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        let root = self.root.clone();
        let queue = queue.to_string();
        in_blocking(move || FilesystemBackend { root }.size_sync(&queue)).await
    }

    async fn clear(&self, queue: &str) -> Result<u64> {
        let root = self.root.clone();
        let queue = queue.to_string();
        in_blocking(move || FilesystemBackend { root }.clear_sync(&queue)).await
    }

    async fn get_failed_jobs(&self, queue: Option<&str>) -> Result<Vec<FailedJob>> {
        let root = self.root.clone();
        let queue = queue.map(|q| q.to_string());
        in_blocking(move || FilesystemBackend { root }.get_failed_jobs_sync(queue.as_deref())).await
    }

    async fn retry_failed_job(&self, id: &JobId) -> Result<Option<Job>> {
        let root = self.root.clone();
        let id = id.clone();
        in_blocking(move || FilesystemBackend { root }.retry_failed_job_sync(&id)).await
    }

    async fn forget_failed_job(&self, id: &JobId) -> Result<bool> {
        let root = self.root.clone();
        let id = id.clone();
        in_blocking(move || FilesystemBackend { root }.forget_failed_job_sync(&id)).await
    }

    async fn clear_failed_jobs(&self, queue: Option<&str>) -> Result<u64> {
        let root = self.root.clone();
        let queue = queue.map(|q| q.to_string());
        in_blocking(move || FilesystemBackend { root }.clear_failed_jobs_sync(queue.as_deref())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueBackend;

    fn backend() -> (FilesystemBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn push_then_pop_returns_one_attempt() {
        let (backend, _dir) = backend();
        backend.push("default", b"{}".to_vec(), Duration::zero()).await.unwrap();
        let job = backend.pop("default", Duration::seconds(90)).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn pop_does_not_return_the_same_job_twice() {
        let (backend, _dir) = backend();
        backend.push("default", b"{}".to_vec(), Duration::zero()).await.unwrap();
        let first = backend.pop("default", Duration::seconds(90)).await.unwrap();
        assert!(first.is_some());
        let second = backend.pop("default", Duration::seconds(90)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn stale_reservation_is_reclaimed() {
        let (backend, _dir) = backend();
        backend.push("default", b"{}".to_vec(), Duration::zero()).await.unwrap();
        backend.pop("default", Duration::zero()).await.unwrap();
        let reclaimed = backend.pop("default", Duration::zero()).await.unwrap();
        assert!(reclaimed.is_some());
        assert_eq!(reclaimed.unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn size_excludes_reserved_jobs() {
        let (backend, _dir) = backend();
        backend.push("default", b"{}".to_vec(), Duration::zero()).await.unwrap();
        backend.push("default", b"{}".to_vec(), Duration::zero()).await.unwrap();
        backend.pop("default", Duration::seconds(90)).await.unwrap();

        assert_eq!(backend.size("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fail_removes_from_queue_and_appears_in_failed_list() {
        let (backend, _dir) = backend();
        backend.push("default", b"{}".to_vec(), Duration::zero()).await.unwrap();
        let job = backend.pop("default", Duration::seconds(90)).await.unwrap().unwrap();
        backend.fail("default", &job, "boom".to_string()).await.unwrap();

        assert_eq!(backend.size("default").await.unwrap(), 0);
        let failed = backend.get_failed_jobs(None).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].exception, "boom");
    }

    #[tokio::test]
    async fn retry_failed_job_reinstates_it_with_zero_attempts() {
        let (backend, _dir) = backend();
        backend.push("default", b"{}".to_vec(), Duration::zero()).await.unwrap();
        let job = backend.pop("default", Duration::seconds(90)).await.unwrap().unwrap();
        backend.fail("default", &job, "boom".to_string()).await.unwrap();

        let failed = backend.get_failed_jobs(None).await.unwrap();
        let retried = backend.retry_failed_job(&failed[0].id).await.unwrap().unwrap();
        assert_eq!(retried.attempts, 0);
        assert_eq!(backend.size("default").await.unwrap(), 1);
    }
}
