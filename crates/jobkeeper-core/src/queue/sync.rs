//! Synchronous Queue Backend: `push` runs the resolved handler inline
//! on the caller's task instead of persisting anything, matching the
//! donor's dead-letter "do it now, no queueing machinery" escape hatch
//! used in its own test and local-dev configurations. `pop` therefore
//! always reports nothing pending: nothing was ever durably queued.

use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::handler::HandlerRegistry;
use crate::job::{FailedJob, Job, JobId, Payload};
use crate::queue::QueueBackend;

/// Executes a job's handler the instant it is pushed, on the calling
/// task. Useful for tests and for small deployments that want
/// at-most-once, zero-latency execution with no storage dependency.
pub struct SyncBackend {
    registry: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
}

impl SyncBackend {
    pub fn new(registry: Arc<HandlerRegistry>, events: Arc<EventBus>) -> Self {
        Self { registry, events }
    }
}

#[async_trait]
impl QueueBackend for SyncBackend {
    async fn push(&self, queue: &str, payload: Vec<u8>, _delay: Duration) -> Result<JobId> {
        let id = JobId::new();
        let decoded = Payload::decode(&payload)?;
        let handler = self.registry.resolve(&decoded.class)?;

        let started = std::time::Instant::now();
        match handler.call(&decoded.args).await {
            Ok(_) => {
                self.events.emit(Event::JobProcessed {
                    handler: decoded.class,
                    args: decoded.args,
                    queue: queue.to_string(),
                    execution_seconds: started.elapsed().as_secs_f64(),
                });
            }
            Err(err) => {
                self.events.emit(Event::JobMaxAttemptsReached {
                    handler: decoded.class,
                    args: decoded.args,
                    queue: queue.to_string(),
                    error: err.to_string(),
                    max_attempts: 1,
                });
                return Err(Error::from(err));
            }
        }

        Ok(id)
    }

    async fn pop(&self, _queue: &str, _retry_after: Duration) -> Result<Option<Job>> {
        Ok(None)
    }

    async fn delete(&self, _queue: &str, _id: &JobId) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _queue: &str, _id: &JobId, _delay: Duration) -> Result<()> {
        Ok(())
    }

    async fn fail(&self, _queue: &str, _job: &Job, _exception: String) -> Result<()> {
        Ok(())
    }

    async fn size(&self, _queue: &str) -> Result<u64> {
        Ok(0)
    }

    async fn clear(&self, _queue: &str) -> Result<u64> {
        Ok(0)
    }

    async fn get_failed_jobs(&self, _queue: Option<&str>) -> Result<Vec<FailedJob>> {
        Ok(Vec::new())
    }

    async fn retry_failed_job(&self, _id: &JobId) -> Result<Option<Job>> {
        Ok(None)
    }

    async fn forget_failed_job(&self, _id: &JobId) -> Result<bool> {
        Ok(false)
    }

    async fn clear_failed_jobs(&self, _queue: Option<&str>) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Args, Handler, HandlerResult};
    use async_trait::async_trait as async_trait_attr;
    use serde_json::Value;

    struct Noop;

    #[async_trait_attr]
    impl Handler for Noop {
        fn name(&self) -> &str {
            "Noop"
        }

        async fn call(&self, _args: &Args) -> HandlerResult {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn push_executes_immediately_and_never_leaves_anything_pending() {
        let mut registry = HandlerRegistry::new();
        registry.register("Noop", || Box::new(Noop));
        let backend = SyncBackend::new(Arc::new(registry), Arc::new(EventBus::new()));

        let payload = Payload::new("Noop", Args::new()).encode().unwrap();
        backend.push("default", payload, Duration::zero()).await.unwrap();

        assert_eq!(backend.size("default").await.unwrap(), 0);
        assert!(backend.pop("default", Duration::zero()).await.unwrap().is_none());
    }
}
