//! Queue Manager: the façade handlers and callers actually talk to.
//! Turns a `dispatch` call into an encoded Payload pushed onto a
//! backend, and turns a backend `pop` into a handler invocation plus
//! the retry/backoff/failure bookkeeping the backend itself does not
//! know about.

use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;

use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::handler::{Args, HandlerRegistry};
use crate::job::{Job, JobId, Payload};
use crate::queue::QueueBackend;

#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    pub default_queue: String,
    pub retry_after: Duration,
    pub max_attempts: u32,
    /// Base backoff in seconds; `0` disables backoff (released jobs
    /// become available immediately). Actual delay is
    /// `backoff * 2^(attempts-1)`, capped at one hour.
    pub backoff_seconds: u64,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            retry_after: Duration::seconds(90),
            max_attempts: 3,
            backoff_seconds: 0,
        }
    }
}

const MAX_BACKOFF_SECONDS: u64 = 3600;

pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    config: QueueManagerConfig,
}

impl QueueManager {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        registry: Arc<HandlerRegistry>,
        events: Arc<EventBus>,
        config: QueueManagerConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            events,
            config,
        }
    }

    pub fn default_queue(&self) -> &str {
        &self.config.default_queue
    }

    /// Enqueue `class` with `args`, available after `delay`.
    pub async fn dispatch(
        &self,
        queue: Option<&str>,
        class: &str,
        args: Args,
        delay: Duration,
    ) -> Result<JobId> {
        let queue = queue.unwrap_or(&self.config.default_queue);
        let payload = Payload::new(class, args).encode()?;
        self.backend.push(queue, payload, delay).await
    }

    /// Resolve `class` and invoke it synchronously on the caller's task,
    /// bypassing the backend entirely: nothing is persisted, no
    /// reservation is taken, no retry/backoff applies. The handler's own
    /// result is returned directly. Used by hosts that want in-process
    /// execution regardless of the configured driver, and by the
    /// Scheduler for entries with no `queue` set.
    pub async fn dispatch_now(&self, class: &str, args: Args) -> Result<crate::handler::HandlerOutput> {
        let handler = self.registry.resolve(class)?;
        Ok(handler.call(&args).await?)
    }

    /// Reserve and execute one job from `queue`. Returns `false` when
    /// there was nothing available.
    pub async fn process_next_job(&self, queue: &str) -> Result<bool> {
        let Some(job) = self.backend.pop(queue, self.config.retry_after).await? else {
            return Ok(false);
        };

        let payload = match job.decode_payload() {
            Ok(p) => p,
            Err(err) => {
                self.handle_failure(queue, &job, "<undecodable>", Args::new(), err.to_string())
                    .await?;
                return Ok(true);
            }
        };

        let handler = match self.registry.resolve(&payload.class) {
            Ok(h) => h,
            Err(err) => {
                self.handle_failure(queue, &job, &payload.class, payload.args, err.to_string())
                    .await?;
                return Ok(true);
            }
        };

        let started = Instant::now();
        match handler.call(&payload.args).await {
            Ok(_) => {
                self.backend.delete(queue, &job.id).await?;
                self.events.emit(Event::JobProcessed {
                    handler: payload.class,
                    args: payload.args,
                    queue: queue.to_string(),
                    execution_seconds: started.elapsed().as_secs_f64(),
                });
            }
            Err(err) => {
                self.handle_failure(queue, &job, &payload.class, payload.args, err.to_string())
                    .await?;
            }
        }

        Ok(true)
    }

    async fn handle_failure(
        &self,
        queue: &str,
        job: &Job,
        handler_name: &str,
        args: Args,
        error: String,
    ) -> Result<()> {
        if job.attempts >= self.config.max_attempts {
            self.backend.fail(queue, job, error.clone()).await?;
            self.events.emit(Event::JobMaxAttemptsReached {
                handler: handler_name.to_string(),
                args,
                queue: queue.to_string(),
                error,
                max_attempts: self.config.max_attempts,
            });
        } else {
            let delay = self.backoff_for(job.attempts);
            self.backend.release(queue, &job.id, delay).await?;
            self.events.emit(Event::JobFailed {
                handler: handler_name.to_string(),
                args,
                queue: queue.to_string(),
                error,
                attempts: job.attempts,
            });
        }
        Ok(())
    }

    /// `backoff * 2^(attempts-1)`, capped at one hour. `attempts` is
    /// the count reported by the backend after `pop` incremented it,
    /// so the first failure (`attempts == 1`) backs off by exactly
    /// `backoff_seconds`.
    fn backoff_for(&self, attempts: u32) -> Duration {
        if self.config.backoff_seconds == 0 {
            return Duration::zero();
        }
        let exponent = attempts.saturating_sub(1).min(32);
        let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let seconds = self
            .config
            .backoff_seconds
            .saturating_mul(multiplier)
            .min(MAX_BACKOFF_SECONDS);
        Duration::seconds(seconds as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, HandlerResult};
    use crate::queue::relational::RelationalBackend;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysFails;

    #[async_trait]
    impl Handler for AlwaysFails {
        fn name(&self) -> &str {
            "AlwaysFails"
        }

        async fn call(&self, _args: &Args) -> HandlerResult {
            Err(crate::error::JobError::HandlerFailure("boom".to_string()))
        }
    }

    struct CountingSuccess(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for CountingSuccess {
        fn name(&self) -> &str {
            "CountingSuccess"
        }

        async fn call(&self, _args: &Args) -> HandlerResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    async fn manager_with(config: QueueManagerConfig, registry: HandlerRegistry) -> QueueManager {
        let backend = RelationalBackend::connect(crate::config::DatabaseAdapter::Sqlite, "sqlite::memory:")
            .await
            .unwrap();
        QueueManager::new(Arc::new(backend), Arc::new(registry), Arc::new(EventBus::new()), config)
    }

    #[tokio::test]
    async fn dispatch_now_bypasses_the_backend_and_returns_the_handler_result() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter_clone = counter.clone();
        registry.register("CountingSuccess", move || Box::new(CountingSuccess(counter_clone.clone())));

        let manager = manager_with(QueueManagerConfig::default(), registry).await;
        let result = manager.dispatch_now("CountingSuccess", Args::new()).await.unwrap();

        assert_eq!(result, Value::Null);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // nothing was ever pushed to the backend
        assert!(!manager.process_next_job("default").await.unwrap());
    }

    #[tokio::test]
    async fn successful_job_is_deleted_after_processing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter_clone = counter.clone();
        registry.register("CountingSuccess", move || Box::new(CountingSuccess(counter_clone.clone())));

        let manager = manager_with(QueueManagerConfig::default(), registry).await;
        manager
            .dispatch(None, "CountingSuccess", Args::new(), Duration::zero())
            .await
            .unwrap();

        assert!(manager.process_next_job("default").await.unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!manager.process_next_job("default").await.unwrap());
    }

    #[tokio::test]
    async fn failing_job_is_retried_until_max_attempts_then_moved_to_failed() {
        let mut registry = HandlerRegistry::new();
        registry.register("AlwaysFails", || Box::new(AlwaysFails));

        let config = QueueManagerConfig {
            max_attempts: 2,
            retry_after: Duration::seconds(90),
            backoff_seconds: 0,
            ..QueueManagerConfig::default()
        };
        let manager = manager_with(config, registry).await;
        manager.dispatch(None, "AlwaysFails", Args::new(), Duration::zero()).await.unwrap();

        assert!(manager.process_next_job("default").await.unwrap());
        assert!(manager.process_next_job("default").await.unwrap());
        assert!(!manager.process_next_job("default").await.unwrap());
    }

    #[test]
    fn backoff_doubles_per_attempt_and_caps_at_one_hour() {
        let manager_config = QueueManagerConfig {
            backoff_seconds: 60,
            ..QueueManagerConfig::default()
        };
        let manager = QueueManager {
            backend: Arc::new(NeverUsed),
            registry: Arc::new(HandlerRegistry::new()),
            events: Arc::new(EventBus::new()),
            config: manager_config,
        };

        assert_eq!(manager.backoff_for(1), Duration::seconds(60));
        assert_eq!(manager.backoff_for(2), Duration::seconds(120));
        assert_eq!(manager.backoff_for(3), Duration::seconds(240));
        assert_eq!(manager.backoff_for(20), Duration::seconds(MAX_BACKOFF_SECONDS as i64));
    }

    struct NeverUsed;

    #[async_trait]
    impl QueueBackend for NeverUsed {
        async fn push(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<JobId> {
            unimplemented!()
        }
        async fn pop(&self, _: &str, _: Duration) -> Result<Option<Job>> {
            unimplemented!()
        }
        async fn delete(&self, _: &str, _: &JobId) -> Result<()> {
            unimplemented!()
        }
        async fn release(&self, _: &str, _: &JobId, _: Duration) -> Result<()> {
            unimplemented!()
        }
        async fn fail(&self, _: &str, _: &Job, _: String) -> Result<()> {
            unimplemented!()
        }
        async fn size(&self, _: &str) -> Result<u64> {
            unimplemented!()
        }
        async fn clear(&self, _: &str) -> Result<u64> {
            unimplemented!()
        }
        async fn get_failed_jobs(&self, _: Option<&str>) -> Result<Vec<crate::job::FailedJob>> {
            unimplemented!()
        }
        async fn retry_failed_job(&self, _: &JobId) -> Result<Option<Job>> {
            unimplemented!()
        }
        async fn forget_failed_job(&self, _: &JobId) -> Result<bool> {
            unimplemented!()
        }
        async fn clear_failed_jobs(&self, _: Option<&str>) -> Result<u64> {
            unimplemented!()
        }
    }
}
