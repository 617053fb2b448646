//! Worker run loop: polls its configured queues in priority order,
//! processing one job at a time, until asked to stop. Shutdown is
//! cooperative — a `Worker` never aborts a job mid-flight; it finishes
//! the current `process_next_job` call and then exits the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use uuid::Uuid;

use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::manager::QueueManager;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues polled in order; the first with an available job wins
    /// each iteration, so earlier entries get priority.
    pub queues: Vec<String>,
    /// How long to sleep after a pass over every queue finds nothing.
    pub poll_interval: StdDuration,
    /// Stop after this many successful (or failed-but-handled) jobs.
    /// `0` means unbounded.
    pub max_jobs: u64,
    /// Exit the first time a full pass over every queue finds nothing,
    /// instead of sleeping and trying again.
    pub stop_when_empty: bool,
    /// Soft timeout hint surfaced to handlers/supervisors; the worker
    /// never kills a handler for exceeding it (see module docs on
    /// cooperative shutdown).
    pub timeout: Option<StdDuration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            poll_interval: StdDuration::from_secs(3),
            max_jobs: 0,
            stop_when_empty: false,
            timeout: None,
        }
    }
}

/// Cooperative shutdown handle shared between the worker loop and
/// whatever installs the OS signal handlers.
#[derive(Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Worker {
    id: String,
    manager: Arc<QueueManager>,
    events: Arc<EventBus>,
    config: WorkerConfig,
    shutdown: ShutdownSignal,
}

impl Worker {
    pub fn new(manager: Arc<QueueManager>, events: Arc<EventBus>, config: WorkerConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            manager,
            events,
            config,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Install handlers for SIGTERM/SIGINT that trigger this worker's
    /// shutdown signal. Runs as a background task; callers do not
    /// need to await anything to arm it.
    pub fn install_signal_handlers(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            shutdown.trigger();
        });
    }

    /// Run until the shutdown signal is set. Processes at most one job
    /// per loop iteration, polling queues in configured priority order.
    pub async fn run(&self) -> Result<u64> {
        self.events.emit(Event::WorkerStarted {
            worker_id: self.id.clone(),
            queues: self.config.queues.clone(),
        });

        let mut jobs_processed = 0u64;

        'outer: loop {
            if self.shutdown.is_triggered() {
                break;
            }

            let mut worked_this_pass = false;
            for queue in &self.config.queues {
                if self.manager.process_next_job(queue).await? {
                    worked_this_pass = true;
                    jobs_processed += 1;
                    if self.config.max_jobs > 0 && jobs_processed >= self.config.max_jobs {
                        break 'outer;
                    }
                    // restart the scan from the highest-priority queue
                    continue 'outer;
                }
            }

            if !worked_this_pass {
                if self.config.stop_when_empty {
                    break;
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        self.events.emit(Event::WorkerStopped {
            worker_id: self.id.clone(),
            jobs_processed,
        });

        Ok(jobs_processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::config::DatabaseAdapter;
    use crate::handler::{Args, Handler, HandlerRegistry, HandlerResult};
    use crate::manager::QueueManagerConfig;
    use crate::queue::relational::RelationalBackend;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for CountingHandler {
        fn name(&self) -> &str {
            "Counting"
        }

        async fn call(&self, _args: &Args) -> HandlerResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn run_drains_queue_then_stops_on_shutdown_signal() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter_clone = counter.clone();
        registry.register("Counting", move || Box::new(CountingHandler(counter_clone.clone())));

        let backend = RelationalBackend::connect(DatabaseAdapter::Sqlite, "sqlite::memory:")
            .await
            .unwrap();
        let events = Arc::new(EventBus::new());
        let manager = Arc::new(QueueManager::new(
            Arc::new(backend),
            Arc::new(registry),
            events.clone(),
            QueueManagerConfig::default(),
        ));

        for _ in 0..3 {
            manager.dispatch(None, "Counting", Args::new(), Duration::zero()).await.unwrap();
        }

        let worker = Worker::new(
            manager.clone(),
            events,
            WorkerConfig {
                queues: vec!["default".to_string()],
                poll_interval: StdDuration::from_millis(10),
                ..WorkerConfig::default()
            },
        );
        let shutdown = worker.shutdown_signal();

        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
            shutdown.trigger();
        });

        let processed = worker.run().await.unwrap();
        assert_eq!(processed, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    async fn manager_with_three_jobs(counter: Arc<AtomicUsize>) -> Arc<QueueManager> {
        let mut registry = HandlerRegistry::new();
        let counter_clone = counter.clone();
        registry.register("Counting", move || Box::new(CountingHandler(counter_clone.clone())));

        let backend = RelationalBackend::connect(DatabaseAdapter::Sqlite, "sqlite::memory:")
            .await
            .unwrap();
        let manager = Arc::new(QueueManager::new(
            Arc::new(backend),
            Arc::new(registry),
            Arc::new(EventBus::new()),
            QueueManagerConfig::default(),
        ));
        for _ in 0..3 {
            manager.dispatch(None, "Counting", Args::new(), Duration::zero()).await.unwrap();
        }
        manager
    }

    #[tokio::test]
    async fn stop_when_empty_exits_without_a_shutdown_signal() {
        let counter = Arc::new(AtomicUsize::new(0));
        let manager = manager_with_three_jobs(counter.clone()).await;

        let worker = Worker::new(
            manager,
            Arc::new(EventBus::new()),
            WorkerConfig {
                queues: vec!["default".to_string()],
                poll_interval: StdDuration::from_secs(30),
                stop_when_empty: true,
                ..WorkerConfig::default()
            },
        );

        let processed = worker.run().await.unwrap();
        assert_eq!(processed, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn max_jobs_stops_the_worker_after_that_many_successes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let manager = manager_with_three_jobs(counter.clone()).await;

        let worker = Worker::new(
            manager,
            Arc::new(EventBus::new()),
            WorkerConfig {
                queues: vec!["default".to_string()],
                poll_interval: StdDuration::from_secs(30),
                max_jobs: 2,
                ..WorkerConfig::default()
            },
        );

        let processed = worker.run().await.unwrap();
        assert_eq!(processed, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
