//! Observability hooks. Event delivery is best-effort and synchronous
//! from the emitter's point of view: a listener must never block record
//! cleanup, so `EventListener::handle` is a plain synchronous call, not
//! an async one.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::handler::Args;

#[derive(Debug, Clone)]
pub enum Event {
    JobProcessed {
        handler: String,
        args: Args,
        queue: String,
        execution_seconds: f64,
    },
    JobFailed {
        handler: String,
        args: Args,
        queue: String,
        error: String,
        attempts: u32,
    },
    JobMaxAttemptsReached {
        handler: String,
        args: Args,
        queue: String,
        error: String,
        max_attempts: u32,
    },
    SchedulerJobTriggered {
        name: String,
        handler_class: String,
        cron: String,
        queue: Option<String>,
    },
    WorkerStarted {
        worker_id: String,
        queues: Vec<String>,
    },
    WorkerStopped {
        worker_id: String,
        jobs_processed: u64,
    },
}

/// Pluggable hook invoked around queue/worker/scheduler operations. The
/// donor's `JobMiddleware` chain (before/after/on_failure) is the same
/// shape generalized here into a single ordered list of listeners keyed
/// on one `Event` enum rather than three separate async callbacks.
pub trait EventListener: Send + Sync {
    fn handle(&self, event: &Event);
}

/// Default listener: logs each event via `tracing` at the severity the
/// donor's own `jobs/*.rs` files use for equivalent conditions
/// (`info!` for success/lifecycle, `warn!` for a retry, `error!` for a
/// terminal failure).
pub struct TracingListener;

impl EventListener for TracingListener {
    fn handle(&self, event: &Event) {
        match event {
            Event::JobProcessed {
                handler,
                queue,
                execution_seconds,
                ..
            } => {
                info!(
                    handler = %handler,
                    queue = %queue,
                    execution_seconds,
                    "job processed"
                );
            }
            Event::JobFailed {
                handler,
                queue,
                error,
                attempts,
                ..
            } => {
                warn!(
                    handler = %handler,
                    queue = %queue,
                    error = %error,
                    attempts,
                    "job failed, will retry"
                );
            }
            Event::JobMaxAttemptsReached {
                handler,
                queue,
                error,
                max_attempts,
                ..
            } => {
                error!(
                    handler = %handler,
                    queue = %queue,
                    error = %error,
                    max_attempts,
                    "job reached max attempts, moved to failed storage"
                );
            }
            Event::SchedulerJobTriggered {
                name,
                handler_class,
                cron,
                queue,
            } => {
                info!(
                    name = %name,
                    handler_class = %handler_class,
                    cron = %cron,
                    queue = ?queue,
                    "scheduler entry triggered"
                );
            }
            Event::WorkerStarted { worker_id, queues } => {
                info!(worker_id = %worker_id, queues = ?queues, "worker started");
            }
            Event::WorkerStopped {
                worker_id,
                jobs_processed,
            } => {
                info!(worker_id = %worker_id, jobs_processed, "worker stopped");
            }
        }
    }
}

/// Ordered list of listeners invoked synchronously, in registration
/// order. Never panics a caller: a listener's own panic is not caught
/// here (the donor doesn't catch_unwind around its middleware either),
/// but a listener that simply does nothing destructive cannot prevent
/// record cleanup since `emit` never influences control flow.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn with_default_tracing() -> Self {
        let mut bus = Self::new();
        bus.register(Arc::new(TracingListener));
        bus
    }

    pub fn register(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub fn emit(&self, event: Event) {
        for listener in &self.listeners {
            listener.handle(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingListener(Mutex<Vec<String>>);

    impl EventListener for RecordingListener {
        fn handle(&self, event: &Event) {
            let label = match event {
                Event::JobProcessed { .. } => "processed",
                Event::JobFailed { .. } => "failed",
                Event::JobMaxAttemptsReached { .. } => "max_attempts",
                Event::SchedulerJobTriggered { .. } => "triggered",
                Event::WorkerStarted { .. } => "started",
                Event::WorkerStopped { .. } => "stopped",
            };
            self.0.lock().unwrap().push(label.to_string());
        }
    }

    #[test]
    fn bus_delivers_to_all_registered_listeners_in_order() {
        let recorder = Arc::new(RecordingListener(Mutex::new(Vec::new())));
        let mut bus = EventBus::new();
        bus.register(recorder.clone());

        bus.emit(Event::WorkerStarted {
            worker_id: "w1".to_string(),
            queues: vec!["default".to_string()],
        });
        bus.emit(Event::WorkerStopped {
            worker_id: "w1".to_string(),
            jobs_processed: 4,
        });

        let seen = recorder.0.lock().unwrap();
        assert_eq!(*seen, vec!["started", "stopped"]);
    }
}
