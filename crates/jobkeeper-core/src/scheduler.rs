//! Cron-style scheduler: polls a set of named entries once a minute and
//! dispatches a job through the Queue Manager for each one that is due.
//! Dedup against the same minute firing twice is tracked in-process
//! only via `last_fired_minute` — it does not survive a restart, so a
//! crash-and-restart inside the same due minute may re-fire that
//! minute's jobs once.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Timelike, Utc};
use cron::Schedule;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::handler::Args;
use crate::manager::QueueManager;

pub struct ScheduleEntry {
    pub name: String,
    pub handler_class: String,
    pub cron_expr: String,
    pub args: Args,
    pub queue: Option<String>,
    schedule: Schedule,
}

/// One entry of the second, separate YAML document describing recurring
/// jobs (distinct from the application `Config`'s `queue`/`database`
/// sections): a top-level `schedule` map of entry name to
/// `{class, cron, args, queue}`.
#[derive(Debug, Deserialize)]
pub struct ScheduleFileEntry {
    pub class: String,
    pub cron: String,
    #[serde(default)]
    pub args: Args,
    #[serde(default)]
    pub queue: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleFile {
    pub schedule: HashMap<String, ScheduleFileEntry>,
}

/// Parse a standard 5-field cron expression (minute hour day-of-month
/// month day-of-week, Sunday=0) into the `cron` crate's `Schedule`,
/// which natively expects a leading seconds field.
fn parse_five_field(expr: &str) -> Result<Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::config(format!(
            "expected a 5-field cron expression, got {:?}",
            expr
        )));
    }
    let six_field = format!("0 {}", expr);
    Schedule::from_str(&six_field).map_err(|e| Error::config(format!("invalid cron expression {:?}: {}", expr, e)))
}

pub fn load_schedule_file(path: &str) -> Result<ScheduleFile> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read schedule file {}: {}", path, e)))?;
    Ok(serde_yaml::from_str(&contents)?)
}

pub struct Scheduler {
    manager: Arc<QueueManager>,
    events: Arc<EventBus>,
    entries: Vec<ScheduleEntry>,
    last_fired_minute: HashMap<String, i64>,
    debug: bool,
}

impl Scheduler {
    pub fn new(manager: Arc<QueueManager>, events: Arc<EventBus>) -> Self {
        Self {
            manager,
            events,
            entries: Vec::new(),
            last_fired_minute: HashMap::new(),
            debug: false,
        }
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Register a recurring entry. `cron_expr` is a standard 5-field
    /// cron string.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        handler_class: impl Into<String>,
        cron_expr: impl Into<String>,
        args: Args,
        queue: Option<String>,
    ) -> Result<()> {
        let cron_expr = cron_expr.into();
        let schedule = parse_five_field(&cron_expr)?;
        self.entries.push(ScheduleEntry {
            name: name.into(),
            handler_class: handler_class.into(),
            cron_expr,
            args,
            queue,
            schedule,
        });
        Ok(())
    }

    /// Load every entry from a schedule YAML document and register it.
    pub fn load_file(&mut self, path: &str) -> Result<()> {
        let file = load_schedule_file(path)?;
        for (name, entry) in file.schedule {
            self.add(name, entry.class, entry.cron, entry.args, entry.queue)?;
        }
        Ok(())
    }

    /// Check every entry against `now` and dispatch the due ones.
    /// Returns the number of entries that fired. An entry fires at most
    /// once per calendar minute: `last_fired_minute` guards against a
    /// tick loop that runs more than once inside the same minute from
    /// firing the same entry twice.
    pub async fn poll(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let current_minute = now.timestamp().div_euclid(60);
        let mut fired = 0usize;

        // `schedule` carries a pinned `0` seconds field (see
        // `parse_five_field`), so `includes` only ever matches a time
        // whose seconds/nanoseconds are themselves zero. Due-ness is
        // 5-field (minute) granularity, not 6-field (second), so check
        // against the start of `now`'s minute rather than `now` itself.
        let minute_start = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);

        for entry in &self.entries {
            if !entry.schedule.includes(minute_start) {
                continue;
            }
            if self.last_fired_minute.get(&entry.name) == Some(&current_minute) {
                continue;
            }

            if self.debug {
                tracing::debug!(entry = %entry.name, cron = %entry.cron_expr, "scheduler entry due");
            }

            match &entry.queue {
                None => {
                    // Inline invocation: run in the scheduler's own
                    // process, same as the donor's poll-loop jobs.
                    // Exceptions never abort the tick (§4.6) — only
                    // logged.
                    if let Err(err) = self.manager.dispatch_now(&entry.handler_class, entry.args.clone()).await {
                        tracing::error!(entry = %entry.name, error = %err, "scheduled job failed inline");
                    }
                }
                Some(queue) => {
                    self.manager
                        .dispatch(Some(queue.as_str()), &entry.handler_class, entry.args.clone(), chrono::Duration::zero())
                        .await?;
                }
            }

            self.events.emit(Event::SchedulerJobTriggered {
                name: entry.name.clone(),
                handler_class: entry.handler_class.clone(),
                cron: entry.cron_expr.clone(),
                queue: entry.queue.clone(),
            });

            self.last_fired_minute.insert(entry.name.clone(), current_minute);
            fired += 1;
        }

        Ok(fired)
    }

    /// Poll once a minute (or on the given `tick`) forever. `tick`
    /// should normally divide a minute evenly; any interval is
    /// accepted since `poll` is itself idempotent within a minute.
    pub async fn run_forever(&mut self, tick: StdDuration) -> Result<()> {
        loop {
            self.poll(Utc::now()).await?;
            tokio::time::sleep(tick).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseAdapter;
    use crate::handler::{Handler, HandlerRegistry, HandlerResult};
    use crate::manager::QueueManagerConfig;
    use crate::queue::relational::RelationalBackend;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    async fn scheduler_with_manager(counter: Arc<AtomicUsize>) -> Scheduler {
        let mut registry = HandlerRegistry::new();
        let clone = counter.clone();
        registry.register("Counting", move || Box::new(CountingHandler(clone.clone())));

        let backend = RelationalBackend::connect(DatabaseAdapter::Sqlite, "sqlite::memory:")
            .await
            .unwrap();
        let manager = Arc::new(QueueManager::new(
            Arc::new(backend),
            Arc::new(registry),
            Arc::new(EventBus::new()),
            QueueManagerConfig::default(),
        ));
        Scheduler::new(manager, Arc::new(EventBus::new()))
    }

    #[test]
    fn rejects_expressions_without_exactly_five_fields() {
        assert!(parse_five_field("* * * *").is_err());
        assert!(parse_five_field("* * * * * *").is_err());
        assert!(parse_five_field("*/5 * * * *").is_ok());
    }

    #[tokio::test]
    async fn due_entry_fires_exactly_once_per_minute_across_repeated_polls() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = scheduler_with_manager(counter.clone()).await;
        scheduler.add("every-minute", "Counting", "* * * * *", Args::new(), None).unwrap();

        let now = Utc.with_ymd_and_hms(2026, 7, 27, 10, 0, 0).unwrap();
        assert_eq!(scheduler.poll(now).await.unwrap(), 1);
        assert_eq!(scheduler.poll(now + chrono::Duration::seconds(10)).await.unwrap(), 0);
        assert_eq!(scheduler.poll(now + chrono::Duration::seconds(59)).await.unwrap(), 0);

        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let next_minute = now + chrono::Duration::minutes(1);
        assert_eq!(scheduler.poll(next_minute).await.unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_matching_entry_never_fires() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = scheduler_with_manager(counter.clone()).await;
        scheduler.add("midnight-only", "Counting", "0 0 * * *", Args::new(), None).unwrap();

        let noon = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        assert_eq!(scheduler.poll(noon).await.unwrap(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn poll_reports_fire_count_across_minute_boundaries() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = scheduler_with_manager(counter.clone()).await;
        scheduler.add("A", "Counting", "* * * * *", Args::new(), None).unwrap();

        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
        assert_eq!(scheduler.poll(t0).await.unwrap(), 1);

        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 45).unwrap();
        assert_eq!(scheduler.poll(t1).await.unwrap(), 0);

        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 5).unwrap();
        assert_eq!(scheduler.poll(t2).await.unwrap(), 1);
    }
}
