//! Example handlers registered by the CLI binary so `worker run` and
//! `scheduler run` have something to invoke out of the box. A real
//! deployment embeds `jobkeeper-core` in its own binary and registers
//! its own handlers instead of these.

use async_trait::async_trait;
use jobkeeper_core::{Args, Handler, HandlerRegistry, HandlerResult, JobError};
use serde_json::Value;
use tracing::info;

struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    fn name(&self) -> &str {
        "Log"
    }

    async fn call(&self, args: &Args) -> HandlerResult {
        info!(args = ?args, "Log handler invoked");
        Ok(Value::Object(args.clone()))
    }
}

struct SleepHandler;

#[async_trait]
impl Handler for SleepHandler {
    fn name(&self) -> &str {
        "Sleep"
    }

    async fn call(&self, args: &Args) -> HandlerResult {
        let millis = args
            .get("millis")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
        Ok(Value::Null)
    }
}

struct FailHandler;

#[async_trait]
impl Handler for FailHandler {
    fn name(&self) -> &str {
        "Fail"
    }

    async fn call(&self, args: &Args) -> HandlerResult {
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("job configured to always fail")
            .to_string();
        Err(JobError::HandlerFailure(message))
    }
}

pub fn register_demo_handlers(registry: &mut HandlerRegistry) {
    registry.register("Log", || Box::new(LogHandler));
    registry.register("Sleep", || Box::new(SleepHandler));
    registry.register("Fail", || Box::new(FailHandler));
}
