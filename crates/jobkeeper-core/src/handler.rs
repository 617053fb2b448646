//! Handler Registry: resolves a symbolic handler name to a freshly
//! constructed, invocable handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Map;
use serde_json::Value;

use crate::error::JobError;

/// Argument bag passed to a handler invocation.
pub type Args = Map<String, Value>;

/// Opaque result of a successful handler invocation.
pub type HandlerOutput = Value;

pub type HandlerResult = std::result::Result<HandlerOutput, JobError>;

/// A user-supplied unit of work. Handlers are constructed fresh for every
/// invocation by the registry's factory; they must not rely on in-process
/// state surviving across attempts.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Short symbolic name this handler reports, for diagnostics.
    fn name(&self) -> &str;

    /// Execute the handler against an argument bag.
    async fn call(&self, args: &Args) -> HandlerResult;
}

type Factory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// Maps a fully-qualified handler name to a constructor closure. No
/// caching: `resolve` builds a fresh handler on every call, matching the
/// donor's own per-invocation `JobHandler` construction (see the old
/// `JobContext`/`JobHandler` split), generalized to a host-supplied
/// factory instead of a runtime class lookup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    factories: HashMap<String, Factory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a handler name with a factory closure that builds a fresh
    /// instance on each call.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Handler> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Construct a fresh handler for `name`.
    pub fn resolve(&self, name: &str) -> std::result::Result<Box<dyn Handler>, JobError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| JobError::HandlerNotFound(name.to_string()))?;
        let handler = factory();
        if handler.name() != name {
            return Err(JobError::HandlerContractViolation(name.to_string()));
        }
        Ok(handler)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        async fn call(&self, args: &Args) -> HandlerResult {
            Ok(Value::Object(args.clone()))
        }
    }

    struct Mismatched;

    #[async_trait]
    impl Handler for Mismatched {
        fn name(&self) -> &str {
            "WrongName"
        }

        async fn call(&self, _args: &Args) -> HandlerResult {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn resolves_registered_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register("Echo", || Box::new(Echo));

        let handler = registry.resolve("Echo").unwrap();
        let mut args = Args::new();
        args.insert("x".to_string(), Value::from(1));
        let result = handler.call(&args).await.unwrap();
        assert_eq!(result, Value::Object(args));
    }

    #[test]
    fn unknown_handler_name_errors() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve("Nope").unwrap_err();
        assert!(matches!(err, JobError::HandlerNotFound(_)));
    }

    #[test]
    fn contract_violation_on_name_mismatch() {
        let mut registry = HandlerRegistry::new();
        registry.register("Mismatched", || Box::new(Mismatched));
        let err = registry.resolve("Mismatched").unwrap_err();
        assert!(matches!(err, JobError::HandlerContractViolation(_)));
    }
}
