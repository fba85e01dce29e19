//! Task Handler Registry
//!
//! Maps handler names (e.g. "word_count") to async Rust closures. A forked
//! sub-task only carries the name and its JSON arguments; every worker node
//! registers the same names at startup and looks the code up here.

use anyhow::Result;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for a thread-safe, asynchronous task handler function.
/// It takes the sub-task arguments and resolves to the result payload.
pub type TaskHandlerFn =
    Arc<dyn Fn(Vec<Value>) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Registry holding the mapping between handler names and their implementation.
pub struct TaskHandlerRegistry {
    handlers: DashMap<String, TaskHandlerFn>,
}

impl TaskHandlerRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a handler under `handler_name`, replacing any previous one.
    pub fn register<F, Fut>(&self, handler_name: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        // Box::pin erases the concrete future type so different async
        // functions fit in the same map.
        let handler_fn: TaskHandlerFn = Arc::new(move |args: Vec<Value>| {
            Box::pin(handler(args)) as Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        });

        self.handlers.insert(handler_name.to_string(), handler_fn);

        tracing::info!("Registered task handler: {}", handler_name);
    }

    /// Looks up `handler_name` without running it.
    pub fn get(&self, handler_name: &str) -> Option<TaskHandlerFn> {
        self.handlers
            .get(handler_name)
            .map(|entry| entry.value().clone())
    }

    /// Runs the handler registered as `handler_name` with `args`.
    ///
    /// # Returns
    /// * `Ok(value)` with the handler's result payload.
    /// * `Err` if the handler failed or no handler exists for the name.
    pub async fn execute(&self, handler_name: &str, args: Vec<Value>) -> Result<Value> {
        // Clone the Arc out so the map shard is not locked while the handler runs.
        let Some(handler_fn) = self.get(handler_name) else {
            let error = format!("Unknown task handler: {}", handler_name);
            tracing::error!("{}", error);
            return Err(anyhow::anyhow!(error));
        };

        tracing::debug!(
            "Executing handler '{}' with {} argument(s)",
            handler_name,
            args.len()
        );
        handler_fn(args).await
    }

    /// Returns a sorted list of all registered handler names.
    pub fn list_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn has_handler(&self, handler_name: &str) -> bool {
        self.handlers.contains_key(handler_name)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}
