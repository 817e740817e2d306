//! Action name to handler lookup.
//!
//! The handlers do the real browser work; this table only finds and
//! invokes them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, warn};

/// Trait implemented by every action handler.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run the action with its payload.
    async fn handle(&self, payload: Value) -> Result<Value, String>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send,
{
    async fn handle(&self, payload: Value) -> Result<Value, String> {
        (self.0)(payload).await
    }
}

/// Registry mapping action names to handlers.
pub struct ActionDispatchTable {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionDispatchTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any existing one for `action`.
    pub fn register(&mut self, action: &str, handler: impl ActionHandler + 'static) {
        if self
            .handlers
            .insert(action.to_owned(), Arc::new(handler))
            .is_some()
        {
            warn!(action, "replaced existing action handler");
        }
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, action: &str, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.register(action, FnHandler(f));
    }

    /// Remove a handler. Returns whether one was registered.
    pub fn unregister(&mut self, action: &str) -> bool {
        self.handlers.remove(action).is_some()
    }

    /// Remove every handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Run `action` with `payload`.
    pub async fn dispatch(&self, action: &str, payload: Value) -> Result<Value, String> {
        let Some(handler) = self.handlers.get(action).cloned() else {
            counter!(ACTION_DISPATCH_TOTAL, "action" => "unknown", "outcome" => "unknown").increment(1);
            let available = self.actions();
            let list = if available.is_empty() {
                "none".to_owned()
            } else {
                available.join(", ")
            };
            return Err(format!(
                "Unknown action: \"{action}\". Available actions: {list}"
            ));
        };

        let start = std::time::Instant::now();
        let result = handler.handle(payload).await;
        histogram!(ACTION_DURATION_SECONDS, "action" => action.to_owned())
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(value) => {
                counter!(ACTION_DISPATCH_TOTAL, "action" => action.to_owned(), "outcome" => "ok")
                    .increment(1);
                Ok(value)
            }
            Err(msg) => {
                counter!(ACTION_DISPATCH_TOTAL, "action" => action.to_owned(), "outcome" => "error")
                    .increment(1);
                debug!(action, error = %msg, "action handler failed");
                Err(format!("Action execution failed: {msg}"))
            }
        }
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `action` is registered.
    pub fn has_action(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no action is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for ActionDispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Actions dispatched, labelled by `action` and `outcome`.
pub const ACTION_DISPATCH_TOTAL: &str = "action_dispatch_total";
/// Handler run time.
pub const ACTION_DURATION_SECONDS: &str = "action_duration_seconds";
