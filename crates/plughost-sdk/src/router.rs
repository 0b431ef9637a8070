//! Closure-based [`Guest`] keyed by handler name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::guest::{Guest, HookContext, Invocation};

type Handler =
    Arc<dyn Fn(Invocation, HookContext) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Dispatches invocations to closures registered per handler name.
///
/// ```ignore
/// let guest = HandlerRouter::new()
///     .on("init", |_call, _ctx| async { Ok(Value::Null) })
///     .on("attached", |call, ctx| async move {
///         ctx.host().publish("devices", call.payload).await.map_err(|e| e.to_string())?;
///         Ok(Value::Null)
///     });
/// ```
#[derive(Default, Clone)]
pub struct HandlerRouter {
    handlers: HashMap<String, Handler>,
}

impl HandlerRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` for `handler`, replacing any earlier registration.
    #[must_use]
    pub fn on<F, Fut>(mut self, handler: impl Into<String>, f: F) -> Self
    where
        F: Fn(Invocation, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler_fn: Handler = Arc::new(move |call, ctx| Box::pin(f(call, ctx)));
        self.handlers.insert(handler.into(), handler_fn);
        self
    }

    /// Registered handler names, sorted.
    #[must_use]
    pub fn handler_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRouter")
            .field("handlers", &self.handler_names())
            .finish()
    }
}

#[async_trait]
impl Guest for HandlerRouter {
    async fn on_invoke(&self, call: Invocation, ctx: HookContext) -> Result<Value, String> {
        let Some(handler) = self.handlers.get(&call.handler).map(Arc::clone) else {
            return Err(format!("no handler named `{}`", call.handler));
        };
        handler(call, ctx).await
    }
}
