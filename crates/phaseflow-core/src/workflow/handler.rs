//! Handler registry for `code` steps.
//!
//! The host registers handlers by identifier. A handler receives a snapshot of
//! the execution context and the value of the step's declared input key, and
//! returns the value to store under the step's output key.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use super::context::ExecutionContext;

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send + 'static>>;

/// A host-supplied `code` step implementation.
pub trait StepHandler: Send + Sync {
    fn call(&self, ctx: ExecutionContext, input: Option<Value>) -> HandlerFuture;
}

struct FnHandler<F>(F);

impl<F> StepHandler for FnHandler<F>
where
    F: Fn(&ExecutionContext, Option<Value>) -> Result<Value, HandlerError> + Send + Sync,
{
    fn call(&self, ctx: ExecutionContext, input: Option<Value>) -> HandlerFuture {
        let result = (self.0)(&ctx, input);
        Box::pin(async move { result })
    }
}

struct AsyncFnHandler<F>(F);

impl<F, Fut> StepHandler for AsyncFnHandler<F>
where
    F: Fn(ExecutionContext, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn call(&self, ctx: ExecutionContext, input: Option<Value>) -> HandlerFuture {
        Box::pin((self.0)(ctx, input))
    }
}

/// Lookup from handler identifier to implementation.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, handler: Arc<dyn StepHandler>) -> &mut Self {
        self.handlers.insert(id.into(), handler);
        self
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&mut self, id: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&ExecutionContext, Option<Value>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(id, Arc::new(FnHandler(f)))
    }

    /// Register an async closure, for handlers that do their own I/O.
    pub fn register_async<F, Fut>(&mut self, id: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(ExecutionContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(id, Arc::new(AsyncFnHandler(f)))
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.ids().collect();
        ids.sort_unstable();
        f.debug_struct("HandlerRegistry").field("handlers", &ids).finish()
    }
}
