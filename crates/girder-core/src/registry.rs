//! Handler registry
//!
//! Maps (kind, name) to the code that executes a named unit of work.
//! Registration is explicit: a startup function takes a registry handle
//! and inserts its handlers, so there are no import-time side effects and
//! tests can hand each case a fresh registry.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::WorkError;
use crate::work::{Params, WorkKind};

/// The code behind a named unit of work
///
/// Synchronous and asynchronous functions both satisfy this through the
/// `handler_fn` / `async_handler_fn` adapters.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, params: Params) -> Result<Value, WorkError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&Params) -> Result<Value, WorkError> + Send + Sync + 'static,
{
    async fn call(&self, params: Params) -> Result<Value, WorkError> {
        (self.0)(&params)
    }
}

/// Adapt a synchronous function into a handler
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&Params) -> Result<Value, WorkError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for AsyncFnHandler<F>
where
    F: Fn(Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, WorkError>> + Send + 'static,
{
    async fn call(&self, params: Params) -> Result<Value, WorkError> {
        (self.0)(params).await
    }
}

/// Adapt an async function into a handler
pub fn async_handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, WorkError>> + Send + 'static,
{
    Arc::new(AsyncFnHandler(f))
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// (kind, name) already registered and replace was not requested
    #[error("handler already registered: {kind}:{name}")]
    DuplicateHandler { kind: WorkKind, name: String },
}

/// Thread-safe name → handler lookup, namespaced by kind
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<(WorkKind, String), Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler; fails if (kind, name) is taken
    pub fn register(
        &self,
        kind: WorkKind,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&(kind, name.clone())) {
            return Err(RegistryError::DuplicateHandler { kind, name });
        }
        handlers.insert((kind, name), handler);
        Ok(())
    }

    /// Register a handler, replacing any existing registration
    pub fn register_replacing(
        &self,
        kind: WorkKind,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) {
        self.handlers.write().insert((kind, name.into()), handler);
    }

    pub fn register_task(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        self.register(WorkKind::Task, name, handler)
    }

    pub fn register_operation(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        self.register(WorkKind::Operation, name, handler)
    }

    pub fn register_container(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        self.register(WorkKind::Container, name, handler)
    }

    pub fn get(&self, kind: WorkKind, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .get(&(kind, name.to_string()))
            .cloned()
    }

    pub fn has(&self, kind: WorkKind, name: &str) -> bool {
        self.handlers.read().contains_key(&(kind, name.to_string()))
    }

    /// All registered (kind, name) pairs
    pub fn list(&self) -> Vec<(WorkKind, String)> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Remove every registration; for test isolation
    pub fn reset(&self) {
        self.handlers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.list())
            .finish()
    }
}
