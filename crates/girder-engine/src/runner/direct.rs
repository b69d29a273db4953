//! Direct in-process Runnable
//!
//! Resolves operation steps straight from a handler registry, bypassing
//! the dispatcher and the ledger. Useful for local workflow execution
//! and tests; production workflows usually run against the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use girder_core::{HandlerRegistry, Params, RunId, WorkError, WorkKind};

use super::Runnable;

/// Runs operations by direct handler invocation
pub struct DirectRunnable {
    registry: Arc<HandlerRegistry>,
}

impl DirectRunnable {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Runnable for DirectRunnable {
    async fn run_operation(
        &self,
        name: &str,
        params: Params,
        _parent: RunId,
    ) -> Result<Value, WorkError> {
        let handler = self
            .registry
            .get(WorkKind::Operation, name)
            .or_else(|| self.registry.get(WorkKind::Task, name))
            .ok_or_else(|| {
                WorkError::config(format!("no handler registered for operation {name}"))
            })?;
        handler.call(params).await
    }
}
