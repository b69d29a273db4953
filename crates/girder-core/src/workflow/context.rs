//! Workflow context snapshots
//!
//! Each step receives an immutable snapshot of the submission parameters
//! plus the accumulated outputs of its completed predecessors. Snapshots
//! share storage behind an `Arc`; producing the next snapshot copies only
//! the output map, never the parameter values.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::id::RunId;
use crate::work::Params;

#[derive(Debug)]
struct ContextInner {
    workflow_name: String,
    run_id: RunId,
    params: Params,
    outputs: HashMap<String, Value>,
}

/// Immutable snapshot passed between steps
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    inner: Arc<ContextInner>,
}

impl WorkflowContext {
    pub fn new(workflow_name: impl Into<String>, run_id: RunId, params: Params) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                workflow_name: workflow_name.into(),
                run_id,
                params,
                outputs: HashMap::new(),
            }),
        }
    }

    pub fn workflow_name(&self) -> &str {
        &self.inner.workflow_name
    }

    pub fn run_id(&self) -> RunId {
        self.inner.run_id
    }

    pub fn params(&self) -> &Params {
        &self.inner.params
    }

    /// A submission parameter by name
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.inner.params.get(key)
    }

    /// All step outputs accumulated so far
    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.inner.outputs
    }

    /// The full output of a completed predecessor
    pub fn output(&self, step: &str) -> Option<&Value> {
        self.inner.outputs.get(step)
    }

    /// Read one key out of a predecessor's output, with a default.
    ///
    /// Returns `default` when the step has not produced output or its
    /// output is not an object containing `key`.
    pub fn get(&self, step: &str, key: &str, default: Value) -> Value {
        self.inner
            .outputs
            .get(step)
            .and_then(|out| out.get(key))
            .cloned()
            .unwrap_or(default)
    }

    /// Next snapshot with `step`'s output materialized
    pub fn with_output(&self, step: impl Into<String>, output: Value) -> Self {
        let mut outputs = self.inner.outputs.clone();
        outputs.insert(step.into(), output);
        Self {
            inner: Arc::new(ContextInner {
                workflow_name: self.inner.workflow_name.clone(),
                run_id: self.inner.run_id,
                params: self.inner.params.clone(),
                outputs,
            }),
        }
    }

    /// Next snapshot with extra parameters merged in (later keys win)
    pub fn with_params(&self, updates: Params) -> Self {
        let mut params = self.inner.params.clone();
        for (k, v) in updates {
            params.insert(k, v);
        }
        Self {
            inner: Arc::new(ContextInner {
                workflow_name: self.inner.workflow_name.clone(),
                run_id: self.inner.run_id,
                params,
                outputs: self.inner.outputs.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::params;
    use serde_json::json;

    fn ctx() -> WorkflowContext {
        WorkflowContext::new("wf", RunId::generate(), params([("n", json!(20))]))
    }

    #[test]
    fn test_snapshots_are_immutable() {
        let base = ctx();
        let next = base.with_output("fetch", json!({"rows": 3}));

        assert!(base.output("fetch").is_none());
        assert_eq!(next.output("fetch"), Some(&json!({"rows": 3})));
        assert_eq!(next.param("n"), Some(&json!(20)));
    }

    #[test]
    fn test_get_with_default() {
        let c = ctx().with_output("classify", json!({"big": true}));
        assert_eq!(c.get("classify", "big", json!(false)), json!(true));
        assert_eq!(c.get("classify", "missing", json!(0)), json!(0));
        assert_eq!(c.get("absent", "big", json!(false)), json!(false));
    }

    #[test]
    fn test_with_params_merges() {
        let c = ctx().with_params(params([("n", json!(5)), ("extra", json!("y"))]));
        assert_eq!(c.param("n"), Some(&json!(5)));
        assert_eq!(c.param("extra"), Some(&json!("y")));
    }

    #[test]
    fn test_predecessor_output_cannot_be_replaced_in_place() {
        let a = ctx().with_output("s", json!(1));
        let b = a.with_output("s", json!(2));
        // The earlier snapshot still sees the original value.
        assert_eq!(a.output("s"), Some(&json!(1)));
        assert_eq!(b.output("s"), Some(&json!(2)));
    }
}
