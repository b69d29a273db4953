//! Workflow blueprints

use serde::{Deserialize, Serialize};

use crate::registry::HandlerRegistry;
use crate::retry::RetryPolicy;
use crate::work::{Params, WorkKind};
use crate::workflow::graph::{validate_steps, WorkflowBuildError};
use crate::workflow::step::{Step, StepKind};

/// How the runner schedules steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Declaration order; each step sees all prior outputs
    #[default]
    Sequential,

    /// Topological order with bounded concurrency
    Parallel,
}

/// Immutable blueprint: an ordered or DAG-shaped composition of steps
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,

    pub domain: Option<String>,

    pub steps: Vec<Step>,

    pub mode: ExecutionMode,

    /// Default parameters merged under the submission parameters
    pub defaults: Params,

    /// Workflow-wide retry default; steps may override
    pub retry_policy: Option<RetryPolicy>,

    pub timeout_seconds: Option<u64>,

    /// Concurrency cap for parallel mode; the runner default applies when
    /// absent
    pub max_concurrency: Option<usize>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: None,
            steps: vec![],
            mode: ExecutionMode::default(),
            defaults: Params::new(),
            retry_policy: None,
            timeout_seconds: None,
            max_concurrency: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn add_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_defaults(mut self, defaults: Params) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max.max(1));
        self
    }

    /// Merge submission params over the workflow defaults
    pub fn merged_params(&self, params: &Params) -> Params {
        let mut merged = self.defaults.clone();
        for (k, v) in params {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Structural validation: unique names, resolvable references, acyclic
    pub fn validate(&self) -> Result<(), WorkflowBuildError> {
        validate_steps(&self.steps)
    }

    /// Non-fatal checks against a registry. Unregistered handlers are
    /// warnings because lazy registration is allowed.
    pub fn lint(&self, registry: &HandlerRegistry) -> Vec<String> {
        let mut warnings = vec![];
        for step in &self.steps {
            if let StepKind::Operation { handler } = &step.kind {
                if !registry.has(WorkKind::Operation, handler)
                    && !registry.has(WorkKind::Task, handler)
                {
                    warnings.push(format!(
                        "step {} references unregistered handler {}",
                        step.name, handler
                    ));
                }
            }
        }
        warnings
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_seconds.map(std::time::Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::handler_fn;
    use crate::work::params;
    use serde_json::json;

    #[test]
    fn test_merged_params_prefers_submission() {
        let wf = Workflow::new("wf").with_defaults(params([
            ("region", json!("us")),
            ("limit", json!(10)),
        ]));
        let merged = wf.merged_params(&params([("limit", json!(50))]));
        assert_eq!(merged["region"], json!("us"));
        assert_eq!(merged["limit"], json!(50));
    }

    #[test]
    fn test_validate_catches_cycle() {
        let wf = Workflow::new("wf")
            .add_step(Step::operation("a").with_depends_on(["b"]))
            .add_step(Step::operation("b").with_depends_on(["a"]));
        assert_eq!(wf.validate(), Err(WorkflowBuildError::Cycle));
    }

    #[test]
    fn test_lint_flags_unregistered_handlers() {
        let registry = HandlerRegistry::new();
        registry
            .register_operation("known", handler_fn(|_| Ok(json!(null))))
            .unwrap();

        let wf = Workflow::new("wf")
            .add_step(Step::operation("known"))
            .add_step(Step::operation("unknown"));

        let warnings = wf.lint(&registry);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("unknown"));
    }
}
