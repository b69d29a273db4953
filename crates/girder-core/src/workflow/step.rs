//! Workflow steps
//!
//! A step is a named node inside a workflow with no embedded logic of its
//! own: operations delegate to registered handlers, lambdas to in-process
//! closures, and the structural kinds (choice, wait, map) to the runner.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::retry::RetryPolicy;
use crate::workflow::context::WorkflowContext;
use crate::workflow::result::StepResult;

/// In-process step body
pub type LambdaFn = Arc<dyn Fn(&WorkflowContext) -> StepResult + Send + Sync>;

/// Predicate evaluated by choice steps
pub type PredicateFn = Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>;

/// Expression producing the items a map step iterates
pub type ItemsFn = Arc<dyn Fn(&WorkflowContext) -> Vec<Value> + Send + Sync>;

/// What to do when a step fails after its retries are exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Fail the workflow
    #[default]
    Stop,

    /// Record the failure and keep going
    Continue,
}

/// Type-specific payload of a step
#[derive(Clone)]
pub enum StepKind {
    /// Delegates to a registered handler by name
    Operation { handler: String },

    /// In-process closure invoked with the context snapshot.
    ///
    /// Lambdas are single-invocation: they cannot be resumed from a cold
    /// process, so tracked workflows should keep durable work in
    /// operations.
    Lambda { func: LambdaFn },

    /// Evaluates a predicate and routes to one of two steps
    Choice {
        predicate: PredicateFn,
        then_step: String,
        else_step: String,
    },

    /// Sleeps for the given duration, honoring deadlines
    Wait { duration: Duration },

    /// Evaluates an items expression and runs the nested steps once per
    /// item in a child context carrying the item
    Map { items: ItemsFn, steps: Vec<Step> },
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation { handler } => {
                f.debug_struct("Operation").field("handler", handler).finish()
            }
            Self::Lambda { .. } => f.debug_struct("Lambda").finish_non_exhaustive(),
            Self::Choice {
                then_step,
                else_step,
                ..
            } => f
                .debug_struct("Choice")
                .field("then_step", then_step)
                .field("else_step", else_step)
                .finish_non_exhaustive(),
            Self::Wait { duration } => f.debug_struct("Wait").field("duration", duration).finish(),
            Self::Map { steps, .. } => f
                .debug_struct("Map")
                .field("steps", &steps.len())
                .finish_non_exhaustive(),
        }
    }
}

/// A named node inside a workflow
#[derive(Debug, Clone)]
pub struct Step {
    /// Unique within the workflow
    pub name: String,

    pub kind: StepKind,

    /// Predecessor step names. Empty means "previous sibling" in
    /// sequential mode and "root" in parallel mode.
    pub depends_on: Vec<String>,

    pub error_policy: ErrorPolicy,

    /// Per-step override; falls back to the workflow, then the runner
    pub retry_policy: Option<RetryPolicy>,

    pub timeout_seconds: Option<u64>,
}

impl Step {
    fn with_kind(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            depends_on: vec![],
            error_policy: ErrorPolicy::default(),
            retry_policy: None,
            timeout_seconds: None,
        }
    }

    /// Operation step whose handler shares the step name
    pub fn operation(name: impl Into<String>) -> Self {
        let name = name.into();
        let handler = name.clone();
        Self::with_kind(name, StepKind::Operation { handler })
    }

    /// Operation step with an explicit handler name
    pub fn operation_as(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            StepKind::Operation {
                handler: handler.into(),
            },
        )
    }

    /// Step backed by an in-process closure
    pub fn lambda<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&WorkflowContext) -> StepResult + Send + Sync + 'static,
    {
        Self::with_kind(
            name,
            StepKind::Lambda {
                func: Arc::new(func),
            },
        )
    }

    /// Step backed by a plain function pointer
    pub fn function(name: impl Into<String>, func: fn(&WorkflowContext) -> StepResult) -> Self {
        Self::with_kind(
            name,
            StepKind::Lambda {
                func: Arc::new(func),
            },
        )
    }

    /// Conditional routing step
    pub fn choice<P>(
        name: impl Into<String>,
        predicate: P,
        then_step: impl Into<String>,
        else_step: impl Into<String>,
    ) -> Self
    where
        P: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        Self::with_kind(
            name,
            StepKind::Choice {
                predicate: Arc::new(predicate),
                then_step: then_step.into(),
                else_step: else_step.into(),
            },
        )
    }

    /// Deadline-aware sleep step
    pub fn wait(name: impl Into<String>, duration: Duration) -> Self {
        Self::with_kind(name, StepKind::Wait { duration })
    }

    /// Fan a nested step list over a computed item sequence
    pub fn map<F>(name: impl Into<String>, items: F, steps: Vec<Step>) -> Self
    where
        F: Fn(&WorkflowContext) -> Vec<Value> + Send + Sync + 'static,
    {
        Self::with_kind(
            name,
            StepKind::Map {
                items: Arc::new(items),
                steps,
            },
        )
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
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

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}
