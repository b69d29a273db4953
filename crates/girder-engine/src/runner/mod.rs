//! Workflow runner
//!
//! Drives a workflow blueprint to completion: sequential declaration
//! order or a parallel topological schedule with bounded concurrency.
//! Each step runs through the same pipeline: effective retry policy
//! (step → workflow → runner default), effective deadline (tightest of
//! step, workflow, and caller), and the step's error policy.

pub mod direct;
pub mod tracked;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use girder_core::workflow::{
    ErrorPolicy, ExecutionMode, Step, StepDisposition, StepKind, StepOutcome, StepRecord,
    StepResult, Workflow, WorkflowContext, WorkflowResult, WorkflowStatus,
};
use girder_core::{
    params, ErrorCategory, Handler, HandlerRegistry, Params, RegistryError, RetryDecision,
    RetryPolicy, RunId, WorkError, WorkKind,
};

use crate::deadline::{sleep_within, Deadline};

/// Something that can execute a named operation: typically the
/// dispatcher, or [`direct::DirectRunnable`] for in-process execution.
#[async_trait]
pub trait Runnable: Send + Sync + 'static {
    /// Run the operation to completion and return its output. `parent`
    /// is the invoking workflow's run id, recorded on sub-runs.
    async fn run_operation(
        &self,
        name: &str,
        params: Params,
        parent: RunId,
    ) -> Result<Value, WorkError>;
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Concurrency cap for parallel mode when the workflow sets none
    pub max_concurrency: usize,

    /// Step retry default when neither step nor workflow carries one
    pub default_retry: RetryPolicy,

    /// Step deadline default when the step carries none
    pub default_step_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_retry: RetryPolicy::none(),
            default_step_timeout: None,
        }
    }
}

/// Outcome of one step through the retry pipeline
#[derive(Debug, Clone)]
pub(crate) struct StepExecution {
    pub name: String,
    pub attempts: u32,
    pub duration: Duration,
    pub result: StepResult,
}

impl StepExecution {
    pub(crate) fn record(&self) -> StepRecord {
        let (disposition, error) = match &self.result.outcome {
            StepOutcome::Completed { .. } => (StepDisposition::Completed, None),
            StepOutcome::Skipped { .. } => (StepDisposition::Skipped, None),
            StepOutcome::Failed { error, .. } => {
                (StepDisposition::Failed, Some(error.clone()))
            }
        };
        StepRecord {
            name: self.name.clone(),
            disposition,
            error,
            attempts: self.attempts,
            duration: self.duration,
        }
    }
}

/// Executes workflows against a [`Runnable`]
pub struct WorkflowRunner {
    runnable: Arc<dyn Runnable>,
    config: RunnerConfig,
}

impl WorkflowRunner {
    pub fn new(runnable: Arc<dyn Runnable>) -> Self {
        Self {
            runnable,
            config: RunnerConfig::default(),
        }
    }

    pub fn with_config(runnable: Arc<dyn Runnable>, config: RunnerConfig) -> Self {
        Self { runnable, config }
    }

    /// Execute a workflow with fresh cancellation scope and no deadline
    pub async fn execute(&self, workflow: &Workflow, params: Params) -> WorkflowResult {
        self.execute_with(workflow, params, CancellationToken::new(), None)
            .await
    }

    /// Full-control entry: caller-supplied cancellation token and deadline
    #[instrument(skip(self, workflow, params, cancel, deadline), fields(workflow = %workflow.name))]
    pub async fn execute_with(
        &self,
        workflow: &Workflow,
        params: Params,
        cancel: CancellationToken,
        deadline: Option<Deadline>,
    ) -> WorkflowResult {
        let started = Instant::now();
        if let Err(e) = workflow.validate() {
            return WorkflowResult {
                status: WorkflowStatus::Failed,
                completed_steps: vec![],
                error_step: None,
                error: Some(e.to_string()),
                outputs: HashMap::new(),
                duration: started.elapsed(),
            };
        }

        let deadline = Deadline::earliest(deadline, workflow.timeout().map(Deadline::after));
        let ctx = WorkflowContext::new(
            &workflow.name,
            RunId::generate(),
            workflow.merged_params(&params),
        );
        info!(run_id = %ctx.run_id(), mode = ?workflow.mode, "executing workflow");

        match workflow.mode {
            ExecutionMode::Sequential => {
                self.run_sequential(workflow, ctx, deadline, &cancel, started)
                    .await
            }
            ExecutionMode::Parallel => {
                self.run_parallel(workflow, ctx, deadline, &cancel, started)
                    .await
            }
        }
    }

    async fn run_sequential(
        &self,
        workflow: &Workflow,
        mut ctx: WorkflowContext,
        deadline: Option<Deadline>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> WorkflowResult {
        let index_of: HashMap<&str, usize> = workflow
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut records: Vec<StepRecord> = vec![];
        let mut idx = 0;

        while idx < workflow.steps.len() {
            let step = &workflow.steps[idx];
            if excluded.contains(&step.name) {
                idx += 1;
                continue;
            }
            if cancel.is_cancelled() {
                return finish(
                    WorkflowStatus::Cancelled,
                    records,
                    None,
                    Some("cancelled".to_string()),
                    &ctx,
                    started,
                );
            }
            if deadline.map(|d| d.exceeded()).unwrap_or(false) {
                return finish(
                    WorkflowStatus::Failed,
                    records,
                    Some(step.name.clone()),
                    Some("workflow deadline exceeded".to_string()),
                    &ctx,
                    started,
                );
            }

            let exec = self.run_step(workflow, step, &ctx, deadline, cancel).await;
            records.push(exec.record());
            match exec.result.outcome {
                StepOutcome::Completed { output, .. } => {
                    ctx = ctx.with_output(&step.name, output);
                    if let Some(updates) = exec.result.context_updates {
                        ctx = ctx.with_params(updates);
                    }
                    if let Some(next) = exec.result.next_step {
                        // A choice excludes the branch it did not take.
                        if let StepKind::Choice {
                            then_step,
                            else_step,
                            ..
                        } = &step.kind
                        {
                            let other = if next == *then_step {
                                else_step
                            } else {
                                then_step
                            };
                            excluded.insert(other.clone());
                        }
                        match index_of.get(next.as_str()) {
                            Some(&target) if target > idx => {
                                idx = target;
                                continue;
                            }
                            Some(_) => {
                                return finish(
                                    WorkflowStatus::Failed,
                                    records,
                                    Some(step.name.clone()),
                                    Some(format!("next_step {next} would move backward")),
                                    &ctx,
                                    started,
                                );
                            }
                            None => {
                                return finish(
                                    WorkflowStatus::Failed,
                                    records,
                                    Some(step.name.clone()),
                                    Some(format!("unknown next_step {next}")),
                                    &ctx,
                                    started,
                                );
                            }
                        }
                    }
                }
                StepOutcome::Skipped { ref reason } => {
                    debug!(step = %step.name, reason = %reason, "step skipped");
                }
                StepOutcome::Failed { error, .. } => {
                    if step.error_policy == ErrorPolicy::Continue {
                        warn!(step = %step.name, "step failed, continuing: {error}");
                    } else {
                        return finish(
                            WorkflowStatus::Failed,
                            records,
                            Some(step.name.clone()),
                            Some(error),
                            &ctx,
                            started,
                        );
                    }
                }
            }
            idx += 1;
        }
        finish(WorkflowStatus::Completed, records, None, None, &ctx, started)
    }

    async fn run_parallel(
        &self,
        workflow: &Workflow,
        ctx: WorkflowContext,
        deadline: Option<Deadline>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> WorkflowResult {
        let steps = &workflow.steps;
        let max_concurrency = workflow
            .max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1);
        let index_of: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut remaining_deps: Vec<usize> = steps.iter().map(|s| s.depends_on.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![vec![]; steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                // Resolved by validate().
                if let Some(&j) = index_of.get(dep.as_str()) {
                    dependents[j].push(i);
                }
            }
        }

        let mut ready: VecDeque<usize> =
            (0..steps.len()).filter(|&i| remaining_deps[i] == 0).collect();
        let mut excluded: HashSet<usize> = HashSet::new();
        let mut records: Vec<StepRecord> = vec![];
        let mut ctx = ctx;
        let mut failure: Option<(String, String)> = None;
        // Scoped token so a Stop failure halts in-flight steps without
        // cancelling the caller's token.
        let scope = cancel.child_token();
        let mut running: FuturesUnordered<BoxFuture<'_, (usize, StepExecution)>> =
            FuturesUnordered::new();

        loop {
            while running.len() < max_concurrency && failure.is_none() {
                let Some(i) = ready.pop_front() else { break };
                if excluded.contains(&i) {
                    // Dependents of an excluded step are excluded too.
                    for &d in &dependents[i] {
                        excluded.insert(d);
                        remaining_deps[d] = remaining_deps[d].saturating_sub(1);
                        if remaining_deps[d] == 0 {
                            ready.push_back(d);
                        }
                    }
                    continue;
                }
                if scope.is_cancelled() {
                    break;
                }
                let step = steps[i].clone();
                let snapshot = ctx.clone();
                let token = scope.clone();
                running.push(
                    async move {
                        let exec = self
                            .run_step(workflow, &step, &snapshot, deadline, &token)
                            .await;
                        (i, exec)
                    }
                    .boxed(),
                );
            }

            let Some((i, exec)) = running.next().await else {
                break;
            };
            records.push(exec.record());
            let step = &steps[i];
            match exec.result.outcome {
                StepOutcome::Completed { output, .. } => {
                    ctx = ctx.with_output(&step.name, output);
                    if let Some(updates) = exec.result.context_updates {
                        ctx = ctx.with_params(updates);
                    }
                    if let (
                        StepKind::Choice {
                            then_step,
                            else_step,
                            ..
                        },
                        Some(next),
                    ) = (&step.kind, &exec.result.next_step)
                    {
                        let other = if next == then_step { else_step } else { then_step };
                        if let Some(&o) = index_of.get(other.as_str()) {
                            excluded.insert(o);
                        }
                    }
                }
                StepOutcome::Skipped { .. } => {}
                StepOutcome::Failed { error, .. } => {
                    if step.error_policy != ErrorPolicy::Continue {
                        failure = Some((step.name.clone(), error));
                        scope.cancel();
                    }
                }
            }
            for &d in &dependents[i] {
                remaining_deps[d] = remaining_deps[d].saturating_sub(1);
                if remaining_deps[d] == 0 {
                    ready.push_back(d);
                }
            }
        }

        if let Some((error_step, error)) = failure {
            return finish(
                WorkflowStatus::Failed,
                records,
                Some(error_step),
                Some(error),
                &ctx,
                started,
            );
        }
        if cancel.is_cancelled() {
            return finish(
                WorkflowStatus::Cancelled,
                records,
                None,
                Some("cancelled".to_string()),
                &ctx,
                started,
            );
        }
        finish(WorkflowStatus::Completed, records, None, None, &ctx, started)
    }

    /// One step through retries and deadlines
    pub(crate) async fn run_step(
        &self,
        workflow: &Workflow,
        step: &Step,
        ctx: &WorkflowContext,
        outer_deadline: Option<Deadline>,
        cancel: &CancellationToken,
    ) -> StepExecution {
        let started = Instant::now();
        let policy = step
            .retry_policy
            .clone()
            .or_else(|| workflow.retry_policy.clone())
            .unwrap_or_else(|| self.config.default_retry.clone());
        let step_deadline = step
            .timeout()
            .or(self.config.default_step_timeout)
            .map(Deadline::after);
        let deadline = Deadline::earliest(outer_deadline, step_deadline);

        let mut attempts = 0u32;
        let result = loop {
            attempts += 1;
            if cancel.is_cancelled() {
                break StepResult::fail(
                    format!("step {} cancelled", step.name),
                    ErrorCategory::Internal,
                );
            }
            if deadline.map(|d| d.exceeded()).unwrap_or(false) {
                break StepResult::fail(
                    format!("step {} deadline exceeded", step.name),
                    ErrorCategory::Timeout,
                );
            }
            let result = self.invoke_step(workflow, step, ctx, deadline, cancel).await;
            match &result.outcome {
                StepOutcome::Failed { error, category, .. } => {
                    match policy.decide(attempts, *category) {
                        RetryDecision::Retry(delay) => {
                            debug!(
                                step = %step.name,
                                attempts,
                                delay_ms = delay.as_millis() as u64,
                                "retrying step: {error}"
                            );
                            if sleep_within(delay, deadline).await.is_err() {
                                break StepResult::fail(
                                    format!(
                                        "step {} deadline exceeded during retry backoff",
                                        step.name
                                    ),
                                    ErrorCategory::Timeout,
                                );
                            }
                        }
                        RetryDecision::Stop => break result,
                    }
                }
                _ => break result,
            }
        };
        StepExecution {
            name: step.name.clone(),
            attempts,
            duration: started.elapsed(),
            result,
        }
    }

    async fn invoke_step(
        &self,
        workflow: &Workflow,
        step: &Step,
        ctx: &WorkflowContext,
        deadline: Option<Deadline>,
        cancel: &CancellationToken,
    ) -> StepResult {
        match &step.kind {
            StepKind::Operation { handler } => {
                match self
                    .runnable
                    .run_operation(handler, ctx.params().clone(), ctx.run_id())
                    .await
                {
                    Ok(output) => StepResult::ok(output),
                    Err(e) => StepResult::fail(e.message, e.category),
                }
            }
            StepKind::Lambda { func } => func(ctx),
            StepKind::Choice {
                predicate,
                then_step,
                else_step,
            } => {
                let condition = predicate(ctx);
                let selected = if condition { then_step } else { else_step };
                StepResult::ok(serde_json::json!({
                    "condition": condition,
                    "selected": selected,
                }))
                .with_next_step(selected.clone())
            }
            StepKind::Wait { duration } => match sleep_within(*duration, deadline).await {
                Ok(()) => StepResult::ok(Value::Null),
                Err(_) => StepResult::fail(
                    format!("wait step {} cut off by deadline", step.name),
                    ErrorCategory::Timeout,
                ),
            },
            StepKind::Map { items, steps } => {
                let items = items(ctx);
                let mut collected = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let child = ctx.with_params(params([
                        ("item", item),
                        ("item_index", serde_json::json!(index)),
                    ]));
                    match self
                        .run_nested(workflow, steps, child, deadline, cancel)
                        .await
                    {
                        Ok(outputs) => {
                            collected.push(Value::Object(outputs.into_iter().collect()))
                        }
                        Err((error, category)) => {
                            return StepResult::fail(
                                format!("map item {index}: {error}"),
                                category,
                            )
                        }
                    }
                }
                StepResult::ok(Value::Array(collected))
            }
        }
    }

    /// Nested sequential execution for map items. Boxed to break the
    /// async recursion through `invoke_step`.
    fn run_nested<'a>(
        &'a self,
        workflow: &'a Workflow,
        steps: &'a [Step],
        ctx: WorkflowContext,
        deadline: Option<Deadline>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<(String, Value)>, (String, ErrorCategory)>> {
        async move {
            let mut ctx = ctx;
            let mut outputs = Vec::new();
            for step in steps {
                let exec = self.run_step(workflow, step, &ctx, deadline, cancel).await;
                match exec.result.outcome {
                    StepOutcome::Completed { output, .. } => {
                        ctx = ctx.with_output(&step.name, output.clone());
                        outputs.push((step.name.clone(), output));
                    }
                    StepOutcome::Skipped { .. } => {}
                    StepOutcome::Failed { error, category, .. } => {
                        if step.error_policy == ErrorPolicy::Continue {
                            continue;
                        }
                        return Err((error, category));
                    }
                }
            }
            Ok(outputs)
        }
        .boxed()
    }
}

fn finish(
    status: WorkflowStatus,
    records: Vec<StepRecord>,
    error_step: Option<String>,
    error: Option<String>,
    ctx: &WorkflowContext,
    started: Instant,
) -> WorkflowResult {
    WorkflowResult {
        status,
        completed_steps: records,
        error_step,
        error,
        outputs: ctx.outputs().clone(),
        duration: started.elapsed(),
    }
}

/// Handler adapter that runs a registered workflow blueprint
pub struct WorkflowHandler {
    workflow: Workflow,
    runner: Arc<WorkflowRunner>,
}

#[async_trait]
impl Handler for WorkflowHandler {
    async fn call(&self, params: Params) -> Result<Value, WorkError> {
        let result = self.runner.execute(&self.workflow, params).await;
        match result.status {
            WorkflowStatus::Completed => Ok(serde_json::json!({
                "steps": result.step_names(),
                "outputs": result.outputs,
            })),
            WorkflowStatus::Cancelled => Err(WorkError::internal(format!(
                "workflow {} cancelled",
                self.workflow.name
            ))),
            WorkflowStatus::Failed => Err(WorkError::unknown(format!(
                "workflow {} failed at {}: {}",
                self.workflow.name,
                result.error_step.as_deref().unwrap_or("<validation>"),
                result.error.as_deref().unwrap_or("unknown error"),
            ))),
        }
    }
}

/// Register a workflow blueprint so `submit_workflow(name, ...)` routes
/// to it through the dispatcher.
pub fn register_workflow(
    registry: &HandlerRegistry,
    runner: Arc<WorkflowRunner>,
    workflow: Workflow,
) -> Result<(), RegistryError> {
    let name = workflow.name.clone();
    registry.register(
        WorkKind::Workflow,
        name,
        Arc::new(WorkflowHandler { workflow, runner }),
    )
}
