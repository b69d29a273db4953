//! Tracked workflow runner
//!
//! Extends the runner with stage-level persistence: every completed step
//! UPSERTs a manifest row keyed by (domain, workflow, partition, stage),
//! failures write anomaly records, and re-running the same partition
//! skips stages the manifest already shows complete, rehydrating their
//! outputs into the context.
//!
//! Tracked execution is sequential: resume semantics require a stable
//! stage order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use girder_core::workflow::{
    ErrorPolicy, Step, StepDisposition, StepKind, StepOutcome, StepRecord, Workflow,
    WorkflowContext, WorkflowResult, WorkflowStatus,
};
use girder_core::{ErrorCategory, Params, RunId, RunStatus, WorkSpec};
use girder_storage::{
    AnomalyRecord, AnomalySeverity, ExecutionStore, ManifestStage, StoreError, TransitionCtx,
};

use super::WorkflowRunner;

/// Severity recorded for a step failure of the given category
fn severity_for(category: ErrorCategory) -> AnomalySeverity {
    match category {
        ErrorCategory::Internal | ErrorCategory::Unknown => AnomalySeverity::Critical,
        ErrorCategory::DataQuality
        | ErrorCategory::Validation
        | ErrorCategory::Config
        | ErrorCategory::Auth => AnomalySeverity::Error,
        ErrorCategory::Transient | ErrorCategory::Timeout | ErrorCategory::Dependency => {
            AnomalySeverity::Warning
        }
    }
}

/// Workflow runner with manifest persistence and idempotent resume
pub struct TrackedWorkflowRunner {
    runner: Arc<WorkflowRunner>,
    store: Arc<dyn ExecutionStore>,
    /// Default domain when the workflow declares none
    domain: String,
}

impl TrackedWorkflowRunner {
    pub fn new(
        runner: Arc<WorkflowRunner>,
        store: Arc<dyn ExecutionStore>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            store,
            domain: domain.into(),
        }
    }

    /// Execute one partition of a workflow, resuming from the manifest.
    #[instrument(skip(self, workflow, params), fields(workflow = %workflow.name))]
    pub async fn execute(
        &self,
        workflow: &Workflow,
        params: Params,
        partition: &str,
    ) -> Result<WorkflowResult, StoreError> {
        let started = Instant::now();
        let domain = workflow.domain.clone().unwrap_or_else(|| self.domain.clone());

        if let Err(e) = workflow.validate() {
            return Ok(WorkflowResult {
                status: WorkflowStatus::Failed,
                completed_steps: vec![],
                error_step: None,
                error: Some(e.to_string()),
                outputs: HashMap::new(),
                duration: started.elapsed(),
            });
        }

        let run_id = RunId::generate();
        let spec = WorkSpec::workflow(&workflow.name, params.clone());
        self.store.create_run(run_id, &spec, None).await?;
        self.store
            .update_status(run_id, RunStatus::Running, TransitionCtx::default())
            .await?;

        let completed: HashMap<String, ManifestStage> = self
            .store
            .load_manifest(&domain, &workflow.name, partition)
            .await?
            .into_iter()
            .map(|stage| (stage.stage.clone(), stage))
            .collect();
        if !completed.is_empty() {
            info!(
                run_id = %run_id,
                resumed_stages = completed.len(),
                "resuming partition from manifest"
            );
        }

        let batch_id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        let mut ctx = WorkflowContext::new(
            &workflow.name,
            run_id,
            workflow.merged_params(&params),
        );

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

            // Resume: a manifest row means the stage completed in a prior
            // execution of this partition.
            if let Some(stage) = completed.get(&step.name) {
                let output = stage.metrics.get("output").cloned().unwrap_or(Value::Null);
                if !output.is_null() {
                    ctx = ctx.with_output(&step.name, output.clone());
                }
                records.push(StepRecord {
                    name: step.name.clone(),
                    disposition: StepDisposition::Resumed,
                    error: None,
                    attempts: 0,
                    duration: Duration::ZERO,
                });
                if let Some(jump) =
                    self.route_after_choice(step, &output, &index_of, idx, &mut excluded)
                {
                    idx = jump;
                    continue;
                }
                idx += 1;
                continue;
            }

            let exec = self
                .runner
                .run_step(workflow, step, &ctx, None, &cancel)
                .await;
            records.push(exec.record());
            match exec.result.outcome {
                StepOutcome::Completed { output, quality } => {
                    let metrics = serde_json::json!({
                        "output": output.clone(),
                        "metrics": quality.as_ref().map(|q| q.metrics.clone()),
                    });
                    self.store
                        .upsert_manifest_stage(&ManifestStage {
                            domain: domain.clone(),
                            workflow: workflow.name.clone(),
                            partition: partition.to_string(),
                            stage: step.name.clone(),
                            row_count: quality.as_ref().and_then(|q| q.row_count),
                            metrics,
                            updated_at: Utc::now(),
                            execution_id: Some(run_id),
                            batch_id: Some(batch_id),
                        })
                        .await?;
                    ctx = ctx.with_output(&step.name, output.clone());
                    if let Some(updates) = exec.result.context_updates {
                        ctx = ctx.with_params(updates);
                    }
                    if let Some(jump) =
                        self.route_after_choice(step, &output, &index_of, idx, &mut excluded)
                    {
                        idx = jump;
                        continue;
                    }
                }
                StepOutcome::Skipped { .. } => {}
                StepOutcome::Failed { error, category, .. } => {
                    self.store
                        .record_anomaly(&AnomalyRecord::new(
                            run_id,
                            &step.name,
                            severity_for(category),
                            category,
                            &error,
                        ))
                        .await?;
                    if step.error_policy == ErrorPolicy::Continue {
                        warn!(step = %step.name, "stage failed, continuing: {error}");
                    } else {
                        self.store
                            .update_status(
                                run_id,
                                RunStatus::Failed,
                                TransitionCtx::with_error(&error),
                            )
                            .await?;
                        return Ok(WorkflowResult {
                            status: WorkflowStatus::Failed,
                            completed_steps: records,
                            error_step: Some(step.name.clone()),
                            error: Some(error),
                            outputs: ctx.outputs().clone(),
                            duration: started.elapsed(),
                        });
                    }
                }
            }
            idx += 1;
        }

        let outputs = ctx.outputs().clone();
        self.store
            .update_status(
                run_id,
                RunStatus::Completed,
                TransitionCtx::with_output(serde_json::json!(outputs)),
            )
            .await?;
        Ok(WorkflowResult {
            status: WorkflowStatus::Completed,
            completed_steps: records,
            error_step: None,
            error: None,
            outputs,
            duration: started.elapsed(),
        })
    }

    /// Re-apply choice routing from a (fresh or rehydrated) choice
    /// output: exclude the untaken branch and return a forward jump
    /// target if there is one.
    fn route_after_choice(
        &self,
        step: &Step,
        output: &Value,
        index_of: &HashMap<&str, usize>,
        idx: usize,
        excluded: &mut HashSet<String>,
    ) -> Option<usize> {
        let StepKind::Choice {
            then_step,
            else_step,
            ..
        } = &step.kind
        else {
            return None;
        };
        let selected = output.get("selected").and_then(Value::as_str)?;
        let other = if selected == then_step.as_str() {
            else_step
        } else {
            then_step
        };
        excluded.insert(other.clone());
        match index_of.get(selected) {
            Some(&target) if target > idx => Some(target),
            _ => None,
        }
    }
}
