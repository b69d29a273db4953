//! Dependency graph validation
//!
//! DAG edges are declared by step name; validation resolves every
//! reference and orders the graph with Kahn's algorithm.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::workflow::step::{Step, StepKind};

/// Errors detected at workflow construction time
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowBuildError {
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("step {step} depends on unknown step {depends_on}")]
    UnknownDependency { step: String, depends_on: String },

    #[error("choice step {step} routes to unknown step {target}")]
    UnknownChoiceTarget { step: String, target: String },

    #[error("workflow contains a dependency cycle")]
    Cycle,
}

/// Order steps so every step follows all of its dependencies.
///
/// Steps with no `depends_on` are roots. Ties break on declaration order,
/// so the result is deterministic.
pub fn topological_order(steps: &[Step]) -> Result<Vec<String>, WorkflowBuildError> {
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.name.as_str()) {
            return Err(WorkflowBuildError::DuplicateStep(step.name.clone()));
        }
    }

    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![vec![]; steps.len()];

    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let Some(&j) = index.get(dep.as_str()) else {
                return Err(WorkflowBuildError::UnknownDependency {
                    step: step.name.clone(),
                    depends_on: dep.clone(),
                });
            };
            in_degree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut ready: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(i) = ready.pop_front() {
        order.push(steps[i].name.clone());
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.push_back(d);
            }
        }
    }

    if order.len() != steps.len() {
        return Err(WorkflowBuildError::Cycle);
    }
    Ok(order)
}

/// Validate step names, dependency references, and choice targets, then
/// check the graph is acyclic.
pub fn validate_steps(steps: &[Step]) -> Result<(), WorkflowBuildError> {
    let order = topological_order(steps)?;
    let names: HashSet<&str> = order.iter().map(String::as_str).collect();

    for step in steps {
        if let StepKind::Choice {
            then_step,
            else_step,
            ..
        } = &step.kind
        {
            for target in [then_step, else_step] {
                if !names.contains(target.as_str()) {
                    return Err(WorkflowBuildError::UnknownChoiceTarget {
                        step: step.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}
