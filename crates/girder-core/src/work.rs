//! Work specifications
//!
//! A `WorkSpec` is the immutable description of one unit of work: what kind
//! it is, which handler runs it, and with what parameters. Two specs with
//! identical (kind, name, params, idempotency_key) are semantically
//! equivalent.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::to_canonical_json;
use crate::container::ContainerJobSpec;
use crate::retry::RetryPolicy;

/// Ordered parameter map passed to handlers
pub type Params = IndexMap<String, Value>;

/// Kind of work a spec describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Task,
    Operation,
    Workflow,
    Step,
    Container,
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Operation => write!(f, "operation"),
            Self::Workflow => write!(f, "workflow"),
            Self::Step => write!(f, "step"),
            Self::Container => write!(f, "container"),
        }
    }
}

/// Immutable declaration of work to perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSpec {
    /// Kind tag, used for handler lookup alongside the name
    pub kind: WorkKind,

    /// Logical handler name, e.g. `sec.ingest.10k`
    pub name: String,

    /// Ordered submission parameters
    #[serde(default)]
    pub params: Params,

    /// Deduplication token; submissions sharing a key collapse onto the
    /// first completed run
    #[serde(default)]
    pub idempotency_key: Option<String>,

    /// Overall deadline for one attempt, in seconds
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Per-spec retry policy; the dispatcher default applies when absent
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl WorkSpec {
    pub fn new(kind: WorkKind, name: impl Into<String>, params: Params) -> Self {
        Self {
            kind,
            name: name.into(),
            params,
            idempotency_key: None,
            timeout_seconds: None,
            retry_policy: None,
        }
    }

    pub fn task(name: impl Into<String>, params: Params) -> Self {
        Self::new(WorkKind::Task, name, params)
    }

    pub fn operation(name: impl Into<String>, params: Params) -> Self {
        Self::new(WorkKind::Operation, name, params)
    }

    pub fn workflow(name: impl Into<String>, params: Params) -> Self {
        Self::new(WorkKind::Workflow, name, params)
    }

    pub fn step(name: impl Into<String>, params: Params) -> Self {
        Self::new(WorkKind::Step, name, params)
    }

    /// Build a container spec. The job is redacted at construction: secret
    /// env values never reach the ledger, only the redacted JSON and a
    /// digest of the canonical original.
    pub fn container(
        name: impl Into<String>,
        job: &ContainerJobSpec,
    ) -> Result<Self, serde_json::Error> {
        let redacted = job.redacted()?;
        let mut params = Params::new();
        params.insert("job".to_string(), redacted.job);
        params.insert("digest".to_string(), Value::String(redacted.digest));
        let mut spec = Self::new(WorkKind::Container, name, params);
        spec.timeout_seconds = job.timeout_seconds;
        Ok(spec)
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_seconds.map(std::time::Duration::from_secs)
    }

    /// Key used by the concurrency guard: the idempotency key when present,
    /// otherwise kind, name, and the canonical parameter form.
    pub fn lock_key(&self) -> String {
        if let Some(key) = &self.idempotency_key {
            return key.clone();
        }
        let params_value = Value::Object(
            self.params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        format!("{}:{}:{}", self.kind, self.name, to_canonical_json(&params_value))
    }
}

/// Build a `Params` map from key/value pairs
///
/// # Example
///
/// ```
/// use girder_core::work::params;
/// use serde_json::json;
///
/// let p = params([("x", json!(42))]);
/// assert_eq!(p["x"], json!(42));
/// ```
pub fn params<K, I>(pairs: I) -> Params
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
