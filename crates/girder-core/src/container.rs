//! Container job specifications and secret redaction

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::canonical_digest;

/// Placeholder written in place of secret env values
pub const REDACTION_PLACEHOLDER: &str = "[REDACTED]";

/// Case-insensitive markers that flag an env key as sensitive
const SENSITIVE_MARKERS: &[&str] = &["secret", "token", "password", "key", "credential"];

/// Resource limits for a container job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpu: Option<f64>,

    #[serde(default)]
    pub memory_mb: Option<u64>,

    #[serde(default)]
    pub gpu: Option<u32>,
}

/// Volume mounted into a container job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Description of a job handed to a container runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerJobSpec {
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    /// Ordered environment; values may hold secrets and are redacted
    /// before the spec is persisted
    #[serde(default)]
    pub env: IndexMap<String, String>,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub volumes: Vec<VolumeMount>,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[serde(default)]
    pub labels: IndexMap<String, String>,
}

/// Persistable form of a container job: redacted JSON plus a digest of the
/// canonical original, so the stored spec can be matched against the one
/// that actually ran without retaining secrets.
#[derive(Debug, Clone, PartialEq)]
pub struct RedactedJob {
    pub job: Value,
    pub digest: String,
}

impl ContainerJobSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: vec![],
            env: IndexMap::new(),
            resources: ResourceLimits::default(),
            volumes: vec![],
            timeout_seconds: None,
            labels: IndexMap::new(),
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_volume(mut self, volume: VolumeMount) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Redact secret env values and digest the canonical original.
    ///
    /// The original secrets live only in this value; once the redacted
    /// form is taken, nothing downstream sees them.
    pub fn redacted(&self) -> Result<RedactedJob, serde_json::Error> {
        let full = serde_json::to_value(self)?;
        let digest = canonical_digest(&full);

        let mut job = full;
        if let Some(env) = job.get_mut("env").and_then(Value::as_object_mut) {
            for (key, value) in env.iter_mut() {
                if is_sensitive_key(key) {
                    *value = Value::String(REDACTION_PLACEHOLDER.to_string());
                }
            }
        }

        Ok(RedactedJob { job, digest })
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|m| lowered.contains(m))
}
