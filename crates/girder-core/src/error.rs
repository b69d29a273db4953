//! Error categories and the handler-level error envelope

use serde::{Deserialize, Serialize};

/// Classification applied to every handler and step failure.
///
/// The category drives retry decisions: `Transient`, `Dependency`, and
/// `Unknown` are retryable by default; everything else fails fast unless a
/// retry policy explicitly allows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Internal,
    DataQuality,
    Transient,
    Timeout,
    Dependency,
    Validation,
    Config,
    Auth,
    Unknown,
}

impl ErrorCategory {
    /// Whether a failure of this category is retried absent an explicit
    /// policy override
    pub fn retryable_by_default(&self) -> bool {
        matches!(self, Self::Transient | Self::Dependency | Self::Unknown)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Internal => "internal",
            Self::DataQuality => "data_quality",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Dependency => "dependency",
            Self::Validation => "validation",
            Self::Config => "config",
            Self::Auth => "auth",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Error returned by handlers and steps
///
/// Carries a message, a category for retry classification, and optional
/// structured details for debugging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkError {
    /// Human-readable error message
    pub message: String,

    /// Category used for retry decisions
    pub category: ErrorCategory,

    /// Additional structured details
    pub details: Option<serde_json::Value>,
}

impl WorkError {
    /// Create an error with an explicit category
    pub fn new(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            message: message.into(),
            category,
            details: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Transient)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Dependency)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Timeout)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Validation)
    }

    pub fn data_quality(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::DataQuality)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Config)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Auth)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Internal)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Unknown)
    }

    /// Attach structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether this error is retried absent a policy override
    pub fn retryable_by_default(&self) -> bool {
        self.category.retryable_by_default()
    }
}

impl std::fmt::Display for WorkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

impl std::error::Error for WorkError {}

impl From<serde_json::Error> for WorkError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("serialization error: {err}"))
    }
}
