//! Error types for the Database Operator

use thiserror::Error;

use crate::crd::Technology;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic concurrency conflict against the platform
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object disappeared between observation and write
    #[error("Not found: {0}")]
    NotFound(String),

    /// Reconciliation attempt exceeded its deadline
    #[error("Reconciliation timed out after {0}s")]
    Timeout(u64),

    /// Spec invariant violated
    #[error("Validation error: {0}")]
    Validation(String),

    /// No engine is registered for the declared technology
    #[error("No engine implementation for technology {0}")]
    UnimplementedEngine(Technology),

    /// The engine exists but does not implement this operation yet
    #[error("{operation} is not yet implemented for {technology}")]
    NotImplemented {
        technology: Technology,
        operation: &'static str,
    },

    /// An asynchronous execution unit reported failure
    #[error("Execution unit '{unit}' failed: {reason}")]
    ExecutionFailed { unit: String, reason: String },

    /// A recorded execution unit no longer exists
    #[error("Execution unit '{0}' not found")]
    ExecutionUnitMissing(String),

    /// Secret not found
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// Secret key not found
    #[error("Secret key '{key}' not found in secret '{secret}'")]
    SecretKeyNotFound { secret: String, key: String },

    /// External vault error
    #[error("Vault error: {0}")]
    Vault(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error talking to an external collaborator
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a vault error
    pub fn vault(msg: impl Into<String>) -> Self {
        Error::Vault(msg.into())
    }

    /// Create an engine "not yet implemented" error
    pub fn not_implemented(technology: Technology, operation: &'static str) -> Self {
        Error::NotImplemented {
            technology,
            operation,
        }
    }

    /// True for API 404 responses as well as the platform-neutral NotFound
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// True for optimistic concurrency failures (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Platform errors that are expected to clear on their own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Conflict(_) | Error::NotFound(_) | Error::Timeout(_)
        )
    }

    /// Stable CamelCase reason code used in status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Validation(_) => "ValidationFailed",
            Error::UnimplementedEngine(_) => "EngineUnavailable",
            Error::NotImplemented { .. } => "NotImplemented",
            Error::ExecutionFailed { .. } | Error::ExecutionUnitMissing(_) => "ExecutionFailed",
            Error::SecretNotFound(_) | Error::SecretKeyNotFound { .. } => "SecretUnavailable",
            Error::Vault(_) | Error::Http(_) => "VaultSyncFailed",
            Error::Timeout(_) => "Timeout",
            Error::Conflict(_) => "Conflict",
            Error::Config(_) => "ConfigurationError",
            _ => "PlatformError",
        }
    }

    /// Coarse error class for metrics labels
    pub fn class(&self) -> &'static str {
        match self {
            Error::Validation(_) | Error::Config(_) => "validation",
            Error::UnimplementedEngine(_) | Error::NotImplemented { .. } => "unimplemented",
            Error::ExecutionFailed { .. } | Error::ExecutionUnitMissing(_) => "execution",
            Error::Vault(_) | Error::Http(_) => "vault",
            e if e.is_transient() => "transient",
            _ => "other",
        }
    }
}
