//! Error types for the taskstack provisioning system.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, plan construction, backend calls, apply/destroy
//! execution, and state management.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the taskstack provisioning system.
#[derive(Debug, Error)]
pub enum StackError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Structural plan errors, raised before any backend call.
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// Cloud backend errors.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Apply or destroy execution errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// The frontend bundle could not be read.
    #[error("Invalid site bundle at {path}: {message}")]
    InvalidBundle {
        /// Bundle directory.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },
}

/// Structural errors in a declared plan.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A logical name was declared twice.
    #[error("Duplicate resource name '{name}' (already declared as {existing})")]
    DuplicateResource {
        /// The duplicated logical name.
        name: String,
        /// What the name is already bound to.
        existing: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Nodes forming the cycle, first node repeated at the end.
        cycle: Vec<String>,
    },

    /// A reference or explicit dependency names an undeclared node.
    #[error("'{from}' references '{target}', which is never declared")]
    UnresolvedReference {
        /// Node holding the reference.
        from: String,
        /// The missing target.
        target: String,
    },

    /// A reference asks for an attribute the target never exposes.
    #[error("'{from}' references unknown attribute '{attribute}' of {kind} '{target}'")]
    UnknownAttribute {
        /// Node holding the reference.
        from: String,
        /// Referenced node.
        target: String,
        /// Kind of the referenced node.
        kind: String,
        /// The unknown attribute.
        attribute: String,
    },

    /// A lookup depends on something other than another lookup.
    #[error("Lookup '{lookup}' cannot depend on resource '{target}'")]
    InvalidLookup {
        /// The lookup.
        lookup: String,
        /// The offending dependency.
        target: String,
    },

    /// An output name was exported twice.
    #[error("Duplicate output name: {name}")]
    DuplicateOutput {
        /// The duplicated output name.
        name: String,
    },
}

/// Errors returned by a cloud backend call.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A create/read/update/delete call failed.
    #[error("{operation} of {resource} failed: {message}")]
    RequestFailed {
        /// Resource the call was made for.
        resource: String,
        /// Operation name.
        operation: String,
        /// Backend message.
        message: String,
    },

    /// A transient failure (throttling, timeout, network).
    #[error("Transient failure during {operation} of {resource}: {message}")]
    Transient {
        /// Resource the call was made for.
        resource: String,
        /// Operation name.
        operation: String,
        /// Backend message.
        message: String,
    },

    /// A lookup against existing cloud state failed.
    #[error("Lookup {query} failed: {message}")]
    LookupFailed {
        /// Description of the query.
        query: String,
        /// Backend message.
        message: String,
    },

    /// A resource did not reach the expected state in time.
    #[error("Timeout waiting for {resource} to reach state {expected_state}")]
    Timeout {
        /// Resource being waited on.
        resource: String,
        /// State that was not reached.
        expected_state: String,
    },

    /// The backend returned a response the planner cannot use.
    #[error("Invalid backend response for {resource}: {message}")]
    InvalidResponse {
        /// Resource the call was made for.
        resource: String,
        /// Description of the problem.
        message: String,
    },
}

/// Errors raised while executing an apply or destroy pass.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A resource failed and the pass was halted.
    #[error(
        "Apply halted at '{failed}': {reason} ({} completed, {} not started)",
        completed.len(),
        not_started.len()
    )]
    Halted {
        /// First failing resource.
        failed: String,
        /// Backend error text.
        reason: String,
        /// Resources that completed during this pass.
        completed: Vec<String>,
        /// Resources that were never started.
        not_started: Vec<String>,
    },

    /// The operator interrupted the pass.
    #[error("Interrupted: {} completed, {} not started", completed.len(), not_started.len())]
    Interrupted {
        /// Resources that completed during this pass.
        completed: Vec<String>,
        /// Resources that were never started.
        not_started: Vec<String>,
    },

    /// A lookup failed, so no resource was touched.
    #[error("Lookup '{lookup}' failed: {reason}")]
    LookupFailed {
        /// The failing lookup.
        lookup: String,
        /// Backend error text.
        reason: String,
    },

    /// A referenced attribute was missing after its producer completed.
    #[error("Resource '{resource}' did not expose attribute '{attribute}'")]
    MissingAttribute {
        /// Producer.
        resource: String,
        /// Attribute that was requested.
        attribute: String,
    },

    /// Destroy failed part way.
    #[error("Destroy halted at '{failed}': {reason}; remaining: {}", remaining.join(", "))]
    DestroyIncomplete {
        /// First failing resource.
        failed: String,
        /// Backend error text.
        reason: String,
        /// Resources still present in the backend.
        remaining: Vec<String>,
    },

    /// The pass was refused before starting.
    #[error("Apply aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Result type alias for taskstack operations.
pub type Result<T> = std::result::Result<T, StackError>;

impl StackError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(err) => err.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Backend(BackendError::Transient { .. }) => Some(5),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl BackendError {
    /// Creates a request failure.
    #[must_use]
    pub fn request(
        resource: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::RequestFailed {
            resource: resource.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a transient failure.
    #[must_use]
    pub fn transient(
        resource: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transient {
            resource: resource.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid-response error.
    #[must_use]
    pub fn invalid(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}
