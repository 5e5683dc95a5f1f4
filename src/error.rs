//! Error types for the convergence engine.
//!
//! Every failure carries an [`ErrorClass`] so callers can decide how to
//! render status: transient failures are absorbed by the retry layer,
//! everything else propagates with the operation and resource id attached.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the convergence engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors reported by (or while talking to) the cloud provider.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Reconciliation errors raised by the engine itself.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A failure annotated with the operation and resource it happened on.
    #[error("{operation} on {resource_id} failed: {source}")]
    Operation {
        /// Attempted operation, e.g. `CreateLaunchTemplateVersion`.
        operation: String,
        /// Identifier of the resource the operation targeted.
        resource_id: String,
        /// Underlying error.
        #[source]
        source: Box<ConvergeError>,
    },

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification of a failure, used for retry and status decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Target resource is absent.
    NotFound,
    /// Resource already exists.
    AlreadyExists,
    /// Concurrent modification or incompatible current state.
    Conflict,
    /// Throttling or transient failure, safe to retry.
    Transient,
    /// The operation would have broken a safety invariant.
    InvariantViolation,
    /// Malformed desired spec or rejected request.
    Validation,
    /// Anything else that must not be retried.
    Fatal,
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

    /// Duplicate resource definition.
    #[error("Duplicate {resource_type} name: {name}")]
    DuplicateName {
        /// Type of resource (launch template, machine pool, ...).
        resource_type: String,
        /// The duplicated name.
        name: String,
    },

    /// A reference to an undefined resource.
    #[error("{resource_type} '{name}' is not defined")]
    UnknownReference {
        /// Type of the referenced resource.
        resource_type: String,
        /// The missing name.
        name: String,
    },
}

/// Errors reported by the cloud provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The requested resource does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Resource kind (launch template, image, group, ...).
        kind: String,
        /// Identifier that was looked up.
        id: String,
    },

    /// The resource being created already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Resource kind.
        kind: String,
        /// Identifier of the existing resource.
        id: String,
    },

    /// An instance refresh is already running for the group.
    #[error("An instance refresh is already in progress for group {group}")]
    RefreshInProgress {
        /// Autoscaling group name.
        group: String,
    },

    /// The resource is in a state that does not permit the operation.
    #[error("Conflict: {message}")]
    Conflict {
        /// Provider message.
        message: String,
    },

    /// Request rate exceeded.
    #[error("Request throttled, retry after {retry_after_secs} seconds")]
    Throttled {
        /// Seconds suggested by the provider before retrying.
        retry_after_secs: u64,
    },

    /// Transient failure (network, 5xx, eventual consistency).
    #[error("Transient provider failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// The provider rejected the request as malformed.
    #[error("Provider rejected request: {message}")]
    Validation {
        /// Provider message.
        message: String,
    },

    /// Credentials missing or not authorized.
    #[error("Not authorized: {message}")]
    Unauthorized {
        /// Provider message.
        message: String,
    },

    /// The provider answered with something the engine cannot interpret.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A destructive call was refused because it would break an invariant.
    #[error("Invariant violation on {resource_id}: {message}")]
    InvariantViolation {
        /// Resource the call targeted.
        resource_id: String,
        /// Which invariant would have been broken.
        message: String,
    },

    /// An existing resource differs from the desired spec and cannot be
    /// converged in place.
    #[error("Drift detected for {resource}: {description}")]
    Drift {
        /// Resource with drift.
        resource: String,
        /// Description of the drift.
        description: String,
    },

    /// Maximum retry attempts exceeded.
    #[error("Maximum retry attempts ({attempts}) exceeded for {operation}: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Operation that kept failing.
        operation: String,
        /// Text of the last error seen.
        last_error: String,
    },

    /// Reconciliation was aborted.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for convergence operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wraps this error with the operation and resource it failed on.
    #[must_use]
    pub fn in_operation(self, operation: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            resource_id: resource_id.into(),
            source: Box::new(self),
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Operation { source, .. } => source.class(),
            Self::Provider(err) => err.class(),
            Self::Config(_) => ErrorClass::Validation,
            Self::Reconcile(ReconcileError::InvariantViolation { .. }) => {
                ErrorClass::InvariantViolation
            }
            Self::Reconcile(ReconcileError::Drift { .. }) => ErrorClass::Conflict,
            Self::Reconcile(ReconcileError::RetriesExhausted { .. }) => ErrorClass::Transient,
            Self::Reconcile(ReconcileError::Aborted { .. }) | Self::Io(_) | Self::Internal(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// Returns true if this error may be retried at the call boundary.
    ///
    /// Exhausted retries are still classified as transient so the caller can
    /// requeue, but they are not retried again here.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.provider_error(),
            Some(ProviderError::Throttled { .. } | ProviderError::Transient { .. })
        )
    }

    /// Returns true if the error means the target is absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    /// Returns the provider error at the root of this error, if any.
    #[must_use]
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Operation { source, .. } => source.provider_error(),
            Self::Provider(err) => Some(err),
            _ => None,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub fn retry_delay_secs(&self) -> Option<u64> {
        match self.provider_error() {
            Some(ProviderError::Throttled { retry_after_secs }) => Some(*retry_after_secs),
            Some(ProviderError::Transient { .. }) => Some(1),
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

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ProviderError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Creates an already-exists error.
    #[must_use]
    pub fn already_exists(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Returns the classification of this provider error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::AlreadyExists { .. } => ErrorClass::AlreadyExists,
            Self::RefreshInProgress { .. } | Self::Conflict { .. } => ErrorClass::Conflict,
            Self::Throttled { .. } | Self::Transient { .. } => ErrorClass::Transient,
            Self::Validation { .. } => ErrorClass::Validation,
            Self::Unauthorized { .. } | Self::InvalidResponse { .. } => ErrorClass::Fatal,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
            Self::InvariantViolation => "invariant_violation",
            Self::Validation => "validation",
            Self::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}
