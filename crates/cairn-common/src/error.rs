//! Error types for cairn
//!
//! Errors carry the context a reconcile log line needs: which daemon, which
//! live resource, which API operation. The reconciler, not the lower layers,
//! decides what is retried; `is_retryable()` encodes that policy in one place.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// HTTP status the API server returns for an invalid object
const STATUS_UNPROCESSABLE: u16 = 422;
/// Status message fragments marking a rejected change to a fixed field
const IMMUTABLE_MARKERS: &[&str] = &["field is immutable", "spec.selector"];
/// HTTP status for a create that raced another writer
const STATUS_CONFLICT: u16 = 409;
/// HTTP status for a missing object
const STATUS_NOT_FOUND: u16 = 404;

/// Main error type for cairn operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error outside of a create/update/delete call
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Daemon properties cannot be classified into a storage topology
    #[error("validation error for {daemon}: {message}")]
    Validation {
        /// Daemon the properties belong to (e.g. "osd.3")
        daemon: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field (e.g. "metadataClaim")
        field: Option<String>,
    },

    /// An internal invariant was violated while assembling an execution plan
    #[error("plan build error for {daemon}: {message}")]
    PlanBuild {
        /// Daemon the plan was built for
        daemon: String,
        /// Description of the violated invariant
        message: String,
    },

    /// A create/update/delete/list call against the cluster API failed
    #[error("apply error [{operation}] for {resource}: {message}")]
    Apply {
        /// Name of the live resource
        resource: String,
        /// API operation that failed (create, update, delete, list, get)
        operation: String,
        /// Description of what failed
        message: String,
        /// HTTP status code returned by the API server, if any
        code: Option<u16>,
    },

    /// Delete succeeded during a delete-and-recreate but the recreate failed
    #[error("recreate failed for {resource}: {message}")]
    Recreate {
        /// Name of the resource that is now absent
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Key-management configuration cannot produce a key retrieval step
    #[error("key retrieval error [{provider}] for {daemon}: {message}")]
    KeyRetrieval {
        /// Daemon that needs the key
        daemon: String,
        /// Key-management provider (e.g. "vault")
        provider: String,
        /// Description of what failed
        message: String,
    },

    /// Credential removal failed
    #[error("credential error for {entity}: {message}")]
    Credential {
        /// Credential entity (e.g. "client.rbd-mirror.b")
        entity: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "cli", "reconciler")
        context: String,
    },
}

impl Error {
    /// Create a validation error for a daemon and field
    pub fn validation_for_field(
        daemon: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            daemon: daemon.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a plan build error
    pub fn plan_build(daemon: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PlanBuild {
            daemon: daemon.into(),
            message: msg.into(),
        }
    }

    /// Create an apply error without a status code
    pub fn apply(
        resource: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Apply {
            resource: resource.into(),
            operation: operation.into(),
            message: msg.into(),
            code: None,
        }
    }

    /// Create an apply error carrying the API server's status code
    pub fn apply_with_code(
        resource: impl Into<String>,
        operation: impl Into<String>,
        code: u16,
        msg: impl Into<String>,
    ) -> Self {
        Self::Apply {
            resource: resource.into(),
            operation: operation.into(),
            message: msg.into(),
            code: Some(code),
        }
    }

    /// Wrap a kube-rs error from a specific API call
    pub fn from_kube(
        resource: impl Into<String>,
        operation: impl Into<String>,
        err: kube::Error,
    ) -> Self {
        let code = match &err {
            kube::Error::Api(ae) => Some(ae.code),
            _ => None,
        };
        Self::Apply {
            resource: resource.into(),
            operation: operation.into(),
            message: err.to_string(),
            code,
        }
    }

    /// Create a recreate failure
    pub fn recreate(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Recreate {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a key retrieval error
    pub fn key_retrieval(
        daemon: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::KeyRetrieval {
            daemon: daemon.into(),
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a credential error
    pub fn credential(entity: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credential {
            entity: entity.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if the outer control loop should retry on its next pass
    ///
    /// Validation, plan and key-management configuration errors need a spec
    /// change. Apply and recreate failures are retried by the next scheduled
    /// reconciliation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(source, kube::Error::Api(ae) if (400..500).contains(&ae.code))
            }
            Error::Validation { .. } => false,
            Error::PlanBuild { .. } => false,
            Error::Apply { .. } => true,
            Error::Recreate { .. } => true,
            Error::KeyRetrieval { .. } => false,
            Error::Credential { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when the API server rejected an update because it changes an
    /// immutable field such as the selector. Other invalid updates are not.
    pub fn is_immutable_rejection(&self) -> bool {
        match self {
            Error::Apply {
                code: Some(STATUS_UNPROCESSABLE),
                message,
                ..
            } => IMMUTABLE_MARKERS.iter().any(|m| message.contains(m)),
            _ => false,
        }
    }

    /// True when a create found the object already present
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Apply { code: Some(STATUS_CONFLICT), .. })
    }

    /// True when the target object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Apply { code: Some(STATUS_NOT_FOUND), .. })
    }

    /// Get the daemon name if this error is associated with one
    pub fn daemon(&self) -> Option<&str> {
        match self {
            Error::Validation { daemon, .. } => Some(daemon),
            Error::PlanBuild { daemon, .. } => Some(daemon),
            Error::KeyRetrieval { daemon, .. } => Some(daemon),
            _ => None,
        }
    }

    /// Get the live resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Apply { resource, .. } => Some(resource),
            Error::Recreate { resource, .. } => Some(resource),
            _ => None,
        }
    }
}
