//! Error types for the Strata operator
//!
//! Errors carry the cluster they concern so failures can be traced back to a
//! resource from logs alone.

use thiserror::Error;

use crate::store::StoreError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Strata operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error outside the state store (CRD install, leases)
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// State store call failed
    #[error("store error: {source}")]
    Store {
        /// The classified store error
        #[from]
        source: StoreError,
    },

    /// Desired state is invalid and cannot be acted on
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.workerGroups[0].replicas")
        field: Option<String>,
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
        /// Context where the error occurred (e.g., "reconciler", "queue", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
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
    pub fn internal_with_context(msg: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether retrying the failed operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Store { source } => source.is_retryable(),
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Cluster name associated with this error, if any
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } if cluster != UNKNOWN_CONTEXT => Some(cluster),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectKind;

    #[test]
    fn story_invalid_spec_is_reported_with_its_cluster() {
        let err = Error::validation_for_field(
            "train-01",
            "spec.workerGroups[1].name",
            "duplicate worker group name 'cpu'",
        );

        assert_eq!(err.cluster(), Some("train-01"));
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "validation error for train-01: duplicate worker group name 'cpu'"
        );
    }

    #[test]
    fn unknown_cluster_is_not_reported() {
        let err = Error::validation("bad");
        assert_eq!(err.cluster(), None);
    }

    #[test]
    fn store_errors_keep_their_retry_classification() {
        let conflict: Error = StoreError::Conflict {
            kind: ObjectKind::Pod,
            name: "c-g0-head".into(),
            message: "stale".into(),
        }
        .into();
        assert!(conflict.is_retryable());

        let rejected: Error = StoreError::Rejected {
            kind: ObjectKind::Pod,
            name: "c-g0-head".into(),
            message: "invalid".into(),
        }
        .into();
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn internal_errors_carry_context() {
        let err = Error::internal_with_context("queue closed", "runtime");
        assert_eq!(err.to_string(), "internal error [runtime]: queue closed");
        assert!(err.is_retryable());
    }
}
