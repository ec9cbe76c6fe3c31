//! Reconcile error types

use strata_common::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store call for cluster '{cluster}' failed: {source}")]
    Store {
        cluster: String,
        #[source]
        source: StoreError,
    },

    #[error("{failed} sub-resource operation(s) failed for cluster '{cluster}', first: {first}")]
    Partial {
        cluster: String,
        failed: usize,
        first: StoreError,
    },

    #[error("cluster '{cluster}' changed while its status was being written")]
    Conflict { cluster: String },

    #[error("{0}")]
    Common(#[from] strata_common::Error),
}

impl ReconcileError {
    pub fn store(cluster: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            cluster: cluster.into(),
            source,
        }
    }

    /// Whether a later pass may succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { source, .. } => source.is_retryable(),
            Self::Partial { first, .. } => first.is_retryable(),
            Self::Conflict { .. } => true,
            Self::Common(e) => e.is_retryable(),
        }
    }

    /// Write conflicts are retried sooner than other failures
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Store { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}
