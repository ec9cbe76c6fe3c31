//! Runtime glue: the StrataCluster reconciler as seen by the worker pool

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use strata_runtime::{Action, ObjectKey, Reconciler};

use crate::error::ReconcileError;
use crate::reconciler::{reconcile, Context};

/// Reconciles StrataClusters for the controller runtime
pub struct ClusterReconciler {
    ctx: Arc<Context>,
}

impl ClusterReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for ClusterReconciler {
    type Error = ReconcileError;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        reconcile(key, &self.ctx).await
    }

    fn error_policy(&self, key: &ObjectKey, error: &ReconcileError, attempt: u32) -> Action {
        let config = &self.ctx.config;
        error!(
            ?error,
            cluster = %key,
            attempt,
            retryable = error.is_retryable(),
            "reconciliation failed"
        );

        if error.is_conflict() {
            Action::requeue(config.backoff_base)
        } else if !error.is_retryable() {
            Action::requeue(config.backoff_max)
        } else {
            Action::requeue(config.backoff().jittered_delay_for_attempt(attempt))
        }
    }
}
