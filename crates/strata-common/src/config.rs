//! Operator configuration
//!
//! Retry, backoff and deadline values are operational tuning knobs. They are
//! collected here with their defaults and overridden from CLI flags or env.

use std::time::Duration;

use crate::retry::RetryConfig;
use crate::Error;

/// Default number of concurrent reconcile workers
pub const DEFAULT_WORKERS: usize = 4;
/// Default full-resync interval
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);
/// Default bound on immediate retries after a write conflict
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;
/// Default time a pending generation gets to become ready
pub const DEFAULT_HEALTH_CHECK_DEADLINE: Duration = Duration::from_secs(600);
/// Default container restarts tolerated before a unit counts as failed
pub const DEFAULT_RESTART_BUDGET: i32 = 3;
/// Default deadline for a single store call
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default first backoff after a failed pass
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Default backoff ceiling
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(300);
/// Default requeue while a cluster is converging
pub const DEFAULT_PROGRESS_REQUEUE: Duration = Duration::from_secs(5);

/// Runtime configuration for the operator
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Restrict watches to one namespace (all namespaces when None)
    pub namespace: Option<String>,
    /// Worker pool size
    pub workers: usize,
    /// Interval between full resyncs
    pub resync_interval: Duration,
    /// Immediate retries after a write conflict before requeueing
    pub max_conflict_retries: u32,
    /// Deadline for a pending generation to pass the readiness gate
    pub health_check_deadline: Duration,
    /// Container restarts tolerated before a unit counts as failed
    pub restart_budget: i32,
    /// Deadline for a single store call
    pub store_timeout: Duration,
    /// First backoff after a failed pass
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_max: Duration,
    /// Requeue delay while a cluster is still converging
    pub progress_requeue: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: DEFAULT_WORKERS,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            health_check_deadline: DEFAULT_HEALTH_CHECK_DEADLINE,
            restart_budget: DEFAULT_RESTART_BUDGET,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            progress_requeue: DEFAULT_PROGRESS_REQUEUE,
        }
    }
}

impl OperatorConfig {
    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::validation("workers must be at least 1"));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::validation("resync interval must be positive"));
        }
        if self.store_timeout.is_zero() {
            return Err(Error::validation("store timeout must be positive"));
        }
        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_max {
            return Err(Error::validation(
                "backoff base must be positive and not exceed backoff max",
            ));
        }
        if self.restart_budget < 0 {
            return Err(Error::validation("restart budget cannot be negative"));
        }
        Ok(())
    }

    /// Backoff schedule for failed reconcile passes
    pub fn backoff(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: 0,
            initial_delay: self.backoff_base,
            max_delay: self.backoff_max,
            backoff_multiplier: 2.0,
        }
    }
}
