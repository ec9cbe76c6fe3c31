//! Retry utilities with exponential backoff and jitter.
//!
//! Used for startup calls that must eventually succeed (CRD installation,
//! API readiness) and, through [`RetryConfig::delay_for_attempt`], for the
//! per-key requeue backoff of the controller runtime.
//!
//! # Example
//!
//! ```ignore
//! use strata_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let crd = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(5),
//!     "install_crd",
//!     || async { crds.patch(name, &params, &patch).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Un-jittered delay before retry number `attempt` (1-based), capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Same as [`delay_for_attempt`](Self::delay_for_attempt) with 0.5x-1.5x jitter, still capped
    pub fn jittered_delay_for_attempt(&self, attempt: u32) -> Duration {
        jitter(self.delay_for_attempt(attempt)).min(self.max_delay)
    }
}

fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
/// Returns the last error once max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = jitter(config.delay_for_attempt(attempt));

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
