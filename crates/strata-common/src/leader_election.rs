//! Leader election using Kubernetes Leases
//!
//! Only the replica holding the lease runs the reconcile worker pool; standby
//! replicas keep serving health probes and wait.
//!
//! Acquisition and renewal compare-and-swap on the Lease resourceVersion, so
//! two replicas racing for an expired lease cannot both win.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::FIELD_MANAGER;

/// Lease name for the Strata operator leader election
pub const LEADER_LEASE_NAME: &str = "strata-operator-leader";

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Lease came back without a resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingVersion(String),
}

/// Lease timing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseTiming {
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How often the holder renews
    pub renew_interval: Duration,
    /// How often a standby retries acquisition
    pub retry_interval: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    timing: LeaseTiming,
    is_leader: Arc<AtomicBool>,
}

/// Whether a lease last renewed at `renew_time` has expired at `now`
fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(i64::from(duration)),
        _ => true,
    }
}

impl LeaderElector {
    /// Create a new leader elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            timing: LeaseTiming::default(),
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override lease timing
    pub fn with_timing(mut self, timing: LeaseTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Shared flag that is true while this replica leads
    pub fn leader_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_leader)
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard renews the lease in the background; `LeaderGuard::lost`
    /// resolves when renewal fails.
    pub async fn acquire(self: Arc<Self>) -> Result<LeaderGuard, LeaderElectionError> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Ok(self.create_guard());
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.timing.retry_interval.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.timing.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.timing.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            return self.write_lease(&api, None, now, 0, now).await;
        };

        let spec = lease.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_ref());
        let resource_version = lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::MissingVersion(self.lease_name.clone()))?;

        if holder == Some(&self.identity) {
            let acquired = spec
                .and_then(|s| s.acquire_time.as_ref())
                .map(|t| t.0)
                .unwrap_or(now);
            let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
            return self
                .write_lease(&api, Some(resource_version), acquired, transitions, now)
                .await;
        }

        if lease_expired(spec, now) {
            let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
            return self
                .write_lease(&api, Some(resource_version), now, transitions + 1, now)
                .await;
        }

        Ok(false)
    }

    /// Create (no version) or replace (with version) the lease naming us as holder
    async fn write_lease(
        &self,
        api: &Api<Lease>,
        resource_version: Option<String>,
        acquire_time: DateTime<Utc>,
        transitions: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let creating = resource_version.is_none();
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.timing.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(acquire_time)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        };

        let result = if creating {
            api.create(&PostParams::default(), &lease).await
        } else {
            api.replace(&self.lease_name, &PostParams::default(), &lease)
                .await
        };

        match result {
            Ok(_) => {
                debug!(identity = %self.identity, transitions, "Lease written");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease write conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.timing.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.identity) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339()
            }
        });

        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership by clearing the lease holder (call on graceful shutdown)
    pub async fn release(&self) -> Result<(), LeaderElectionError> {
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}
