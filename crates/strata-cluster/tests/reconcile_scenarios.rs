//! End-to-end reconcile scenarios against the in-memory store
//!
//! Each test plays the kubelet by flipping pod phases between passes and
//! checks what the operator wrote back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use strata_cluster::resources::serving_target;
use strata_cluster::status::{FAILED, READY, REASON_INVALID_SPEC, REASON_PENDING_UNHEALTHY, UPGRADING};
use strata_cluster::{reconcile, Context, ReconcileError};
use strata_common::config::OperatorConfig;
use strata_common::crd::{
    ContainerTemplate, StrataCluster, StrataClusterSpec, StrataClusterStatus, UpgradeState,
    UpgradeStrategy, UpgradeStrategyType, WorkerGroupSpec,
};
use strata_common::store::{FailOp, ManagedObject, MemoryStore, ObjectKind, StateStore, StoreError};
use strata_runtime::{Action, ObjectKey};

const NS: &str = "ml";
const NAME: &str = "train";

fn template(image: &str) -> ContainerTemplate {
    ContainerTemplate {
        image: image.into(),
        ..Default::default()
    }
}

fn spec(image: &str, replicas: i32, strategy: UpgradeStrategyType) -> StrataClusterSpec {
    StrataClusterSpec {
        head_template: template(image),
        worker_groups: vec![WorkerGroupSpec {
            name: "a".into(),
            replicas,
            min_replicas: 0,
            max_replicas: None,
            template: template(image),
            workers_to_delete: vec![],
        }],
        upgrade_strategy: Some(UpgradeStrategy {
            type_: strategy,
            health_check_deadline_seconds: Some(60),
        }),
        suspend: false,
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    ctx: Context,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let ctx = Context::new(store.clone(), OperatorConfig::default());
        Self { store, ctx }
    }

    fn apply(&self, spec: StrataClusterSpec) {
        let mut cluster = StrataCluster::new(NAME, spec);
        cluster.metadata.namespace = Some(NS.into());
        self.store.apply_cluster(cluster);
    }

    fn edit(&self, f: impl FnOnce(&mut StrataClusterSpec)) {
        let mut cluster = self.store.cluster(NS, NAME).unwrap();
        f(&mut cluster.spec);
        self.store.apply_cluster(cluster);
    }

    async fn pass(&self) -> Result<Action, ReconcileError> {
        reconcile(&ObjectKey::new(NS, NAME), &self.ctx).await
    }

    /// Reconcile and start pods until the cluster stops asking for requeues
    async fn settle(&self) {
        for _ in 0..20 {
            if self.pass().await.unwrap() == Action::await_change() {
                return;
            }
            self.store.start_all_pods(NS);
        }
        panic!("cluster did not settle: {:?}", self.status());
    }

    fn status(&self) -> StrataClusterStatus {
        self.store
            .cluster(NS, NAME)
            .and_then(|c| c.status)
            .unwrap_or_default()
    }

    fn condition(&self, type_: &str) -> (bool, String, String) {
        let status = self.status();
        let c = status.get_condition(type_).unwrap();
        (c.is_true(), c.reason.clone(), c.message.clone())
    }

    fn pod_names(&self) -> Vec<String> {
        self.store
            .pods(NS)
            .iter()
            .map(|p| p.name_any())
            .collect()
    }

    fn workers_of(&self, generation: &str) -> usize {
        let prefix = format!("{generation}-worker-");
        self.pod_names()
            .iter()
            .filter(|n| n.starts_with(&prefix))
            .count()
    }

    fn uid(&self, pod: &str) -> Option<String> {
        self.store.pod(NS, pod).and_then(|p| p.metadata.uid)
    }

    fn serving(&self) -> Option<String> {
        self.store
            .service(NS, "train-serve")
            .and_then(|s| serving_target(&s).map(str::to_string))
    }
}

#[tokio::test]
async fn story_fresh_cluster_comes_up_head_first() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 3, UpgradeStrategyType::None));

    h.pass().await.unwrap();
    assert_eq!(h.pod_names(), vec!["train-g0-head"]);
    assert_eq!(h.status().active_generation_id.as_deref(), Some("train-g0"));
    assert_eq!(h.serving().as_deref(), Some("train-g0"));
    assert!(h.store.service(NS, "train-g0-head").is_some());
    assert!(!h.condition(READY).0);

    // Workers wait for the head
    h.pass().await.unwrap();
    assert_eq!(h.pod_names().len(), 1);

    h.store.start_pod(NS, "train-g0-head").unwrap();
    h.pass().await.unwrap();
    assert_eq!(
        h.pod_names(),
        vec![
            "train-g0-head",
            "train-g0-worker-a-0",
            "train-g0-worker-a-1",
            "train-g0-worker-a-2"
        ]
    );
    assert!(h
        .status()
        .active_generation
        .unwrap()
        .head_started_at
        .is_some());

    h.pass().await.unwrap();
    let (ready, reason, _) = h.condition(READY);
    assert!(!ready);
    assert_eq!(reason, "WorkersNotReady");

    h.store.start_all_pods(NS);
    let action = h.pass().await.unwrap();
    assert!(h.condition(READY).0);
    assert!(!h.condition(UPGRADING).0);
    assert!(!h.condition(FAILED).0);
    assert_eq!(action, Action::await_change());
    assert_eq!(h.status().worker_groups["a"].running, 3);
}

#[tokio::test]
async fn story_settled_cluster_reconciles_without_writes() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 3, UpgradeStrategyType::None));
    h.settle().await;

    let writes = h.store.write_count();
    let action = h.pass().await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(h.store.write_count(), writes);
}

#[tokio::test]
async fn story_scale_down_removes_eldest_workers() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 3, UpgradeStrategyType::RollingRecreate));
    h.settle().await;
    let head_uid = h.store.pod(NS, "train-g0-head").unwrap().metadata.uid;

    h.edit(|s| s.worker_groups[0].replicas = 1);
    h.pass().await.unwrap();

    assert_eq!(h.pod_names(), vec!["train-g0-head", "train-g0-worker-a-2"]);
    assert_eq!(h.store.pod(NS, "train-g0-head").unwrap().metadata.uid, head_uid);
    let status = h.status();
    assert_eq!(status.active_generation_id.as_deref(), Some("train-g0"));
    assert_eq!(status.upgrade_state, UpgradeState::ActiveOnly);
    assert!(status.pending_generation.is_none());
}

#[tokio::test]
async fn story_requested_worker_is_removed() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 3, UpgradeStrategyType::None));
    h.settle().await;

    h.edit(|s| {
        s.worker_groups[0].replicas = 2;
        s.worker_groups[0].workers_to_delete = vec!["train-g0-worker-a-1".into()];
    });
    h.pass().await.unwrap();

    assert_eq!(
        h.pod_names(),
        vec!["train-g0-head", "train-g0-worker-a-0", "train-g0-worker-a-2"]
    );
}

#[tokio::test]
async fn story_failed_worker_is_replaced_with_fresh_ordinal() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 2, UpgradeStrategyType::None));
    h.settle().await;

    h.store.set_pod_phase(NS, "train-g0-worker-a-0", "Failed").unwrap();
    h.pass().await.unwrap();

    assert_eq!(
        h.pod_names(),
        vec!["train-g0-head", "train-g0-worker-a-1", "train-g0-worker-a-2"]
    );
}

#[tokio::test]
async fn story_image_change_rolls_out_new_generation() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 2, UpgradeStrategyType::RollingRecreate));
    h.settle().await;

    h.edit(|s| s.head_template.image = "runtime:2".into());
    h.pass().await.unwrap();
    let status = h.status();
    assert_eq!(status.upgrade_state, UpgradeState::ActivePending);
    assert_eq!(status.pending_generation_id.as_deref(), Some("train-g1"));
    assert!(h.condition(UPGRADING).0);
    assert!(h.store.pod(NS, "train-g1-head").is_some());
    assert_eq!(h.serving().as_deref(), Some("train-g0"));

    // Pending comes up while the old generation keeps serving
    h.store.start_all_pods(NS);
    h.pass().await.unwrap();
    assert_eq!(h.store.pods(NS).len(), 6);
    assert_eq!(h.serving().as_deref(), Some("train-g0"));

    h.store.start_all_pods(NS);
    h.pass().await.unwrap();
    let status = h.status();
    assert_eq!(status.upgrade_state, UpgradeState::CuttingOver);
    assert!(status.pending_generation.unwrap().ready_at.is_some());
    assert_eq!(h.serving().as_deref(), Some("train-g0"));

    // Pointer flips only once readiness is on record
    h.pass().await.unwrap();
    let status = h.status();
    assert_eq!(h.serving().as_deref(), Some("train-g1"));
    assert_eq!(status.upgrade_state, UpgradeState::Draining);
    assert_eq!(status.active_generation_id.as_deref(), Some("train-g1"));
    assert_eq!(status.draining_generation_id.as_deref(), Some("train-g0"));
    assert_eq!(status.traffic_generation_id.as_deref(), Some("train-g1"));

    h.pass().await.unwrap();
    assert!(h.pod_names().iter().all(|n| n.starts_with("train-g1")));
    assert!(h.store.service(NS, "train-g0-head").is_none());

    h.pass().await.unwrap();
    let status = h.status();
    assert_eq!(status.upgrade_state, UpgradeState::ActiveOnly);
    assert!(status.draining_generation_id.is_none());
    assert!(!h.condition(UPGRADING).0);
    assert!(h.condition(READY).0);
}

#[tokio::test]
async fn story_unhealthy_pending_is_discarded_after_deadline() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 1, UpgradeStrategyType::RollingRecreate));
    h.settle().await;

    h.edit(|s| s.head_template.image = "runtime:broken".into());
    h.pass().await.unwrap();
    assert_eq!(h.status().pending_generation_id.as_deref(), Some("train-g1"));

    // Head crash-loops: running but never ready
    h.store.set_pod_phase(NS, "train-g1-head", "Running").unwrap();
    h.store.set_pod_ready(NS, "train-g1-head", false).unwrap();
    h.store.set_pod_restarts(NS, "train-g1-head", 7).unwrap();
    h.pass().await.unwrap();
    assert_eq!(h.status().upgrade_state, UpgradeState::ActivePending);

    let mut status = h.status();
    if let Some(pending) = status.pending_generation.as_mut() {
        pending.created_at = Utc::now() - chrono::Duration::seconds(120);
    }
    h.store.set_cluster_status(NS, NAME, status);

    h.pass().await.unwrap();
    let status = h.status();
    assert_eq!(status.upgrade_state, UpgradeState::ActiveOnly);
    assert!(status.pending_generation.is_none());
    assert_eq!(status.active_generation_id.as_deref(), Some("train-g0"));
    assert_eq!(h.serving().as_deref(), Some("train-g0"));
    let (failed, reason, message) = h.condition(FAILED);
    assert!(failed);
    assert_eq!(reason, REASON_PENDING_UNHEALTHY);
    assert!(message.starts_with("pending generation unhealthy"));
    assert!(!h.condition(UPGRADING).0);

    // The discarded generation is swept and the same spec is not retried
    h.pass().await.unwrap();
    assert!(h.pod_names().iter().all(|n| n.starts_with("train-g0")));
    assert!(h.status().pending_generation.is_none());
    assert_eq!(h.store.pods(NS).len(), 2);
}

#[tokio::test]
async fn story_strategy_none_updates_head_image_in_place() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 1, UpgradeStrategyType::None));
    h.settle().await;
    let head_uid = h.store.pod(NS, "train-g0-head").unwrap().metadata.uid;

    h.edit(|s| {
        s.head_template.image = "runtime:2".into();
        s.worker_groups[0].template.image = "runtime:2".into();
    });
    h.pass().await.unwrap();

    let head = h.store.pod(NS, "train-g0-head").unwrap();
    assert_eq!(head.metadata.uid, head_uid);
    assert_eq!(
        head.spec.unwrap().containers[0].image.as_deref(),
        Some("runtime:2")
    );
    assert_eq!(h.status().active_generation_id.as_deref(), Some("train-g0"));
    assert!(h.store.pod(NS, "train-g0-worker-a-0").is_none());
    assert!(h.store.pod(NS, "train-g0-worker-a-1").is_some());
}

#[tokio::test]
async fn story_invalid_spec_mutates_nothing() {
    let h = Harness::new();
    let mut bad = spec("runtime:1", 1, UpgradeStrategyType::None);
    bad.worker_groups.push(bad.worker_groups[0].clone());
    h.apply(bad);

    let action = h.pass().await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(h.store.pods(NS).is_empty());
    assert!(h.store.services(NS).is_empty());
    assert_eq!(h.store.write_count(), 1);
    let (failed, reason, message) = h.condition(FAILED);
    assert!(failed);
    assert_eq!(reason, REASON_INVALID_SPEC);
    assert!(message.contains("'a'"));
    assert_eq!(h.status().upgrade_state, UpgradeState::NoActive);
}

#[tokio::test]
async fn story_suspend_tears_down_and_resume_rebuilds() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 2, UpgradeStrategyType::None));
    h.settle().await;

    h.edit(|s| s.suspend = true);
    h.pass().await.unwrap();
    assert!(h.store.pods(NS).is_empty());
    assert!(h.store.services(NS).is_empty());
    let (ready, reason, _) = h.condition(READY);
    assert!(!ready);
    assert_eq!(reason, "Suspended");
    assert!(h.status().active_generation.unwrap().head_started_at.is_none());

    h.edit(|s| s.suspend = false);
    h.pass().await.unwrap();
    assert_eq!(h.pod_names(), vec!["train-g0-head"]);
    h.settle().await;
    assert!(h.condition(READY).0);
    assert_eq!(h.store.pods(NS).len(), 3);
}

#[tokio::test]
async fn story_store_failure_fails_pass_and_next_pass_heals() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 2, UpgradeStrategyType::None));
    h.pass().await.unwrap();
    h.store.start_all_pods(NS);

    h.store.fail_next(
        FailOp::Create(ObjectKind::Pod),
        StoreError::Transient {
            message: "connection reset".into(),
        },
    );
    let err = h.pass().await.unwrap_err();
    assert!(matches!(err, ReconcileError::Partial { failed: 1, .. }));
    assert_eq!(h.store.pods(NS).len(), 2);

    h.pass().await.unwrap();
    assert_eq!(h.store.pods(NS).len(), 3);
}

#[tokio::test]
async fn story_status_conflict_is_retried_with_fresh_version() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 1, UpgradeStrategyType::None));
    h.store.fail_next(
        FailOp::UpdateStatus,
        StoreError::Conflict {
            kind: ObjectKind::Cluster,
            name: NAME.into(),
            message: "stale".into(),
        },
    );

    let action = h.pass().await.unwrap();
    assert_eq!(action.requeue_after(), Some(Duration::from_secs(5)));
    assert_eq!(h.status().active_generation_id.as_deref(), Some("train-g0"));
}

#[tokio::test]
async fn story_deleted_cluster_is_left_alone() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 1, UpgradeStrategyType::None));
    h.settle().await;

    assert!(h.store.delete_cluster(NS, NAME));
    assert!(h.store.pods(NS).is_empty());
    let writes = h.store.write_count();
    assert_eq!(h.pass().await.unwrap(), Action::await_change());
    assert_eq!(h.store.write_count(), writes);
}

#[tokio::test]
async fn story_replica_change_during_rollout_scales_serving_generation() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 1, UpgradeStrategyType::RollingRecreate));
    h.settle().await;

    h.edit(|s| s.head_template.image = "runtime:2".into());
    h.pass().await.unwrap();
    assert_eq!(h.status().upgrade_state, UpgradeState::ActivePending);

    h.edit(|s| s.worker_groups[0].replicas = 3);
    h.pass().await.unwrap();
    let status = h.status();
    assert_eq!(status.upgrade_state, UpgradeState::ActivePending);
    assert_eq!(
        status.active_generation.unwrap().spec.worker_groups[0].replicas,
        3
    );
    assert_eq!(h.workers_of("train-g0"), 3);
    assert_eq!(h.serving().as_deref(), Some("train-g0"));
}

#[tokio::test]
async fn story_replica_change_after_failed_rollout_scales_active() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 1, UpgradeStrategyType::RollingRecreate));
    h.settle().await;

    h.edit(|s| s.head_template.image = "runtime:broken".into());
    h.pass().await.unwrap();
    h.store.set_pod_phase(NS, "train-g1-head", "Running").unwrap();
    h.store.set_pod_ready(NS, "train-g1-head", false).unwrap();
    let mut status = h.status();
    if let Some(pending) = status.pending_generation.as_mut() {
        pending.created_at = Utc::now() - chrono::Duration::seconds(120);
    }
    h.store.set_cluster_status(NS, NAME, status);
    h.pass().await.unwrap();
    assert!(h.status().rollout_failure.is_some());

    // Same templates, so the failure stands, but the count still applies
    h.edit(|s| s.worker_groups[0].replicas = 3);
    h.pass().await.unwrap();
    let status = h.status();
    assert!(status.rollout_failure.is_some());
    assert!(status.pending_generation.is_none());
    assert_eq!(status.upgrade_state, UpgradeState::ActiveOnly);
    assert_eq!(h.workers_of("train-g0"), 3);
    assert!(h.pod_names().iter().all(|n| n.starts_with("train-g0")));
}

#[tokio::test]
async fn story_head_template_change_replaces_head_after_other_writes() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 2, UpgradeStrategyType::None));
    h.settle().await;
    let head_uid = h.uid("train-g0-head");

    h.edit(|s| {
        s.head_template.command = vec!["serve".into()];
        s.worker_groups[0].replicas = 1;
    });
    // The scale-down delete is issued first and takes the injected failure
    h.store.fail_next(
        FailOp::Delete(ObjectKind::Pod),
        StoreError::Transient {
            message: "connection reset".into(),
        },
    );
    let err = h.pass().await.unwrap_err();
    assert!(matches!(err, ReconcileError::Partial { failed: 1, .. }));
    assert!(h.store.pod(NS, "train-g0-head").is_none());
    assert!(h.store.pod(NS, "train-g0-worker-a-0").is_some());

    h.pass().await.unwrap();
    assert_eq!(h.pod_names(), vec!["train-g0-head", "train-g0-worker-a-1"]);
    assert_ne!(h.uid("train-g0-head"), head_uid);
    let head = h.store.pod(NS, "train-g0-head").unwrap();
    assert_eq!(
        head.spec.unwrap().containers[0].command,
        Some(vec!["serve".to_string()])
    );
    assert_eq!(h.status().active_generation_id.as_deref(), Some("train-g0"));

    h.settle().await;
    assert!(h.condition(READY).0);
}

#[tokio::test]
async fn story_failed_head_is_recreated() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 1, UpgradeStrategyType::None));
    h.settle().await;
    let head_uid = h.uid("train-g0-head");

    h.store.set_pod_phase(NS, "train-g0-head", "Failed").unwrap();
    h.pass().await.unwrap();
    assert!(h.store.pod(NS, "train-g0-head").is_none());
    assert!(h.store.pod(NS, "train-g0-worker-a-0").is_some());

    h.pass().await.unwrap();
    assert!(h.uid("train-g0-head").is_some());
    assert_ne!(h.uid("train-g0-head"), head_uid);
}

#[tokio::test]
async fn story_worker_over_restart_budget_is_replaced() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 2, UpgradeStrategyType::None));
    h.settle().await;

    // Still running, so only the restart count condemns it
    h.store.set_pod_restarts(NS, "train-g0-worker-a-0", 4).unwrap();
    h.pass().await.unwrap();

    assert_eq!(
        h.pod_names(),
        vec!["train-g0-head", "train-g0-worker-a-1", "train-g0-worker-a-2"]
    );
}

#[tokio::test]
async fn story_removed_group_is_torn_down() {
    let h = Harness::new();
    let mut two_groups = spec("runtime:1", 1, UpgradeStrategyType::None);
    let mut b = two_groups.worker_groups[0].clone();
    b.name = "b".into();
    two_groups.worker_groups.push(b);
    h.apply(two_groups);
    h.settle().await;
    assert!(h.store.pod(NS, "train-g0-worker-b-0").is_some());

    h.edit(|s| s.worker_groups.truncate(1));
    h.pass().await.unwrap();

    assert_eq!(h.pod_names(), vec!["train-g0-head", "train-g0-worker-a-0"]);
    let status = h.status();
    assert!(!status.worker_groups.contains_key("b"));
    assert_eq!(status.active_generation.unwrap().spec.worker_groups.len(), 1);
}

#[tokio::test]
async fn story_duplicate_head_is_deleted_and_eldest_kept() {
    let h = Harness::new();
    h.apply(spec("runtime:1", 1, UpgradeStrategyType::None));
    h.settle().await;
    let head_uid = h.uid("train-g0-head");

    let mut copy = h.store.pod(NS, "train-g0-head").unwrap();
    copy.metadata.name = Some("train-g0-head-copy".into());
    copy.metadata.uid = None;
    copy.metadata.resource_version = None;
    h.store.create(&ManagedObject::from(copy)).await.unwrap();

    h.pass().await.unwrap();
    assert_eq!(h.pod_names(), vec!["train-g0-head", "train-g0-worker-a-0"]);
    assert_eq!(h.uid("train-g0-head"), head_uid);
}

#[tokio::test]
async fn story_removed_env_leaves_no_trace_in_status() {
    let h = Harness::new();
    let mut with_env = spec("runtime:1", 1, UpgradeStrategyType::None);
    with_env
        .head_template
        .env
        .insert("MODE".into(), "debug".into());
    h.apply(with_env);
    h.settle().await;

    h.edit(|s| s.head_template.env.clear());
    h.settle().await;
    let active = h.status().active_generation.unwrap();
    assert!(active.spec.head_template.env.is_empty());

    let writes = h.store.write_count();
    assert_eq!(h.pass().await.unwrap(), Action::await_change());
    assert_eq!(h.store.write_count(), writes);
}
