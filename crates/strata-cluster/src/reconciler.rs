//! StrataCluster reconcile pass
//!
//! One pass, in order:
//! 1. fetch the cluster (gone or deleting: nothing to do)
//! 2. validate and plan the desired spec (invalid: report and stop, no writes)
//! 3. observe pods and services, advance the upgrade state machine
//! 4. converge the active generation, then the pending one
//! 5. point traffic at the right generation, completing a cutover if due
//! 6. sweep generations that are no longer live, then run deferred deletes
//! 7. aggregate and write status if it changed

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use strata_common::config::OperatorConfig;
use strata_common::crd::{GenerationRecord, StrataCluster, StrataClusterStatus, UpgradeState};
use strata_common::labels::cluster_selector;
use strata_common::store::{ManagedObject, ObjectKind, StateStore};
use strata_runtime::{Action, ObjectKey};

use crate::apply::{PassWriter, UpdateOutcome};
use crate::error::ReconcileError;
use crate::observed::{Health, ObservedGeneration, ObservedTopology, ObservedUnit};
use crate::planner::{plan, validate_identity, TargetTopology};
use crate::resources::{
    head_pod_name, render_head_service, render_pod, serving_service_name, with_image,
    worker_pod_name,
};
use crate::routing::ensure_serving;
use crate::status::{aggregate, invalid_spec_conditions, StatusInput, READY};
use crate::upgrade::{advance, complete_cutover, live_generations, UpgradeInput};

/// Shared state for every reconcile pass
pub struct Context {
    pub store: Arc<dyn StateStore>,
    pub config: OperatorConfig,
}

impl Context {
    pub fn new(store: Arc<dyn StateStore>, config: OperatorConfig) -> Self {
        Self { store, config }
    }
}

/// Reconcile one StrataCluster
#[instrument(skip(key, ctx), fields(cluster = %key))]
pub async fn reconcile(key: &ObjectKey, ctx: &Context) -> Result<Action, ReconcileError> {
    let store = Arc::clone(&ctx.store);
    let config = &ctx.config;

    let Some(cluster) = store
        .get_cluster(&key.namespace, &key.name)
        .await
        .map_err(|e| ReconcileError::store(&key.name, e))?
    else {
        debug!("cluster no longer exists");
        return Ok(Action::await_change());
    };
    if cluster.metadata.deletion_timestamp.is_some() {
        debug!("cluster is being deleted, owner references handle cleanup");
        return Ok(Action::await_change());
    }

    let name = cluster.name_any();
    let namespace = key.namespace.clone();
    let now = Utc::now();
    let persisted = cluster.status.clone().unwrap_or_default();

    let desired = cluster.spec.generation_spec();
    let desired_target = match validate_identity(&name).and_then(|_| plan(&desired)) {
        Ok(target) => target,
        Err(e) => {
            warn!(error = %e, "spec is invalid, leaving sub-resources untouched");
            let mut status = persisted.clone();
            status.conditions = invalid_spec_conditions(&persisted.conditions, &e, now);
            status.observed_generation = cluster.metadata.generation;
            write_status(ctx, &cluster, &persisted, status).await?;
            return Ok(Action::await_change());
        }
    };

    let selector = cluster_selector(&name);
    let mut objects = store
        .list(ObjectKind::Pod, &namespace, &selector)
        .await
        .map_err(|e| ReconcileError::store(&name, e))?;
    objects.extend(
        store
            .list(ObjectKind::Service, &namespace, &selector)
            .await
            .map_err(|e| ReconcileError::store(&name, e))?,
    );
    let observed = ObservedTopology::build(&objects);

    let deadline = cluster
        .spec
        .health_check_deadline_seconds()
        .map(std::time::Duration::from_secs)
        .unwrap_or(config.health_check_deadline);
    let decision = advance(&UpgradeInput {
        cluster: &name,
        status: &persisted,
        desired: &desired,
        desired_hash: &desired_target.rollout_hash,
        strategy: cluster.spec.strategy_type(),
        suspend: cluster.spec.suspend,
        deadline: chrono::Duration::from_std(deadline).unwrap_or(chrono::Duration::MAX),
        observed: &observed,
        now,
    });
    for (from, to) in &decision.transitions {
        info!(%from, %to, "upgrade state changed");
    }
    let mut next = decision.status;

    let mut writer = PassWriter::new(
        Arc::clone(&store),
        &name,
        &namespace,
        config.max_conflict_retries,
    );

    if cluster.spec.suspend {
        suspend(&mut writer, &observed).await;
        next.traffic_generation_id = None;
    } else {
        let records: Vec<GenerationRecord> = [&next.active_generation, &next.pending_generation]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        for record in records {
            let target = match plan(&record.spec) {
                Ok(target) => target,
                Err(e) => {
                    warn!(generation = %record.id, error = %e, "stored generation cannot be planned");
                    continue;
                }
            };
            let head_running = converge_generation(
                &mut writer,
                &cluster,
                &record,
                &target,
                observed.generation(&record.id),
                config,
            )
            .await;
            if head_running {
                mark_head_started(&mut next, &record.id, now);
            }
        }

        route(&mut writer, &cluster, &mut next, decision.cutover.map(|c| c.to)).await;
    }

    let live = live_generations(&persisted, &next);
    sweep(&mut writer, &observed, &live).await;
    writer.flush_deferred().await;

    let active_target = next
        .active_generation
        .as_ref()
        .and_then(|record| plan(&record.spec).ok());
    aggregate(
        &StatusInput {
            status: &next,
            active_target: active_target.as_ref(),
            observed: &observed,
            suspend: cluster.spec.suspend,
            restart_budget: config.restart_budget,
        },
        &persisted.conditions,
        now,
    )
    .apply_to(&mut next);
    next.observed_generation = cluster.metadata.generation;

    let ready = next.get_condition(READY).is_some_and(|c| c.is_true());
    let converging = writer.mutations() > 0
        || next.upgrade_state != UpgradeState::ActiveOnly
        || (!cluster.spec.suspend && !ready);

    let status_result = write_status(ctx, &cluster, &persisted, next).await;
    if let Some(err) = writer.into_error() {
        return Err(err);
    }
    status_result?;

    if converging {
        Ok(Action::requeue(config.progress_requeue))
    } else {
        Ok(Action::await_change())
    }
}

fn mark_head_started(status: &mut StrataClusterStatus, id: &str, now: DateTime<Utc>) {
    for record in [
        status.active_generation.as_mut(),
        status.pending_generation.as_mut(),
    ]
    .into_iter()
    .flatten()
    {
        if record.id == id && record.head_started_at.is_none() {
            info!(generation = id, "head is running");
            record.head_started_at = Some(now);
        }
    }
}

/// Converge one generation; returns whether its head is running
async fn converge_generation(
    writer: &mut PassWriter,
    cluster: &StrataCluster,
    record: &GenerationRecord,
    target: &TargetTopology,
    observed: Option<&ObservedGeneration>,
    config: &OperatorConfig,
) -> bool {
    let id = record.id.as_str();

    if observed.and_then(|g| g.head_service.as_ref()).is_none() {
        let service = render_head_service(cluster, id, &record.spec.head_template);
        writer.create(service.into()).await;
    }

    let head_running = converge_head(writer, cluster, id, target, observed).await;
    let started = record.head_started_at.is_some() || head_running;

    for entry in target.worker_groups() {
        let units: Vec<&ObservedUnit> = observed
            .and_then(|g| g.workers.get(&entry.group))
            .into_iter()
            .flatten()
            .collect();

        let mut keep = Vec::new();
        for unit in units.iter().filter(|u| !u.terminating) {
            let reason = if entry.workers_to_delete.contains(&unit.name) {
                Some("requested")
            } else if unit.health == Health::Failed {
                Some("failed")
            } else if unit.restarts > config.restart_budget {
                Some("restart budget exceeded")
            } else if unit.template_hash.as_deref() != Some(entry.template_hash.as_str()) {
                Some("stale template")
            } else {
                None
            };
            match reason {
                Some(reason) => {
                    writer.delete(ObjectKind::Pod, &unit.name, reason).await;
                }
                None => keep.push(*unit),
            }
        }

        if keep.len() > entry.count {
            // keep is eldest first
            for unit in &keep[..keep.len() - entry.count] {
                writer.delete(ObjectKind::Pod, &unit.name, "scale down").await;
            }
            continue;
        }

        let deficit = entry.count - keep.len();
        if deficit == 0 {
            continue;
        }
        if !started {
            debug!(generation = id, group = %entry.group, deficit, "deferring workers until head runs");
            continue;
        }
        let taken: BTreeSet<String> = units.iter().map(|u| u.name.clone()).collect();
        let mut created = 0;
        let mut ordinal = 0u32;
        while created < deficit {
            let name = worker_pod_name(id, &entry.group, ordinal);
            ordinal += 1;
            if taken.contains(&name) {
                continue;
            }
            writer
                .create(render_pod(cluster, id, entry, name).into())
                .await;
            created += 1;
        }
    }

    // Groups dropped from the spec
    if let Some(generation) = observed {
        for (group, units) in &generation.workers {
            if target.group(group).is_some() {
                continue;
            }
            for unit in units.iter().filter(|u| !u.terminating) {
                writer.delete(ObjectKind::Pod, &unit.name, "group removed").await;
            }
        }
    }

    head_running
}

async fn converge_head(
    writer: &mut PassWriter,
    cluster: &StrataCluster,
    id: &str,
    target: &TargetTopology,
    observed: Option<&ObservedGeneration>,
) -> bool {
    let Some(entry) = target.head() else {
        return false;
    };

    if let Some(generation) = observed {
        for extra in generation.extra_heads.iter().filter(|u| !u.terminating) {
            writer.delete(ObjectKind::Pod, &extra.name, "duplicate head").await;
        }
    }

    let Some(head) = observed.and_then(|g| g.head.as_ref()) else {
        writer
            .create(render_pod(cluster, id, entry, head_pod_name(id)).into())
            .await;
        return false;
    };

    if head.terminating {
        return false;
    }
    if head.health == Health::Failed {
        writer.delete_last(ObjectKind::Pod, &head.name);
        return false;
    }
    if head.template_hash.as_deref() == Some(entry.template_hash.as_str()) {
        return head.health == Health::Running;
    }
    if head.immutable_hash.as_deref() == Some(entry.immutable_hash.as_str()) {
        let outcome = writer
            .update(ObjectKind::Pod, &head.name, |current| {
                let pod = current.as_pod()?;
                let current_hash = pod
                    .annotations()
                    .get(strata_common::labels::TEMPLATE_HASH_ANNOTATION);
                if current_hash == Some(&entry.template_hash) {
                    return None;
                }
                Some(ManagedObject::from(with_image(pod, entry)))
            })
            .await;
        if let UpdateOutcome::Updated(_) = outcome {
            info!(generation = id, image = %entry.template.image, "head image updated in place");
        }
        return head.health == Health::Running;
    }

    writer.delete_last(ObjectKind::Pod, &head.name);
    false
}

/// Point traffic at the cutover target or the active generation
async fn route(
    writer: &mut PassWriter,
    cluster: &StrataCluster,
    status: &mut StrataClusterStatus,
    cutover_to: Option<String>,
) {
    let target = cutover_to
        .clone()
        .or_else(|| status.active_generation_id.clone());
    let Some(target) = target else {
        return;
    };
    let Some(record) = [&status.active_generation, &status.pending_generation]
        .into_iter()
        .flatten()
        .find(|r| r.id == target)
    else {
        return;
    };

    let result = ensure_serving(
        writer.store(),
        cluster,
        &target,
        &record.spec.head_template,
        writer.max_conflict_retries(),
    )
    .await;
    match result {
        Ok(_) => {
            if cutover_to.is_some() {
                complete_cutover(status);
                info!(generation = %target, "cutover complete");
            }
            status.traffic_generation_id = Some(target);
        }
        Err(e) => writer.fail(
            "route",
            ObjectKind::Service,
            &serving_service_name(&cluster.name_any()),
            e,
        ),
    }
}

/// Delete every managed object of a suspended cluster
async fn suspend(writer: &mut PassWriter, observed: &ObservedTopology) {
    for generation in observed.generations.values() {
        for (kind, name) in generation.deletable_objects() {
            writer.delete(kind, &name, "suspended").await;
        }
    }
    if let Some(name) = observed.serving.as_ref().and_then(|s| s.metadata.name.clone()) {
        writer.delete(ObjectKind::Service, &name, "suspended").await;
    }
}

/// Delete objects of generations that are no longer live
async fn sweep(writer: &mut PassWriter, observed: &ObservedTopology, live: &BTreeSet<String>) {
    for (id, generation) in &observed.generations {
        if live.contains(id) {
            continue;
        }
        for (kind, name) in generation.deletable_objects() {
            writer.delete(kind, &name, "generation superseded").await;
        }
    }
    for (kind, name) in &observed.unassigned {
        writer.delete(*kind, name, "no generation").await;
    }
}

/// Write status if it changed, re-reading on version conflicts
///
/// A conflict caused by a spec change is returned so the pass reruns
/// against the new spec; other conflicts are retried with the fresh version.
async fn write_status(
    ctx: &Context,
    cluster: &StrataCluster,
    persisted: &StrataClusterStatus,
    next: StrataClusterStatus,
) -> Result<(), ReconcileError> {
    if next == *persisted {
        debug!("status unchanged");
        return Ok(());
    }

    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let mut current = cluster.clone();
    for attempt in 0..=ctx.config.max_conflict_retries {
        match ctx.store.update_cluster_status(&current, &next).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(attempt, "status write conflicted, re-reading");
                let Some(fresh) = ctx
                    .store
                    .get_cluster(&namespace, &name)
                    .await
                    .map_err(|e| ReconcileError::store(&name, e))?
                else {
                    return Ok(());
                };
                if fresh.metadata.generation != cluster.metadata.generation
                    || fresh.status.clone().unwrap_or_default() != *persisted
                {
                    return Err(ReconcileError::Conflict { cluster: name });
                }
                current = fresh;
            }
            Err(e) => return Err(ReconcileError::store(&name, e)),
        }
    }
    Err(ReconcileError::Conflict { cluster: name })
}
