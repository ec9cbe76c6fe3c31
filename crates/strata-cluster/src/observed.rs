//! Ownership index rebuilt from labels on every pass
//!
//! Nothing here is cached between passes: the listed pods and services are
//! grouped by the generation, role and group labels the operator stamped on
//! them at creation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Pod, Service};
use strata_common::labels::{
    Role, ENDPOINT_LABEL, GENERATION_LABEL, GROUP_LABEL, IMMUTABLE_HASH_ANNOTATION, ROLE_LABEL,
    SERVING_ENDPOINT, TEMPLATE_HASH_ANNOTATION,
};
use strata_common::store::{ManagedObject, ObjectKind};

use crate::planner::TargetTopology;

/// Coarse pod health
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    Pending,
    Running,
    Failed,
    Unknown,
}

impl Health {
    fn from_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Running") => Health::Running,
            Some("Pending") => Health::Pending,
            Some("Failed") | Some("Succeeded") => Health::Failed,
            _ => Health::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Pending => "Pending",
            Health::Running => "Running",
            Health::Failed => "Failed",
            Health::Unknown => "Unknown",
        }
    }
}

/// One observed head or worker pod
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedUnit {
    pub name: String,
    pub role: Role,
    pub group: String,
    pub health: Health,
    pub ready: bool,
    /// Highest restart count across containers
    pub restarts: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub template_hash: Option<String>,
    pub immutable_hash: Option<String>,
    pub terminating: bool,
    /// Trailing ordinal of a worker name
    pub ordinal: Option<u32>,
    pub pod: Pod,
}

impl ObservedUnit {
    fn from_pod(pod: &Pod, role: Role, group: &str) -> Self {
        let meta = &pod.metadata;
        let status = pod.status.as_ref();
        let name = meta.name.clone().unwrap_or_default();
        let annotation = |key: &str| {
            meta.annotations
                .as_ref()
                .and_then(|a| a.get(key))
                .cloned()
        };

        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"));
        let restarts = status
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|cs| cs.iter().map(|c| c.restart_count).max())
            .unwrap_or(0);
        let ordinal = match role {
            Role::Worker => name.rsplit('-').next().and_then(|s| s.parse().ok()),
            Role::Head => None,
        };

        Self {
            role,
            group: group.to_string(),
            health: Health::from_phase(status.and_then(|s| s.phase.as_deref())),
            ready,
            restarts,
            created_at: meta.creation_timestamp.as_ref().map(|t| t.0),
            template_hash: annotation(TEMPLATE_HASH_ANNOTATION),
            immutable_hash: annotation(IMMUTABLE_HASH_ANNOTATION),
            terminating: meta.deletion_timestamp.is_some(),
            ordinal,
            pod: pod.clone(),
            name,
        }
    }

    /// Running, ready, and not on its way out
    pub fn is_serving(&self) -> bool {
        self.health == Health::Running && self.ready && !self.terminating
    }
}

/// Everything observed for one generation id
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedGeneration {
    pub id: String,
    /// The head; when several pods claim the role, the eldest
    pub head: Option<ObservedUnit>,
    /// Further pods claiming the head role
    pub extra_heads: Vec<ObservedUnit>,
    pub head_service: Option<Service>,
    /// Workers per group, eldest first
    pub workers: BTreeMap<String, Vec<ObservedUnit>>,
    /// Objects under this generation that match neither role
    pub strays: Vec<(ObjectKind, String)>,
}

impl ObservedGeneration {
    /// Number of objects still carrying this generation's label
    pub fn object_count(&self) -> usize {
        usize::from(self.head.is_some())
            + self.extra_heads.len()
            + usize::from(self.head_service.is_some())
            + self.workers.values().map(Vec::len).sum::<usize>()
            + self.strays.len()
    }

    /// Workers of a group that are not terminating
    pub fn live_workers(&self, group: &str) -> impl Iterator<Item = &ObservedUnit> {
        self.workers
            .get(group)
            .into_iter()
            .flatten()
            .filter(|u| !u.terminating)
    }

    /// Head and every group at the planned count, all running and ready on
    /// the planned templates
    pub fn is_ready(&self, target: &TargetTopology) -> bool {
        let current = |unit: &ObservedUnit, hash: &str| {
            unit.is_serving() && unit.template_hash.as_deref() == Some(hash)
        };

        let head_ok = match (&self.head, target.head()) {
            (Some(head), Some(entry)) => current(head, &entry.template_hash),
            _ => false,
        };
        head_ok
            && target.worker_groups().all(|entry| {
                let live: Vec<_> = self.live_workers(&entry.group).collect();
                live.len() == entry.count && live.iter().all(|u| current(u, &entry.template_hash))
            })
    }

    /// Objects under this generation that are not already terminating
    pub fn deletable_objects(&self) -> Vec<(ObjectKind, String)> {
        let mut objects: Vec<(ObjectKind, String)> = self
            .head
            .iter()
            .chain(self.extra_heads.iter())
            .chain(self.workers.values().flatten())
            .filter(|u| !u.terminating)
            .map(|u| (ObjectKind::Pod, u.name.clone()))
            .collect();
        if let Some(svc) = &self.head_service {
            objects.push((
                ObjectKind::Service,
                svc.metadata.name.clone().unwrap_or_default(),
            ));
        }
        objects.extend(self.strays.iter().cloned());
        objects
    }
}

/// All managed objects of one cluster, indexed by generation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedTopology {
    pub generations: BTreeMap<String, ObservedGeneration>,
    pub serving: Option<Service>,
    /// Objects with the owner label but no generation (other than the serving service)
    pub unassigned: Vec<(ObjectKind, String)>,
}

impl ObservedTopology {
    /// Index listed pods and services
    pub fn build(objects: &[ManagedObject]) -> Self {
        let mut topology = Self::default();

        for object in objects {
            let name = object.name().to_string();
            let Some(generation) = object.label(GENERATION_LABEL) else {
                match object {
                    ManagedObject::Service(svc)
                        if object.label(ENDPOINT_LABEL) == Some(SERVING_ENDPOINT) =>
                    {
                        topology.serving = Some(svc.clone());
                    }
                    _ => topology.unassigned.push((object.kind(), name)),
                }
                continue;
            };

            let observed = topology
                .generations
                .entry(generation.to_string())
                .or_insert_with(|| ObservedGeneration {
                    id: generation.to_string(),
                    ..Default::default()
                });

            match object {
                ManagedObject::Service(svc) if observed.head_service.is_none() => {
                    observed.head_service = Some(svc.clone());
                }
                ManagedObject::Service(_) => observed.strays.push((ObjectKind::Service, name)),
                ManagedObject::Pod(pod) => {
                    let role = object.label(ROLE_LABEL).and_then(Role::parse);
                    let group = object.label(GROUP_LABEL);
                    match (role, group) {
                        (Some(Role::Head), _) => observed
                            .extra_heads
                            .push(ObservedUnit::from_pod(pod, Role::Head, "head")),
                        (Some(Role::Worker), Some(group)) => observed
                            .workers
                            .entry(group.to_string())
                            .or_default()
                            .push(ObservedUnit::from_pod(pod, Role::Worker, group)),
                        _ => observed.strays.push((ObjectKind::Pod, name)),
                    }
                }
            }
        }

        for observed in topology.generations.values_mut() {
            observed.extra_heads.sort_by(eldest_first);
            if !observed.extra_heads.is_empty() {
                observed.head = Some(observed.extra_heads.remove(0));
            }
            for units in observed.workers.values_mut() {
                units.sort_by(eldest_first);
            }
        }

        topology
    }

    pub fn generation(&self, id: &str) -> Option<&ObservedGeneration> {
        self.generations.get(id)
    }

    /// Objects still labeled with a generation; zero when it is gone
    pub fn object_count(&self, id: &str) -> usize {
        self.generation(id)
            .map(ObservedGeneration::object_count)
            .unwrap_or(0)
    }

    /// Generation the serving service currently selects
    pub fn serving_generation(&self) -> Option<&str> {
        self.serving.as_ref().and_then(crate::resources::serving_target)
    }
}

/// Order by creation time then name, so ties break deterministically
pub fn eldest_first(a: &ObservedUnit, b: &ObservedUnit) -> std::cmp::Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.name.cmp(&b.name))
}
