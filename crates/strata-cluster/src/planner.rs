//! Topology planner
//!
//! Turns a generation's spec into the set of units that should exist. Pure and
//! deterministic: the same spec always yields the same entries and hashes.
//! Identities (names, ordinals) are assigned by the reconciler, not here.

use serde::Serialize;
use strata_common::crd::{ContainerTemplate, GenerationSpec, WorkerGroupSpec};
use strata_common::hash::hash_serialized;
use strata_common::labels::{Role, HEAD_GROUP};
use thiserror::Error;

/// Longest cluster name; keeps `<name>-g<n>-head` a valid service name
pub const MAX_CLUSTER_NAME_LEN: usize = 40;

/// Longest worker group name
pub const MAX_GROUP_NAME_LEN: usize = 40;

const QUANTITY_SUFFIXES: &[&str] = &[
    "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "m", "k", "M", "G", "T", "P", "E", "",
];

/// Desired state that cannot be planned
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    /// Resource name unusable for derived object names
    #[error("cluster name '{name}' is invalid: {reason}")]
    InvalidName {
        /// The offending name
        name: String,
        /// Why it is rejected
        reason: String,
    },

    /// Two worker groups share a name
    #[error("worker group name '{0}' is used more than once")]
    DuplicateGroup(String),

    /// Group name is not a DNS label or is reserved
    #[error("worker group name '{name}' is invalid: {reason}")]
    InvalidGroupName {
        /// The offending name
        name: String,
        /// Why it is rejected
        reason: String,
    },

    /// Replica count or bounds are inconsistent
    #[error("worker group '{group}': {message}")]
    InvalidReplicas {
        /// Group name
        group: String,
        /// What is wrong
        message: String,
    },

    /// Container template is malformed
    #[error("{unit} template: {message}")]
    InvalidTemplate {
        /// `head` or `worker group <name>`
        unit: String,
        /// What is wrong
        message: String,
    },

    /// Template could not be hashed
    #[error("failed to hash template: {0}")]
    Hash(String),
}

/// One line of the target topology
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedEntry {
    /// Head or worker
    pub role: Role,
    /// Group name (`head` for the head entry)
    pub group: String,
    /// Template every unit of this entry runs
    pub template: ContainerTemplate,
    /// Desired unit count
    pub count: usize,
    /// Hash of the full template
    pub template_hash: String,
    /// Hash of the template without its image
    pub immutable_hash: String,
    /// Specific members asked to be removed
    pub workers_to_delete: Vec<String>,
}

/// Desired shape of one generation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetTopology {
    /// Hash deciding whether a spec change needs a new generation
    pub rollout_hash: String,
    /// Head entry first, then worker groups in declaration order
    pub entries: Vec<PlannedEntry>,
}

impl TargetTopology {
    /// The head entry
    pub fn head(&self) -> Option<&PlannedEntry> {
        self.entries.iter().find(|e| e.role == Role::Head)
    }

    /// Worker entries in declaration order
    pub fn worker_groups(&self) -> impl Iterator<Item = &PlannedEntry> {
        self.entries.iter().filter(|e| e.role == Role::Worker)
    }

    /// Worker entry for a group
    pub fn group(&self, name: &str) -> Option<&PlannedEntry> {
        self.worker_groups().find(|e| e.group == name)
    }

    /// Total desired units, head included
    pub fn total_units(&self) -> usize {
        self.entries.iter().map(|e| e.count).sum()
    }
}

#[derive(Serialize)]
struct RolloutKey<'a> {
    head: &'a ContainerTemplate,
    groups: Vec<(&'a str, &'a ContainerTemplate)>,
}

/// Hash of everything that requires new units when it changes
///
/// Replica counts and bounds are excluded; they are applied in place.
pub fn rollout_hash(spec: &GenerationSpec) -> Result<String, PlanError> {
    let key = RolloutKey {
        head: &spec.head_template,
        groups: spec
            .worker_groups
            .iter()
            .map(|g| (g.name.as_str(), &g.template))
            .collect(),
    };
    hash_serialized(&key).map_err(|e| PlanError::Hash(e.to_string()))
}

/// Validate a spec and compute its target topology
pub fn plan(spec: &GenerationSpec) -> Result<TargetTopology, PlanError> {
    validate_template(HEAD_GROUP, &spec.head_template)?;

    let mut seen = std::collections::BTreeSet::new();
    for group in &spec.worker_groups {
        if !seen.insert(group.name.as_str()) {
            return Err(PlanError::DuplicateGroup(group.name.clone()));
        }
        validate_group(group)?;
    }

    let mut entries = Vec::with_capacity(spec.worker_groups.len() + 1);
    entries.push(entry(Role::Head, HEAD_GROUP, &spec.head_template, 1, &[])?);
    for group in &spec.worker_groups {
        entries.push(entry(
            Role::Worker,
            &group.name,
            &group.template,
            group.replicas as usize,
            &group.workers_to_delete,
        )?);
    }

    Ok(TargetTopology {
        rollout_hash: rollout_hash(spec)?,
        entries,
    })
}

fn entry(
    role: Role,
    group: &str,
    template: &ContainerTemplate,
    count: usize,
    workers_to_delete: &[String],
) -> Result<PlannedEntry, PlanError> {
    let hash = |t: &ContainerTemplate| hash_serialized(t).map_err(|e| PlanError::Hash(e.to_string()));
    Ok(PlannedEntry {
        role,
        group: group.to_string(),
        template: template.clone(),
        count,
        template_hash: hash(template)?,
        immutable_hash: hash(&template.without_image())?,
        workers_to_delete: workers_to_delete.to_vec(),
    })
}

/// Reject resource names that cannot prefix generation, pod and service names
pub fn validate_identity(name: &str) -> Result<(), PlanError> {
    let invalid = |reason: &str| {
        Err(PlanError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if name.len() > MAX_CLUSTER_NAME_LEN {
        return invalid(&format!("must be at most {MAX_CLUSTER_NAME_LEN} characters"));
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return invalid("must start with a lowercase letter");
    }
    if !is_dns_label(name) {
        return invalid("must consist of lowercase letters, digits and '-'");
    }
    Ok(())
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

fn validate_group(group: &WorkerGroupSpec) -> Result<(), PlanError> {
    let bad_name = |reason: &str| {
        Err(PlanError::InvalidGroupName {
            name: group.name.clone(),
            reason: reason.to_string(),
        })
    };
    if group.name.len() > MAX_GROUP_NAME_LEN {
        return bad_name(&format!("must be at most {MAX_GROUP_NAME_LEN} characters"));
    }
    if !is_dns_label(&group.name) {
        return bad_name("must be a DNS label");
    }
    if group.name == HEAD_GROUP {
        return bad_name("'head' is reserved");
    }

    let bad_replicas = |message: String| {
        Err(PlanError::InvalidReplicas {
            group: group.name.clone(),
            message,
        })
    };
    if group.replicas < 0 || group.min_replicas < 0 {
        return bad_replicas("replica counts must be non-negative".into());
    }
    if let Some(max) = group.max_replicas {
        if max < group.min_replicas {
            return bad_replicas(format!(
                "maxReplicas {max} is below minReplicas {}",
                group.min_replicas
            ));
        }
        if group.replicas > max {
            return bad_replicas(format!(
                "replicas {} exceeds maxReplicas {max}",
                group.replicas
            ));
        }
    }
    if group.replicas < group.min_replicas {
        return bad_replicas(format!(
            "replicas {} is below minReplicas {}",
            group.replicas, group.min_replicas
        ));
    }

    validate_template(&format!("worker group {}", group.name), &group.template)
}

fn validate_template(unit: &str, template: &ContainerTemplate) -> Result<(), PlanError> {
    let bad = |message: String| {
        Err(PlanError::InvalidTemplate {
            unit: unit.to_string(),
            message,
        })
    };

    if template.image.trim().is_empty() {
        return bad("image is required".into());
    }
    if template.image.chars().any(char::is_whitespace) {
        return bad(format!("image '{}' contains whitespace", template.image));
    }

    let mut names = std::collections::BTreeSet::new();
    let mut numbers = std::collections::BTreeSet::new();
    for port in &template.ports {
        if !(1..=65535).contains(&port.container_port) {
            return bad(format!("port {} is out of range", port.container_port));
        }
        if port.name.is_empty() || port.name.len() > 15 || !is_dns_label(&port.name) {
            return bad(format!("port name '{}' is invalid", port.name));
        }
        if !names.insert(port.name.as_str()) {
            return bad(format!("port name '{}' is duplicated", port.name));
        }
        if !numbers.insert(port.container_port) {
            return bad(format!("port {} is duplicated", port.container_port));
        }
    }

    for key in template.env.keys() {
        let valid = !key.is_empty()
            && !key.starts_with(|c: char| c.is_ascii_digit())
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return bad(format!("environment variable name '{key}' is invalid"));
        }
    }

    if let Some(resources) = &template.resources {
        for (field, value) in [("cpu", &resources.cpu), ("memory", &resources.memory)] {
            if let Some(q) = value {
                if !is_quantity(q) {
                    return bad(format!("{field} quantity '{q}' is malformed"));
                }
            }
        }
        if let Some(gpu) = &resources.gpu {
            if gpu.parse::<u32>().is_err() {
                return bad(format!("gpu count '{gpu}' must be a whole number"));
            }
        }
    }

    if let Some(probe) = &template.readiness_probe {
        if !(1..=65535).contains(&probe.port) {
            return bad(format!("readiness probe port {} is out of range", probe.port));
        }
        if probe.period_seconds < 1 || probe.initial_delay_seconds < 0 {
            return bad("readiness probe timing must be positive".into());
        }
        if let Some(path) = &probe.path {
            if !path.starts_with('/') {
                return bad(format!("readiness probe path '{path}' must start with '/'"));
            }
        }
    }

    Ok(())
}

/// Accepts the decimal forms of Kubernetes quantities ("500m", "1.5", "4Gi")
fn is_quantity(s: &str) -> bool {
    QUANTITY_SUFFIXES.iter().any(|suffix| {
        s.strip_suffix(suffix).is_some_and(|number| {
            let mut parts = number.splitn(2, '.');
            let whole = parts.next().unwrap_or_default();
            let frac = parts.next();
            let digits = |p: &str| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit());
            match frac {
                None => digits(whole),
                Some(f) => (whole.is_empty() || digits(whole)) && digits(f),
            }
        })
    })
}
