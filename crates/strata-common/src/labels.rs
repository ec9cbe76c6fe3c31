//! Label and annotation contract for managed sub-resources
//!
//! Every object the operator creates carries the management and owner labels.
//! Pods and per-generation services also carry generation, role and group, and
//! the ownership index is rebuilt from these labels on every pass.

use std::collections::BTreeMap;
use std::fmt;

/// Standard label marking objects created by this operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "strata-operator";

/// Name of the owning StrataCluster
pub const OWNER_LABEL: &str = "strata.dev/owner-resource";

/// Generation id the object belongs to
pub const GENERATION_LABEL: &str = "strata.dev/generation";

/// Unit role: `head` or `worker`
pub const ROLE_LABEL: &str = "strata.dev/role";

/// Worker group name (`head` for the head unit)
pub const GROUP_LABEL: &str = "strata.dev/group";

/// Marks the traffic-routing service
pub const ENDPOINT_LABEL: &str = "strata.dev/endpoint";

/// Value of [`ENDPOINT_LABEL`] on the serving service
pub const SERVING_ENDPOINT: &str = "serving";

/// Hash of the full unit template
pub const TEMPLATE_HASH_ANNOTATION: &str = "strata.dev/template-hash";

/// Hash of the template with mutable fields (image) cleared
pub const IMMUTABLE_HASH_ANNOTATION: &str = "strata.dev/immutable-hash";

/// Group label value used for the head unit
pub const HEAD_GROUP: &str = "head";

/// Role of a unit within a generation
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// The single coordinating unit
    Head,
    /// A member of a worker group
    Worker,
}

impl Role {
    /// Label value for this role
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Head => "head",
            Role::Worker => "worker",
        }
    }

    /// Parse a role label value
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "head" => Some(Role::Head),
            "worker" => Some(Role::Worker),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Equality-based label selector
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    /// Empty selector (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `key=value` requirement
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// True if every requirement is present in `labels`
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Requirements as a map
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Selector for everything the operator manages
pub fn managed_selector() -> LabelSelector {
    LabelSelector::new().with(MANAGED_BY_LABEL, MANAGED_BY_VALUE)
}

/// Selector for everything the operator manages for one cluster
pub fn cluster_selector(cluster: &str) -> LabelSelector {
    managed_selector().with(OWNER_LABEL, cluster)
}

/// Labels on objects owned by a cluster but not tied to a generation
pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    cluster_selector(cluster).0
}

/// Full label set for a unit of a generation
pub fn unit_labels(
    cluster: &str,
    generation: &str,
    role: Role,
    group: &str,
) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert(GENERATION_LABEL.to_string(), generation.to_string());
    labels.insert(ROLE_LABEL.to_string(), role.as_str().to_string());
    labels.insert(GROUP_LABEL.to_string(), group.to_string());
    labels
}

/// Pod selector for the head of a generation
pub fn head_selector(cluster: &str, generation: &str) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::new();
    selector.insert(OWNER_LABEL.to_string(), cluster.to_string());
    selector.insert(ROLE_LABEL.to_string(), Role::Head.as_str().to_string());
    selector.insert(GENERATION_LABEL.to_string(), generation.to_string());
    selector
}
