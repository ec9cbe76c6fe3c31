//! Supporting types for the StrataCluster CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Template for a single process unit (head or worker)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ContainerTemplate {
    /// Container image reference
    pub image: String,

    /// Entrypoint override
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Arguments to the entrypoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Ports exposed by the unit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,

    /// Resource requests (also used as limits)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,

    /// HTTP or TCP readiness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<ProbeSpec>,
}

impl ContainerTemplate {
    /// Copy of this template with the image cleared
    ///
    /// Everything but the image is immutable on a running pod, so this is
    /// what decides between an in-place update and a replacement.
    pub fn without_image(&self) -> Self {
        Self {
            image: String::new(),
            ..self.clone()
        }
    }
}

/// A named container port
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    /// Port name (IANA_SVC_NAME)
    pub name: String,
    /// Port number in the container
    pub container_port: i32,
}

/// Compute resources for a unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory quantity (e.g., "4Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// Number of GPUs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

/// Readiness probe. HTTP GET when `path` is set, TCP otherwise.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    /// Port to probe
    pub port: i32,
    /// HTTP path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Seconds before the first probe
    #[serde(default)]
    pub initial_delay_seconds: i32,
    /// Seconds between probes
    #[serde(default = "default_probe_period")]
    pub period_seconds: i32,
}

fn default_probe_period() -> i32 {
    10
}

/// A named group of identical worker units
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGroupSpec {
    /// Group name, unique within the cluster
    pub name: String,

    /// Desired number of workers
    pub replicas: i32,

    /// Lower bound for `replicas`
    #[serde(default)]
    pub min_replicas: i32,

    /// Upper bound for `replicas` (unbounded when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// Worker template
    pub template: ContainerTemplate,

    /// Specific members to remove, e.g. chosen by an external autoscaler
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workers_to_delete: Vec<String>,
}

/// The part of the spec captured by a generation snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSpec {
    /// Head unit template
    pub head_template: ContainerTemplate,
    /// Worker groups in declaration order
    #[serde(default)]
    pub worker_groups: Vec<WorkerGroupSpec>,
}

impl GenerationSpec {
    /// Look up a worker group by name
    pub fn group(&self, name: &str) -> Option<&WorkerGroupSpec> {
        self.worker_groups.iter().find(|g| g.name == name)
    }
}

/// How template changes are rolled out
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStrategy {
    /// Strategy type
    #[serde(rename = "type", default)]
    pub type_: UpgradeStrategyType,

    /// How long a pending generation may take to become ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_deadline_seconds: Option<u64>,
}

/// Rollout strategy type
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpgradeStrategyType {
    /// Converge the running generation in place
    #[default]
    None,
    /// Stand up a new generation beside the active one and cut over when healthy
    RollingRecreate,
}

/// Persisted state of the upgrade state machine
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpgradeState {
    /// No generation exists yet
    #[default]
    NoActive,
    /// One generation is active and serving
    ActiveOnly,
    /// A pending generation is coming up beside the active one
    ActivePending,
    /// The pending generation is ready; traffic is being switched
    CuttingOver,
    /// The previous generation is being torn down
    Draining,
}

impl std::fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoActive => write!(f, "NoActive"),
            Self::ActiveOnly => write!(f, "ActiveOnly"),
            Self::ActivePending => write!(f, "ActivePending"),
            Self::CuttingOver => write!(f, "CuttingOver"),
            Self::Draining => write!(f, "Draining"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Map a boolean onto True/False
    pub fn from_bool(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (Ready, Upgrading, Failed)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::at(type_, status, reason, message, Utc::now())
    }

    /// Create a new condition with an explicit transition time
    pub fn at(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        last_transition_time: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time,
        }
    }

    /// True when the condition status is True
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}
