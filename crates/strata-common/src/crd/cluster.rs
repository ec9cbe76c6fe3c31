//! StrataCluster Custom Resource Definition
//!
//! A StrataCluster is one head unit plus named worker groups. The operator
//! runs it as a sequence of immutable generations; status records which
//! generation serves traffic and where any rollout stands.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, ContainerTemplate, GenerationSpec, UpgradeState, UpgradeStrategy,
    UpgradeStrategyType, WorkerGroupSpec,
};

/// Specification for a StrataCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strata.dev",
    version = "v1alpha1",
    kind = "StrataCluster",
    plural = "strataclusters",
    shortname = "sc",
    status = "StrataClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Active","type":"string","jsonPath":".status.activeGenerationID"}"#,
    printcolumn = r#"{"name":"Pending","type":"string","jsonPath":".status.pendingGenerationID"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.upgradeState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StrataClusterSpec {
    /// Template for the single head unit
    pub head_template: ContainerTemplate,

    /// Worker groups, in declaration order
    #[serde(default)]
    pub worker_groups: Vec<WorkerGroupSpec>,

    /// Rollout strategy for template changes (defaults to in-place)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_strategy: Option<UpgradeStrategy>,

    /// Remove all units while keeping the resource and its history
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub suspend: bool,
}

impl StrataClusterSpec {
    /// Snapshot of the fields a generation captures
    pub fn generation_spec(&self) -> GenerationSpec {
        GenerationSpec {
            head_template: self.head_template.clone(),
            worker_groups: self.worker_groups.clone(),
        }
    }

    /// Effective rollout strategy
    pub fn strategy_type(&self) -> UpgradeStrategyType {
        self.upgrade_strategy
            .as_ref()
            .map(|s| s.type_)
            .unwrap_or_default()
    }

    /// Per-resource health-check deadline override, in seconds
    pub fn health_check_deadline_seconds(&self) -> Option<u64> {
        self.upgrade_strategy
            .as_ref()
            .and_then(|s| s.health_check_deadline_seconds)
    }
}

/// Snapshot of one generation as persisted in status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRecord {
    /// Generation id, `<cluster>-g<number>`
    pub id: String,
    /// Monotonic generation number
    pub number: u64,
    /// Hash of the templates this generation was created from
    pub rollout_hash: String,
    /// Spec snapshot
    pub spec: GenerationSpec,
    /// When the generation was created
    pub created_at: DateTime<Utc>,
    /// When the generation first passed the readiness gate
    pub ready_at: Option<DateTime<Utc>>,
    /// When the head was first observed running
    pub head_started_at: Option<DateTime<Utc>>,
}

impl GenerationRecord {
    /// Generation id for a cluster name and number
    pub fn id_for(cluster: &str, number: u64) -> String {
        format!("{cluster}-g{number}")
    }
}

/// Record of the last rollout that was abandoned
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutFailure {
    /// The discarded generation
    #[serde(rename = "generationID")]
    pub generation_id: String,
    /// Rollout hash of the discarded generation
    pub rollout_hash: String,
    /// Why it was discarded
    pub reason: String,
    /// When it was discarded
    pub failed_at: DateTime<Utc>,
}

/// Observed state of the active head
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeadStatus {
    /// Pod name
    pub name: String,
    /// Health as observed this pass
    pub health: String,
    /// Container restart count
    pub restarts: i32,
}

/// Observed state of one worker group of the active generation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGroupStatus {
    /// Desired member count
    pub desired: i32,
    /// Observed member count
    pub observed: i32,
    /// Members currently running
    pub running: i32,
}

/// Status for a StrataCluster
///
/// Written whole with a status PUT; nothing is merged with the stored copy.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrataClusterStatus {
    /// Ready, Upgrading and Failed conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Spec generation this status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Upgrade state machine position
    #[serde(default)]
    pub upgrade_state: UpgradeState,

    /// Generation receiving traffic
    #[serde(default, rename = "activeGenerationID")]
    pub active_generation_id: Option<String>,

    /// Generation being rolled out
    #[serde(default, rename = "pendingGenerationID")]
    pub pending_generation_id: Option<String>,

    /// Superseded generation being torn down
    #[serde(default, rename = "drainingGenerationID")]
    pub draining_generation_id: Option<String>,

    /// Generation the traffic pointer currently selects
    #[serde(default, rename = "trafficGenerationID")]
    pub traffic_generation_id: Option<String>,

    /// Active generation snapshot
    #[serde(default)]
    pub active_generation: Option<GenerationRecord>,

    /// Pending generation snapshot
    #[serde(default)]
    pub pending_generation: Option<GenerationRecord>,

    /// Number the next generation will get
    #[serde(default)]
    pub next_generation: u64,

    /// Last abandoned rollout
    #[serde(default)]
    pub rollout_failure: Option<RolloutFailure>,

    /// Head of the active generation
    #[serde(default)]
    pub head: Option<HeadStatus>,

    /// Worker groups of the active generation
    #[serde(default)]
    pub worker_groups: BTreeMap<String, WorkerGroupStatus>,
}

impl StrataClusterStatus {
    /// Set the active generation, keeping the id mirror in sync
    pub fn set_active(&mut self, record: Option<GenerationRecord>) {
        self.active_generation_id = record.as_ref().map(|r| r.id.clone());
        self.active_generation = record;
    }

    /// Set the pending generation, keeping the id mirror in sync
    pub fn set_pending(&mut self, record: Option<GenerationRecord>) {
        self.pending_generation_id = record.as_ref().map(|r| r.id.clone());
        self.pending_generation = record;
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}
