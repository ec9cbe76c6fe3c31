//! Custom Resource Definitions for Strata
//!
//! `StrataCluster` is the single user-facing resource: one head unit plus
//! named groups of worker units, upgraded through immutable generations.

mod cluster;
mod types;

pub use cluster::{
    GenerationRecord, HeadStatus, RolloutFailure, StrataCluster, StrataClusterSpec,
    StrataClusterStatus, WorkerGroupStatus,
};
pub use types::{
    Condition, ConditionStatus, ContainerTemplate, GenerationSpec, PortSpec, ProbeSpec,
    ResourceSpec, UpgradeState, UpgradeStrategy, UpgradeStrategyType, WorkerGroupSpec,
};
