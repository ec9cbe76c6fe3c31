//! Status aggregation
//!
//! Folds the observed topology and upgrade bookkeeping into the `Ready`,
//! `Upgrading` and `Failed` conditions plus per-unit summaries. A condition's
//! `lastTransitionTime` only moves when its status flips, so an unchanged
//! cluster aggregates to an identical status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use strata_common::crd::{
    Condition, ConditionStatus, HeadStatus, StrataClusterStatus, UpgradeState, WorkerGroupStatus,
};

use crate::observed::{Health, ObservedTopology};
use crate::planner::{PlanError, TargetTopology};

pub const READY: &str = "Ready";
pub const UPGRADING: &str = "Upgrading";
pub const FAILED: &str = "Failed";

pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_RESTART_BUDGET: &str = "HeadRestartBudgetExceeded";
pub const REASON_PENDING_UNHEALTHY: &str = "PendingGenerationUnhealthy";

/// What the aggregator looks at
pub struct StatusInput<'a> {
    /// Status after the upgrade coordinator ran
    pub status: &'a StrataClusterStatus,
    /// Plan of the active generation
    pub active_target: Option<&'a TargetTopology>,
    pub observed: &'a ObservedTopology,
    pub suspend: bool,
    pub restart_budget: i32,
}

/// Conditions and unit summaries for one pass
#[derive(Clone, Debug, PartialEq)]
pub struct StatusSummary {
    pub conditions: Vec<Condition>,
    pub head: Option<HeadStatus>,
    pub worker_groups: BTreeMap<String, WorkerGroupStatus>,
}

impl StatusSummary {
    /// Copy the summary onto a status
    pub fn apply_to(self, status: &mut StrataClusterStatus) {
        status.conditions = self.conditions;
        status.head = self.head;
        status.worker_groups = self.worker_groups;
    }
}

/// Build a condition, keeping the previous transition time if the status is unchanged
fn transition(
    previous: &[Condition],
    type_: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) -> Condition {
    let status = ConditionStatus::from_bool(status);
    let since = previous
        .iter()
        .find(|c| c.type_ == type_ && c.status == status)
        .map(|c| c.last_transition_time)
        .unwrap_or(now);
    Condition::at(type_, status, reason, message, since)
}

/// Aggregate conditions and summaries
pub fn aggregate(
    input: &StatusInput<'_>,
    previous: &[Condition],
    now: DateTime<Utc>,
) -> StatusSummary {
    let active = input
        .status
        .active_generation_id
        .as_deref()
        .and_then(|id| input.observed.generation(id));
    let head = active.and_then(|g| g.head.as_ref());

    let mut worker_groups = BTreeMap::new();
    let mut groups_ok = true;
    for entry in input.active_target.iter().flat_map(|t| t.worker_groups()) {
        let live: Vec<_> = active
            .into_iter()
            .flat_map(|g| g.live_workers(&entry.group))
            .collect();
        let running = live.iter().filter(|u| u.health == Health::Running).count();
        groups_ok &= live.len() == entry.count && running == live.len();
        worker_groups.insert(
            entry.group.clone(),
            WorkerGroupStatus {
                desired: entry.count as i32,
                observed: live.len() as i32,
                running: running as i32,
            },
        );
    }

    let head_running = head.is_some_and(|h| h.health == Health::Running && !h.terminating);
    let (ready, ready_reason, ready_message) = if input.suspend {
        (false, "Suspended", "cluster is suspended".to_string())
    } else if input.active_target.is_none() || active.is_none() {
        (false, "NoActiveGeneration", "no generation is running yet".to_string())
    } else if !head_running {
        (false, "HeadNotRunning", "head is not running".to_string())
    } else if !groups_ok {
        (
            false,
            "WorkersNotReady",
            "worker groups are not at their desired running count".to_string(),
        )
    } else {
        (true, "AllRunning", "head and all workers are running".to_string())
    };

    let upgrading = input.status.upgrade_state != UpgradeState::ActiveOnly;
    let (upgrading_reason, upgrading_message) = if upgrading {
        let message = match &input.status.pending_generation_id {
            Some(pending) => format!("rolling out generation {pending}"),
            None => format!("upgrade state {}", input.status.upgrade_state),
        };
        (input.status.upgrade_state.to_string(), message)
    } else {
        ("Stable".to_string(), "no rollout in progress".to_string())
    };

    let restarts = head.map(|h| h.restarts).unwrap_or(0);
    let (failed, failed_reason, failed_message) =
        if let Some(failure) = &input.status.rollout_failure {
            (
                true,
                REASON_PENDING_UNHEALTHY,
                format!(
                    "{}: generation {} did not become ready in time",
                    failure.reason, failure.generation_id
                ),
            )
        } else if restarts > input.restart_budget {
            (
                true,
                REASON_RESTART_BUDGET,
                format!(
                    "head restarted {restarts} times, budget is {}",
                    input.restart_budget
                ),
            )
        } else {
            (false, "Healthy", "no failures".to_string())
        };

    StatusSummary {
        conditions: vec![
            transition(previous, READY, ready, ready_reason, ready_message, now),
            transition(
                previous,
                UPGRADING,
                upgrading,
                &upgrading_reason,
                upgrading_message,
                now,
            ),
            transition(previous, FAILED, failed, failed_reason, failed_message, now),
        ],
        head: head.map(|h| HeadStatus {
            name: h.name.clone(),
            health: h.health.as_str().to_string(),
            restarts: h.restarts,
        }),
        worker_groups,
    }
}

/// Conditions for a spec that cannot be planned
///
/// `Ready` and `Upgrading` keep their previous values; only `Failed` changes.
pub fn invalid_spec_conditions(
    previous: &[Condition],
    error: &PlanError,
    now: DateTime<Utc>,
) -> Vec<Condition> {
    let mut conditions: Vec<Condition> = previous
        .iter()
        .filter(|c| c.type_ != FAILED)
        .cloned()
        .collect();
    conditions.push(transition(
        previous,
        FAILED,
        true,
        REASON_INVALID_SPEC,
        error.to_string(),
        now,
    ));
    conditions
}
