//! Upgrade coordinator
//!
//! Advances the persisted generation state machine by at most one externally
//! visible step per pass:
//!
//! ```text
//! NoActive ──► ActiveOnly ──► ActivePending ──► CuttingOver ──► Draining ──► ActiveOnly
//!                  ▲               │  (deadline, revert,             │
//!                  └───────────────┘   strategy None, suspend)       │
//!                  └─────────────────────────────────────────────────┘
//! ```
//!
//! Everything is computed from the persisted status plus the observed
//! topology, so re-running a pass after a crash yields the same decision.
//! The routing switch itself happens in the reconciler; only after it
//! succeeds does [`complete_cutover`] promote pending to active.

use chrono::{DateTime, Duration, Utc};
use strata_common::crd::{
    GenerationRecord, GenerationSpec, RolloutFailure, StrataClusterStatus, UpgradeState,
    UpgradeStrategyType,
};
use tracing::debug;

use crate::observed::ObservedTopology;
use crate::planner::plan;

/// Reason recorded when a pending generation misses its deadline
pub const PENDING_UNHEALTHY_REASON: &str = "pending generation unhealthy";

const MAX_STEPS: usize = 8;

/// Inputs to one advance of the state machine
pub struct UpgradeInput<'a> {
    pub cluster: &'a str,
    /// Persisted status as fetched
    pub status: &'a StrataClusterStatus,
    pub desired: &'a GenerationSpec,
    pub desired_hash: &'a str,
    pub strategy: UpgradeStrategyType,
    pub suspend: bool,
    /// How long pending may take to become ready
    pub deadline: Duration,
    pub observed: &'a ObservedTopology,
    pub now: DateTime<Utc>,
}

/// Request to point traffic at another generation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cutover {
    pub from: Option<String>,
    pub to: String,
}

/// Outcome of one advance
#[derive(Clone, Debug, PartialEq)]
pub struct UpgradeDecision {
    /// Status with generation bookkeeping advanced; conditions untouched
    pub status: StrataClusterStatus,
    pub cutover: Option<Cutover>,
    /// State changes in the order they were taken
    pub transitions: Vec<(UpgradeState, UpgradeState)>,
}

struct Machine<'a> {
    input: &'a UpgradeInput<'a>,
    status: StrataClusterStatus,
    cutover: Option<Cutover>,
    transitions: Vec<(UpgradeState, UpgradeState)>,
}

enum Step {
    Continue,
    Stop,
}

impl<'a> Machine<'a> {
    fn goto(&mut self, to: UpgradeState) {
        let from = self.status.upgrade_state;
        if from != to {
            self.transitions.push((from, to));
            self.status.upgrade_state = to;
        }
    }

    fn new_generation(&mut self) -> GenerationRecord {
        let number = self.status.next_generation;
        self.status.next_generation += 1;
        GenerationRecord {
            id: GenerationRecord::id_for(self.input.cluster, number),
            number,
            rollout_hash: self.input.desired_hash.to_string(),
            spec: self.input.desired.clone(),
            created_at: self.input.now,
            ready_at: None,
            head_started_at: None,
        }
    }

    fn pending_ready(&self, pending: &GenerationRecord) -> bool {
        let Ok(target) = plan(&pending.spec) else {
            return false;
        };
        self.input
            .observed
            .generation(&pending.id)
            .is_some_and(|g| g.is_ready(&target))
    }

    fn step(&mut self) -> Step {
        let input = self.input;
        match self.status.upgrade_state {
            UpgradeState::NoActive => {
                if self.status.active_generation.is_none() {
                    let record = self.new_generation();
                    debug!(cluster = %input.cluster, generation = %record.id, "creating first generation");
                    self.status.set_active(Some(record));
                }
                self.goto(UpgradeState::ActiveOnly);
                Step::Stop
            }

            UpgradeState::ActiveOnly => {
                let Some(active) = self.status.active_generation.as_mut() else {
                    self.goto(UpgradeState::NoActive);
                    return Step::Continue;
                };
                if input.suspend {
                    active.head_started_at = None;
                }
                if active.rollout_hash == input.desired_hash {
                    active.spec = input.desired.clone();
                    return Step::Stop;
                }
                match input.strategy {
                    UpgradeStrategyType::None => {
                        active.spec = input.desired.clone();
                        active.rollout_hash = input.desired_hash.to_string();
                        Step::Stop
                    }
                    UpgradeStrategyType::RollingRecreate => {
                        let failed = self
                            .status
                            .rollout_failure
                            .as_ref()
                            .is_some_and(|f| f.rollout_hash == input.desired_hash);
                        if input.suspend || failed {
                            return Step::Stop;
                        }
                        let record = self.new_generation();
                        debug!(cluster = %input.cluster, generation = %record.id, "starting rollout");
                        self.status.set_pending(Some(record));
                        self.goto(UpgradeState::ActivePending);
                        Step::Stop
                    }
                }
            }

            UpgradeState::ActivePending => {
                let (Some(active_hash), Some(pending)) = (
                    self.status
                        .active_generation
                        .as_ref()
                        .map(|a| a.rollout_hash.clone()),
                    self.status.pending_generation.clone(),
                ) else {
                    self.status.set_pending(None);
                    self.goto(UpgradeState::ActiveOnly);
                    return Step::Continue;
                };

                if input.suspend
                    || input.strategy == UpgradeStrategyType::None
                    || input.desired_hash == active_hash
                {
                    debug!(cluster = %input.cluster, generation = %pending.id, "discarding pending generation");
                    self.status.set_pending(None);
                    self.goto(UpgradeState::ActiveOnly);
                    return Step::Continue;
                }

                if input.desired_hash != pending.rollout_hash {
                    let record = self.new_generation();
                    debug!(
                        cluster = %input.cluster,
                        replaced = %pending.id,
                        generation = %record.id,
                        "spec changed mid-rollout, replacing pending generation"
                    );
                    self.status.set_pending(Some(record));
                    return Step::Stop;
                }

                let mut pending = pending;
                pending.spec = input.desired.clone();

                if self.pending_ready(&pending) {
                    pending.ready_at = Some(input.now);
                    self.status.set_pending(Some(pending));
                    self.goto(UpgradeState::CuttingOver);
                    return Step::Stop;
                }

                if input.now - pending.created_at > input.deadline {
                    self.status.rollout_failure = Some(RolloutFailure {
                        generation_id: pending.id.clone(),
                        rollout_hash: pending.rollout_hash.clone(),
                        reason: PENDING_UNHEALTHY_REASON.to_string(),
                        failed_at: input.now,
                    });
                    self.status.set_pending(None);
                    self.goto(UpgradeState::ActiveOnly);
                    return Step::Stop;
                }

                self.status.set_pending(Some(pending));
                Step::Stop
            }

            UpgradeState::CuttingOver => {
                let Some(pending) = self.status.pending_generation.clone() else {
                    self.goto(UpgradeState::ActiveOnly);
                    return Step::Continue;
                };

                if input.suspend
                    || input.strategy == UpgradeStrategyType::None
                    || input.desired_hash != pending.rollout_hash
                {
                    self.goto(UpgradeState::ActivePending);
                    return Step::Continue;
                }

                if input.observed.serving_generation() == Some(pending.id.as_str()) {
                    complete_cutover(&mut self.status);
                    self.transitions
                        .push((UpgradeState::CuttingOver, UpgradeState::Draining));
                    return Step::Continue;
                }

                if self.pending_ready(&pending) {
                    self.cutover = Some(Cutover {
                        from: self.status.active_generation_id.clone(),
                        to: pending.id,
                    });
                    return Step::Stop;
                }

                let mut pending = pending;
                pending.ready_at = None;
                self.status.set_pending(Some(pending));
                self.goto(UpgradeState::ActivePending);
                Step::Stop
            }

            UpgradeState::Draining => {
                let drained = self
                    .status
                    .draining_generation_id
                    .as_deref()
                    .map_or(true, |id| input.observed.object_count(id) == 0);
                if drained {
                    self.status.draining_generation_id = None;
                    self.goto(UpgradeState::ActiveOnly);
                    return Step::Continue;
                }
                Step::Stop
            }
        }
    }
}

/// Advance the state machine for one pass
pub fn advance(input: &UpgradeInput<'_>) -> UpgradeDecision {
    let mut machine = Machine {
        input,
        status: input.status.clone(),
        cutover: None,
        transitions: Vec::new(),
    };

    if machine
        .status
        .rollout_failure
        .as_ref()
        .is_some_and(|f| f.rollout_hash != input.desired_hash)
    {
        machine.status.rollout_failure = None;
    }

    // Scale fields are outside the rollout hash and apply to live generations as-is
    for record in [
        machine.status.active_generation.as_mut(),
        machine.status.pending_generation.as_mut(),
    ]
    .into_iter()
    .flatten()
    {
        apply_scale(&mut record.spec, input.desired);
    }

    for _ in 0..MAX_STEPS {
        if let Step::Stop = machine.step() {
            break;
        }
    }

    UpgradeDecision {
        status: machine.status,
        cutover: machine.cutover,
        transitions: machine.transitions,
    }
}

/// Copy replica bounds and requested deletions from `desired` onto groups of
/// the same name
fn apply_scale(spec: &mut GenerationSpec, desired: &GenerationSpec) {
    for group in &mut spec.worker_groups {
        if let Some(wanted) = desired.group(&group.name) {
            group.replicas = wanted.replicas;
            group.min_replicas = wanted.min_replicas;
            group.max_replicas = wanted.max_replicas;
            group.workers_to_delete.clone_from(&wanted.workers_to_delete);
        }
    }
}

/// Promote pending to active once traffic points at it
pub fn complete_cutover(status: &mut StrataClusterStatus) {
    let Some(pending) = status.pending_generation.take() else {
        return;
    };
    status.traffic_generation_id = Some(pending.id.clone());
    status.draining_generation_id = status.active_generation_id.take();
    status.set_pending(None);
    status.set_active(Some(pending));
    status.upgrade_state = UpgradeState::Draining;
}

/// Generation ids whose objects must be kept this pass
pub fn live_generations(
    persisted: &StrataClusterStatus,
    next: &StrataClusterStatus,
) -> std::collections::BTreeSet<String> {
    [
        &persisted.active_generation_id,
        &persisted.pending_generation_id,
        &next.active_generation_id,
        &next.pending_generation_id,
    ]
    .into_iter()
    .flatten()
    .cloned()
    .collect()
}
