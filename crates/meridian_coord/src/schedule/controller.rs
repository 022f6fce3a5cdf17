//! Operator admission, tracking and dispatch.
//!
//! One coarse mutex guards the `resource -> operator` map; step predicates
//! run over resource snapshots, so nothing slow happens under the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::bail;

use crate::cluster::CachedResource;
use crate::config::ScheduleOptions;
use crate::meta::{ContainerId, ResourceId};

use super::operator::{
    CancelReason, OpKind, OpStatus, OpStep, Operator, OPERATOR_DEADLINE, STEP_TIMEOUT,
};

/// Lock-free per-reason cancellation counters.
#[derive(Debug, Default)]
pub struct CancelCounters {
    safety: AtomicU64,
    timeout: AtomicU64,
    stale: AtomicU64,
    replaced: AtomicU64,
    admin: AtomicU64,
}

impl CancelCounters {
    fn bump(&self, reason: CancelReason) {
        let counter = match reason {
            CancelReason::Safety => &self.safety,
            CancelReason::Timeout => &self.timeout,
            CancelReason::Stale => &self.stale,
            CancelReason::Replaced => &self.replaced,
            CancelReason::Admin => &self.admin,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, reason: CancelReason) -> u64 {
        match reason {
            CancelReason::Safety => self.safety.load(Ordering::Relaxed),
            CancelReason::Timeout => self.timeout.load(Ordering::Relaxed),
            CancelReason::Stale => self.stale.load(Ordering::Relaxed),
            CancelReason::Replaced => self.replaced.load(Ordering::Relaxed),
            CancelReason::Admin => self.admin.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct OperatorController {
    operators: Mutex<HashMap<ResourceId, Operator>>,
    cancels: CancelCounters,
    finished: AtomicU64,
}

impl OperatorController {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-flight operators whose kind carries the given bit.
    pub fn operator_count(&self, kind: OpKind) -> u64 {
        self.operators
            .lock()
            .unwrap()
            .values()
            .filter(|op| op.kind.contains(kind))
            .count() as u64
    }

    pub fn kind_limit(kind: OpKind, opts: &ScheduleOptions) -> u64 {
        if kind.contains(OpKind::HOT_RESOURCE) {
            opts.hot_resource_schedule_limit
        } else if kind.contains(OpKind::MERGE) {
            opts.merge_schedule_limit
        } else if kind.contains(OpKind::REPLICA) {
            opts.replica_schedule_limit
        } else if kind.contains(OpKind::LEADER) {
            opts.leader_schedule_limit
        } else {
            opts.resource_schedule_limit
        }
    }

    /// Admit an operator: per-resource uniqueness (a strictly higher priority
    /// may displace a replaceable one), per-kind limit, and first-step safety
    /// against the current cached resource.
    pub fn add_operator(
        &self,
        mut op: Operator,
        res: &CachedResource,
        opts: &ScheduleOptions,
    ) -> anyhow::Result<()> {
        if op.is_empty() {
            bail!("operator {op} has no steps");
        }
        if op.resource_epoch.conf_ver < res.meta.epoch.conf_ver {
            bail!("operator {op} was built against a stale conf version");
        }
        if let Some(step) = op.current() {
            step.check_safety(res)?;
        }

        let mut operators = self.operators.lock().unwrap();
        if let Some(existing) = operators.get(&op.resource_id) {
            if op.priority <= existing.priority || !existing.is_replaceable() {
                bail!(
                    "resource {} already has operator [{existing}]",
                    op.resource_id
                );
            }
        }
        let dominant = dominant_kind(op.kind);
        let limit = Self::kind_limit(dominant, opts);
        let in_flight = operators
            .values()
            .filter(|other| other.kind.contains(dominant))
            .count() as u64;
        if in_flight >= limit {
            bail!(
                "kind {dominant} is at its schedule limit ({in_flight}/{limit})"
            );
        }

        op.status = OpStatus::Started;
        if let Some(replaced) = operators.insert(op.resource_id, op) {
            self.cancels.bump(CancelReason::Replaced);
            tracing::debug!(operator = %replaced, "operator replaced");
        }
        Ok(())
    }

    pub fn get_operator(&self, resource_id: ResourceId) -> Option<Operator> {
        self.operators.lock().unwrap().get(&resource_id).cloned()
    }

    /// Advance the operator for `res` against the freshly observed state and
    /// return the step the shard leader should execute next, if any.
    ///
    /// Step predicates are pure functions over the resource snapshot, so
    /// they are evaluated on a cloned operator with the map unlocked; the
    /// outcome is applied under the lock only if the operator is unchanged.
    pub fn dispatch(&self, res: &CachedResource) -> Option<OpStep> {
        enum Outcome {
            Step(usize, OpStep),
            Finished,
            Cancel(CancelReason, String),
        }

        let snapshot = self.operators.lock().unwrap().get(&res.id()).cloned()?;

        let mut cursor = snapshot.current_step;
        let outcome = loop {
            let Some(step) = snapshot.step(cursor).cloned() else {
                break Outcome::Finished;
            };
            if step.is_finish(res) {
                cursor += 1;
                continue;
            }
            if let Err(err) = step.check_safety(res) {
                break Outcome::Cancel(CancelReason::Safety, err.to_string());
            }
            let stalled = (cursor == snapshot.current_step
                && snapshot.step_elapsed() >= STEP_TIMEOUT)
                || snapshot.elapsed() >= OPERATOR_DEADLINE;
            if stalled {
                break Outcome::Cancel(CancelReason::Timeout, "timed out".to_string());
            }
            break Outcome::Step(cursor, step);
        };

        let mut operators = self.operators.lock().unwrap();
        // Another dispatch or a replacement may have won the race; only
        // apply the outcome to the operator we evaluated.
        let unchanged = operators
            .get(&res.id())
            .is_some_and(|op| op.desc == snapshot.desc && op.current_step == snapshot.current_step);
        if !unchanged {
            return operators.get(&res.id()).and_then(|op| op.current().cloned());
        }

        match outcome {
            Outcome::Step(cursor, step) => {
                if let Some(op) = operators.get_mut(&res.id()) {
                    op.status = OpStatus::Running;
                    if cursor != op.current_step {
                        op.current_step = cursor;
                        op.step_started_at = std::time::Instant::now();
                    }
                }
                Some(step)
            }
            Outcome::Finished => {
                let finished = operators.remove(&res.id());
                drop(operators);
                self.finished.fetch_add(1, Ordering::Relaxed);
                if let Some(mut finished) = finished {
                    finished.status = OpStatus::Succeeded;
                    tracing::info!(operator = %finished, "operator finished");
                }
                None
            }
            Outcome::Cancel(reason, why) => {
                let cancelled = operators.remove(&res.id());
                drop(operators);
                self.cancels.bump(reason);
                tracing::warn!(
                    operator = cancelled.as_ref().map(|o| o.desc.as_str()).unwrap_or(""),
                    ?reason,
                    why,
                    "operator cancelled"
                );
                None
            }
        }
    }

    /// Idempotent cancellation.
    pub fn cancel(&self, resource_id: ResourceId, reason: CancelReason) -> bool {
        let removed = self.operators.lock().unwrap().remove(&resource_id);
        if let Some(op) = removed {
            self.cancels.bump(reason);
            tracing::info!(operator = %op, ?reason, "operator cancelled");
            true
        } else {
            false
        }
    }

    /// Current steps for every tracked resource whose leader sits on
    /// `container_id`, attached to container heartbeat responses.
    pub fn pending_steps_for_container(
        &self,
        container_id: ContainerId,
        resolve: impl Fn(ResourceId) -> Option<CachedResource>,
    ) -> Vec<(ResourceId, OpStep)> {
        let tracked: Vec<ResourceId> = self.operators.lock().unwrap().keys().copied().collect();
        let mut out = Vec::new();
        for resource_id in tracked {
            let Some(res) = resolve(resource_id) else {
                continue;
            };
            if res.leader_container() != Some(container_id) {
                continue;
            }
            if let Some(op) = self.get_operator(resource_id) {
                if let Some(step) = op.current() {
                    out.push((resource_id, step.clone()));
                }
            }
        }
        out
    }

    pub fn cancel_counters(&self) -> &CancelCounters {
        &self.cancels
    }

    pub fn finished_count(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }
}

/// The single kind bit that owns this operator's limit accounting.
fn dominant_kind(kind: OpKind) -> OpKind {
    for bit in [
        OpKind::HOT_RESOURCE,
        OpKind::MERGE,
        OpKind::REPLICA,
        OpKind::LEADER,
        OpKind::RESOURCE,
    ] {
        if kind.contains(bit) {
            return bit;
        }
    }
    OpKind::RESOURCE
}
