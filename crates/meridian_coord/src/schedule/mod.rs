//! Scheduler framework and operator machinery.

pub mod builder;
pub mod controller;
pub mod filter;
pub mod operator;
pub mod schedulers;

pub use controller::OperatorController;
pub use operator::{CancelReason, OpKind, OpPriority, OpStatus, OpStep, Operator, PeerSpec};

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::bail;

use crate::cluster::BasicCluster;
use crate::config::SharedOptions;
use crate::meta::GroupId;
use crate::placement::RuleManager;
use crate::statistics::{ContainersStats, HotPeerCache};
use crate::storage::IdAllocator;

/// Everything a scheduler reads during a tick. All handles are shared; the
/// options snapshot is taken per tick so one tick sees one config.
#[derive(Clone)]
pub struct ClusterView {
    pub cluster: Arc<RwLock<BasicCluster>>,
    pub stats: Arc<RwLock<ContainersStats>>,
    pub hot_write: Arc<RwLock<HotPeerCache>>,
    pub hot_read: Arc<RwLock<HotPeerCache>>,
    pub rules: Arc<RuleManager>,
    pub options: SharedOptions,
    pub controller: Arc<OperatorController>,
    pub id_alloc: Arc<dyn IdAllocator>,
}

impl ClusterView {
    /// Distinct groups with at least one resource.
    pub fn groups(&self) -> Vec<GroupId> {
        let cluster = self.cluster.read().unwrap();
        let groups: BTreeSet<GroupId> = cluster
            .get_resources()
            .iter()
            .map(|r| r.meta.group)
            .collect();
        groups.into_iter().collect()
    }
}

/// A pluggable scheduler. `schedule` proposes operators; admission happens
/// in the operator controller.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Claim shared cluster state before the first tick.
    fn prepare(&self, _view: &ClusterView) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release whatever `prepare` claimed.
    fn cleanup(&self, _view: &ClusterView) {}

    /// Gate on the per-kind schedule limit; a refused tick is skipped.
    fn is_schedule_allowed(&self, view: &ClusterView) -> bool;

    fn schedule(&self, view: &ClusterView) -> Vec<Operator>;
}

pub type SchedulerBuilder =
    Box<dyn Fn(&[String]) -> anyhow::Result<Box<dyn Scheduler>> + Send + Sync>;

/// Explicit scheduler registry, constructed at startup and passed where
/// needed. Nothing global.
#[derive(Default)]
pub struct SchedulerRegistry {
    builders: std::collections::HashMap<String, SchedulerBuilder>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in schedulers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        schedulers::register_defaults(&mut registry);
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        builder: SchedulerBuilder,
    ) -> anyhow::Result<()> {
        let name = name.into();
        if self.builders.contains_key(&name) {
            bail!("scheduler {name} is already registered");
        }
        self.builders.insert(name, builder);
        Ok(())
    }

    pub fn create(&self, name: &str, args: &[String]) -> anyhow::Result<Box<dyn Scheduler>> {
        let Some(builder) = self.builders.get(name) else {
            bail!("scheduler {name} is not registered");
        };
        builder(args)
    }

    pub fn names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.builders.keys().cloned().collect();
        out.sort();
        out
    }
}

/// Default tick interval of every scheduler loop.
pub const SCHEDULE_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Drive one scheduler on its own timer. Ticks are skipped while not
/// leading or while the scheduler's kind is at its limit. Operator admission
/// failures never abort the tick.
pub fn spawn_scheduler(
    scheduler: Arc<dyn Scheduler>,
    view: ClusterView,
    is_leader: Arc<dyn Fn() -> bool + Send + Sync>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut prepared = false;
        loop {
            ticker.tick().await;
            if !is_leader() {
                if prepared {
                    scheduler.cleanup(&view);
                    prepared = false;
                }
                continue;
            }
            if !prepared {
                if let Err(err) = scheduler.prepare(&view) {
                    tracing::warn!(scheduler = scheduler.name(), error = ?err, "prepare failed");
                    continue;
                }
                prepared = true;
            }
            if !scheduler.is_schedule_allowed(&view) {
                tracing::debug!(scheduler = scheduler.name(), "schedule limit reached, tick skipped");
                continue;
            }
            let operators = scheduler.schedule(&view);
            if operators.is_empty() {
                continue;
            }
            let opts = view.options.snapshot();
            for op in operators {
                let res = view.cluster.read().unwrap().get_resource(op.resource_id);
                let Some(res) = res else {
                    continue;
                };
                if let Err(err) = view.controller.add_operator(op, &res, &opts) {
                    tracing::debug!(scheduler = scheduler.name(), error = %err, "operator rejected");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = SchedulerRegistry::with_defaults();
        let err = registry.register(
            "balance-leader",
            Box::new(|_| anyhow::bail!("unused")),
        );
        assert!(err.is_err());
    }

    #[test]
    fn defaults_cover_the_builtin_set() {
        let registry = SchedulerRegistry::with_defaults();
        for name in [
            "balance-leader",
            "balance-resource",
            "hot-read-resource",
            "hot-write-resource",
            "shuffle-leader",
            "shuffle-resource",
            "shuffle-hot-resource",
            "evict-leader",
            "label",
            "replica-checker",
        ] {
            assert!(registry.names().contains(&name.to_string()), "{name} missing");
        }
    }

    #[test]
    fn unknown_scheduler_is_an_error() {
        let registry = SchedulerRegistry::with_defaults();
        assert!(registry.create("no-such-scheduler", &[]).is_err());
    }
}
