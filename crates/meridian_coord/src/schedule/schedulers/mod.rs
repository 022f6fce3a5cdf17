//! Built-in schedulers.

mod balance_leader;
mod balance_resource;
mod evict_leader;
mod hot;
mod label;
mod replica_checker;
mod shuffle;

pub use balance_leader::BalanceLeaderScheduler;
pub use balance_resource::BalanceResourceScheduler;
pub use evict_leader::EvictLeaderScheduler;
pub use hot::{HotResourceScheduler, HotSchedulerConfig};
pub use label::LabelScheduler;
pub use replica_checker::ReplicaCheckerScheduler;
pub use shuffle::{ShuffleHotScheduler, ShuffleLeaderScheduler, ShuffleResourceScheduler};

use crate::statistics::FlowKind;

use super::SchedulerRegistry;

/// Register every built-in scheduler under its canonical name.
pub fn register_defaults(registry: &mut SchedulerRegistry) {
    registry
        .register("balance-leader", Box::new(|_args| Ok(Box::new(BalanceLeaderScheduler::new()))))
        .expect("fresh registry");
    registry
        .register(
            "balance-resource",
            Box::new(|_args| Ok(Box::new(BalanceResourceScheduler::new()))),
        )
        .expect("fresh registry");
    registry
        .register(
            "hot-write-resource",
            Box::new(|_args| Ok(Box::new(HotResourceScheduler::new(FlowKind::Write)))),
        )
        .expect("fresh registry");
    registry
        .register(
            "hot-read-resource",
            Box::new(|_args| Ok(Box::new(HotResourceScheduler::new(FlowKind::Read)))),
        )
        .expect("fresh registry");
    registry
        .register(
            "shuffle-leader",
            Box::new(|_args| Ok(Box::new(ShuffleLeaderScheduler::new()))),
        )
        .expect("fresh registry");
    registry
        .register(
            "shuffle-resource",
            Box::new(|args| Ok(Box::new(ShuffleResourceScheduler::from_args(args)))),
        )
        .expect("fresh registry");
    registry
        .register(
            "shuffle-hot-resource",
            Box::new(|_args| Ok(Box::new(ShuffleHotScheduler::new()))),
        )
        .expect("fresh registry");
    registry
        .register(
            "evict-leader",
            Box::new(|args| EvictLeaderScheduler::from_args(args).map(|s| Box::new(s) as _)),
        )
        .expect("fresh registry");
    registry
        .register("label", Box::new(|_args| Ok(Box::new(LabelScheduler::new()))))
        .expect("fresh registry");
    registry
        .register(
            "replica-checker",
            Box::new(|_args| Ok(Box::new(ReplicaCheckerScheduler::new()))),
        )
        .expect("fresh registry");
}
