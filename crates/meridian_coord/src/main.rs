//! Coordinator node binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use clap::Parser;

use meridian_coord::config::{ScheduleOptions, SharedOptions};
use meridian_coord::heartbeat;
use meridian_coord::node::{self, CoordState};
use meridian_coord::schedule::{self, SchedulerRegistry};
use meridian_coord::server;
use meridian_coord::storage::{FjallBackend, MetaStorage};
use meridian_election::{start_time_monitor, Election, ElectionHub, Member};

#[derive(Debug, Parser)]
#[command(name = "meridian-coord", about = "meridian cluster coordinator")]
struct CoordArgs {
    /// Unique coordinator id.
    #[arg(long)]
    node_id: u64,

    /// Human-readable coordinator name.
    #[arg(long, default_value = "coord")]
    name: String,

    /// RPC listen address.
    #[arg(long, default_value = "127.0.0.1:3379")]
    listen: String,

    /// Metadata directory.
    #[arg(long, env = "MERIDIAN_DATA_DIR")]
    data_dir: PathBuf,

    /// Leader lease length in milliseconds.
    #[arg(long, default_value_t = 3000)]
    lease_ms: u64,

    /// Scheduler tick interval in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    schedule_tick_ms: u64,

    /// Schedulers to run, comma separated.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "replica-checker,balance-leader,balance-resource,hot-write-resource,hot-read-resource,label"
    )]
    schedulers: Vec<String>,

    /// Replica target for new resources.
    #[arg(long, default_value_t = 3)]
    max_replicas: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = CoordArgs::parse();
    run_coordinator(args, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_coordinator(
    args: CoordArgs,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    let member = Member {
        id: args.node_id,
        name: format!("{}-{}", args.name, args.node_id),
        addr: args.listen.clone(),
    };

    let backend = FjallBackend::open(args.data_dir.join("meta"))
        .context("open metadata backend")?;
    let storage = MetaStorage::new(Arc::new(backend));

    let options = SharedOptions::new(ScheduleOptions {
        max_replicas: args.max_replicas,
        ..ScheduleOptions::default()
    });

    // Single-process election hub; a multi-coordinator deployment plugs the
    // embedded consensus engine in here instead.
    let hub = ElectionHub::new(Duration::from_millis(args.lease_ms));
    let election = Election::start(hub, member.clone());

    let state = CoordState::new(election.clone(), storage, options);

    // Lease safety depends on monotonic clocks; a backward jump forces a
    // step-down.
    {
        let state = state.clone();
        start_time_monitor(SystemTime::now, move || {
            state.step_down("system time jumped backward");
        });
    }

    node::spawn_leader_watch(state.clone());
    node::spawn_stats_loop(state.clone(), Duration::from_secs(60));

    let (hb_tx, _hb_handle) = heartbeat::spawn_applier(state.clone());
    let (addr, _server_handle) = server::spawn_server(state.clone(), hb_tx, &args.listen)
        .await
        .context("bind rpc listener")?;
    tracing::info!(coordinator = member.id, %addr, "coordinator started");

    let registry = SchedulerRegistry::with_defaults();
    let view = state.view();
    let is_leader: Arc<dyn Fn() -> bool + Send + Sync> = {
        let state = state.clone();
        Arc::new(move || state.is_leader())
    };
    for entry in &args.schedulers {
        // Entries may carry arguments after the name, e.g. "evict-leader:4".
        let (name, arg_str) = entry.split_once(':').unwrap_or((entry.as_str(), ""));
        let sched_args: Vec<String> = arg_str
            .split(';')
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        let scheduler = registry
            .create(name, &sched_args)
            .with_context(|| format!("configure scheduler {name}"))?;
        state
            .storage
            .put_scheduler_config(name, &serde_json::to_vec(&sched_args)?)
            .context("persist scheduler config")?;
        schedule::spawn_scheduler(
            Arc::from(scheduler),
            view.clone(),
            is_leader.clone(),
            Duration::from_millis(args.schedule_tick_ms),
        );
    }

    shutdown.await;
    tracing::info!("shutting down");
    election.stop();
    Ok(())
}
