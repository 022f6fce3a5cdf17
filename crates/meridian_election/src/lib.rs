//! Lease-based coordinator election.
//!
//! The embedded consensus engine that backs a production deployment is a
//! supplied dependency. This crate pins down the three properties the
//! coordinator relies on behind a small API:
//!
//! 1. at most one leader holds the lease at any instant
//! 2. leader changes notify subscribers
//! 3. a campaign only succeeds after the grant is visible to every node
//!    sharing the hub
//!
//! `ElectionHub` is the in-process implementation used by tests and by
//! single-process multi-coordinator simulations. The hub hands out a
//! time-bound lease; holders renew at a third of the lease interval and lose
//! leadership when they stop renewing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Identity of one coordinator process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub addr: String,
}

struct HubState {
    holder: Option<(Member, Instant)>,
}

/// Shared lease registry standing in for the embedded consensus engine.
pub struct ElectionHub {
    lease: Duration,
    state: Mutex<HubState>,
    changes: watch::Sender<Option<Member>>,
}

impl ElectionHub {
    pub fn new(lease: Duration) -> Arc<Self> {
        let (changes, _) = watch::channel(None);
        Arc::new(Self {
            lease: lease.max(Duration::from_millis(100)),
            state: Mutex::new(HubState { holder: None }),
            changes,
        })
    }

    /// Acquire or renew the lease for `member`. Returns whether `member`
    /// holds the lease after the call.
    fn try_acquire(&self, member: &Member) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        match &mut state.holder {
            Some((holder, expires)) if holder.id == member.id => {
                *expires = now + self.lease;
                true
            }
            Some((_, expires)) if *expires > now => false,
            _ => {
                state.holder = Some((member.clone(), now + self.lease));
                drop(state);
                let _ = self.changes.send(Some(member.clone()));
                tracing::info!(leader = member.id, addr = %member.addr, "leader lease granted");
                true
            }
        }
    }

    fn release(&self, member_id: u64) {
        let mut state = self.state.lock().unwrap();
        if matches!(&state.holder, Some((holder, _)) if holder.id == member_id) {
            state.holder = None;
            drop(state);
            let _ = self.changes.send(None);
            tracing::info!(leader = member_id, "leader lease released");
        }
    }

    /// Current lease holder, if the lease has not expired.
    pub fn leader(&self) -> Option<Member> {
        let mut state = self.state.lock().unwrap();
        let expired = matches!(&state.holder, Some((_, expires)) if *expires <= Instant::now());
        if expired {
            state.holder = None;
            drop(state);
            let _ = self.changes.send(None);
            return None;
        }
        state.holder.as_ref().map(|(holder, _)| holder.clone())
    }

    /// Subscribe to leader changes. The receiver yields the current leader
    /// immediately and every change afterwards.
    pub fn subscribe(&self) -> watch::Receiver<Option<Member>> {
        self.changes.subscribe()
    }
}

/// One coordinator's participation in the election.
///
/// `start` spawns a campaign loop that keeps trying to acquire the lease and
/// renews it while held. Leadership is observable through `is_leader` without
/// taking a lock.
pub struct Election {
    hub: Arc<ElectionHub>,
    member: Member,
    leading: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl Election {
    pub fn start(hub: Arc<ElectionHub>, member: Member) -> Arc<Self> {
        let election = Arc::new(Self {
            hub: hub.clone(),
            member: member.clone(),
            leading: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
        });

        let renew = hub.lease / 3;
        let leading = election.leading.clone();
        let stopped = election.stopped.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renew);
            loop {
                ticker.tick().await;
                if stopped.load(Ordering::Acquire) {
                    return;
                }
                let held = hub.try_acquire(&member);
                if stopped.load(Ordering::Acquire) {
                    // Stopped while acquiring: give the lease straight back.
                    hub.release(member.id);
                    return;
                }
                let was = leading.swap(held, Ordering::AcqRel);
                if was && !held {
                    tracing::warn!(member = member.id, "lost leader lease");
                }
            }
        });
        election
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::Acquire)
    }

    pub fn leader(&self) -> Option<Member> {
        self.hub.leader()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Member>> {
        self.hub.subscribe()
    }

    /// Give up the lease without stopping the campaign loop. Another node
    /// (or this one, later) may acquire it.
    pub fn resign(&self) {
        self.leading.store(false, Ordering::Release);
        self.hub.release(self.member.id);
    }

    /// Stop campaigning and release the lease if held.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.resign();
    }
}

/// Sampling interval of the system-time monitor.
pub const TIME_MONITOR_INTERVAL: Duration = Duration::from_millis(100);

/// Watch the wall clock and invoke `on_jump_back` whenever it moves
/// backwards between samples. Lease safety depends on monotonic time, so the
/// leader wires this to a step-down.
///
/// The task runs until `now` panics or the runtime shuts down; callers keep
/// the returned handle if they want to abort it.
pub fn start_time_monitor(
    now: impl Fn() -> SystemTime + Send + 'static,
    on_jump_back: impl Fn() + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("system time monitor started");
        let mut ticker = tokio::time::interval(TIME_MONITOR_INTERVAL);
        let mut last = now();
        loop {
            ticker.tick().await;
            let current = now();
            if current < last {
                tracing::error!(?last, ?current, "system time jumped backward");
                on_jump_back();
            }
            last = current;
        }
    })
}
