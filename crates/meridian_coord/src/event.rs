//! Watcher events.
//!
//! Watchers subscribe with a flag bitmask; on subscription they receive one
//! `Init` snapshot, then matching deltas as the cluster changes.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::meta::{ContainerMeta, ResourceId, ResourceMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFlags(pub u32);

impl EventFlags {
    pub const INIT: EventFlags = EventFlags(1);
    pub const RESOURCE_CREATE: EventFlags = EventFlags(1 << 1);
    pub const RESOURCE_CHANGE: EventFlags = EventFlags(1 << 2);
    pub const RESOURCE_DESTROY: EventFlags = EventFlags(1 << 3);
    pub const CONTAINER_CHANGE: EventFlags = EventFlags(1 << 4);
    pub const ALL: EventFlags = EventFlags(
        Self::INIT.0
            | Self::RESOURCE_CREATE.0
            | Self::RESOURCE_CHANGE.0
            | Self::RESOURCE_DESTROY.0
            | Self::CONTAINER_CHANGE.0,
    );

    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EventFlags {
    type Output = EventFlags;
    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// Full snapshot, always delivered first.
    Init {
        containers: Vec<ContainerMeta>,
        resources: Vec<ResourceMeta>,
    },
    ResourceCreated(ResourceMeta),
    ResourceChanged(ResourceMeta),
    ResourceDestroyed(ResourceId),
    ContainerChanged(ContainerMeta),
}

impl Event {
    pub fn flag(&self) -> EventFlags {
        match self {
            Event::Init { .. } => EventFlags::INIT,
            Event::ResourceCreated(_) => EventFlags::RESOURCE_CREATE,
            Event::ResourceChanged(_) => EventFlags::RESOURCE_CHANGE,
            Event::ResourceDestroyed(_) => EventFlags::RESOURCE_DESTROY,
            Event::ContainerChanged(_) => EventFlags::CONTAINER_CHANGE,
        }
    }
}

struct WatcherSlot {
    flags: EventFlags,
    tx: mpsc::UnboundedSender<Event>,
}

/// Fan-out of cluster events to connected watchers. Dead receivers are
/// dropped on the next notify.
#[derive(Default)]
pub struct WatcherHub {
    watchers: Mutex<Vec<WatcherSlot>>,
}

impl WatcherHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a watcher; the provided snapshot becomes its `Init` event.
    pub fn subscribe(
        &self,
        flags: EventFlags,
        snapshot: Event,
    ) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(snapshot);
        self.watchers.lock().unwrap().push(WatcherSlot { flags, tx });
        rx
    }

    pub fn notify(&self, event: Event) {
        let flag = event.flag();
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|w| {
            if !w.flags.contains(flag) {
                return !w.tx.is_closed();
            }
            w.tx.send(event.clone()).is_ok()
        });
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ContainerState, Epoch, ResourceState};
    use std::collections::BTreeMap;

    fn resource_meta(id: u64) -> ResourceMeta {
        ResourceMeta {
            id,
            group: 0,
            start_key: vec![],
            end_key: vec![],
            epoch: Epoch::default(),
            peers: vec![],
            labels: BTreeMap::new(),
            state: ResourceState::Running,
            rule_groups: vec![],
        }
    }

    #[tokio::test]
    async fn init_arrives_before_deltas() {
        let hub = WatcherHub::new();
        let mut rx = hub.subscribe(
            EventFlags::ALL,
            Event::Init { containers: vec![], resources: vec![] },
        );
        hub.notify(Event::ResourceCreated(resource_meta(1)));

        assert!(matches!(rx.recv().await.unwrap(), Event::Init { .. }));
        assert!(matches!(rx.recv().await.unwrap(), Event::ResourceCreated(r) if r.id == 1));
    }

    #[tokio::test]
    async fn flags_filter_deliveries() {
        let hub = WatcherHub::new();
        let mut rx = hub.subscribe(
            EventFlags::INIT | EventFlags::RESOURCE_DESTROY,
            Event::Init { containers: vec![], resources: vec![] },
        );
        hub.notify(Event::ResourceCreated(resource_meta(1)));
        hub.notify(Event::ResourceDestroyed(2));

        let _init = rx.recv().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Event::ResourceDestroyed(2));
    }

    #[tokio::test]
    async fn dropped_watchers_are_pruned() {
        let hub = WatcherHub::new();
        let rx = hub.subscribe(
            EventFlags::ALL,
            Event::Init { containers: vec![], resources: vec![] },
        );
        assert_eq!(hub.watcher_count(), 1);
        drop(rx);
        hub.notify(Event::ResourceDestroyed(1));
        assert_eq!(hub.watcher_count(), 0);
    }

    #[test]
    fn container_change_flag_matches() {
        let event = Event::ContainerChanged(ContainerMeta {
            id: 1,
            addr: "127.0.0.1:1".into(),
            labels: BTreeMap::new(),
            state: ContainerState::Up,
            start_time: 0,
        });
        assert_eq!(event.flag(), EventFlags::CONTAINER_CHANGE);
        assert!(EventFlags::ALL.contains(EventFlags::CONTAINER_CHANGE));
    }
}
