//! Metadata persistence.
//!
//! The replicated state machine behind the leader is reached through
//! `KvBackend`: `FjallBackend` gives a durable single-process deployment,
//! `MemBackend` is the shared in-process stand-in tests use for a
//! multi-coordinator cluster (one `Arc` shared by every coordinator plays
//! the replicated store). Values are JSON, keys live under fixed keyspace
//! prefixes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::meta::{ContainerMeta, DestroyingStatus, Job, ResourceMeta, ScheduleGroupRule};
use crate::placement::Rule;

const CONTAINERS: &str = "/containers/";
const RESOURCES: &str = "/resources/";
const RULES: &str = "/rules/";
const SCHEDULERS: &str = "/schedulers/";
const JOBS: &str = "/jobs/";
const DESTROYING: &str = "/destroying/";
const GROUP_RULES: &str = "/group-rules/";
const ID_ALLOC_KEY: &str = "/id-alloc/next";

/// Key-value backend with the operations C1 needs. `cas` is the only
/// conditional primitive; the id allocator is built on it.
pub trait KvBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
    fn delete(&self, key: &[u8]) -> anyhow::Result<()>;
    fn range(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>>;
    /// Atomically replace `key` if its current value matches `expect`
    /// (`None` = absent). Returns whether the swap happened.
    fn cas(&self, key: &[u8], expect: Option<&[u8]>, value: &[u8]) -> anyhow::Result<bool>;
}

/// Shared in-memory backend.
#[derive(Default)]
pub struct MemBackend {
    tree: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemBackend {
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.tree
            .lock()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.tree.lock().unwrap().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.tree.lock().unwrap().remove(key);
        Ok(())
    }

    fn range(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tree = self.tree.lock().unwrap();
        Ok(tree
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn cas(&self, key: &[u8], expect: Option<&[u8]>, value: &[u8]) -> anyhow::Result<bool> {
        let mut tree = self.tree.lock().unwrap();
        let current = tree.get(key).map(|v| v.as_slice());
        if current != expect {
            return Ok(false);
        }
        tree.insert(key.to_vec(), value.to_vec());
        Ok(true)
    }
}

/// Durable fjall-backed store. Every write is persisted before returning,
/// matching the committed-before-acknowledged contract.
pub struct FjallBackend {
    keyspace: Keyspace,
    partition: PartitionHandle,
    cas_lock: Mutex<()>,
}

impl FjallBackend {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open metadata keyspace")?;
        let partition = keyspace
            .open_partition("meta", PartitionCreateOptions::default())
            .context("open meta partition")?;
        Ok(Self {
            keyspace,
            partition,
            cas_lock: Mutex::new(()),
        })
    }

    fn persist(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist metadata")
    }
}

impl KvBackend for FjallBackend {
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.partition.insert(key, value)?;
        self.persist()
    }

    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.partition.get(key)?.map(|v| v.to_vec()))
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.partition.remove(key)?;
        self.persist()
    }

    fn range(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.partition.prefix(prefix) {
            let (key, value) = item?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn cas(&self, key: &[u8], expect: Option<&[u8]>, value: &[u8]) -> anyhow::Result<bool> {
        let _guard = self.cas_lock.lock().unwrap();
        let current = self.partition.get(key)?;
        if current.as_deref() != expect {
            return Ok(false);
        }
        self.partition.insert(key, value)?;
        self.persist()?;
        Ok(true)
    }
}

/// Typed facade over the backend keyspaces.
#[derive(Clone)]
pub struct MetaStorage {
    backend: Arc<dyn KvBackend>,
}

fn id_key(prefix: &str, id: u64) -> Vec<u8> {
    format!("{prefix}{id:020}").into_bytes()
}

fn encode<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(value).context("encode metadata value")
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> anyhow::Result<T> {
    serde_json::from_slice(data).context("decode metadata value")
}

impl MetaStorage {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    fn put_typed<T: Serialize>(&self, key: Vec<u8>, value: &T) -> anyhow::Result<()> {
        self.backend.put(&key, &encode(value)?)
    }

    fn get_typed<T: DeserializeOwned>(&self, key: &[u8]) -> anyhow::Result<Option<T>> {
        match self.backend.get(key)? {
            Some(data) => Ok(Some(decode(&data)?)),
            None => Ok(None),
        }
    }

    fn load_typed<T: DeserializeOwned>(&self, prefix: &str) -> anyhow::Result<Vec<T>> {
        let mut out = Vec::new();
        for (_, value) in self.backend.range(prefix.as_bytes())? {
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    pub fn put_container(&self, meta: &ContainerMeta) -> anyhow::Result<()> {
        self.put_typed(id_key(CONTAINERS, meta.id), meta)
    }

    pub fn get_container(&self, id: u64) -> anyhow::Result<Option<ContainerMeta>> {
        self.get_typed(&id_key(CONTAINERS, id))
    }

    pub fn load_containers(&self) -> anyhow::Result<Vec<ContainerMeta>> {
        self.load_typed(CONTAINERS)
    }

    pub fn put_resource(&self, meta: &ResourceMeta) -> anyhow::Result<()> {
        self.put_typed(id_key(RESOURCES, meta.id), meta)
    }

    pub fn get_resource(&self, id: u64) -> anyhow::Result<Option<ResourceMeta>> {
        self.get_typed(&id_key(RESOURCES, id))
    }

    pub fn remove_resource(&self, id: u64) -> anyhow::Result<()> {
        self.backend.delete(&id_key(RESOURCES, id))
    }

    pub fn load_resources(&self) -> anyhow::Result<Vec<ResourceMeta>> {
        self.load_typed(RESOURCES)
    }

    pub fn put_rule(&self, rule: &Rule) -> anyhow::Result<()> {
        let key = format!("{RULES}{}/{}", rule.group_id, rule.id).into_bytes();
        self.put_typed(key, rule)
    }

    pub fn remove_rule(&self, group_id: &str, id: &str) -> anyhow::Result<()> {
        self.backend
            .delete(format!("{RULES}{group_id}/{id}").as_bytes())
    }

    pub fn load_rules(&self) -> anyhow::Result<Vec<Rule>> {
        self.load_typed(RULES)
    }

    pub fn put_scheduler_config(&self, name: &str, config: &[u8]) -> anyhow::Result<()> {
        self.backend
            .put(format!("{SCHEDULERS}{name}").as_bytes(), config)
    }

    pub fn get_scheduler_config(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.backend.get(format!("{SCHEDULERS}{name}").as_bytes())
    }

    pub fn load_scheduler_configs(&self) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for (key, value) in self.backend.range(SCHEDULERS.as_bytes())? {
            let name = String::from_utf8_lossy(&key[SCHEDULERS.len()..]).into_owned();
            out.push((name, value));
        }
        Ok(out)
    }

    pub fn put_job(&self, job: &Job) -> anyhow::Result<()> {
        self.put_typed(id_key(JOBS, job.id), job)
    }

    pub fn get_job(&self, id: u64) -> anyhow::Result<Option<Job>> {
        self.get_typed(&id_key(JOBS, id))
    }

    pub fn remove_job(&self, id: u64) -> anyhow::Result<()> {
        self.backend.delete(&id_key(JOBS, id))
    }

    pub fn load_jobs(&self) -> anyhow::Result<Vec<Job>> {
        self.load_typed(JOBS)
    }

    pub fn put_destroying(&self, id: u64, status: &DestroyingStatus) -> anyhow::Result<()> {
        self.put_typed(id_key(DESTROYING, id), status)
    }

    pub fn get_destroying(&self, id: u64) -> anyhow::Result<Option<DestroyingStatus>> {
        self.get_typed(&id_key(DESTROYING, id))
    }

    pub fn remove_destroying(&self, id: u64) -> anyhow::Result<()> {
        self.backend.delete(&id_key(DESTROYING, id))
    }

    pub fn put_group_rule(&self, rule: &ScheduleGroupRule) -> anyhow::Result<()> {
        let key = format!("{GROUP_RULES}{:020}/{}", rule.group_id, rule.name).into_bytes();
        self.put_typed(key, rule)
    }

    pub fn load_group_rules(&self) -> anyhow::Result<Vec<ScheduleGroupRule>> {
        self.load_typed(GROUP_RULES)
    }

    /// Allocate `count` consecutive ids, returning the first. CAS keeps the
    /// counter correct across competing writers.
    pub fn alloc_ids(&self, count: u64) -> anyhow::Result<u64> {
        debug_assert!(count > 0);
        loop {
            let current = self.backend.get(ID_ALLOC_KEY.as_bytes())?;
            let next: u64 = match &current {
                Some(data) => decode(data)?,
                None => 1,
            };
            let updated = encode(&(next + count))?;
            if self
                .backend
                .cas(ID_ALLOC_KEY.as_bytes(), current.as_deref(), &updated)?
            {
                return Ok(next);
            }
        }
    }
}

/// Monotonic id allocation seam.
pub trait IdAllocator: Send + Sync {
    fn alloc(&self) -> anyhow::Result<u64>;
}

impl IdAllocator for MetaStorage {
    fn alloc(&self) -> anyhow::Result<u64> {
        self.alloc_ids(1)
    }
}

/// Plain counter for tests and fixtures.
#[derive(Debug, Default)]
pub struct SeqIdAllocator {
    next: AtomicU64,
}

impl SeqIdAllocator {
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl IdAllocator for SeqIdAllocator {
    fn alloc(&self) -> anyhow::Result<u64> {
        Ok(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ContainerState, Epoch, Peer, PeerRole, ResourceState};

    fn storage() -> MetaStorage {
        MetaStorage::new(Arc::new(MemBackend::new()))
    }

    fn container(id: u64) -> ContainerMeta {
        ContainerMeta {
            id,
            addr: format!("127.0.0.1:{}", 20000 + id),
            labels: BTreeMap::new(),
            state: ContainerState::Up,
            start_time: 0,
        }
    }

    fn resource(id: u64) -> ResourceMeta {
        ResourceMeta {
            id,
            group: 0,
            start_key: vec![id as u8],
            end_key: vec![id as u8 + 1],
            epoch: Epoch { conf_ver: 1, version: 1 },
            peers: vec![Peer { id: id * 10, container_id: 1, role: PeerRole::Voter }],
            labels: BTreeMap::new(),
            state: ResourceState::Running,
            rule_groups: vec![],
        }
    }

    #[test]
    fn entities_roundtrip_through_the_store() {
        let storage = storage();
        let c = container(4);
        storage.put_container(&c).unwrap();
        assert_eq!(storage.get_container(4).unwrap(), Some(c.clone()));
        assert_eq!(storage.load_containers().unwrap(), vec![c]);

        let r = resource(7);
        storage.put_resource(&r).unwrap();
        assert_eq!(storage.get_resource(7).unwrap(), Some(r.clone()));
        storage.remove_resource(7).unwrap();
        assert_eq!(storage.get_resource(7).unwrap(), None);
    }

    #[test]
    fn load_keeps_numeric_order() {
        let storage = storage();
        for id in [20, 3, 100] {
            storage.put_resource(&resource(id)).unwrap();
        }
        let ids: Vec<u64> = storage
            .load_resources()
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![3, 20, 100]);
    }

    #[test]
    fn id_allocation_is_monotonic() {
        let storage = storage();
        let a = storage.alloc_ids(1).unwrap();
        let b = storage.alloc_ids(5).unwrap();
        let c = storage.alloc_ids(1).unwrap();
        assert!(a < b);
        assert_eq!(c, b + 5);
    }

    #[test]
    fn destroying_status_roundtrip() {
        let storage = storage();
        let mut status = DestroyingStatus {
            state: ResourceState::Destroying,
            index: 9,
            remove_data: true,
            replicas: [(1, false), (2, false)].into_iter().collect(),
        };
        storage.put_destroying(5, &status).unwrap();
        status.replicas.insert(1, true);
        storage.put_destroying(5, &status).unwrap();
        assert_eq!(storage.get_destroying(5).unwrap(), Some(status));
    }

    #[test]
    fn fjall_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = MetaStorage::new(Arc::new(FjallBackend::open(dir.path()).unwrap()));
            storage.put_container(&container(1)).unwrap();
        }
        let storage = MetaStorage::new(Arc::new(FjallBackend::open(dir.path()).unwrap()));
        assert_eq!(storage.get_container(1).unwrap(), Some(container(1)));
    }
}
