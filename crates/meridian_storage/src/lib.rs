//! Data-plane storage engine surface.
//!
//! Storage nodes host shard replicas on a pluggable engine; the coordinator
//! only ever talks to it through this interface. `MemStorage` is the
//! reference engine: an ordered in-memory tree with TTL support, range
//! operations, split checking and length-prefixed snapshot files.

mod mem;
mod snapshot;

pub use mem::MemStorage;

use std::sync::atomic::{AtomicU64, Ordering};

/// Write/read accounting counters kept by every engine.
#[derive(Debug, Default)]
pub struct StorageStats {
    written_keys: AtomicU64,
    written_bytes: AtomicU64,
    read_keys: AtomicU64,
    read_bytes: AtomicU64,
    sync_count: AtomicU64,
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub written_keys: u64,
    pub written_bytes: u64,
    pub read_keys: u64,
    pub read_bytes: u64,
    pub sync_count: u64,
}

impl StorageStats {
    pub fn record_write(&self, keys: u64, bytes: u64) {
        self.written_keys.fetch_add(keys, Ordering::Relaxed);
        self.written_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_read(&self, keys: u64, bytes: u64) {
        self.read_keys.fetch_add(keys, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_sync(&self) {
        self.sync_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            written_keys: self.written_keys.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            read_keys: self.read_keys.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            sync_count: self.sync_count.load(Ordering::Relaxed),
        }
    }
}

/// Scan callback. Return `false` to stop the scan early.
pub type ScanHandler<'a> = &'a mut dyn FnMut(&[u8], &[u8]) -> anyhow::Result<bool>;

/// The engine surface a storage node exposes to its shard replicas.
///
/// All ranges are `[start, end)`; an empty `end` means unbounded.
pub trait DataStorage: Send + Sync {
    fn set(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
    fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl_secs: u32) -> anyhow::Result<()>;
    fn batch_set(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> anyhow::Result<()>;
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
    fn mget(&self, keys: &[Vec<u8>]) -> anyhow::Result<Vec<Option<Vec<u8>>>>;
    fn delete(&self, key: &[u8]) -> anyhow::Result<()>;
    fn batch_delete(&self, keys: &[Vec<u8>]) -> anyhow::Result<()>;
    fn range_delete(&self, start: &[u8], end: &[u8]) -> anyhow::Result<()>;
    fn scan(&self, start: &[u8], end: &[u8], handler: ScanHandler<'_>) -> anyhow::Result<()>;
    fn prefix_scan(&self, prefix: &[u8], handler: ScanHandler<'_>) -> anyhow::Result<()>;
    /// First live row with key >= `key`.
    fn seek(&self, key: &[u8]) -> anyhow::Result<Option<(Vec<u8>, Vec<u8>)>>;
    /// Walk `[start, end)` accumulating row sizes; every time the running sum
    /// reaches `size`, the following key becomes a split point. Returns
    /// (total bytes, total keys, split keys).
    fn split_check(
        &self,
        start: &[u8],
        end: &[u8],
        size: u64,
    ) -> anyhow::Result<(u64, u64, Vec<Vec<u8>>)>;
    fn create_snapshot(&self, path: &std::path::Path, start: &[u8], end: &[u8])
        -> anyhow::Result<()>;
    fn apply_snapshot(&self, path: &std::path::Path) -> anyhow::Result<()>;
    fn sync(&self) -> anyhow::Result<()>;
    fn stats(&self) -> StatsSnapshot;
}
