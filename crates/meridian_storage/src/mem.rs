//! Ordered in-memory engine.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::snapshot;
use crate::{DataStorage, ScanHandler, StatsSnapshot, StorageStats};

/// One stored row. Expiry is a typed field, so an explicit empty value stays
/// a valid, visible row and deletion removes the entry outright.
#[derive(Debug, Clone)]
pub(crate) struct Row {
    pub value: Vec<u8>,
    /// Unix seconds; 0 means no expiry.
    pub expires_at: u64,
}

impl Row {
    fn live(&self, now: u64) -> bool {
        self.expires_at == 0 || self.expires_at > now
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

fn range_bounds(start: &[u8], end: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let upper = if end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(end.to_vec())
    };
    (Bound::Included(start.to_vec()), upper)
}

/// In-memory `DataStorage` backed by a `BTreeMap`.
#[derive(Debug, Default)]
pub struct MemStorage {
    tree: RwLock<BTreeMap<Vec<u8>, Row>>,
    stats: StorageStats,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn put_row(&self, key: &[u8], value: &[u8], ttl_secs: u32) {
        self.stats
            .record_write(1, (key.len() + value.len()) as u64);
        let expires_at = if ttl_secs > 0 {
            unix_now() + u64::from(ttl_secs)
        } else {
            0
        };
        self.tree.write().unwrap().insert(
            key.to_vec(),
            Row {
                value: value.to_vec(),
                expires_at,
            },
        );
    }
}

impl DataStorage for MemStorage {
    fn set(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.put_row(key, value, 0);
        Ok(())
    }

    fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl_secs: u32) -> anyhow::Result<()> {
        self.put_row(key, value, ttl_secs);
        Ok(())
    }

    fn batch_set(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> anyhow::Result<()> {
        for (key, value) in pairs {
            self.put_row(key, value, 0);
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let now = unix_now();
        let tree = self.tree.read().unwrap();
        let found = tree
            .get(key)
            .filter(|row| row.live(now))
            .map(|row| row.value.clone());
        if let Some(value) = &found {
            self.stats.record_read(1, (key.len() + value.len()) as u64);
        }
        Ok(found)
    }

    fn mget(&self, keys: &[Vec<u8>]) -> anyhow::Result<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.stats.record_write(1, key.len() as u64);
        self.tree.write().unwrap().remove(key);
        Ok(())
    }

    fn batch_delete(&self, keys: &[Vec<u8>]) -> anyhow::Result<()> {
        let mut tree = self.tree.write().unwrap();
        let mut bytes = 0u64;
        for key in keys {
            tree.remove(key);
            bytes += key.len() as u64;
        }
        self.stats.record_write(keys.len() as u64, bytes);
        Ok(())
    }

    fn range_delete(&self, start: &[u8], end: &[u8]) -> anyhow::Result<()> {
        let mut tree = self.tree.write().unwrap();
        let doomed: Vec<Vec<u8>> = tree
            .range(range_bounds(start, end))
            .map(|(key, _)| key.clone())
            .collect();
        let mut bytes = 0u64;
        for key in &doomed {
            bytes += key.len() as u64;
            tree.remove(key);
        }
        // Accounting reflects the rows actually removed.
        self.stats.record_write(doomed.len() as u64, bytes);
        Ok(())
    }

    fn scan(&self, start: &[u8], end: &[u8], handler: ScanHandler<'_>) -> anyhow::Result<()> {
        let now = unix_now();
        let tree = self.tree.read().unwrap();
        for (key, row) in tree.range(range_bounds(start, end)) {
            if !row.live(now) {
                continue;
            }
            if !handler(key, &row.value)? {
                break;
            }
        }
        Ok(())
    }

    fn prefix_scan(&self, prefix: &[u8], handler: ScanHandler<'_>) -> anyhow::Result<()> {
        let now = unix_now();
        let tree = self.tree.read().unwrap();
        for (key, row) in tree.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if !row.live(now) {
                continue;
            }
            if !handler(key, &row.value)? {
                break;
            }
        }
        Ok(())
    }

    fn seek(&self, key: &[u8]) -> anyhow::Result<Option<(Vec<u8>, Vec<u8>)>> {
        let now = unix_now();
        let tree = self.tree.read().unwrap();
        for (found, row) in tree.range(key.to_vec()..) {
            if row.live(now) {
                return Ok(Some((found.clone(), row.value.clone())));
            }
        }
        Ok(None)
    }

    fn split_check(
        &self,
        start: &[u8],
        end: &[u8],
        size: u64,
    ) -> anyhow::Result<(u64, u64, Vec<Vec<u8>>)> {
        let now = unix_now();
        let tree = self.tree.read().unwrap();
        let mut total = 0u64;
        let mut keys = 0u64;
        let mut sum = 0u64;
        let mut pending_split = false;
        let mut split_keys = Vec::new();
        for (key, row) in tree.range(range_bounds(start, end)) {
            if !row.live(now) {
                continue;
            }
            if pending_split {
                split_keys.push(key.clone());
                pending_split = false;
                sum = 0;
            }
            let n = (key.len() + row.value.len()) as u64;
            total += n;
            sum += n;
            keys += 1;
            if sum >= size {
                pending_split = true;
            }
        }
        Ok((total, keys, split_keys))
    }

    fn create_snapshot(
        &self,
        path: &Path,
        start: &[u8],
        end: &[u8],
    ) -> anyhow::Result<()> {
        let tree = self.tree.read().unwrap();
        let rows = tree
            .range(range_bounds(start, end))
            .map(|(key, row)| (key.as_slice(), row));
        snapshot::write(path, start, end, rows)
    }

    fn apply_snapshot(&self, path: &Path) -> anyhow::Result<()> {
        let loaded = snapshot::read(path)?;
        let mut tree = self.tree.write().unwrap();
        let doomed: Vec<Vec<u8>> = tree
            .range(range_bounds(&loaded.start, &loaded.end))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            tree.remove(&key);
        }
        for (key, row) in loaded.rows {
            self.stats
                .record_write(1, (key.len() + row.value.len()) as u64);
            tree.insert(key, row);
        }
        Ok(())
    }

    fn sync(&self) -> anyhow::Result<()> {
        self.stats.record_sync();
        Ok(())
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
