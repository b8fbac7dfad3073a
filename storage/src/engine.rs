use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

use crate::backend::{Backend, FileBackend, MemoryBackend, Namespace};
use crate::versioning::VersionedValue;
use crate::{NodeId, Result, StorageError, StorageStats};

const CLOCK_KEY: &[u8] = b"clock";
const NODE_ID_KEY: &[u8] = b"node_id";
const APPLY_STRIPES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The incoming version won and is now stored.
    Applied,
    /// An equal or newer version was already stored; nothing changed.
    Stale,
}

/// Versioned key-value store: keeps, per key, the version with the highest
/// update stamp it has seen. Tombstones are stored like any other version.
pub struct StorageEngine {
    backend: Arc<dyn Backend>,
    stripes: Vec<Mutex<()>>,
}

impl StorageEngine {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let stripes = (0..APPLY_STRIPES).map(|_| Mutex::new(())).collect();
        Self { backend, stripes }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Opens (or creates) a file-backed engine under `storage_path`.
    pub async fn open(storage_path: impl AsRef<Path>) -> Result<Self> {
        let storage_path = storage_path.as_ref();
        fs::create_dir_all(storage_path).await?;
        let backend = FileBackend::open(storage_path.join("data.log")).await?;
        Ok(Self::new(Arc::new(backend)))
    }

    /// Stores `incoming` iff its stamp strictly wins over the stored one.
    pub async fn apply(&self, key: &[u8], incoming: VersionedValue) -> Result<ApplyOutcome> {
        let _guard = self.stripe(key).lock().await;

        if let Some(current) = self.read(key).await? {
            if !incoming.supersedes(&current) {
                tracing::trace!(
                    key = %String::from_utf8_lossy(key),
                    stored = current.stamp.counter,
                    incoming = incoming.stamp.counter,
                    "Ignoring stale version"
                );
                return Ok(ApplyOutcome::Stale);
            }
        }

        let encoded = bincode::serialize(&incoming)?;
        self.backend.put(Namespace::Data, key, &encoded).await?;
        Ok(ApplyOutcome::Applied)
    }

    /// Latest stored version of `key`, tombstones included.
    pub async fn get(&self, key: &[u8]) -> Result<Option<VersionedValue>> {
        self.read(key).await
    }

    /// Every stored version, tombstones included, in key order.
    pub async fn scan(&self) -> Result<Vec<(Bytes, VersionedValue)>> {
        let entries = self.backend.scan(Namespace::Data, b"").await?;
        entries
            .into_iter()
            .map(|(key, raw)| {
                let value = decode(&key, &raw)?;
                Ok((Bytes::from(key), value))
            })
            .collect()
    }

    /// Removes tombstones whose counter is at or below `horizon`.
    ///
    /// The horizon is expressed in clock counter units, so reclamation is a
    /// deterministic function of stamps and never of wall-clock time.
    pub async fn reclaim_tombstones(&self, horizon: u64) -> Result<usize> {
        self.reclaim_tombstones_except(horizon, |_, _| false).await
    }

    /// Like [`reclaim_tombstones`](Self::reclaim_tombstones), but keeps every
    /// tombstone for which `keep` returns true.
    pub async fn reclaim_tombstones_except<F>(&self, horizon: u64, keep: F) -> Result<usize>
    where
        F: Fn(&[u8], &VersionedValue) -> bool,
    {
        let mut reclaimed = 0;
        for (key, value) in self.scan().await? {
            if !value.is_tombstone() || value.stamp.counter > horizon || keep(key.as_ref(), &value) {
                continue;
            }
            let _guard = self.stripe(&key).lock().await;
            // Re-check under the stripe lock: a newer write may have landed.
            match self.read(&key).await? {
                Some(current)
                    if current.is_tombstone() && current.stamp.counter <= horizon && !keep(key.as_ref(), &current) =>
                {
                    self.backend.delete(Namespace::Data, &key).await?;
                    reclaimed += 1;
                }
                _ => {}
            }
        }

        if reclaimed > 0 {
            self.backend.compact().await?;
            tracing::info!(reclaimed, horizon, "Reclaimed tombstones");
        }
        Ok(reclaimed)
    }

    pub async fn load_clock(&self) -> Result<u64> {
        match self.backend.get(Namespace::Meta, CLOCK_KEY).await? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                    StorageError::Corruption(format!("clock entry has {} bytes", raw.len()))
                })?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    pub async fn store_clock(&self, counter: u64) -> Result<()> {
        self.backend
            .put(Namespace::Meta, CLOCK_KEY, &counter.to_be_bytes())
            .await
    }

    /// Binds this store to `node_id`. A store that was initialised by another
    /// node refuses the binding: a node never changes identity.
    pub async fn bind_identity(&self, node_id: &NodeId) -> Result<()> {
        match self.backend.get(Namespace::Meta, NODE_ID_KEY).await? {
            Some(raw) => {
                let persisted = String::from_utf8_lossy(&raw).into_owned();
                if persisted != node_id.as_str() {
                    return Err(StorageError::IdentityMismatch {
                        persisted,
                        configured: node_id.to_string(),
                    });
                }
                Ok(())
            }
            None => {
                self.backend
                    .put(Namespace::Meta, NODE_ID_KEY, node_id.as_str().as_bytes())
                    .await
            }
        }
    }

    pub async fn stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats::default();
        for (_, value) in self.scan().await? {
            if value.is_tombstone() {
                stats.tombstones += 1;
            } else {
                stats.live_keys += 1;
                stats.value_bytes += value.size() as u64;
            }
        }
        Ok(stats)
    }

    async fn read(&self, key: &[u8]) -> Result<Option<VersionedValue>> {
        match self.backend.get(Namespace::Data, key).await? {
            Some(raw) => Ok(Some(decode(key, &raw)?)),
            None => Ok(None),
        }
    }

    fn stripe(&self, key: &[u8]) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }
}

fn decode(key: &[u8], raw: &[u8]) -> Result<VersionedValue> {
    bincode::deserialize(raw).map_err(|e| {
        StorageError::Corruption(format!(
            "undecodable version for key {}: {}",
            String::from_utf8_lossy(key),
            e
        ))
    })
}
