use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Namespace {
    Data,
    Meta,
}

/// Durable byte-oriented key-value store underneath the versioned engine.
///
/// A successful `put` or `delete` must be visible to the next `get` and must
/// survive a process restart for implementations that claim durability.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn put(&self, ns: Namespace, key: &[u8], value: &[u8]) -> Result<()>;

    /// Deleting a missing key succeeds silently.
    async fn delete(&self, ns: Namespace, key: &[u8]) -> Result<()>;

    /// All entries of `ns` whose key starts with `prefix`, in key order.
    async fn scan(&self, ns: Namespace, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Reclaims space left behind by overwritten or deleted entries.
    async fn compact(&self) -> Result<()> {
        Ok(())
    }
}

type Index = BTreeMap<(Namespace, Vec<u8>), Vec<u8>>;

fn scan_index(index: &Index, ns: Namespace, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    index
        .range((ns, prefix.to_vec())..)
        .take_while(|((entry_ns, key), _)| *entry_ns == ns && key.starts_with(prefix))
        .map(|((_, key), value)| (key.clone(), value.clone()))
        .collect()
}

#[derive(Default)]
pub struct MemoryBackend {
    index: RwLock<Index>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.index.read().await.get(&(ns, key.to_vec())).cloned())
    }

    async fn put(&self, ns: Namespace, key: &[u8], value: &[u8]) -> Result<()> {
        self.index
            .write()
            .await
            .insert((ns, key.to_vec()), value.to_vec());
        Ok(())
    }

    async fn delete(&self, ns: Namespace, key: &[u8]) -> Result<()> {
        self.index.write().await.remove(&(ns, key.to_vec()));
        Ok(())
    }

    async fn scan(&self, ns: Namespace, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan_index(&*self.index.read().await, ns, prefix))
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Put {
        ns: Namespace,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        ns: Namespace,
        key: Vec<u8>,
    },
}

const FRAME_HEADER: usize = 4;
// bincode body of a `Put` besides key and value: variant tag, namespace
// tag and the two length prefixes.
const PUT_OVERHEAD: usize = 24;

/// When the file backend rewrites its log down to the live entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    /// Logs below this size are never rewritten.
    pub min_log_bytes: u64,
    /// Rewrite once the log is this many times the size of its live entries.
    pub max_garbage_ratio: u64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            min_log_bytes: 1024 * 1024,
            max_garbage_ratio: 4,
        }
    }
}

impl CompactionPolicy {
    fn is_due(&self, log_bytes: u64, live_bytes: u64) -> bool {
        log_bytes > self.min_log_bytes && log_bytes > live_bytes.saturating_mul(self.max_garbage_ratio)
    }
}

/// Size of the frame an index entry occupies after compaction.
fn entry_len(key: &[u8], value: &[u8]) -> u64 {
    (FRAME_HEADER + PUT_OVERHEAD + key.len() + value.len()) as u64
}

struct LogFile {
    file: File,
    /// Bytes in the file.
    len: u64,
    /// Bytes the live index would occupy once compacted.
    live: u64,
    /// Set when a failed write could not be rolled back; no further appends
    /// are accepted.
    failed: bool,
}

impl LogFile {
    /// Cuts the file back to `len` after a write that may have left part of
    /// a frame behind.
    async fn rollback(&mut self, len: u64) {
        match self.file.set_len(len).await {
            Ok(()) => tracing::warn!(len, "Rolled back partial storage log write"),
            Err(e) => {
                tracing::error!(error = %e, "Cannot roll back storage log, refusing further writes");
                self.failed = true;
            }
        }
    }
}

/// Append-only log file with an in-memory index, replayed on open.
///
/// Each record is a 4-byte big-endian length followed by a bincode body.
/// A torn record at the tail (crash mid-append) is truncated on open, and
/// a write that fails at runtime is cut back before the next one lands.
/// The log is rewritten to its live entries whenever overwritten and
/// deleted records outweigh them as set by the [`CompactionPolicy`].
pub struct FileBackend {
    path: PathBuf,
    policy: CompactionPolicy,
    index: RwLock<Index>,
    log: Mutex<LogFile>,
}

impl FileBackend {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, CompactionPolicy::default()).await
    }

    pub async fn open_with(path: impl AsRef<Path>, policy: CompactionPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut index = Index::new();
        let valid_len = match fs::read(&path).await {
            Ok(bytes) => {
                let valid = replay(&bytes, &mut index);
                if valid < bytes.len() {
                    tracing::warn!(
                        path = %path.display(),
                        discarded = bytes.len() - valid,
                        "Truncating torn tail of storage log"
                    );
                }
                valid
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.set_len(valid_len as u64).await?;

        let live = index.iter().map(|((_, key), value)| entry_len(key, value)).sum();
        tracing::info!(path = %path.display(), entries = index.len(), bytes = valid_len, "Opened storage log");

        let backend = Self {
            path,
            policy,
            index: RwLock::new(index),
            log: Mutex::new(LogFile {
                file,
                len: valid_len as u64,
                live,
                failed: false,
            }),
        };
        {
            let mut log = backend.log.lock().await;
            if policy.is_due(log.len, log.live) {
                backend.rewrite(&mut log).await?;
            }
        }
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: LogRecord) -> Result<()> {
        let frame = encode_frame(&record)?;

        // The index is updated under the log lock so log order and index
        // order never disagree.
        let mut log = self.log.lock().await;
        if log.failed {
            return Err(StorageError::LogUnusable(self.path.display().to_string()));
        }

        let start = log.len;
        if let Err(e) = write_synced(&mut log.file, &frame).await {
            log.rollback(start).await;
            return Err(e);
        }
        log.len += frame.len() as u64;

        {
            let mut index = self.index.write().await;
            let (removed, added) = match record {
                LogRecord::Put { ns, key, value } => {
                    let added = entry_len(&key, &value);
                    let removed = index
                        .get(&(ns, key.clone()))
                        .map(|old| entry_len(&key, old))
                        .unwrap_or(0);
                    index.insert((ns, key), value);
                    (removed, added)
                }
                LogRecord::Delete { ns, key } => {
                    let removed = index
                        .remove(&(ns, key.clone()))
                        .map(|old| entry_len(&key, &old))
                        .unwrap_or(0);
                    (removed, 0)
                }
            };
            log.live = log.live.saturating_sub(removed) + added;
        }

        if self.policy.is_due(log.len, log.live) {
            // The record is already durable; a failed rewrite only leaves
            // the log larger than it needs to be.
            if let Err(e) = self.rewrite(&mut log).await {
                tracing::warn!(path = %self.path.display(), error = %e, "Storage log compaction failed");
            }
        }
        Ok(())
    }

    /// Replaces the log with one `Put` per live entry. Caller holds the log
    /// lock.
    async fn rewrite(&self, log: &mut LogFile) -> Result<()> {
        let snapshot = self.index.read().await.clone();
        let before = log.len;

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = File::create(&tmp_path).await?;
        let mut len = 0u64;
        for ((ns, key), value) in snapshot {
            let frame = encode_frame(&LogRecord::Put { ns, key, value })?;
            tmp.write_all(&frame).await?;
            len += frame.len() as u64;
        }
        tmp.sync_all().await?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).await?;
        match OpenOptions::new().append(true).open(&self.path).await {
            Ok(file) => {
                log.file = file;
                log.len = len;
                log.live = len;
            }
            Err(e) => {
                // Appends would go to the unlinked old file.
                log.failed = true;
                return Err(e.into());
            }
        }

        tracing::debug!(path = %self.path.display(), before, after = len, "Compacted storage log");
        Ok(())
    }
}

async fn write_synced(file: &mut File, frame: &[u8]) -> Result<()> {
    file.write_all(frame).await?;
    file.sync_data().await?;
    Ok(())
}

fn encode_frame(record: &LogRecord) -> Result<Vec<u8>> {
    let body = bincode::serialize(record)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Replays every complete record into `index` and returns the length of the
/// valid prefix.
fn replay(bytes: &[u8], index: &mut Index) -> usize {
    let mut pos = 0;
    while pos + FRAME_HEADER <= bytes.len() {
        let mut header = [0u8; FRAME_HEADER];
        header.copy_from_slice(&bytes[pos..pos + FRAME_HEADER]);
        let len = u32::from_be_bytes(header) as usize;
        let start = pos + FRAME_HEADER;
        if start + len > bytes.len() {
            break;
        }
        match bincode::deserialize::<LogRecord>(&bytes[start..start + len]) {
            Ok(LogRecord::Put { ns, key, value }) => {
                index.insert((ns, key), value);
            }
            Ok(LogRecord::Delete { ns, key }) => {
                index.remove(&(ns, key));
            }
            Err(_) => break,
        }
        pos = start + len;
    }
    pos
}

#[async_trait]
impl Backend for FileBackend {
    async fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.index.read().await.get(&(ns, key.to_vec())).cloned())
    }

    async fn put(&self, ns: Namespace, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(LogRecord::Put {
            ns,
            key: key.to_vec(),
            value: value.to_vec(),
        })
        .await
    }

    async fn delete(&self, ns: Namespace, key: &[u8]) -> Result<()> {
        self.append(LogRecord::Delete {
            ns,
            key: key.to_vec(),
        })
        .await
    }

    async fn scan(&self, ns: Namespace, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan_index(&*self.index.read().await, ns, prefix))
    }

    async fn compact(&self) -> Result<()> {
        let mut log = self.log.lock().await;
        if log.failed {
            return Err(StorageError::LogUnusable(self.path.display().to_string()));
        }
        self.rewrite(&mut log).await
    }
}
