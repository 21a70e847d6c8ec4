//! Process-wide shared state: blobs, the window cache, the object store
//! and per-transfer outcomes.
//!
//! One [`Registry`] is created at startup and handed to every component
//! that needs it as an `Arc<Registry>`.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;
use tracing::{debug, info};

use crate::blob::{Blob, BlobSpec};
use crate::error::{PvrtError, Result};
use crate::hash::{Hash16, sha256_hex};

/// Default number of windows kept in the cache.
pub const DEFAULT_WINDOW_CACHE: usize = 16 * 1024;

/// Default byte budget for objects held in memory.
pub const DEFAULT_OBJECT_MEMORY: usize = 256 * 1024 * 1024;

/// Default number of transfers whose outcome and window failures are kept.
pub const DEFAULT_HISTORY: usize = 4096;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── WindowCache ──────────────────────────────────────────────────

/// Content-addressed cache of verified windows, keyed by `hash16`.
/// Oldest entries are evicted first once `capacity` is reached.
#[derive(Debug)]
pub struct WindowCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<Hash16, Arc<Vec<u8>>>,
    order: VecDeque<Hash16>,
}

impl WindowCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::default(),
        }
    }

    pub fn insert(&self, hash: Hash16, bytes: Vec<u8>) {
        let mut inner = lock(&self.inner);
        if inner.map.contains_key(&hash) {
            return;
        }
        while inner.map.len() >= self.capacity {
            let Some(old) = inner.order.pop_front() else { break };
            inner.map.remove(&old);
        }
        inner.map.insert(hash, Arc::new(bytes));
        inner.order.push_back(hash);
    }

    pub fn get(&self, hash: &Hash16) -> Option<Arc<Vec<u8>>> {
        lock(&self.inner).map.get(hash).cloned()
    }

    pub fn contains(&self, hash: &Hash16) -> bool {
        lock(&self.inner).map.contains_key(hash)
    }

    /// Positional view of `remote` as known locally.
    pub fn local_view(&self, remote: &[Hash16]) -> Vec<Option<Hash16>> {
        let inner = lock(&self.inner);
        remote
            .iter()
            .map(|h| inner.map.contains_key(h).then_some(*h))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── ObjectStore ──────────────────────────────────────────────────

/// Verified objects addressed by their hex SHA-256, also written to `dir`
/// when one is configured.
///
/// Memory holds the most recent objects up to `memory_limit` bytes; older
/// ones are evicted first. Without a directory an evicted object is gone.
/// The newest object is always kept, whatever its size.
#[derive(Debug)]
pub struct ObjectStore {
    dir: Option<PathBuf>,
    memory_limit: usize,
    memory: Mutex<MemoryObjects>,
}

#[derive(Debug, Default)]
struct MemoryObjects {
    map: HashMap<String, Arc<Vec<u8>>>,
    order: VecDeque<String>,
    bytes: usize,
}

impl MemoryObjects {
    fn insert(&mut self, key: String, bytes: Vec<u8>, limit: usize) {
        if self.map.contains_key(&key) {
            return;
        }
        while !self.order.is_empty() && self.bytes + bytes.len() > limit {
            let Some(old) = self.order.pop_front() else { break };
            if let Some(evicted) = self.map.remove(&old) {
                self.bytes -= evicted.len();
                debug!(sha256 = %old, len = evicted.len(), "object evicted from memory");
            }
        }
        self.bytes += bytes.len();
        self.order.push_back(key.clone());
        self.map.insert(key, Arc::new(bytes));
    }
}

impl ObjectStore {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            memory_limit: DEFAULT_OBJECT_MEMORY,
            memory: Mutex::default(),
        }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: Some(dir),
            ..Self::in_memory()
        })
    }

    /// Cap the bytes held in memory.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Bytes currently held in memory.
    pub fn memory_used(&self) -> usize {
        lock(&self.memory).bytes
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Store `bytes`; returns the hex digest it is addressed by.
    pub fn put(&self, bytes: Vec<u8>) -> Result<String> {
        let key = sha256_hex(&bytes);
        if let Some(dir) = &self.dir {
            let path = dir.join(&key);
            if !path.exists() {
                let tmp = dir.join(format!("{key}.part"));
                std::fs::write(&tmp, &bytes)?;
                std::fs::rename(&tmp, &path)?;
            }
            debug!(path = %path.display(), "object written");
        }
        lock(&self.memory).insert(key.clone(), bytes, self.memory_limit);
        Ok(key)
    }

    pub fn get(&self, sha256_hex: &str) -> Result<Option<Arc<Vec<u8>>>> {
        if let Some(bytes) = lock(&self.memory).map.get(sha256_hex) {
            return Ok(Some(bytes.clone()));
        }
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        // Keys are hex digests; anything else never names a stored object.
        if sha256_hex.len() != 64 || !sha256_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(None);
        }
        match std::fs::read(dir.join(sha256_hex)) {
            Ok(bytes) => Ok(Some(Arc::new(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, sha256_hex: &str) -> bool {
        matches!(self.get(sha256_hex), Ok(Some(_)))
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

// ── Outcomes ─────────────────────────────────────────────────────

/// Per-transfer records, keeping the `capacity` most recently created.
#[derive(Debug)]
struct Recent<V> {
    capacity: usize,
    map: HashMap<String, V>,
    order: VecDeque<String>,
}

impl<V: Default> Recent<V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn entry(&mut self, transfer_id: &str) -> &mut V {
        if !self.map.contains_key(transfer_id) {
            while self.map.len() >= self.capacity {
                let Some(old) = self.order.pop_front() else { break };
                self.map.remove(&old);
            }
            self.order.push_back(transfer_id.to_string());
        }
        self.map.entry(transfer_id.to_string()).or_default()
    }

    fn get(&self, transfer_id: &str) -> Option<&V> {
        self.map.get(transfer_id)
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowFailure {
    pub idx: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeState {
    Done,
    Failed,
}

impl std::fmt::Display for OutcomeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Final result of a transfer as seen by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    pub transfer_id: String,
    pub state: OutcomeState,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub windows_sent: u32,
    pub windows_cached: u32,
}

// ── Registry ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Registry {
    blobs: RwLock<HashMap<String, Arc<Blob>>>,
    windows: WindowCache,
    objects: ObjectStore,
    failures: Mutex<Recent<Vec<WindowFailure>>>,
    outcomes: Mutex<Recent<Option<TransferOutcome>>>,
    accept_unknown: bool,
}

impl Registry {
    pub fn new(objects: ObjectStore, window_cache: usize) -> Self {
        Self {
            blobs: RwLock::default(),
            windows: WindowCache::new(window_cache),
            objects,
            failures: Mutex::new(Recent::new(DEFAULT_HISTORY)),
            outcomes: Mutex::new(Recent::new(DEFAULT_HISTORY)),
            accept_unknown: false,
        }
    }

    /// Keep outcomes and window failures for at most `transfers` transfers.
    pub fn history_limit(self, transfers: usize) -> Self {
        Self {
            failures: Mutex::new(Recent::new(transfers)),
            outcomes: Mutex::new(Recent::new(transfers)),
            ..self
        }
    }

    /// Let senders name blobs this registry has not created yet.
    pub fn accept_unknown_blobs(mut self, accept: bool) -> Self {
        self.accept_unknown = accept;
        self
    }

    pub fn in_memory() -> Self {
        Self::new(ObjectStore::in_memory(), DEFAULT_WINDOW_CACHE)
    }

    /// Attach to the blob with this identity, creating it when `create` is
    /// set. Without `create`, an unknown identity is `BlobNotFound`.
    pub fn create_or_attach(&self, spec: &BlobSpec, create: bool) -> Result<Arc<Blob>> {
        let fp = spec.fingerprint();
        if let Some(blob) = self.blob(&fp) {
            return Ok(blob);
        }
        if !create {
            return Err(PvrtError::BlobNotFound(fp));
        }
        let mut blobs = self.blobs.write().unwrap_or_else(|p| p.into_inner());
        // Another caller may have created it while we waited for the lock.
        if let Some(blob) = blobs.get(&fp) {
            return Ok(blob.clone());
        }
        let blob = Arc::new(Blob::new(spec.clone())?);
        info!(fingerprint = %fp, size = spec.size, "blob created");
        blobs.insert(fp, blob.clone());
        Ok(blob)
    }

    /// Blob for a sender-supplied identity.
    pub fn attach(&self, spec: &BlobSpec) -> Result<Arc<Blob>> {
        self.create_or_attach(spec, self.accept_unknown)
    }

    pub fn blob(&self, fingerprint: &str) -> Option<Arc<Blob>> {
        self.blobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(fingerprint)
            .cloned()
    }

    pub fn windows(&self) -> &WindowCache {
        &self.windows
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    pub fn record_window_failure(&self, transfer_id: &str, idx: u32, reason: impl Into<String>) {
        lock(&self.failures)
            .entry(transfer_id)
            .push(WindowFailure {
                idx,
                reason: reason.into(),
            });
    }

    pub fn window_failures(&self, transfer_id: &str) -> Vec<WindowFailure> {
        lock(&self.failures).get(transfer_id).cloned().unwrap_or_default()
    }

    pub fn record_outcome(&self, outcome: TransferOutcome) {
        let tid = outcome.transfer_id.clone();
        *lock(&self.outcomes).entry(&tid) = Some(outcome);
    }

    pub fn outcome(&self, transfer_id: &str) -> Option<TransferOutcome> {
        lock(&self.outcomes).get(transfer_id).cloned().flatten()
    }

    /// Number of transfers with a recorded outcome.
    pub fn outcome_count(&self) -> usize {
        lock(&self.outcomes).len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::in_memory()
    }
}

// ── Tests ────────────────────────────────────────────────────────
