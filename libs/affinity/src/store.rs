//! On-disk artifact tree.
//!
//! Layout:
//!
//! ```text
//! {root}/
//!   {owner email}/
//!     {cluster name}/
//!       graph.json     # written by ArtifactStore
//!       result.json    # written by the solver
//! ```
//!
//! Writes for one (owner, cluster) key are serialized through a per-key lock
//! and land through a temp-file rename, so readers see either the previous
//! artifact or the new one, never a mix. The policy is last-write-wins with no
//! versioning; [`WriteOutcome`] tells the caller whether a previous artifact
//! was replaced.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, instrument};

use crate::graph::GraphArtifact;
use crate::segment::{KeyError, SafeSegment};

/// Artifact file name inside a cluster directory.
pub const GRAPH_FILE_NAME: &str = "graph.json";

/// File the solver is expected to produce next to the artifact.
pub const RESULT_FILE_NAME: &str = "result.json";

/// Artifact storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid artifact key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("artifact not found: {0}")]
    NotFound(PathBuf),

    #[error("corrupt artifact at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to encode artifact: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("artifact I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == ErrorKind::NotFound {
            Self::NotFound(path.to_path_buf())
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Address of one cluster's artifact directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactKey {
    pub owner: SafeSegment,
    pub cluster: SafeSegment,
}

impl ArtifactKey {
    /// Validate both segments. Fails with [`KeyError`] on traversal attempts.
    pub fn new(owner: &str, cluster: &str) -> Result<Self, KeyError> {
        Ok(Self {
            owner: SafeSegment::new(owner)?,
            cluster: SafeSegment::new(cluster)?,
        })
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.cluster)
    }
}

/// What a write did to the previous artifact for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No artifact existed for the key.
    Created,
    /// An existing artifact was fully overwritten (last write wins).
    Replaced,
}

impl WriteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOutcome::Created => "created",
            WriteOutcome::Replaced => "replaced",
        }
    }
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Filesystem-backed artifact store.
pub struct ArtifactStore {
    root: PathBuf,
    locks: Mutex<HashMap<ArtifactKey, KeyLock>>,
    tmp_counter: AtomicU64,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything for one cluster. Pure path computation.
    pub fn cluster_dir(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(&key.owner).join(&key.cluster)
    }

    /// Location of `graph.json` for a cluster. Pure path computation; used for
    /// reads, for the solver command line and for file downloads.
    pub fn path(&self, key: &ArtifactKey) -> PathBuf {
        self.cluster_dir(key).join(GRAPH_FILE_NAME)
    }

    /// Location where the solver drops its result.
    pub fn result_path(&self, key: &ArtifactKey) -> PathBuf {
        self.cluster_dir(key).join(RESULT_FILE_NAME)
    }

    /// Write `artifact` as the cluster's `graph.json`, replacing any previous one.
    #[instrument(skip(self, artifact), fields(key = %key))]
    pub async fn write(
        &self,
        key: &ArtifactKey,
        artifact: &GraphArtifact,
    ) -> Result<WriteOutcome, StoreError> {
        let body = serde_json::to_vec_pretty(artifact).map_err(StoreError::Encode)?;

        let outcome = {
            let handle = self.key_lock(key);
            let _guard = handle.lock().await;
            self.write_locked(key, &body).await
        }?;
        debug!(outcome = outcome.as_str(), bytes = body.len(), "Artifact written");
        Ok(outcome)
    }

    async fn write_locked(&self, key: &ArtifactKey, body: &[u8]) -> Result<WriteOutcome, StoreError> {
        let dir = self.cluster_dir(key);
        // create_dir_all treats an existing directory as success.
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let target = dir.join(GRAPH_FILE_NAME);
        let existed = tokio::fs::try_exists(&target)
            .await
            .map_err(|e| StoreError::io(&target, e))?;

        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(".{GRAPH_FILE_NAME}.{}.{seq}.tmp", std::process::id()));
        let mut pending = PendingTmp::new(tmp.clone());

        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| StoreError::io(&target, e))?;
        pending.persisted();

        // A new artifact invalidates the previous solver output.
        remove_if_present(&dir.join(RESULT_FILE_NAME)).await?;

        Ok(if existed {
            WriteOutcome::Replaced
        } else {
            WriteOutcome::Created
        })
    }

    /// Read and decode a cluster's `graph.json`.
    pub async fn read(&self, key: &ArtifactKey) -> Result<GraphArtifact, StoreError> {
        let path = self.path(key);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;

        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path,
            reason: e.to_string(),
        })
    }

    /// Raw bytes of `graph.json`, for file downloads.
    pub async fn read_raw(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
        let path = self.path(key);
        tokio::fs::read(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))
    }

    /// Read the solver's `result.json`. Its schema belongs to the solver, so
    /// it is only checked to be JSON.
    pub async fn read_result(&self, key: &ArtifactKey) -> Result<serde_json::Value, StoreError> {
        let path = self.result_path(key);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;

        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path,
            reason: e.to_string(),
        })
    }

    /// Delete the cluster's `result.json`. Returns whether one existed.
    pub async fn clear_result(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
        let handle = self.key_lock(key);
        let _guard = handle.lock().await;
        remove_if_present(&self.result_path(key)).await
    }

    /// Whether `graph.json` exists for the key.
    pub async fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
        let path = self.path(key);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))
    }

    /// Cluster directories under an owner, sorted. An owner without a
    /// directory has no clusters. Entries that are not valid segments are
    /// skipped.
    pub async fn list(&self, owner: &SafeSegment) -> Result<Vec<SafeSegment>, StoreError> {
        let dir = self.root.join(owner);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut clusters = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StoreError::io(&entry.path(), e))?;
            if !file_type.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if let Ok(segment) = SafeSegment::new(name) {
                clusters.push(segment);
            }
        }

        clusters.sort();
        Ok(clusters)
    }

    /// Remove a cluster directory and everything in it. Returns whether the
    /// directory existed.
    pub async fn remove(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
        let dir = self.cluster_dir(key);
        let result = {
            let handle = self.key_lock(key);
            let _guard = handle.lock().await;
            tokio::fs::remove_dir_all(&dir).await
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }

    /// Create the root if needed and check it accepts writes.
    pub async fn check_writable(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;

        let marker = self.root.join(format!(".marker.{}", std::process::id()));
        tokio::fs::write(&marker, b"ok")
            .await
            .map_err(|e| StoreError::io(&marker, e))?;
        let _ = tokio::fs::remove_file(&marker).await;
        Ok(())
    }

    fn key_lock<'a>(&'a self, key: &'a ArtifactKey) -> KeyLockHandle<'a> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        KeyLockHandle {
            store: self,
            key,
            lock,
        }
    }

    /// Drop the map entry once `held` is the only handle left. Handles are
    /// cloned under the map lock, so the count cannot grow concurrently.
    fn release_key_lock(&self, key: &ArtifactKey, held: &KeyLock) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let last = locks
            .get(key)
            .is_some_and(|lock| Arc::ptr_eq(lock, held) && Arc::strong_count(held) == 2);
        if last {
            locks.remove(key);
        }
    }
}

/// A clone of a key's lock. Dropping it releases the map entry, also when the
/// future holding it is cancelled mid-write.
struct KeyLockHandle<'a> {
    store: &'a ArtifactStore,
    key: &'a ArtifactKey,
    lock: KeyLock,
}

impl KeyLockHandle<'_> {
    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for KeyLockHandle<'_> {
    fn drop(&mut self) {
        self.store.release_key_lock(self.key, &self.lock);
    }
}

/// Temp file that is removed on drop unless it was renamed into place.
struct PendingTmp {
    path: Option<PathBuf>,
}

impl PendingTmp {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn persisted(&mut self) {
        self.path = None;
    }
}

impl Drop for PendingTmp {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Remove a file, treating "already gone" as success. Returns whether it existed.
async fn remove_if_present(path: &Path) -> Result<bool, StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}
