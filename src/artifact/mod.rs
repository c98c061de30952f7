use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Marker a live run keeps fresh inside its directory.
const LOCK_FILE: &str = ".lock";

/// Run directories owned by stores in this process.
static LIVE_RUNS: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());

fn live_runs() -> MutexGuard<'static, BTreeSet<PathBuf>> {
    LIVE_RUNS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What an intermediate file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Audio,
    Image,
    Clip,
    CombinedVideo,
    /// Concat playlist handed to the encoding tool.
    Manifest,
    /// Silence tracks and padded audio built while composing a clip.
    Intermediate,
}

/// A file in a run's scratch directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub path: PathBuf,
    pub kind: ArtifactKind,
    /// Segment index, `None` for run-level outputs.
    pub owner: Option<usize>,
}

/// Owns every intermediate file of one pipeline run.
///
/// Each store lives in its own directory, so two runs never share or
/// clobber each other's files even when they share a scratch root.
#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    ledger: Mutex<Vec<Artifact>>,
}

impl ArtifactStore {
    /// Opens `dir` as a scratch store, clearing whatever a previous run left behind.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let store = Self {
            dir,
            ledger: Mutex::new(Vec::new()),
        };
        store.clear().await?;
        Ok(store)
    }

    /// Opens a fresh `run-<uuid>` directory under `root`, first sweeping
    /// whatever earlier runs left there.
    ///
    /// A run directory survives the sweep while a store in this process owns
    /// it or while its lock marker is younger than `stale_after`.
    pub async fn open_run(root: impl AsRef<Path>, stale_after: Duration) -> Result<Self> {
        let root = root.as_ref();
        tokio::fs::create_dir_all(root).await?;
        sweep(root, stale_after).await?;

        let dir = root.join(format!("run-{}", Uuid::new_v4()));
        live_runs().insert(dir.clone());
        let store = match Self::open(dir.clone()).await {
            Ok(store) => store,
            Err(e) => {
                live_runs().remove(&dir);
                return Err(e);
            }
        };
        store.heartbeat().await?;
        Ok(store)
    }

    /// Refreshes the lock marker so other processes leave this run alone.
    pub async fn heartbeat(&self) -> Result<()> {
        tokio::fs::write(self.dir.join(LOCK_FILE), std::process::id().to_string()).await?;
        Ok(())
    }

    /// Gives up ownership but leaves the files for inspection. The next
    /// run's sweep removes them.
    pub async fn release(self) {
        if let Err(e) = tokio::fs::remove_file(self.dir.join(LOCK_FILE)).await {
            debug!("No lock marker to remove in {}: {}", self.dir.display(), e);
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ledger(&self) -> MutexGuard<'_, Vec<Artifact>> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a new artifact whose file will be produced by someone else (e.g. FFmpeg).
    pub fn reserve(&self, kind: ArtifactKind, owner: Option<usize>, ext: &str) -> Artifact {
        let id = Uuid::new_v4();
        let artifact = Artifact {
            id,
            path: self.dir.join(format!("{}.{}", id, ext)),
            kind,
            owner,
        };
        debug!("Reserved {:?} artifact {}", kind, artifact.path.display());
        self.ledger().push(artifact.clone());
        artifact
    }

    /// Writes `bytes` as a new artifact.
    pub async fn write(
        &self,
        kind: ArtifactKind,
        owner: Option<usize>,
        ext: &str,
        bytes: &[u8],
    ) -> Result<Artifact> {
        let artifact = self.reserve(kind, owner, ext);
        if let Err(e) = tokio::fs::write(&artifact.path, bytes).await {
            self.forget(artifact.id);
            return Err(e.into());
        }
        Ok(artifact)
    }

    pub fn get(&self, id: Uuid) -> Option<Artifact> {
        self.ledger().iter().find(|a| a.id == id).cloned()
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.ledger().clone()
    }

    fn forget(&self, id: Uuid) {
        self.ledger().retain(|a| a.id != id);
    }

    /// Deletes one artifact. A file that was never produced is not an error.
    pub async fn discard(&self, artifact: &Artifact) -> Result<()> {
        self.forget(artifact.id);
        match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves an artifact out of the store to a durable location.
    pub async fn persist(&self, artifact: &Artifact, dest: &Path) -> Result<PathBuf> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::rename(&artifact.path, dest).await.is_err() {
            // rename fails across filesystems
            tokio::fs::copy(&artifact.path, dest).await?;
            tokio::fs::remove_file(&artifact.path).await?;
        }
        self.forget(artifact.id);
        info!("Saved {:?} artifact to {}", artifact.kind, dest.display());
        Ok(dest.to_path_buf())
    }

    /// Removes every file in the scratch directory.
    pub async fn clear(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
            removed += 1;
        }
        self.ledger().clear();
        if removed > 0 {
            debug!("Cleared {} stale entries from {}", removed, self.dir.display());
        }
        Ok(())
    }

    /// Clears and removes the scratch directory.
    pub async fn close(self) -> Result<()> {
        self.clear().await?;
        if let Err(e) = tokio::fs::remove_dir(&self.dir).await {
            warn!("Failed to remove scratch dir {}: {}", self.dir.display(), e);
        }
        Ok(())
    }
}

impl Drop for ArtifactStore {
    fn drop(&mut self) {
        live_runs().remove(&self.dir);
    }
}

/// Deletes loose files and abandoned run directories under `root`.
async fn sweep(root: &Path, stale_after: Duration) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut removed = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let outcome = if entry.file_type().await?.is_dir() {
            if live_runs().contains(&path) || lock_is_fresh(&path, stale_after).await {
                continue;
            }
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match outcome {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove stale scratch entry {}: {}", path.display(), e),
        }
    }
    if removed > 0 {
        info!("Swept {} stale entries from {}", removed, root.display());
    }
    Ok(removed)
}

async fn lock_is_fresh(dir: &Path, stale_after: Duration) -> bool {
    match tokio::fs::metadata(dir.join(LOCK_FILE)).await.and_then(|m| m.modified()) {
        // a timestamp in the future counts as fresh
        Ok(modified) => modified.elapsed().map(|age| age < stale_after).unwrap_or(true),
        Err(_) => false,
    }
}
