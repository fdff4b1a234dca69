//! Crash-atomic snapshot persistence.

use std::path::{Path, PathBuf};

use super::metadata::SnapshotMetadata;

/// Name of the manifest file inside a snapshot directory.
const MANIFEST_FILE: &str = "manifest.json";

/// Name of the staging directory for in-flight snapshots.
const PENDING_DIR: &str = "pending";

/// How many published snapshots are retained (latest + fallback).
pub(crate) const RETAINED_SNAPSHOTS: usize = 2;

/// Errors from snapshot store operations.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotStoreError {
    /// I/O error during snapshot persistence.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest serialization/deserialization error.
    #[error("snapshot manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    /// A published snapshot failed verification.
    #[error("snapshot {name} is corrupt: {message}")]
    Corrupt {
        /// Snapshot directory name.
        name: String,
        /// What failed.
        message: String,
    },
}

/// A published snapshot on disk.
#[derive(Debug, Clone)]
pub struct Snapshot {
    metadata: SnapshotMetadata,
    path: PathBuf,
}

impl Snapshot {
    /// Returns the snapshot metadata.
    #[must_use]
    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    /// Returns the snapshot directory, which holds the manifest and the
    /// state engine's files.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Fsync a file to ensure its contents are durable on disk.
fn sync_file(path: &Path) -> Result<(), std::io::Error> {
    // Must open with write access — Windows requires it for FlushFileBuffers.
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.sync_all()
}

/// Fsync a directory to make rename operations durable.
#[allow(clippy::unnecessary_wraps)] // Returns Result on Unix, no-op elsewhere
fn sync_dir(path: &Path) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Filesystem-backed snapshot store.
///
/// Snapshots are staged under `pending/`, fsynced, and published with an
/// atomic rename; readers never observe a partial snapshot. The last
/// [`RETAINED_SNAPSHOTS`] snapshots are kept so recovery can fall back if
/// the latest fails verification.
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Opens (or creates) a store rooted at `root`, discarding any
    /// in-flight copies left behind by a crash.
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotStoreError`] if the directories cannot be
    /// created or cleaned.
    pub fn open(root: &Path) -> Result<Self, SnapshotStoreError> {
        std::fs::create_dir_all(root.join(PENDING_DIR))?;
        let store = Self {
            root: root.to_path_buf(),
        };
        store.abort_pending()?;
        Ok(store)
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a staging directory for an in-flight snapshot.
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotStoreError`] if it cannot be created.
    pub fn begin_pending(&self, hint: &str) -> Result<PathBuf, SnapshotStoreError> {
        let dir = self.root.join(PENDING_DIR).join(hint);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Publishes an in-flight snapshot: writes the manifest, fsyncs every
    /// file, and atomically renames the staging directory into place.
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotStoreError`] if any step fails; the staging
    /// directory is left for [`abort_pending`](Self::abort_pending).
    pub fn publish(
        &self,
        pending: &Path,
        metadata: &SnapshotMetadata,
    ) -> Result<Snapshot, SnapshotStoreError> {
        let manifest_path = pending.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(metadata)?;
        std::fs::write(&manifest_path, &json)?;

        // Everything in the staging directory must be durable before the
        // rename makes it visible.
        for entry in std::fs::read_dir(pending)? {
            let entry = entry?;
            if entry.path().is_file() {
                sync_file(&entry.path())?;
            }
        }
        sync_dir(pending)?;

        let final_path = self.root.join(metadata.dir_name());
        std::fs::rename(pending, &final_path)?;
        sync_dir(&self.root)?;

        tracing::info!(snapshot = %metadata, "snapshot published");
        Ok(Snapshot {
            metadata: *metadata,
            path: final_path,
        })
    }

    /// Returns all published snapshots that pass verification, newest
    /// first.
    ///
    /// Corrupt snapshots are skipped with a warning, which is what lets
    /// recovery fall back to the predecessor.
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotStoreError`] if the root cannot be listed.
    pub fn all(&self) -> Result<Vec<Snapshot>, SnapshotStoreError> {
        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(metadata) = SnapshotMetadata::parse_dir_name(name) else {
                continue; // pending/ and anything else
            };

            match Self::verify(&path, metadata) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(error) => {
                    tracing::warn!(snapshot = name, %error, "skipping unverifiable snapshot");
                }
            }
        }
        snapshots.sort_by(|a, b| b.metadata.index.cmp(&a.metadata.index));
        Ok(snapshots)
    }

    /// Returns the latest verifiable snapshot, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotStoreError`] if the root cannot be listed.
    pub fn latest(&self) -> Result<Option<Snapshot>, SnapshotStoreError> {
        Ok(self.all()?.into_iter().next())
    }

    /// Deletes published snapshots beyond the newest `keep`.
    ///
    /// Returns the number deleted. Never deletes the newest snapshot, so
    /// a replace always completes before its predecessor is removed.
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotStoreError`] if the root cannot be listed.
    pub fn prune(&self, keep: usize) -> Result<usize, SnapshotStoreError> {
        let snapshots = self.all()?;
        let mut removed = 0;
        for snapshot in snapshots.iter().skip(keep.max(1)) {
            if std::fs::remove_dir_all(&snapshot.path).is_ok() {
                tracing::debug!(snapshot = %snapshot.metadata, "pruned old snapshot");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Discards all in-flight staging directories.
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotStoreError`] if the pending directory cannot
    /// be listed.
    pub fn abort_pending(&self) -> Result<(), SnapshotStoreError> {
        let pending_root = self.root.join(PENDING_DIR);
        for entry in std::fs::read_dir(&pending_root)? {
            let entry = entry?;
            let path = entry.path();
            tracing::warn!(path = %path.display(), "discarding in-flight snapshot");
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn verify(path: &Path, expected: SnapshotMetadata) -> Result<Snapshot, SnapshotStoreError> {
        let name = expected.dir_name();
        let manifest_path = path.join(MANIFEST_FILE);
        let json =
            std::fs::read_to_string(&manifest_path).map_err(|e| SnapshotStoreError::Corrupt {
                name: name.clone(),
                message: format!("manifest unreadable: {e}"),
            })?;
        let metadata: SnapshotMetadata =
            serde_json::from_str(&json).map_err(|e| SnapshotStoreError::Corrupt {
                name: name.clone(),
                message: format!("manifest unparsable: {e}"),
            })?;

        if metadata.index != expected.index || metadata.position != expected.position {
            return Err(SnapshotStoreError::Corrupt {
                name,
                message: format!(
                    "manifest does not match directory name: {} vs {}",
                    metadata, expected
                ),
            });
        }

        Ok(Snapshot {
            metadata,
            path: path.to_path_buf(),
        })
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}
