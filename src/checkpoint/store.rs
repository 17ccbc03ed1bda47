//! File-backed checkpoint persistence.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::CheckpointKey;
use crate::error::TransferError;

/// Attempts made by [`CheckpointStore::remove`] before giving up.
const REMOVE_ATTEMPTS: u32 = 3;

/// Durable key to JSON mapping, one file per key under a root directory.
///
/// Saves are atomic: the value is written to a hidden temp file in the same
/// directory, synced, then renamed over the target.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| TransferError::io(&root, e))?;
        debug!(root = %root.display(), "checkpoint store opened");
        Ok(Self { root })
    }

    /// Directory holding the checkpoint files.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File that holds (or would hold) the value for `key`.
    #[must_use]
    pub fn path_for(&self, key: &CheckpointKey) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    /// Persists `value` under `key`, replacing any previous value atomically.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the temp file cannot be written or
    /// renamed, and [`TransferError::Validation`] if `value` cannot be encoded.
    pub fn save<T: Serialize>(&self, key: &CheckpointKey, value: &T) -> Result<(), TransferError> {
        let encoded = serde_json::to_vec(value)
            .map_err(|e| TransferError::validation(format!("cannot encode checkpoint: {e}")))?;
        let target = self.path_for(key);
        let temp = temp_path_for(&target);

        let written = write_synced(&temp, &encoded).and_then(|()| fs::rename(&temp, &target));
        if let Err(error) = written {
            let _ = fs::remove_file(&temp);
            return Err(TransferError::io(&target, error));
        }
        debug!(key = %key, bytes = encoded.len(), "checkpoint saved");
        Ok(())
    }

    /// Loads the value stored under `key`, or `default` when there is none.
    ///
    /// Never fails. A file that cannot be decoded is deleted so the next
    /// transfer starts clean.
    pub fn load<T: DeserializeOwned>(&self, key: &CheckpointKey, default: T) -> T {
        let path = self.path_for(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return default,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "cannot read checkpoint");
                return default;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "discarding corrupt checkpoint");
                self.remove(key);
                default
            }
        }
    }

    /// Deletes the value stored under `key`. Missing keys are not an error.
    pub fn remove(&self, key: &CheckpointKey) {
        let path = self.path_for(key);
        for attempt in 1..=REMOVE_ATTEMPTS {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(key = %key, "checkpoint removed");
                    return;
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => return,
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        attempt,
                        error = %error,
                        "failed to remove checkpoint"
                    );
                }
            }
        }
    }
}

fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map_or_else(|| "checkpoint".into(), |n| n.to_string_lossy().into_owned());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.tmp.{}.{nanos}", std::process::id()))
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
