//! Local file identity and positioned reads used by uploads.

use std::io::SeekFrom;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::TransferError;

/// Size and modification time of a file at one instant.
///
/// A checkpoint is only trusted while the stamp it recorded still matches the
/// file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    /// File length in bytes.
    pub size: u64,
    /// Whole seconds of the modification time since the Unix epoch.
    pub mtime_secs: u64,
    /// Sub-second part of the modification time.
    pub mtime_nanos: u32,
}

impl FileStamp {
    /// Reads the current stamp of `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the file cannot be stat'ed.
    pub async fn read(path: &Path) -> Result<Self, TransferError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        let modified = metadata
            .modified()
            .map_err(|e| TransferError::io(path, e))?;
        let since_epoch = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
        Ok(Self {
            size: metadata.len(),
            mtime_secs: since_epoch.as_secs(),
            mtime_nanos: since_epoch.subsec_nanos(),
        })
    }
}

/// Reads up to `len` bytes starting at `offset`.
///
/// Returns fewer bytes only at end of file.
pub(crate) async fn read_chunk_at(
    file: &mut File,
    path: &Path,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>, TransferError> {
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| TransferError::io(path, e))?;
    let mut buffer = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
    (&mut *file)
        .take(len)
        .read_to_end(&mut buffer)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    Ok(buffer)
}
