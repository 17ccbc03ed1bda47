//! Destinations a download can stream into.

use std::future::Future;
use std::io::{self, SeekFrom};

use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWrite};

/// An append-only byte destination that can be truncated back to empty.
///
/// Non-resumable retries and the range-unsupported fallback restart the
/// download from the first byte, so the sink must be able to forget what it
/// already holds.
pub trait DownloadSink: AsyncWrite + Unpin + Send {
    /// Discards everything written so far.
    fn reset(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

impl DownloadSink for File {
    async fn reset(&mut self) -> io::Result<()> {
        self.set_len(0).await?;
        self.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }
}

impl DownloadSink for Vec<u8> {
    async fn reset(&mut self) -> io::Result<()> {
        self.clear();
        Ok(())
    }
}
