//! Resumable, range-based download loop.
//!
//! A download sizes the object with one probe, then opens successive
//! `[offset, end]` ranges until every byte up to `end` has reached the sink.
//! Transient failures reopen the range at the first missing byte.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use md5::{Digest, Md5};
use reqwest::Response;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use super::client::HttpClient;
use super::constants::{
    DEFAULT_DOWNLOAD_RETRIES, DOWNLOAD_BACKOFF_BASE, PROGRESS_INTERVAL_BYTES, REQUEST_TIMEOUT,
};
use super::range::RangeRequester;
use super::sink::DownloadSink;
use crate::error::TransferError;
use crate::progress::{ProgressFn, ignore_progress, report};

/// Label used in IO errors for sinks that are not files.
const STREAM_SINK_LABEL: &str = "<download stream>";

/// Knobs for one download.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// First byte to fetch.
    pub start: u64,
    /// Last byte to fetch (inclusive); `None` means end of file.
    pub end: Option<u64>,
    /// Use range requests; when false every attempt downloads from byte 0.
    pub resumable: bool,
    /// Transient failures tolerated before giving up.
    pub retries: u32,
    /// Backoff numerator; the wait is `backoff_base / (remaining + 1)`.
    pub backoff_base: Duration,
    /// Compute the MD5 of everything held by the sink.
    pub calc_hash: bool,
    /// Time allowed for each request to return headers.
    pub request_timeout: Duration,
    /// Bytes between intermediate progress reports.
    pub progress_interval: u64,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            start: 0,
            end: None,
            resumable: true,
            retries: DEFAULT_DOWNLOAD_RETRIES,
            backoff_base: DOWNLOAD_BACKOFF_BASE,
            calc_hash: false,
            request_timeout: REQUEST_TIMEOUT,
            progress_interval: PROGRESS_INTERVAL_BYTES,
        }
    }
}

/// Result of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Bytes of the requested range now held by the sink.
    pub bytes_written: u64,
    /// Size of the whole remote object.
    pub total_size: u64,
    /// Hex MD5 of the sink contents, when requested.
    pub md5: Option<String>,
}

/// Object size and clamped last byte, learned from the probe.
#[derive(Debug, Clone, Copy)]
struct Sizing {
    total: u64,
    /// `None` for an empty object.
    last: Option<u64>,
}

/// Cursor over the bytes already delivered to the sink.
struct StreamState {
    next: u64,
    hasher: Option<Md5>,
    sizing: Option<Sizing>,
    sink_label: PathBuf,
}

impl StreamState {
    fn new(options: &DownloadOptions, sink_label: PathBuf) -> Self {
        Self {
            next: options.start,
            hasher: options.calc_hash.then(Md5::new),
            sizing: None,
            sink_label,
        }
    }

    async fn restart<S: DownloadSink>(
        &mut self,
        sink: &mut S,
        options: &DownloadOptions,
    ) -> Result<(), TransferError> {
        sink.reset()
            .await
            .map_err(|e| TransferError::io(&self.sink_label, e))?;
        self.next = options.start;
        self.hasher = options.calc_hash.then(Md5::new);
        Ok(())
    }

    fn accept(&mut self, bytes: &[u8]) {
        self.next += bytes.len() as u64;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(bytes);
        }
    }
}

/// Downloads remote objects into sinks, resuming across failures.
#[derive(Debug, Clone)]
pub struct Downloader {
    requester: RangeRequester,
}

impl Downloader {
    /// Creates a downloader sharing `client`'s connection pool.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self {
            requester: RangeRequester::new(client),
        }
    }

    /// Streams `url` into `sink`.
    ///
    /// Progress is reported at the start, after every
    /// `options.progress_interval` bytes, and at the end. The sink is not
    /// closed.
    ///
    /// # Errors
    ///
    /// - [`TransferError::Validation`] when `end < start`
    /// - [`TransferError::RangeNotSatisfiable`] when `start` lies past the end
    /// - [`TransferError::Cancelled`] when the callback breaks
    /// - [`TransferError::RetriesExhausted`] after too many transient failures
    /// - remote API errors as returned by the server (never retried)
    #[instrument(skip(self, url, sink, options, progress), fields(url = %url))]
    pub async fn download_to_writer<S: DownloadSink>(
        &self,
        url: &str,
        sink: &mut S,
        options: &DownloadOptions,
        progress: &mut ProgressFn<'_>,
    ) -> Result<DownloadOutcome, TransferError> {
        let state = StreamState::new(options, PathBuf::from(STREAM_SINK_LABEL));
        self.run(url, sink, options, state, progress).await
    }

    /// Downloads `url` to `dest` through a hidden temp file.
    ///
    /// The temp file defaults to `.<name>` next to `dest`. A temp file left by
    /// an interrupted run is resumed from its current length when
    /// `options.resumable` is set. On success the temp file is renamed over
    /// `dest`; on any error it is deleted.
    ///
    /// # Errors
    ///
    /// Same as [`download_to_writer`](Self::download_to_writer), plus
    /// [`TransferError::Io`] for temp file or rename failures.
    #[instrument(skip(self, url, dest, options, progress), fields(url = %url, dest = %dest.display()))]
    pub async fn download_to_file(
        &self,
        url: &str,
        dest: &Path,
        temp_path: Option<&Path>,
        options: &DownloadOptions,
        progress: &mut ProgressFn<'_>,
    ) -> Result<DownloadOutcome, TransferError> {
        let temp = temp_path.map_or_else(|| default_temp_path(dest), Path::to_path_buf);

        match self.download_into(url, &temp, options, progress).await {
            Ok(outcome) => {
                tokio::fs::rename(&temp, dest)
                    .await
                    .map_err(|e| TransferError::io(dest, e))?;
                info!(bytes = outcome.bytes_written, "download complete");
                Ok(outcome)
            }
            Err(error) => {
                if let Err(cleanup) = tokio::fs::remove_file(&temp).await
                    && cleanup.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %temp.display(), error = %cleanup, "failed to remove temp file");
                }
                Err(error)
            }
        }
    }

    /// Fetches `size` bytes starting at `offset` into memory.
    ///
    /// # Errors
    ///
    /// Same as [`download_to_writer`](Self::download_to_writer).
    pub async fn fetch_range(
        &self,
        url: &str,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, TransferError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let end = offset
            .checked_add(size - 1)
            .ok_or_else(|| TransferError::validation("range end overflows u64"))?;
        let options = DownloadOptions {
            start: offset,
            end: Some(end),
            ..DownloadOptions::default()
        };
        let mut buffer = Vec::new();
        self.download_to_writer(url, &mut buffer, &options, &mut ignore_progress())
            .await?;
        Ok(buffer)
    }

    async fn download_into(
        &self,
        url: &str,
        temp: &Path,
        options: &DownloadOptions,
        progress: &mut ProgressFn<'_>,
    ) -> Result<DownloadOutcome, TransferError> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(temp)
            .await
            .map_err(|e| TransferError::io(temp, e))?;
        let existing = file
            .metadata()
            .await
            .map_err(|e| TransferError::io(temp, e))?
            .len();

        let mut state = StreamState::new(options, temp.to_path_buf());
        if existing > 0 && options.resumable {
            if let Some(hasher) = state.hasher.as_mut() {
                hash_existing(&mut file, temp, hasher).await?;
            }
            file.seek(SeekFrom::End(0))
                .await
                .map_err(|e| TransferError::io(temp, e))?;
            state.next = options.start + existing;
            debug!(existing, "resuming from leftover temp file");
        } else if existing > 0 {
            state.restart(&mut file, options).await?;
        }

        let outcome = self.run(url, &mut file, options, state, progress).await?;
        file.sync_all()
            .await
            .map_err(|e| TransferError::io(temp, e))?;
        Ok(outcome)
    }

    async fn run<S: DownloadSink>(
        &self,
        url: &str,
        sink: &mut S,
        options: &DownloadOptions,
        mut state: StreamState,
        progress: &mut ProgressFn<'_>,
    ) -> Result<DownloadOutcome, TransferError> {
        if let Some(end) = options.end
            && end < options.start
        {
            return Err(TransferError::validation(format!(
                "`end` must be >= `start` ({end} < {})",
                options.start
            )));
        }

        let mut resumable = options.resumable;
        let mut retries_left = options.retries;

        loop {
            let error = match self
                .attempt(url, sink, options, resumable, &mut state, progress)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(error) => error,
            };

            match error {
                TransferError::UnsupportedRange { .. } if resumable && options.start == 0 => {
                    warn!("server does not honour ranges, restarting without them");
                    resumable = false;
                    state.sizing = None;
                    state.restart(sink, options).await?;
                }
                error if error.is_transient() => {
                    if retries_left == 0 {
                        return Err(TransferError::RetriesExhausted {
                            attempts: options.retries + 1,
                            source: Box::new(error),
                        });
                    }
                    retries_left -= 1;
                    let delay = options.backoff_base / (retries_left + 1);
                    warn!(
                        error = %error,
                        retries_left,
                        delay_ms = delay.as_millis(),
                        offset = state.next,
                        "transient download failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if !resumable {
                        state.restart(sink, options).await?;
                    }
                }
                error => return Err(error),
            }
        }
    }

    async fn attempt<S: DownloadSink>(
        &self,
        url: &str,
        sink: &mut S,
        options: &DownloadOptions,
        resumable: bool,
        state: &mut StreamState,
        progress: &mut ProgressFn<'_>,
    ) -> Result<DownloadOutcome, TransferError> {
        let sizing = match state.sizing {
            Some(sizing) => sizing,
            None => {
                let sizing = self.probe(url, options, resumable).await?;
                debug!(total = sizing.total, last = ?sizing.last, "object sized");
                state.sizing = Some(sizing);
                if sizing.last.is_none() && state.next > options.start {
                    debug!(next = state.next, "object is empty, discarding sink contents");
                    state.restart(sink, options).await?;
                }
                report(progress, state.next, sizing.total)?;
                sizing
            }
        };

        if let Some(last) = sizing.last {
            if state.next > last + 1 {
                debug!(next = state.next, last, "sink holds more than requested, restarting");
                state.restart(sink, options).await?;
            }
            while state.next <= last {
                debug!(offset = state.next, last, "opening segment");
                let (response, body_offset) = if resumable {
                    let ranged = self
                        .requester
                        .request(url, state.next, Some(last), options.request_timeout)
                        .await?;
                    (ranged.response, state.next)
                } else {
                    let whole = self
                        .requester
                        .request_whole(url, options.request_timeout)
                        .await?;
                    (whole.response, 0)
                };

                let offset = state.next;
                let received = stream_segment(
                    url,
                    response,
                    body_offset,
                    sink,
                    state,
                    sizing,
                    options.progress_interval,
                    progress,
                )
                .await?;
                if received == 0 {
                    return Err(TransferError::IncompleteBody {
                        url: url.to_string(),
                        offset,
                    });
                }
            }
        }

        report(progress, state.next, sizing.total)?;
        Ok(DownloadOutcome {
            bytes_written: state.next - options.start,
            total_size: sizing.total,
            md5: state
                .hasher
                .as_ref()
                .map(|hasher| hex::encode(hasher.clone().finalize())),
        })
    }

    async fn probe(
        &self,
        url: &str,
        options: &DownloadOptions,
        resumable: bool,
    ) -> Result<Sizing, TransferError> {
        let probe = if resumable {
            self.requester
                .request(url, 0, None, options.request_timeout)
                .await?
        } else {
            self.requester
                .request_whole(url, options.request_timeout)
                .await?
        };
        let total = probe.total_size;
        drop(probe.response);

        if total == 0 {
            if options.start > 0 {
                return Err(TransferError::RangeNotSatisfiable {
                    url: url.to_string(),
                    start: options.start,
                });
            }
            return Ok(Sizing { total, last: None });
        }

        let last_byte = total - 1;
        let last = options.end.map_or(last_byte, |end| end.min(last_byte));
        if options.start > last {
            return Err(TransferError::RangeNotSatisfiable {
                url: url.to_string(),
                start: options.start,
            });
        }
        Ok(Sizing {
            total,
            last: Some(last),
        })
    }
}

/// Writes the part of `response` that falls inside `[state.next, last]`.
///
/// Returns the number of bytes delivered to the sink.
#[allow(clippy::too_many_arguments)]
async fn stream_segment<S: DownloadSink>(
    url: &str,
    response: Response,
    body_offset: u64,
    sink: &mut S,
    state: &mut StreamState,
    sizing: Sizing,
    progress_interval: u64,
    progress: &mut ProgressFn<'_>,
) -> Result<u64, TransferError> {
    let Some(last) = sizing.last else {
        return Ok(0);
    };
    let mut stream = response.bytes_stream();
    let mut position = body_offset;
    let mut received: u64 = 0;
    let mut since_report: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| TransferError::network(url, e))?;
        let chunk_start = position;
        position += chunk.len() as u64;
        if position <= state.next {
            continue;
        }

        let skip = usize::try_from(state.next.saturating_sub(chunk_start)).unwrap_or(chunk.len());
        let wanted = last + 1 - state.next;
        let take = chunk[skip..]
            .len()
            .min(usize::try_from(wanted).unwrap_or(usize::MAX));
        let slice = &chunk[skip..skip + take];

        sink.write_all(slice)
            .await
            .map_err(|e| TransferError::io(&state.sink_label, e))?;
        state.accept(slice);
        received += take as u64;
        since_report += take as u64;

        if since_report > progress_interval {
            since_report = 0;
            report(progress, state.next, sizing.total)?;
        }
        if state.next > last {
            break;
        }
    }

    sink.flush()
        .await
        .map_err(|e| TransferError::io(&state.sink_label, e))?;
    Ok(received)
}

async fn hash_existing(file: &mut File, path: &Path, hasher: &mut Md5) -> Result<(), TransferError> {
    file.seek(SeekFrom::Start(0))
        .await
        .map_err(|e| TransferError::io(path, e))?;
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        if read == 0 {
            return Ok(());
        }
        hasher.update(&buffer[..read]);
    }
}

/// `.name` next to `dest`.
fn default_temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map_or_else(|| "download".into(), |n| n.to_string_lossy().into_owned());
    dest.with_file_name(format!(".{name}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_temp_path_is_hidden_sibling() {
        assert_eq!(
            default_temp_path(Path::new("/data/out/report.pdf")),
            PathBuf::from("/data/out/.report.pdf")
        );
    }

    #[test]
    fn test_default_options() {
        let options = DownloadOptions::default();
        assert!(options.resumable);
        assert_eq!(options.retries, 10);
        assert_eq!(options.backoff_base, Duration::from_secs(10));
        assert_eq!(options.progress_interval, 1 << 20);
    }

    #[tokio::test]
    async fn test_end_before_start_is_validation_without_network() {
        // Unroutable URL: validation must fail before any request is made.
        let downloader = Downloader::new(HttpClient::new());
        let options = DownloadOptions {
            start: 10,
            end: Some(5),
            ..DownloadOptions::default()
        };
        let mut sink = Vec::new();
        let result = downloader
            .download_to_writer(
                "http://127.0.0.1:9/never",
                &mut sink,
                &options,
                &mut ignore_progress(),
            )
            .await;
        assert!(matches!(result, Err(TransferError::Validation { .. })));
    }
}
