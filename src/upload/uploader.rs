//! Resumable upload state machine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::fs::File;
use tracing::{debug, info, instrument, warn};

use super::direct::{ChunkAck, DirectClient};
use super::retry::{RetryDecision, RetryPolicy};
use crate::auth::TokenSource;
use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::download::HttpClient;
use crate::download::constants::REQUEST_TIMEOUT;
use crate::error::{
    INTEGRITY_FILE_MODIFIED, INTEGRITY_SHORT_READ, INTEGRITY_SIZE_MISMATCH, TransferError,
};
use crate::local_file::{FileStamp, read_chunk_at};
use crate::object_store::ObjectStoreBridge;
use crate::progress::{ProgressFn, report};
use crate::ticket::{DirectTicket, TransferTicket};

/// Default chunk size for direct uploads (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 20;

/// Knobs for direct uploads.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Bytes sent per PATCH.
    pub chunk_size: u64,
    /// Retry policy for transient PATCH failures.
    pub retry: RetryPolicy,
    /// Time allowed for each session call to return headers.
    pub request_timeout: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

/// Final server response of a completed upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadResponse {
    /// JSON returned by the server (or the object-store callback).
    pub body: Value,
}

/// Persisted state of a direct upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Session URL returned at creation.
    pub session: String,
    /// Local file stamp when the session was created.
    #[serde(flatten)]
    pub stamp: FileStamp,
}

/// Uploads local files against a ticket, resuming interrupted sessions.
#[derive(Debug, Clone)]
pub struct Uploader {
    direct: DirectClient,
    checkpoints: CheckpointStore,
    object_store: ObjectStoreBridge,
    options: UploadOptions,
}

impl Uploader {
    /// Creates an uploader.
    ///
    /// `checkpoints` holds direct-upload sessions; object-store uploads keep
    /// their own store inside `object_store`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] if `api_host` is not a URL or
    /// `options.chunk_size` or `options.request_timeout` is zero.
    pub fn new(
        http: HttpClient,
        api_host: &str,
        tokens: Option<Arc<dyn TokenSource>>,
        checkpoints: CheckpointStore,
        object_store: ObjectStoreBridge,
        options: UploadOptions,
    ) -> Result<Self, TransferError> {
        if options.chunk_size == 0 {
            return Err(TransferError::validation("chunk size must be positive"));
        }
        if options.request_timeout.is_zero() {
            return Err(TransferError::validation("request timeout must be positive"));
        }
        let direct = DirectClient::new(http, api_host, tokens)?
            .with_request_timeout(options.request_timeout);
        Ok(Self {
            direct,
            checkpoints,
            object_store,
            options,
        })
    }

    /// Store holding direct-upload checkpoints.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Uploads `path` against `ticket`, dispatching on the ticket's backend.
    ///
    /// # Errors
    ///
    /// - [`TransferError::Integrity`] when the file does not match the ticket
    ///   or changes mid-upload (the checkpoint is deleted)
    /// - [`TransferError::Cancelled`] when the callback breaks (the checkpoint is kept)
    /// - [`TransferError::CredentialExpired`] when the ticket must be re-issued
    /// - remote API and exhausted-retry errors
    #[instrument(skip(self, path, ticket, progress), fields(path = %path.display(), service = ticket.service()))]
    pub async fn upload(
        &self,
        path: &Path,
        ticket: &TransferTicket,
        progress: &mut ProgressFn<'_>,
    ) -> Result<UploadResponse, TransferError> {
        match ticket {
            TransferTicket::Direct(direct) => self.upload_direct(path, ticket, direct, progress).await,
            TransferTicket::ObjectStore(store) => {
                self.object_store.upload(path, store, progress).await
            }
        }
    }

    async fn upload_direct(
        &self,
        path: &Path,
        ticket: &TransferTicket,
        direct: &DirectTicket,
        progress: &mut ProgressFn<'_>,
    ) -> Result<UploadResponse, TransferError> {
        let stamp = FileStamp::read(path).await?;
        let total = stamp.size;
        if direct.maxsize != total {
            return Err(TransferError::integrity(
                INTEGRITY_SIZE_MISMATCH,
                path,
                format!(
                    "file size mismatch with expected ({total} != {})",
                    direct.maxsize
                ),
            ));
        }

        let key = CheckpointKey::fingerprint(path, &ticket.canonical_json()?, self.direct.api_host())?;
        let (session, mut uploaded) = match self.resume_session(&key, stamp, progress).await? {
            Some(resumed) => resumed,
            None => {
                let session = self.direct.create_session(direct, total).await?;
                self.checkpoints.save(
                    &key,
                    &Checkpoint {
                        session: session.clone(),
                        stamp,
                    },
                )?;
                (session, 0)
            }
        };

        let end = total.saturating_sub(1);
        let mut file = File::open(path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        let mut completion = None;

        while uploaded <= end {
            if FileStamp::read(path).await? != stamp {
                self.checkpoints.remove(&key);
                return Err(TransferError::integrity(
                    INTEGRITY_FILE_MODIFIED,
                    path,
                    "file modified during upload",
                ));
            }

            let chunk = read_chunk_at(&mut file, path, uploaded, self.options.chunk_size).await?;
            if chunk.is_empty() && uploaded < end {
                self.checkpoints.remove(&key);
                return Err(TransferError::integrity(
                    INTEGRITY_SHORT_READ,
                    path,
                    format!("file size mismatch: no data at offset {uploaded} of {total}"),
                ));
            }

            match self.put_chunk_with_retry(&session, uploaded, &chunk, total).await? {
                ChunkAck::Offset(confirmed) => {
                    if confirmed > total || (total > 0 && confirmed <= uploaded) {
                        return Err(TransferError::protocol(
                            &session,
                            format!("server confirmed offset {confirmed} after sending {uploaded}"),
                        ));
                    }
                    uploaded = confirmed;
                }
                ChunkAck::Completed(body) => {
                    uploaded = total;
                    completion = Some(body);
                }
            }
            debug!(uploaded, total, "chunk confirmed");
            report(progress, uploaded, total)?;

            if total == 0 {
                break;
            }
        }

        self.checkpoints.remove(&key);
        info!(total, "upload complete");
        Ok(UploadResponse {
            body: completion.unwrap_or_else(|| json!({ "offset": uploaded })),
        })
    }

    /// Returns the session and confirmed offset of a still-valid checkpoint.
    async fn resume_session(
        &self,
        key: &CheckpointKey,
        stamp: FileStamp,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Option<(String, u64)>, TransferError> {
        let Some(saved) = self.checkpoints.load::<Option<Checkpoint>>(key, None) else {
            return Ok(None);
        };
        if saved.stamp != stamp {
            info!("local file changed since the last attempt, discarding checkpoint");
            self.checkpoints.remove(key);
            return Ok(None);
        }

        match self.direct.session_offset(&saved.session).await {
            Ok(offset) => {
                let offset = offset.unwrap_or(stamp.size).min(stamp.size);
                info!(offset, session = %saved.session, "resuming upload session");
                report(progress, offset, stamp.size)?;
                Ok(Some((saved.session, offset)))
            }
            Err(TransferError::NotFound { .. }) => {
                info!(session = %saved.session, "upload session expired, starting over");
                self.checkpoints.remove(key);
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    async fn put_chunk_with_retry(
        &self,
        session: &str,
        offset: u64,
        chunk: &[u8],
        total: u64,
    ) -> Result<ChunkAck, TransferError> {
        let mut attempt = 1;
        loop {
            let error = match self.direct.put_chunk(session, offset, chunk).await {
                Ok(ack) => return Ok(ack),
                Err(error) => error,
            };

            match self.options.retry.should_retry(error.class(), attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    warn!(error = %error, offset, attempt, delay_ms = delay.as_millis(), "chunk upload failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt = next;

                    // The failed request may still have landed.
                    match self.direct.session_offset(session).await {
                        Ok(None) => return Ok(ChunkAck::Offset(total)),
                        Ok(Some(server)) if server > offset => {
                            debug!(server, offset, "server already holds the chunk");
                            return Ok(ChunkAck::Offset(server));
                        }
                        Ok(Some(_)) => {}
                        Err(resync) => {
                            debug!(error = %resync, "offset resync failed, resending chunk");
                        }
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    if error.is_transient() {
                        debug!(reason = %reason, "chunk retries exhausted");
                        return Err(TransferError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(error),
                        });
                    }
                    return Err(error);
                }
            }
        }
    }
}
