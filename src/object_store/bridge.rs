//! Ticket-to-backend glue for object-store uploads.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::{ObjectHeaders, ObjectStoreBackend, OssBackend, ResumeSlot};
use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::download::HttpClient;
use crate::error::{INTEGRITY_SIZE_MISMATCH, TransferError};
use crate::local_file::FileStamp;
use crate::progress::{ProgressFn, report};
use crate::ticket::{ObjectStoreTicket, canonical_json};
use crate::upload::UploadResponse;

/// Default part size, also the single-request threshold (1 MiB).
pub const DEFAULT_PART_SIZE: u64 = 1 << 20;

/// Error code the store returns once STS credentials lapse.
const TOKEN_EXPIRED_CODE: &str = "SecurityTokenExpired";

#[derive(Serialize)]
struct Callback<'a> {
    #[serde(rename = "callbackUrl")]
    url: &'a str,
    #[serde(rename = "callbackBody")]
    body: &'a str,
    #[serde(rename = "callbackBodyType")]
    body_type: &'a str,
}

/// Uploads files described by object-store tickets.
#[derive(Debug, Clone)]
pub struct ObjectStoreBridge {
    http: HttpClient,
    checkpoints: CheckpointStore,
    part_size: u64,
}

impl ObjectStoreBridge {
    /// Creates a bridge whose multipart records live in `checkpoints`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] when `part_size` is zero.
    pub fn new(
        http: HttpClient,
        checkpoints: CheckpointStore,
        part_size: u64,
    ) -> Result<Self, TransferError> {
        if part_size == 0 {
            return Err(TransferError::validation("part size must be positive"));
        }
        Ok(Self {
            http,
            checkpoints,
            part_size,
        })
    }

    /// Store holding multipart records.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Uploads `path` with the native OSS backend.
    ///
    /// # Errors
    ///
    /// See [`upload_with`](Self::upload_with).
    pub async fn upload(
        &self,
        path: &Path,
        ticket: &ObjectStoreTicket,
        progress: &mut ProgressFn<'_>,
    ) -> Result<UploadResponse, TransferError> {
        let backend = OssBackend::from_ticket(self.http.clone(), ticket)?;
        self.upload_with(&backend, path, ticket, progress).await
    }

    /// Uploads `path` through `backend` and returns the callback response.
    ///
    /// # Errors
    ///
    /// - [`TransferError::Integrity`] (421) when the ticket's `maxsize` does not match
    /// - [`TransferError::Validation`] for a `hash` that is not hex
    /// - [`TransferError::CredentialExpired`] when the STS token lapsed
    /// - [`TransferError::Protocol`] when the callback response is not JSON
    /// - [`TransferError::Api`] when the callback response reports `errcode != 0`
    #[instrument(skip_all, fields(path = %path.display(), key = %ticket.key))]
    pub async fn upload_with(
        &self,
        backend: &dyn ObjectStoreBackend,
        path: &Path,
        ticket: &ObjectStoreTicket,
        progress: &mut ProgressFn<'_>,
    ) -> Result<UploadResponse, TransferError> {
        let stamp = FileStamp::read(path).await?;
        let total = stamp.size;
        if let Some(expected) = ticket.maxsize
            && expected != total
        {
            return Err(TransferError::integrity(
                INTEGRITY_SIZE_MISMATCH,
                path,
                format!("file size mismatch with expected ({total} != {expected})"),
            ));
        }

        let headers = object_headers(ticket)?;
        let result = if total < self.part_size {
            report(progress, 0, total)?;
            backend.put_object(&ticket.key, path, &headers).await
        } else {
            let endpoint = format!("{}/{}", ticket.endpoint, ticket.bucket_name);
            let key = CheckpointKey::fingerprint(path, &canonical_json(ticket)?, &endpoint)?;
            let resume = ResumeSlot {
                store: &self.checkpoints,
                key: &key,
                part_size: self.part_size,
            };
            backend
                .multipart_upload(&ticket.key, path, resume, &headers, progress)
                .await
        };
        let completion = result.map_err(map_token_expiry)?;

        let url = format!("{}/{}", ticket.bucket_name, ticket.key);
        let body: Value = serde_json::from_slice(&completion.body).map_err(|_| {
            TransferError::protocol(
                &url,
                format!(
                    "callback response is not JSON (HTTP {}): {}",
                    completion.status,
                    String::from_utf8_lossy(&completion.body).trim()
                ),
            )
        })?;
        if let Some(error) = TransferError::from_api_body(&url, &body) {
            return Err(error);
        }

        report(progress, total, total)?;
        info!(total, "object store upload complete");
        Ok(UploadResponse { body })
    }
}

/// Headers every object-store request of this upload carries.
fn object_headers(ticket: &ObjectStoreTicket) -> Result<ObjectHeaders, TransferError> {
    let callback = serde_json::to_string(&Callback {
        url: &ticket.callback_url,
        body: &ticket.callback_body,
        body_type: &ticket.callback_body_type,
    })
    .map_err(|e| TransferError::validation(format!("cannot encode callback: {e}")))?;

    let mut headers = ObjectHeaders::new();
    headers.insert("x-oss-callback".to_string(), BASE64.encode(callback));
    if let Some(hash) = ticket.hash.as_deref() {
        let digest = hex::decode(hash.trim())
            .map_err(|e| TransferError::validation(format!("ticket hash `{hash}` is not hex: {e}")))?;
        headers.insert("x-oss-meta-content-md5".to_string(), BASE64.encode(digest));
    }
    Ok(headers)
}

fn map_token_expiry(error: TransferError) -> TransferError {
    match error {
        TransferError::ObjectStore { code, message, .. } if code == TOKEN_EXPIRED_CODE => {
            warn!(message = %message, "object store credentials expired");
            TransferError::CredentialExpired { message }
        }
        TransferError::RetriesExhausted { source, .. }
            if matches!(&*source, TransferError::ObjectStore { code, .. } if code == TOKEN_EXPIRED_CODE) =>
        {
            map_token_expiry(*source)
        }
        other => other,
    }
}
