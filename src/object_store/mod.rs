//! Uploads through a third-party object store.
//!
//! The [`ObjectStoreBridge`] turns an object-store ticket into request
//! headers and hands the file to an [`ObjectStoreBackend`]. [`OssBackend`] is
//! the native backend for Aliyun OSS compatible stores.

mod bridge;
mod oss;
mod signing;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::error::TransferError;
use crate::local_file::FileStamp;
use crate::progress::ProgressFn;

pub use bridge::{DEFAULT_PART_SIZE, ObjectStoreBridge};
pub use oss::OssBackend;
pub use signing::OssCredentials;

/// Extra request headers, keyed by lowercase header name.
pub type ObjectHeaders = BTreeMap<String, String>;

/// Raw response of the call that finished an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResponse {
    /// HTTP status of the final call.
    pub status: u16,
    /// Body of the final call; carries the callback response when one is configured.
    pub body: Vec<u8>,
}

/// Where a multipart upload keeps its resume record.
#[derive(Debug, Clone, Copy)]
pub struct ResumeSlot<'a> {
    /// Store the record lives in.
    pub store: &'a CheckpointStore,
    /// Fingerprint of this upload.
    pub key: &'a CheckpointKey,
    /// Part size; a record written with another size is discarded.
    pub part_size: u64,
}

/// One uploaded part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    /// 1-based part number.
    pub number: u32,
    /// ETag returned for the part.
    pub etag: String,
    /// Bytes in the part.
    pub size: u64,
}

/// Resume record of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartCheckpoint {
    /// Object key.
    pub key: String,
    /// Upload id returned when the upload was initiated.
    pub upload_id: String,
    /// Part size used when the upload was initiated.
    pub part_size: u64,
    /// Local file stamp when the upload was initiated.
    pub stamp: FileStamp,
    /// Parts the store has acknowledged.
    pub parts: Vec<PartRecord>,
}

/// Object-store capabilities the bridge relies on.
#[async_trait]
pub trait ObjectStoreBackend: Send + Sync {
    /// Uploads `path` in a single request.
    async fn put_object(
        &self,
        key: &str,
        path: &Path,
        headers: &ObjectHeaders,
    ) -> Result<CompletionResponse, TransferError>;

    /// Uploads `path` in parts, resuming from the record in `resume`.
    ///
    /// Implementations must re-check the file stamp before each part, remove
    /// the record on completion and report progress after each part.
    async fn multipart_upload(
        &self,
        key: &str,
        path: &Path,
        resume: ResumeSlot<'_>,
        headers: &ObjectHeaders,
        progress: &mut ProgressFn<'_>,
    ) -> Result<CompletionResponse, TransferError>;
}
