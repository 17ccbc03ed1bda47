//! Resumable chunked uploads.
//!
//! [`Uploader`] dispatches on the ticket: direct tickets run the chunked
//! PATCH protocol against the platform ([`DirectClient`]), object-store
//! tickets go through the [`ObjectStoreBridge`](crate::object_store::ObjectStoreBridge).

mod direct;
mod retry;
mod uploader;

pub use direct::{ChunkAck, DirectClient, SESSION_ENDPOINT, TUS_VERSION};
pub use retry::{DEFAULT_MAX_ATTEMPTS, RetryDecision, RetryPolicy};
pub use uploader::{Checkpoint, DEFAULT_CHUNK_SIZE, UploadOptions, UploadResponse, Uploader};
