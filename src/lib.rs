//! Resumable chunked transfers for the EDO content platform.
//!
//! The library moves large files between local disk and the platform without
//! starting over after an interruption:
//!
//! - [`download`] - HTTP Range downloads that resume from where a previous
//!   attempt stopped and fall back to a full fetch when ranges are unsupported
//! - [`upload`] - chunked uploads against an upload ticket, with sessions
//!   persisted across process restarts
//! - [`object_store`] - uploads delegated to an Aliyun OSS compatible store
//! - [`checkpoint`] - fingerprinted, atomically written resume records
//!
//! Every entry point takes a progress callback; returning
//! [`ControlFlow::Break`](std::ops::ControlFlow::Break) cancels the transfer.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod checkpoint;
pub mod download;
pub mod error;
pub mod local_file;
pub mod object_store;
pub mod progress;
pub mod ticket;
pub mod upload;
mod user_agent;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use auth::{StaticToken, TokenSource};
pub use checkpoint::{CheckpointKey, CheckpointStore, default_object_store_root, default_upload_root};
pub use download::{
    DownloadOptions, DownloadOutcome, DownloadSink, Downloader, HttpClient, RangeRequester,
};
pub use error::{ErrorClass, TransferError};
pub use local_file::FileStamp;
pub use object_store::{ObjectStoreBackend, ObjectStoreBridge, OssBackend};
pub use progress::{ProgressFn, TransferProgress, ignore_progress};
pub use ticket::{DirectTicket, ObjectStoreTicket, TransferTicket};
pub use upload::{RetryPolicy, UploadOptions, UploadResponse, Uploader};
