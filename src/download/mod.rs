//! Resumable HTTP downloads.
//!
//! # Features
//!
//! - Byte-range segments with `Content-Range` validation
//! - Automatic fallback to plain GET when a server ignores ranges
//! - Bounded retry with decreasing backoff for transient failures
//! - Optional MD5 of the downloaded bytes
//! - Hidden temp file next to the destination, resumed across runs
//!
//! # Example
//!
//! ```no_run
//! use std::ops::ControlFlow;
//! use std::path::Path;
//!
//! use edo_transfer::TransferProgress;
//! use edo_transfer::download::{DownloadOptions, Downloader, HttpClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let downloader = Downloader::new(HttpClient::new());
//! let outcome = downloader
//!     .download_to_file(
//!         "https://files.example.com/report.pdf",
//!         Path::new("./report.pdf"),
//!         None,
//!         &DownloadOptions::default(),
//!         &mut |p: TransferProgress| {
//!             println!("{}/{}", p.transferred, p.total);
//!             ControlFlow::Continue(())
//!         },
//!     )
//!     .await?;
//! println!("{} bytes", outcome.bytes_written);
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod downloader;
mod range;
mod sink;

pub use client::HttpClient;
pub(crate) use client::error_from_response;
pub use downloader::{DownloadOptions, DownloadOutcome, Downloader};
pub use range::{ContentRange, RangeRequester, RangeResponse, parse_content_range};
pub use sink::DownloadSink;
