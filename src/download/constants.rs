//! Constants for HTTP transfers (timeouts, retry budget, reporting cadence).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large segments).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Time allowed for a range request to return its headers.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Transient failures tolerated by one download.
pub const DEFAULT_DOWNLOAD_RETRIES: u32 = 10;

/// Numerator of the download backoff: the wait is `base / (remaining + 1)`.
pub const DOWNLOAD_BACKOFF_BASE: Duration = Duration::from_secs(10);

/// Progress is reported after more than this many bytes since the last report.
pub const PROGRESS_INTERVAL_BYTES: u64 = 1 << 20;
