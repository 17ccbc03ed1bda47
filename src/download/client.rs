//! Shared HTTP client wrapper.
//!
//! One [`HttpClient`] is meant to be created per process and cloned into the
//! downloader, the direct upload client and the object-store backend so they
//! share a connection pool.

use std::time::Duration;

use reqwest::{Client, ClientBuilder, RequestBuilder, Response};
use tracing::debug;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use crate::error::TransferError;
use crate::user_agent;

/// Pooled HTTP client with transfer-friendly timeouts.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with default timeouts.
    ///
    /// Default configuration:
    /// - Connect timeout: 30 seconds
    /// - Read timeout: 5 minutes
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::new_with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a client with explicit timeout values.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the supplied configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new_with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Self {
        Self::try_new_with_timeouts(connect_timeout_secs, read_timeout_secs)
            .expect("failed to build HTTP client with static configuration")
    }

    /// Fallible variant of [`new_with_timeouts`](Self::new_with_timeouts).
    ///
    /// # Errors
    ///
    /// Returns the builder error if TLS or proxy setup fails.
    pub fn try_new_with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = base_client_builder(connect_timeout_secs, read_timeout_secs).build()?;
        Ok(Self { client })
    }

    /// Returns the underlying reqwest client for building requests.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Sends `request`, bounding the wait for response headers by `timeout`.
    ///
    /// Only transport failures become errors here; HTTP status handling is up
    /// to the caller.
    pub(crate) async fn send(
        &self,
        request: RequestBuilder,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<Response, TransferError> {
        let sent = request.send();
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, sent)
                .await
                .map_err(|_| TransferError::timeout(url))?,
            None => sent.await,
        };
        let response = result.map_err(|e| TransferError::network(url, e))?;
        debug!(status = response.status().as_u16(), url, "response received");
        Ok(response)
    }
}

/// Reads the body of a failed response and converts it into an error.
pub(crate) async fn error_from_response(url: &str, response: Response) -> TransferError {
    let status = response.status().as_u16();
    let body = response.bytes().await.unwrap_or_default();
    TransferError::from_status(url, status, &body)
}

fn base_client_builder(connect_timeout_secs: u64, read_timeout_secs: u64) -> ClientBuilder {
    Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .read_timeout(Duration::from_secs(read_timeout_secs))
        .user_agent(user_agent::default_user_agent())
}
