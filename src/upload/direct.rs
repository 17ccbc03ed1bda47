//! Client for the platform's resumable upload endpoint.
//!
//! Sessions follow the tus 1.0.0 shape: `POST` creates a session and returns
//! its URL in `Location`, `HEAD` reports the confirmed `Upload-Offset`, and
//! each `PATCH` appends one chunk at an offset.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest, Md5};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, LOCATION};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::auth::TokenSource;
use crate::download::constants::REQUEST_TIMEOUT;
use crate::download::{HttpClient, error_from_response};
use crate::error::TransferError;
use crate::ticket::DirectTicket;

/// Protocol version sent in `Tus-Resumable`.
pub const TUS_VERSION: &str = "1.0.0";

/// Path of the session creation endpoint, relative to the API host.
pub const SESSION_ENDPOINT: &str = "/api/v1/upload/upload_resumable";

const TUS_RESUMABLE: &str = "Tus-Resumable";
const UPLOAD_OFFSET: &str = "Upload-Offset";
const UPLOAD_LENGTH: &str = "Upload-Length";
const UPLOAD_METADATA: &str = "Upload-Metadata";
const UPLOAD_CHECKSUM: &str = "Upload-Checksum";
const CHUNK_CONTENT_TYPE: &str = "application/offset+octet-stream";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Server reply to one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkAck {
    /// Server confirmed everything before this offset.
    Offset(u64),
    /// Server finished the upload and returned its final response.
    Completed(Value),
}

/// HTTP client for direct upload sessions.
#[derive(Clone)]
pub struct DirectClient {
    http: HttpClient,
    api_host: Url,
    tokens: Option<Arc<dyn TokenSource>>,
    request_timeout: Duration,
}

impl std::fmt::Debug for DirectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectClient")
            .field("api_host", &self.api_host.as_str())
            .field("authenticated", &self.tokens.is_some())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl DirectClient {
    /// Creates a client for the platform at `api_host`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] if `api_host` is not a URL.
    pub fn new(
        http: HttpClient,
        api_host: &str,
        tokens: Option<Arc<dyn TokenSource>>,
    ) -> Result<Self, TransferError> {
        let api_host = Url::parse(api_host)
            .map_err(|e| TransferError::validation(format!("invalid API host `{api_host}`: {e}")))?;
        Ok(Self {
            http,
            api_host,
            tokens,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    /// Bounds the wait for response headers of every session call.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The API host, used as the checkpoint endpoint identity.
    #[must_use]
    pub fn api_host(&self) -> &str {
        self.api_host.as_str()
    }

    /// Creates an upload session for a file of `size` bytes.
    ///
    /// Returns the absolute session URL.
    ///
    /// # Errors
    ///
    /// Remote API errors for non-201 statuses, [`TransferError::Protocol`]
    /// when the server omits `Location`.
    #[instrument(skip(self, ticket), fields(filename = %ticket.filename))]
    pub async fn create_session(
        &self,
        ticket: &DirectTicket,
        size: u64,
    ) -> Result<String, TransferError> {
        let url = self
            .api_host
            .join(SESSION_ENDPOINT)
            .map_err(|e| TransferError::validation(format!("invalid session endpoint: {e}")))?;
        let url_text = url.to_string();
        let metadata = upload_metadata(ticket);
        let form = session_form(ticket);

        let response = self
            .send_authorized(&url_text, |client| {
                client
                    .post(url.clone())
                    .header(TUS_RESUMABLE, TUS_VERSION)
                    .header(UPLOAD_LENGTH, size.to_string())
                    .header(UPLOAD_METADATA, metadata.as_str())
                    .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
                    .body(form.clone())
            })
            .await?;

        if response.status() != StatusCode::CREATED {
            if response.status().is_success() {
                return Err(TransferError::protocol(
                    &url_text,
                    format!("expected 201 Created, got {}", response.status().as_u16()),
                ));
            }
            return Err(error_from_response(&url_text, response).await);
        }

        let location = header_text(response.headers(), LOCATION.as_str())
            .ok_or_else(|| TransferError::protocol(&url_text, "session response has no Location"))?;
        let session = self
            .api_host
            .join(&location)
            .map_err(|e| TransferError::protocol(&url_text, format!("bad Location `{location}`: {e}")))?;
        info!(session = %session, "upload session created");
        Ok(session.to_string())
    }

    /// Asks the server how many bytes of `session` it holds.
    ///
    /// `None` means the server no longer reports an offset, which happens once
    /// the upload is complete.
    ///
    /// # Errors
    ///
    /// [`TransferError::NotFound`] when the session is gone, other remote API
    /// errors for non-200 statuses.
    #[instrument(skip(self))]
    pub async fn session_offset(&self, session: &str) -> Result<Option<u64>, TransferError> {
        let response = self
            .send_authorized(session, |client| {
                client.head(session).header(TUS_RESUMABLE, TUS_VERSION)
            })
            .await?;
        if response.status() != StatusCode::OK {
            return Err(error_from_response(session, response).await);
        }
        let offset = parse_offset(session, response.headers())?;
        debug!(?offset, "session offset");
        Ok(offset)
    }

    /// Appends `chunk` at `offset`.
    ///
    /// # Errors
    ///
    /// - [`TransferError::CredentialExpired`] when the session is gone (404/410)
    /// - [`TransferError::Api`] for a final body with `errcode != 0`
    /// - other remote API errors for non-2xx statuses
    #[instrument(skip(self, chunk), fields(len = chunk.len()))]
    pub async fn put_chunk(
        &self,
        session: &str,
        offset: u64,
        chunk: &[u8],
    ) -> Result<ChunkAck, TransferError> {
        let checksum = format!("md5 {}", BASE64.encode(Md5::digest(chunk)));
        let response = self
            .send_authorized(session, |client| {
                client
                    .patch(session)
                    .header(TUS_RESUMABLE, TUS_VERSION)
                    .header(CONTENT_TYPE, CHUNK_CONTENT_TYPE)
                    .header(UPLOAD_OFFSET, offset.to_string())
                    .header(UPLOAD_CHECKSUM, checksum.as_str())
                    .body(chunk.to_vec())
            })
            .await?;

        let status = response.status();
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
            let body = response.bytes().await.unwrap_or_default();
            return Err(TransferError::CredentialExpired {
                message: format!(
                    "upload session {session} rejected with HTTP {}: {}",
                    status.as_u16(),
                    String::from_utf8_lossy(&body).trim()
                ),
            });
        }
        if !status.is_success() {
            return Err(error_from_response(session, response).await);
        }

        if let Some(confirmed) = parse_offset(session, response.headers())? {
            return Ok(ChunkAck::Offset(confirmed));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TransferError::network(session, e))?;
        let value: Value = serde_json::from_slice(&body).map_err(|_| {
            TransferError::protocol(session, "chunk response has neither Upload-Offset nor JSON")
        })?;
        if let Some(error) = TransferError::from_api_body(session, &value) {
            return Err(error);
        }
        Ok(ChunkAck::Completed(value))
    }

    /// Sends a request with the bearer token, refreshing once after a 401.
    async fn send_authorized<F>(&self, url: &str, build: F) -> Result<Response, TransferError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let timeout = Some(self.request_timeout);
        let Some(tokens) = self.tokens.as_ref() else {
            return self.http.send(build(self.http.inner()), url, timeout).await;
        };

        let token = tokens.valid_token().await?;
        let response = self
            .http
            .send(with_bearer(build(self.http.inner()), &token), url, timeout)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(url, "token rejected, refreshing once");
        let token = tokens.refresh().await?;
        self.http
            .send(with_bearer(build(self.http.inner()), &token), url, timeout)
            .await
    }
}

fn with_bearer(request: RequestBuilder, token: &str) -> RequestBuilder {
    request.header(AUTHORIZATION, format!("Bearer {token}"))
}

/// `Upload-Metadata`: `key base64(value)` pairs joined by commas.
fn upload_metadata(ticket: &DirectTicket) -> String {
    let mut pairs = Vec::with_capacity(2);
    if let Some(callback_url) = ticket.callback_url.as_deref() {
        pairs.push(format!("callback_url {}", BASE64.encode(callback_url)));
    }
    pairs.push(format!("filename {}", BASE64.encode(&ticket.filename)));
    pairs.join(",")
}

fn session_form(ticket: &DirectTicket) -> String {
    let mut form = url::form_urlencoded::Serializer::new(String::new());
    form.append_pair("maxsize", &ticket.maxsize.to_string());
    let optional = [
        ("deadline", &ticket.deadline),
        ("expire", &ticket.expire),
        ("signcode", &ticket.signcode),
        ("device", &ticket.device),
        ("prefix", &ticket.prefix),
        ("suffix", &ticket.suffix),
        ("hash", &ticket.hash),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            form.append_pair(name, value);
        }
    }
    form.finish()
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn parse_offset(url: &str, headers: &HeaderMap) -> Result<Option<u64>, TransferError> {
    let Some(raw) = header_text(headers, UPLOAD_OFFSET) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| TransferError::protocol(url, format!("invalid Upload-Offset `{raw}`")))
}
