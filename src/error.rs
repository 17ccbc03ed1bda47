//! Error types shared by the upload and download paths.
//!
//! Every failure surfaced by the crate is a [`TransferError`]. Callers that
//! need to decide between retrying, downgrading or giving up should match on
//! [`TransferError::class`] rather than on individual variants.

use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;

/// Integrity code: the file changed between chunks.
pub const INTEGRITY_FILE_MODIFIED: u16 = 419;

/// Integrity code: the file ended before the declared size was read.
pub const INTEGRITY_SHORT_READ: u16 = 420;

/// Integrity code: the ticket's declared size differs from the local file.
pub const INTEGRITY_SIZE_MISMATCH: u16 = 421;

/// Errors raised while moving bytes between the local disk and the platform.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Caller supplied arguments that can never succeed.
    #[error("invalid transfer request: {message}")]
    Validation {
        /// What was wrong with the request.
        message: String,
    },

    /// Local file contents diverged from what the transfer was promised.
    #[error("integrity check failed for {path} (code {code}): {message}")]
    Integrity {
        /// One of 419 (modified), 420 (short read) or 421 (size mismatch).
        code: u16,
        /// Local file that failed verification.
        path: PathBuf,
        /// Human-readable detail.
        message: String,
    },

    /// The server ignored or mangled the requested byte range.
    #[error("server does not support chunked download of {url}")]
    UnsupportedRange {
        /// URL that was requested.
        url: String,
    },

    /// HTTP 416 for a range that does not start at zero.
    #[error("range starting at byte {start} is not satisfiable for {url}")]
    RangeNotSatisfiable {
        /// URL that was requested.
        url: String,
        /// First requested byte.
        start: u64,
    },

    /// The server answered with something the protocol does not allow.
    #[error("protocol error from {url}: {message}")]
    Protocol {
        /// URL that produced the response.
        url: String,
        /// What was unexpected.
        message: String,
    },

    /// Connection, DNS or TLS failure.
    #[error("network error requesting {url}: {source}")]
    Network {
        /// URL that failed.
        url: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// No response (or no further body bytes) within the allowed time.
    #[error("timeout requesting {url}")]
    Timeout {
        /// URL that timed out.
        url: String,
    },

    /// Local filesystem failure.
    #[error("IO error on {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A response body closed before delivering a single byte.
    #[error("response body from {url} ended early at byte {offset}")]
    IncompleteBody {
        /// URL being streamed.
        url: String,
        /// Offset the segment was expected to start at.
        offset: u64,
    },

    /// HTTP 404.
    #[error("404 Not Found: {url}")]
    NotFound {
        /// URL that was not found.
        url: String,
    },

    /// 4xx response other than 404 and 416.
    #[error("HTTP {status} from {url}: {message}")]
    Client {
        /// URL that was requested.
        url: String,
        /// HTTP status.
        status: u16,
        /// Platform error code when the body carried one.
        code: Option<String>,
        /// Server-provided message, or a generic one.
        message: String,
    },

    /// 5xx response.
    #[error("HTTP {status} from {url}: {message}")]
    Server {
        /// URL that was requested.
        url: String,
        /// HTTP status.
        status: u16,
        /// Platform error code when the body carried one.
        code: Option<String>,
        /// Server-provided message, or a generic one.
        message: String,
    },

    /// Successful HTTP status whose JSON body reported `errcode != 0`.
    #[error("API error {code} from {url}: {message}")]
    Api {
        /// URL that was requested.
        url: String,
        /// Platform error code.
        code: String,
        /// Platform error message.
        message: String,
    },

    /// Error document returned by the object store.
    #[error("object store error {code} (HTTP {status}): {message}")]
    ObjectStore {
        /// HTTP status.
        status: u16,
        /// Object store error code, e.g. `NoSuchUpload`.
        code: String,
        /// Object store message.
        message: String,
    },

    /// Upload credentials or session are no longer valid; re-issue the ticket.
    #[error("upload credentials expired: {message}")]
    CredentialExpired {
        /// Detail from the server.
        message: String,
    },

    /// The progress callback asked to stop.
    #[error("transfer cancelled after {transferred} bytes")]
    Cancelled {
        /// Offset confirmed when the transfer stopped.
        transferred: u64,
    },

    /// Transient failures persisted past the retry budget.
    #[error("giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Last transient failure.
        #[source]
        source: Box<TransferError>,
    },
}

/// Coarse classification used by retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fatal caller error.
    Validation,
    /// Fatal local-file divergence; checkpoint is dropped.
    Integrity,
    /// Range negotiation or response-shape failure.
    Protocol,
    /// Network, timeout or local IO hiccup; retried with a budget.
    Transient,
    /// Structured error from the platform or object store; never retried.
    RemoteApi,
    /// Caller must obtain a fresh ticket.
    CredentialExpired,
    /// Stopped by the caller.
    Cancelled,
    /// Retry budget exhausted.
    Exhausted,
}

impl TransferError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an integrity error with one of the `INTEGRITY_*` codes.
    pub fn integrity(code: u16, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Integrity {
            code,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a network error, promoting client timeouts to [`TransferError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { url: url.into() }
        } else {
            Self::Network {
                url: url.into(),
                source,
            }
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds the error for a non-success HTTP status from its body.
    ///
    /// Understands both `{code, message}` and `{errcode, errmsg}` payloads and
    /// falls back to the body text or a generic message.
    pub fn from_status(url: impl Into<String>, status: u16, body: &[u8]) -> Self {
        let url = url.into();
        if status == 404 {
            return Self::NotFound { url };
        }

        let (code, message) = match serde_json::from_slice::<Value>(body) {
            Ok(payload) => match error_payload(&payload) {
                Some((code, message)) => (Some(code), message),
                None => (None, generic_message(status, body)),
            },
            Err(_) => (None, generic_message(status, body)),
        };

        if status >= 500 {
            Self::Server {
                url,
                status,
                code,
                message,
            }
        } else {
            Self::Client {
                url,
                status,
                code,
                message,
            }
        }
    }

    /// Returns an [`TransferError::Api`] error when a 2xx JSON body carries `errcode != 0`.
    #[must_use]
    pub fn from_api_body(url: &str, body: &Value) -> Option<Self> {
        let errcode = body.get("errcode")?;
        let failed = match errcode {
            Value::Number(number) => number.as_i64() != Some(0),
            Value::String(text) => text != "0",
            Value::Null => false,
            _ => true,
        };
        if !failed {
            return None;
        }
        let message = body
            .get("errmsg")
            .map(value_text)
            .unwrap_or_default();
        Some(Self::Api {
            url: url.to_string(),
            code: value_text(errcode),
            message,
        })
    }

    /// Classifies this error for retry decisions.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation { .. } => ErrorClass::Validation,
            Self::Integrity { .. } => ErrorClass::Integrity,
            Self::UnsupportedRange { .. }
            | Self::RangeNotSatisfiable { .. }
            | Self::Protocol { .. } => ErrorClass::Protocol,
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::Io { .. }
            | Self::IncompleteBody { .. } => ErrorClass::Transient,
            Self::NotFound { .. }
            | Self::Client { .. }
            | Self::Server { .. }
            | Self::Api { .. }
            | Self::ObjectStore { .. } => ErrorClass::RemoteApi,
            Self::CredentialExpired { .. } => ErrorClass::CredentialExpired,
            Self::Cancelled { .. } => ErrorClass::Cancelled,
            Self::RetriesExhausted { .. } => ErrorClass::Exhausted,
        }
    }

    /// Shorthand for `class() == ErrorClass::Transient`.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

fn error_payload(payload: &Value) -> Option<(String, String)> {
    if let Some(code) = payload.get("code") {
        let message = payload.get("message").map(value_text).unwrap_or_default();
        return Some((value_text(code), message));
    }
    let code = payload.get("errcode")?;
    let message = payload.get("errmsg").map(value_text).unwrap_or_default();
    Some((value_text(code), message))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn generic_message(status: u16, body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        format!("request failed with HTTP {status}")
    } else {
        text.chars().take(512).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_status_404_is_not_found() {
        let error = TransferError::from_status("https://x/a", 404, b"{\"code\": 1}");
        assert!(matches!(error, TransferError::NotFound { .. }));
        assert_eq!(error.class(), ErrorClass::RemoteApi);
    }

    #[test]
    fn test_from_status_reads_code_message_payload() {
        let error = TransferError::from_status(
            "https://x/a",
            403,
            br#"{"code": "Forbidden", "message": "no access"}"#,
        );
        match error {
            TransferError::Client {
                status,
                code,
                message,
                ..
            } => {
                assert_eq!(status, 403);
                assert_eq!(code.as_deref(), Some("Forbidden"));
                assert_eq!(message, "no access");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_status_reads_errcode_payload_for_5xx() {
        let error =
            TransferError::from_status("https://x/a", 502, br#"{"errcode": 9, "errmsg": "busy"}"#);
        match error {
            TransferError::Server { code, message, .. } => {
                assert_eq!(code.as_deref(), Some("9"));
                assert_eq!(message, "busy");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_status_falls_back_to_body_text() {
        let error = TransferError::from_status("https://x/a", 400, b"bad things");
        assert!(error.to_string().contains("bad things"));

        let error = TransferError::from_status("https://x/a", 400, b"");
        assert!(error.to_string().contains("HTTP 400"));
    }

    #[test]
    fn test_from_api_body_ignores_zero_errcode() {
        assert!(TransferError::from_api_body("u", &json!({"errcode": 0})).is_none());
        assert!(TransferError::from_api_body("u", &json!({"result": 1})).is_none());
    }

    #[test]
    fn test_from_api_body_reports_nonzero_errcode() {
        let error =
            TransferError::from_api_body("u", &json!({"errcode": 401, "errmsg": "denied"})).unwrap();
        assert!(matches!(error, TransferError::Api { ref code, .. } if code == "401"));
    }

    #[test]
    fn test_classes() {
        assert!(TransferError::timeout("u").is_transient());
        assert!(
            TransferError::io("/tmp/x", std::io::Error::other("disk")).is_transient()
        );
        assert_eq!(
            TransferError::integrity(INTEGRITY_FILE_MODIFIED, "/tmp/x", "changed").class(),
            ErrorClass::Integrity
        );
        assert_eq!(
            TransferError::Cancelled { transferred: 3 }.class(),
            ErrorClass::Cancelled
        );
        assert_eq!(
            TransferError::UnsupportedRange { url: "u".into() }.class(),
            ErrorClass::Protocol
        );
    }
}
