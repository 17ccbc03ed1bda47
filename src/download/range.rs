//! Byte-range requests and range-support validation.

use std::time::Duration;

use reqwest::header::{ACCEPT_ENCODING, CONTENT_RANGE, RANGE};
use reqwest::{Response, StatusCode};
use tracing::{debug, instrument};

use super::client::{HttpClient, error_from_response};
use crate::error::TransferError;

/// A validated response for a byte range together with the object size.
#[derive(Debug)]
pub struct RangeResponse {
    /// Response whose body starts at the requested offset.
    pub response: Response,
    /// Size of the whole object, 0 when the server did not say.
    pub total_size: u64,
}

/// Issues range requests and rejects servers that do not honour them.
#[derive(Debug, Clone)]
pub struct RangeRequester {
    client: HttpClient,
}

impl RangeRequester {
    /// Creates a requester sharing `client`'s connection pool.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    /// Requests bytes `[start, end]` (`end = None` means to end of file).
    ///
    /// A 416 for a whole-file request is retried once without a `Range`
    /// header, which is how servers answer for empty objects.
    ///
    /// # Errors
    ///
    /// - [`TransferError::RangeNotSatisfiable`] for a 416 on any other range
    /// - [`TransferError::UnsupportedRange`] when the body would not start at `start`
    /// - remote API errors for other non-200/206 statuses
    /// - transient errors for transport failures and `timeout`
    #[instrument(skip(self, url), fields(url = %url))]
    pub async fn request(
        &self,
        url: &str,
        start: u64,
        end: Option<u64>,
        timeout: Duration,
    ) -> Result<RangeResponse, TransferError> {
        let whole_file = start == 0 && end.is_none();
        let mut response = self.get(url, Some(&range_header(start, end)), timeout).await?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            if !whole_file {
                return Err(TransferError::RangeNotSatisfiable {
                    url: url.to_string(),
                    start,
                });
            }
            debug!("416 for whole-file range, retrying without Range");
            response = self.get(url, None, timeout).await?;
        }

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(error_from_response(url, response).await);
        }

        let content_range = header_text(&response, CONTENT_RANGE);
        let total_size = match content_range.as_deref() {
            Some(value) => {
                if !value.starts_with(&format!("bytes {start}-")) {
                    debug!(content_range = value, start, "server ignored requested range");
                    return Err(TransferError::UnsupportedRange {
                        url: url.to_string(),
                    });
                }
                parse_content_range(value)
                    .map(|range| range.total)
                    .or_else(|| response.content_length())
                    .unwrap_or(0)
            }
            None => {
                let empty = response.content_length() == Some(0);
                if !(whole_file && empty) {
                    return Err(TransferError::UnsupportedRange {
                        url: url.to_string(),
                    });
                }
                0
            }
        };

        debug!(total_size, status = status.as_u16(), "range accepted");
        Ok(RangeResponse {
            response,
            total_size,
        })
    }

    /// Plain GET without a `Range` header, for servers that cannot do ranges.
    ///
    /// # Errors
    ///
    /// Remote API errors for non-2xx statuses, transient errors otherwise.
    #[instrument(skip(self, url), fields(url = %url))]
    pub async fn request_whole(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<RangeResponse, TransferError> {
        let response = self.get(url, None, timeout).await?;
        if !response.status().is_success() {
            return Err(error_from_response(url, response).await);
        }
        let total_size = response.content_length().unwrap_or(0);
        Ok(RangeResponse {
            response,
            total_size,
        })
    }

    async fn get(
        &self,
        url: &str,
        range: Option<&str>,
        timeout: Duration,
    ) -> Result<Response, TransferError> {
        let mut request = self
            .client
            .inner()
            .get(url)
            .header(ACCEPT_ENCODING, "identity");
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }
        self.client.send(request, url, Some(timeout)).await
    }
}

/// Parsed `Content-Range: bytes <first>-<last>/<total>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte in the body.
    pub first: u64,
    /// Last byte in the body (inclusive).
    pub last: u64,
    /// Size of the whole object.
    pub total: u64,
}

/// Parses a `Content-Range` value. Unknown totals (`*`) and inconsistent
/// ranges yield `None`.
#[must_use]
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let spec = value.trim().strip_prefix("bytes ")?;
    let (range, total) = spec.split_once('/')?;
    let (first, last) = range.split_once('-')?;
    let parsed = ContentRange {
        first: first.trim().parse().ok()?,
        last: last.trim().parse().ok()?,
        total: total.trim().parse().ok()?,
    };
    (parsed.first <= parsed.last && parsed.last < parsed.total).then_some(parsed)
}

fn range_header(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={start}-{end}"),
        None => format!("bytes={start}-"),
    }
}

fn header_text(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 0-9/10"),
            Some(ContentRange {
                first: 0,
                last: 9,
                total: 10
            })
        );
        assert_eq!(parse_content_range("bytes 5-9/*"), None);
        assert_eq!(parse_content_range("bytes 9-5/10"), None);
        assert_eq!(parse_content_range("bytes 0-10/10"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
    }

    #[test]
    fn test_range_header_format() {
        assert_eq!(range_header(0, None), "bytes=0-");
        assert_eq!(range_header(5, Some(9)), "bytes=5-9");
    }

    #[tokio::test]
    async fn test_request_reads_total_from_content_range() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/f"))
            .and(header("range", "bytes=2-"))
            .and(header("accept-encoding", "identity"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 2-9/10")
                    .set_body_bytes(b"23456789".to_vec()),
            )
            .mount(&server)
            .await;

        let requester = RangeRequester::new(HttpClient::new());
        let url = format!("{}/f", server.uri());
        let ranged = requester.request(&url, 2, None, TIMEOUT).await.unwrap();
        assert_eq!(ranged.total_size, 10);
        assert_eq!(ranged.response.bytes().await.unwrap().as_ref(), b"23456789");
    }

    #[tokio::test]
    async fn test_request_rejects_server_that_ignores_range() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
            .mount(&server)
            .await;

        let requester = RangeRequester::new(HttpClient::new());
        let url = format!("{}/f", server.uri());
        let result = requester.request(&url, 0, None, TIMEOUT).await;
        assert!(matches!(result, Err(TransferError::UnsupportedRange { .. })));
    }

    #[tokio::test]
    async fn test_request_rejects_shifted_content_range() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-9/10")
                    .set_body_bytes(b"0123456789".to_vec()),
            )
            .mount(&server)
            .await;

        let requester = RangeRequester::new(HttpClient::new());
        let url = format!("{}/f", server.uri());
        let result = requester.request(&url, 4, Some(9), TIMEOUT).await;
        assert!(matches!(result, Err(TransferError::UnsupportedRange { .. })));
    }

    #[tokio::test]
    async fn test_whole_file_416_retries_without_range() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/empty"))
            .and(header("range", "bytes=0-"))
            .respond_with(ResponseTemplate::new(416))
            .expect(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .with_priority(2)
            .mount(&server)
            .await;

        let requester = RangeRequester::new(HttpClient::new());
        let url = format!("{}/empty", server.uri());
        let ranged = requester.request(&url, 0, None, TIMEOUT).await.unwrap();
        assert_eq!(ranged.total_size, 0);
    }

    #[tokio::test]
    async fn test_partial_416_is_range_not_satisfiable() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(ResponseTemplate::new(416))
            .expect(1)
            .mount(&server)
            .await;

        let requester = RangeRequester::new(HttpClient::new());
        let url = format!("{}/f", server.uri());
        let result = requester.request(&url, 5_000_000, None, TIMEOUT).await;
        assert!(matches!(
            result,
            Err(TransferError::RangeNotSatisfiable {
                start: 5_000_000,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_error_payload_is_surfaced() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_json(serde_json::json!({"code": "Denied", "message": "nope"})),
            )
            .mount(&server)
            .await;

        let requester = RangeRequester::new(HttpClient::new());
        let url = format!("{}/f", server.uri());
        let error = requester.request(&url, 0, None, TIMEOUT).await.unwrap_err();
        assert!(matches!(error, TransferError::Client { status: 403, ref message, .. } if message == "nope"));
    }
}
