//! Native backend for Aliyun OSS compatible stores.

use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, DATE, ETAG};
use reqwest::{Method, Response};
use tokio::fs::File;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::signing::{OssCredentials, SignableRequest, authorization, canonical_resource};
use super::{
    CompletionResponse, MultipartCheckpoint, ObjectHeaders, ObjectStoreBackend, PartRecord,
    ResumeSlot,
};
use crate::download::HttpClient;
use crate::error::{INTEGRITY_FILE_MODIFIED, TransferError};
use crate::local_file::{FileStamp, read_chunk_at};
use crate::progress::{ProgressFn, report};
use crate::ticket::ObjectStoreTicket;
use crate::upload::{RetryDecision, RetryPolicy};

const OCTET_STREAM: &str = "application/octet-stream";
const XML: &str = "application/xml";
const CALLBACK_HEADER_PREFIX: &str = "x-oss-callback";
const SECURITY_TOKEN_HEADER: &str = "x-oss-security-token";

/// Signed client for one bucket.
#[derive(Debug, Clone)]
pub struct OssBackend {
    http: HttpClient,
    credentials: OssCredentials,
    bucket: String,
    endpoint: Url,
    path_style: bool,
    retry: RetryPolicy,
}

impl OssBackend {
    /// Creates a backend for `bucket` at `endpoint`.
    ///
    /// An endpoint without scheme gets `https://`. IP and `localhost`
    /// endpoints are addressed path-style (`/bucket/key`), everything else
    /// virtual-host style (`bucket.endpoint/key`).
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] for an unparsable endpoint or an
    /// empty bucket name.
    pub fn new(
        http: HttpClient,
        endpoint: &str,
        bucket: &str,
        credentials: OssCredentials,
    ) -> Result<Self, TransferError> {
        if bucket.is_empty() {
            return Err(TransferError::validation("bucket name is empty"));
        }
        let endpoint = parse_endpoint(endpoint)?;
        let path_style = is_path_style(&endpoint);
        Ok(Self {
            http,
            credentials,
            bucket: bucket.to_string(),
            endpoint,
            path_style,
            retry: RetryPolicy::default(),
        })
    }

    /// Creates a backend from the credentials and location in `ticket`.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn from_ticket(http: HttpClient, ticket: &ObjectStoreTicket) -> Result<Self, TransferError> {
        let credentials = OssCredentials {
            access_key_id: ticket.access_key_id.clone(),
            access_key_secret: ticket.access_key_secret.clone(),
            security_token: Some(ticket.security_token.clone()).filter(|token| !token.is_empty()),
        };
        Self::new(http, &ticket.endpoint, &ticket.bucket_name, credentials)
    }

    /// Replaces the retry policy used for individual parts.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// URL of `key`, with `sub_resources` as query.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] if the endpoint cannot carry a path.
    pub fn object_url(
        &self,
        key: &str,
        sub_resources: &[(&str, Option<&str>)],
    ) -> Result<Url, TransferError> {
        let mut url = self.endpoint.clone();
        if !self.path_style {
            let host = url.host_str().unwrap_or_default().to_string();
            url.set_host(Some(&format!("{}.{host}", self.bucket)))
                .map_err(|e| TransferError::validation(format!("invalid bucket host: {e}")))?;
        }
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| TransferError::validation("endpoint cannot carry a path"))?;
            segments.clear();
            if self.path_style {
                segments.push(&self.bucket);
            }
            segments.extend(key.split('/'));
        }
        if !sub_resources.is_empty() {
            let query = sub_resources
                .iter()
                .map(|(name, value)| match value {
                    Some(value) => format!(
                        "{name}={}",
                        url::form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>()
                    ),
                    None => (*name).to_string(),
                })
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&query));
        }
        Ok(url)
    }

    /// Starts a multipart upload and returns its upload id.
    ///
    /// # Errors
    ///
    /// [`TransferError::ObjectStore`] for error replies, [`TransferError::Protocol`]
    /// when the reply carries no `UploadId`.
    #[instrument(skip(self, headers))]
    pub async fn initiate_multipart(
        &self,
        key: &str,
        headers: &ObjectHeaders,
    ) -> Result<String, TransferError> {
        let headers = without_callback(headers);
        let response = self
            .send(Method::POST, key, &[("uploads", None)], OCTET_STREAM, &headers, Vec::new())
            .await?;
        let url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| TransferError::network(&url, e))?;
        let upload_id = xml_text(&body, "UploadId")
            .ok_or_else(|| TransferError::protocol(&url, "initiate reply has no UploadId"))?;
        info!(upload_id = %upload_id, "multipart upload initiated");
        Ok(upload_id)
    }

    /// Uploads one part and returns its ETag.
    ///
    /// Transient failures are retried according to the backend's policy.
    ///
    /// # Errors
    ///
    /// [`TransferError::ObjectStore`] for error replies,
    /// [`TransferError::RetriesExhausted`] once transient retries run out.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: u32,
        bytes: Vec<u8>,
    ) -> Result<String, TransferError> {
        let number_text = number.to_string();
        let sub_resources = [
            ("partNumber", Some(number_text.as_str())),
            ("uploadId", Some(upload_id)),
        ];
        let mut attempt = 1;
        loop {
            let error = match self
                .send(
                    Method::PUT,
                    key,
                    &sub_resources,
                    OCTET_STREAM,
                    &ObjectHeaders::new(),
                    bytes.clone(),
                )
                .await
            {
                Ok(response) => {
                    let url = response.url().to_string();
                    return response
                        .headers()
                        .get(ETAG)
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string)
                        .ok_or_else(|| TransferError::protocol(url, "part reply has no ETag"));
                }
                Err(error) => error,
            };

            match self.retry.should_retry(error.class(), attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    warn!(error = %error, number, attempt, "part upload failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { .. } if error.is_transient() => {
                    return Err(TransferError::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(error),
                    });
                }
                RetryDecision::DoNotRetry { .. } => return Err(error),
            }
        }
    }

    /// Completes a multipart upload from its acknowledged parts.
    ///
    /// Only `x-oss-callback*` headers are sent on this call.
    ///
    /// # Errors
    ///
    /// [`TransferError::ObjectStore`] for error replies.
    #[instrument(skip(self, parts, headers), fields(parts = parts.len()))]
    pub async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartRecord],
        headers: &ObjectHeaders,
    ) -> Result<CompletionResponse, TransferError> {
        let headers: ObjectHeaders = headers
            .iter()
            .filter(|(name, _)| name.starts_with(CALLBACK_HEADER_PREFIX))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let response = self
            .send(
                Method::POST,
                key,
                &[("uploadId", Some(upload_id))],
                XML,
                &headers,
                complete_body(parts).into_bytes(),
            )
            .await?;
        completion(response).await
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        sub_resources: &[(&str, Option<&str>)],
        content_type: &str,
        headers: &ObjectHeaders,
        body: Vec<u8>,
    ) -> Result<Response, TransferError> {
        let url = self.object_url(key, sub_resources)?;
        let url_text = url.to_string();
        let date = httpdate::fmt_http_date(SystemTime::now());

        let mut oss_headers = headers.clone();
        if let Some(token) = &self.credentials.security_token {
            oss_headers.insert(SECURITY_TOKEN_HEADER.to_string(), token.clone());
        }
        let resource = canonical_resource(&self.bucket, key, sub_resources);
        let signature = authorization(
            &self.credentials,
            &SignableRequest {
                verb: method.as_str(),
                content_md5: "",
                content_type,
                date: &date,
                oss_headers: &oss_headers,
                resource: &resource,
            },
        )?;

        let mut request = self
            .http
            .inner()
            .request(method, url)
            .header(DATE, date.as_str())
            .header(CONTENT_TYPE, content_type)
            .header(AUTHORIZATION, signature)
            .body(body);
        for (name, value) in &oss_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = self.http.send(request, &url_text, None).await?;
        if !response.status().is_success() {
            return Err(object_store_error(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl ObjectStoreBackend for OssBackend {
    #[instrument(skip(self, path, headers), fields(path = %path.display()))]
    async fn put_object(
        &self,
        key: &str,
        path: &Path,
        headers: &ObjectHeaders,
    ) -> Result<CompletionResponse, TransferError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        let response = self
            .send(Method::PUT, key, &[], OCTET_STREAM, headers, bytes)
            .await?;
        completion(response).await
    }

    #[instrument(skip(self, path, resume, headers, progress), fields(path = %path.display(), part_size = resume.part_size))]
    async fn multipart_upload(
        &self,
        key: &str,
        path: &Path,
        resume: ResumeSlot<'_>,
        headers: &ObjectHeaders,
        progress: &mut ProgressFn<'_>,
    ) -> Result<CompletionResponse, TransferError> {
        if resume.part_size == 0 {
            return Err(TransferError::validation("part size must be positive"));
        }
        let stamp = FileStamp::read(path).await?;
        let total = stamp.size;
        let part_count = u32::try_from(total.div_ceil(resume.part_size))
            .map_err(|_| TransferError::validation("file needs too many parts"))?;

        let saved = resume
            .store
            .load::<Option<MultipartCheckpoint>>(resume.key, None);
        let mut record = match saved {
            Some(record)
                if record.stamp == stamp
                    && record.part_size == resume.part_size
                    && record.key == key =>
            {
                info!(upload_id = %record.upload_id, parts = record.parts.len(), "resuming multipart upload");
                record
            }
            stale => {
                if stale.is_some() {
                    info!("local file or part size changed, discarding multipart record");
                    resume.store.remove(resume.key);
                }
                let record = MultipartCheckpoint {
                    key: key.to_string(),
                    upload_id: self.initiate_multipart(key, headers).await?,
                    part_size: resume.part_size,
                    stamp,
                    parts: Vec::new(),
                };
                resume.store.save(resume.key, &record)?;
                record
            }
        };

        let mut uploaded: u64 = record.parts.iter().map(|part| part.size).sum();
        report(progress, uploaded, total)?;

        let mut file = File::open(path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        for number in 1..=part_count {
            if record.parts.iter().any(|part| part.number == number) {
                continue;
            }
            if FileStamp::read(path).await? != stamp {
                resume.store.remove(resume.key);
                return Err(TransferError::integrity(
                    INTEGRITY_FILE_MODIFIED,
                    path,
                    "file modified during upload",
                ));
            }

            let offset = u64::from(number - 1) * resume.part_size;
            let bytes = read_chunk_at(&mut file, path, offset, resume.part_size).await?;
            let size = bytes.len() as u64;
            let etag = match self.upload_part(key, &record.upload_id, number, bytes).await {
                Ok(etag) => etag,
                Err(error) => {
                    if matches!(&error, TransferError::ObjectStore { code, .. } if code == "NoSuchUpload") {
                        resume.store.remove(resume.key);
                    }
                    return Err(error);
                }
            };
            record.parts.push(PartRecord { number, etag, size });
            resume.store.save(resume.key, &record)?;

            uploaded += size;
            debug!(number, uploaded, total, "part uploaded");
            report(progress, uploaded, total)?;
        }

        record.parts.sort_by_key(|part| part.number);
        let response = self
            .complete_multipart(key, &record.upload_id, &record.parts, headers)
            .await?;
        resume.store.remove(resume.key);
        Ok(response)
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, TransferError> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| TransferError::validation(format!("invalid endpoint `{endpoint}`: {e}")))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(TransferError::validation(format!(
            "endpoint `{endpoint}` has no host"
        )));
    }
    Ok(url)
}

fn is_path_style(endpoint: &Url) -> bool {
    endpoint.host_str().is_some_and(|host| {
        host == "localhost" || host.trim_matches(['[', ']']).parse::<IpAddr>().is_ok()
    })
}

fn without_callback(headers: &ObjectHeaders) -> ObjectHeaders {
    headers
        .iter()
        .filter(|(name, _)| !name.starts_with(CALLBACK_HEADER_PREFIX))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn complete_body(parts: &[PartRecord]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        let _ = write!(
            body,
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.number,
            xml_escape(&part.etag)
        );
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Text between the first `<tag>` and its closing tag.
fn xml_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim().to_string())
}

async fn completion(response: Response) -> Result<CompletionResponse, TransferError> {
    let status = response.status().as_u16();
    let url = response.url().to_string();
    let body = response
        .bytes()
        .await
        .map_err(|e| TransferError::network(url, e))?;
    Ok(CompletionResponse {
        status,
        body: body.to_vec(),
    })
}

async fn object_store_error(response: Response) -> TransferError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let code = xml_text(&body, "Code").unwrap_or_else(|| format!("HTTP{status}"));
    let message = xml_text(&body, "Message")
        .unwrap_or_else(|| body.trim().chars().take(256).collect());
    debug!(status, code = %code, "object store error");
    TransferError::ObjectStore {
        status,
        code,
        message,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn credentials() -> OssCredentials {
        OssCredentials {
            access_key_id: "AKID".into(),
            access_key_secret: "secret".into(),
            security_token: None,
        }
    }

    fn backend(endpoint: &str) -> OssBackend {
        OssBackend::new(HttpClient::new(), endpoint, "docs", credentials()).unwrap()
    }

    #[test]
    fn test_virtual_host_url_for_named_endpoint() {
        let url = backend("oss-cn-hangzhou.aliyuncs.com")
            .object_url("folder/a b.bin", &[])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://docs.oss-cn-hangzhou.aliyuncs.com/folder/a%20b.bin"
        );
    }

    #[test]
    fn test_path_style_url_for_ip_endpoint() {
        let url = backend("http://127.0.0.1:9000")
            .object_url("a.bin", &[("partNumber", Some("2")), ("uploadId", Some("x/y"))])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:9000/docs/a.bin?partNumber=2&uploadId=x%2Fy"
        );
        let url = backend("http://localhost:9000").object_url("a.bin", &[("uploads", None)]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/docs/a.bin?uploads");
    }

    #[test]
    fn test_new_rejects_bad_location() {
        assert!(matches!(
            OssBackend::new(HttpClient::new(), "http://", "docs", credentials()),
            Err(TransferError::Validation { .. })
        ));
        assert!(matches!(
            OssBackend::new(HttpClient::new(), "oss.example.com", "", credentials()),
            Err(TransferError::Validation { .. })
        ));
    }

    #[test]
    fn test_xml_text_extracts_first_element() {
        let xml = "<Error><Code>NoSuchUpload</Code><Message> gone </Message></Error>";
        assert_eq!(xml_text(xml, "Code").as_deref(), Some("NoSuchUpload"));
        assert_eq!(xml_text(xml, "Message").as_deref(), Some("gone"));
        assert_eq!(xml_text(xml, "RequestId"), None);
    }

    #[test]
    fn test_complete_body_lists_parts_in_order() {
        let parts = vec![
            PartRecord {
                number: 1,
                etag: "\"e1\"".into(),
                size: 4,
            },
            PartRecord {
                number: 2,
                etag: "\"e2\"".into(),
                size: 1,
            },
        ];
        assert_eq!(
            complete_body(&parts),
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>\"e1\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"e2\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn test_without_callback_keeps_meta_headers() {
        let mut headers = ObjectHeaders::new();
        headers.insert("x-oss-callback".into(), "cb".into());
        headers.insert("x-oss-meta-content-md5".into(), "m".into());
        let kept = without_callback(&headers);
        assert_eq!(kept.len(), 1);
        assert!(kept.contains_key("x-oss-meta-content-md5"));
    }
}
