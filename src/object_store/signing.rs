//! OSS header signing (signature version 1).
//!
//! ```text
//! Authorization: OSS <AccessKeyId>:base64(hmac-sha1(secret, StringToSign))
//!
//! StringToSign = VERB \n Content-MD5 \n Content-Type \n Date \n
//!                CanonicalizedOSSHeaders CanonicalizedResource
//! ```

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::TransferError;

type HmacSha1 = Hmac<Sha1>;

/// Temporary object-store credentials.
#[derive(Clone)]
pub struct OssCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Access key secret.
    pub access_key_secret: String,
    /// STS token, sent as `x-oss-security-token`.
    pub security_token: Option<String>,
}

impl std::fmt::Debug for OssCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OssCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// Everything the signature covers for one request.
#[derive(Debug)]
pub(crate) struct SignableRequest<'a> {
    pub verb: &'a str,
    pub content_md5: &'a str,
    pub content_type: &'a str,
    pub date: &'a str,
    /// `x-oss-*` headers; names are lowercased while canonicalizing.
    pub oss_headers: &'a BTreeMap<String, String>,
    /// `/bucket/key` plus sorted sub-resources.
    pub resource: &'a str,
}

/// Builds the string the signature is computed over.
pub(crate) fn string_to_sign(request: &SignableRequest<'_>) -> String {
    let canonical_headers: BTreeMap<String, &str> = request
        .oss_headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
        .filter(|(name, _)| name.starts_with("x-oss-"))
        .collect();

    let mut out = format!(
        "{}\n{}\n{}\n{}\n",
        request.verb, request.content_md5, request.content_type, request.date
    );
    for (name, value) in canonical_headers {
        out.push_str(&name);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }
    out.push_str(request.resource);
    out
}

/// Returns the `Authorization` header value for `request`.
pub(crate) fn authorization(
    credentials: &OssCredentials,
    request: &SignableRequest<'_>,
) -> Result<String, TransferError> {
    let mut mac = HmacSha1::new_from_slice(credentials.access_key_secret.as_bytes())
        .map_err(|e| TransferError::validation(format!("invalid OSS secret: {e}")))?;
    mac.update(string_to_sign(request).as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());
    Ok(format!("OSS {}:{signature}", credentials.access_key_id))
}

/// `/bucket/key` followed by sub-resources in lexical order.
pub(crate) fn canonical_resource(bucket: &str, key: &str, sub_resources: &[(&str, Option<&str>)]) -> String {
    let mut resource = format!("/{bucket}/{key}");
    let mut sorted: Vec<_> = sub_resources.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    for (index, (name, value)) in sorted.iter().enumerate() {
        resource.push(if index == 0 { '?' } else { '&' });
        resource.push_str(name);
        if let Some(value) = value {
            resource.push('=');
            resource.push_str(value);
        }
    }
    resource
}
