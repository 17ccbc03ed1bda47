//! Upload tickets issued by the platform.
//!
//! A ticket is a flat JSON object. Its `upload_service` field selects the
//! backend: `"upload"` (the default) for the platform's own chunked protocol,
//! `"aliyun_oss"` for the object store.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TransferError;

/// `upload_service` value of direct tickets.
pub const DIRECT_SERVICE: &str = "upload";

/// `upload_service` value of object-store tickets.
pub const OBJECT_STORE_SERVICE: &str = "aliyun_oss";

/// Fields that change on every issue of an otherwise identical ticket.
const ONE_TIME_FIELDS: &[&str] = &[
    "signcode",
    "deadline",
    "expire",
    "maxsize",
    "AccessKeyId",
    "AccessKeySecret",
    "SecurityToken",
    "Expiration",
];

/// Server-issued authorization for one upload.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferTicket {
    /// Platform chunked upload (`upload_service = "upload"`).
    Direct(DirectTicket),
    /// Object-store multipart upload (`upload_service = "aliyun_oss"`).
    ObjectStore(ObjectStoreTicket),
}

/// Ticket for the platform's own resumable upload endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectTicket {
    /// Declared file size; must equal the local file size.
    #[serde(deserialize_with = "size_from_number_or_string")]
    pub maxsize: u64,
    /// Name the platform should store the file under.
    pub filename: String,
    /// Callback URL notified after the upload completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Ticket deadline.
    #[serde(
        default,
        deserialize_with = "optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub deadline: Option<String>,
    /// Ticket lifetime.
    #[serde(
        default,
        deserialize_with = "optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub expire: Option<String>,
    /// Signature over the ticket fields.
    #[serde(
        default,
        deserialize_with = "optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub signcode: Option<String>,
    /// Expected hex MD5 of the content.
    #[serde(
        default,
        deserialize_with = "optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub hash: Option<String>,
    /// Storage device hint.
    #[serde(
        default,
        deserialize_with = "optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub device: Option<String>,
    /// Storage key prefix.
    #[serde(
        default,
        deserialize_with = "optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub prefix: Option<String>,
    /// Storage key suffix.
    #[serde(
        default,
        deserialize_with = "optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub suffix: Option<String>,
    /// Any other field the server sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Ticket carrying temporary object-store credentials.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStoreTicket {
    /// STS access key id.
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    /// STS access key secret.
    #[serde(rename = "AccessKeySecret")]
    pub access_key_secret: String,
    /// STS security token.
    #[serde(rename = "SecurityToken")]
    pub security_token: String,
    /// Object store endpoint, with or without scheme.
    pub endpoint: String,
    /// Target bucket.
    pub bucket_name: String,
    /// Target object key.
    pub key: String,
    /// URL the object store calls after the upload.
    #[serde(rename = "callbackUrl")]
    pub callback_url: String,
    /// Body template for the callback.
    #[serde(rename = "callbackBody")]
    pub callback_body: String,
    /// Content type of the callback body.
    #[serde(rename = "callbackBodyType", default = "default_callback_body_type")]
    pub callback_body_type: String,
    /// Credential expiry, `YYYY-MM-DDTHH:MM:SSZ`.
    #[serde(
        rename = "Expiration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub expiration: Option<String>,
    /// Expected hex MD5 of the content.
    #[serde(
        default,
        deserialize_with = "optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub hash: Option<String>,
    /// Declared file size, when the server sent one.
    #[serde(
        default,
        deserialize_with = "optional_size",
        skip_serializing_if = "Option::is_none"
    )]
    pub maxsize: Option<u64>,
    /// Any other field the server sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl std::fmt::Debug for ObjectStoreTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreTicket")
            .field("access_key_id", &self.access_key_id)
            .field("endpoint", &self.endpoint)
            .field("bucket_name", &self.bucket_name)
            .field("key", &self.key)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

fn default_callback_body_type() -> String {
    "application/x-www-form-urlencoded".to_string()
}

impl TransferTicket {
    /// Parses a ticket from its JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] for malformed JSON, missing fields
    /// or an unknown `upload_service`.
    pub fn from_json_str(raw: &str) -> Result<Self, TransferError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| TransferError::validation(format!("ticket is not valid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Parses a ticket from an already decoded JSON value.
    ///
    /// # Errors
    ///
    /// Same as [`from_json_str`](Self::from_json_str).
    pub fn from_value(value: Value) -> Result<Self, TransferError> {
        let Value::Object(mut fields) = value else {
            return Err(TransferError::validation("ticket must be a JSON object"));
        };
        let service = match fields.remove("upload_service") {
            None | Some(Value::Null) => DIRECT_SERVICE.to_string(),
            Some(Value::String(service)) => service,
            Some(other) => {
                return Err(TransferError::validation(format!(
                    "upload_service must be a string, got {other}"
                )));
            }
        };
        fields.remove("upload_server");

        match service.as_str() {
            DIRECT_SERVICE => serde_json::from_value(Value::Object(fields))
                .map(Self::Direct)
                .map_err(|e| TransferError::validation(format!("invalid upload ticket: {e}"))),
            OBJECT_STORE_SERVICE => serde_json::from_value(Value::Object(fields))
                .map(Self::ObjectStore)
                .map_err(|e| {
                    TransferError::validation(format!("invalid object store ticket: {e}"))
                }),
            other => Err(TransferError::validation(format!(
                "unsupported upload_service `{other}`"
            ))),
        }
    }

    /// Name of the backend this ticket targets.
    #[must_use]
    pub fn service(&self) -> &'static str {
        match self {
            Self::Direct(_) => DIRECT_SERVICE,
            Self::ObjectStore(_) => OBJECT_STORE_SERVICE,
        }
    }

    /// Ticket JSON without one-time fields, keys sorted.
    ///
    /// Two issues of the ticket for the same upload produce the same text.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] if the ticket cannot be serialized.
    pub fn canonical_json(&self) -> Result<String, TransferError> {
        match self {
            Self::Direct(ticket) => canonical_json(ticket),
            Self::ObjectStore(ticket) => canonical_json(ticket),
        }
    }
}

impl<'de> Deserialize<'de> for TransferTicket {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(de::Error::custom)
    }
}

pub(crate) fn canonical_json<T: Serialize>(ticket: &T) -> Result<String, TransferError> {
    let mut value = serde_json::to_value(ticket)
        .map_err(|e| TransferError::validation(format!("cannot serialize ticket: {e}")))?;
    if let Value::Object(fields) = &mut value {
        for field in ONE_TIME_FIELDS {
            fields.remove(*field);
        }
    }
    // serde_json's default map is ordered by key.
    Ok(value.to_string())
}

fn size_from_number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    optional_size(deserializer)?.ok_or_else(|| de::Error::custom("maxsize is required"))
}

fn optional_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_u64()
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("size must be a non-negative integer, got {number}"))),
        Some(Value::String(text)) => text
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("size must be numeric, got `{text}`"))),
        Some(other) => Err(de::Error::custom(format!("unexpected size value {other}"))),
    }
}

fn optional_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text)),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(Value::Bool(flag)) => Ok(Some(flag.to_string())),
        Some(other) => Err(de::Error::custom(format!("expected a scalar, got {other}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn direct_json() -> Value {
        json!({
            "maxsize": "1024",
            "filename": "report.pdf",
            "callback_url": "https://cb.example/done",
            "deadline": 1700000000,
            "expire": 3600,
            "signcode": "abc",
            "hash": "d41d8cd98f00b204e9800998ecf8427e",
            "upload_server": "https://up.example",
            "parent": "/files/inbox"
        })
    }

    #[test]
    fn test_missing_upload_service_is_direct() {
        let ticket = TransferTicket::from_value(direct_json()).unwrap();
        let TransferTicket::Direct(direct) = ticket else {
            panic!("expected direct ticket");
        };
        assert_eq!(direct.maxsize, 1024);
        assert_eq!(direct.deadline.as_deref(), Some("1700000000"));
        assert_eq!(direct.extra.get("parent"), Some(&json!("/files/inbox")));
        assert!(!direct.extra.contains_key("upload_server"));
    }

    #[test]
    fn test_object_store_ticket_parses() {
        let raw = r#"{
            "upload_service": "aliyun_oss",
            "AccessKeyId": "id", "AccessKeySecret": "secret", "SecurityToken": "sts",
            "endpoint": "oss-cn-hangzhou.aliyuncs.com", "bucket_name": "docs", "key": "a/b.bin",
            "callbackUrl": "https://cb.example", "callbackBody": "uid=${object}",
            "Expiration": "2030-01-01T00:00:00Z"
        }"#;
        let ticket = TransferTicket::from_json_str(raw).unwrap();
        assert_eq!(ticket.service(), OBJECT_STORE_SERVICE);
        let TransferTicket::ObjectStore(store) = ticket else {
            panic!("expected object store ticket");
        };
        assert_eq!(store.bucket_name, "docs");
        assert_eq!(store.callback_body_type, "application/x-www-form-urlencoded");
        assert!(!format!("{store:?}").contains("secret"));
    }

    #[test]
    fn test_unknown_service_is_rejected() {
        let result = TransferTicket::from_value(json!({"upload_service": "ftp"}));
        assert!(matches!(result, Err(TransferError::Validation { .. })));
    }

    #[test]
    fn test_canonical_json_ignores_one_time_fields() {
        let first = TransferTicket::from_value(direct_json()).unwrap();
        let mut reissued = direct_json();
        reissued["signcode"] = json!("zzz");
        reissued["deadline"] = json!(1800000000);
        reissued["expire"] = json!(60);
        let second = TransferTicket::from_value(reissued).unwrap();

        assert_eq!(
            first.canonical_json().unwrap(),
            second.canonical_json().unwrap()
        );
        assert!(!first.canonical_json().unwrap().contains("signcode"));
    }

    #[test]
    fn test_canonical_json_tracks_stable_fields() {
        let first = TransferTicket::from_value(direct_json()).unwrap();
        let mut other = direct_json();
        other["filename"] = json!("other.pdf");
        let second = TransferTicket::from_value(other).unwrap();
        assert_ne!(
            first.canonical_json().unwrap(),
            second.canonical_json().unwrap()
        );
    }
}
