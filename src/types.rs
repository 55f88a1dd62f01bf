use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::{CourierError, Result};

/// Transfer progress reported to upload/download observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub loaded: u64,
    /// Total length, when knowable up front.
    pub total: Option<u64>,
}

/// Binary body together with its declared media type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Decoded body of a successful response, shaped by the requested
/// [`ResponseType`](crate::ResponseType).
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseData {
    /// `Null` for an empty body.
    Json(serde_json::Value),
    Text(String),
    Blob(Blob),
    ArrayBuffer(Bytes),
    /// Ordered `key=value` pairs of a url-encoded form body.
    FormData(Vec<(String, String)>),
}

impl ResponseData {
    /// Deserializes a JSON response into `T`.
    pub fn into_json<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Self::Json(value) => {
                let raw = value.to_string();
                serde_json::from_value(value).map_err(|err| CourierError::Decode {
                    message: format!("json response does not match target type: {err}"),
                    raw,
                })
            }
            other => Err(CourierError::Decode {
                message: format!("expected json response, got {}", other.kind()),
                raw: String::new(),
            }),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Raw bytes of a blob or array-buffer response.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Self::Blob(blob) => Some(blob.bytes),
            Self::ArrayBuffer(bytes) => Some(bytes),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
            Self::ArrayBuffer(_) => "arrayBuffer",
            Self::FormData(_) => "formData",
        }
    }
}
