use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::Serialize;
use url::Url;

use crate::{CourierError, Params, Result};

/// One attempt's view of a request.
///
/// Request interceptors receive and return this value, so every field is
/// public. The typed `method` and `url` keep the descriptor well-formed
/// whatever an interceptor does to it.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Payload>,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Throttle key: `host:port`, or `None` for URLs without a host.
    pub fn host_key(&self) -> Option<String> {
        let host = self.url.host_str()?;
        Some(match self.url.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        })
    }
}

/// Request body with its declared content semantics.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Bytes {
        data: Bytes,
        content_type: Option<String>,
    },
    Multipart(MultipartForm),
}

impl Payload {
    /// Raw bytes without a declared content type.
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self::Bytes {
            data: data.into(),
            content_type: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Bytes {
            data: Bytes::from(text.into()),
            content_type: Some("text/plain; charset=utf-8".to_owned()),
        }
    }

    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let data = serde_json::to_vec(value)
            .map_err(|err| CourierError::Encode(format!("invalid json body: {err}")))?;
        Ok(Self::Bytes {
            data: data.into(),
            content_type: Some("application/json".to_owned()),
        })
    }

    pub fn url_encoded<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let encoded = serde_urlencoded::to_string(value)
            .map_err(|err| CourierError::Encode(format!("invalid url-encoded body: {err}")))?;
        Ok(Self::Bytes {
            data: Bytes::from(encoded),
            content_type: Some("application/x-www-form-urlencoded".to_owned()),
        })
    }

    pub fn content_type(&self) -> Option<&str> {
        match self {
            Self::Bytes { content_type, .. } => content_type.as_deref(),
            Self::Multipart(_) => Some("multipart/form-data"),
        }
    }

    /// Number of payload bytes, excluding multipart framing.
    pub fn len(&self) -> u64 {
        match self {
            Self::Bytes { data, .. } => data.len() as u64,
            Self::Multipart(form) => form.parts.iter().map(FormPart::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fields of a `multipart/form-data` body.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MultipartForm {
    pub parts: Vec<FormPart>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(FormPart::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        mime: Option<&str>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(FormPart::File {
            name: name.into(),
            file_name: file_name.into(),
            mime: mime.map(str::to_owned),
            data: data.into(),
        });
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        mime: Option<String>,
        data: Bytes,
    },
}

impl FormPart {
    fn len(&self) -> u64 {
        match self {
            Self::Text { value, .. } => value.len() as u64,
            Self::File { data, .. } => data.len() as u64,
        }
    }
}

/// Resolves `endpoint` against `base` and appends `params`.
///
/// Absolute `http(s)` endpoints ignore the base. Relative endpoints are
/// joined to the base with exactly one `/` between them.
pub(crate) fn resolve_url(base: Option<&Url>, endpoint: &str, params: &Params) -> Result<Url> {
    let mut url = match Url::parse(endpoint) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => {
            let base = base.ok_or_else(|| CourierError::InvalidUrl {
                url: endpoint.to_owned(),
                message: "relative endpoint without a base url".to_owned(),
            })?;
            let joined = join_base_path(base.as_str(), endpoint);
            Url::parse(&joined).map_err(|err| CourierError::InvalidUrl {
                url: joined.clone(),
                message: err.to_string(),
            })?
        }
    };

    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params.iter());
    }
    Ok(url)
}

fn join_base_path(base: &str, endpoint: &str) -> String {
    let base = base.trim_end_matches('/');
    let endpoint = endpoint.trim_start_matches('/');
    if endpoint.is_empty() {
        base.to_owned()
    } else {
        format!("{base}/{endpoint}")
    }
}
