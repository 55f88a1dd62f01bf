use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{multipart, StatusCode};

use crate::error::{TransportError, TransportErrorKind};
use crate::request::{FormPart, MultipartForm, Payload};
use crate::util::lock_unpoisoned;
use crate::{Progress, ProgressObserver, RequestDescriptor, ResponseType};

const UPLOAD_CHUNK_SIZE: usize = 16 * 1024;

/// Raw response handed from the transport to the pipeline.
///
/// The body is fully buffered. `Bytes` clones share the buffer, so the body
/// can be read for error diagnostics and again for decoding.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

/// Forwards transfer progress to an observer.
///
/// `loaded` values lower than one already reported are dropped, so
/// observers see a non-decreasing sequence.
#[derive(Clone)]
pub struct ProgressReporter {
    observer: ProgressObserver,
    last: Arc<Mutex<Option<Progress>>>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("last", &*lock_unpoisoned(&self.last))
            .finish()
    }
}

impl ProgressReporter {
    pub(crate) fn new(observer: ProgressObserver) -> Self {
        Self {
            observer,
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn report(&self, loaded: u64, total: Option<u64>) {
        let progress = Progress { loaded, total };
        {
            let mut last = lock_unpoisoned(&self.last);
            if last.is_some_and(|previous| previous.loaded > loaded) {
                return;
            }
            *last = Some(progress);
        }
        (self.observer)(progress);
    }

    /// Emits a final `loaded == total` event unless one was already sent.
    pub(crate) fn complete(&self, loaded: u64) {
        let last = *lock_unpoisoned(&self.last);
        let loaded = last.map_or(loaded, |previous| previous.loaded.max(loaded));
        if last.is_some_and(|previous| previous.loaded == loaded && previous.total == Some(loaded)) {
            return;
        }
        self.report(loaded, Some(loaded));
    }
}

/// Per-dispatch settings passed to a [`Transport`].
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Deadline for the whole exchange, body included.
    pub deadline: Option<Duration>,
    pub upload: Option<ProgressReporter>,
    pub download: Option<ProgressReporter>,
}

/// Capability that moves one request over the wire.
///
/// The pipeline aborts an in-flight send by dropping the returned future,
/// so implementations must release their resources on drop.
pub trait Transport: Send + Sync + fmt::Debug {
    fn send(
        &self,
        request: RequestDescriptor,
        options: SendOptions,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>>;

    /// Whether responses of `response_type` can be produced on this path.
    fn supports(&self, _response_type: ResponseType) -> bool {
        true
    }
}

/// Default [`Transport`] backed by `reqwest`.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a preconfigured `reqwest` client (pooling, TLS, proxies).
    pub fn from_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn execute(
        &self,
        request: RequestDescriptor,
        options: SendOptions,
    ) -> Result<TransportResponse, TransportError> {
        let RequestDescriptor {
            method,
            url,
            mut headers,
            body,
        } = request;

        let mut builder = self.http.request(method, url);
        if let Some(deadline) = options.deadline {
            builder = builder.timeout(deadline);
        }

        let upload_total = body.as_ref().map_or(0, Payload::len);
        match body {
            Some(Payload::Bytes { data, content_type }) => {
                if let Some(content_type) = content_type {
                    if !headers.contains_key(CONTENT_TYPE) {
                        let value = HeaderValue::from_str(&content_type)
                            .map_err(|err| TransportError::new(TransportErrorKind::Other, err))?;
                        headers.insert(CONTENT_TYPE, value);
                    }
                }
                builder = match &options.upload {
                    Some(reporter) => builder.body(streamed_body(data, reporter.clone())),
                    None => builder.body(data),
                };
            }
            Some(Payload::Multipart(form)) => {
                headers.remove(CONTENT_TYPE);
                builder = builder.multipart(into_reqwest_form(form)?);
            }
            None => {}
        }

        let mut response = builder
            .headers(headers)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if let Some(reporter) = &options.upload {
            reporter.complete(upload_total);
        }

        let status = response.status();
        let headers = response.headers().clone();
        let total = response.content_length();
        let mut body = Vec::with_capacity(total.unwrap_or(0).min(1 << 20) as usize);
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
            body.extend_from_slice(&chunk);
            if let Some(reporter) = &options.download {
                reporter.report(body.len() as u64, total);
            }
        }

        Ok(TransportResponse {
            status,
            headers,
            body: body.into(),
        })
    }
}

impl Transport for ReqwestTransport {
    fn send(
        &self,
        request: RequestDescriptor,
        options: SendOptions,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
        self.execute(request, options).boxed()
    }
}

fn streamed_body(data: Bytes, reporter: ProgressReporter) -> reqwest::Body {
    let total = data.len() as u64;
    let chunks: Vec<Bytes> = (0..data.len())
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(|start| data.slice(start..(start + UPLOAD_CHUNK_SIZE).min(data.len())))
        .collect();

    let mut sent = 0u64;
    let body = stream::iter(chunks.into_iter().map(move |chunk| {
        sent += chunk.len() as u64;
        reporter.report(sent, Some(total));
        Ok::<_, std::io::Error>(chunk)
    }));
    reqwest::Body::wrap_stream(body)
}

fn into_reqwest_form(form: MultipartForm) -> Result<multipart::Form, TransportError> {
    let mut out = multipart::Form::new();
    for part in form.parts {
        out = match part {
            FormPart::Text { name, value } => out.text(name, value),
            FormPart::File {
                name,
                file_name,
                mime,
                data,
            } => {
                let mut part = multipart::Part::bytes(data.to_vec()).file_name(file_name);
                if let Some(mime) = mime {
                    part = part.mime_str(&mime).map_err(map_reqwest_error)?;
                }
                out.part(name, part)
            }
        };
    }
    Ok(out)
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportErrorKind::Body
    } else {
        TransportErrorKind::Other
    };
    TransportError::new(kind, err)
}
