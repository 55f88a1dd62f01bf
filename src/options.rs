use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;

use crate::util::merge_headers;
use crate::{CancelToken, Params, Progress, ThrottlePolicy};

/// Predicate deciding whether a status counts as success.
pub type StatusValidator = Arc<dyn Fn(StatusCode) -> bool + Send + Sync>;
/// Callback receiving transfer progress.
pub type ProgressObserver = Arc<dyn Fn(Progress) + Send + Sync>;

/// How a successful response body is decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResponseType {
    #[default]
    Json,
    Text,
    Blob,
    ArrayBuffer,
    FormData,
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Json => "json",
            Self::Text => "text",
            Self::Blob => "blob",
            Self::ArrayBuffer => "arrayBuffer",
            Self::FormData => "formData",
        };
        f.write_str(text)
    }
}

pub(crate) fn default_retry_status_codes() -> BTreeSet<u16> {
    [408, 429, 500, 502, 503, 504].into_iter().collect()
}

/// Client-wide defaults. Per-call [`RequestOptions`] override them.
#[derive(Clone)]
pub struct ClientOptions {
    /// Per-attempt deadline in milliseconds. `None` means no deadline.
    pub timeout_ms: Option<u64>,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: usize,
    /// Base retry backoff in milliseconds (exponential strategy).
    pub retry_backoff_ms: u64,
    /// Statuses retried in addition to every 5xx.
    pub retry_status_codes: BTreeSet<u16>,
    pub response_type: ResponseType,
    /// `None` accepts 200..=299.
    pub validate_status: Option<StatusValidator>,
    /// Sent with every request; per-call headers win by name.
    pub headers: HeaderMap,
    pub throttle: ThrottlePolicy,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("retry_status_codes", &self.retry_status_codes)
            .field("response_type", &self.response_type)
            .field("validate_status", &self.validate_status.is_some())
            .field("headers", &self.headers.len())
            .field("throttle", &self.throttle)
            .finish()
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            max_retries: 0,
            retry_backoff_ms: 250,
            retry_status_codes: default_retry_status_codes(),
            response_type: ResponseType::Json,
            validate_status: None,
            headers: HeaderMap::new(),
            throttle: ThrottlePolicy::standard(),
        }
    }
}

impl ClientOptions {
    /// Reads overrides from the environment on top of the defaults.
    ///
    /// Reads (all optional):
    /// - `COURIER_TIMEOUT_MS`
    /// - `COURIER_MAX_RETRIES`
    /// - `COURIER_RETRY_BACKOFF_MS`
    /// - `COURIER_THROTTLE_SPACING_MS`
    pub fn from_env() -> std::result::Result<Self, String> {
        let mut options = Self::default();
        if let Some(timeout_ms) = env_number::<u64>("COURIER_TIMEOUT_MS")? {
            options.timeout_ms = Some(timeout_ms);
        }
        if let Some(max_retries) = env_number::<usize>("COURIER_MAX_RETRIES")? {
            options.max_retries = max_retries;
        }
        if let Some(backoff_ms) = env_number::<u64>("COURIER_RETRY_BACKOFF_MS")? {
            options.retry_backoff_ms = backoff_ms;
        }
        if let Some(spacing_ms) = env_number::<u64>("COURIER_THROTTLE_SPACING_MS")? {
            options.throttle = options
                .throttle
                .spacing(Duration::from_millis(spacing_ms));
        }
        Ok(options)
    }

    pub(crate) fn merge(&self, call: RequestOptions) -> EffectiveOptions {
        let timeout = match call.timeout {
            Some(timeout) => timeout,
            None => self.timeout_ms.map(Duration::from_millis),
        };

        EffectiveOptions {
            timeout,
            retries: call.retries.unwrap_or(self.max_retries),
            retry_delay: call
                .retry_delay
                .unwrap_or(Duration::from_millis(self.retry_backoff_ms)),
            retry_status_codes: call
                .retry_status_codes
                .unwrap_or_else(|| self.retry_status_codes.clone()),
            response_type: call.response_type.unwrap_or(self.response_type),
            validate_status: call
                .validate_status
                .or_else(|| self.validate_status.clone())
                .unwrap_or_else(accept_success),
            cancel_token: call.cancel_token,
            on_upload_progress: call.on_upload_progress,
            on_download_progress: call.on_download_progress,
            params: call.params,
            headers: merge_headers(&self.headers, &call.headers),
        }
    }
}

fn accept_success() -> StatusValidator {
    Arc::new(|status: StatusCode| status.is_success())
}

fn env_number<T: std::str::FromStr>(name: &str) -> std::result::Result<Option<T>, String> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("{name} must be a non-negative integer, got '{value}'")),
        Err(_) => Ok(None),
    }
}

/// Per-call overrides. Unset fields fall back to [`ClientOptions`].
#[derive(Clone, Default)]
pub struct RequestOptions {
    timeout: Option<Option<Duration>>,
    retries: Option<usize>,
    retry_delay: Option<Duration>,
    retry_status_codes: Option<BTreeSet<u16>>,
    response_type: Option<ResponseType>,
    validate_status: Option<StatusValidator>,
    cancel_token: Option<CancelToken>,
    on_upload_progress: Option<ProgressObserver>,
    on_download_progress: Option<ProgressObserver>,
    params: Params,
    headers: HeaderMap,
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .field("retry_status_codes", &self.retry_status_codes)
            .field("response_type", &self.response_type)
            .field("validate_status", &self.validate_status.is_some())
            .field("cancel_token", &self.cancel_token)
            .field("params", &self.params)
            .field("headers", &self.headers)
            .finish()
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(Some(timeout));
        self
    }

    /// Disables the client's default deadline for this call.
    pub fn no_timeout(mut self) -> Self {
        self.timeout = Some(None);
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn retry_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retry_status_codes = Some(codes.into_iter().collect());
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = Some(response_type);
        self
    }

    pub fn validate_status<F>(mut self, validator: F) -> Self
    where
        F: Fn(StatusCode) -> bool + Send + Sync + 'static,
    {
        self.validate_status = Some(Arc::new(validator));
        self
    }

    pub fn cancel_token(mut self, token: &CancelToken) -> Self {
        self.cancel_token = Some(token.clone());
        self
    }

    /// Observes the request body being sent. Progress restarts from zero
    /// on every retried attempt.
    pub fn on_upload_progress<F>(mut self, observer: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.on_upload_progress = Some(Arc::new(observer));
        self
    }

    /// Observes the response body being read. Progress restarts from zero
    /// on every retried attempt; the final `loaded == total` event is only
    /// sent for a response that passed status validation.
    pub fn on_download_progress<F>(mut self, observer: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.on_download_progress = Some(Arc::new(observer));
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push(key, value);
        self
    }

    pub fn params(mut self, params: impl Into<Params>) -> Self {
        self.params.extend(params.into());
        self
    }

    /// Adds a header; invalid names or values are rejected.
    pub fn header(mut self, name: &str, value: &str) -> crate::Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| crate::CourierError::Encode(format!("invalid header name: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| crate::CourierError::Encode(format!("invalid header value: {err}")))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in &headers {
            self.headers.append(name.clone(), value.clone());
        }
        self
    }
}

/// Options after merging client defaults with a call's overrides.
#[derive(Clone)]
pub(crate) struct EffectiveOptions {
    pub(crate) timeout: Option<Duration>,
    pub(crate) retries: usize,
    pub(crate) retry_delay: Duration,
    pub(crate) retry_status_codes: BTreeSet<u16>,
    pub(crate) response_type: ResponseType,
    pub(crate) validate_status: StatusValidator,
    pub(crate) cancel_token: Option<CancelToken>,
    pub(crate) on_upload_progress: Option<ProgressObserver>,
    pub(crate) on_download_progress: Option<ProgressObserver>,
    pub(crate) params: Params,
    pub(crate) headers: HeaderMap,
}

impl EffectiveOptions {
    pub(crate) fn timeout_ms(&self) -> Option<u64> {
        self.timeout
            .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
    }
}
