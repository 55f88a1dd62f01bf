use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use url::Url;

use crate::{
    decode,
    options::EffectiveOptions,
    retry::{AttemptFailure, RetryState, Stage},
    throttle::HostThrottle,
    transport::{ProgressReporter, SendOptions, TransportResponse},
    CancelToken, ClientOptions, CourierError, Interceptors, MultipartForm, Payload,
    RequestDescriptor, RequestOptions, ReqwestTransport, ResponseData, Result, Transport,
};

/// HTTP client running every request through the courier pipeline.
///
/// Clones share the transport, the interceptor chains and the host throttle.
#[derive(Clone)]
pub struct CourierClient {
    transport: Arc<dyn Transport>,
    base_url: Option<Url>,
    options: ClientOptions,
    interceptors: Interceptors,
    throttle: Arc<HostThrottle>,
}

impl fmt::Debug for CourierClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CourierClient")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("options", &self.options)
            .field("interceptors", &self.interceptors)
            .field("transport", &self.transport)
            .finish()
    }
}

impl CourierClient {
    /// Creates a client resolving relative endpoints against `base_url`.
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        let raw = base_url.as_ref().trim();
        let base = Url::parse(raw).map_err(|err| CourierError::InvalidUrl {
            url: raw.to_owned(),
            message: err.to_string(),
        })?;
        if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
            return Err(CourierError::InvalidUrl {
                url: raw.to_owned(),
                message: "base url must be an absolute http(s) url".to_owned(),
            });
        }
        Ok(Self::build(Some(base)))
    }

    /// Creates a client that only accepts absolute endpoints.
    pub fn without_base_url() -> Self {
        Self::build(None)
    }

    /// Creates a client from environment variables.
    ///
    /// Reads `COURIER_BASE_URL` (required) plus the optional variables
    /// documented on [`ClientOptions::from_env`].
    pub fn from_env() -> std::result::Result<Self, String> {
        let base_url = std::env::var("COURIER_BASE_URL")
            .map_err(|_| "missing COURIER_BASE_URL environment variable".to_owned())?;
        if base_url.trim().is_empty() {
            return Err("COURIER_BASE_URL is set but empty".to_owned());
        }
        let options = ClientOptions::from_env()?;
        let client = Self::new(&base_url).map_err(|err| err.to_string())?;
        Ok(client.with_options(options))
    }

    fn build(base_url: Option<Url>) -> Self {
        let options = ClientOptions::default();
        Self {
            transport: Arc::new(ReqwestTransport::new()),
            base_url,
            throttle: Arc::new(HostThrottle::new(options.throttle.clone())),
            options,
            interceptors: Interceptors::new(),
        }
    }

    /// Applies client-wide defaults. Resets the host throttle state.
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.throttle = Arc::new(HostThrottle::new(options.throttle.clone()));
        self.options = options;
        self
    }

    /// Replaces the transport the pipeline dispatches through.
    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    pub fn client_options(&self) -> &ClientOptions {
        &self.options
    }

    /// Interceptor chains applied to every request of this client.
    pub fn interceptors(&self) -> &Interceptors {
        &self.interceptors
    }

    pub async fn get(&self, endpoint: &str, options: RequestOptions) -> Result<ResponseData> {
        self.request(Method::GET, endpoint, None, options).await
    }

    pub async fn head(&self, endpoint: &str, options: RequestOptions) -> Result<ResponseData> {
        self.request(Method::HEAD, endpoint, None, options).await
    }

    pub async fn options(&self, endpoint: &str, options: RequestOptions) -> Result<ResponseData> {
        self.request(Method::OPTIONS, endpoint, None, options).await
    }

    pub async fn delete(&self, endpoint: &str, options: RequestOptions) -> Result<ResponseData> {
        self.request(Method::DELETE, endpoint, None, options).await
    }

    pub async fn post(
        &self,
        endpoint: &str,
        body: impl Into<Option<Payload>>,
        options: RequestOptions,
    ) -> Result<ResponseData> {
        self.request(Method::POST, endpoint, body.into(), options).await
    }

    pub async fn put(
        &self,
        endpoint: &str,
        body: impl Into<Option<Payload>>,
        options: RequestOptions,
    ) -> Result<ResponseData> {
        self.request(Method::PUT, endpoint, body.into(), options).await
    }

    pub async fn patch(
        &self,
        endpoint: &str,
        body: impl Into<Option<Payload>>,
        options: RequestOptions,
    ) -> Result<ResponseData> {
        self.request(Method::PATCH, endpoint, body.into(), options).await
    }

    /// Sends `form` as `multipart/form-data`.
    pub async fn post_form(
        &self,
        endpoint: &str,
        form: MultipartForm,
        options: RequestOptions,
    ) -> Result<ResponseData> {
        self.post(endpoint, Payload::Multipart(form), options).await
    }

    /// Sends `value` as `application/x-www-form-urlencoded`.
    pub async fn post_url_encoded<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        value: &T,
        options: RequestOptions,
    ) -> Result<ResponseData> {
        let payload = match Payload::url_encoded(value) {
            Ok(payload) => payload,
            Err(err) => return Err(self.interceptors.apply_error(err).await),
        };
        self.post(endpoint, payload, options).await
    }

    /// Runs `requests` concurrently; see [`crate::all`].
    pub async fn all<T, I, F>(&self, requests: I) -> Result<Vec<T>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T>>,
    {
        crate::fanout::all(requests).await
    }

    /// Runs one logical request through the pipeline.
    ///
    /// Failures from transport and status validation are retried per the
    /// effective retry budget; the terminal error passes through the error
    /// interceptors before it is returned.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Payload>,
        options: RequestOptions,
    ) -> Result<ResponseData> {
        let effective = self.options.merge(options);
        match self
            .run_with_retry(&method, endpoint, body.as_ref(), &effective)
            .await
        {
            Ok(data) => Ok(data),
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%method, endpoint, error = %err, "request failed");
                Err(self.interceptors.apply_error(err).await)
            }
        }
    }

    async fn run_with_retry(
        &self,
        method: &Method,
        endpoint: &str,
        body: Option<&Payload>,
        effective: &EffectiveOptions,
    ) -> Result<ResponseData> {
        let mut retry = RetryState::new(effective.retries, effective.retry_delay);
        loop {
            let failure = match self.run_attempt(method, endpoint, body, effective).await {
                Ok(data) => return Ok(data),
                Err(failure) => failure,
            };

            let Some(delay) = retry.next_delay(&failure, &effective.retry_status_codes) else {
                return Err(failure.error);
            };

            #[cfg(feature = "tracing")]
            tracing::debug!(
                %method,
                endpoint,
                stage = %failure.stage,
                retry = retry.consumed(),
                delay_ms = delay.as_millis() as u64,
                error = %failure.error,
                "retrying request"
            );

            self.wait_before_retry(delay, effective.cancel_token.as_ref())
                .await?;
        }
    }

    /// One pass through the pipeline stages.
    async fn run_attempt(
        &self,
        method: &Method,
        endpoint: &str,
        body: Option<&Payload>,
        effective: &EffectiveOptions,
    ) -> std::result::Result<ResponseData, AttemptFailure> {
        let url = crate::request::resolve_url(self.base_url.as_ref(), endpoint, &effective.params)
            .map_err(AttemptFailure::at(Stage::Building))?;
        if let Some(token) = &effective.cancel_token {
            token
                .error_if_cancelled()
                .map_err(AttemptFailure::at(Stage::Building))?;
        }
        let descriptor = RequestDescriptor {
            method: method.clone(),
            url,
            headers: effective.headers.clone(),
            body: body.cloned(),
        };

        let descriptor = self
            .interceptors
            .apply_request(descriptor)
            .await
            .map_err(AttemptFailure::at(Stage::RequestInterceptors))?;

        self.pass_throttle(&descriptor, effective.cancel_token.as_ref())
            .await
            .map_err(AttemptFailure::at(Stage::Throttle))?;

        let download = effective
            .on_download_progress
            .clone()
            .map(ProgressReporter::new);
        let response = self
            .dispatch(descriptor, effective, download.clone())
            .await
            .map_err(AttemptFailure::at(Stage::Executing))?;

        let response = self
            .interceptors
            .apply_response(response)
            .await
            .map_err(AttemptFailure::at(Stage::ResponseInterceptors))?;

        if !(effective.validate_status)(response.status) {
            return Err(AttemptFailure {
                stage: Stage::Validating,
                error: decode::status_error(&response),
            });
        }
        if let Some(download) = &download {
            download.complete(response.body.len() as u64);
        }

        let form_data_supported = self.transport.supports(effective.response_type);
        decode::decode_body(&response, effective.response_type, form_data_supported)
            .map_err(AttemptFailure::at(Stage::Decoding))
    }

    async fn pass_throttle(
        &self,
        descriptor: &RequestDescriptor,
        cancel_token: Option<&CancelToken>,
    ) -> Result<()> {
        let Some(host) = descriptor.host_key() else {
            return Ok(());
        };
        let gate = self.throttle.acquire(&descriptor.method, &host);
        match cancel_token {
            Some(token) => tokio::select! {
                reason = token.cancelled() => Err(CourierError::Cancelled { reason }),
                _ = gate => Ok(()),
            },
            None => {
                gate.await;
                Ok(())
            }
        }
    }

    /// Sends through the transport under the deadline, racing the cancel
    /// token. Losing the race drops the transport future, aborting the call.
    async fn dispatch(
        &self,
        descriptor: RequestDescriptor,
        effective: &EffectiveOptions,
        download: Option<ProgressReporter>,
    ) -> Result<TransportResponse> {
        if let Some(token) = &effective.cancel_token {
            token.error_if_cancelled()?;
        }

        let method = descriptor.method.clone();
        let url = descriptor.url.to_string();
        let upload_total = descriptor.body.as_ref().map_or(0, Payload::len);
        let upload = effective
            .on_upload_progress
            .clone()
            .map(ProgressReporter::new);

        #[cfg(feature = "tracing")]
        tracing::trace!(%method, url = %url, "dispatching request");

        let send = self.transport.send(
            descriptor,
            SendOptions {
                deadline: effective.timeout,
                upload: upload.clone(),
                download,
            },
        );
        let timed = async {
            let result = match effective.timeout {
                Some(deadline) => match tokio::time::timeout(deadline, send).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(CourierError::Timeout {
                            method: method.clone(),
                            url: url.clone(),
                            timeout_ms: effective.timeout_ms().unwrap_or_default(),
                        })
                    }
                },
                None => send.await,
            };
            result.map_err(|err| {
                CourierError::from_transport(err, &method, &url, effective.timeout_ms())
            })
        };

        let response = match &effective.cancel_token {
            Some(token) => tokio::select! {
                reason = token.cancelled() => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(%method, url = %url, reason = %reason, "aborting in-flight request");
                    Err(CourierError::Cancelled { reason })
                }
                result = timed => result,
            },
            None => timed.await,
        }?;

        if let Some(upload) = &upload {
            upload.complete(upload_total);
        }
        Ok(response)
    }

    /// Waits out the retry backoff. A cancel token firing during the wait
    /// ends the request.
    async fn wait_before_retry(
        &self,
        delay: Duration,
        cancel_token: Option<&CancelToken>,
    ) -> Result<()> {
        let sleep = tokio::time::sleep(delay);
        match cancel_token {
            Some(token) => tokio::select! {
                reason = token.cancelled() => Err(CourierError::Cancelled { reason }),
                _ = sleep => Ok(()),
            },
            None => {
                sleep.await;
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_throttle_hosts(&self) -> usize {
        self.throttle.tracked_hosts()
    }
}
