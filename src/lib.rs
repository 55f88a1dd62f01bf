//! `courier-http` is an async HTTP request pipeline.
//!
//! Each request passes through the same ordered stages:
//! cancellation check, request interceptors, per-host throttle, transport
//! call under a deadline, response interceptors, status validation and
//! response-type-aware decoding. Failures from the transport or status
//! validation are retried with exponential backoff; the terminal error runs
//! through the error interceptors before it is returned.
//!
//! - [`CourierClient::get`] / [`CourierClient::post`] and friends
//! - [`CancelToken`] for shared cancellation
//! - [`Interceptors`] for request/response/error hooks
//! - [`all`] for concurrent fan-out
//!
//! ```no_run
//! use courier_http::{CourierClient, RequestOptions};
//!
//! # async fn run() -> courier_http::Result<()> {
//! let client = CourierClient::new("https://api.example.com")?;
//! let users = client
//!     .get("/users", RequestOptions::new().param("page", 1).param("limit", 10))
//!     .await?;
//! println!("{users:?}");
//! # Ok(())
//! # }
//! ```

mod cancel;
mod client;
mod decode;
mod error;
mod fanout;
mod interceptor;
mod options;
mod params;
mod request;
mod retry;
mod throttle;
mod transport;
mod types;
mod util;

pub use cancel::{CancelToken, ObserverKey, DEFAULT_CANCEL_REASON};
pub use client::CourierClient;
pub use error::{CourierError, ErrorBody, IndexedFailure, TransportError, TransportErrorKind};
pub use fanout::all;
pub use interceptor::{InterceptorHandle, InterceptorKind, Interceptors};
pub use options::{ClientOptions, ProgressObserver, RequestOptions, ResponseType, StatusValidator};
pub use params::Params;
pub use request::{FormPart, MultipartForm, Payload, RequestDescriptor};
pub use throttle::ThrottlePolicy;
pub use transport::{ProgressReporter, ReqwestTransport, SendOptions, Transport, TransportResponse};
pub use types::{Blob, Progress, ResponseData};

pub use reqwest::{header, Method, StatusCode};
pub use url::Url;

/// Outcome of every public operation: exactly one of data or error.
pub type Result<T> = std::result::Result<T, CourierError>;
