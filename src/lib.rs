//! `fetchline` drives HTTP calls through an injected transport.
//!
//! A call goes through one pipeline:
//! - layered options ([`FetchOptions`]) are merged into one configuration
//! - the target URL and query string are resolved ([`resolve_url`])
//! - each attempt gets a fresh cancellation scope ([`with_timeout`])
//! - the transport is invoked, bodies are instrumented for progress
//! - the response is classified, parsed, validated, or retried
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use fetchline::{FetchOptions, Fetcher, ReqwestTransport, RetryOptions};
//!
//! # async fn run() -> fetchline::Result<()> {
//! let api = Fetcher::new(ReqwestTransport::new()).with_defaults(
//!     FetchOptions::new()
//!         .base_url("https://api.example.com/v1")
//!         .timeout(Duration::from_secs(5))
//!         .retry(RetryOptions::new().attempts(2).delay(Duration::from_millis(200))),
//! );
//!
//! let user = api
//!     .execute("/users/42", FetchOptions::new().param("expand", "teams"))
//!     .await?;
//! println!("{user}");
//! # Ok(())
//! # }
//! ```

mod body;
mod client;
mod error;
mod machine;
mod options;
mod params;
mod request;
mod resolve;
mod retry;
mod schema;
mod signal;
mod streaming;
mod transport;
mod types;

pub use body::{Body, BodyStream};
pub use client::{DefaultOptionsFn, Fetcher};
pub use error::{BoxError, FetchError, RejectedResponse, ValidationError};
pub use machine::RequestState;
pub use options::{
    EventHandlers, FetchOptions, OnError, OnRequest, OnRetry, OnSuccess, ParseRejected,
    ParseResponse, Reject, RequestBody, SerializeBody, SerializeParams,
};
pub use params::{serialize_params_default, Params};
pub use resolve::{resolve_url, Input};
pub use retry::{Attempts, Delay, RetryContext, RetryOptions, When};
pub use schema::{schema_fn, FnSchema, Issue, Schema};
pub use signal::{abortable_delay, with_timeout, AbortController, AbortReason, AbortSignal};
pub use streaming::{instrument_request, instrument_response, StreamHandler, StreamingEvent};
pub use transport::{transport_fn, FnTransport, Transport, TransportOptions};
pub use types::{Request, RequestHead, Response, ResponseHead};

#[cfg(feature = "reqwest")]
pub use transport::ReqwestTransport;

pub type Result<T> = std::result::Result<T, FetchError>;
