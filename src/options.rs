use std::{
    fmt,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::{future::BoxFuture, StreamExt, TryStreamExt};
use http::{header::IntoHeaderName, HeaderMap, HeaderValue, Method};
use serde_json::Value;

use crate::{
    error::RejectedResponse, retry::RetryPolicy, serialize_params_default, AbortSignal, BodyStream,
    BoxError, FetchError, Params, RequestHead, Response, ResponseHead, RetryContext, RetryOptions,
    Schema, StreamHandler,
};

pub type SerializeBody = Arc<dyn Fn(&Value) -> Result<Bytes, BoxError> + Send + Sync>;
pub type SerializeParams = Arc<dyn Fn(&Params) -> String + Send + Sync>;
pub type ParseResponse =
    Arc<dyn Fn(Response, RequestHead) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;
pub type ParseRejected =
    Arc<dyn Fn(Response, RequestHead) -> BoxFuture<'static, FetchError> + Send + Sync>;
pub type Reject = Arc<dyn Fn(&ResponseHead) -> bool + Send + Sync>;

pub type OnRequest = Arc<dyn Fn(&RequestHead) + Send + Sync>;
pub type OnRetry = Arc<dyn Fn(&RetryContext<'_>) + Send + Sync>;
pub type OnSuccess = Arc<dyn Fn(&Value, &RequestHead) + Send + Sync>;
pub type OnError = Arc<dyn Fn(&FetchError, Option<&RequestHead>) + Send + Sync>;

/// Payload configured on [`FetchOptions`].
#[derive(Clone)]
pub enum RequestBody {
    /// Serialized with `serialize_body`; adds `Content-Type: application/json`.
    Json(Value),
    /// Sent as-is.
    Raw(Bytes),
    /// Sent as-is; can be transmitted once, so a retry of a streamed body
    /// fails to build.
    Stream(Arc<Mutex<Option<BodyStream>>>),
}

impl RequestBody {
    pub fn stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let stream = stream.map_err(Into::<BoxError>::into).boxed();
        Self::Stream(Arc::new(Mutex::new(Some(stream))))
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Raw(bytes) => f.debug_tuple("Raw").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Lifecycle callbacks.
///
/// When both the default and call layers set the same callback, the merged
/// callback runs the default one first, then the call one.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub on_request: Option<OnRequest>,
    pub on_retry: Option<OnRetry>,
    pub on_success: Option<OnSuccess>,
    pub on_error: Option<OnError>,
    pub on_request_streaming: Option<StreamHandler<RequestHead>>,
    pub on_response_streaming: Option<StreamHandler<ResponseHead>>,
}

impl EventHandlers {
    pub(crate) fn chain(&self, later: &EventHandlers) -> EventHandlers {
        EventHandlers {
            on_request: chain(&self.on_request, &later.on_request, |first, second| {
                let chained: OnRequest = Arc::new(move |request: &RequestHead| {
                    first(request);
                    second(request);
                });
                chained
            }),
            on_retry: chain(&self.on_retry, &later.on_retry, |first, second| {
                let chained: OnRetry = Arc::new(move |ctx: &RetryContext<'_>| {
                    first(ctx);
                    second(ctx);
                });
                chained
            }),
            on_success: chain(&self.on_success, &later.on_success, |first, second| {
                let chained: OnSuccess = Arc::new(move |data: &Value, request: &RequestHead| {
                    first(data, request);
                    second(data, request);
                });
                chained
            }),
            on_error: chain(&self.on_error, &later.on_error, |first, second| {
                let chained: OnError =
                    Arc::new(move |error: &FetchError, request: Option<&RequestHead>| {
                        first(error, request);
                        second(error, request);
                    });
                chained
            }),
            on_request_streaming: chain(
                &self.on_request_streaming,
                &later.on_request_streaming,
                |first, second| {
                    let chained: StreamHandler<RequestHead> =
                        Arc::new(move |event: &crate::StreamingEvent, request: &RequestHead| {
                            first(event, request);
                            second(event, request);
                        });
                    chained
                },
            ),
            on_response_streaming: chain(
                &self.on_response_streaming,
                &later.on_response_streaming,
                |first, second| {
                    let chained: StreamHandler<ResponseHead> =
                        Arc::new(move |event: &crate::StreamingEvent, response: &ResponseHead| {
                            first(event, response);
                            second(event, response);
                        });
                    chained
                },
            ),
        }
    }
}

fn chain<T: ?Sized>(
    first: &Option<Arc<T>>,
    second: &Option<Arc<T>>,
    join: impl FnOnce(Arc<T>, Arc<T>) -> Arc<T>,
) -> Option<Arc<T>> {
    match (first, second) {
        (Some(first), Some(second)) => Some(join(first.clone(), second.clone())),
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (None, None) => None,
    }
}

/// Runs a lifecycle callback; a panicking callback is logged and ignored.
pub(crate) fn notify(name: &'static str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        #[cfg(feature = "tracing")]
        tracing::warn!(callback = name, "event handler panicked");
        #[cfg(not(feature = "tracing"))]
        let _ = name;
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_request", &self.on_request.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_request_streaming", &self.on_request_streaming.is_some())
            .field("on_response_streaming", &self.on_response_streaming.is_some())
            .finish()
    }
}

/// One layer of configuration.
///
/// The same type is used for caller-level defaults and for per-call options.
/// Unset fields fall through to the layer below; see [`crate::Fetcher`].
#[derive(Clone, Default)]
pub struct FetchOptions {
    pub base_url: Option<String>,
    pub method: Option<Method>,
    pub headers: Option<HeaderMap>,
    pub params: Option<Params>,
    pub body: Option<RequestBody>,
    pub serialize_body: Option<SerializeBody>,
    pub serialize_params: Option<SerializeParams>,
    pub parse_response: Option<ParseResponse>,
    pub parse_rejected: Option<ParseRejected>,
    pub reject: Option<Reject>,
    pub retry: RetryOptions,
    /// Per-attempt timeout; zero disables it.
    pub timeout: Option<Duration>,
    pub signal: Option<AbortSignal>,
    pub schema: Option<Arc<dyn Schema>>,
    pub on: EventHandlers,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads defaults from the environment.
    ///
    /// Reads:
    /// - `FETCHLINE_BASE_URL`: base URL for relative inputs
    /// - `FETCHLINE_TIMEOUT_MS`: per-attempt timeout (optional)
    pub fn from_env() -> std::result::Result<Self, String> {
        let base_url = std::env::var("FETCHLINE_BASE_URL")
            .map_err(|_| "missing FETCHLINE_BASE_URL environment variable".to_owned())?;
        if base_url.trim().is_empty() {
            return Err("FETCHLINE_BASE_URL is set but empty".to_owned());
        }

        let mut options = Self::new().base_url(base_url.trim());
        if let Ok(timeout) = std::env::var("FETCHLINE_TIMEOUT_MS") {
            let millis = timeout
                .trim()
                .parse::<u64>()
                .map_err(|_| format!("FETCHLINE_TIMEOUT_MS is not a number: {timeout}"))?;
            options = options.timeout(Duration::from_millis(millis));
        }
        Ok(options)
    }

    /// Base URL that relative inputs are joined onto.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// HTTP method; `GET` when no layer sets one.
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Adds one header to this layer's header map.
    pub fn header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.headers
            .get_or_insert_with(HeaderMap::new)
            .insert(name, value);
        self
    }

    /// Replaces this layer's headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Adds one query parameter. `null` values are skipped when serialized.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params
            .get_or_insert_with(Params::new)
            .insert(key.into(), value.into());
        self
    }

    /// Replaces this layer's query parameters.
    pub fn params(mut self, params: Params) -> Self {
        self.params = Some(params);
        self
    }

    /// JSON request body, serialized with `serialize_body`.
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    /// Raw request body, sent as-is.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(RequestBody::Raw(body.into()));
        self
    }

    /// Streamed request body.
    ///
    /// A stream can be sent once; a retry that needs it again fails to build.
    pub fn body_stream(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Overrides how JSON bodies are turned into bytes.
    pub fn serialize_body<F>(mut self, serialize: F) -> Self
    where
        F: Fn(&Value) -> Result<Bytes, BoxError> + Send + Sync + 'static,
    {
        self.serialize_body = Some(Arc::new(serialize));
        self
    }

    /// Overrides how query parameters are turned into a query string.
    pub fn serialize_params<F>(mut self, serialize: F) -> Self
    where
        F: Fn(&Params) -> String + Send + Sync + 'static,
    {
        self.serialize_params = Some(Arc::new(serialize));
        self
    }

    /// Decodes a successful response body.
    pub fn parse_response<F, Fut>(mut self, parse: F) -> Self
    where
        F: Fn(Response, RequestHead) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.parse_response = Some(Arc::new(
            move |response: Response,
                  request: RequestHead|
                  -> BoxFuture<'static, Result<Value, BoxError>> {
                Box::pin(parse(response, request))
            },
        ));
        self
    }

    /// Builds the error for a response that failed `reject`.
    pub fn parse_rejected<F, Fut>(mut self, parse: F) -> Self
    where
        F: Fn(Response, RequestHead) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchError> + Send + 'static,
    {
        self.parse_rejected = Some(Arc::new(
            move |response: Response, request: RequestHead| -> BoxFuture<'static, FetchError> {
                Box::pin(parse(response, request))
            },
        ));
        self
    }

    /// Predicate deciding which responses are rejected; defaults to non-2xx.
    pub fn reject<F>(mut self, reject: F) -> Self
    where
        F: Fn(&ResponseHead) -> bool + Send + Sync + 'static,
    {
        self.reject = Some(Arc::new(reject));
        self
    }

    pub fn retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Per-attempt timeout. Each retry gets a fresh deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Caller signal cancelling the whole call, including retry delays.
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Validates parsed data before it is returned.
    pub fn schema(mut self, schema: impl Schema + 'static) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    /// Called once with the first request built.
    pub fn on_request<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RequestHead) + Send + Sync + 'static,
    {
        self.on.on_request = Some(Arc::new(handler));
        self
    }

    /// Called before each retry, after the delay.
    pub fn on_retry<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RetryContext<'_>) + Send + Sync + 'static,
    {
        self.on.on_retry = Some(Arc::new(handler));
        self
    }

    pub fn on_success<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Value, &RequestHead) + Send + Sync + 'static,
    {
        self.on.on_success = Some(Arc::new(handler));
        self
    }

    /// Called once when the call fails, with the request when one was built.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&FetchError, Option<&RequestHead>) + Send + Sync + 'static,
    {
        self.on.on_error = Some(Arc::new(handler));
        self
    }

    /// Upload progress. Bodies without `Content-Length` are read ahead to size them.
    pub fn on_request_streaming<F>(mut self, handler: F) -> Self
    where
        F: Fn(&crate::StreamingEvent, &RequestHead) + Send + Sync + 'static,
    {
        self.on.on_request_streaming = Some(Arc::new(handler));
        self
    }

    /// Download progress.
    pub fn on_response_streaming<F>(mut self, handler: F) -> Self
    where
        F: Fn(&crate::StreamingEvent, &ResponseHead) + Send + Sync + 'static,
    {
        self.on.on_response_streaming = Some(Arc::new(handler));
        self
    }

    /// Built-in bottom layer.
    pub(crate) fn fallback() -> Self {
        Self {
            serialize_body: Some(default_serialize_body()),
            serialize_params: Some(default_serialize_params()),
            parse_response: Some(default_parse_response()),
            parse_rejected: Some(default_parse_rejected()),
            reject: Some(default_reject()),
            retry: RetryOptions::fallback(),
            ..Self::default()
        }
    }

    /// Overlays `later` on top of `self`.
    ///
    /// Plain fields are replaced when set in `later`. `retry` is merged
    /// field by field and event handlers are chained.
    pub(crate) fn overlay(&self, later: &FetchOptions) -> FetchOptions {
        FetchOptions {
            base_url: later.base_url.clone().or_else(|| self.base_url.clone()),
            method: later.method.clone().or_else(|| self.method.clone()),
            headers: later.headers.clone().or_else(|| self.headers.clone()),
            params: later.params.clone().or_else(|| self.params.clone()),
            body: later.body.clone().or_else(|| self.body.clone()),
            serialize_body: later
                .serialize_body
                .clone()
                .or_else(|| self.serialize_body.clone()),
            serialize_params: later
                .serialize_params
                .clone()
                .or_else(|| self.serialize_params.clone()),
            parse_response: later
                .parse_response
                .clone()
                .or_else(|| self.parse_response.clone()),
            parse_rejected: later
                .parse_rejected
                .clone()
                .or_else(|| self.parse_rejected.clone()),
            reject: later.reject.clone().or_else(|| self.reject.clone()),
            retry: self.retry.overlay(&later.retry),
            timeout: later.timeout.or(self.timeout),
            signal: later.signal.clone().or_else(|| self.signal.clone()),
            schema: later.schema.clone().or_else(|| self.schema.clone()),
            on: self.on.chain(&later.on),
        }
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("base_url", &self.base_url)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("params", &self.params)
            .field("body", &self.body)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("signal", &self.signal.is_some())
            .field("schema", &self.schema.is_some())
            .field("on", &self.on)
            .finish_non_exhaustive()
    }
}

/// Configuration for one call after all layers were applied.
pub(crate) struct MergedOptions {
    pub base_url: Option<String>,
    pub method: Option<Method>,
    pub headers: Option<HeaderMap>,
    pub default_params: Option<Params>,
    pub call_params: Option<Params>,
    pub body: Option<RequestBody>,
    pub serialize_body: SerializeBody,
    pub serialize_params: SerializeParams,
    pub parse_response: ParseResponse,
    pub parse_rejected: ParseRejected,
    pub reject: Reject,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub signal: Option<AbortSignal>,
    pub schema: Option<Arc<dyn Schema>>,
    pub on: EventHandlers,
}

/// Merges fallback, caller defaults, call options and an empty top layer.
///
/// Query params are kept per layer because the URL resolver treats default
/// and call params differently.
pub(crate) fn resolve_options(defaults: &FetchOptions, call: &FetchOptions) -> MergedOptions {
    let merged = [defaults, call, &FetchOptions::default()]
        .into_iter()
        .fold(FetchOptions::fallback(), |merged, layer| merged.overlay(layer));

    MergedOptions {
        base_url: merged.base_url,
        method: merged.method,
        headers: merged.headers,
        default_params: defaults.params.clone(),
        call_params: call.params.clone(),
        body: merged.body,
        serialize_body: merged.serialize_body.unwrap_or_else(default_serialize_body),
        serialize_params: merged
            .serialize_params
            .unwrap_or_else(default_serialize_params),
        parse_response: merged.parse_response.unwrap_or_else(default_parse_response),
        parse_rejected: merged.parse_rejected.unwrap_or_else(default_parse_rejected),
        reject: merged.reject.unwrap_or_else(default_reject),
        retry: merged.retry.into_policy(),
        timeout: merged.timeout,
        signal: merged.signal,
        schema: merged.schema,
        on: merged.on,
    }
}

fn default_serialize_body() -> SerializeBody {
    Arc::new(|body: &Value| -> Result<Bytes, BoxError> { Ok(serde_json::to_vec(body)?.into()) })
}

fn default_serialize_params() -> SerializeParams {
    Arc::new(serialize_params_default)
}

fn default_parse_response() -> ParseResponse {
    Arc::new(
        |response: Response, _request: RequestHead| -> BoxFuture<'static, Result<Value, BoxError>> {
            Box::pin(parse_json(response))
        },
    )
}

fn default_parse_rejected() -> ParseRejected {
    Arc::new(
        |response: Response, request: RequestHead| -> BoxFuture<'static, FetchError> {
            Box::pin(reject_with_status(response, request))
        },
    )
}

fn default_reject() -> Reject {
    Arc::new(|response: &ResponseHead| !response.is_success())
}

/// Strict JSON decoding of the response text.
async fn parse_json(response: Response) -> Result<Value, BoxError> {
    let text = response.text().await?;
    Ok(serde_json::from_str(&text)?)
}

/// Default rejection: status, status text and the body decoded as JSON,
/// falling back to text, or `null` when empty or unreadable.
async fn reject_with_status(response: Response, request: RequestHead) -> FetchError {
    let Response { head, body } = response;
    let data = match body.collect().await {
        Ok(bytes) if bytes.is_empty() => Value::Null,
        Ok(bytes) => serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
        Err(_) => Value::Null,
    };

    FetchError::Rejected(Box::new(RejectedResponse {
        status: head.status,
        status_text: head.status_text().to_owned(),
        headers: head.headers,
        url: head.url,
        data,
        request,
    }))
}
