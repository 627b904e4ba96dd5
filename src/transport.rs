use std::{fmt, future::Future, marker::PhantomData, time::Duration};

use async_trait::async_trait;
use http::{HeaderMap, Method};

use crate::{AbortSignal, BoxError, Request, Response};

/// Per-attempt settings handed to the transport next to the request.
///
/// The body is never part of it; the request carries the body and the final
/// headers.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
    /// Composed signal for this attempt. Transports should stop work when it
    /// fires; the caller stops waiting either way.
    pub signal: Option<AbortSignal>,
}

/// Sends one request and returns the response head with a streaming body.
///
/// `Context` is an opaque per-call value threaded from
/// [`crate::Fetcher::execute_with_context`].
#[async_trait]
pub trait Transport: Send + Sync {
    type Context: Send + Sync;

    async fn send(
        &self,
        request: Request,
        options: TransportOptions,
        ctx: Option<&Self::Context>,
    ) -> Result<Response, BoxError>;
}

/// [`Transport`] backed by a closure.
pub struct FnTransport<F, C = ()> {
    send: F,
    _context: PhantomData<fn(&C)>,
}

/// Wraps a closure as a [`Transport`].
///
/// The returned future must be `'static`; clone anything needed from the
/// context before the first `.await`.
pub fn transport_fn<C, F, Fut>(send: F) -> FnTransport<F, C>
where
    F: Fn(Request, TransportOptions, Option<&C>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, BoxError>> + Send + 'static,
{
    FnTransport {
        send,
        _context: PhantomData,
    }
}

#[async_trait]
impl<C, F, Fut> Transport for FnTransport<F, C>
where
    C: Send + Sync,
    F: Fn(Request, TransportOptions, Option<&C>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, BoxError>> + Send + 'static,
{
    type Context = C;

    async fn send(
        &self,
        request: Request,
        options: TransportOptions,
        ctx: Option<&C>,
    ) -> Result<Response, BoxError> {
        (self.send)(request, options, ctx).await
    }
}

impl<F, C> fmt::Debug for FnTransport<F, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnTransport(..)")
    }
}

#[cfg(feature = "reqwest")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest")]
mod reqwest_transport {
    use async_trait::async_trait;

    use super::{Transport, TransportOptions};
    use crate::{Body, BoxError, Request, Response};

    /// [`Transport`] over a shared `reqwest::Client`.
    ///
    /// Request and response bodies are streamed.
    #[derive(Clone, Debug, Default)]
    pub struct ReqwestTransport {
        http: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Uses a preconfigured client (proxies, TLS roots, pools).
        pub fn with_client(http: reqwest::Client) -> Self {
            Self { http }
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        type Context = ();

        async fn send(
            &self,
            request: Request,
            // the attempt timeout is enforced by the caller through the signal
            _options: TransportOptions,
            _ctx: Option<&()>,
        ) -> Result<Response, BoxError> {
            let Request { head, body } = request;
            let builder = self.http.request(head.method, &head.url).headers(head.headers);
            let builder = match body {
                Body::Empty => builder,
                Body::Full(bytes) => builder.body(bytes),
                Body::Stream(stream) => builder.body(reqwest::Body::wrap_stream(stream)),
            };

            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let url = response.url().to_string();

            #[cfg(feature = "tracing")]
            tracing::debug!(status = status.as_u16(), url = %url, "reqwest transport response");

            let body = Body::from_stream(response.bytes_stream());
            Ok(Response::new(status, headers, body).with_url(url))
        }
    }
}
