use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::{stream, StreamExt};
use http::{header::CONTENT_LENGTH, HeaderMap};

use crate::{Body, BodyStream, BoxError, Request, RequestHead, Response, ResponseHead};

/// Progress callback; receives the event and the head of the instrumented
/// request or response.
pub type StreamHandler<H> = Arc<dyn Fn(&StreamingEvent, &H) + Send + Sync>;

/// Byte-progress notification for one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamingEvent {
    pub chunk: Bytes,
    /// Expected size; raised when more bytes than expected were transferred.
    pub total_bytes: u64,
    pub transferred_bytes: u64,
}

/// Instruments a request body for upload progress.
///
/// Without a `Content-Length` header the body is read once up front to
/// learn its size, then replayed unchanged.
pub async fn instrument_request(
    request: Request,
    on_stream: Option<&StreamHandler<RequestHead>>,
) -> Result<Request, BoxError> {
    let Some(on_stream) = on_stream else {
        return Ok(request);
    };
    if request.body.is_empty() {
        return Ok(request);
    }

    let Request { head, body } = request;
    let (total_bytes, body) = match content_length(&head.headers) {
        Some(length) => (length, body),
        None => measure(body).await?,
    };
    let body = track(body.into_stream(), head.clone(), total_bytes, on_stream.clone());
    Ok(Request::new(head, body))
}

/// Instruments a response body for download progress.
///
/// Response bodies are never pre-read; without a `Content-Length` header the
/// total grows with the transferred bytes.
pub fn instrument_response(
    response: Response,
    on_stream: Option<&StreamHandler<ResponseHead>>,
) -> Response {
    let Some(on_stream) = on_stream else {
        return response;
    };
    if response.body.is_empty() {
        return response;
    }

    let Response { head, body } = response;
    let total_bytes = content_length(&head.headers).unwrap_or(0);
    let body = track(body.into_stream(), head.clone(), total_bytes, on_stream.clone());
    Response { head, body }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|length| *length > 0)
}

async fn measure(body: Body) -> Result<(u64, Body), BoxError> {
    match body {
        Body::Stream(mut stream) => {
            let mut chunks = Vec::new();
            let mut size = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                size += chunk.len() as u64;
                chunks.push(chunk);
            }
            let replay = stream::iter(chunks.into_iter().map(Ok)).boxed();
            Ok((size, Body::Stream(replay)))
        }
        other => Ok((other.size_hint().unwrap_or(0), other)),
    }
}

fn track<H>(inner: BodyStream, head: H, total_bytes: u64, on_stream: StreamHandler<H>) -> Body
where
    H: Send + Unpin + 'static,
{
    let initial = StreamingEvent {
        chunk: Bytes::new(),
        total_bytes,
        transferred_bytes: 0,
    };
    emit(&on_stream, &initial, &head);

    Body::Stream(
        Progress {
            inner,
            head,
            total_bytes,
            transferred_bytes: 0,
            on_stream,
        }
        .boxed(),
    )
}

fn emit<H>(on_stream: &StreamHandler<H>, event: &StreamingEvent, head: &H) {
    if catch_unwind(AssertUnwindSafe(|| on_stream(event, head))).is_err() {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            transferred_bytes = event.transferred_bytes,
            "streaming progress callback panicked"
        );
    }
}

struct Progress<H> {
    inner: BodyStream,
    head: H,
    total_bytes: u64,
    transferred_bytes: u64,
    on_stream: StreamHandler<H>,
}

impl<H: Unpin> Stream for Progress<H> {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.transferred_bytes += chunk.len() as u64;
                this.total_bytes = this.total_bytes.max(this.transferred_bytes);
                let event = StreamingEvent {
                    chunk: chunk.clone(),
                    total_bytes: this.total_bytes,
                    transferred_bytes: this.transferred_bytes,
                };
                emit(&this.on_stream, &event, &this.head);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}
