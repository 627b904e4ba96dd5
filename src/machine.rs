use std::{fmt, future::Future, time::Duration};

use serde_json::Value;

use crate::{
    options::{notify, MergedOptions},
    request::{build_head, build_request, PreparedBody},
    retry::RetryVerdict,
    schema, signal, streaming, AbortSignal, FetchError, Input, Request, RequestHead,
    Response, ResponseHead, RetryContext, Transport, TransportOptions,
};

/// Steps of one logical call.
///
/// `RequestSuccess`, `RequestFailed`, `ParseError` and `ValidationError` are
/// terminal. `NetworkError` and `ResponseRejected` always lead to
/// `EvaluatingRetry`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestState {
    Initializing,
    PreparingRequest,
    SendingRequest,
    ResponseReceived,
    CheckingResponse,
    ParsingResponse,
    ValidatingSchema,
    EvaluatingRetry,
    DelayingRetry,
    RequestSuccess,
    RequestFailed,
    ParseError,
    ValidationError,
    NetworkError,
    ResponseRejected,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::RequestSuccess | Self::RequestFailed | Self::ParseError | Self::ValidationError
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "INITIALIZING",
            Self::PreparingRequest => "PREPARING_REQUEST",
            Self::SendingRequest => "SENDING_REQUEST",
            Self::ResponseReceived => "RESPONSE_RECEIVED",
            Self::CheckingResponse => "CHECKING_RESPONSE",
            Self::ParsingResponse => "PARSING_RESPONSE",
            Self::ValidatingSchema => "VALIDATING_SCHEMA",
            Self::EvaluatingRetry => "EVALUATING_RETRY",
            Self::DelayingRetry => "DELAYING_RETRY",
            Self::RequestSuccess => "REQUEST_SUCCESS",
            Self::RequestFailed => "REQUEST_FAILED",
            Self::ParseError => "PARSE_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ResponseRejected => "RESPONSE_REJECTED",
        };
        f.write_str(name)
    }
}

/// Mutable state of one call, owned by the machine driving it.
struct RequestContext<'a, C> {
    input: Input,
    options: MergedOptions,
    body: PreparedBody,
    ctx: Option<&'a C>,
    attempt: u32,
    max_attempts: u32,
    /// Composed signal of the current attempt.
    signal: Option<AbortSignal>,
    retry_delay: Duration,
    request: Option<RequestHead>,
    outgoing: Option<Request>,
    response: Option<Response>,
    response_head: Option<ResponseHead>,
    error: Option<FetchError>,
    parsed: Option<Value>,
    validated: Option<Value>,
    request_announced: bool,
}

/// Successful outcome of a call.
pub(crate) struct Completed {
    pub data: Value,
    pub request: RequestHead,
}

pub(crate) struct RequestMachine<'a, T: Transport> {
    transport: &'a T,
    cx: RequestContext<'a, T::Context>,
}

impl<'a, T: Transport> RequestMachine<'a, T> {
    pub(crate) fn new(
        transport: &'a T,
        input: Input,
        options: MergedOptions,
        body: PreparedBody,
        ctx: Option<&'a T::Context>,
    ) -> Self {
        Self {
            transport,
            cx: RequestContext {
                input,
                options,
                body,
                ctx,
                attempt: 0,
                max_attempts: 0,
                signal: None,
                retry_delay: Duration::ZERO,
                request: None,
                outgoing: None,
                response: None,
                response_head: None,
                error: None,
                parsed: None,
                validated: None,
                request_announced: false,
            },
        }
    }

    /// Drives the call to a terminal state and fires `on_success` or
    /// `on_error` exactly once.
    pub(crate) async fn run(mut self) -> Result<Completed, FetchError> {
        let mut state = RequestState::Initializing;
        while !state.is_terminal() {
            let next = self.step(state).await;
            #[cfg(feature = "tracing")]
            tracing::trace!(from = %state, to = %next, attempt = self.cx.attempt, "request state");
            state = next;
        }
        self.finish(state)
    }

    async fn step(&mut self, state: RequestState) -> RequestState {
        match state {
            RequestState::Initializing => {
                self.cx.attempt = 0;
                self.cx.max_attempts = 0;
                RequestState::PreparingRequest
            }
            RequestState::PreparingRequest => self.prepare().await,
            RequestState::SendingRequest => self.send().await,
            RequestState::ResponseReceived => RequestState::CheckingResponse,
            RequestState::CheckingResponse => self.check(),
            RequestState::ParsingResponse => self.parse().await,
            RequestState::ValidatingSchema => self.validate().await,
            RequestState::ResponseRejected => self.reject().await,
            RequestState::NetworkError => RequestState::EvaluatingRetry,
            RequestState::EvaluatingRetry => self.evaluate_retry().await,
            RequestState::DelayingRetry => self.delay_retry().await,
            terminal => terminal,
        }
    }

    async fn prepare(&mut self) -> RequestState {
        let cx = &mut self.cx;
        cx.response = None;
        cx.response_head = None;
        cx.error = None;
        cx.parsed = None;
        cx.signal = signal::with_timeout(cx.options.signal.as_ref(), cx.options.timeout);

        let head = build_head(&cx.input, &cx.options);
        cx.request = Some(head.clone());

        #[cfg(feature = "tracing")]
        tracing::debug!(
            method = %head.method,
            url = %head.url,
            attempt = cx.attempt,
            "starting attempt"
        );

        // measuring a streamed upload reads the caller's stream, which may stall
        let built = build_request(head.clone(), &cx.options, &cx.body);
        let outcome = abortable(cx.signal.as_ref(), built).await;
        match outcome {
            Ok(Ok(request)) => {
                if !cx.request_announced {
                    cx.request_announced = true;
                    if let Some(on_request) = &cx.options.on.on_request {
                        notify("on_request", || on_request(&request.head));
                    }
                }
                cx.outgoing = Some(request);
                RequestState::SendingRequest
            }
            Ok(Err(err)) => {
                cx.error = Some(err);
                RequestState::NetworkError
            }
            Err(reason) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(reason = %reason, url = %head.url, "attempt aborted while preparing");
                cx.error = Some(FetchError::Aborted {
                    reason,
                    request: Some(head),
                });
                RequestState::NetworkError
            }
        }
    }

    async fn send(&mut self) -> RequestState {
        let cx = &mut self.cx;
        let Some(request) = cx.outgoing.take() else {
            cx.error = Some(FetchError::Build("no request prepared".to_owned()));
            return RequestState::NetworkError;
        };
        let head = request.head.clone();
        let options = TransportOptions {
            method: head.method.clone(),
            headers: head.headers.clone(),
            timeout: cx.options.timeout,
            signal: cx.signal.clone(),
        };

        let sent = self.transport.send(request, options, cx.ctx);
        let outcome = abortable(cx.signal.as_ref(), sent).await;
        match outcome {
            Ok(Ok(response)) => {
                let response = streaming::instrument_response(
                    response,
                    cx.options.on.on_response_streaming.as_ref(),
                );
                cx.response_head = Some(response.head.clone());
                cx.response = Some(response);
                RequestState::ResponseReceived
            }
            Ok(Err(source)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %source, url = %head.url, "transport failed");
                cx.error = Some(FetchError::Network {
                    source,
                    request: head,
                });
                RequestState::NetworkError
            }
            Err(reason) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(reason = %reason, url = %head.url, "attempt aborted");
                cx.error = Some(FetchError::Aborted {
                    reason,
                    request: Some(head),
                });
                RequestState::NetworkError
            }
        }
    }

    fn check(&mut self) -> RequestState {
        let cx = &mut self.cx;
        match &cx.response_head {
            Some(head) if (cx.options.reject)(head) => RequestState::ResponseRejected,
            Some(_) => RequestState::ParsingResponse,
            None => {
                cx.error = Some(FetchError::Build("response is not available".to_owned()));
                RequestState::NetworkError
            }
        }
    }

    async fn parse(&mut self) -> RequestState {
        let cx = &mut self.cx;
        let (Some(response), Some(request)) = (cx.response.take(), cx.request.clone()) else {
            cx.error = Some(FetchError::Build("response is not available".to_owned()));
            return RequestState::NetworkError;
        };

        let parsed = (cx.options.parse_response)(response, request.clone());
        let outcome = abortable(cx.signal.as_ref(), parsed).await;
        match outcome {
            Ok(Ok(data)) => {
                cx.parsed = Some(data);
                RequestState::ValidatingSchema
            }
            Ok(Err(source)) => {
                cx.error = Some(FetchError::Parse { source, request });
                RequestState::ParseError
            }
            Err(reason) => {
                cx.error = Some(FetchError::Aborted {
                    reason,
                    request: Some(request),
                });
                RequestState::ParseError
            }
        }
    }

    async fn validate(&mut self) -> RequestState {
        let cx = &mut self.cx;
        let data = cx.parsed.take().unwrap_or(Value::Null);
        let Some(schema) = cx.options.schema.clone() else {
            cx.validated = Some(data);
            return RequestState::RequestSuccess;
        };
        let Some(request) = &cx.request else {
            cx.error = Some(FetchError::Build("request is not available".to_owned()));
            return RequestState::RequestFailed;
        };

        let outcome = schema::validate(schema.as_ref(), data, request).await;
        match outcome {
            Ok(value) => {
                cx.validated = Some(value);
                RequestState::RequestSuccess
            }
            Err(err) => {
                cx.error = Some(FetchError::Validation(err));
                RequestState::ValidationError
            }
        }
    }

    async fn reject(&mut self) -> RequestState {
        let cx = &mut self.cx;
        let (Some(response), Some(request)) = (cx.response.take(), cx.request.clone()) else {
            cx.error = Some(FetchError::Build("response is not available".to_owned()));
            return RequestState::NetworkError;
        };

        let rejection = (cx.options.parse_rejected)(response, request.clone());
        let outcome = abortable(cx.signal.as_ref(), rejection).await;
        match outcome {
            Ok(error) => {
                cx.error = Some(error);
                RequestState::EvaluatingRetry
            }
            Err(reason) => {
                cx.error = Some(FetchError::Aborted {
                    reason,
                    request: Some(request),
                });
                RequestState::RequestFailed
            }
        }
    }

    async fn evaluate_retry(&mut self) -> RequestState {
        let cx = &mut self.cx;
        let Some(request) = &cx.request else {
            return RequestState::RequestFailed;
        };
        let retry_ctx = RetryContext {
            attempt: cx.attempt,
            request,
            response: cx.response_head.as_ref(),
            error: cx.error.as_ref(),
        };

        let verdict = cx.options.retry.evaluate(&retry_ctx).await;
        match verdict {
            Ok(RetryVerdict::Retry {
                max_attempts,
                delay,
            }) => {
                cx.max_attempts = max_attempts;
                cx.retry_delay = delay;
                RequestState::DelayingRetry
            }
            Ok(RetryVerdict::Stop) => RequestState::RequestFailed,
            Err(err) => {
                cx.error = Some(FetchError::RetryConfig(err));
                RequestState::RequestFailed
            }
        }
    }

    /// Waits out the retry delay, then fires `on_retry`.
    ///
    /// Unlike the other suspension points, the wait watches only the caller's
    /// signal and not the composed attempt signal. A timed-out attempt must
    /// still be able to retry, and its deadline has already fired.
    async fn delay_retry(&mut self) -> RequestState {
        let cx = &mut self.cx;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            attempt = cx.attempt + 1,
            max_attempts = cx.max_attempts,
            delay_ms = cx.retry_delay.as_millis() as u64,
            "scheduling retry"
        );

        if let Err(reason) = signal::abortable_delay(cx.retry_delay, cx.options.signal.as_ref()).await
        {
            cx.error = Some(FetchError::Aborted {
                reason,
                request: cx.request.clone(),
            });
            return RequestState::RequestFailed;
        }

        if let (Some(on_retry), Some(request)) = (&cx.options.on.on_retry, &cx.request) {
            let retry_ctx = RetryContext {
                attempt: cx.attempt,
                request,
                response: cx.response_head.as_ref(),
                error: cx.error.as_ref(),
            };
            notify("on_retry", || on_retry(&retry_ctx));
        }

        cx.attempt += 1;
        RequestState::PreparingRequest
    }

    fn finish(self, state: RequestState) -> Result<Completed, FetchError> {
        let RequestContext {
            options,
            request,
            error,
            validated,
            ..
        } = self.cx;

        match (state, request) {
            (RequestState::RequestSuccess, Some(request)) => {
                let data = validated.unwrap_or(Value::Null);
                if let Some(on_success) = &options.on.on_success {
                    notify("on_success", || on_success(&data, &request));
                }
                Ok(Completed { data, request })
            }
            (state, request) => {
                let error = error.unwrap_or_else(|| {
                    FetchError::Build(format!("request ended in {state} without an error"))
                });
                if let Some(on_error) = &options.on.on_error {
                    notify("on_error", || on_error(&error, request.as_ref()));
                }
                Err(error)
            }
        }
    }
}

/// Awaits `work` unless `signal` fires first.
async fn abortable<F: Future>(
    signal: Option<&AbortSignal>,
    work: F,
) -> Result<F::Output, crate::AbortReason> {
    match signal {
        Some(signal) => {
            tokio::select! {
                biased;
                reason = signal.aborted() => Err(reason),
                output = work => Ok(output),
            }
        }
        None => Ok(work.await),
    }
}
