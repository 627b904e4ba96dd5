use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use fetchline::{
    schema_fn, AbortController, AbortReason, Attempts, Body, BoxError, FetchError, FetchOptions,
    Fetcher, Issue, Request, RequestBody, RequestHead, Response, RetryContext, RetryOptions,
    StreamingEvent, Transport, TransportOptions,
};
use futures_util::{stream, StreamExt};
use http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    HeaderMap, HeaderValue, Method, StatusCode,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Clone)]
enum Reply {
    Status(StatusCode, &'static str),
    Fail(&'static str),
    Hang,
    /// Response head arrives, body sends one chunk and then stalls.
    Stalled(StatusCode),
}

impl Reply {
    fn ok(body: &'static str) -> Self {
        Self::Status(StatusCode::OK, body)
    }
}

#[derive(Clone, Default)]
struct Script {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<(RequestHead, Vec<u8>)>>>,
    abort_on_call: Arc<Mutex<Option<AbortController>>>,
}

impl Script {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen(&self) -> Vec<(RequestHead, Vec<u8>)> {
        self.seen.lock().expect("seen mutex").clone()
    }

    fn transport(&self) -> impl Transport<Context = ()> {
        let script = self.clone();
        fetchline::transport_fn(
            move |request: Request, _options: TransportOptions, _ctx: Option<&()>| {
                let script = script.clone();
                async move {
                    script.calls.fetch_add(1, Ordering::SeqCst);
                    if let Some(controller) = script.abort_on_call.lock().expect("abort mutex").take() {
                        controller.abort_with("caller gave up");
                    }

                    let Request { head, body } = request;
                    let bytes = body.collect().await?;
                    script.seen.lock().expect("seen mutex").push((head, bytes.to_vec()));

                    let reply = script
                        .replies
                        .lock()
                        .expect("reply mutex")
                        .pop_front()
                        .unwrap_or(Reply::Fail("no scripted reply"));
                    match reply {
                        Reply::Status(status, body) => {
                            let mut headers = HeaderMap::new();
                            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
                            Ok(Response::new(status, headers, Body::from(body)))
                        }
                        Reply::Fail(message) => Err::<Response, BoxError>(message.into()),
                        Reply::Hang => std::future::pending().await,
                        Reply::Stalled(status) => {
                            Ok(Response::new(status, HeaderMap::new(), stalled_stream()))
                        }
                    }
                }
            },
        )
    }

    fn fetcher(&self) -> Fetcher<impl Transport<Context = ()>> {
        Fetcher::new(self.transport())
    }
}

fn stalled_stream() -> Body {
    let first = stream::once(async { Ok::<_, BoxError>(Bytes::from_static(b"{\"par")) });
    Body::from_stream(first.chain(stream::pending()))
}

fn stalled_upload() -> RequestBody {
    let first = stream::once(async { Ok::<_, BoxError>(Bytes::from_static(b"chunk")) });
    RequestBody::stream(first.chain(stream::pending()))
}

fn always() -> RetryOptions {
    RetryOptions::new().when(|_: &RetryContext<'_>| true)
}

#[derive(Clone, Default)]
struct Counters {
    requests: Arc<AtomicUsize>,
    retries: Arc<AtomicUsize>,
    successes: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

impl Counters {
    fn attach(&self, options: FetchOptions) -> FetchOptions {
        let (requests, retries, successes, errors) = (
            self.requests.clone(),
            self.retries.clone(),
            self.successes.clone(),
            self.errors.clone(),
        );
        options
            .on_request(move |_: &RequestHead| {
                requests.fetch_add(1, Ordering::SeqCst);
            })
            .on_retry(move |_: &RetryContext<'_>| {
                retries.fetch_add(1, Ordering::SeqCst);
            })
            .on_success(move |_: &Value, _: &RequestHead| {
                successes.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |_: &FetchError, _: Option<&RequestHead>| {
                errors.fetch_add(1, Ordering::SeqCst);
            })
    }

    fn snapshot(&self) -> [usize; 4] {
        [
            self.requests.load(Ordering::SeqCst),
            self.retries.load(Ordering::SeqCst),
            self.successes.load(Ordering::SeqCst),
            self.errors.load(Ordering::SeqCst),
        ]
    }
}

#[tokio::test]
async fn exhausted_retries_make_attempts_plus_one_calls() {
    let script = Script::new(Vec::new());
    let counters = Counters::default();

    let err = script
        .fetcher()
        .execute(
            "https://api.test/flaky",
            counters.attach(FetchOptions::new().retry(always().attempts(3))),
        )
        .await
        .expect_err("every attempt fails");

    assert!(matches!(err, FetchError::Network { .. }));
    assert_eq!(script.calls(), 4);
    // on_request once, on_retry per retry, on_error once
    assert_eq!(counters.snapshot(), [1, 3, 0, 1]);
}

#[tokio::test]
async fn failure_then_success_retries_once() {
    let script = Script::new(vec![Reply::Fail("connection reset"), Reply::ok(r#"{"ok":true}"#)]);
    let counters = Counters::default();

    let data = script
        .fetcher()
        .execute(
            "https://api.test/items",
            counters.attach(FetchOptions::new().retry(always().attempts(2))),
        )
        .await
        .expect("second attempt succeeds");

    assert_eq!(data, json!({"ok": true}));
    assert_eq!(script.calls(), 2);
    assert_eq!(counters.snapshot(), [1, 1, 1, 0]);
}

#[tokio::test]
async fn server_error_is_rejected_with_status() {
    let script = Script::new(vec![Reply::Status(
        StatusCode::INTERNAL_SERVER_ERROR,
        r#"{"error":"boom"}"#,
    )]);

    let err = script
        .fetcher()
        .execute("https://x/1", FetchOptions::new())
        .await
        .expect_err("500 is rejected");

    assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    assert_eq!(err.to_string(), "[500] Internal Server Error");
    match err {
        FetchError::Rejected(rejected) => {
            assert_eq!(rejected.data, json!({"error": "boom"}));
            assert_eq!(rejected.request.url, "https://x/1");
        }
        other => panic!("expected rejected response, got {other:?}"),
    }
    assert_eq!(script.calls(), 1);
}

#[tokio::test]
async fn default_policy_retries_rejected_responses() {
    let script = Script::new(vec![
        Reply::Status(StatusCode::SERVICE_UNAVAILABLE, ""),
        Reply::Status(StatusCode::SERVICE_UNAVAILABLE, ""),
        Reply::ok("[1,2,3]"),
    ]);

    let data = script
        .fetcher()
        .execute(
            "https://api.test/list",
            FetchOptions::new().retry(RetryOptions::new().attempts(2)),
        )
        .await
        .expect("third attempt succeeds");

    assert_eq!(data, json!([1, 2, 3]));
    assert_eq!(script.calls(), 3);
}

#[tokio::test]
async fn default_policy_does_not_retry_network_errors() {
    let script = Script::new(vec![Reply::Fail("dns failure"), Reply::ok("{}")]);

    let err = script
        .fetcher()
        .execute(
            "https://api.test/list",
            FetchOptions::new().retry(RetryOptions::new().attempts(3)),
        )
        .await
        .expect_err("network errors are not retried by default");

    assert!(matches!(err, FetchError::Network { .. }));
    assert_eq!(script.calls(), 1);
}

#[tokio::test]
async fn invalid_json_is_never_retried() {
    let script = Script::new(vec![Reply::ok("{oops"), Reply::ok("{}")]);
    let counters = Counters::default();

    let err = script
        .fetcher()
        .execute(
            "https://api.test/broken",
            counters.attach(FetchOptions::new().retry(always().attempts(5))),
        )
        .await
        .expect_err("body is not JSON");

    assert!(matches!(err, FetchError::Parse { .. }));
    assert_eq!(script.calls(), 1);
    assert_eq!(counters.snapshot(), [1, 0, 0, 1]);
}

#[tokio::test]
async fn validation_failure_is_never_retried() {
    let script = Script::new(vec![Reply::ok(r#"{"id":"nope"}"#), Reply::ok(r#"{"id":1}"#)]);

    let err = script
        .fetcher()
        .execute(
            "https://api.test/users/1",
            FetchOptions::new()
                .retry(always().attempts(2))
                .schema(schema_fn(|value: Value| {
                    if value.get("id").is_some_and(Value::is_number) {
                        Ok(value)
                    } else {
                        Err(vec![Issue::new("expected a number").at(["id"])])
                    }
                })),
        )
        .await
        .expect_err("schema rejects the payload");

    match err {
        FetchError::Validation(ref validation) => {
            assert_eq!(validation.value, json!({"id": "nope"}));
            assert_eq!(validation.issues[0].message, "expected a number");
            assert_eq!(
                err.request().map(|request| request.url.as_str()),
                Some("https://api.test/users/1")
            );
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(script.calls(), 1);
}

#[tokio::test]
async fn custom_parser_replaces_json_decoding() {
    let script = Script::new(vec![Reply::ok("plain words")]);

    let data = script
        .fetcher()
        .execute(
            "https://api.test/text",
            FetchOptions::new().parse_response(|response: Response, _request: RequestHead| async move {
                Ok::<_, BoxError>(Value::String(response.text().await?.to_uppercase()))
            }),
        )
        .await
        .expect("custom parser");

    assert_eq!(data, json!("PLAIN WORDS"));
}

#[tokio::test]
async fn handlers_chain_defaults_before_call() {
    let script = Script::new(vec![Reply::ok("{}")]);
    let order = Arc::new(Mutex::new(Vec::new()));
    let (first, second) = (order.clone(), order.clone());

    let fetcher = script.fetcher().with_defaults(FetchOptions::new().on_success(
        move |_: &Value, _: &RequestHead| first.lock().expect("order").push("default"),
    ));
    fetcher
        .execute(
            "https://api.test/",
            FetchOptions::new().on_success(move |_: &Value, _: &RequestHead| {
                second.lock().expect("order").push("call")
            }),
        )
        .await
        .expect("success");

    assert_eq!(*order.lock().expect("order"), vec!["default", "call"]);
}

#[tokio::test(start_paused = true)]
async fn call_delay_overrides_default_delay_and_keeps_attempts() {
    let script = Script::new(Vec::new());
    let fetcher = script
        .fetcher()
        .with_defaults(FetchOptions::new().retry(always().attempts(2).delay(Duration::from_secs(60))));

    let started = tokio::time::Instant::now();
    let err = fetcher
        .execute(
            "https://api.test/",
            FetchOptions::new().retry(RetryOptions::new().delay(Duration::from_millis(10))),
        )
        .await
        .expect_err("every attempt fails");

    assert!(matches!(err, FetchError::Network { .. }));
    assert_eq!(script.calls(), 3);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(20), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(60), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn timed_out_attempt_is_retried_with_a_fresh_deadline() {
    let script = Script::new(vec![Reply::Hang, Reply::ok(r#"{"late":false}"#)]);
    let timeouts = Arc::new(AtomicUsize::new(0));
    let seen_timeouts = timeouts.clone();

    let data = script
        .fetcher()
        .execute(
            "https://api.test/slow",
            FetchOptions::new()
                .timeout(Duration::from_millis(100))
                .retry(always().attempts(1))
                .on_retry(move |ctx: &RetryContext<'_>| {
                    if ctx.error.is_some_and(FetchError::is_timeout) {
                        seen_timeouts.fetch_add(1, Ordering::SeqCst);
                    }
                }),
        )
        .await
        .expect("second attempt beats its own deadline");

    assert_eq!(data, json!({"late": false}));
    assert_eq!(script.calls(), 2);
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_without_retries_fails_with_timeout() {
    let script = Script::new(vec![Reply::Hang]);

    let err = script
        .fetcher()
        .execute(
            "https://api.test/slow",
            FetchOptions::new().timeout(Duration::from_millis(100)),
        )
        .await
        .expect_err("attempt times out");

    assert!(err.is_timeout());
    assert!(matches!(
        err,
        FetchError::Aborted { reason: AbortReason::Timeout(t), .. } if t == Duration::from_millis(100)
    ));
}

#[tokio::test]
async fn caller_abort_stops_the_retry_delay() {
    let script = Script::new(Vec::new());
    let controller = AbortController::new();
    let signal = controller.signal();
    *script.abort_on_call.lock().expect("abort mutex") = Some(controller);
    let counters = Counters::default();

    let err = script
        .fetcher()
        .execute(
            "https://api.test/",
            counters.attach(
                FetchOptions::new()
                    .signal(signal)
                    .retry(always().attempts(3).delay(Duration::from_secs(3600))),
            ),
        )
        .await
        .expect_err("aborted");

    assert!(err.is_aborted());
    assert!(matches!(
        err,
        FetchError::Aborted { reason: AbortReason::Cancelled(ref msg), .. } if msg == "caller gave up"
    ));
    assert_eq!(script.calls(), 1);
    assert_eq!(counters.snapshot(), [1, 0, 0, 1]);
}

#[tokio::test(start_paused = true)]
async fn timeout_while_reading_success_body_fails_with_timeout() {
    let script = Script::new(vec![Reply::Stalled(StatusCode::OK), Reply::ok("{}")]);
    let counters = Counters::default();

    let fetcher = script.fetcher();
    let call = fetcher.execute(
        "https://api.test/stalled",
        counters.attach(
            FetchOptions::new()
                .timeout(Duration::from_millis(100))
                .retry(always().attempts(2)),
        ),
    );
    let err = tokio::time::timeout(Duration::from_secs(3600), call)
        .await
        .expect("call must honour its timeout")
        .expect_err("body read times out");

    assert!(matches!(
        err,
        FetchError::Aborted { reason: AbortReason::Timeout(_), request: Some(ref request) }
            if request.url == "https://api.test/stalled"
    ));
    assert_eq!(script.calls(), 1);
    assert_eq!(counters.snapshot(), [1, 0, 0, 1]);
}

#[tokio::test(start_paused = true)]
async fn timeout_while_reading_rejected_body_fails_with_timeout() {
    let script = Script::new(vec![
        Reply::Stalled(StatusCode::INTERNAL_SERVER_ERROR),
        Reply::ok("{}"),
    ]);
    let counters = Counters::default();

    let fetcher = script.fetcher();
    let call = fetcher.execute(
        "https://api.test/stalled",
        counters.attach(
            FetchOptions::new()
                .timeout(Duration::from_millis(100))
                .retry(always().attempts(2)),
        ),
    );
    let err = tokio::time::timeout(Duration::from_secs(3600), call)
        .await
        .expect("call must honour its timeout")
        .expect_err("rejection body read times out");

    assert!(err.is_timeout(), "{err:?}");
    assert_eq!(script.calls(), 1);
    assert_eq!(counters.snapshot(), [1, 0, 0, 1]);
}

#[tokio::test(start_paused = true)]
async fn timeout_stops_a_stalled_upload_before_sending() {
    let script = Script::new(vec![Reply::ok("{}")]);
    let counters = Counters::default();

    let fetcher = script.fetcher();
    let call = fetcher.execute(
        "https://api.test/upload",
        counters.attach(
            FetchOptions::new()
                .method(Method::PUT)
                .body_stream(stalled_upload())
                .timeout(Duration::from_millis(100))
                .on_request_streaming(|_: &StreamingEvent, _: &RequestHead| {}),
        ),
    );
    let err = tokio::time::timeout(Duration::from_secs(3600), call)
        .await
        .expect("call must honour its timeout")
        .expect_err("upload times out");

    assert!(err.is_timeout(), "{err:?}");
    assert_eq!(
        err.request().map(|request| request.url.as_str()),
        Some("https://api.test/upload")
    );
    assert_eq!(script.calls(), 0);
    assert_eq!(counters.snapshot(), [0, 0, 0, 1]);
}

#[tokio::test(start_paused = true)]
async fn caller_abort_stops_a_stalled_upload() {
    let script = Script::new(vec![Reply::ok("{}")]);
    let controller = AbortController::new();
    let signal = controller.signal();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.abort_with("upload cancelled");
    });

    let fetcher = script.fetcher();
    let call = fetcher.execute(
        "https://api.test/upload",
        FetchOptions::new()
            .method(Method::PUT)
            .body_stream(stalled_upload())
            .signal(signal)
            .on_request_streaming(|_: &StreamingEvent, _: &RequestHead| {}),
    );
    let err = tokio::time::timeout(Duration::from_secs(3600), call)
        .await
        .expect("call must honour the caller's abort")
        .expect_err("upload aborted");

    assert!(matches!(
        err,
        FetchError::Aborted { reason: AbortReason::Cancelled(ref msg), .. } if msg == "upload cancelled"
    ));
    assert_eq!(script.calls(), 0);
}

#[tokio::test]
async fn query_params_merge_by_layer() {
    let script = Script::new(vec![Reply::ok("{}")]);

    script
        .fetcher()
        .with_defaults(FetchOptions::new().param("a", 9).param("b", 2))
        .execute(
            "https://api.test/x?a=1",
            FetchOptions::new().param("b", 3).param("c", 4),
        )
        .await
        .expect("success");

    let seen = script.seen();
    assert_eq!(seen[0].0.url, "https://api.test/x?a=1&b=3&c=4");
}

#[tokio::test]
async fn json_body_is_serialized_with_content_type() {
    let script = Script::new(vec![Reply::Status(StatusCode::CREATED, r#"{"id":7}"#)]);

    let data = script
        .fetcher()
        .with_defaults(FetchOptions::new().base_url("https://api.test/v1/"))
        .execute(
            "/users",
            FetchOptions::new()
                .method(Method::POST)
                .json(json!({"name": "Ada"})),
        )
        .await
        .expect("created");

    assert_eq!(data, json!({"id": 7}));
    let (head, body) = &script.seen()[0];
    assert_eq!(head.method, Method::POST);
    assert_eq!(head.url, "https://api.test/v1/users");
    assert_eq!(head.headers[CONTENT_TYPE], "application/json");
    assert_eq!(body, br#"{"name":"Ada"}"#);
}

#[tokio::test]
async fn failing_attempts_resolver_is_fatal() {
    let script = Script::new(vec![Reply::Status(StatusCode::BAD_GATEWAY, "")]);

    let err = script
        .fetcher()
        .execute(
            "https://api.test/",
            FetchOptions::new().retry(RetryOptions::new().attempts(Attempts::with_async(
                |_: &RequestHead| async { Err::<u32, BoxError>("quota service down".into()) },
            ))),
        )
        .await
        .expect_err("resolver fails");

    assert!(matches!(err, FetchError::RetryConfig(_)));
    assert_eq!(script.calls(), 1);
}

#[tokio::test]
async fn serializer_failure_reports_without_a_request() {
    let script = Script::new(vec![Reply::ok("{}")]);
    let reported = Arc::new(Mutex::new(None));
    let slot = reported.clone();

    let err = script
        .fetcher()
        .execute(
            "https://api.test/",
            FetchOptions::new()
                .json(json!({"a": 1}))
                .serialize_body(|_: &Value| Err("unsupported".into()))
                .on_error(move |_: &FetchError, request: Option<&RequestHead>| {
                    *slot.lock().expect("slot") = Some(request.is_some());
                }),
        )
        .await
        .expect_err("serialization fails");

    assert!(matches!(err, FetchError::Serialize(_)));
    assert_eq!(*reported.lock().expect("slot"), Some(false));
    assert_eq!(script.calls(), 0);
}

#[tokio::test]
async fn default_options_can_depend_on_context() {
    let urls = Arc::new(Mutex::new(Vec::new()));
    let recorded = urls.clone();
    let transport = fetchline::transport_fn(
        move |request: Request, _options: TransportOptions, _ctx: Option<&String>| {
            recorded.lock().expect("urls").push(request.head.url.clone());
            async move {
                Ok::<_, BoxError>(Response::new(StatusCode::OK, HeaderMap::new(), Body::from("{}")))
            }
        },
    );

    let fetcher = Fetcher::new(transport).with_default_options(
        |_input, _call: &FetchOptions, tenant: Option<&String>| {
            let tenant = tenant.map(String::as_str).unwrap_or("public");
            FetchOptions::new().base_url(format!("https://{tenant}.api.test"))
        },
    );
    fetcher
        .execute_with_context("/items", FetchOptions::new(), &"acme".to_owned())
        .await
        .expect("tenant call");
    fetcher
        .execute("/items", FetchOptions::new())
        .await
        .expect("public call");

    assert_eq!(
        *urls.lock().expect("urls"),
        vec![
            "https://acme.api.test/items".to_owned(),
            "https://public.api.test/items".to_owned(),
        ]
    );
}

#[tokio::test]
async fn execute_as_decodes_the_payload() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        id: u64,
        name: String,
    }

    let script = Script::new(vec![Reply::ok(r#"{"id":1,"name":"Ada"}"#), Reply::ok(r#"{"id":"x"}"#)]);
    let fetcher = script.fetcher();

    let user: User = fetcher
        .execute_as("https://api.test/users/1", FetchOptions::new())
        .await
        .expect("decodes");
    assert_eq!(
        user,
        User {
            id: 1,
            name: "Ada".to_owned()
        }
    );

    let err = fetcher
        .execute_as::<User>("https://api.test/users/2", FetchOptions::new())
        .await
        .expect_err("shape mismatch");
    assert!(matches!(err, FetchError::Parse { ref request, .. } if request.url.ends_with("/users/2")));
}

#[tokio::test]
async fn upload_and_download_progress_cover_the_body() {
    let script = Script::new(vec![Reply::ok(r#"{"stored":true}"#)]);
    let uploads = Arc::new(Mutex::new(Vec::<StreamingEvent>::new()));
    let downloads = Arc::new(Mutex::new(Vec::<StreamingEvent>::new()));
    let (up, down) = (uploads.clone(), downloads.clone());

    script
        .fetcher()
        .execute(
            "https://api.test/blobs",
            FetchOptions::new()
                .method(Method::PUT)
                .body("0123456789")
                .on_request_streaming(move |event: &StreamingEvent, _: &RequestHead| {
                    up.lock().expect("uploads").push(event.clone());
                })
                .on_response_streaming(move |event: &StreamingEvent, _: &fetchline::ResponseHead| {
                    down.lock().expect("downloads").push(event.clone());
                }),
        )
        .await
        .expect("stored");

    for (events, size) in [(uploads, 10u64), (downloads, 15u64)] {
        let events = events.lock().expect("events");
        assert_eq!(events[0].transferred_bytes, 0);
        let sum: u64 = events.iter().map(|event| event.chunk.len() as u64).sum();
        assert_eq!(sum, size);
        let last = events.last().expect("final event");
        assert_eq!(last.transferred_bytes, size);
        assert_eq!(last.total_bytes, size);
    }
}
