use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{
    header::{HeaderValue, CONTENT_TYPE},
    HeaderMap, Method,
};

use crate::{
    options::{MergedOptions, RequestBody},
    resolve_url, streaming, Body, BodyStream, FetchError, Input, Request, RequestHead,
};

/// Request body after serialization, reusable across attempts.
pub(crate) enum PreparedBody {
    Empty,
    Bytes(Bytes),
    /// Caller-provided stream; taken by the first attempt.
    Once(Arc<Mutex<Option<BodyStream>>>),
}

impl PreparedBody {
    fn take(&self) -> Result<Body, FetchError> {
        match self {
            Self::Empty => Ok(Body::Empty),
            Self::Bytes(bytes) => Ok(Body::Full(bytes.clone())),
            Self::Once(slot) => {
                let stream = slot
                    .lock()
                    .map_err(|_| FetchError::Build("request body lock poisoned".to_owned()))?
                    .take()
                    .ok_or_else(|| {
                        FetchError::Build("streamed request body cannot be sent twice".to_owned())
                    })?;
                Ok(Body::Stream(stream))
            }
        }
    }
}

/// Serializes the configured body once per call.
///
/// JSON bodies go through `serialize_body` and get
/// `Content-Type: application/json` unless the merged headers already carry
/// a content type.
pub(crate) fn prepare_body(options: &mut MergedOptions) -> Result<PreparedBody, FetchError> {
    let prepared = match options.body.take() {
        None | Some(RequestBody::Json(serde_json::Value::Null)) => PreparedBody::Empty,
        Some(RequestBody::Json(value)) => {
            let bytes = (options.serialize_body)(&value).map_err(FetchError::Serialize)?;
            let headers = options.headers.get_or_insert_with(HeaderMap::new);
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            PreparedBody::Bytes(bytes)
        }
        Some(RequestBody::Raw(bytes)) => PreparedBody::Bytes(bytes),
        Some(RequestBody::Stream(slot)) => PreparedBody::Once(slot),
    };
    Ok(prepared)
}

/// Builds the request head for one attempt.
///
/// String and URL inputs are resolved against the base URL and layered
/// params. A pre-built request keeps its URL; the configured method and
/// headers replace its own when set.
pub(crate) fn build_head(input: &Input, options: &MergedOptions) -> RequestHead {
    match input {
        Input::Request(prebuilt) => RequestHead {
            method: options
                .method
                .clone()
                .unwrap_or_else(|| prebuilt.method.clone()),
            url: prebuilt.url.clone(),
            headers: options
                .headers
                .clone()
                .unwrap_or_else(|| prebuilt.headers.clone()),
        },
        Input::Str(_) | Input::Url(_) => {
            let url = resolve_url(
                options.base_url.as_deref(),
                input.href(),
                options.default_params.as_ref(),
                options.call_params.as_ref(),
                &*options.serialize_params,
            );
            RequestHead {
                method: options.method.clone().unwrap_or(Method::GET),
                url,
                headers: options.headers.clone().unwrap_or_default(),
            }
        }
    }
}

/// Attaches the body to `head` and instruments it for upload progress.
pub(crate) async fn build_request(
    head: RequestHead,
    options: &MergedOptions,
    body: &PreparedBody,
) -> Result<Request, FetchError> {
    let request = Request::new(head, body.take()?);
    streaming::instrument_request(request, options.on.on_request_streaming.as_ref())
        .await
        .map_err(|err| FetchError::Build(format!("failed to read request body: {err}")))
}
