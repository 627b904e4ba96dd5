use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::{Body, BoxError};

/// Method, target and headers of a request; cheap to clone and kept after
/// the body has been handed to the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestHead {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }
}

/// A request ready for the transport.
#[derive(Debug)]
pub struct Request {
    pub head: RequestHead,
    pub body: Body,
}

impl Request {
    /// Pairs a head with its body.
    pub fn new(head: RequestHead, body: Body) -> Self {
        Self { head, body }
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// Fully resolved URL, query included.
    pub fn url(&self) -> &str {
        &self.head.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }
}

/// Status line and headers of a response.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub url: Option<String>,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Canonical reason phrase, empty for non-standard codes.
    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }
}

/// A response produced by the transport.
#[derive(Debug)]
pub struct Response {
    pub head: ResponseHead,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Body>) -> Self {
        Self {
            head: ResponseHead {
                status,
                headers,
                url: None,
            },
            body: body.into(),
        }
    }

    /// Records the final URL, after redirects.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.head.url = Some(url.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn is_success(&self) -> bool {
        self.head.is_success()
    }

    pub fn status_text(&self) -> &'static str {
        self.head.status_text()
    }

    pub async fn bytes(self) -> Result<Bytes, BoxError> {
        self.body.collect().await
    }

    /// Reads the body as UTF-8, replacing invalid sequences.
    pub async fn text(self) -> Result<String, BoxError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
