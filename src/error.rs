use http::{HeaderMap, StatusCode};
use serde_json::Value;

use crate::{schema::Issue, AbortReason, RequestHead};

/// Boxed error used at collaborator seams (transport, parsers, retry resolvers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The transport failed before a response was obtained.
    #[error("network error: {source}")]
    Network {
        source: BoxError,
        request: RequestHead,
    },
    /// The call was cancelled or an attempt ran past its timeout.
    #[error("request aborted: {reason}")]
    Aborted {
        reason: AbortReason,
        request: Option<RequestHead>,
    },
    /// A response arrived but failed the `reject` predicate.
    #[error(transparent)]
    Rejected(Box<RejectedResponse>),
    /// The response body could not be decoded.
    #[error("parse error: {source}")]
    Parse {
        source: BoxError,
        request: RequestHead,
    },
    /// The configured schema rejected the decoded data.
    #[error(transparent)]
    Validation(ValidationError),
    /// The request body could not be serialized.
    #[error("serialize error: {0}")]
    Serialize(BoxError),
    /// The request could not be assembled.
    #[error("invalid request: {0}")]
    Build(String),
    /// A dynamic `attempts` or `delay` resolver failed.
    #[error("retry configuration failed: {0}")]
    RetryConfig(BoxError),
}

impl FetchError {
    /// Returns `true` for outcomes the retry loop may retry: transport
    /// failures (including per-attempt timeouts) and rejected responses.
    pub fn is_retry_eligible(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Aborted { .. } | Self::Rejected(_) | Self::Build(_)
        )
    }

    /// Returns `true` when the call stopped because its signal fired.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Returns `true` when an attempt ran past its timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Aborted {
                reason: AbortReason::Timeout(_),
                ..
            }
        )
    }

    /// HTTP status of a rejected response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Rejected(rejected) => Some(rejected.status),
            _ => None,
        }
    }

    /// Request the error originated from, when one was built.
    pub fn request(&self) -> Option<&RequestHead> {
        match self {
            Self::Network { request, .. } | Self::Parse { request, .. } => Some(request),
            Self::Aborted { request, .. } => request.as_ref(),
            Self::Rejected(rejected) => Some(&rejected.request),
            Self::Validation(validation) => Some(&validation.request),
            Self::Serialize(_) | Self::Build(_) | Self::RetryConfig(_) => None,
        }
    }
}

/// A response that failed the `reject` predicate.
///
/// `data` holds the parsed body: JSON when it parses, the raw text
/// otherwise, and `null` for an empty body.
#[derive(Debug, thiserror::Error)]
#[error("[{}] {}", .status.as_u16(), .status_text)]
pub struct RejectedResponse {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub url: Option<String>,
    pub data: Value,
    pub request: RequestHead,
}

/// Schema validation failure with the issues reported by the schema.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{}", issues_message(.issues))]
pub struct ValidationError {
    pub issues: Vec<Issue>,
    /// The value that failed validation.
    pub value: Value,
    pub request: RequestHead,
}

fn issues_message(issues: &[Issue]) -> String {
    serde_json::to_string(issues).unwrap_or_else(|_| format!("{} validation issue(s)", issues.len()))
}
