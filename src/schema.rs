use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{RequestHead, ValidationError};

/// One problem reported by a [`Schema`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
}

impl Issue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Vec::new(),
        }
    }

    /// Sets the location of the offending value.
    pub fn at<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path = path.into_iter().map(Into::into).collect();
        self
    }
}

/// Validation contract for parsed response data.
///
/// Returns the (possibly transformed) value, or the list of issues.
#[async_trait]
pub trait Schema: Send + Sync {
    async fn validate(&self, input: Value) -> Result<Value, Vec<Issue>>;
}

/// [`Schema`] backed by a synchronous closure.
pub struct FnSchema<F>(F);

pub fn schema_fn<F>(validate: F) -> FnSchema<F>
where
    F: Fn(Value) -> Result<Value, Vec<Issue>> + Send + Sync,
{
    FnSchema(validate)
}

#[async_trait]
impl<F> Schema for FnSchema<F>
where
    F: Fn(Value) -> Result<Value, Vec<Issue>> + Send + Sync,
{
    async fn validate(&self, input: Value) -> Result<Value, Vec<Issue>> {
        (self.0)(input)
    }
}

pub(crate) async fn validate(
    schema: &dyn Schema,
    data: Value,
    request: &RequestHead,
) -> Result<Value, ValidationError> {
    schema
        .validate(data.clone())
        .await
        .map_err(|issues| ValidationError {
            issues,
            value: data,
            request: request.clone(),
        })
}
