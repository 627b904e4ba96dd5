use std::{fmt, future::Future, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;

use crate::{BoxError, FetchError, RequestHead, ResponseHead};

/// Outcome of one attempt, as seen by retry callbacks.
#[derive(Clone, Copy, Debug)]
pub struct RetryContext<'a> {
    /// Number of retries already performed; `0` after the first attempt.
    pub attempt: u32,
    pub request: &'a RequestHead,
    pub response: Option<&'a ResponseHead>,
    pub error: Option<&'a FetchError>,
}

type AttemptsFn = dyn Fn(&RequestHead) -> BoxFuture<'static, Result<u32, BoxError>> + Send + Sync;
type DelayFn =
    dyn Fn(&RetryContext<'_>) -> BoxFuture<'static, Result<Duration, BoxError>> + Send + Sync;

/// Retry eligibility predicate, evaluated before the attempt budget.
pub type When = Arc<dyn Fn(&RetryContext<'_>) -> bool + Send + Sync>;

/// Maximum number of retries after the first attempt.
#[derive(Clone)]
pub enum Attempts {
    Fixed(u32),
    Dynamic(Arc<AttemptsFn>),
}

impl Attempts {
    /// Computes the budget from the request.
    pub fn with<F>(attempts: F) -> Self
    where
        F: Fn(&RequestHead) -> u32 + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(
            move |request: &RequestHead| -> BoxFuture<'static, Result<u32, BoxError>> {
                let attempts = attempts(request);
                Box::pin(async move { Ok(attempts) })
            },
        ))
    }

    /// Computes the budget asynchronously; an error aborts the call.
    pub fn with_async<F, Fut>(attempts: F) -> Self
    where
        F: Fn(&RequestHead) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<u32, BoxError>> + Send + 'static,
    {
        Self::Dynamic(Arc::new(
            move |request: &RequestHead| -> BoxFuture<'static, Result<u32, BoxError>> {
                Box::pin(attempts(request))
            },
        ))
    }

    pub(crate) async fn resolve(&self, request: &RequestHead) -> Result<u32, BoxError> {
        match self {
            Self::Fixed(attempts) => Ok(*attempts),
            Self::Dynamic(attempts) => attempts(request).await,
        }
    }
}

impl From<u32> for Attempts {
    fn from(attempts: u32) -> Self {
        Self::Fixed(attempts)
    }
}

impl fmt::Debug for Attempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(attempts) => f.debug_tuple("Fixed").field(attempts).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Wait between a failed attempt and the next one.
#[derive(Clone)]
pub enum Delay {
    Fixed(Duration),
    Dynamic(Arc<DelayFn>),
}

impl Delay {
    /// Computes the delay from the retry context, e.g. for exponential backoff.
    pub fn with<F>(delay: F) -> Self
    where
        F: Fn(&RetryContext<'_>) -> Duration + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(
            move |ctx: &RetryContext<'_>| -> BoxFuture<'static, Result<Duration, BoxError>> {
                let delay = delay(ctx);
                Box::pin(async move { Ok(delay) })
            },
        ))
    }

    /// Computes the delay asynchronously; an error aborts the call.
    pub fn with_async<F, Fut>(delay: F) -> Self
    where
        F: Fn(&RetryContext<'_>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Duration, BoxError>> + Send + 'static,
    {
        Self::Dynamic(Arc::new(
            move |ctx: &RetryContext<'_>| -> BoxFuture<'static, Result<Duration, BoxError>> {
                Box::pin(delay(ctx))
            },
        ))
    }

    pub(crate) async fn resolve(&self, ctx: &RetryContext<'_>) -> Result<Duration, BoxError> {
        match self {
            Self::Fixed(delay) => Ok(*delay),
            Self::Dynamic(delay) => delay(ctx).await,
        }
    }
}

impl From<Duration> for Delay {
    fn from(delay: Duration) -> Self {
        Self::Fixed(delay)
    }
}

impl fmt::Debug for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Partial retry configuration.
///
/// Each layer of options carries its own `RetryOptions`; layers are merged
/// field by field, so a call can override `delay` and keep the default
/// `attempts`.
#[derive(Clone, Default)]
pub struct RetryOptions {
    pub attempts: Option<Attempts>,
    pub delay: Option<Delay>,
    pub when: Option<When>,
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries allowed after the first attempt.
    pub fn attempts(mut self, attempts: impl Into<Attempts>) -> Self {
        self.attempts = Some(attempts.into());
        self
    }

    /// Wait before each retry.
    pub fn delay(mut self, delay: impl Into<Delay>) -> Self {
        self.delay = Some(delay.into());
        self
    }

    /// Decides whether a failed attempt may be retried at all.
    ///
    /// Defaults to retrying non-2xx responses only.
    pub fn when<F>(mut self, when: F) -> Self
    where
        F: Fn(&RetryContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.when = Some(Arc::new(when));
        self
    }

    /// Fields set in `later` replace the ones in `self`.
    pub(crate) fn overlay(&self, later: &RetryOptions) -> RetryOptions {
        RetryOptions {
            attempts: later.attempts.clone().or_else(|| self.attempts.clone()),
            delay: later.delay.clone().or_else(|| self.delay.clone()),
            when: later.when.clone().or_else(|| self.when.clone()),
        }
    }

    pub(crate) fn fallback() -> Self {
        Self::new()
            .attempts(0)
            .delay(Duration::ZERO)
            .when(|ctx: &RetryContext<'_>| {
                ctx.response.is_some_and(|response| !response.is_success())
            })
    }

    pub(crate) fn into_policy(self) -> RetryPolicy {
        let when = match self.when {
            Some(when) => when,
            None => {
                let never: When = Arc::new(|_: &RetryContext<'_>| false);
                never
            }
        };
        RetryPolicy {
            attempts: self.attempts.unwrap_or(Attempts::Fixed(0)),
            delay: self.delay.unwrap_or(Delay::Fixed(Duration::ZERO)),
            when,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("attempts", &self.attempts)
            .field("delay", &self.delay)
            .field("when", &self.when.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Decision for one failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetryVerdict {
    Stop,
    Retry { max_attempts: u32, delay: Duration },
}

/// Fully resolved retry configuration.
#[derive(Clone)]
pub(crate) struct RetryPolicy {
    attempts: Attempts,
    delay: Delay,
    when: When,
}

impl RetryPolicy {
    /// `when` gates eligibility, then the attempt budget, then the delay is
    /// resolved for the retry about to happen.
    pub(crate) async fn evaluate(&self, ctx: &RetryContext<'_>) -> Result<RetryVerdict, BoxError> {
        if !(self.when)(ctx) {
            return Ok(RetryVerdict::Stop);
        }

        let max_attempts = self.attempts.resolve(ctx.request).await?;
        if ctx.attempt >= max_attempts {
            return Ok(RetryVerdict::Stop);
        }

        let delay = self.delay.resolve(ctx).await?;
        Ok(RetryVerdict::Retry {
            max_attempts,
            delay,
        })
    }
}
