use std::{
    fmt,
    sync::{Arc, OnceLock},
    time::Duration,
};

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

const DEFAULT_ABORT_MESSAGE: &str = "the operation was aborted";

/// Why a signal fired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// Aborted through an [`AbortController`].
    Cancelled(String),
    /// The per-attempt deadline elapsed.
    Timeout(Duration),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled(message) => f.write_str(message),
            Self::Timeout(timeout) => write!(f, "timed out after {}ms", timeout.as_millis()),
        }
    }
}

/// Owner side of an [`AbortSignal`].
#[derive(Clone, Debug, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a signal observing this controller.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self) {
        self.abort_with(DEFAULT_ABORT_MESSAGE);
    }

    /// Aborts with a caller-supplied reason. Only the first reason is kept.
    pub fn abort_with(&self, reason: impl Into<String>) {
        let _ = self
            .signal
            .reason
            .set(AbortReason::Cancelled(reason.into()));
        self.signal.token.cancel();
    }
}

/// Cooperative cancellation signal.
///
/// A signal fires when its controller aborts it or, for signals produced by
/// [`with_timeout`], when its deadline passes. Clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<AbortReason>>,
    deadline: Option<(Instant, Duration)>,
}

impl AbortSignal {
    /// A signal that fires once `timeout` has elapsed.
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some((Instant::now() + timeout, timeout)),
            ..Self::default()
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.reason().is_some()
    }

    /// Returns the abort reason, or `None` while the signal has not fired.
    pub fn reason(&self) -> Option<AbortReason> {
        if self.token.is_cancelled() {
            return Some(self.cancelled_reason());
        }
        match self.deadline {
            Some((at, timeout)) if Instant::now() >= at => Some(AbortReason::Timeout(timeout)),
            _ => None,
        }
    }

    /// Completes when the signal fires.
    pub async fn aborted(&self) -> AbortReason {
        match self.deadline {
            Some((at, timeout)) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => self.cancelled_reason(),
                    _ = sleep_until(at) => AbortReason::Timeout(timeout),
                }
            }
            None => {
                self.token.cancelled().await;
                self.cancelled_reason()
            }
        }
    }

    fn cancelled_reason(&self) -> AbortReason {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| AbortReason::Cancelled(DEFAULT_ABORT_MESSAGE.to_owned()))
    }
}

/// Composes a caller signal with a per-attempt timeout.
///
/// Returns `None` when neither is configured. A zero timeout counts as no
/// timeout. Outside a tokio runtime no deadline can be enforced, so the
/// caller signal is returned unchanged.
///
/// Every call yields a new deadline; callers compose once per attempt.
pub fn with_timeout(signal: Option<&AbortSignal>, timeout: Option<Duration>) -> Option<AbortSignal> {
    let Some(timeout) = timeout.filter(|timeout| !timeout.is_zero()) else {
        return signal.cloned();
    };

    if tokio::runtime::Handle::try_current().is_err() {
        #[cfg(feature = "tracing")]
        tracing::debug!("no tokio runtime available, timeout of {:?} not enforced", timeout);
        return signal.cloned();
    }

    let mut composed = signal.cloned().unwrap_or_default();
    let at = Instant::now() + timeout;
    composed.deadline = match composed.deadline {
        Some((existing, existing_timeout)) if existing <= at => Some((existing, existing_timeout)),
        _ => Some((at, timeout)),
    };
    Some(composed)
}

/// Sleeps for `delay`, failing early with the abort reason if `signal` fires.
pub async fn abortable_delay(
    delay: Duration,
    signal: Option<&AbortSignal>,
) -> std::result::Result<(), AbortReason> {
    let Some(signal) = signal else {
        sleep(delay).await;
        return Ok(());
    };

    if let Some(reason) = signal.reason() {
        return Err(reason);
    }

    tokio::select! {
        biased;
        reason = signal.aborted() => Err(reason),
        _ = sleep(delay) => Ok(()),
    }
}
