use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::CourierError;

/// Pipeline stage an attempt failed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Stage {
    Building,
    RequestInterceptors,
    Throttle,
    Executing,
    ResponseInterceptors,
    Validating,
    Decoding,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Building => "building",
            Self::RequestInterceptors => "request_interceptors",
            Self::Throttle => "throttle",
            Self::Executing => "executing",
            Self::ResponseInterceptors => "response_interceptors",
            Self::Validating => "validating",
            Self::Decoding => "decoding",
        };
        f.write_str(text)
    }
}

#[derive(Debug)]
pub(crate) struct AttemptFailure {
    pub(crate) stage: Stage,
    pub(crate) error: CourierError,
}

impl AttemptFailure {
    pub(crate) fn at(stage: Stage) -> impl FnOnce(CourierError) -> Self {
        move |error| Self { stage, error }
    }
}

/// Whether `error` may be recovered by another attempt.
///
/// Only transport and status failures qualify; failures raised by
/// interceptors are final even when they carry a retryable error kind.
pub(crate) fn is_retryable(
    stage: Stage,
    error: &CourierError,
    retry_status_codes: &BTreeSet<u16>,
) -> bool {
    if !matches!(stage, Stage::Executing | Stage::Validating) {
        return false;
    }
    match error {
        CourierError::Network { .. } | CourierError::Timeout { .. } => true,
        CourierError::Http { status, .. } => {
            (500..=599).contains(status) || retry_status_codes.contains(status)
        }
        _ => false,
    }
}

/// Attempt budget of one logical request.
#[derive(Clone, Debug)]
pub(crate) struct RetryState {
    configured: usize,
    remaining: usize,
    base_delay: Duration,
}

impl RetryState {
    pub(crate) fn new(retries: usize, base_delay: Duration) -> Self {
        Self {
            configured: retries,
            remaining: retries,
            base_delay,
        }
    }

    /// Attempts already consumed by retries.
    pub(crate) fn consumed(&self) -> usize {
        self.configured - self.remaining
    }

    /// Consumes one retry for `failure` and returns the backoff to wait, or
    /// `None` when the failure is terminal.
    pub(crate) fn next_delay(
        &mut self,
        failure: &AttemptFailure,
        retry_status_codes: &BTreeSet<u16>,
    ) -> Option<Duration> {
        if self.remaining == 0 || !is_retryable(failure.stage, &failure.error, retry_status_codes) {
            return None;
        }
        let delay = backoff_delay(self.base_delay, self.consumed());
        self.remaining -= 1;
        Some(delay)
    }
}

/// `base * 2^consumed`, with the exponent capped at 16.
pub(crate) fn backoff_delay(base: Duration, consumed: usize) -> Duration {
    let exp = consumed.min(16) as u32;
    base.saturating_mul(1u32 << exp)
}
