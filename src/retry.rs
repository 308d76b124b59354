//! Bounded exponential backoff shared by feed fetches and message delivery.
//!
//! Errors describe themselves through [`Classify`]; the controller owns every
//! policy decision (delay, budget, credential refresh) so callers never branch
//! on status codes themselves.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{error, warn};

use crate::credential::{CredentialError, CredentialRefresher};

/// How the controller should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Refresh the credential, then retry once outside the attempt budget.
    AuthExpired,
    /// Back off at least the policy floor or the upstream hint, whichever is longer.
    RateLimited(Option<Duration>),
    Transient,
    /// Do not retry.
    Fatal,
}

pub trait Classify {
    fn class(&self) -> ErrorClass;

    /// Taxonomy label used in logs.
    fn kind(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Minimum wait after a rate-limit signal.
    pub rate_limit_floor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
            rate_limit_floor: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, class: ErrorClass) -> Duration {
        // Clamp in float seconds; the raw product overflows `Duration` after ~60 doublings.
        let exp = self.multiplier.powi(attempt.saturating_sub(1).min(1_000) as i32);
        let secs = (self.base_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        let mut delay = Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let spread = (delay.as_millis() / 4) as u64;
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
        }
        if let ErrorClass::RateLimited(hint) = class {
            delay = delay
                .max(self.rate_limit_floor)
                .max(hint.unwrap_or_default());
        }
        delay
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("non-retryable failure: {0}")]
    Fatal(E),

    #[error("credential rejected again after refresh: {0}")]
    AuthRejected(E),

    #[error("credential refresh failed: {0}")]
    RefreshFailed(CredentialError),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Fatal(e) | RetryError::AuthRejected(e) => Some(e),
            RetryError::RefreshFailed(_) => None,
        }
    }
}

/// Run `op` under `policy`.
///
/// An `AuthExpired` failure invokes `refresher` before any delay and grants
/// exactly one extra attempt; a second `AuthExpired` surfaces as
/// [`RetryError::AuthRejected`]. Without a refresher it is fatal.
pub async fn execute<T, E, Op, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    refresher: Option<&CredentialRefresher<'_>>,
    mut op: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;
    let mut refreshed = false;

    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        match err.class() {
            ErrorClass::Fatal => {
                error!(operation, attempt, kind = err.kind(), "Non-retryable failure: {err}");
                return Err(RetryError::Fatal(err));
            }
            ErrorClass::AuthExpired => {
                let Some(refresher) = refresher else {
                    error!(operation, attempt, kind = err.kind(), "Authorization rejected: {err}");
                    return Err(RetryError::Fatal(err));
                };
                if refreshed {
                    error!(
                        operation,
                        attempt,
                        kind = err.kind(),
                        "Authorization rejected after refresh: {err}"
                    );
                    return Err(RetryError::AuthRejected(err));
                }
                refreshed = true;
                warn!(operation, attempt, kind = err.kind(), "Credential expired, refreshing");
                refresher.holder.invalidate();
                refresher
                    .refresh("upstream rejected credential")
                    .await
                    .map_err(RetryError::RefreshFailed)?;
                attempt -= 1;
            }
            class @ (ErrorClass::RateLimited(_) | ErrorClass::Transient) => {
                if attempt >= max_attempts {
                    error!(
                        operation,
                        attempts = attempt,
                        kind = err.kind(),
                        "Retries exhausted: {err}"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                let delay = policy.delay_for(attempt, class);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    kind = err.kind(),
                    "{err} — retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
