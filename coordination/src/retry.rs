//! Retry Executor — bounded-attempt wrapper with backoff and a notify hook.
//!
//! Used by the Moderator (§4.1 step 5) and the Executor's fallback chain
//! (§4.5 step 8). Checks the control plane before each attempt and treats
//! cancellation as terminal rather than retryable (spec §5 "Retry").

use std::future::Future;
use std::time::Duration;

use crate::control::{Control, ControlError};

#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// Fixed delay between attempts.
    Fixed(Duration),
    /// `base * 2^attempt`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { base, max } => {
                let scaled = base.as_millis().saturating_mul(1u128 << attempt.min(20));
                Duration::from_millis(scaled.min(max.as_millis()) as u64)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(500),
                max: Duration::from_secs(30),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("workflow cancelled during retry")]
    Cancelled,

    #[error("exhausted {attempts} attempt(s): {source}")]
    Exhausted { attempts: u32, source: E },
}

/// A notification fired before each attempt and after each failure, used to
/// surface retry counts into `TaskState.retries` / logging without coupling
/// this module to those concerns.
pub trait RetryNotify<E> {
    fn before_attempt(&mut self, _attempt: u32) {}
    fn after_failure(&mut self, _attempt: u32, _err: &E) {}
}

/// No-op notifier for call sites that don't care.
pub struct NoopNotify;
impl<E> RetryNotify<E> for NoopNotify {}

/// Run `op` up to `policy.max_attempts` times. `op` is re-invoked fresh on
/// each attempt (it's an `FnMut` returning a future, not a single future),
/// since most retryable operations (subprocess invocations, HTTP calls)
/// aren't safely re-pollable once failed.
pub async fn retry<T, E, F, Fut>(
    control: &Control,
    policy: &RetryPolicy,
    mut notify: impl RetryNotify<E>,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        if let Err(ControlError::Cancelled) = control.check_cancelled() {
            return Err(RetryError::Cancelled);
        }
        notify.before_attempt(attempt);

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                notify.after_failure(attempt, &err);
                if attempt >= policy.max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
                let delay = policy.backoff.delay_for(attempt - 1);
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let control = Control::new();
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
        };
        let calls = AtomicU32::new(0);
        let result: Result<&str, RetryError<&str>> = retry(&control, &policy, NoopNotify, |_attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let control = Control::new();
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
        };
        let result: Result<(), RetryError<&str>> =
            retry(&control, &policy, NoopNotify, |_| async { Err("nope") }).await;
        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 2),
            _ => panic!("expected exhaustion"),
        }
    }

    #[tokio::test]
    async fn cancellation_is_terminal() {
        let control = Control::new();
        control.cancel();
        let policy = RetryPolicy::default();
        let result: Result<(), RetryError<&str>> =
            retry(&control, &policy, NoopNotify, |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
