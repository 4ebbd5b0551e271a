use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Bounded retry with exponential backoff, shared by the worker (transient engine
/// errors) and the sink (lock contention).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry; doubles on each following one.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff_ms: 0,
        }
    }

    /// Sleep before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor)).min(MAX_BACKOFF)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or retries run out.
    /// Returns the final result together with the number of attempts made.
    ///
    /// Blocks the calling thread while backing off; call from blocking contexts only.
    pub fn run<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, E>,
        retryable: impl Fn(&E) -> bool,
    ) -> (Result<T, E>, u32) {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Err(e) if retryable(&e) && attempt <= self.retries => {
                    let delay = self.delay(attempt);
                    tracing::debug!(
                        event = "retry.backoff",
                        attempt,
                        delay_ms = delay.as_millis() as u64
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                other => return (other, attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let p = RetryPolicy {
            retries: 3,
            backoff_ms: 100,
        };
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(400));
        assert_eq!(p.delay(30), MAX_BACKOFF);
    }

    #[test]
    fn stops_after_retries_exhausted() {
        let p = RetryPolicy {
            retries: 2,
            backoff_ms: 1,
        };
        let (res, attempts) = p.run(|_| Err::<(), _>("locked"), |_| true);
        assert!(res.is_err());
        assert_eq!(attempts, 3);
    }

    #[test]
    fn non_retryable_fails_on_first_attempt() {
        let p = RetryPolicy::default();
        let (res, attempts) = p.run(|_| Err::<(), _>("bad path"), |_| false);
        assert!(res.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn succeeds_after_transient() {
        let p = RetryPolicy {
            retries: 3,
            backoff_ms: 1,
        };
        let (res, attempts) = p.run(|n| if n < 3 { Err("busy") } else { Ok(n) }, |_| true);
        assert_eq!(res, Ok(3));
        assert_eq!(attempts, 3);
    }
}
