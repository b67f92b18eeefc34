//! Retry helper for transient store failures.

use std::time::Duration;

use crate::config::StoreConfig;
use crate::error::{Error, Result};

const INITIAL_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Attempts after the first one
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    /// 500ms doubling per attempt, capped at 30s.
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            initial_delay: INITIAL_DELAY,
            max_delay: MAX_DELAY,
        }
    }

    /// Retry without sleeping (for tests).
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn from_config(store: &StoreConfig) -> Self {
        Self::new(store.max_retries)
    }
}

/// Run `op`, retrying errors for which [`Error::is_retryable`] holds.
///
/// Non-retryable errors are returned immediately. After the last attempt the
/// final error is returned.
pub fn with_backoff<T, F>(backoff: &Backoff, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut delay = backoff.initial_delay;
    let mut last_error: Option<Error> = None;

    for attempt in 0..=backoff.max_retries {
        if attempt > 0 {
            tracing::debug!(
                operation = what,
                attempt = attempt + 1,
                max_attempts = backoff.max_retries + 1,
                delay_ms = delay.as_millis() as u64,
                "Retrying"
            );
            std::thread::sleep(delay);
            delay = std::cmp::min(delay * 2, backoff.max_delay);
        }

        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                tracing::warn!(operation = what, error = %e, "Transient store failure");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error
        .unwrap_or_else(|| Error::StoreUnavailable(format!("{}: max retries exceeded", what))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_transient_failures() {
        let mut calls = 0;
        let result = with_backoff(&Backoff::immediate(3), "put", || {
            calls += 1;
            if calls < 3 {
                Err(Error::StoreUnavailable("busy".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let mut calls = 0;
        let result: Result<()> = with_backoff(&Backoff::immediate(2), "put", || {
            calls += 1;
            Err(Error::StoreUnavailable("busy".to_string()))
        });
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_does_not_retry_invalid_event() {
        let mut calls = 0;
        let result: Result<()> = with_backoff(&Backoff::immediate(5), "apply", || {
            calls += 1;
            Err(Error::InvalidEvent("negative length".to_string()))
        });
        assert!(matches!(result, Err(Error::InvalidEvent(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_default_schedule() {
        let backoff = Backoff::from_config(&StoreConfig::default());
        assert_eq!(backoff.max_retries, 3);
        assert_eq!(backoff.initial_delay, Duration::from_millis(500));
        assert_eq!(backoff.max_delay, Duration::from_secs(30));
    }
}
