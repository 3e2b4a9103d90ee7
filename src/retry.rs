//! Bounded retry with error classification.
//!
//! Retry policy is data: callers hand [`retry`] a [`RetryPolicy`] and a pure
//! classifier, so connection setup and script application share one loop.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Whether an error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, 5 seconds apart.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

/// Final error of a retried operation together with the attempt count that produced it.
#[derive(Debug)]
pub struct RetryError<E> {
    pub error: E,
    pub attempts: u32,
    pub class: ErrorClass,
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
///
/// `label` only feeds the retry log lines.
pub async fn retry<T, E, F, Fut, C>(
    label: &str,
    policy: RetryPolicy,
    classify: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> ErrorClass,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let class = classify(&error);
                if class == ErrorClass::Permanent || attempt >= max_attempts {
                    return Err(RetryError {
                        error,
                        attempts: attempt,
                        class,
                    });
                }

                warn!(
                    "{} attempt {}/{} failed, retrying in {:?}: {}",
                    label, attempt, max_attempts, policy.delay, error
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

/// Classify a driver error as connection-loss/contention (transient) or content (permanent).
pub fn classify_sqlx(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorClass::Transient,
        sqlx::Error::Database(db) => {
            let transient_code = db.code().is_some_and(|code| is_transient_code(&code));
            if transient_code || is_contention_message(db.message()) {
                ErrorClass::Transient
            } else {
                ErrorClass::Permanent
            }
        }
        _ => ErrorClass::Permanent,
    }
}

/// Whether `err` leaves the connection it came from unusable.
///
/// A retry after one of these must run on a fresh connection.
pub fn is_connection_loss(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| code.starts_with("08")),
        _ => false,
    }
}

/// PostgreSQL SQLSTATEs and SQLite primary result codes that signal connection loss or contention.
fn is_transient_code(code: &str) -> bool {
    // class 08: connection exception
    if code.starts_with("08") {
        return true;
    }
    matches!(
        code,
        // serialization_failure, deadlock_detected, lock_not_available
        "40001" | "40P01" | "55P03"
        // too_many_connections, admin_shutdown, crash_shutdown, cannot_connect_now
        | "53300" | "57P01" | "57P02" | "57P03"
        // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
        | "5" | "6" | "261" | "517" | "262"
    )
}

fn is_contention_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("database is locked")
        || lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("terminating connection")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::ZERO)
    }

    fn io_error() -> sqlx::Error {
        sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))
    }

    #[test]
    fn test_default_policy_matches_runner_bounds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_secs(5));
    }

    #[test]
    fn test_classify_driver_errors() {
        assert_eq!(classify_sqlx(&io_error()), ErrorClass::Transient);
        assert_eq!(classify_sqlx(&sqlx::Error::PoolTimedOut), ErrorClass::Transient);
        assert_eq!(classify_sqlx(&sqlx::Error::RowNotFound), ErrorClass::Permanent);
        assert_eq!(
            classify_sqlx(&sqlx::Error::Configuration("bad url".into())),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_connection_loss_is_narrower_than_transient() {
        assert!(is_connection_loss(&io_error()));
        assert!(is_connection_loss(&sqlx::Error::PoolClosed));
        // pool exhaustion is worth a retry but the connection itself is fine
        assert!(!is_connection_loss(&sqlx::Error::PoolTimedOut));
        assert!(!is_connection_loss(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_transient_codes() {
        assert!(is_transient_code("08006"));
        assert!(is_transient_code("40P01"));
        assert!(is_transient_code("5"));
        assert!(!is_transient_code("42601"));
        assert!(!is_transient_code("23505"));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, RetryError<sqlx::Error>> =
            retry("flaky", fast(3), classify_sqlx, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(io_error())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<sqlx::Error>> =
            retry("broken", fast(3), classify_sqlx, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(sqlx::Error::RowNotFound) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(err.class, ErrorClass::Permanent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_surfaces_last_error_when_exhausted() {
        let result: Result<(), RetryError<sqlx::Error>> =
            retry("down", fast(3), classify_sqlx, |_| async { Err(io_error()) }).await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.class, ErrorClass::Transient);
    }
}
