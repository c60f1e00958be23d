//! Bounded exponential backoff for batch-level database operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_postgres::error::SqlState;

use crate::config::MigrationConfig;
use crate::error::MigrateError;

/// Indicates whether an error should be retried or treated as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    Stop,
}

/// Result of running an operation under the retry policy.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The error was considered fatal and should bubble up immediately.
    Fatal(E),
    /// The error was retryable, but the configured attempts were exhausted.
    AttemptsExceeded(E),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: if max_delay.is_zero() {
                base_delay
            } else {
                max_delay
            },
        }
    }

    /// Build the policy from the `migration` config section.
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    /// Executes the operation with the configured retry policy.
    ///
    /// `on_retry` is called with the attempt number and the error before each
    /// backoff sleep.
    pub async fn run<F, Fut, T, E, Classifier, OnRetry>(
        &self,
        mut op: F,
        classify: Classifier,
        mut on_retry: OnRetry,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Classifier: Fn(&E) -> RetryDisposition,
        OnRetry: FnMut(usize, &E, Duration),
    {
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(result) => return Ok(result),
                Err(err) => match classify(&err) {
                    RetryDisposition::Stop => return Err(RetryError::Fatal(err)),
                    RetryDisposition::Retry => {
                        if attempt + 1 >= self.max_attempts {
                            return Err(RetryError::AttemptsExceeded(err));
                        }

                        let delay = self.backoff_delay(attempt);
                        on_retry(attempt + 1, &err, delay);
                        sleep(delay).await;
                        attempt += 1;
                    }
                },
            }
        }
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::from_millis(0);
        }

        let factor = 1u128 << attempt.min(6);
        let base_ms = self.base_delay.as_millis();
        let delay_ms = base_ms.saturating_mul(factor);
        let capped = delay_ms.min(self.max_delay.as_millis());
        Duration::from_millis(capped as u64)
    }
}

/// Classify a migration error for the retry loop.
pub fn classify_error(err: &MigrateError) -> RetryDisposition {
    match err {
        MigrateError::Source(e) => classify_mysql_error(e),
        MigrateError::Target(e) => classify_pg_error(e),
        MigrateError::Pool { .. } => RetryDisposition::Retry,
        _ => RetryDisposition::Stop,
    }
}

fn classify_mysql_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retry,
        sqlx::Error::Database(db_err) => {
            let code = db_err
                .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                .map(|e| e.number())
                .unwrap_or(0);
            let state = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            if is_retryable_mysql_server_error(code, &state) {
                RetryDisposition::Retry
            } else {
                RetryDisposition::Stop
            }
        }
        _ => RetryDisposition::Stop,
    }
}

fn is_retryable_mysql_server_error(code: u16, state: &str) -> bool {
    // lock wait timeout, deadlock, can't connect, gone away, lost connection,
    // too many connections, bad handshake
    const RETRYABLE_CODES: [u16; 8] = [1205, 1213, 2002, 2003, 2006, 2013, 1040, 1042];
    if RETRYABLE_CODES.contains(&code) {
        return true;
    }

    matches!(state, "40001" | "HYT00" | "08S01")
}

fn classify_pg_error(err: &tokio_postgres::Error) -> RetryDisposition {
    if err.is_closed() {
        return RetryDisposition::Retry;
    }

    match err.code() {
        Some(code) if is_retryable_pg_code(code) => RetryDisposition::Retry,
        _ => RetryDisposition::Stop,
    }
}

fn is_retryable_pg_code(code: &SqlState) -> bool {
    matches!(
        *code,
        SqlState::T_R_SERIALIZATION_FAILURE
            | SqlState::T_R_DEADLOCK_DETECTED
            | SqlState::LOCK_NOT_AVAILABLE
            | SqlState::TOO_MANY_CONNECTIONS
            | SqlState::ADMIN_SHUTDOWN
            | SqlState::CRASH_SHUTDOWN
            | SqlState::CANNOT_CONNECT_NOW
            | SqlState::CONNECTION_FAILURE
            | SqlState::CONNECTION_DOES_NOT_EXIST
            | SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
            | SqlState::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION
            | SqlState::CONNECTION_EXCEPTION
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(250), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(250));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(5), Duration::from_millis(1000));
    }

    #[test]
    fn test_new_clamps_attempts() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10), Duration::ZERO);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_delay, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut retries = Vec::new();

        let result: Result<u32, RetryError<&str>> = fast_policy(5)
            .run(
                || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("flaky")
                        } else {
                            Ok(7)
                        }
                    }
                },
                |_| RetryDisposition::Retry,
                |attempt, _, _| retries.push(attempt),
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_attempts_exceeded() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), RetryError<&str>> = fast_policy(3)
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("down") }
                },
                |_| RetryDisposition::Retry,
                |_, _, _| {},
            )
            .await;

        assert!(matches!(result, Err(RetryError::AttemptsExceeded("down"))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_stops_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), RetryError<&str>> = fast_policy(3)
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("syntax") }
                },
                |_| RetryDisposition::Stop,
                |_, _, _| {},
            )
            .await;

        assert!(matches!(result, Err(RetryError::Fatal("syntax"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mysql_codes() {
        assert!(is_retryable_mysql_server_error(1213, ""));
        assert!(is_retryable_mysql_server_error(0, "08S01"));
        assert!(!is_retryable_mysql_server_error(1064, "42000"));
    }

    #[test]
    fn test_classify_migrate_errors() {
        assert_eq!(
            classify_error(&MigrateError::Source(sqlx::Error::PoolClosed)),
            RetryDisposition::Retry
        );
        assert_eq!(
            classify_error(&MigrateError::Source(sqlx::Error::RowNotFound)),
            RetryDisposition::Stop
        );
        assert_eq!(
            classify_error(&MigrateError::transfer("events", "bad value")),
            RetryDisposition::Stop
        );
    }
}
