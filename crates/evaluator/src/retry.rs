//! Bounded retries for transient store errors.

use exponential_backoff::Backoff;
use std::future::Future;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Whether a store error is worth retrying. Integrity violations and other
/// database-reported errors are deterministic and are surfaced immediately;
/// only connectivity-shaped failures and deadlock/serialization aborts
/// qualify.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("40001") | Some("40P01") // serialization failure, deadlock
        ),
        _ => false,
    }
}

/// Run a store operation with up to three attempts, backing off 1s then 2s.
pub async fn with_store_retries<T, F, Fut>(op_name: &str, mut op: F) -> sqlx::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = sqlx::Result<T>>,
{
    let mut backoff = Backoff::new(MAX_ATTEMPTS, BASE_DELAY, None::<Duration>);
    backoff.set_factor(2);
    backoff.set_jitter(0.0);

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < MAX_ATTEMPTS => {
                let delay = backoff.next(attempt).unwrap_or(BASE_DELAY);
                tracing::warn!(op_name, attempt, ?err, ?delay, "transient store error, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if is_transient(&err) {
                    tracing::warn!(op_name, attempt, ?err, "transient store error, giving up");
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn integrity_violations_are_not_transient() {
        assert!(!is_transient(&sqlx::Error::RowNotFound));
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(is_transient(&sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_store_retries("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: sqlx::Result<()> = with_store_retries("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::PoolTimedOut) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: sqlx::Result<()> = with_store_retries("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
