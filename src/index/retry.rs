//! Deadlock/serialization-failure retry wrapper (`spec.md` §4.1, §7).
//!
//! Postgres reports lock contention it cannot resolve itself via
//! SQLSTATE `40P01` (deadlock_detected) or `40001`
//! (serialization_failure). Both are safe to retry: the failed
//! transaction made no durable change. Anything else is a real error
//! and is returned immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::IndexError;

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_MIN_MS: u64 = 50;
const BACKOFF_MAX_MS: u64 = 500;

fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(db_err.code().as_deref(), Some("40P01") | Some("40001")),
        _ => false,
    }
}

/// Run `op` (a short, self-contained transaction) up to [`MAX_ATTEMPTS`]
/// times, backing off a random interval in `[50, 500] ms` between
/// attempts whenever Postgres reports a deadlock or serialization
/// failure. On persistent failure the error is returned for the
/// caller to log and re-surface at the next update tick, per
/// `spec.md` §4.1.
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, IndexError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(val) => return Ok(val),
            Err(err) if is_retryable(&err) && attempt < MAX_ATTEMPTS => {
                let backoff_ms = rand::thread_rng().gen_range(BACKOFF_MIN_MS..=BACKOFF_MAX_MS);
                log::warn!(
                    "data index deadlock/serialization failure (attempt {}/{}), retrying in {} ms",
                    attempt,
                    MAX_ATTEMPTS,
                    backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
            Err(err) if is_retryable(&err) => return Err(IndexError::Deadlock),
            Err(err) => return Err(err.into()),
        }
    }
}
