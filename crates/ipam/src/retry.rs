//! Optimistic-concurrency retry.
//!
//! Every read-modify-write of a shared record goes through
//! [`with_optimistic_retry`]: fetch the current version, compute the change,
//! write it conditionally, and start over from a fresh fetch when the write
//! lost against a concurrent writer. There is no delay between attempts.

use crate::error::{IpamError, StoreError};
use std::future::Future;
use tracing::debug;

/// Attempts made before a contended update is given up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Outcome of the compute step.
#[derive(Debug)]
pub enum Mutation<T, R> {
    /// Write the new version of the record, then return the value.
    Write(T, R),
    /// Nothing to write; return the value.
    Done(R),
}

/// Runs `fetch` -> `mutate` -> `write` until a write succeeds.
///
/// A [`StoreError::Conflict`] from `write` restarts the whole sequence with a
/// new fetch. Any other error, including errors returned by `mutate`, ends the
/// loop immediately. After `max_attempts` conflicts the result is
/// [`IpamError::AllocationConflict`].
pub async fn with_optimistic_retry<T, R, F, FFut, M, W, WFut>(
    resource: &str,
    max_attempts: usize,
    mut fetch: F,
    mut mutate: M,
    mut write: W,
) -> Result<R, IpamError>
where
    F: FnMut() -> FFut,
    FFut: Future<Output = Result<T, IpamError>>,
    M: FnMut(T) -> Result<Mutation<T, R>, IpamError>,
    W: FnMut(T) -> WFut,
    WFut: Future<Output = Result<(), StoreError>>,
{
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let current = fetch().await?;

        let (next, value) = match mutate(current)? {
            Mutation::Done(value) => return Ok(value),
            Mutation::Write(next, value) => (next, value),
        };

        match write(next).await {
            Ok(()) => return Ok(value),
            Err(StoreError::Conflict(msg)) => {
                debug!(
                    "Conflict updating {} (attempt {}/{}): {}",
                    resource, attempt, max_attempts, msg
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(IpamError::AllocationConflict {
        resource: resource.to_string(),
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_conflict_refetches_and_recomputes() {
        let version = Mutex::new(0u32);
        let fetches = AtomicUsize::new(0);
        let mut conflicts_left = 2;

        let result = with_optimistic_retry(
            "counter",
            5,
            || {
                fetches.fetch_add(1, Ordering::SeqCst);
                let v = *version.lock().unwrap();
                async move { Ok(v) }
            },
            |v| Ok(Mutation::Write(v + 1, v + 1)),
            |next| {
                let outcome = if conflicts_left > 0 {
                    conflicts_left -= 1;
                    // Someone else bumped the record in between
                    *version.lock().unwrap() += 10;
                    Err(StoreError::Conflict("stale".to_string()))
                } else {
                    *version.lock().unwrap() = next;
                    Ok(())
                };
                async move { outcome }
            },
        )
        .await
        .unwrap();

        assert_eq!(result, 21);
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
        assert_eq!(*version.lock().unwrap(), 21);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_report_conflict() {
        let writes = AtomicUsize::new(0);

        let result: Result<(), _> = with_optimistic_retry(
            "pool default",
            3,
            || async { Ok(()) },
            |()| Ok(Mutation::Write((), ())),
            |()| {
                writes.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Conflict("stale".to_string())) }
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(IpamError::AllocationConflict { attempts: 3, .. })
        ));
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_done_skips_write() {
        let writes = AtomicUsize::new(0);

        let result = with_optimistic_retry(
            "pool default",
            5,
            || async { Ok(7u32) },
            |v| Ok(Mutation::Done(v)),
            |_| {
                writes.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mutate_error_aborts_without_retry() {
        let fetches = AtomicUsize::new(0);

        let result: Result<(), _> = with_optimistic_retry(
            "pool default",
            5,
            || {
                fetches.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            |()| Err(IpamError::PoolExhausted("default".to_string())),
            |()| async { Ok(()) },
        )
        .await;

        assert!(matches!(result, Err(IpamError::PoolExhausted(_))));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_store_errors_are_not_retried() {
        let result: Result<(), _> = with_optimistic_retry(
            "pool default",
            5,
            || async { Ok(()) },
            |()| Ok(Mutation::Write((), ())),
            |()| async { Err(StoreError::Unavailable("connection refused".to_string())) },
        )
        .await;

        assert!(matches!(result, Err(IpamError::Store(StoreError::Unavailable(_)))));
    }
}
