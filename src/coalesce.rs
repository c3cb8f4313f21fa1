//! Fetch coalescing
//!
//! When several concurrent requests hit the same page, tags marked
//! `coalesce="true"` should produce one backend call, not one per caller.
//! The coalescer keys in-flight fetches by entity fingerprint: the first
//! caller drives the fetch, everyone else subscribes to its result. The
//! map entry is removed before the result is broadcast, so callers
//! arriving after completion start a fresh fetch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::error::{EsiError, Result};

/// Deduplicates concurrent fetches sharing a fingerprint. `T` is the
/// broadcast result payload; cloning it must be cheap.
pub struct Coalescer<T> {
    inflight: Mutex<HashMap<u64, broadcast::Sender<Result<T>>>>,
}

impl<T> Default for Coalescer<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Coalescer<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Coalescer {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `fetch` under the key, or subscribe to an already-running fetch
    /// with the same key. Returns the result plus whether this caller
    /// drove the backend call.
    ///
    /// The critical sections on the map are a lookup, an insert and a
    /// remove; the fetch itself runs without the lock.
    pub async fn run<F, Fut>(&self, key: u64, fetch: F) -> (Result<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        enum Slot<T> {
            Join(broadcast::Receiver<Result<T>>),
            Lead(broadcast::Sender<Result<T>>),
        }

        let slot = {
            let mut inflight = self.inflight.lock().expect("coalescer lock poisoned");
            if let Some(tx) = inflight.get(&key) {
                Slot::Join(tx.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                inflight.insert(key, tx.clone());
                Slot::Lead(tx)
            }
        };

        let tx = match slot {
            Slot::Join(mut rx) => {
                let result = match rx.recv().await {
                    Ok(result) => result,
                    // The driving fetch was dropped before broadcasting.
                    Err(_) => Err(EsiError::Temporary(
                        "coalesced fetch was abandoned by its leader".into(),
                    )),
                };
                return (result, false);
            }
            Slot::Lead(tx) => tx,
        };

        // If this future is cancelled mid-fetch the entry must not leak:
        // dropping the guard (and with it the only sender) unblocks every
        // subscriber with a recv error.
        let mut cleanup = Cleanup {
            inflight: &self.inflight,
            key,
            armed: true,
        };

        let result = fetch().await;

        self.inflight
            .lock()
            .expect("coalescer lock poisoned")
            .remove(&key);
        cleanup.armed = false;
        let _ = tx.send(result.clone());
        (result, true)
    }

    /// Number of fetches currently in flight; used by tests.
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().expect("coalescer lock poisoned").len()
    }
}

struct Cleanup<'a, T> {
    inflight: &'a Mutex<HashMap<u64, broadcast::Sender<Result<T>>>>,
    key: u64,
    armed: bool,
}

impl<T> Drop for Cleanup<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut inflight) = self.inflight.lock() {
                inflight.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_caller_drives_fetch() {
        let coalescer = Coalescer::new();
        let (result, drove) = coalescer.run(1, || async { Ok("payload".to_string()) }).await;
        assert_eq!(result.unwrap(), "payload");
        assert!(drove);
        assert_eq!(coalescer.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let coalescer = Arc::new(Coalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..200 {
            let coalescer = coalescer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .run(42, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok("shared".to_string())
                    })
                    .await
            }));
        }

        let mut drivers = 0;
        for handle in handles {
            let (result, drove) = handle.await.unwrap();
            assert_eq!(result.unwrap(), "shared");
            if drove {
                drivers += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one backend call");
        assert_eq!(drivers, 1);
        assert_eq!(coalescer.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let coalescer = Arc::new(Coalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for key in 0..10u64 {
            let coalescer = coalescer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .run(key, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(key)
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().0.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_errors_are_broadcast_too() {
        let coalescer = Arc::new(Coalescer::new());

        let leader = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .run(7, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<String, _>(EsiError::Timeout("backend too slow".into()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (result, drove) = coalescer.run(7, || async { Ok("never runs".into()) }).await;

        assert!(!drove);
        assert!(result.unwrap_err().is_transient());
        leader.await.unwrap().0.unwrap_err();
    }

    #[tokio::test]
    async fn test_key_is_released_after_completion() {
        let coalescer = Coalescer::new();
        let (first, _) = coalescer.run(9, || async { Ok(1u32) }).await;
        assert_eq!(first.unwrap(), 1);
        // No entry left; the next caller drives a fresh fetch.
        let (second, drove) = coalescer.run(9, || async { Ok(2u32) }).await;
        assert_eq!(second.unwrap(), 2);
        assert!(drove);
    }
}
