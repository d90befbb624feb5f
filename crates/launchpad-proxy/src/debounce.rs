//! Single-flight debouncing of concurrent calls sharing a key.
//!
//! The first caller for a key runs the operation; callers arriving while it
//! runs wait and receive a clone of its result. If the running caller is
//! dropped before it finishes, the next waiter runs the operation instead.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

struct Entry<T> {
    result: tokio::sync::Mutex<Option<T>>,
    participants: Mutex<usize>,
}

pub struct Debouncer<T> {
    entries: Arc<Mutex<HashMap<String, Arc<Entry<T>>>>>,
}

impl<T> Default for Debouncer<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> Clone for Debouncer<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T: Clone> Debouncer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` once for every burst of calls on `key`.
    pub async fn wait<F, Fut>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let participant = self.join(key);
        let mut slot = participant.entry.result.lock().await;
        if let Some(result) = slot.as_ref() {
            debug!(key, "debounced call received shared result");
            return result.clone();
        }

        let result = f().await;
        *slot = Some(result.clone());
        self.remove(key, &participant.entry);
        result
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn join(&self, key: &str) -> Participant<T> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Entry {
                    result: tokio::sync::Mutex::new(None),
                    participants: Mutex::new(0),
                })
            })
            .clone();
        *entry
            .participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        Participant {
            debouncer: self.clone(),
            key: key.to_string(),
            entry,
        }
    }

    fn remove(&self, key: &str, entry: &Arc<Entry<T>>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            entries.remove(key);
        }
    }
}

/// A caller registered on an entry. The last one out removes an entry
/// that never produced a result.
struct Participant<T> {
    debouncer: Debouncer<T>,
    key: String,
    entry: Arc<Entry<T>>,
}

impl<T> Drop for Participant<T> {
    fn drop(&mut self) {
        let mut entries = self
            .debouncer
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut participants = self
            .entry
            .participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *participants -= 1;
        if *participants == 0
            && entries
                .get(&self.key)
                .is_some_and(|current| Arc::ptr_eq(current, &self.entry))
        {
            entries.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let debouncer: Debouncer<Result<u32, String>> = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let calls = (0..10).map(|_| {
            let debouncer = debouncer.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                debouncer
                    .wait("proxy-shop-api", || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
            })
        });
        for result in futures::future::join_all(calls).await {
            assert_eq!(result.unwrap(), Ok(7));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.in_flight(), 0);
    }

    #[tokio::test]
    async fn errors_are_replayed_to_waiters() {
        let debouncer: Debouncer<Result<(), String>> = Debouncer::new();
        let (a, b) = tokio::join!(
            debouncer.wait("k", || async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err("service (shop:api) could not be started".to_string())
            }),
            debouncer.wait("k", || async { Ok(()) }),
        );
        assert_eq!(a, b);
        assert!(a.is_err());
    }

    #[tokio::test]
    async fn completed_key_runs_again() {
        let debouncer: Debouncer<u32> = Debouncer::new();
        assert_eq!(debouncer.wait("k", || async { 1 }).await, 1);
        assert_eq!(debouncer.in_flight(), 0);
        assert_eq!(debouncer.wait("k", || async { 2 }).await, 2);
    }

    #[tokio::test]
    async fn waiter_takes_over_from_cancelled_leader() {
        let debouncer: Debouncer<u32> = Debouncer::new();

        let leader = {
            let debouncer = debouncer.clone();
            tokio::spawn(async move {
                debouncer
                    .wait("k", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let follower = {
            let debouncer = debouncer.clone();
            tokio::spawn(async move { debouncer.wait("k", || async { 2 }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        let result = tokio::time::timeout(Duration::from_secs(1), follower)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(debouncer.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_lone_caller_leaves_no_entry() {
        let debouncer: Debouncer<u32> = Debouncer::new();
        let call = debouncer.wait("k", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            1
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(10), call)
                .await
                .is_err()
        );
        assert_eq!(debouncer.in_flight(), 0);
    }
}
