//! Per key mutual exclusion
//!
//! Every mutation of an account runs under the lock of its "tenant:name"
//! key. Locks are created on first use and dropped once the last holder or
//! waiter is gone. Keys are locked in the order given by the caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    refs: usize,
}

#[derive(Default)]
pub struct Guardian {
    locks: Mutex<HashMap<String, Entry>>,
}

/// Held locks, released and reclaimed on drop
struct Held<'a> {
    guardian: &'a Guardian,
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        let mut locks = self.guardian.locks.lock();
        for key in &self.keys {
            if let Some(entry) = locks.get_mut(key) {
                entry.refs -= 1;
                if entry.refs == 0 {
                    locks.remove(key);
                }
            }
        }
    }
}

impl Guardian {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` holding the locks of `keys`
    ///
    /// A non zero `timeout` only produces a warning when `f` runs past it;
    /// the locks stay held until `f` completes.
    pub async fn guard<F, Fut, T>(&self, keys: &[String], timeout: Duration, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut unique: Vec<String> = Vec::with_capacity(keys.len());
        for k in keys {
            if !unique.contains(k) {
                unique.push(k.clone());
            }
        }

        let handles: Vec<Arc<AsyncMutex<()>>> = {
            let mut locks = self.locks.lock();
            unique
                .iter()
                .map(|k| {
                    let entry = locks.entry(k.clone()).or_insert_with(|| Entry {
                        lock: Arc::new(AsyncMutex::new(())),
                        refs: 0,
                    });
                    entry.refs += 1;
                    entry.lock.clone()
                })
                .collect()
        };

        let mut held = Held {
            guardian: self,
            keys: unique,
            guards: Vec::with_capacity(handles.len()),
        };
        for h in handles {
            held.guards.push(h.lock_owned().await);
        }

        let fut = f();
        let out = if timeout.is_zero() {
            fut.await
        } else {
            tokio::pin!(fut);
            tokio::select! {
                out = &mut fut => out,
                _ = tokio::time::sleep(timeout) => {
                    warn!(keys = ?held.keys, ?timeout, "guardian timeout, still waiting for the locked operation");
                    fut.await
                }
            }
        };
        drop(held);
        out
    }

    /// Number of keys currently locked or waited on
    pub fn active_keys(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_serializes_same_key() {
        let g = Arc::new(Guardian::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let g = g.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                g.guard(&["test:dan".to_string()], Duration::ZERO, || async move {
                    let n = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(n, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(g.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_observational() {
        let g = Guardian::new();
        let out = g
            .guard(&["k".to_string()], Duration::from_millis(1), || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                42
            })
            .await;
        assert_eq!(out, 42);
        assert_eq!(g.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_keys_do_not_deadlock() {
        let g = Guardian::new();
        let keys = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let out = g.guard(&keys, Duration::ZERO, || async move { "done" }).await;
        assert_eq!(out, "done");
    }
}
