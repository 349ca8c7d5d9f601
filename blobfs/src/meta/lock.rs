//! Named mutual exclusion keyed by string, with bounded waiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

#[derive(Clone, Default)]
pub struct NamedLocks {
    locks: LockMap,
}

/// Held lock; the name is released on drop.
pub struct NamedLockGuard {
    name: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        release_if_idle(&self.locks, &self.name);
    }
}

fn release_if_idle(locks: &LockMap, name: &str) {
    let Ok(mut map) = locks.lock() else {
        return;
    };
    // One reference lives in the map; anything more is a waiter.
    if map.get(name).is_some_and(|m| Arc::strong_count(m) == 1) {
        map.remove(name);
    }
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Option<Arc<Mutex<()>>> {
        let mut map = self.locks.lock().ok()?;
        Some(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        )
    }

    /// Take the lock without waiting. `None` if another task holds it.
    pub fn try_acquire(&self, name: &str) -> Option<NamedLockGuard> {
        let mutex = self.entry(name)?;
        match mutex.try_lock_owned() {
            Ok(guard) => Some(NamedLockGuard {
                name: name.to_string(),
                locks: self.locks.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                release_if_idle(&self.locks, name);
                None
            }
        }
    }

    /// Take the lock, waiting at most `timeout`.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Option<NamedLockGuard> {
        let mutex = self.entry(name)?;
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Some(NamedLockGuard {
                name: name.to_string(),
                locks: self.locks.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                release_if_idle(&self.locks, name);
                None
            }
        }
    }

    /// Wait until the current holder of `name` releases it. Returns `false`
    /// if `timeout` elapsed first.
    pub async fn wait(&self, name: &str, timeout: Duration) -> bool {
        self.acquire(name, timeout).await.is_some()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .lock()
            .ok()
            .and_then(|map| map.get(name).map(|m| m.try_lock().is_err()))
            .unwrap_or(false)
    }
}
