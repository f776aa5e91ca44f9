use crate::errors::HostError;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct HostLockState {
    locked: bool,
    queue: VecDeque<oneshot::Sender<HostLockGuard>>,
}

#[derive(Debug)]
struct HostLock {
    host_id: String,
    state: Mutex<HostLockState>,
}

/// Per-host FIFO mutex serializing authentication attempts.
///
/// Repeated parallel logins against one account trip PAM-style lockouts, so
/// every handshake against a host runs under its lock. Entries are created
/// lazily and kept for the lifetime of the table.
#[derive(Debug, Clone, Default)]
pub struct HostLockTable {
    locks: Arc<DashMap<String, Arc<HostLock>>>,
}

#[derive(Debug)]
pub struct HostLockGuard {
    lock: Arc<HostLock>,
    released: AtomicBool,
}

impl HostLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, host_id: &str) -> Arc<HostLock> {
        self.locks
            .entry(host_id.to_string())
            .or_insert_with(|| {
                Arc::new(HostLock {
                    host_id: host_id.to_string(),
                    state: Mutex::new(HostLockState::default()),
                })
            })
            .clone()
    }

    pub async fn acquire(&self, host_id: &str) -> HostLockGuard {
        let lock = self.entry(host_id);
        loop {
            let receiver = {
                let mut state = lock.lock_state();
                if !state.locked {
                    state.locked = true;
                    return HostLockGuard {
                        lock: lock.clone(),
                        released: AtomicBool::new(false),
                    };
                }
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(tx);
                rx
            };
            if let Ok(guard) = receiver.await {
                return guard;
            }
        }
    }

    pub async fn acquire_timeout(
        &self,
        host_id: &str,
        timeout: Duration,
    ) -> Result<HostLockGuard, HostError> {
        tokio::time::timeout(timeout, self.acquire(host_id))
            .await
            .map_err(|_| {
                HostError::lock_timeout(format!(
                    "Timed out after {}ms waiting for the authentication lock on '{}'",
                    timeout.as_millis(),
                    host_id
                ))
            })
    }

    pub fn is_locked(&self, host_id: &str) -> bool {
        self.locks
            .get(host_id)
            .map(|lock| {
                let state = lock.lock_state();
                state.locked
            })
            .unwrap_or(false)
    }

    pub fn waiting(&self, host_id: &str) -> usize {
        self.locks
            .get(host_id)
            .map(|lock| {
                let state = lock.lock_state();
                state.queue.len()
            })
            .unwrap_or(0)
    }
}

impl HostLock {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, HostLockState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.lock_state();
        while let Some(waiter) = state.queue.pop_front() {
            let next = HostLockGuard {
                lock: self.clone(),
                released: AtomicBool::new(false),
            };
            match waiter.send(next) {
                Ok(()) => return,
                Err(unclaimed) => unclaimed.released.store(true, Ordering::SeqCst),
            }
        }
        state.locked = false;
    }
}

impl HostLockGuard {
    pub fn host_id(&self) -> &str {
        &self.lock.host_id
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.lock.release();
        }
    }
}

impl Drop for HostLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serializes_same_host_and_ignores_others() {
        let table = HostLockTable::new();
        let a = table.acquire("a").await;
        let _b = table.acquire("b").await;
        assert!(table.is_locked("a"));
        assert!(table.is_locked("b"));

        let contender = {
            let table = table.clone();
            tokio::spawn(async move { table.acquire("a").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(table.waiting("a"), 1);
        assert!(!contender.is_finished());

        drop(a);
        let next = contender.await.unwrap();
        assert_eq!(next.host_id(), "a");
        assert!(table.is_locked("a"));
        drop(next);
        assert!(!table.is_locked("a"));
    }

    #[tokio::test]
    async fn acquire_timeout_reports_lock_timeout() {
        let table = HostLockTable::new();
        let _held = table.acquire("h1").await;
        let err = table
            .acquire_timeout("h1", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::LockTimeout);
    }

    #[tokio::test]
    async fn abandoned_waiter_is_skipped() {
        let table = HostLockTable::new();
        let held = table.acquire("h1").await;
        let _ = table.acquire_timeout("h1", Duration::from_millis(10)).await;
        drop(held);
        assert!(!table.is_locked("h1"));
        let again = table.acquire_timeout("h1", Duration::from_millis(50)).await;
        assert!(again.is_ok());
    }
}
