use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

#[derive(Debug)]
struct LimiterState {
    active: usize,
    queue: VecDeque<oneshot::Sender<SlotGuard>>,
}

#[derive(Debug)]
struct LimiterInner {
    max: usize,
    state: Mutex<LimiterState>,
}

/// Caps the number of handshakes in flight across all hosts.
///
/// Waiters are served strictly FIFO. A slot is handed directly from the
/// releasing guard to the next waiter, so the active count never dips while
/// someone is queued.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    inner: Arc<LimiterInner>,
}

/// Holds one global connection slot; releasing is idempotent and also
/// happens on drop.
#[derive(Debug)]
pub struct SlotGuard {
    inner: Arc<LimiterInner>,
    released: AtomicBool,
}

impl ConnectionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                max: max.max(1),
                state: Mutex::new(LimiterState {
                    active: 0,
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    pub async fn wait_for_slot(&self) -> SlotGuard {
        loop {
            let receiver = {
                let mut state = self.lock_state();
                if state.active < self.inner.max && state.queue.is_empty() {
                    state.active += 1;
                    return SlotGuard {
                        inner: self.inner.clone(),
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

    pub fn active(&self) -> usize {
        self.lock_state().active
    }

    pub fn queue_length(&self) -> usize {
        self.lock_state().queue.len()
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.inner.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl LimiterInner {
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        while let Some(waiter) = state.queue.pop_front() {
            let handoff = SlotGuard {
                inner: self.clone(),
                released: AtomicBool::new(false),
            };
            match waiter.send(handoff) {
                Ok(()) => return,
                // Waiter gave up; disarm so its drop does not release again.
                Err(unclaimed) => unclaimed.released.store(true, Ordering::SeqCst),
            }
        }
        state.active = state.active.saturating_sub(1);
    }
}

impl SlotGuard {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.inner.release();
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}
