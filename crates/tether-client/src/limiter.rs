//! Admission control for dispatched actions.
//!
//! At most `max_concurrent` actions run at once. Up to `max_queue_size`
//! more wait in arrival order; anything beyond that is rejected with
//! [`BridgeError::Capacity`] so the server can back off.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tether_core::BridgeError;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
struct LimiterState {
    running: usize,
    waiters: VecDeque<oneshot::Sender<Permit>>,
}

type SharedState = Arc<Mutex<LimiterState>>;

/// A running slot. Dropping it hands the slot to the next waiter.
pub struct Permit {
    state: Option<SharedState>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            release(&state);
        }
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("armed", &self.state.is_some())
            .finish()
    }
}

fn release(state: &SharedState) {
    let mut guard = state.lock();
    while let Some(waiter) = guard.waiters.pop_front() {
        let permit = Permit {
            state: Some(Arc::clone(state)),
        };
        match waiter.send(permit) {
            // The slot moves to the waiter; `running` is unchanged.
            Ok(()) => return,
            Err(mut unclaimed) => {
                // Waiter gave up; disarm so dropping doesn't re-enter the lock.
                unclaimed.state = None;
            }
        }
    }
    guard.running = guard.running.saturating_sub(1);
}

/// A queued admission. Await [`QueuedAdmission::admitted`] for the slot.
#[derive(Debug)]
pub struct QueuedAdmission {
    rx: oneshot::Receiver<Permit>,
}

impl QueuedAdmission {
    /// Wait until a slot is handed over.
    pub async fn admitted(self) -> Result<Permit, BridgeError> {
        self.rx.await.map_err(|_| BridgeError::Shutdown)
    }
}

/// Outcome of a non-blocking admission attempt.
#[derive(Debug)]
pub enum Admission {
    /// A slot was free.
    Ready(Permit),
    /// Queued behind running actions.
    Queued(QueuedAdmission),
}

/// Limiter counters.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    /// Actions holding a slot.
    pub in_flight: usize,
    /// Actions waiting for a slot.
    pub queued: usize,
    /// Configured concurrency.
    pub max_concurrent: usize,
    /// Configured queue bound.
    pub max_queue_size: usize,
    /// `in_flight / max_concurrent`.
    pub utilization: f64,
}

/// Bounded-concurrency gate with a bounded FIFO queue.
pub struct AdmissionLimiter {
    max_concurrent: usize,
    max_queue_size: usize,
    state: SharedState,
}

impl AdmissionLimiter {
    /// Create a limiter. `max_concurrent` is clamped to at least 1.
    pub fn new(max_concurrent: usize, max_queue_size: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            max_queue_size,
            state: Arc::new(Mutex::new(LimiterState::default())),
        }
    }

    /// Admit now, queue, or reject, without waiting.
    pub fn try_admit(&self) -> Result<Admission, BridgeError> {
        let mut state = self.state.lock();
        state.waiters.retain(|w| !w.is_closed());

        if state.running < self.max_concurrent {
            state.running += 1;
            return Ok(Admission::Ready(Permit {
                state: Some(Arc::clone(&self.state)),
            }));
        }
        if state.waiters.len() < self.max_queue_size {
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!(queued = state.waiters.len(), "action queued for admission");
            return Ok(Admission::Queued(QueuedAdmission { rx }));
        }
        Err(BridgeError::Capacity {
            queue_size: self.max_queue_size,
        })
    }

    /// Wait for a slot, or fail immediately when the queue is full.
    pub async fn acquire(&self) -> Result<Permit, BridgeError> {
        match self.try_admit()? {
            Admission::Ready(permit) => Ok(permit),
            Admission::Queued(queued) => queued.admitted().await,
        }
    }

    /// Run `task` once admitted; the slot is released when it finishes.
    pub async fn execute<F, T>(&self, task: F) -> Result<T, BridgeError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(task.await)
    }

    /// Current counters.
    pub fn stats(&self) -> LimiterStats {
        let state = self.state.lock();
        let queued = state.waiters.iter().filter(|w| !w.is_closed()).count();
        #[allow(clippy::cast_precision_loss)]
        let utilization = state.running as f64 / self.max_concurrent as f64;
        LimiterStats {
            in_flight: state.running,
            queued,
            max_concurrent: self.max_concurrent,
            max_queue_size: self.max_queue_size,
            utilization,
        }
    }
}
