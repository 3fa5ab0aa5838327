//! Bounded FIFO dispatch queue.
//!
//! [`DispatchQueue`] matches incoming render jobs to idle workers. When all
//! workers are busy, callers park a resolver in a bounded FIFO queue; at
//! the bound they fail fast with a queue-full condition instead.
//!
//! The queue is generic over the resource it hands out so the mechanics can
//! be exercised without real child processes.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crawlserver_common::GatewayError;

struct QueueState<T> {
    idle: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
}

/// Bounded queue matching resources to waiting requests in FIFO order.
pub struct DispatchQueue<T> {
    state: Mutex<QueueState<T>>,
    max_pending: usize,
}

impl<T> DispatchQueue<T> {
    /// Create a queue allowing at most `max_pending` parked requests.
    pub fn new(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
            max_pending,
        }
    }

    /// Take an idle resource, suspending until one is released when all are
    /// busy.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::QueueFull`] when `max_pending` requests are already
    ///   parked.
    /// - [`GatewayError::PoolClosed`] when the queue is torn down while the
    ///   caller is parked.
    pub async fn acquire(&self) -> Result<T, GatewayError> {
        let receiver = {
            let mut state = self.state.lock().expect("dispatch queue lock poisoned");
            if let Some(item) = state.idle.pop_front() {
                return Ok(item);
            }
            if state.waiters.len() >= self.max_pending {
                return Err(GatewayError::QueueFull);
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };

        receiver.await.map_err(|_| GatewayError::PoolClosed)
    }

    /// Return a resource. The head waiter receives it under the queue lock,
    /// so a free resource is never observable while requests are parked.
    /// Waiters that gave up are skipped.
    pub fn release(&self, item: T) {
        let mut state = self.state.lock().expect("dispatch queue lock poisoned");
        let mut item = item;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return,
                Err(returned) => item = returned,
            }
        }
        state.idle.push_back(item);
    }

    /// Number of idle resources.
    pub fn idle_len(&self) -> usize {
        self.state
            .lock()
            .expect("dispatch queue lock poisoned")
            .idle
            .len()
    }

    /// Number of parked requests.
    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .expect("dispatch queue lock poisoned")
            .waiters
            .len()
    }

    /// Remove and return every idle resource. Parked requests stay parked.
    pub fn drain_idle(&self) -> Vec<T> {
        let mut state = self.state.lock().expect("dispatch queue lock poisoned");
        state.idle.drain(..).collect()
    }
}
