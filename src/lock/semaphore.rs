use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::errors::LockError;

type Grant = Result<(u32, Releaser), LockError>;

struct Waiter {
    weight: u32,
    priority: i32,
    tx: oneshot::Sender<Grant>,
}

struct State {
    value: u32,
    /// Ordered by descending priority, FIFO among equal priorities.
    queue: VecDeque<Waiter>,
}

struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A counting semaphore with weighted acquisition, priority queueing and cancellation.
///
/// Requests that fit the free capacity and have no waiter of equal or higher
/// priority ahead of them are granted without queueing. Everything else waits
/// in a priority-ordered queue that is drained from the head only, so a heavy
/// request at the head blocks lighter ones behind it.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Semaphore")
            .field("value", &state.value)
            .field("waiting", &state.queue.len())
            .finish()
    }
}

impl Semaphore {
    pub fn new(value: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    value,
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    /// Acquires one unit at default priority.
    pub async fn acquire(&self) -> Result<(u32, Releaser), LockError> {
        self.acquire_with(1, 0).await
    }

    /// Acquires `weight` units. Resolves with the capacity seen just before the
    /// grant and a one-shot [`Releaser`] that gives the units back.
    pub async fn acquire_with(
        &self,
        weight: u32,
        priority: i32,
    ) -> Result<(u32, Releaser), LockError> {
        if weight == 0 {
            return Err(LockError::InvalidWeight(weight));
        }

        let rx = {
            let mut state = self.inner.lock();
            let ahead = state.queue.iter().rposition(|w| w.priority >= priority);
            if ahead.is_none() && weight <= state.value {
                let previous = state.value;
                state.value -= weight;
                return Ok((previous, Releaser::new(self.inner.clone(), weight)));
            }

            let (tx, rx) = oneshot::channel();
            let at = ahead.map_or(0, |i| i + 1);
            state.queue.insert(at, Waiter { weight, priority, tx });
            rx
        };

        rx.await.unwrap_or(Err(LockError::Cancelled))
    }

    /// Runs `f` while holding one unit. The unit is released when `f` completes,
    /// fails or panics.
    pub async fn run_exclusive<F, Fut, R>(&self, f: F) -> Result<R, LockError>
    where
        F: FnOnce(u32) -> Fut,
        Fut: Future<Output = R>,
    {
        self.run_exclusive_with(1, 0, f).await
    }

    pub async fn run_exclusive_with<F, Fut, R>(
        &self,
        weight: u32,
        priority: i32,
        f: F,
    ) -> Result<R, LockError>
    where
        F: FnOnce(u32) -> Fut,
        Fut: Future<Output = R>,
    {
        let (value, _releaser) = self.acquire_with(weight, priority).await?;
        Ok(f(value).await)
    }

    /// Returns `weight` units that were not obtained through a [`Releaser`].
    pub fn release(&self, weight: u32) {
        release(&self.inner, weight);
    }

    /// Rejects every queued request with [`LockError::Cancelled`].
    /// Holders that were already granted keep their units.
    pub fn cancel(&self) {
        let waiters = std::mem::take(&mut self.inner.lock().queue);
        for waiter in waiters {
            let _ = waiter.tx.send(Err(LockError::Cancelled));
        }
    }

    /// Currently free capacity.
    pub fn value(&self) -> u32 {
        self.inner.lock().value
    }

    pub fn is_locked(&self) -> bool {
        self.value() == 0
    }

    /// Number of queued requests.
    pub fn waiting(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

fn release(inner: &Arc<Inner>, weight: u32) {
    let mut state = inner.lock();
    state.value += weight;
    dispatch(inner, &mut state);
}

fn dispatch(inner: &Arc<Inner>, state: &mut State) {
    loop {
        let Some(head) = state.queue.front() else { break };
        if head.tx.is_closed() {
            // The requester gave up; skip it without touching capacity.
            state.queue.pop_front();
            continue;
        }
        if head.weight > state.value {
            break;
        }
        let Some(waiter) = state.queue.pop_front() else { break };

        let previous = state.value;
        state.value -= waiter.weight;
        let releaser = Releaser::new(inner.clone(), waiter.weight);
        if let Err(Ok((_, releaser))) = waiter.tx.send(Ok((previous, releaser))) {
            // Receiver vanished between the check and the send: take the units back here,
            // the releaser must not re-enter the lock we are holding.
            releaser.disarm();
            state.value += waiter.weight;
        }
    }
}

/// One-shot handle returned by a successful acquisition.
///
/// Calling [`release`](Releaser::release) more than once is a no-op. Dropping
/// an unreleased handle releases it.
#[must_use = "dropping a Releaser releases the lock immediately"]
pub struct Releaser {
    inner: Arc<Inner>,
    weight: u32,
    released: AtomicBool,
}

impl Releaser {
    fn new(inner: Arc<Inner>, weight: u32) -> Self {
        Self {
            inner,
            weight,
            released: AtomicBool::new(false),
        }
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            release(&self.inner, self.weight);
        }
    }

    fn disarm(&self) {
        self.released.store(true, Ordering::Release);
    }
}

impl Drop for Releaser {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Releaser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Releaser")
            .field("weight", &self.weight)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}
