use std::future::Future;

use super::semaphore::{Releaser, Semaphore};
use crate::errors::LockError;

/// Binary async mutex: a [`Semaphore`] with capacity 1 where every request weighs 1.
#[derive(Clone, Debug)]
pub struct Mutex {
    semaphore: Semaphore,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(1),
        }
    }

    pub async fn acquire(&self) -> Result<Releaser, LockError> {
        self.acquire_with_priority(0).await
    }

    pub async fn acquire_with_priority(&self, priority: i32) -> Result<Releaser, LockError> {
        let (_, releaser) = self.semaphore.acquire_with(1, priority).await?;
        Ok(releaser)
    }

    /// Runs `f` with the lock held, releasing it afterwards whatever `f` returns.
    pub async fn run_exclusive<F, Fut, R>(&self, f: F) -> Result<R, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.semaphore.run_exclusive(|_| f()).await
    }

    pub fn is_locked(&self) -> bool {
        self.semaphore.is_locked()
    }

    /// Rejects every waiter that has not been granted the lock yet.
    pub fn cancel(&self) {
        self.semaphore.cancel();
    }
}
