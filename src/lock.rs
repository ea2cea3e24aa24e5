//! Cooperative locking primitives.
//!
//! [`Semaphore`] is a counting semaphore with weighted requests, a
//! priority-ordered wait queue and cancellation of queued requests. [`Mutex`]
//! is the same primitive fixed at capacity 1; versioned items use it to
//! serialize their migrate-or-initialize sequence.

/// Binary mutex built on the semaphore.
pub mod mutex;
/// Weighted, priority-aware semaphore.
pub mod semaphore;

pub use mutex::Mutex;
pub use semaphore::{Releaser, Semaphore};
