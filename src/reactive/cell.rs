use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// The capability a binding needs from a reactive value.
///
/// Implementations must notify subscribers only when the value really
/// changed, compared by value rather than by identity.
pub trait ObservableCell<T>: Send + Sync {
    fn get(&self) -> T;

    fn set(&self, value: T);

    /// Registers `on_change`, called with the new value after every change.
    fn subscribe(&self, on_change: Box<dyn Fn(&T) + Send + Sync>) -> Subscription;
}

/// RAII guard returned by [`ObservableCell::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}

struct CellInner<T> {
    value: RwLock<T>,
    version: AtomicU64,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Callback<T>)>>,
}

/// Thread-safe observable value.
///
/// - Setting a value equal to the current one is a no-op.
/// - Subscribers run in registration order, outside of any internal lock, so
///   they may read or write the cell again.
/// - The version increments once per real change.
pub struct SharedCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for SharedCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default + Clone + PartialEq + Send + Sync + 'static> Default for SharedCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SharedCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = self.inner.value.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SharedCell")
            .field("value", &*value)
            .field("version", &self.inner.version.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> SharedCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(CellInner {
                value: RwLock::new(value),
                version: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.value.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Reads the value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let value = self.inner.value.read().unwrap_or_else(PoisonError::into_inner);
        f(&*value)
    }

    /// Replaces the value. Returns `false` (and notifies nobody) if it was equal.
    pub fn set(&self, value: T) -> bool {
        {
            let mut current = self.inner.value.write().unwrap_or_else(PoisonError::into_inner);
            if *current == value {
                return false;
            }
            *current = value.clone();
        }
        self.changed(&value);
        true
    }

    /// Mutates the value in place. Subscribers are notified only if the result
    /// differs from the value before the mutation.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        let after = {
            let mut current = self.inner.value.write().unwrap_or_else(PoisonError::into_inner);
            let before = current.clone();
            f(&mut *current);
            if *current == before {
                return false;
            }
            current.clone()
        };
        self.changed(&after);
        true
    }

    pub fn subscribe(&self, on_change: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers().push((id, Arc::new(on_change)));

        let weak: Weak<CellInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .subscribers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(sid, _)| *sid != id);
            }
        })
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Callback<T>)>> {
        self.inner.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn changed(&self, value: &T) {
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        let callbacks: Vec<Callback<T>> = self
            .subscribers()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in callbacks {
            cb(value);
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ObservableCell<T> for SharedCell<T> {
    fn get(&self) -> T {
        SharedCell::get(self)
    }

    fn set(&self, value: T) {
        SharedCell::set(self, value);
    }

    fn subscribe(&self, on_change: Box<dyn Fn(&T) + Send + Sync>) -> Subscription {
        SharedCell::subscribe(self, on_change)
    }
}
