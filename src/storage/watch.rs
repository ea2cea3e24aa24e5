//! Change watchers.
//!
//! Every watcher is a small tokio task that listens on an area's change bus,
//! filters for one key and drops structurally-equal writes before calling the
//! user callback. The [`WatchRegistry`] tracks those tasks per area so they can
//! all be torn down at once.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::event::Subscription;
use super::types::Area;

/// A unique identifier for a watcher, represented as a UUID.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WatchId(Uuid);

impl WatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback invoked with `(new_value, old_value)`.
pub type WatchCallback = Arc<dyn Fn(Option<Value>, Option<Value>) + Send + Sync>;

/// Watcher tasks grouped by area.
#[derive(Default)]
pub struct WatchRegistry {
    watchers: Mutex<HashMap<Area, HashMap<WatchId, AbortHandle>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a watcher for `key` on `rx`. Must be called from within a tokio runtime.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        area: Area,
        key: String,
        mut rx: Subscription,
        callback: WatchCallback,
    ) -> Unwatch {
        let id = WatchId::new();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        if ev.key == key && ev.is_change() {
                            callback(ev.new_value, ev.old_value);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!(
                            "watcher for `{area}:{key}` lagged behind, {n} change(s) dropped"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.lock()
            .entry(area)
            .or_default()
            .insert(id, handle.abort_handle());

        Unwatch {
            registry: Arc::downgrade(self),
            area,
            id,
        }
    }

    fn remove(&self, area: Area, id: WatchId) {
        if let Some(handle) = self.lock().get_mut(&area).and_then(|m| m.remove(&id)) {
            handle.abort();
        }
    }

    /// Detaches every watcher of `area`.
    pub fn unwatch_area(&self, area: Area) {
        if let Some(handles) = self.lock().remove(&area) {
            for handle in handles.into_values() {
                handle.abort();
            }
        }
    }

    /// Detaches every watcher in every area.
    pub fn unwatch_all(&self) {
        let all = std::mem::take(&mut *self.lock());
        for handle in all.into_values().flat_map(HashMap::into_values) {
            handle.abort();
        }
    }

    /// Number of live watchers in `area`.
    pub fn count(&self, area: Area) -> usize {
        self.lock().get(&area).map_or(0, HashMap::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Area, HashMap<WatchId, AbortHandle>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running watcher. Dropping it stops the watcher.
#[must_use = "dropping an Unwatch handle stops the watcher immediately"]
pub struct Unwatch {
    registry: Weak<WatchRegistry>,
    area: Area,
    id: WatchId,
}

impl Unwatch {
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Stops the watcher. Same as dropping the handle.
    pub fn unwatch(self) {}
}

impl Drop for Unwatch {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.area, self.id);
        }
    }
}

impl std::fmt::Debug for Unwatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unwatch")
            .field("area", &self.area)
            .field("id", &self.id)
            .finish()
    }
}
