use serde_json::Value;
use tokio::sync::broadcast;

use crate::storage::DEFAULT_CHANNEL_CAPACITY;

/// A change to a single key inside one storage area.
///
/// `None` on either side means the key was absent.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

impl StorageEvent {
    /// True if the change is visible, i.e. the old and new values differ structurally.
    pub fn is_change(&self) -> bool {
        self.old_value != self.new_value
    }
}

/// A handle for receiving storage change notifications.
pub type Subscription = broadcast::Receiver<StorageEvent>;

/// Fan-out channel used by backends to publish their changes.
#[derive(Debug)]
pub struct StorageBus {
    tx: broadcast::Sender<StorageEvent>,
}

impl Default for StorageBus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl StorageBus {
    pub fn subscribe(&self) -> Subscription {
        self.tx.subscribe()
    }

    pub fn publish(&self, ev: StorageEvent) {
        // send() only fails when there are no receivers, which is fine.
        let _ = self.tx.send(ev);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = StorageEvent>) {
        for ev in events {
            self.publish(ev);
        }
    }
}
