use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::area::StorageArea;
use super::event::{StorageBus, StorageEvent, Subscription};

/// In‑memory storage area (no persistence). Used for tests, session storage and as a
/// default when no persistent backend is supplied.
///
/// Every call takes the lock once, so batched reads and writes are atomic.
#[derive(Default)]
pub struct InMemoryArea {
    map: RwLock<BTreeMap<String, Value>>,
    bus: StorageBus,
    missing: Option<String>,
}

impl InMemoryArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// An area that refuses every request because `capability` is missing.
    pub fn unavailable(capability: impl Into<String>) -> Self {
        Self {
            missing: Some(capability.into()),
            ..Self::default()
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Value>> {
        self.map.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StorageArea for InMemoryArea {
    fn missing_capability(&self) -> Option<String> {
        self.missing.clone()
    }

    async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read().get(key).cloned())
    }

    async fn get_items(&self, keys: &[String]) -> Result<Vec<(String, Option<Value>)>> {
        let map = self.read();
        Ok(keys
            .iter()
            .map(|k| (k.clone(), map.get(k).cloned()))
            .collect())
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<()> {
        self.set_items(vec![(key.to_string(), value)]).await
    }

    async fn set_items(&self, items: Vec<(String, Value)>) -> Result<()> {
        let events: Vec<StorageEvent> = {
            let mut map = self.write();
            items
                .into_iter()
                .map(|(key, value)| {
                    let old_value = map.insert(key.clone(), value.clone());
                    StorageEvent {
                        key,
                        old_value,
                        new_value: Some(value),
                    }
                })
                .collect()
        };
        self.bus.publish_all(events);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.remove_items(&[key.to_string()]).await
    }

    async fn remove_items(&self, keys: &[String]) -> Result<()> {
        let events: Vec<StorageEvent> = {
            let mut map = self.write();
            keys.iter()
                .filter_map(|key| {
                    map.remove(key).map(|old| StorageEvent {
                        key: key.clone(),
                        old_value: Some(old),
                        new_value: None,
                    })
                })
                .collect()
        };
        self.bus.publish_all(events);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let removed = std::mem::take(&mut *self.write());
        self.bus
            .publish_all(removed.into_iter().map(|(key, old)| StorageEvent {
                key,
                old_value: Some(old),
                new_value: None,
            }));
        Ok(())
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self.read().clone())
    }

    async fn restore_snapshot(&self, data: BTreeMap<String, Value>) -> Result<()> {
        self.set_items(data.into_iter().collect()).await
    }

    fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }
}
