use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::event::Subscription;

/// Object-safe key/value backend for one storage area.
///
/// Implementations hold raw, string-addressed slots. Metadata slots are plain
/// keys to the backend; the [`KeyValueStore`](super::KeyValueStore) adapter
/// layers the metadata convention on top.
#[async_trait]
pub trait StorageArea: Send + Sync {
    /// Names the capability this backend lacks, if it cannot serve requests.
    fn missing_capability(&self) -> Option<String> {
        None
    }

    /// Retrieves the value associated with the given key, or `None` if not found.
    async fn get_item(&self, key: &str) -> Result<Option<Value>>;

    /// Retrieves several keys at once, in the order given. Missing keys map to `None`.
    async fn get_items(&self, keys: &[String]) -> Result<Vec<(String, Option<Value>)>>;

    /// Sets the value for the given key, overwriting any existing value.
    async fn set_item(&self, key: &str, value: Value) -> Result<()>;

    /// Sets several values in one call.
    async fn set_items(&self, items: Vec<(String, Value)>) -> Result<()>;

    /// Removes the item with the given key.
    async fn remove_item(&self, key: &str) -> Result<()>;

    /// Removes several items in one call.
    async fn remove_items(&self, keys: &[String]) -> Result<()>;

    /// Clears all items in the storage area.
    async fn clear(&self) -> Result<()>;

    /// Returns every key/value pair in the area.
    async fn snapshot(&self) -> Result<BTreeMap<String, Value>>;

    /// Writes every pair from `data`, leaving other keys untouched.
    async fn restore_snapshot(&self, data: BTreeMap<String, Value>) -> Result<()>;

    /// Subscribes to changes made through this backend.
    fn subscribe(&self) -> Subscription;
}
