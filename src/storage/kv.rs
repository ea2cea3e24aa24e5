use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde_json::Value;

use super::area::StorageArea;
use super::types::{meta_from_value, meta_key, merge_meta, Area, MetaMap};
use super::watch::{Unwatch, WatchRegistry};
use crate::errors::StorageError;

/// Adapter over one area's backend.
///
/// Adds the conventions the backend does not know about: availability checks,
/// `null` meaning "absent", the metadata slot stored next to every key, and
/// watchers that only fire on structural changes.
#[derive(Clone)]
pub struct KeyValueStore {
    area: Area,
    backend: Arc<dyn StorageArea>,
    watchers: Arc<WatchRegistry>,
}

impl Debug for KeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("area", &self.area)
            .finish_non_exhaustive()
    }
}

impl KeyValueStore {
    pub fn new(area: Area, backend: Arc<dyn StorageArea>, watchers: Arc<WatchRegistry>) -> Self {
        Self {
            area,
            backend,
            watchers,
        }
    }

    pub fn area(&self) -> Area {
        self.area
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        match self.backend.missing_capability() {
            Some(capability) => Err(StorageError::Configuration {
                area: self.area.to_string(),
                capability,
            }),
            None => Ok(()),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.ensure_available()?;
        let value = self.backend.get_item(key).await.map_err(StorageError::backend)?;
        Ok(value.filter(|v| !v.is_null()))
    }

    /// Reads several keys in one backend call. Results follow the order of `keys`.
    pub async fn get_many(
        &self,
        keys: &[String],
    ) -> Result<Vec<(String, Option<Value>)>, StorageError> {
        self.ensure_available()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values = self.backend.get_items(keys).await.map_err(StorageError::backend)?;
        Ok(values
            .into_iter()
            .map(|(k, v)| (k, v.filter(|v| !v.is_null())))
            .collect())
    }

    /// Writes `value` under `key`. Writing `null` removes the key.
    pub async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.set_many(vec![(key.to_string(), value)]).await
    }

    pub async fn set_many(&self, items: Vec<(String, Value)>) -> Result<(), StorageError> {
        self.ensure_available()?;
        let (nulls, values): (Vec<_>, Vec<_>) = items.into_iter().partition(|(_, v)| v.is_null());

        if !values.is_empty() {
            self.backend.set_items(values).await.map_err(StorageError::backend)?;
        }
        if !nulls.is_empty() {
            let keys: Vec<String> = nulls.into_iter().map(|(k, _)| k).collect();
            self.backend.remove_items(&keys).await.map_err(StorageError::backend)?;
        }
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.remove_many(&[key.to_string()]).await
    }

    pub async fn remove_many(&self, keys: &[String]) -> Result<(), StorageError> {
        self.ensure_available()?;
        if keys.is_empty() {
            return Ok(());
        }
        self.backend.remove_items(keys).await.map_err(StorageError::backend)
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.ensure_available()?;
        self.backend.clear().await.map_err(StorageError::backend)
    }

    pub async fn snapshot(&self) -> Result<BTreeMap<String, Value>, StorageError> {
        self.ensure_available()?;
        self.backend.snapshot().await.map_err(StorageError::backend)
    }

    pub async fn restore_snapshot(
        &self,
        data: BTreeMap<String, Value>,
    ) -> Result<(), StorageError> {
        self.ensure_available()?;
        self.backend.restore_snapshot(data).await.map_err(StorageError::backend)
    }

    /// Calls `on_change(new, old)` whenever `key` changes structurally.
    ///
    /// Requires a tokio runtime; without one a configuration error is returned.
    pub fn watch<F>(&self, key: &str, on_change: F) -> Result<Unwatch, StorageError>
    where
        F: Fn(Option<Value>, Option<Value>) + Send + Sync + 'static,
    {
        self.ensure_available()?;
        tokio::runtime::Handle::try_current().map_err(|_| StorageError::Configuration {
            area: self.area.to_string(),
            capability: "a running tokio runtime".to_string(),
        })?;

        let rx = self.backend.subscribe();
        Ok(self.watchers.spawn(
            self.area,
            key.to_string(),
            rx,
            Arc::new(move |new: Option<Value>, old: Option<Value>| {
                on_change(new.filter(|v| !v.is_null()), old.filter(|v| !v.is_null()))
            }),
        ))
    }

    /// Detaches every watcher registered on this area.
    pub fn unwatch_all(&self) {
        self.watchers.unwatch_area(self.area);
    }

    // ---------- metadata ----------

    pub async fn get_meta(&self, key: &str) -> Result<MetaMap, StorageError> {
        Ok(meta_from_value(self.get(&meta_key(key)).await?))
    }

    pub async fn get_metas(&self, keys: &[String]) -> Result<Vec<(String, MetaMap)>, StorageError> {
        let meta_keys: Vec<String> = keys.iter().map(|k| meta_key(k)).collect();
        let values = self.get_many(&meta_keys).await?;
        Ok(keys
            .iter()
            .cloned()
            .zip(values.into_iter().map(|(_, v)| meta_from_value(v)))
            .collect())
    }

    /// Merges `patch` into the metadata of `key`. `null` fields are deleted.
    pub async fn set_meta(&self, key: &str, patch: MetaMap) -> Result<(), StorageError> {
        self.set_metas(vec![(key.to_string(), patch)]).await
    }

    pub async fn set_metas(&self, patches: Vec<(String, MetaMap)>) -> Result<(), StorageError> {
        if patches.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = patches.iter().map(|(k, _)| k.clone()).collect();
        let current = self.get_metas(&keys).await?;

        let merged = current
            .into_iter()
            .zip(patches)
            .map(|((key, existing), (_, patch))| {
                (meta_key(&key), Value::Object(merge_meta(existing, patch)))
            })
            .collect();
        self.set_many(merged).await
    }

    /// Removes the whole metadata record (`fields == None`) or only the named fields.
    pub async fn remove_meta(
        &self,
        key: &str,
        fields: Option<&[String]>,
    ) -> Result<(), StorageError> {
        match fields {
            None => self.remove(&meta_key(key)).await,
            Some(fields) => {
                let mut meta = self.get_meta(key).await?;
                if meta.is_empty() {
                    return Ok(());
                }
                for field in fields {
                    meta.remove(field);
                }
                if meta.is_empty() {
                    return self.remove(&meta_key(key)).await;
                }
                self.set(&meta_key(key), Value::Object(meta)).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryArea;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn store() -> KeyValueStore {
        KeyValueStore::new(
            Area::Local,
            Arc::new(InMemoryArea::new()),
            Arc::new(WatchRegistry::new()),
        )
    }

    fn meta(v: Value) -> MetaMap {
        meta_from_value(Some(v))
    }

    #[tokio::test]
    async fn null_write_removes_key() {
        let kv = store();
        kv.set("a", json!(1)).await.unwrap();
        kv.set("a", Value::Null).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
        assert!(kv.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn metadata_merge_is_field_wise() {
        let kv = store();
        kv.set_meta("counter", meta(json!({"a": 1}))).await.unwrap();
        kv.set_meta("counter", meta(json!({"b": 2}))).await.unwrap();
        kv.set_meta("counter", meta(json!({"a": null}))).await.unwrap();

        assert_eq!(Value::Object(kv.get_meta("counter").await.unwrap()), json!({"b": 2}));
        // stored next to the value under the `$` suffix
        assert_eq!(kv.get("counter$").await.unwrap(), Some(json!({"b": 2})));
    }

    #[tokio::test]
    async fn remove_meta_fields_or_whole_record() {
        let kv = store();
        kv.set_meta("k", meta(json!({"a": 1, "b": 2, "v": 3}))).await.unwrap();

        kv.remove_meta("k", Some(&["a".to_string()])).await.unwrap();
        assert_eq!(Value::Object(kv.get_meta("k").await.unwrap()), json!({"b": 2, "v": 3}));

        kv.remove_meta("k", None).await.unwrap();
        assert!(kv.get_meta("k").await.unwrap().is_empty());
        assert_eq!(kv.get("k$").await.unwrap(), None);
    }

    #[tokio::test]
    async fn removing_fields_never_creates_an_empty_record() {
        let kv = store();
        kv.remove_meta("bare", Some(&["a".to_string()])).await.unwrap();
        assert_eq!(kv.get("bare$").await.unwrap(), None);

        kv.set_meta("k", meta(json!({"a": 1}))).await.unwrap();
        kv.remove_meta("k", Some(&["a".to_string()])).await.unwrap();
        assert_eq!(kv.get("k$").await.unwrap(), None);
        assert!(kv.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_backend_fails_every_call() {
        let kv = KeyValueStore::new(
            Area::Sync,
            Arc::new(InMemoryArea::unavailable("the `storage` permission")),
            Arc::new(WatchRegistry::new()),
        );

        let err = kv.get("x").await.unwrap_err();
        match &err {
            StorageError::Configuration { area, capability } => {
                assert_eq!(area, "sync");
                assert!(capability.contains("storage"));
            }
            other => panic!("expected Configuration, got {other:?}"),
        }
        assert!(kv.set("x", json!(1)).await.is_err());
        assert!(kv.clear().await.is_err());
        assert!(kv.watch("x", |_, _| {}).is_err());
    }

    #[tokio::test]
    async fn equal_writes_do_not_notify() {
        let kv = store();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _unwatch = kv
            .watch("doc", move |new, old| {
                let _ = tx.send((new, old));
            })
            .unwrap();

        kv.set("doc", json!({"list": [1, 2]})).await.unwrap();
        kv.set("doc", json!({"list": [1, 2]})).await.unwrap();
        kv.remove("doc").await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, (Some(json!({"list": [1, 2]})), None));

        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, (None, Some(json!({"list": [1, 2]}))));
    }

    #[test]
    fn watch_outside_runtime_is_a_configuration_error() {
        let kv = store();
        assert!(matches!(
            kv.watch("x", |_, _| {}),
            Err(StorageError::Configuration { .. })
        ));
    }
}
