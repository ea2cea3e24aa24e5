use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::area::StorageArea;
use super::in_memory::InMemoryArea;
use super::item::{ItemOptions, ItemValue, VersionedItem};
use super::kv::KeyValueStore;
use super::types::{meta_key, Area, MetaMap, RemoveOptions, StorageKey};
use super::watch::{Unwatch, WatchRegistry};
use crate::errors::StorageError;

/// Builds a [`StorageService`] from one backend per area.
#[derive(Default)]
pub struct StorageServiceBuilder {
    areas: HashMap<Area, Arc<dyn StorageArea>>,
}

impl StorageServiceBuilder {
    pub fn area(mut self, area: Area, backend: Arc<dyn StorageArea>) -> Self {
        self.areas.insert(area, backend);
        self
    }

    pub fn local(self, backend: Arc<dyn StorageArea>) -> Self {
        self.area(Area::Local, backend)
    }

    pub fn session(self, backend: Arc<dyn StorageArea>) -> Self {
        self.area(Area::Session, backend)
    }

    pub fn sync(self, backend: Arc<dyn StorageArea>) -> Self {
        self.area(Area::Sync, backend)
    }

    pub fn managed(self, backend: Arc<dyn StorageArea>) -> Self {
        self.area(Area::Managed, backend)
    }

    pub fn build(self) -> StorageService {
        let watchers = Arc::new(WatchRegistry::new());
        let stores = self
            .areas
            .into_iter()
            .map(|(area, backend)| (area, KeyValueStore::new(area, backend, Arc::clone(&watchers))))
            .collect();
        StorageService {
            stores: Arc::new(stores),
            watchers,
        }
    }
}

/// Single entry point over every storage area.
///
/// Keys are compound `<area>:<key>` strings. The facade resolves the area,
/// groups batch operations per area so each area sees one backend call, and
/// keeps per-key metadata under `<key>$`.
#[derive(Clone)]
pub struct StorageService {
    stores: Arc<HashMap<Area, KeyValueStore>>,
    watchers: Arc<WatchRegistry>,
}

impl Debug for StorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut areas: Vec<_> = self.stores.keys().collect();
        areas.sort();
        f.debug_struct("StorageService")
            .field("areas", &areas)
            .finish_non_exhaustive()
    }
}

impl StorageService {
    pub fn builder() -> StorageServiceBuilder {
        StorageServiceBuilder::default()
    }

    /// Every area backed by its own [`InMemoryArea`].
    pub fn in_memory() -> Self {
        Area::ALL
            .into_iter()
            .fold(Self::builder(), |b, area| b.area(area, Arc::new(InMemoryArea::new())))
            .build()
    }

    /// The adapter for `area`, or a configuration error when no backend was registered.
    pub fn store(&self, area: Area) -> Result<&KeyValueStore, StorageError> {
        self.stores.get(&area).ok_or_else(|| StorageError::Configuration {
            area: area.to_string(),
            capability: "a registered backend".to_string(),
        })
    }

    /// Parses a compound key and finds the store for its area.
    pub fn resolve_key(&self, key: &str) -> Result<(&KeyValueStore, StorageKey), StorageError> {
        let parsed = StorageKey::parse(key)?;
        Ok((self.store(parsed.area)?, parsed))
    }

    /// Validates every key and groups them per area, remembering input positions.
    fn group<'k, V>(
        &self,
        entries: impl IntoIterator<Item = (&'k str, V)>,
    ) -> Result<BTreeMap<Area, Vec<(usize, String, V)>>, StorageError> {
        let mut groups: BTreeMap<Area, Vec<(usize, String, V)>> = BTreeMap::new();
        for (idx, (raw, value)) in entries.into_iter().enumerate() {
            let (_, key) = self.resolve_key(raw)?;
            groups.entry(key.area).or_default().push((idx, key.key, value));
        }
        Ok(groups)
    }

    pub async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let (store, key) = self.resolve_key(key)?;
        store.get(&key.key).await
    }

    /// Returns the stored value or `fallback` when nothing is stored.
    pub async fn get_item_or(&self, key: &str, fallback: Value) -> Result<Value, StorageError> {
        Ok(self.get_item(key).await?.unwrap_or(fallback))
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        self.get_item(key)
            .await?
            .map(|v| serde_json::from_value(v).map_err(|e| StorageError::serialization(key, e)))
            .transpose()
    }

    /// Reads many keys, one backend call per area. Results follow the input order.
    pub async fn get_items(
        &self,
        keys: &[&str],
    ) -> Result<Vec<(String, Option<Value>)>, StorageError> {
        let groups = self.group(keys.iter().map(|k| (*k, ())))?;
        let mut values: Vec<Option<Value>> = vec![None; keys.len()];

        for (area, entries) in groups {
            let local: Vec<String> = entries.iter().map(|(_, k, _)| k.clone()).collect();
            let fetched = self.store(area)?.get_many(&local).await?;
            for ((idx, _, _), (_, value)) in entries.into_iter().zip(fetched) {
                values[idx] = value;
            }
        }

        Ok(keys.iter().map(|k| k.to_string()).zip(values).collect())
    }

    pub async fn get_meta(&self, key: &str) -> Result<MetaMap, StorageError> {
        let (store, key) = self.resolve_key(key)?;
        store.get_meta(&key.key).await
    }

    pub async fn get_metas(&self, keys: &[&str]) -> Result<Vec<(String, MetaMap)>, StorageError> {
        let groups = self.group(keys.iter().map(|k| (*k, ())))?;
        let mut metas: Vec<MetaMap> = vec![MetaMap::new(); keys.len()];

        for (area, entries) in groups {
            let local: Vec<String> = entries.iter().map(|(_, k, _)| k.clone()).collect();
            let fetched = self.store(area)?.get_metas(&local).await?;
            for ((idx, _, _), (_, meta)) in entries.into_iter().zip(fetched) {
                metas[idx] = meta;
            }
        }

        Ok(keys.iter().map(|k| k.to_string()).zip(metas).collect())
    }

    /// Writes `value`. Writing `null` removes the key.
    pub async fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let (store, key) = self.resolve_key(key)?;
        store.set(&key.key, value).await
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let value = serde_json::to_value(value).map_err(|e| StorageError::serialization(key, e))?;
        self.set_item(key, value).await
    }

    pub async fn set_items(&self, items: Vec<(&str, Value)>) -> Result<(), StorageError> {
        for (area, entries) in self.group(items)? {
            let batch = entries.into_iter().map(|(_, k, v)| (k, v)).collect();
            self.store(area)?.set_many(batch).await?;
        }
        Ok(())
    }

    /// Merges `patch` into the key's metadata. `null` fields are deleted.
    pub async fn set_meta(&self, key: &str, patch: MetaMap) -> Result<(), StorageError> {
        let (store, key) = self.resolve_key(key)?;
        store.set_meta(&key.key, patch).await
    }

    pub async fn set_metas(&self, patches: Vec<(&str, MetaMap)>) -> Result<(), StorageError> {
        for (area, entries) in self.group(patches)? {
            let batch = entries.into_iter().map(|(_, k, m)| (k, m)).collect();
            self.store(area)?.set_metas(batch).await?;
        }
        Ok(())
    }

    pub async fn remove_item(&self, key: &str, opts: RemoveOptions) -> Result<(), StorageError> {
        self.remove_items(&[key], opts).await
    }

    pub async fn remove_items(
        &self,
        keys: &[&str],
        opts: RemoveOptions,
    ) -> Result<(), StorageError> {
        for (area, entries) in self.group(keys.iter().map(|k| (*k, ())))? {
            let mut batch = Vec::with_capacity(entries.len() * 2);
            for (_, key, _) in entries {
                if opts.remove_meta {
                    batch.push(meta_key(&key));
                }
                batch.push(key);
            }
            self.store(area)?.remove_many(&batch).await?;
        }
        Ok(())
    }

    /// Removes the whole metadata record (`None`) or only the named fields.
    pub async fn remove_meta(
        &self,
        key: &str,
        fields: Option<&[String]>,
    ) -> Result<(), StorageError> {
        let (store, key) = self.resolve_key(key)?;
        store.remove_meta(&key.key, fields).await
    }

    pub async fn clear(&self, area: Area) -> Result<(), StorageError> {
        log::debug!("clearing storage area `{area}`");
        self.store(area)?.clear().await
    }

    /// Copies every entry of `area`, leaving out `exclude_keys` and their metadata records.
    pub async fn snapshot(
        &self,
        area: Area,
        exclude_keys: &[&str],
    ) -> Result<BTreeMap<String, Value>, StorageError> {
        let mut data = self.store(area)?.snapshot().await?;
        for key in exclude_keys {
            data.remove(*key);
            data.remove(&meta_key(key));
        }
        Ok(data)
    }

    /// Upserts every entry of `data` into `area`. Keys missing from `data` are left alone.
    pub async fn restore_snapshot(
        &self,
        area: Area,
        data: BTreeMap<String, Value>,
    ) -> Result<(), StorageError> {
        log::debug!("restoring {} entries into `{area}`", data.len());
        self.store(area)?.restore_snapshot(data).await
    }

    /// Calls `cb(new, old)` whenever the key changes structurally.
    pub fn watch<F>(&self, key: &str, cb: F) -> Result<Unwatch, StorageError>
    where
        F: Fn(Option<Value>, Option<Value>) + Send + Sync + 'static,
    {
        let (store, key) = self.resolve_key(key)?;
        store.watch(&key.key, cb)
    }

    /// Detaches every watcher registered through this service.
    pub fn unwatch(&self) {
        self.watchers.unwatch_all();
    }

    pub fn define_item<T: ItemValue>(
        &self,
        key: &str,
        options: ItemOptions<T>,
    ) -> Result<VersionedItem<T>, StorageError> {
        let (store, key) = self.resolve_key(key)?;
        log::debug!("defining item `{key}` at v{}", options.target_version());
        VersionedItem::new(store.clone(), key, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(v: Value) -> MetaMap {
        crate::storage::types::meta_from_value(Some(v))
    }

    #[tokio::test]
    async fn key_resolution_errors() {
        let svc = StorageService::in_memory();

        assert!(matches!(
            svc.get_item("counter").await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            svc.get_item("local:").await,
            Err(StorageError::InvalidKey(_))
        ));
        match svc.get_item("disk:counter").await {
            Err(StorageError::UnknownArea { area, key }) => {
                assert_eq!(area, "disk");
                assert_eq!(key, "disk:counter");
            }
            other => panic!("expected UnknownArea, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_area_is_a_configuration_error() {
        let svc = StorageService::builder()
            .local(Arc::new(InMemoryArea::new()))
            .build();
        svc.set_item("local:a", json!(1)).await.unwrap();
        assert!(matches!(
            svc.get_item("sync:a").await,
            Err(StorageError::Configuration { .. })
        ));
        assert!(svc.define_item::<u32>("managed:a", ItemOptions::new()).is_err());
    }

    #[tokio::test]
    async fn batch_reads_keep_input_order_across_areas() {
        let svc = StorageService::in_memory();
        svc.set_items(vec![
            ("local:a", json!(1)),
            ("session:b", json!(2)),
            ("local:c", json!(3)),
        ])
        .await
        .unwrap();

        let got = svc
            .get_items(&["session:b", "local:c", "sync:missing", "local:a"])
            .await
            .unwrap();
        assert_eq!(
            got,
            vec![
                ("session:b".to_string(), Some(json!(2))),
                ("local:c".to_string(), Some(json!(3))),
                ("sync:missing".to_string(), None),
                ("local:a".to_string(), Some(json!(1))),
            ]
        );
    }

    #[tokio::test]
    async fn one_bad_key_fails_the_whole_batch_before_any_write() {
        let svc = StorageService::in_memory();
        let err = svc
            .set_items(vec![("local:a", json!(1)), ("nowhere", json!(2))])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
        assert_eq!(svc.get_item("local:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn typed_accessors_and_fallback() {
        let svc = StorageService::in_memory();
        svc.set("local:list", &vec![1u8, 2, 3]).await.unwrap();

        assert_eq!(svc.get::<Vec<u8>>("local:list").await.unwrap(), Some(vec![1, 2, 3]));
        assert!(matches!(
            svc.get::<String>("local:list").await,
            Err(StorageError::Serialization { .. })
        ));
        assert_eq!(
            svc.get_item_or("local:none", json!("dflt")).await.unwrap(),
            json!("dflt")
        );
    }

    #[tokio::test]
    async fn remove_item_with_meta() {
        let svc = StorageService::in_memory();
        svc.set_item("local:x", json!(1)).await.unwrap();
        svc.set_meta("local:x", meta(json!({"v": 2}))).await.unwrap();

        svc.remove_item("local:x", RemoveOptions::default()).await.unwrap();
        assert_eq!(svc.get_item("local:x").await.unwrap(), None);
        assert_eq!(Value::Object(svc.get_meta("local:x").await.unwrap()), json!({"v": 2}));

        svc.set_item("local:x", json!(1)).await.unwrap();
        svc.remove_item("local:x", RemoveOptions::with_meta()).await.unwrap();
        assert_eq!(svc.get_item("local:x").await.unwrap(), None);
        assert!(svc.get_meta("local:x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batched_metadata() {
        let svc = StorageService::in_memory();
        svc.set_metas(vec![
            ("local:a", meta(json!({"v": 2}))),
            ("sync:b", meta(json!({"tag": "x"}))),
        ])
        .await
        .unwrap();
        svc.set_metas(vec![("local:a", meta(json!({"seen": true})))])
            .await
            .unwrap();

        let metas = svc.get_metas(&["sync:b", "local:a", "local:c"]).await.unwrap();
        assert_eq!(Value::Object(metas[0].1.clone()), json!({"tag": "x"}));
        assert_eq!(Value::Object(metas[1].1.clone()), json!({"v": 2, "seen": true}));
        assert!(metas[2].1.is_empty());

        svc.remove_meta("local:a", Some(&["v".to_string()])).await.unwrap();
        assert_eq!(Value::Object(svc.get_meta("local:a").await.unwrap()), json!({"seen": true}));
    }

    #[tokio::test]
    async fn snapshot_excludes_keys_and_their_metadata() {
        let svc = StorageService::in_memory();
        svc.set_items(vec![("local:keep", json!(1)), ("local:secret", json!(2))])
            .await
            .unwrap();
        svc.set_meta("local:secret", meta(json!({"v": 3}))).await.unwrap();

        let snap = svc.snapshot(Area::Local, &["secret"]).await.unwrap();
        assert_eq!(snap.into_iter().collect::<Vec<_>>(), vec![("keep".to_string(), json!(1))]);

        let mut data = BTreeMap::new();
        data.insert("restored".to_string(), json!(true));
        svc.restore_snapshot(Area::Session, data).await.unwrap();
        assert_eq!(svc.get_item("session:restored").await.unwrap(), Some(json!(true)));

        svc.clear(Area::Local).await.unwrap();
        assert!(svc.snapshot(Area::Local, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unwatch_detaches_everything() {
        let svc = StorageService::in_memory();
        let a = svc.watch("local:a", |_, _| {}).unwrap();
        let b = svc.watch("sync:b", |_, _| {}).unwrap();
        assert_eq!(svc.watchers.count(Area::Local), 1);
        assert_eq!(svc.watchers.count(Area::Sync), 1);

        svc.unwatch();
        assert_eq!(svc.watchers.count(Area::Local), 0);
        assert_eq!(svc.watchers.count(Area::Sync), 0);
        // dropping handles after a global unwatch is harmless
        drop((a, b));
    }
}
