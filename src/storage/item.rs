//! Versioned, typed storage items.
//!
//! A [`VersionedItem`] binds one storage key to a typed value, a target schema
//! version and a set of migration steps. The first accessor call migrates the
//! persisted value up to the target version; concurrent callers share that one
//! migration run. If an `init` producer is configured, the first read of an
//! absent value initializes it exactly once, guarded by the item's mutex.
//!
//! # Migration
//!
//! - The value and its metadata are read in one batched call.
//! - An absent value needs no migration.
//! - A stored version above the target is refused with
//!   [`StorageError::VersionDowngrade`]; nothing is written.
//! - Steps run from `stored + 1` to `target` in order. A version without a
//!   registered step passes the value through unchanged.
//! - The migrated value and `v = target` are written back in one batched call,
//!   only after every step succeeded.
//!
//! Writes never lower the stored version either. Metadata can outlive its value,
//! so `set_value` checks it even when the value slot is empty.
//!
//! A failed automatic migration is reported to everyone who was waiting on it.
//! The next new accessor call starts a fresh attempt.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, MutexGuard, PoisonError};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::kv::KeyValueStore;
use super::types::{meta_from_value, version_of, MetaMap, RemoveOptions, StorageKey, VERSION_FIELD};
use super::watch::Unwatch;
use crate::errors::StorageError;
use crate::lock::Mutex;

/// Types that can be stored in a [`VersionedItem`].
pub trait ItemValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> ItemValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Transforms a value from the previous version's shape into this version's shape.
pub type MigrationFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
/// Produces the first value of an item that has never been written.
pub type InitFn<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

type CompleteHook = Arc<dyn Fn(&Value, u32) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&StorageError) + Send + Sync>;

/// Options for [`StorageService::define_item`](super::StorageService::define_item).
///
/// ```rust
/// use gosub_storage::storage::ItemOptions;
/// use serde_json::json;
///
/// let opts = ItemOptions::<serde_json::Value>::new()
///     .version(2)
///     .fallback(json!({"count": 0}))
///     .migration(2, |old| {
///         let count = old.get("count").cloned().unwrap_or(json!(0));
///         Ok(json!({"count": count}))
///     });
/// assert_eq!(opts.target_version(), 2);
/// ```
pub struct ItemOptions<T> {
    version: u32,
    fallback: Option<T>,
    init: Option<InitFn<T>>,
    migrations: BTreeMap<u32, MigrationFn>,
    on_migration_complete: Option<CompleteHook>,
    on_migration_error: Option<ErrorHook>,
}

impl<T> Default for ItemOptions<T> {
    fn default() -> Self {
        Self {
            version: 1,
            fallback: None,
            init: None,
            migrations: BTreeMap::new(),
            on_migration_complete: None,
            on_migration_error: None,
        }
    }
}

impl<T: Send + 'static> ItemOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target schema version (default 1).
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Value returned while nothing is stored.
    pub fn fallback(mut self, value: T) -> Self {
        self.fallback = Some(value);
        self
    }

    pub fn init<F>(mut self, f: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(move || futures::future::ready(Ok(f())).boxed()));
        self
    }

    pub fn init_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.init = Some(Arc::new(move || f().boxed()));
        self
    }

    /// Registers the step that produces version `version` from `version - 1`.
    pub fn migration<F>(mut self, version: u32, f: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.migrations
            .insert(version, Arc::new(move |v| futures::future::ready(f(v)).boxed()));
        self
    }

    pub fn migration_async<F, Fut>(mut self, version: u32, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.migrations.insert(version, Arc::new(move |v| f(v).boxed()));
        self
    }

    pub fn on_migration_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, u32) + Send + Sync + 'static,
    {
        self.on_migration_complete = Some(Arc::new(f));
        self
    }

    pub fn on_migration_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&StorageError) + Send + Sync + 'static,
    {
        self.on_migration_error = Some(Arc::new(f));
        self
    }

    pub fn target_version(&self) -> u32 {
        self.version
    }

    fn validate(&self, key: &StorageKey) -> Result<(), StorageError> {
        let invalid = |reason: String| StorageError::InvalidOptions {
            key: key.to_string(),
            reason,
        };
        if self.version == 0 {
            return Err(invalid("version must be at least 1".into()));
        }
        if let Some(bad) = self
            .migrations
            .keys()
            .find(|&&v| v < 2 || v > self.version)
        {
            return Err(invalid(format!(
                "migration registered for v{bad}, expected 2..={}",
                self.version
            )));
        }
        Ok(())
    }
}

type MigrationFuture = Shared<BoxFuture<'static, Result<(), StorageError>>>;

enum MigrationState {
    Idle,
    Running(MigrationFuture),
    Done,
}

struct ItemInner<T> {
    key: StorageKey,
    store: KeyValueStore,
    options: ItemOptions<T>,
    lock: Mutex,
    migration: std::sync::Mutex<MigrationState>,
}

/// A typed value bound to one storage key, with schema migrations.
///
/// Cloning is cheap; clones share the migration state and the lock.
pub struct VersionedItem<T> {
    inner: Arc<ItemInner<T>>,
}

impl<T> Clone for VersionedItem<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for VersionedItem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedItem")
            .field("key", &self.inner.key.to_string())
            .field("version", &self.inner.options.version)
            .finish_non_exhaustive()
    }
}

impl<T: ItemValue> VersionedItem<T> {
    pub(crate) fn new(
        store: KeyValueStore,
        key: StorageKey,
        options: ItemOptions<T>,
    ) -> Result<Self, StorageError> {
        options.validate(&key)?;
        Ok(Self {
            inner: Arc::new(ItemInner {
                key,
                store,
                options,
                lock: Mutex::new(),
                migration: std::sync::Mutex::new(MigrationState::Idle),
            }),
        })
    }

    /// The compound `<area>:<key>` this item is bound to.
    pub fn key(&self) -> String {
        self.inner.key.to_string()
    }

    pub fn fallback(&self) -> Option<&T> {
        self.inner.options.fallback.as_ref()
    }

    pub fn version(&self) -> u32 {
        self.inner.options.version
    }

    /// Returns the stored value, the initialized value, or the fallback.
    pub async fn get_value(&self) -> Result<Option<T>, StorageError> {
        self.ensure_migrated().await?;
        let raw = match &self.inner.options.init {
            Some(init) => Some(self.inner.get_or_init(init).await?),
            None => self.inner.store.get(&self.inner.key.key).await?,
        };
        self.inner.decode_or_fallback(raw)
    }

    pub async fn get_meta(&self) -> Result<MetaMap, StorageError> {
        self.ensure_migrated().await?;
        self.inner.store.get_meta(&self.inner.key.key).await
    }

    /// Stores `value` and stamps the current schema version into its metadata.
    pub async fn set_value(&self, value: T) -> Result<(), StorageError> {
        self.ensure_migrated().await?;
        let raw = self.inner.encode(&value)?;
        self.inner.write_value(raw).await
    }

    /// Merges `patch` into the metadata. `null` fields are deleted.
    pub async fn set_meta(&self, patch: MetaMap) -> Result<(), StorageError> {
        self.ensure_migrated().await?;
        self.inner.store.set_meta(&self.inner.key.key, patch).await
    }

    pub async fn remove_value(&self, opts: RemoveOptions) -> Result<(), StorageError> {
        self.ensure_migrated().await?;
        let key = &self.inner.key;
        if opts.remove_meta {
            self.inner.store.remove_many(&[key.key.clone(), key.meta_key()]).await
        } else {
            self.inner.store.remove(&key.key).await
        }
    }

    /// Removes the whole metadata record (`None`) or only the named fields.
    pub async fn remove_meta(&self, fields: Option<&[String]>) -> Result<(), StorageError> {
        self.ensure_migrated().await?;
        self.inner.store.remove_meta(&self.inner.key.key, fields).await
    }

    /// Calls `cb(new, old)` on every change. Absent values are replaced by the fallback.
    pub fn watch<F>(&self, cb: F) -> Result<Unwatch, StorageError>
    where
        F: Fn(Option<T>, Option<T>) + Send + Sync + 'static,
    {
        let fallback = self.inner.options.fallback.clone();
        let name = self.key();
        self.inner.store.watch(&self.inner.key.key, move |new, old| {
            let decode = |raw: Option<Value>| match raw {
                None => fallback.clone(),
                Some(raw) => match serde_json::from_value(raw) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        log::warn!("`{name}`: ignoring undecodable value in change event: {e}");
                        fallback.clone()
                    }
                },
            };
            cb(decode(new), decode(old));
        })
    }

    /// Runs the migration routine now. A no-op when the stored version is already the target.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.inner.migrate_locked().await?;
        *self.inner.migration_state() = MigrationState::Done;
        Ok(())
    }

    async fn ensure_migrated(&self) -> Result<(), StorageError> {
        let fut = {
            let mut state = self.inner.migration_state();
            match &*state {
                MigrationState::Done => return Ok(()),
                MigrationState::Running(fut) => fut.clone(),
                MigrationState::Idle => {
                    // Runs on its own task so it completes and releases the
                    // lock even when every caller stops waiting for it.
                    let task = {
                        let inner = Arc::clone(&self.inner);
                        tokio::spawn(async move {
                            let res = inner.migrate_locked().await;
                            *inner.migration_state() = match res {
                                Ok(()) => MigrationState::Done,
                                Err(_) => MigrationState::Idle,
                            };
                            res
                        })
                    };
                    let inner = Arc::clone(&self.inner);
                    let fut = async move {
                        task.await.unwrap_or_else(|e| {
                            *inner.migration_state() = MigrationState::Idle;
                            Err(StorageError::Migration {
                                key: inner.key.to_string(),
                                version: inner.options.version,
                                reason: format!("migration task failed: {e}"),
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    *state = MigrationState::Running(fut.clone());
                    fut
                }
            }
        };
        fut.await
    }
}

impl<T: ItemValue> ItemInner<T> {
    fn migration_state(&self) -> MutexGuard<'_, MigrationState> {
        self.migration.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn encode(&self, value: &T) -> Result<Value, StorageError> {
        serde_json::to_value(value)
            .map_err(|e| StorageError::serialization(&self.key.to_string(), e))
    }

    fn decode_or_fallback(&self, raw: Option<Value>) -> Result<Option<T>, StorageError> {
        match raw {
            Some(raw) => serde_json::from_value(raw)
                .map(Some)
                .map_err(|e| StorageError::serialization(&self.key.to_string(), e)),
            None => Ok(self.options.fallback.clone()),
        }
    }

    fn report(&self, err: &StorageError) {
        log::error!("{err}");
        if let Some(hook) = &self.options.on_migration_error {
            hook(err);
        }
    }

    /// Writes the value together with `v = target`, preserving other metadata fields.
    /// Metadata left behind by a newer schema is never stamped down.
    async fn write_value(&self, raw: Value) -> Result<(), StorageError> {
        let mut meta = self.store.get_meta(&self.key.key).await?;
        let stored = version_of(&meta);
        if stored > self.options.version {
            return Err(StorageError::VersionDowngrade {
                key: self.key.to_string(),
                stored,
                target: self.options.version,
            });
        }
        meta.insert(VERSION_FIELD.to_string(), Value::from(self.options.version));
        self.store
            .set_many(vec![
                (self.key.key.clone(), raw),
                (self.key.meta_key(), Value::Object(meta)),
            ])
            .await
    }

    async fn get_or_init(&self, init: &InitFn<T>) -> Result<Value, StorageError> {
        self.lock
            .run_exclusive(|| async {
                if let Some(existing) = self.store.get(&self.key.key).await? {
                    return Ok::<_, StorageError>(existing);
                }
                log::debug!("`{}`: initializing value", self.key);
                let produced = init().await.map_err(|e| StorageError::Init(Arc::new(e)))?;
                let raw = self.encode(&produced)?;
                self.write_value(raw.clone()).await?;
                Ok::<_, StorageError>(raw)
            })
            .await?
    }

    async fn migrate_locked(&self) -> Result<(), StorageError> {
        self.lock.run_exclusive(|| self.run_migration()).await?
    }

    async fn run_migration(&self) -> Result<(), StorageError> {
        let name = self.key.to_string();
        let key = self.key.key.clone();
        let meta_key = self.key.meta_key();

        let mut pair = self
            .store
            .get_many(&[key.clone(), meta_key.clone()])
            .await?
            .into_iter()
            .map(|(_, v)| v);
        let value = pair.next().flatten();
        let meta = meta_from_value(pair.next().flatten());

        let Some(mut value) = value else {
            log::debug!("`{name}`: nothing stored, no migration needed");
            return Ok(());
        };

        let target = self.options.version;
        let current = version_of(&meta);
        if current > target {
            let err = StorageError::VersionDowngrade {
                key: name,
                stored: current,
                target,
            };
            self.report(&err);
            return Err(err);
        }
        if current == target {
            log::debug!("`{name}`: already at v{target}");
            return Ok(());
        }

        log::info!("`{name}`: migrating v{current} -> v{target}");
        for version in current + 1..=target {
            let Some(step) = self.options.migrations.get(&version) else {
                continue;
            };
            value = match step(value).await {
                Ok(next) => next,
                Err(e) => {
                    let err = StorageError::Migration {
                        key: name,
                        version,
                        reason: format!("{e:#}"),
                    };
                    self.report(&err);
                    return Err(err);
                }
            };
        }

        let mut meta = meta;
        meta.insert(VERSION_FIELD.to_string(), Value::from(target));
        self.store
            .set_many(vec![(key, value.clone()), (meta_key, Value::Object(meta))])
            .await?;

        log::info!("`{name}`: migrated to v{target}");
        if let Some(hook) = &self.options.on_migration_complete {
            hook(&value, target);
        }
        Ok(())
    }
}
