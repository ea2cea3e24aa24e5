use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::binding::SyncBinding;
use super::cell::{SharedCell, Subscription};
use crate::config::SyncConfig;
use crate::errors::StorageError;
use crate::storage::{ItemValue, RemoveOptions, Unwatch, VersionedItem};

type Reducer<S, E> = Arc<dyn Fn(&mut S, E) + Send + Sync>;

/// Reducer-driven state persisted through a debounced [`SyncBinding`].
///
/// ```no_run
/// use gosub_storage::config::SyncConfig;
/// use gosub_storage::reactive::GenericStore;
/// use gosub_storage::storage::{ItemOptions, StorageService};
///
/// enum Event { Inc, Reset }
///
/// # async fn demo() -> Result<(), gosub_storage::errors::StorageError> {
/// let storage = StorageService::in_memory();
/// let item = storage.define_item("local:clicks", ItemOptions::new().fallback(0u32))?;
/// let reduce = |n: &mut u32, ev: Event| match ev {
///     Event::Inc => *n += 1,
///     Event::Reset => *n = 0,
/// };
/// let store = GenericStore::new(item, 0u32, SyncConfig::default(), reduce)?;
/// store.loaded().await?;
/// store.update_state(Event::Inc);
/// # Ok(())
/// # }
/// ```
pub struct GenericStore<S, E> {
    binding: SyncBinding<S, SharedCell<S>>,
    reducer: Reducer<S, E>,
}

impl<S, E> GenericStore<S, E>
where
    S: ItemValue + PartialEq,
{
    /// `initial` is shown until the persisted state has loaded.
    pub fn new<R>(
        item: VersionedItem<S>,
        initial: S,
        config: SyncConfig,
        reducer: R,
    ) -> Result<Self, StorageError>
    where
        R: Fn(&mut S, E) + Send + Sync + 'static,
    {
        let binding = SyncBinding::new(item, SharedCell::new(initial), &config)?;
        Ok(Self {
            binding,
            reducer: Arc::new(reducer),
        })
    }

    pub fn state(&self) -> S {
        self.binding.get()
    }

    pub fn cell(&self) -> &SharedCell<S> {
        self.binding.cell()
    }

    /// Applies `event` to the state in place. Returns `true` if the state changed.
    pub fn update_state(&self, event: E) -> bool {
        self.binding.cell().update(|state| (self.reducer)(state, event))
    }

    pub fn subscribe(&self, on_change: impl Fn(&S) + Send + Sync + 'static) -> Subscription {
        self.binding.cell().subscribe(on_change)
    }

    pub async fn loaded(&self) -> Result<(), StorageError> {
        self.binding.loaded().await
    }

    pub async fn flush(&self) {
        self.binding.flush().await;
    }

    pub async fn close(self) {
        self.binding.close().await;
    }
}

/// A value bound to one storage key that is written through on every `set`.
///
/// The value starts as `None` and is filled by an asynchronous load (stored
/// value, initialized value or fallback). External changes to the key are
/// followed for as long as the `StoredValue` lives.
pub struct StoredValue<T> {
    item: VersionedItem<T>,
    cell: SharedCell<Option<T>>,
    touched: Arc<AtomicBool>,
    loaded: watch::Receiver<Option<Result<(), StorageError>>>,
    _unwatch: Unwatch,
    _load_guard: DropGuard,
}

impl<T: ItemValue + PartialEq> StoredValue<T> {
    /// Must be called from within a tokio runtime.
    pub fn new(item: VersionedItem<T>) -> Result<Self, StorageError> {
        let cell = SharedCell::new(None);
        let touched = Arc::new(AtomicBool::new(false));

        let unwatch = {
            let cell = cell.clone();
            item.watch(move |new, _old| {
                cell.set(new);
            })?
        };

        let (loaded_tx, loaded) = watch::channel(None);
        let cancel = CancellationToken::new();
        {
            let token = cancel.child_token();
            let (item, cell, touched) = (item.clone(), cell.clone(), Arc::clone(&touched));
            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = token.cancelled() => return,
                    res = item.get_value() => res,
                };
                let outcome = result.map(|value| {
                    if !touched.load(Ordering::SeqCst) {
                        cell.set(value);
                    }
                });
                if let Err(e) = &outcome {
                    log::error!("loading `{}` failed: {e}", item.key());
                }
                let _ = loaded_tx.send(Some(outcome));
            });
        }

        Ok(Self {
            item,
            cell,
            touched,
            loaded,
            _unwatch: unwatch,
            _load_guard: cancel.drop_guard(),
        })
    }

    pub fn get(&self) -> Option<T> {
        self.cell.get()
    }

    pub fn cell(&self) -> &SharedCell<Option<T>> {
        &self.cell
    }

    pub fn item(&self) -> &VersionedItem<T> {
        &self.item
    }

    /// Updates the in-memory value and persists it right away.
    pub async fn set(&self, value: T) -> Result<(), StorageError> {
        self.touched.store(true, Ordering::SeqCst);
        self.cell.set(Some(value.clone()));
        self.item.set_value(value).await
    }

    /// Removes the stored value. The in-memory value becomes the fallback.
    pub async fn remove(&self) -> Result<(), StorageError> {
        self.touched.store(true, Ordering::SeqCst);
        self.cell.set(self.item.fallback().cloned());
        self.item.remove_value(RemoveOptions::default()).await
    }

    pub fn subscribe(
        &self,
        on_change: impl Fn(&Option<T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.cell.subscribe(on_change)
    }

    pub async fn loaded(&self) -> Result<(), StorageError> {
        let mut rx = self.loaded.clone();
        let outcome = rx.wait_for(Option::is_some).await.map_err(|_| {
            StorageError::Init(Arc::new(anyhow::anyhow!(
                "initial load of `{}` was abandoned",
                self.item.key()
            )))
        })?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Ok(()),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for StoredValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredValue")
            .field("item", &self.item)
            .field("cell", &self.cell)
            .finish_non_exhaustive()
    }
}
