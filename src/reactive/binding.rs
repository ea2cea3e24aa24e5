//! Two-way binding between an observable cell and a versioned item.
//!
//! - Storage to memory: the initial load seeds the cell, and every external
//!   change reported by the item's watcher overwrites it.
//! - Memory to storage: real changes of the cell schedule a debounced write of
//!   the cell's current value.
//!
//! The binding remembers the last value it knows to be in storage. Cell
//! changes equal to that value are not written back, and change events equal
//! to it are not applied to the cell. That breaks the loop between the two
//! directions, including the echo of the binding's own writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::cell::{ObservableCell, Subscription};
use super::debounce::Debouncer;
use crate::config::SyncConfig;
use crate::errors::StorageError;
use crate::storage::{ItemValue, Unwatch, VersionedItem};

type LoadOutcome = Option<Result<(), StorageError>>;

struct SyncState<T> {
    /// Last value known to be persisted.
    synced: Mutex<Option<T>>,
    /// Set once the cell was changed locally.
    dirty: AtomicBool,
}

impl<T: PartialEq> SyncState<T> {
    fn synced(&self) -> MutexGuard<'_, Option<T>> {
        self.synced.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_synced(&self, value: &T) -> bool {
        self.synced().as_ref() == Some(value)
    }

    /// Records a value seen in storage. Returns `false` if it was already known.
    fn accept_remote(&self, value: &T) -> bool
    where
        T: Clone,
    {
        let mut synced = self.synced();
        if synced.as_ref() == Some(value) {
            return false;
        }
        *synced = Some(value.clone());
        true
    }
}

/// Keeps a cell and a [`VersionedItem`] in sync.
///
/// Dropping the binding stops both directions and still writes a pending
/// change in the background. Use [`close`](Self::close) to discard it instead.
pub struct SyncBinding<T, C> {
    item: VersionedItem<T>,
    cell: C,
    debouncer: Debouncer,
    loaded: watch::Receiver<LoadOutcome>,
    cell_sub: Subscription,
    unwatch: Unwatch,
    load_guard: DropGuard,
}

impl<T, C> SyncBinding<T, C>
where
    T: ItemValue + PartialEq,
    C: ObservableCell<T> + Clone + 'static,
{
    /// Binds `cell` to `item`. Must be called from within a tokio runtime.
    pub fn new(item: VersionedItem<T>, cell: C, config: &SyncConfig) -> Result<Self, StorageError> {
        let state = Arc::new(SyncState {
            synced: Mutex::new(None),
            dirty: AtomicBool::new(false),
        });

        let unwatch = {
            let (cell, state, key) = (cell.clone(), Arc::clone(&state), item.key());
            item.watch(move |new, _old| {
                let Some(new) = new else {
                    log::debug!("`{key}` was removed without a fallback, keeping the cell value");
                    return;
                };
                if state.accept_remote(&new) {
                    cell.set(new);
                }
            })?
        };

        let debouncer = {
            let (cell, state, item) = (cell.clone(), Arc::clone(&state), item.clone());
            Debouncer::spawn(config, move || {
                let value = cell.get();
                let (state, item) = (Arc::clone(&state), item.clone());
                async move { write_back(&item, &state, value).await }
            })
        };

        let cell_sub = {
            let (state, trigger) = (Arc::clone(&state), debouncer.handle());
            cell.subscribe(Box::new(move |value: &T| {
                if state.is_synced(value) {
                    return;
                }
                state.dirty.store(true, Ordering::SeqCst);
                trigger.trigger();
            }))
        };

        let (loaded_tx, loaded) = watch::channel(None);
        let cancel = CancellationToken::new();
        {
            let token = cancel.child_token();
            let (cell, state, item) = (cell.clone(), Arc::clone(&state), item.clone());
            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = token.cancelled() => return,
                    res = item.get_value() => res,
                };
                let outcome = match result {
                    Ok(Some(value)) => {
                        if state.dirty.load(Ordering::SeqCst) {
                            log::debug!(
                                "`{}` changed locally before it loaded, keeping local value",
                                item.key()
                            );
                        } else {
                            *state.synced() = Some(value.clone());
                            cell.set(value);
                        }
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(e) => {
                        log::error!("initial load of `{}` failed: {e}", item.key());
                        Err(e)
                    }
                };
                let _ = loaded_tx.send(Some(outcome));
            });
        }

        Ok(Self {
            item,
            cell,
            debouncer,
            loaded,
            cell_sub,
            unwatch,
            load_guard: cancel.drop_guard(),
        })
    }

    pub fn cell(&self) -> &C {
        &self.cell
    }

    pub fn item(&self) -> &VersionedItem<T> {
        &self.item
    }

    pub fn get(&self) -> T {
        self.cell.get()
    }

    /// Waits for the initial load and returns its outcome.
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

    /// Writes a pending change now and waits until it is persisted.
    pub async fn flush(&self) {
        self.debouncer.flush().await;
    }

    /// Tears the binding down. A pending write is discarded; a write that
    /// already started is awaited.
    pub async fn close(self) {
        let Self {
            debouncer,
            cell_sub,
            unwatch,
            load_guard,
            ..
        } = self;
        drop(load_guard);
        drop(cell_sub);
        drop(unwatch);
        debouncer.close().await;
    }
}

async fn write_back<T>(item: &VersionedItem<T>, state: &SyncState<T>, value: T)
where
    T: ItemValue + PartialEq,
{
    let previous = {
        let mut synced = state.synced();
        if synced.as_ref() == Some(&value) {
            return;
        }
        synced.replace(value.clone())
    };

    log::debug!("writing back `{}`", item.key());
    if let Err(e) = item.set_value(value).await {
        log::error!("debounced write of `{}` failed: {e}", item.key());
        *state.synced() = previous;
    }
}

impl<T, C> std::fmt::Debug for SyncBinding<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBinding")
            .field("item", &self.item)
            .field("debouncer", &self.debouncer)
            .finish_non_exhaustive()
    }
}
