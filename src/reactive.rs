//! Reactive state kept in sync with storage.
//!
//! - [`SharedCell`]: a thread-safe observable value that notifies only on
//!   real changes, compared by value.
//! - [`ObservableCell`]: the capability a binding needs from a cell, so other
//!   reactive runtimes can plug in their own value type.
//! - [`Debouncer`]: coalesces bursts of triggers into one async run, bounded
//!   by a maximum wait.
//! - [`SyncBinding`]: couples a cell to a [`VersionedItem`](crate::storage::VersionedItem).
//!   External changes flow into the cell, and cell changes flow back through
//!   the debouncer.
//! - [`GenericStore`] and [`StoredValue`]: ready-made state containers on top
//!   of the above.
//!
//! # Example
//!
//! ```no_run
//! use gosub_storage::config::SyncConfig;
//! use gosub_storage::reactive::{SharedCell, SyncBinding};
//! use gosub_storage::storage::{ItemOptions, StorageService};
//!
//! # async fn demo() -> Result<(), gosub_storage::errors::StorageError> {
//! let storage = StorageService::in_memory();
//! let item = storage.define_item("local:volume", ItemOptions::new().fallback(50u8))?;
//!
//! let volume = SharedCell::new(0u8);
//! let binding = SyncBinding::new(item, volume.clone(), &SyncConfig::default())?;
//! binding.loaded().await?;
//!
//! volume.set(80); // persisted about 300ms later
//! binding.close().await;
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod cell;
pub mod debounce;
pub mod store;

pub use binding::SyncBinding;
pub use cell::{ObservableCell, SharedCell, Subscription};
pub use debounce::{DebounceHandle, Debouncer};
pub use store::{GenericStore, StoredValue};
