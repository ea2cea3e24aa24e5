//! Persistent key/value storage with versioned items.
//!
//! Storage is split into four areas (`local`, `session`, `sync`, `managed`).
//! Each area is served by one [`StorageArea`] backend. The [`StorageService`]
//! facade addresses them with compound keys such as `local:settings`, and keeps
//! a metadata record next to every key under `<key>$`.
//!
//! # Layers
//!
//! - [`StorageArea`]: the raw async backend contract. Implemented by
//!   [`InMemoryArea`] and, with the `sqlite_store` feature, [`SqliteArea`].
//! - [`KeyValueStore`]: per-area adapter adding metadata, `null` handling,
//!   availability checks and change watchers.
//! - [`StorageService`]: key resolution and per-area batching.
//! - [`VersionedItem`]: a typed value with a schema version, migrations,
//!   lazy initialization and a fallback.
//!
//! # Example
//!
//! ```no_run
//! use gosub_storage::storage::{ItemOptions, StorageService};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), gosub_storage::errors::StorageError> {
//! let storage = StorageService::in_memory();
//! let counter = storage.define_item(
//!     "local:counter",
//!     ItemOptions::new()
//!         .version(2)
//!         .fallback(json!({"count": 0}))
//!         .migration(2, |old| Ok(json!({"count": old})))
//!         .on_migration_complete(|value, v| log::info!("counter at v{v}: {value}")),
//! )?;
//!
//! let value = counter.get_value().await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

/// Default capacity of the per-area change channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

pub mod area;
pub mod event;
pub mod in_memory;
pub mod item;
pub mod kv;
pub mod service;
#[cfg(feature = "sqlite_store")]
pub mod sqlite_store;
pub mod types;
pub mod watch;

pub use area::StorageArea;
pub use event::{StorageBus, StorageEvent, Subscription};
pub use in_memory::InMemoryArea;
pub use item::{ItemOptions, ItemValue, VersionedItem};
pub use kv::KeyValueStore;
pub use service::{StorageService, StorageServiceBuilder};
#[cfg(feature = "sqlite_store")]
pub use sqlite_store::SqliteArea;
pub use types::{Area, MetaMap, RemoveOptions, StorageKey};
pub use watch::{Unwatch, WatchId, WatchRegistry};
