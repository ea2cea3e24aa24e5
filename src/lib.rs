pub mod config;
pub mod errors;
pub mod lock;
pub mod reactive;
pub mod storage;

pub use config::SyncConfig;
pub use errors::{LockError, StorageError};
pub use reactive::{SharedCell, SyncBinding};
pub use storage::{ItemOptions, StorageService, VersionedItem};
