use std::sync::Arc;

/// Errors returned by the storage service, its areas and versioned items.
///
/// The type is `Clone` so a single migration outcome can be handed to every
/// caller that was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("storage area `{area}` is unavailable: missing {capability}")]
    Configuration { area: String, capability: String },

    #[error("invalid storage key `{0}`: expected `<area>:<key>`")]
    InvalidKey(String),

    #[error("unknown storage area `{area}` in key `{key}`")]
    UnknownArea { key: String, area: String },

    #[error("version downgrade detected for `{key}`: stored v{stored}, requested v{target}")]
    VersionDowngrade { key: String, stored: u32, target: u32 },

    #[error("migration of `{key}` to v{version} failed: {reason}")]
    Migration {
        key: String,
        version: u32,
        reason: String,
    },

    #[error("invalid options for `{key}`: {reason}")]
    InvalidOptions { key: String, reason: String },

    #[error("cannot convert value of `{key}`: {reason}")]
    Serialization { key: String, reason: String },

    #[error("{0:#}")]
    Init(Arc<anyhow::Error>),

    #[error("storage backend failure: {0:#}")]
    Backend(Arc<anyhow::Error>),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl StorageError {
    pub(crate) fn backend(err: anyhow::Error) -> Self {
        StorageError::Backend(Arc::new(err))
    }

    pub(crate) fn serialization(key: &str, err: impl std::fmt::Display) -> Self {
        StorageError::Serialization {
            key: key.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Errors returned by [`Semaphore`](crate::lock::Semaphore) and [`Mutex`](crate::lock::Mutex).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("lock request was cancelled before it was granted")]
    Cancelled,

    #[error("invalid weight {0}: must be at least 1")]
    InvalidWeight(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_key_and_versions() {
        let err = StorageError::VersionDowngrade {
            key: "local:counter".into(),
            stored: 3,
            target: 2,
        };
        let s = err.to_string();
        assert!(s.contains("local:counter"));
        assert!(s.contains("v3"));
        assert!(s.contains("v2"));
    }

    #[test]
    fn backend_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("disk full").context("writing `settings`");
        let err = StorageError::backend(inner);
        let s = err.to_string();
        assert!(s.contains("writing `settings`"));
        assert!(s.contains("disk full"));
    }

    #[test]
    fn lock_error_converts() {
        let err: StorageError = LockError::Cancelled.into();
        assert!(matches!(err, StorageError::Lock(LockError::Cancelled)));
    }
}
