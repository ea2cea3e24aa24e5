//! Binding configuration.
//!
//! `SyncConfig` controls how a [`SyncBinding`](crate::reactive::SyncBinding)
//! writes in-memory changes back to storage. Writes are debounced: a burst of
//! changes inside `debounce_delay` coalesces into one write, and
//! `debounce_max_wait` caps how long a continuous burst can postpone it.
//!
//! # Examples
//!
//! ## Use defaults
//! ```rust
//! use gosub_storage::config::SyncConfig;
//! use std::time::Duration;
//! let cfg = SyncConfig::default();
//! assert_eq!(cfg.debounce_delay, Duration::from_millis(300));
//! assert_eq!(cfg.debounce_max_wait, Duration::from_millis(1000));
//! ```
//!
//! ## Customize with the builder
//! ```rust
//! use gosub_storage::config::SyncConfig;
//! use std::time::Duration;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = SyncConfig::builder()
//!     .debounce_delay(Duration::from_millis(50))
//!     .debounce_max_wait(Duration::from_millis(500))
//!     .build()?; // returns Result<SyncConfig, SyncConfigError>
//! # Ok(()) }
//! ```
//!
//! # Errors
//!
//! Builder validation returns [`SyncConfigError`] if the delay is zero or the
//! maximum wait is shorter than the delay.

use std::fmt;
use std::time::Duration;

pub const DEFAULT_DEBOUNCE_DELAY: Duration = Duration::from_millis(300);
pub const DEFAULT_DEBOUNCE_MAX_WAIT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Quiet period after the last change before a write is issued
    pub debounce_delay: Duration,
    /// Upper bound between the first change of a burst and its write
    pub debounce_max_wait: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_delay: DEFAULT_DEBOUNCE_DELAY,
            debounce_max_wait: DEFAULT_DEBOUNCE_MAX_WAIT,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }
}

/// Builder for [`SyncConfig`].
#[derive(Debug, Clone, Default)]
pub struct SyncConfigBuilder {
    inner: SyncConfig,
}

impl SyncConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut SyncConfig)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn debounce_delay(self, d: Duration) -> Self { self.map(|c| c.debounce_delay = d) }
    pub fn debounce_max_wait(self, d: Duration) -> Self { self.map(|c| c.debounce_max_wait = d) }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut SyncConfig)) -> Self { self.map(f) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<SyncConfig, SyncConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

// ---------- Validation ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncConfigError {
    ZeroDelay,
    MaxWaitShorterThanDelay { delay: Duration, max_wait: Duration },
}

impl fmt::Display for SyncConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncConfigError::ZeroDelay =>
                write!(f, "debounce_delay must be greater than zero"),
            SyncConfigError::MaxWaitShorterThanDelay { delay, max_wait } =>
                write!(f, "debounce_max_wait ({max_wait:?}) < debounce_delay ({delay:?})"),
        }
    }
}
impl std::error::Error for SyncConfigError {}

fn validate(c: &SyncConfig) -> Result<(), SyncConfigError> {
    if c.debounce_delay.is_zero() {
        return Err(SyncConfigError::ZeroDelay);
    }
    if c.debounce_max_wait < c.debounce_delay {
        return Err(SyncConfigError::MaxWaitShorterThanDelay {
            delay: c.debounce_delay,
            max_wait: c.debounce_max_wait,
        });
    }
    Ok(())
}
