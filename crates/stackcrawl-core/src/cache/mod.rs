//! # Stackwalk Cache
//!
//! Memoizes the minimal facts needed to pop a jitted frame, keyed by
//! instruction pointer.
//!
//! The first walk through a method pays for a full unwind-info decode; later
//! walks through the same IP pop the frame straight from a two-word
//! [`CacheEntry`]. The table is shared by every thread and never locked:
//! entries move as single 128-bit atomics, so readers see whole entries and
//! racing writers merely lose each other's work.
//!
//! ## Usage
//!
//! ```rust
//! use stackcrawl_core::cache::{CacheConfig, CacheEntry, StackwalkCache};
//! use stackcrawl_core::layout::{WindowedFacts, WindowedLayout};
//! use stackcrawl_core::types::Address;
//!
//! let cache = StackwalkCache::<WindowedLayout>::new(&CacheConfig::default())?;
//! let facts = WindowedFacts { stack_pointer_offset: 0x28, frame_pointer_offset: 0x20 };
//! let entry = CacheEntry::build(Address::from(0x7ff6_0000_1040), 0x28, &facts, 0)?;
//!
//! let mut local = cache.local();
//! local.insert(&entry);
//! assert!(local.lookup(Address::from(0x7ff6_0000_1040)));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Process-wide cache
//!
//! The runtime owns one table for its whole life, built once by [`init`]
//! (or [`init_from_env`]) and reached through [`global`].

mod config;
mod entry;
mod stats;
mod table;

use once_cell::sync::OnceCell;
use tracing::debug;

pub use config::{CacheConfig, InvalidationStrategy, DEFAULT_LOG2_ENTRIES, MAX_LOG2_ENTRIES, MIN_LOG2_ENTRIES};
pub use entry::CacheEntry;
pub use stats::CacheStats;
pub use table::{Invalidation, LocalCache, StackwalkCache};

use crate::error::Result;
use crate::layout::NativeLayout;

static GLOBAL_CACHE: OnceCell<StackwalkCache<NativeLayout>> = OnceCell::new();

/// Build the process-wide cache, or return it if it already exists.
///
/// The first call decides whether the cache may be used at all; later calls
/// cannot change that.
///
/// ## Errors
///
/// Returns [`StackcrawlError::InvalidConfig`](crate::error::StackcrawlError::InvalidConfig)
/// if `config` fails validation.
pub fn init(config: &CacheConfig) -> Result<&'static StackwalkCache<NativeLayout>>
{
    config.validate()?;
    let mut created = false;
    let cache = GLOBAL_CACHE.get_or_try_init(|| {
        created = true;
        StackwalkCache::new(config)
    })?;

    if !created && cache.config() != config {
        debug!(
            existing = ?cache.config(),
            requested = ?config,
            "stackwalk cache already initialised; keeping existing configuration"
        );
    }
    Ok(cache)
}

/// [`init`] with the configuration read from the environment.
///
/// ## Errors
///
/// Fails if an environment value cannot be parsed.
pub fn init_from_env() -> Result<&'static StackwalkCache<NativeLayout>>
{
    init(&CacheConfig::from_env()?)
}

/// The process-wide cache, if [`init`] has run.
pub fn global() -> Option<&'static StackwalkCache<NativeLayout>>
{
    GLOBAL_CACHE.get()
}
