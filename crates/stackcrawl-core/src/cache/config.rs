//! Cache configuration.
//!
//! The cache is configured once, at process start. Values come from
//! [`CacheConfig::default`] or the environment:
//!
//! - `STACKCRAWL_CACHE`: `0`, `off`, `false` or `no` disables the cache
//! - `STACKCRAWL_CACHE_LOG2_ENTRIES`: table size exponent (4..=20)
//! - `STACKCRAWL_CACHE_INVALIDATION`: `full` or `selective`
//! - `STACKCRAWL_DIAGNOSTIC_ATTACH`: when truthy, disables the cache because
//!   an out-of-process reader cannot see its contents

use std::env;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::error::{Result, StackcrawlError};

/// Smallest accepted table size exponent.
pub const MIN_LOG2_ENTRIES: u32 = 4;
/// Largest accepted table size exponent.
pub const MAX_LOG2_ENTRIES: u32 = 20;
/// Default table size exponent (1024 entries).
pub const DEFAULT_LOG2_ENTRIES: u32 = 10;

/// How [`invalidate`](crate::cache::StackwalkCache::invalidate) clears the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationStrategy
{
    /// Wipe every slot.
    #[default]
    FullClear,
    /// Wipe only slots whose IP falls inside the unloaded scope.
    Selective,
}

impl FromStr for InvalidationStrategy
{
    type Err = StackcrawlError;

    fn from_str(s: &str) -> Result<Self>
    {
        match s.to_lowercase().as_str() {
            "full" | "clear" | "full-clear" => Ok(Self::FullClear),
            "selective" | "range" => Ok(Self::Selective),
            _ => Err(StackcrawlError::InvalidConfig(format!(
                "unknown invalidation strategy: {s}. Use 'full' or 'selective'"
            ))),
        }
    }
}

impl fmt::Display for InvalidationStrategy
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::FullClear => f.write_str("full"),
            Self::Selective => f.write_str("selective"),
        }
    }
}

/// Startup configuration for a [`StackwalkCache`](crate::cache::StackwalkCache).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig
{
    /// Whether lookups and inserts are allowed at all.
    pub enabled: bool,
    /// The table holds `1 << log2_entries` slots.
    pub log2_entries: u32,
    /// Invalidation strategy used on code unload.
    pub invalidation: InvalidationStrategy,
    /// A diagnostic reader is attached; forces the cache off.
    pub diagnostic_attach: bool,
}

impl Default for CacheConfig
{
    fn default() -> Self
    {
        Self {
            enabled: true,
            log2_entries: DEFAULT_LOG2_ENTRIES,
            invalidation: InvalidationStrategy::FullClear,
            diagnostic_attach: false,
        }
    }
}

impl CacheConfig
{
    /// A configuration with the cache turned off.
    #[must_use]
    pub fn disabled() -> Self
    {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Read the configuration from the process environment.
    ///
    /// ## Errors
    ///
    /// Returns [`StackcrawlError::InvalidConfig`] for unparsable values.
    pub fn from_env() -> Result<Self>
    {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read the configuration through an arbitrary key lookup.
    ///
    /// ## Errors
    ///
    /// Returns [`StackcrawlError::InvalidConfig`] for unparsable values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("STACKCRAWL_CACHE") {
            config.enabled = parse_switch("STACKCRAWL_CACHE", &value)?;
        }
        if let Some(value) = lookup("STACKCRAWL_CACHE_LOG2_ENTRIES") {
            config.log2_entries = value.trim().parse().map_err(|err| {
                StackcrawlError::InvalidConfig(format!("STACKCRAWL_CACHE_LOG2_ENTRIES={value}: {err}"))
            })?;
        }
        if let Some(value) = lookup("STACKCRAWL_CACHE_INVALIDATION") {
            config.invalidation = value.trim().parse()?;
        }
        if let Some(value) = lookup("STACKCRAWL_DIAGNOSTIC_ATTACH") {
            config.diagnostic_attach = parse_switch("STACKCRAWL_DIAGNOSTIC_ATTACH", &value)?;
        }

        config.validate()?;
        if config.enabled && config.diagnostic_attach {
            warn!("diagnostic reader attached; stackwalk cache disabled");
        }
        Ok(config)
    }

    /// Check that the configuration describes a buildable table.
    ///
    /// ## Errors
    ///
    /// Returns [`StackcrawlError::InvalidConfig`] if the size exponent is out
    /// of range.
    pub fn validate(&self) -> Result<()>
    {
        if !(MIN_LOG2_ENTRIES..=MAX_LOG2_ENTRIES).contains(&self.log2_entries) {
            return Err(StackcrawlError::InvalidConfig(format!(
                "log2_entries must be between {MIN_LOG2_ENTRIES} and {MAX_LOG2_ENTRIES}, got {}",
                self.log2_entries
            )));
        }
        Ok(())
    }

    /// Whether the cache may actually be used under this configuration.
    pub fn effective_enabled(&self) -> bool
    {
        self.enabled && !self.diagnostic_attach
    }

    /// Number of slots in the table.
    pub fn entries(&self) -> usize
    {
        1usize << self.log2_entries
    }
}

fn parse_switch(key: &str, value: &str) -> Result<bool>
{
    match value.trim().to_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Ok(true),
        "0" | "off" | "false" | "no" => Ok(false),
        _ => Err(StackcrawlError::InvalidConfig(format!("{key}={value}: expected on/off"))),
    }
}
