//! The shared, lock-free entry table.

use std::marker::PhantomData;
use std::sync::atomic::{fence, Ordering};

use portable_atomic::AtomicU128;
use tracing::debug;

use super::config::{CacheConfig, InvalidationStrategy};
use super::entry::CacheEntry;
use super::stats::{CacheStats, StatCounters};
use crate::code::{CodeScope, ScopeId};
use crate::error::Result;
use crate::layout::{FrameLayout, NativeLayout};
use crate::types::Address;

/// Fixed-size, hash-indexed table of [`CacheEntry`] shared by every walker.
///
/// ## Thread Safety
///
/// Each slot is one 128-bit atomic, so every read and write moves a whole
/// entry. Concurrent inserts into the same slot are resolved by overwrite
/// (last writer wins), which loses entries but never mixes one entry's IP
/// with another's facts. No lock is taken on lookup or insert.
///
/// Invalidation stores with sequential consistency and ends with a full
/// fence, so once [`StackwalkCache::invalidate`] returns no later lookup on
/// any thread can observe an entry it cleared.
pub struct StackwalkCache<L: FrameLayout = NativeLayout>
{
    slots: Box<[AtomicU128]>,
    config: CacheConfig,
    enabled: bool,
    mask: u64,
    stats: StatCounters,
    _layout: PhantomData<L>,
}

/// Proof that an invalidation pass ran to completion.
///
/// Code-unloading callers must hold one of these before releasing the memory
/// the scope covered.
#[must_use = "code memory must not be released before invalidation completes"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation
{
    /// Scope that was invalidated.
    pub scope: ScopeId,
    /// Strategy the pass used.
    pub strategy: InvalidationStrategy,
    /// Slots that held an entry and were emptied.
    pub slots_cleared: usize,
}

impl<L: FrameLayout> StackwalkCache<L>
{
    /// Build a table from `config`.
    ///
    /// ## Errors
    ///
    /// Returns [`StackcrawlError::InvalidConfig`](crate::error::StackcrawlError::InvalidConfig)
    /// if the configuration fails validation.
    pub fn new(config: &CacheConfig) -> Result<Self>
    {
        config.validate()?;
        let enabled = L::CACHEABLE && config.effective_enabled();
        // A disabled table never holds anything; keep a single slot.
        let capacity = if enabled { config.entries() } else { 1 };
        let slots: Box<[AtomicU128]> = (0..capacity).map(|_| AtomicU128::new(0)).collect();

        debug!(
            layout = L::NAME,
            enabled,
            entries = capacity,
            invalidation = %config.invalidation,
            lock_free = AtomicU128::is_lock_free(),
            "stackwalk cache created"
        );

        Ok(Self {
            slots,
            config: *config,
            enabled,
            mask: (capacity as u64) - 1,
            stats: StatCounters::default(),
            _layout: PhantomData,
        })
    }

    /// Whether lookups and inserts do anything.
    pub fn enabled(&self) -> bool
    {
        self.enabled
    }

    /// The configuration the table was built from.
    pub fn config(&self) -> &CacheConfig
    {
        &self.config
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize
    {
        self.slots.len()
    }

    /// Whether slot moves are native 128-bit atomics on this host.
    pub fn is_lock_free() -> bool
    {
        AtomicU128::is_lock_free()
    }

    /// Slot index for `ip`. Pure; called on every walk step.
    #[allow(clippy::cast_possible_truncation)] // masked to the table size
    pub fn key(&self, ip: Address) -> usize
    {
        let ip = ip.value();
        ((ip ^ (ip >> self.config.log2_entries)) & self.mask) as usize
    }

    /// Read the slot `ip` hashes to as one wide load.
    fn load(&self, ip: Address) -> CacheEntry<L>
    {
        CacheEntry::from_bits(self.slots[self.key(ip)].load(Ordering::Acquire))
    }

    /// Copy the slot for `ip` into `local` and report whether it matches.
    ///
    /// A mismatch, including the empty sentinel, is an ordinary miss.
    pub fn lookup_into(&self, ip: Address, local: &mut CacheEntry<L>) -> bool
    {
        if !self.enabled || ip.is_null() {
            return false;
        }

        *local = self.load(ip);
        if local.ip() == ip {
            StatCounters::bump(&self.stats.hits);
            true
        } else {
            if local.is_empty() {
                StatCounters::bump(&self.stats.empty_misses);
            } else {
                StatCounters::bump(&self.stats.wrong_address_misses);
            }
            false
        }
    }

    /// Return a copy of the entry for `ip` if the table holds one.
    pub fn probe(&self, ip: Address) -> Option<CacheEntry<L>>
    {
        let mut local = CacheEntry::empty();
        self.lookup_into(ip, &mut local).then_some(local)
    }

    /// Write `entry` into its slot as one wide store. Last writer wins.
    pub fn insert(&self, entry: &CacheEntry<L>)
    {
        if !self.enabled || entry.is_empty() {
            return;
        }

        self.slots[self.key(entry.ip())].store(entry.to_bits(), Ordering::Release);
        StatCounters::bump(&self.stats.inserts);
    }

    /// Drop every entry that could match an IP inside `scope`.
    ///
    /// Must complete before any of the scope's code memory is reused.
    pub fn invalidate(&self, scope: &CodeScope) -> Invalidation
    {
        let strategy = self.config.invalidation;
        let slots_cleared = if self.enabled {
            match strategy {
                InvalidationStrategy::FullClear => self.clear_all(),
                InvalidationStrategy::Selective => self.clear_matching(scope),
            }
        } else {
            0
        };

        StatCounters::bump(&self.stats.invalidations);
        StatCounters::add(&self.stats.slots_cleared, slots_cleared as u64);
        debug!(scope = %scope.id(), %strategy, slots_cleared, "stackwalk cache invalidated");

        Invalidation {
            scope: scope.id(),
            strategy,
            slots_cleared,
        }
    }

    /// Empty every slot regardless of configuration.
    pub fn clear(&self) -> usize
    {
        let cleared = self.clear_all();
        StatCounters::add(&self.stats.slots_cleared, cleared as u64);
        cleared
    }

    fn clear_all(&self) -> usize
    {
        let cleared = self
            .slots
            .iter()
            .filter(|slot| slot.swap(0, Ordering::SeqCst) != 0)
            .count();
        fence(Ordering::SeqCst);
        cleared
    }

    fn clear_matching(&self, scope: &CodeScope) -> usize
    {
        let mut cleared = 0;
        for slot in &*self.slots {
            let mut current = slot.load(Ordering::Acquire);
            loop {
                let entry = CacheEntry::<L>::from_bits(current);
                if entry.is_empty() || !scope.contains(entry.ip()) {
                    break;
                }
                match slot.compare_exchange(current, 0, Ordering::SeqCst, Ordering::Acquire) {
                    Ok(_) => {
                        cleared += 1;
                        break;
                    }
                    // Someone replaced the entry; re-check what is there now.
                    Err(actual) => current = actual,
                }
            }
        }
        fence(Ordering::SeqCst);
        cleared
    }

    /// Number of slots currently holding an entry.
    pub fn occupied(&self) -> usize
    {
        self.slots.iter().filter(|slot| slot.load(Ordering::Acquire) as u64 != 0).count()
    }

    /// Snapshot of the usage counters.
    pub fn stats(&self) -> CacheStats
    {
        self.stats.snapshot()
    }

    pub(crate) fn note_unsafe_bypass(&self)
    {
        StatCounters::bump(&self.stats.unsafe_bypasses);
    }

    pub(crate) fn note_uncacheable(&self)
    {
        StatCounters::bump(&self.stats.uncacheable);
    }

    /// Start a per-walk working copy over this table.
    pub fn local(&self) -> LocalCache<'_, L>
    {
        LocalCache {
            cache: self,
            entry: CacheEntry::empty(),
        }
    }
}

impl<L: FrameLayout> std::fmt::Debug for StackwalkCache<L>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("StackwalkCache")
            .field("layout", &L::NAME)
            .field("enabled", &self.enabled)
            .field("capacity", &self.capacity())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A walker's private copy of whatever the table last returned.
///
/// Other threads may overwrite the shared slot at any moment; the walker
/// only ever reads facts out of this copy, so a frame is unwound from one
/// coherent entry.
#[derive(Debug)]
pub struct LocalCache<'c, L: FrameLayout>
{
    cache: &'c StackwalkCache<L>,
    entry: CacheEntry<L>,
}

impl<'c, L: FrameLayout> LocalCache<'c, L>
{
    /// Load the slot for `ip` into the working copy; `true` on a hit.
    pub fn lookup(&mut self, ip: Address) -> bool
    {
        self.cache.lookup_into(ip, &mut self.entry)
    }

    /// Publish `entry` to the shared table and keep it as the working copy.
    pub fn insert(&mut self, entry: &CacheEntry<L>)
    {
        self.cache.insert(entry);
        self.entry = *entry;
    }

    /// The working copy.
    pub fn entry(&self) -> &CacheEntry<L>
    {
        &self.entry
    }

    /// Reset the working copy to the empty sentinel.
    pub fn clear_entry(&mut self)
    {
        self.entry = CacheEntry::empty();
    }

    /// Returns `true` if the working copy is the empty sentinel.
    pub fn is_empty(&self) -> bool
    {
        self.entry.is_empty()
    }

    /// Whether the shared table is enabled.
    pub fn enabled(&self) -> bool
    {
        self.cache.enabled()
    }

    /// The shared table.
    pub fn cache(&self) -> &'c StackwalkCache<L>
    {
        self.cache
    }
}
