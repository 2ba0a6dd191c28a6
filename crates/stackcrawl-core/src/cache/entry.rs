//! Two-word cache entry.

use std::fmt;
use std::marker::PhantomData;

use crate::layout::{FrameLayout, PackError, WindowedLayout};
use crate::types::Address;

/// One cached frame: the instruction pointer plus one word of packed facts.
///
/// An entry is exactly two words so a table slot can move it with a single
/// wide load or store; a reader sees either the whole old entry or the whole
/// new one. A null IP is the empty-slot sentinel and is never produced by
/// [`CacheEntry::build`].
pub struct CacheEntry<L: FrameLayout>
{
    ip: Address,
    facts: u64,
    _layout: PhantomData<L>,
}

const _: () = assert!(std::mem::size_of::<CacheEntry<WindowedLayout>>() == 2 * std::mem::size_of::<u64>());

impl<L: FrameLayout> CacheEntry<L>
{
    /// The empty-slot sentinel.
    pub const fn empty() -> Self
    {
        Self {
            ip: Address::ZERO,
            facts: 0,
            _layout: PhantomData,
        }
    }

    /// Build an entry for the frame at `ip`.
    ///
    /// `sp_offset` is the distance from the frame's stack pointer at `ip` to
    /// its return-address slot; `args_size` is the bytes of arguments the
    /// frame pops on return.
    ///
    /// ## Errors
    ///
    /// Fails when `ip` is null or the facts do not fit the layout. Such frames
    /// must simply bypass the cache.
    pub fn build(ip: Address, sp_offset: u64, facts: &L::Facts, args_size: u64) -> Result<Self, PackError>
    {
        if ip.is_null() {
            return Err(PackError::NullInstructionPointer);
        }

        Ok(Self {
            ip,
            facts: L::pack(sp_offset, facts, args_size)?,
            _layout: PhantomData,
        })
    }

    /// Instruction pointer this entry describes.
    pub fn ip(&self) -> Address
    {
        self.ip
    }

    /// The raw packed facts word.
    pub fn facts_word(&self) -> u64
    {
        self.facts
    }

    /// Unpacked facts word.
    pub fn record(&self) -> L::Record
    {
        L::unpack(self.facts)
    }

    /// Decoder-shaped view of the cached facts.
    pub fn unwind_facts(&self) -> L::Facts
    {
        L::facts_from_record(&self.record())
    }

    /// Returns `true` for the empty-slot sentinel.
    pub fn is_empty(&self) -> bool
    {
        self.ip.is_null()
    }

    /// Returns `true` if the cached frame carries a security object.
    pub fn has_security_object(&self) -> bool
    {
        L::has_security_object(&self.record())
    }

    /// Returns `true` if the entry alone is enough to pop the frame.
    pub fn is_safe_to_use_cache(&self) -> bool
    {
        L::is_safe_to_use_cache(&self.record())
    }

    /// Both words as one 128-bit value, IP in the low half.
    pub(crate) fn to_bits(&self) -> u128
    {
        u128::from(self.ip.value()) | (u128::from(self.facts) << 64)
    }

    #[allow(clippy::cast_possible_truncation)] // splitting the slot into its two words
    pub(crate) fn from_bits(bits: u128) -> Self
    {
        Self {
            ip: Address::new(bits as u64),
            facts: (bits >> 64) as u64,
            _layout: PhantomData,
        }
    }
}

impl<L: FrameLayout> Clone for CacheEntry<L>
{
    fn clone(&self) -> Self
    {
        *self
    }
}

impl<L: FrameLayout> Copy for CacheEntry<L> {}

impl<L: FrameLayout> PartialEq for CacheEntry<L>
{
    fn eq(&self, other: &Self) -> bool
    {
        self.ip == other.ip && self.facts == other.facts
    }
}

impl<L: FrameLayout> Eq for CacheEntry<L> {}

impl<L: FrameLayout> Default for CacheEntry<L>
{
    fn default() -> Self
    {
        Self::empty()
    }
}

impl<L: FrameLayout> fmt::Debug for CacheEntry<L>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        if self.is_empty() {
            return f.write_str("CacheEntry(empty)");
        }
        f.debug_struct("CacheEntry")
            .field("ip", &self.ip)
            .field("record", &self.record())
            .finish()
    }
}
