//! # Cache Entry Layouts
//!
//! One logical cache record, several physical bit layouts.
//!
//! Every cache entry is two machine words: the instruction pointer and one
//! word of packed unwind facts. What goes into the facts word depends on the
//! target architecture:
//!
//! - [`FramePointerLayout`]: 32-bit frame-pointer-register targets (x86). The
//!   word holds a 15-bit stack offset, a 3-bit security-object offset, two
//!   frame-pointer flags and an 11-bit argument size.
//! - [`WindowedLayout`]: 64-bit targets (x86-64). The word holds a 32-bit
//!   stack offset and a 32-bit saved-frame-pointer offset.
//! - [`NoCacheLayout`]: every other target. Nothing is ever cached.
//!
//! The layout used by the process-wide cache is [`NativeLayout`], selected
//! by the build script. All three are always compiled so they can be tested
//! on any host.
//!
//! Layouts are zero-sized marker types; packing, unpacking and popping a frame
//! are pure associated functions, so the hot path is monomorphised per layout
//! and never branches on the architecture.

mod frame_pointer;
mod no_cache;
mod windowed;

use std::fmt;

use thiserror::Error;

pub use frame_pointer::{FramePointerFacts, FramePointerLayout, FramePointerRecord};
pub use no_cache::NoCacheLayout;
pub use windowed::{WindowedFacts, WindowedLayout, WindowedRecord};

use crate::error::Result;
use crate::types::FrameRegisters;
use crate::walk::MemoryAccess;

/// The layout matching the build target.
#[cfg(stackcrawl_layout = "frame_pointer")]
pub type NativeLayout = FramePointerLayout;

/// The layout matching the build target.
#[cfg(stackcrawl_layout = "windowed")]
pub type NativeLayout = WindowedLayout;

/// The layout matching the build target.
#[cfg(not(any(stackcrawl_layout = "frame_pointer", stackcrawl_layout = "windowed")))]
pub type NativeLayout = NoCacheLayout;

/// Why a frame's facts could not be packed into a cache entry.
///
/// None of these are walk failures: the frame still unwinds through the
/// decoder, it just never gets cached.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackError
{
    /// A value is wider than its packed field.
    #[error("{field} value {value} does not fit in {bits} bits")]
    Overflow
    {
        /// Name of the packed field
        field: &'static str,
        /// The value that was offered
        value: u64,
        /// Width of the packed field
        bits: u32,
    },

    /// The stack pointer at the query point is below the offset the unwind
    /// info recorded for the end of the prologue.
    #[error("stack pointer offset {at_point} is below the unwind-info offset {from_unwind_info}")]
    StackPointerBelowUnwindInfo
    {
        /// Offset observed at the query point
        at_point: u64,
        /// Offset recorded by the unwind info
        from_unwind_info: u64,
    },

    /// The frame pointer was flagged as the frame register without being
    /// flagged as used.
    #[error("frame pointer flagged as frame register but not as used")]
    FramePointerFlags,

    /// Entries may never carry the empty-slot sentinel IP.
    #[error("instruction pointer is null")]
    NullInstructionPointer,

    /// The layout never caches frames.
    #[error("{0} layout does not cache frames")]
    Unsupported(&'static str),
}

/// Narrow `value` into a `bits`-wide field, failing if anything is lost.
pub(crate) fn narrow(field: &'static str, value: u64, bits: u32) -> std::result::Result<u64, PackError>
{
    let packed = value & ((1u64 << bits) - 1);
    if packed == value {
        Ok(packed)
    } else {
        Err(PackError::Overflow { field, value, bits })
    }
}

/// Per-architecture packing of unwind facts.
pub trait FrameLayout: Copy + Default + Send + Sync + fmt::Debug + 'static
{
    /// Minimal unwind description produced by the decoder for one frame.
    type Facts: Copy + fmt::Debug + PartialEq + Send + Sync + 'static;

    /// Unpacked contents of an entry's facts word.
    type Record: Copy + fmt::Debug + PartialEq + Send + Sync + 'static;

    /// Human-readable layout name.
    const NAME: &'static str;

    /// Whether entries can be packed at all. A table over a layout that
    /// cannot is built disabled.
    const CACHEABLE: bool = true;

    /// Width in bytes of a stack slot on this layout.
    const WORD_SIZE: u64;

    /// Pack facts for a frame whose stack pointer sits `sp_offset` bytes below
    /// its return-address slot and whose caller pushed `args_size` bytes of
    /// arguments.
    ///
    /// ## Errors
    ///
    /// Returns a [`PackError`] when the frame cannot be represented; the
    /// caller must skip caching it.
    fn pack(sp_offset: u64, facts: &Self::Facts, args_size: u64) -> std::result::Result<u64, PackError>;

    /// Decode a facts word produced by [`FrameLayout::pack`].
    fn unpack(word: u64) -> Self::Record;

    /// Rebuild decoder-shaped facts from a cached record.
    fn facts_from_record(record: &Self::Record) -> Self::Facts;

    /// Stack offset of the frame's security object, if it has one.
    fn security_object_offset(facts: &Self::Facts) -> Option<u32>;

    /// Returns `true` if the record says the frame has a security object.
    fn has_security_object(record: &Self::Record) -> bool
    {
        Self::security_object_offset(&Self::facts_from_record(record)).is_some()
    }

    /// Returns `true` if the record alone is enough to pop the frame.
    fn is_safe_to_use_cache(record: &Self::Record) -> bool;

    /// Pop the frame described by `record`, producing the caller's registers.
    ///
    /// ## Errors
    ///
    /// Fails if stack memory cannot be read or the record is not safe to use.
    fn pop<M: MemoryAccess + ?Sized>(record: &Self::Record, regs: &FrameRegisters, memory: &M) -> Result<FrameRegisters>;
}
