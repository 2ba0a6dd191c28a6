//! Layout for targets without a cache-entry format.

use super::{FrameLayout, PackError};
use crate::error::{Result, StackcrawlError};
use crate::types::FrameRegisters;
use crate::walk::MemoryAccess;

/// Layout that never caches anything; every frame goes to the decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCacheLayout;

impl FrameLayout for NoCacheLayout
{
    type Facts = ();
    type Record = ();

    const NAME: &'static str = "none";
    const WORD_SIZE: u64 = 8;
    const CACHEABLE: bool = false;

    fn pack(_sp_offset: u64, _facts: &Self::Facts, _args_size: u64) -> std::result::Result<u64, PackError>
    {
        Err(PackError::Unsupported(Self::NAME))
    }

    fn unpack(_word: u64) -> Self::Record {}

    fn facts_from_record(_record: &Self::Record) -> Self::Facts {}

    fn security_object_offset(_facts: &Self::Facts) -> Option<u32>
    {
        None
    }

    fn is_safe_to_use_cache(_record: &Self::Record) -> bool
    {
        false
    }

    fn pop<M: MemoryAccess + ?Sized>(_record: &Self::Record, regs: &FrameRegisters, _memory: &M) -> Result<FrameRegisters>
    {
        Err(StackcrawlError::UnwindInfoUnavailable {
            ip: regs.ip,
            reason: "no cached frame layout for this target".into(),
        })
    }
}
