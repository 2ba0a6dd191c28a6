//! Windowed 64-bit layout (x86-64 style).
//!
//! The facts word holds the stack pointer offset in its low 32 bits and the
//! saved-frame-pointer offset in its high 32 bits. Both offsets are relative
//! to the stack pointer at the query point, not at the end of the prologue:
//! the unwind info only knows the latter, so packing folds in whatever the
//! method allocated dynamically since.

use super::{narrow, FrameLayout, PackError};
use crate::error::Result;
use crate::types::{Address, FrameRegisters};
use crate::walk::MemoryAccess;

const OFFSET_BITS: u32 = 32;

/// Unwind facts the decoder reports for a frame on this layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowedFacts
{
    /// Distance from the post-prologue SP to the return-address slot.
    pub stack_pointer_offset: u32,
    /// Distance from the post-prologue SP to the saved frame pointer; 0 if the
    /// method does not save it.
    pub frame_pointer_offset: u32,
}

/// Unpacked facts word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowedRecord
{
    /// Distance from SP to the return-address slot.
    pub stack_pointer_offset: u32,
    /// Distance from SP to the saved frame pointer; 0 if it is not saved.
    pub frame_pointer_offset: u32,
}

/// Layout for register-windowed 64-bit architectures.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowedLayout;

impl FrameLayout for WindowedLayout
{
    type Facts = WindowedFacts;
    type Record = WindowedRecord;

    const NAME: &'static str = "windowed";
    const WORD_SIZE: u64 = 8;

    fn pack(sp_offset: u64, facts: &Self::Facts, _args_size: u64) -> std::result::Result<u64, PackError>
    {
        let from_unwind_info = u64::from(facts.stack_pointer_offset);
        let Some(growth) = sp_offset.checked_sub(from_unwind_info) else {
            return Err(PackError::StackPointerBelowUnwindInfo {
                at_point: sp_offset,
                from_unwind_info,
            });
        };

        let fp_offset = if facts.frame_pointer_offset == 0 {
            0
        } else {
            let shifted = u64::from(facts.frame_pointer_offset)
                .checked_add(growth)
                .ok_or(PackError::Overflow {
                    field: "framePointerOffset",
                    value: u64::MAX,
                    bits: OFFSET_BITS,
                })?;
            narrow("framePointerOffset", shifted, OFFSET_BITS)?
        };
        let sp_offset = narrow("stackPointerOffset", sp_offset, OFFSET_BITS)?;

        Ok(sp_offset | (fp_offset << OFFSET_BITS))
    }

    #[allow(clippy::cast_possible_truncation)] // splitting the word into its two halves
    fn unpack(word: u64) -> Self::Record
    {
        WindowedRecord {
            stack_pointer_offset: word as u32,
            frame_pointer_offset: (word >> OFFSET_BITS) as u32,
        }
    }

    fn facts_from_record(record: &Self::Record) -> Self::Facts
    {
        WindowedFacts {
            stack_pointer_offset: record.stack_pointer_offset,
            frame_pointer_offset: record.frame_pointer_offset,
        }
    }

    // The security object is cheaper to find through the full frame info when
    // it is needed than to carry in every entry.
    fn security_object_offset(_facts: &Self::Facts) -> Option<u32>
    {
        None
    }

    fn is_safe_to_use_cache(_record: &Self::Record) -> bool
    {
        true
    }

    fn pop<M: MemoryAccess + ?Sized>(record: &Self::Record, regs: &FrameRegisters, memory: &M) -> Result<FrameRegisters>
    {
        // The saved frame pointer is addressed from the callee's SP, so read it
        // before moving SP.
        let fp = if record.frame_pointer_offset == 0 {
            regs.fp
        } else {
            Address::from(memory.read_u64(regs.sp + u64::from(record.frame_pointer_offset))?)
        };

        let return_slot = regs.sp + u64::from(record.stack_pointer_offset);
        let ip = Address::from(memory.read_u64(return_slot)?);

        Ok(FrameRegisters {
            ip,
            sp: return_slot + Self::WORD_SIZE,
            fp,
        })
    }
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;
    use crate::error::StackcrawlError;

    struct Stack(HashMap<u64, u64>);

    impl MemoryAccess for Stack
    {
        fn read_u64(&self, address: Address) -> Result<u64>
        {
            self.0.get(&address.value()).copied().ok_or(StackcrawlError::MemoryRead(address))
        }

        fn read_u32(&self, address: Address) -> Result<u32>
        {
            Err(StackcrawlError::MemoryRead(address))
        }
    }

    fn facts(sp: u32, fp: u32) -> WindowedFacts
    {
        WindowedFacts {
            stack_pointer_offset: sp,
            frame_pointer_offset: fp,
        }
    }

    #[test]
    fn test_pack_folds_dynamic_growth()
    {
        // 0x40 bytes of alloca after the prologue.
        let word = WindowedLayout::pack(0x98, &facts(0x58, 0x50), 0).unwrap();
        let record = WindowedLayout::unpack(word);
        assert_eq!(record.stack_pointer_offset, 0x98);
        assert_eq!(record.frame_pointer_offset, 0x90);
    }

    #[test]
    fn test_pack_unsaved_frame_pointer_stays_zero()
    {
        let record = WindowedLayout::unpack(WindowedLayout::pack(0x40, &facts(0x28, 0), 0).unwrap());
        assert_eq!(record.frame_pointer_offset, 0);
    }

    #[test]
    fn test_pack_rejects_sp_below_unwind_info()
    {
        assert_eq!(
            WindowedLayout::pack(0x10, &facts(0x20, 0x18), 0),
            Err(PackError::StackPointerBelowUnwindInfo {
                at_point: 0x10,
                from_unwind_info: 0x20,
            })
        );
    }

    #[test]
    fn test_pack_overflow()
    {
        assert!(matches!(
            WindowedLayout::pack(1 << 32, &facts(0x20, 0), 0),
            Err(PackError::Overflow {
                field: "stackPointerOffset",
                ..
            })
        ));
        assert!(matches!(
            WindowedLayout::pack(0xffff_ff00, &facts(0x100, 0x200), 0),
            Err(PackError::Overflow {
                field: "framePointerOffset",
                ..
            })
        ));
    }

    #[test]
    fn test_max_offsets_round_trip()
    {
        let record = WindowedLayout::unpack(WindowedLayout::pack(u64::from(u32::MAX), &facts(u32::MAX, u32::MAX), 0).unwrap());
        assert_eq!(record.stack_pointer_offset, u32::MAX);
        assert_eq!(record.frame_pointer_offset, u32::MAX);
    }

    #[test]
    fn test_always_safe_never_security()
    {
        let record = WindowedRecord::default();
        assert!(WindowedLayout::is_safe_to_use_cache(&record));
        assert!(!WindowedLayout::has_security_object(&record));
    }

    #[test]
    fn test_pop_restores_frame_pointer()
    {
        let stack = Stack(HashMap::from([(0x7000 + 0x30, 0x7400), (0x7000 + 0x38, 0x5555_0000)]));
        let record = WindowedRecord {
            stack_pointer_offset: 0x38,
            frame_pointer_offset: 0x30,
        };
        let regs = FrameRegisters::new(0x5555_1000, 0x7000, 0x7030);

        let caller = WindowedLayout::pop(&record, &regs, &stack).unwrap();
        assert_eq!(caller, FrameRegisters::new(0x5555_0000, 0x7040, 0x7400));
    }

    #[test]
    fn test_pop_keeps_unsaved_frame_pointer()
    {
        let stack = Stack(HashMap::from([(0x7018, 0x5555_0000)]));
        let record = WindowedRecord {
            stack_pointer_offset: 0x18,
            frame_pointer_offset: 0,
        };
        let regs = FrameRegisters::new(0x5555_1000, 0x7000, 0x9999);

        let caller = WindowedLayout::pop(&record, &regs, &stack).unwrap();
        assert_eq!(caller.fp, Address::from(0x9999));
        assert_eq!(caller.sp, Address::from(0x7020));
    }
}
