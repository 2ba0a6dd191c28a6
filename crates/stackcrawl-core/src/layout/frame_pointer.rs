//! Frame-pointer-register layout (32-bit x86 style).
//!
//! Facts word, low bit first:
//!
//! | bits  | field                    |
//! |-------|--------------------------|
//! | 0-14  | stack pointer offset     |
//! | 15-17 | security object offset   |
//! | 18    | frame pointer used       |
//! | 19    | frame pointer is frame register |
//! | 20-30 | argument size            |

use super::{narrow, FrameLayout, PackError};
use crate::error::{Result, StackcrawlError};
use crate::types::{Address, FrameRegisters};
use crate::walk::MemoryAccess;

const SP_OFFSET_BITS: u32 = 15;
const SECURITY_BITS: u32 = 3;
const ARGS_BITS: u32 = 11;

const SECURITY_SHIFT: u32 = SP_OFFSET_BITS;
const USES_FP_SHIFT: u32 = SECURITY_SHIFT + SECURITY_BITS;
const FP_IS_FRAME_SHIFT: u32 = USES_FP_SHIFT + 1;
const ARGS_SHIFT: u32 = FP_IS_FRAME_SHIFT + 1;

const fn mask(bits: u32) -> u64
{
    (1u64 << bits) - 1
}

/// Unwind facts the decoder reports for a frame on this layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FramePointerFacts
{
    /// Offset of the security object; 0 if there is none.
    pub security_object_offset: u32,
    /// Does the method modify the frame-pointer register at all?
    pub uses_frame_pointer_reg: bool,
    /// Is the frame-pointer register used as the frame pointer?
    pub frame_pointer_is_frame_reg: bool,
}

/// Unpacked facts word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FramePointerRecord
{
    /// Distance from SP to the return-address slot (frame size plus pending arguments).
    pub stack_pointer_offset: u16,
    /// Offset of the security object; 0 if there is none.
    pub security_object_offset: u8,
    /// Does the method modify the frame-pointer register at all?
    pub uses_frame_pointer_reg: bool,
    /// Is the frame-pointer register used as the frame pointer?
    pub frame_pointer_is_frame_reg: bool,
    /// Bytes of arguments the callee pops on return.
    pub args_size: u16,
}

/// Layout for frame-pointer-register architectures.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramePointerLayout;

impl FrameLayout for FramePointerLayout
{
    type Facts = FramePointerFacts;
    type Record = FramePointerRecord;

    const NAME: &'static str = "frame-pointer";
    const WORD_SIZE: u64 = 4;

    fn pack(sp_offset: u64, facts: &Self::Facts, args_size: u64) -> std::result::Result<u64, PackError>
    {
        if facts.frame_pointer_is_frame_reg && !facts.uses_frame_pointer_reg {
            return Err(PackError::FramePointerFlags);
        }

        let sp_offset = narrow("stackPointerOffset", sp_offset, SP_OFFSET_BITS)?;
        let security = narrow(
            "securityObjectOffset",
            u64::from(facts.security_object_offset),
            SECURITY_BITS,
        )?;
        let args_size = narrow("argsSize", args_size, ARGS_BITS)?;

        Ok(sp_offset
            | (security << SECURITY_SHIFT)
            | (u64::from(facts.uses_frame_pointer_reg) << USES_FP_SHIFT)
            | (u64::from(facts.frame_pointer_is_frame_reg) << FP_IS_FRAME_SHIFT)
            | (args_size << ARGS_SHIFT))
    }

    #[allow(clippy::cast_possible_truncation)] // every field is masked to its width first
    fn unpack(word: u64) -> Self::Record
    {
        FramePointerRecord {
            stack_pointer_offset: (word & mask(SP_OFFSET_BITS)) as u16,
            security_object_offset: ((word >> SECURITY_SHIFT) & mask(SECURITY_BITS)) as u8,
            uses_frame_pointer_reg: (word >> USES_FP_SHIFT) & 1 == 1,
            frame_pointer_is_frame_reg: (word >> FP_IS_FRAME_SHIFT) & 1 == 1,
            args_size: ((word >> ARGS_SHIFT) & mask(ARGS_BITS)) as u16,
        }
    }

    fn facts_from_record(record: &Self::Record) -> Self::Facts
    {
        FramePointerFacts {
            security_object_offset: u32::from(record.security_object_offset),
            uses_frame_pointer_reg: record.uses_frame_pointer_reg,
            frame_pointer_is_frame_reg: record.frame_pointer_is_frame_reg,
        }
    }

    fn security_object_offset(facts: &Self::Facts) -> Option<u32>
    {
        (facts.security_object_offset != 0).then_some(facts.security_object_offset)
    }

    fn is_safe_to_use_cache(record: &Self::Record) -> bool
    {
        // A scratch frame pointer could hold anything when the frame is popped.
        !record.uses_frame_pointer_reg || record.frame_pointer_is_frame_reg
    }

    fn pop<M: MemoryAccess + ?Sized>(record: &Self::Record, regs: &FrameRegisters, memory: &M) -> Result<FrameRegisters>
    {
        if !Self::is_safe_to_use_cache(record) {
            return Err(StackcrawlError::UnwindInfoUnavailable {
                ip: regs.ip,
                reason: "frame pointer register used as scratch".into(),
            });
        }

        let return_slot = regs.sp + u64::from(record.stack_pointer_offset);
        let ip = Address::from(u64::from(memory.read_u32(return_slot)?));
        let fp = if record.frame_pointer_is_frame_reg {
            Address::from(u64::from(memory.read_u32(return_slot - Self::WORD_SIZE)?))
        } else {
            regs.fp
        };

        Ok(FrameRegisters {
            ip,
            sp: return_slot + Self::WORD_SIZE + u64::from(record.args_size),
            fp,
        })
    }
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;

    struct Stack(HashMap<u64, u32>);

    impl MemoryAccess for Stack
    {
        fn read_u64(&self, address: Address) -> Result<u64>
        {
            Err(StackcrawlError::MemoryRead(address))
        }

        fn read_u32(&self, address: Address) -> Result<u32>
        {
            self.0.get(&address.value()).copied().ok_or(StackcrawlError::MemoryRead(address))
        }
    }

    fn facts(security: u32, uses_fp: bool, fp_is_frame: bool) -> FramePointerFacts
    {
        FramePointerFacts {
            security_object_offset: security,
            uses_frame_pointer_reg: uses_fp,
            frame_pointer_is_frame_reg: fp_is_frame,
        }
    }

    #[test]
    fn test_pack_unpack_extremes()
    {
        let word = FramePointerLayout::pack(0x7fff, &facts(7, true, true), 0x7ff).unwrap();
        let record = FramePointerLayout::unpack(word);
        assert_eq!(record.stack_pointer_offset, 0x7fff);
        assert_eq!(record.security_object_offset, 7);
        assert!(record.uses_frame_pointer_reg);
        assert!(record.frame_pointer_is_frame_reg);
        assert_eq!(record.args_size, 0x7ff);
        assert!(word < 1 << 31, "facts must fit in a 32-bit word");
    }

    #[test]
    fn test_pack_zero()
    {
        let word = FramePointerLayout::pack(0, &FramePointerFacts::default(), 0).unwrap();
        assert_eq!(word, 0);
        assert_eq!(FramePointerLayout::unpack(word), FramePointerRecord::default());
    }

    #[test]
    fn test_pack_overflow()
    {
        assert!(matches!(
            FramePointerLayout::pack(0x8000, &facts(0, false, false), 0),
            Err(PackError::Overflow {
                field: "stackPointerOffset",
                ..
            })
        ));
        assert!(matches!(
            FramePointerLayout::pack(0, &facts(0, false, false), 0x800),
            Err(PackError::Overflow { field: "argsSize", .. })
        ));
        assert!(matches!(
            FramePointerLayout::pack(0, &facts(8, false, false), 0),
            Err(PackError::Overflow {
                field: "securityObjectOffset",
                ..
            })
        ));
    }

    #[test]
    fn test_frame_register_requires_use()
    {
        assert_eq!(
            FramePointerLayout::pack(16, &facts(0, false, true), 0),
            Err(PackError::FramePointerFlags)
        );
    }

    #[test]
    fn test_safety_and_security()
    {
        let scratch = FramePointerLayout::unpack(FramePointerLayout::pack(8, &facts(0, true, false), 0).unwrap());
        assert!(!FramePointerLayout::is_safe_to_use_cache(&scratch));

        let framed = FramePointerLayout::unpack(FramePointerLayout::pack(8, &facts(4, true, true), 0).unwrap());
        assert!(FramePointerLayout::is_safe_to_use_cache(&framed));
        assert!(FramePointerLayout::has_security_object(&framed));

        let frameless = FramePointerLayout::unpack(FramePointerLayout::pack(8, &facts(0, false, false), 0).unwrap());
        assert!(FramePointerLayout::is_safe_to_use_cache(&frameless));
        assert!(!FramePointerLayout::has_security_object(&frameless));
    }

    #[test]
    fn test_pop_frameless()
    {
        let stack = Stack(HashMap::from([(0x1010, 0x4000_1234)]));
        let record = FramePointerLayout::unpack(FramePointerLayout::pack(0x10, &facts(0, false, false), 8).unwrap());
        let regs = FrameRegisters::new(0x4000_0000, 0x1000, 0x2000);

        let caller = FramePointerLayout::pop(&record, &regs, &stack).unwrap();
        assert_eq!(caller, FrameRegisters::new(0x4000_1234, 0x1010 + 4 + 8, 0x2000));
    }

    #[test]
    fn test_pop_with_frame_pointer()
    {
        let stack = Stack(HashMap::from([(0x1020, 0x4000_2000), (0x101c, 0x1800)]));
        let record = FramePointerLayout::unpack(FramePointerLayout::pack(0x20, &facts(0, true, true), 0).unwrap());
        let regs = FrameRegisters::new(0x4000_0000, 0x1000, 0x101c);

        let caller = FramePointerLayout::pop(&record, &regs, &stack).unwrap();
        assert_eq!(caller, FrameRegisters::new(0x4000_2000, 0x1024, 0x1800));
    }

    #[test]
    fn test_pop_refuses_scratch_frame_pointer()
    {
        let stack = Stack(HashMap::new());
        let record = FramePointerLayout::unpack(FramePointerLayout::pack(0x20, &facts(0, true, false), 0).unwrap());
        let regs = FrameRegisters::new(0x4000_0000, 0x1000, 0x1);
        assert!(FramePointerLayout::pop(&record, &regs, &stack).is_err());
    }
}
