//! # Synthetic Stacks
//!
//! In-memory stacks with known frames, for exercising the walker without a
//! live process.
//!
//! A [`SyntheticStack`] owns everything a [`StackWalker`] needs: a code map
//! with one method per pushed [`SyntheticMethod`], a sparse stack image laid
//! out exactly as the layout's `pop` expects to read it, and a decoder that
//! answers from a table of the frames it built. The decoder counts its calls,
//! which is how tests tell cache hits from misses.
//!
//! ## Example
//!
//! ```rust
//! use stackcrawl_core::layout::{FramePointerFacts, FramePointerLayout};
//! use stackcrawl_core::sim::{SyntheticMethod, SyntheticStack};
//!
//! let leaf = SyntheticMethod::new(FramePointerFacts::default(), 0x10, 0);
//! let stack = SyntheticStack::<FramePointerLayout>::builder()
//!     .push(leaf)
//!     .push_many(leaf, 3)
//!     .build()?;
//!
//! assert_eq!(stack.expected_frames().len(), 4);
//! # Ok::<(), stackcrawl_core::error::StackcrawlError>(())
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cache::StackwalkCache;
use crate::code::{MethodRange, MethodToken, RangeSection, RangeSectionMap, ScopeId};
use crate::error::{Result, StackcrawlError};
use crate::layout::{FrameLayout, FramePointerLayout, WindowedLayout};
use crate::types::{Address, FrameRegisters};
use crate::walk::{DecodedFrame, MemoryAccess, StackWalker, UnwindDecoder};

/// Default start of the synthetic code region.
pub const CODE_BASE: u64 = 0x1000_0000;

/// Bytes of code reserved per synthetic method.
pub const METHOD_SIZE: u64 = 0x100;

/// Offset of the call site inside each synthetic method.
pub const CALL_SITE_OFFSET: u64 = 0x40;

const INITIAL_FP: u64 = 0x00e0_0000;
const CALLER_FP_BASE: u64 = 0x00f0_0000;

/// One method's unwind shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticMethod<F>
{
    /// Facts the decoder reports for the method.
    pub facts: F,
    /// Distance from SP to the return-address slot at the call site.
    pub sp_offset: u64,
    /// Bytes of arguments popped on return.
    pub args_size: u64,
}

impl<F> SyntheticMethod<F>
{
    pub const fn new(facts: F, sp_offset: u64, args_size: u64) -> Self
    {
        Self {
            facts,
            sp_offset,
            args_size,
        }
    }
}

/// Layouts a synthetic stack can be built for.
pub trait SyntheticLayout: FrameLayout
{
    /// SP of the innermost frame.
    const STACK_BASE: u64;

    /// Write the frame of `method` at `regs` into `memory` so that popping it
    /// yields `caller_ip`, and return the caller's registers.
    ///
    /// ## Errors
    ///
    /// Returns [`StackcrawlError::InvalidConfig`] if the method's shape cannot
    /// be laid out on this layout.
    fn spill(
        method: &SyntheticMethod<Self::Facts>,
        regs: &FrameRegisters,
        caller_ip: Address,
        caller_fp: Address,
        memory: &mut SyntheticMemory,
    ) -> Result<FrameRegisters>;
}

fn invalid(message: impl Into<String>) -> StackcrawlError
{
    StackcrawlError::InvalidConfig(message.into())
}

fn narrow_word(what: &str, address: Address) -> Result<u32>
{
    u32::try_from(address.value()).map_err(|_| invalid(format!("{what} {address} does not fit a 32-bit slot")))
}

impl SyntheticLayout for FramePointerLayout
{
    const STACK_BASE: u64 = 0x0060_0000;

    fn spill(
        method: &SyntheticMethod<Self::Facts>,
        regs: &FrameRegisters,
        caller_ip: Address,
        caller_fp: Address,
        memory: &mut SyntheticMemory,
    ) -> Result<FrameRegisters>
    {
        let return_slot = regs.sp + method.sp_offset;
        memory.write_u32(return_slot, narrow_word("return address", caller_ip)?);

        let fp = if method.facts.frame_pointer_is_frame_reg {
            if method.sp_offset < Self::WORD_SIZE {
                return Err(invalid("frame too small to save the frame pointer"));
            }
            memory.write_u32(return_slot - Self::WORD_SIZE, narrow_word("frame pointer", caller_fp)?);
            caller_fp
        } else {
            regs.fp
        };

        Ok(FrameRegisters {
            ip: caller_ip,
            sp: return_slot + Self::WORD_SIZE + method.args_size,
            fp,
        })
    }
}

impl SyntheticLayout for WindowedLayout
{
    const STACK_BASE: u64 = 0x0000_7ffe_0000_0000;

    fn spill(
        method: &SyntheticMethod<Self::Facts>,
        regs: &FrameRegisters,
        caller_ip: Address,
        caller_fp: Address,
        memory: &mut SyntheticMemory,
    ) -> Result<FrameRegisters>
    {
        let return_slot = regs.sp + method.sp_offset;
        memory.write_u64(return_slot, caller_ip.value());

        let saved_fp = u64::from(method.facts.frame_pointer_offset);
        let fp = if saved_fp == 0 {
            regs.fp
        } else {
            // Dynamic allocations since the prologue move the slot up with SP.
            let slot = (method.sp_offset + saved_fp)
                .checked_sub(u64::from(method.facts.stack_pointer_offset))
                .map(|offset| regs.sp + offset)
                .filter(|slot| *slot < return_slot)
                .ok_or_else(|| invalid("saved frame pointer slot lies outside the frame"))?;
            memory.write_u64(slot, caller_fp.value());
            caller_fp
        };

        Ok(FrameRegisters {
            ip: caller_ip,
            sp: return_slot + Self::WORD_SIZE,
            fp,
        })
    }
}

/// Sparse stack image.
#[derive(Debug, Default, Clone)]
pub struct SyntheticMemory
{
    words: BTreeMap<u64, u64>,
}

impl SyntheticMemory
{
    pub fn write_u64(&mut self, address: Address, value: u64)
    {
        self.words.insert(address.value(), value);
    }

    pub fn write_u32(&mut self, address: Address, value: u32)
    {
        self.words.insert(address.value(), u64::from(value));
    }

    /// Forget the slot at `address`; later reads fail.
    pub fn erase(&mut self, address: Address)
    {
        self.words.remove(&address.value());
    }

    /// Number of slots written.
    pub fn len(&self) -> usize
    {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.words.is_empty()
    }
}

impl MemoryAccess for SyntheticMemory
{
    fn read_u64(&self, address: Address) -> Result<u64>
    {
        self.words
            .get(&address.value())
            .copied()
            .ok_or(StackcrawlError::MemoryRead(address))
    }

    fn read_u32(&self, address: Address) -> Result<u32>
    {
        let value = self.read_u64(address)?;
        u32::try_from(value).map_err(|_| StackcrawlError::MemoryRead(address))
    }
}

/// Decoder answering from the frames a [`SyntheticStack`] laid out.
#[derive(Debug)]
pub struct SyntheticDecoder<L: FrameLayout>
{
    frames: HashMap<(Address, Address), DecodedFrame<L::Facts>>,
    fail_at: Option<Address>,
    calls: AtomicUsize,
}

impl<L: FrameLayout> Default for SyntheticDecoder<L>
{
    fn default() -> Self
    {
        Self {
            frames: HashMap::new(),
            fail_at: None,
            calls: AtomicUsize::new(0),
        }
    }
}

impl<L: FrameLayout> SyntheticDecoder<L>
{
    /// Record what decoding the frame at `regs` produces, replacing any
    /// previous answer.
    pub fn insert(&mut self, regs: &FrameRegisters, frame: DecodedFrame<L::Facts>)
    {
        self.frames.insert((regs.ip, regs.sp), frame);
    }

    /// What decoding the frame at `regs` produces, if known.
    pub fn get(&self, regs: &FrameRegisters) -> Option<&DecodedFrame<L::Facts>>
    {
        self.frames.get(&(regs.ip, regs.sp))
    }

    /// Make every decode of `ip` fail.
    pub fn fail_at(&mut self, ip: Address)
    {
        self.fail_at = Some(ip);
    }

    /// Number of decodes attempted so far.
    pub fn calls(&self) -> usize
    {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn reset_calls(&self)
    {
        self.calls.store(0, Ordering::Relaxed);
    }
}

impl<L: FrameLayout> UnwindDecoder<L> for SyntheticDecoder<L>
{
    fn unwind(&self, _token: &MethodToken<'_>, regs: &FrameRegisters) -> Result<DecodedFrame<L::Facts>>
    {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_at == Some(regs.ip) {
            return Err(StackcrawlError::UnwindInfoUnavailable {
                ip: regs.ip,
                reason: "decoder told to fail".into(),
            });
        }

        self.get(regs).copied().ok_or_else(|| StackcrawlError::UnwindInfoUnavailable {
            ip: regs.ip,
            reason: format!("no frame recorded at sp {}", regs.sp),
        })
    }
}

/// Builder for [`SyntheticStack`]. Frames are pushed innermost first.
#[derive(Debug, Clone)]
pub struct SyntheticStackBuilder<L: SyntheticLayout>
{
    methods: Vec<SyntheticMethod<L::Facts>>,
    frames: Vec<usize>,
    base: u64,
    code_base: u64,
    scope: ScopeId,
}

impl<L: SyntheticLayout> SyntheticStackBuilder<L>
{
    /// Push one frame of a new method.
    #[must_use]
    pub fn push(mut self, method: SyntheticMethod<L::Facts>) -> Self
    {
        self.frames.push(self.methods.len());
        self.methods.push(method);
        self
    }

    /// Push `count` recursive frames of one new method; they share a call site.
    #[must_use]
    pub fn push_many(mut self, method: SyntheticMethod<L::Facts>, count: usize) -> Self
    {
        let index = self.methods.len();
        self.methods.push(method);
        self.frames.extend(std::iter::repeat_n(index, count));
        self
    }

    /// SP of the innermost frame.
    #[must_use]
    pub fn base(mut self, sp: u64) -> Self
    {
        self.base = sp;
        self
    }

    /// Start of the code region.
    #[must_use]
    pub fn code_base(mut self, address: u64) -> Self
    {
        self.code_base = address;
        self
    }

    /// Unload scope owning the code region.
    #[must_use]
    pub fn scope(mut self, scope: ScopeId) -> Self
    {
        self.scope = scope;
        self
    }

    fn call_site(&self, method: usize) -> Address
    {
        Address::from(self.code_base + method as u64 * METHOD_SIZE + CALL_SITE_OFFSET)
    }

    /// Lay the stack out.
    ///
    /// ## Errors
    ///
    /// Returns [`StackcrawlError::InvalidConfig`] if a method cannot be laid
    /// out on `L`, or [`StackcrawlError::RegionOverlap`] if the code region
    /// is malformed.
    pub fn build(self) -> Result<SyntheticStack<L>>
    {
        let code_start = Address::from(self.code_base);
        let code_end = code_start + METHOD_SIZE * self.methods.len().max(1) as u64;
        let mut section = RangeSection::new(code_start, code_end, self.scope);
        for index in 0..self.methods.len() {
            let start = code_start + index as u64 * METHOD_SIZE;
            section.add_method(MethodRange {
                start,
                end: start + METHOD_SIZE,
                code_header: start,
            })?;
        }
        let mut regions = RangeSectionMap::new();
        regions.insert(section)?;

        let mut memory = SyntheticMemory::default();
        let mut decoder = SyntheticDecoder::default();
        let mut frames = Vec::with_capacity(self.frames.len());

        let first_ip = self.frames.first().map_or(Address::ZERO, |&method| self.call_site(method));
        let mut regs = FrameRegisters {
            ip: first_ip,
            sp: Address::from(self.base),
            fp: Address::from(INITIAL_FP),
        };

        for (depth, &index) in self.frames.iter().enumerate() {
            let method = &self.methods[index];
            let caller_ip = self
                .frames
                .get(depth + 1)
                .map_or(Address::ZERO, |&next| self.call_site(next));
            let caller_fp = Address::from(CALLER_FP_BASE + depth as u64 * 0x10);

            let caller = L::spill(method, &regs, caller_ip, caller_fp, &mut memory)?;
            decoder.insert(
                &regs,
                DecodedFrame {
                    caller,
                    facts: method.facts,
                    sp_offset: method.sp_offset,
                    args_size: method.args_size,
                },
            );
            frames.push(regs);
            regs = caller;
        }

        Ok(SyntheticStack {
            regions,
            memory,
            decoder,
            frames,
            start: FrameRegisters {
                ip: first_ip,
                sp: Address::from(self.base),
                fp: Address::from(INITIAL_FP),
            },
            outermost_caller: regs,
        })
    }
}

/// A complete stack image plus the collaborators to walk it.
#[derive(Debug)]
pub struct SyntheticStack<L: SyntheticLayout>
{
    regions: RangeSectionMap,
    memory: SyntheticMemory,
    decoder: SyntheticDecoder<L>,
    frames: Vec<FrameRegisters>,
    start: FrameRegisters,
    outermost_caller: FrameRegisters,
}

impl<L: SyntheticLayout> SyntheticStack<L>
{
    pub fn builder() -> SyntheticStackBuilder<L>
    {
        SyntheticStackBuilder {
            methods: Vec::new(),
            frames: Vec::new(),
            base: L::STACK_BASE,
            code_base: CODE_BASE,
            scope: ScopeId::from_raw(1),
        }
    }

    /// Registers of the innermost frame.
    pub fn start(&self) -> FrameRegisters
    {
        self.start
    }

    /// Registers of every frame, innermost first.
    pub fn expected_frames(&self) -> &[FrameRegisters]
    {
        &self.frames
    }

    /// Registers left after popping the outermost frame.
    pub fn outermost_caller(&self) -> FrameRegisters
    {
        self.outermost_caller
    }

    pub fn regions(&self) -> &RangeSectionMap
    {
        &self.regions
    }

    pub fn regions_mut(&mut self) -> &mut RangeSectionMap
    {
        &mut self.regions
    }

    pub fn memory(&self) -> &SyntheticMemory
    {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut SyntheticMemory
    {
        &mut self.memory
    }

    pub fn decoder(&self) -> &SyntheticDecoder<L>
    {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut SyntheticDecoder<L>
    {
        &mut self.decoder
    }

    /// A walker over this stack backed by `cache`.
    pub fn walker<'a>(
        &'a self,
        cache: &'a StackwalkCache<L>,
    ) -> StackWalker<'a, L, RangeSectionMap, SyntheticDecoder<L>, SyntheticMemory>
    {
        StackWalker::new(cache, &self.regions, &self.decoder, &self.memory)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::code::CodeRegions;
    use crate::layout::{FramePointerFacts, WindowedFacts};

    #[test]
    fn test_frames_grow_toward_callers()
    {
        let method = SyntheticMethod::new(
            WindowedFacts {
                stack_pointer_offset: 0x28,
                frame_pointer_offset: 0x20,
            },
            0x28,
            0,
        );
        let stack = SyntheticStack::<WindowedLayout>::builder()
            .push(method)
            .push(method)
            .build()
            .unwrap();

        let frames = stack.expected_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sp.value(), WindowedLayout::STACK_BASE);
        assert_eq!(frames[1].sp, frames[0].sp + 0x30);
        assert_eq!(frames[1].ip, frames[0].ip + METHOD_SIZE);
        assert!(stack.outermost_caller().is_end_of_stack());
    }

    #[test]
    fn test_recursive_frames_share_call_site()
    {
        let method = SyntheticMethod::new(FramePointerFacts::default(), 0x0c, 4);
        let stack = SyntheticStack::<FramePointerLayout>::builder()
            .push_many(method, 3)
            .build()
            .unwrap();

        let frames = stack.expected_frames();
        assert!(frames.iter().all(|frame| frame.ip == frames[0].ip));
        assert_eq!(frames[1].sp, frames[0].sp + 0x0c + 4 + 4);
    }

    #[test]
    fn test_pop_matches_spill()
    {
        let facts = FramePointerFacts {
            security_object_offset: 0,
            uses_frame_pointer_reg: true,
            frame_pointer_is_frame_reg: true,
        };
        let stack = SyntheticStack::<FramePointerLayout>::builder()
            .push(SyntheticMethod::new(facts, 0x18, 8))
            .push(SyntheticMethod::new(facts, 0x08, 0))
            .build()
            .unwrap();

        let start = stack.start();
        let word = FramePointerLayout::pack(0x18, &facts, 8).unwrap();
        let caller = FramePointerLayout::pop(&FramePointerLayout::unpack(word), &start, stack.memory()).unwrap();
        assert_eq!(caller, stack.expected_frames()[1]);
    }

    #[test]
    fn test_every_frame_has_a_method()
    {
        let method = SyntheticMethod::new(FramePointerFacts::default(), 0x10, 0);
        let stack = SyntheticStack::<FramePointerLayout>::builder()
            .push(method)
            .push(method)
            .build()
            .unwrap();

        for frame in stack.expected_frames() {
            assert!(!stack.regions().method_token(frame.ip).is_null());
        }
    }

    #[test]
    fn test_decoder_counts_and_fails()
    {
        let method = SyntheticMethod::new(FramePointerFacts::default(), 0x10, 0);
        let mut stack = SyntheticStack::<FramePointerLayout>::builder().push(method).build().unwrap();
        let start = stack.start();

        let token = stack.regions().method_token(start.ip);
        assert!(stack.decoder().unwind(&token, &start).is_ok());

        stack.decoder_mut().fail_at(start.ip);
        let token = stack.regions().method_token(start.ip);
        assert!(stack.decoder().unwind(&token, &start).is_err());
        assert_eq!(stack.decoder().calls(), 2);
    }

    #[test]
    fn test_saved_fp_outside_frame_rejected()
    {
        let method = SyntheticMethod::new(
            WindowedFacts {
                stack_pointer_offset: 0x20,
                frame_pointer_offset: 0x28,
            },
            0x20,
            0,
        );
        let built = SyntheticStack::<WindowedLayout>::builder().push(method).build();
        assert!(matches!(built, Err(StackcrawlError::InvalidConfig(_))));
    }
}
