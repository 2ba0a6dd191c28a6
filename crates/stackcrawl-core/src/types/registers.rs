//! Register snapshot used to step between frames.

use std::fmt;

use super::Address;

/// The three registers a frame step needs.
///
/// This is deliberately not a full machine context: popping a frame from a
/// cached record only ever moves the instruction pointer, the stack pointer,
/// and (sometimes) the frame pointer. Everything else belongs to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameRegisters
{
    /// Instruction pointer (EIP/RIP)
    pub ip: Address,
    /// Stack pointer (ESP/RSP)
    pub sp: Address,
    /// Frame pointer (EBP/RBP)
    pub fp: Address,
}

impl FrameRegisters
{
    /// Build a snapshot from raw register values.
    pub const fn new(ip: u64, sp: u64, fp: u64) -> Self
    {
        Self {
            ip: Address::new(ip),
            sp: Address::new(sp),
            fp: Address::new(fp),
        }
    }

    /// Returns `true` once unwinding has run off the outermost frame.
    pub const fn is_end_of_stack(&self) -> bool
    {
        self.ip.is_null()
    }
}

impl fmt::Display for FrameRegisters
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "ip={} sp={} fp={}", self.ip, self.sp, self.fp)
    }
}
