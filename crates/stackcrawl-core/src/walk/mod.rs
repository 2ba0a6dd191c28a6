//! # Stack Walking
//!
//! Frame-by-frame traversal of a thread's jitted frames.
//!
//! A walk starts from a register snapshot and repeatedly:
//!
//! 1. resolves the IP to a [`MethodToken`],
//! 2. pops the frame from the [`StackwalkCache`](crate::cache::StackwalkCache)
//!    if it holds a safe entry for the IP, or asks the [`UnwindDecoder`]
//!    otherwise (caching the decoded facts when they fit),
//! 3. hands a [`CrawlFrame`] to the caller and reads back a
//!    [`StackWalkAction`].
//!
//! The walk runs synchronously on the calling thread and never yields. The
//! only way to stop it early is for the caller to answer `Abort`.
//!
//! ## Example
//!
//! ```rust
//! use stackcrawl_core::cache::{CacheConfig, StackwalkCache};
//! use stackcrawl_core::layout::{WindowedFacts, WindowedLayout};
//! use stackcrawl_core::sim::{SyntheticMethod, SyntheticStack};
//! use stackcrawl_core::walk::{StackWalkAction, WalkOptions, WalkState};
//!
//! let method = SyntheticMethod::new(WindowedFacts { stack_pointer_offset: 0x28, frame_pointer_offset: 0 }, 0x28, 0);
//! let stack = SyntheticStack::<WindowedLayout>::builder().push_many(method, 4).build()?;
//! let cache = StackwalkCache::<WindowedLayout>::new(&CacheConfig::default())?;
//!
//! let mut seen = 0usize;
//! let outcome = stack.walker(&cache).walk(stack.start(), &WalkOptions::default(), |_frame, seen: &mut usize| {
//!     *seen += 1;
//!     StackWalkAction::Continue
//! }, &mut seen);
//!
//! assert_eq!(outcome.state, WalkState::Done);
//! assert_eq!(seen, 4);
//! # Ok::<(), stackcrawl_core::error::StackcrawlError>(())
//! ```

mod walker;

use std::fmt;

pub use walker::{StackWalker, Walk};

use crate::code::MethodToken;
use crate::error::{Result, StackcrawlError};
use crate::types::{Address, FrameRegisters};

/// Which frame, relative to a marked call site, a stack operation resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StackCrawlMark
{
    /// The frame that owns the mark.
    LookForMe = 0,
    /// That frame's caller.
    LookForMyCaller = 1,
    /// That frame's caller's caller.
    LookForMyCallersCaller = 2,
    /// No particular frame: the whole thread.
    LookForThread = 3,
}

impl StackCrawlMark
{
    /// Frames to skip past the marked one, or `None` for the whole thread.
    pub const fn callers_to_skip(self) -> Option<usize>
    {
        match self {
            Self::LookForMe => Some(0),
            Self::LookForMyCaller => Some(1),
            Self::LookForMyCallersCaller => Some(2),
            Self::LookForThread => None,
        }
    }
}

/// A crawl mark anchored at a stack address inside the marked frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlMark
{
    /// Which frame relative to the marked one to resolve.
    pub kind: StackCrawlMark,
    /// Address of a stack slot in the marked frame.
    pub address: Address,
}

/// The callback's verdict for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StackWalkAction
{
    /// Continue with the next older frame.
    Continue = 0,
    /// Stop walking; an expected early exit, not an error.
    Abort = 1,
    /// The stack could not be walked.
    Failed = 2,
}

impl StackWalkAction
{
    /// Alias for [`StackWalkAction::Continue`] used as a walk's final answer.
    pub const DONE: Self = Self::Continue;
}

/// Plain-function callback signature; any matching closure works too.
pub type StackWalkCallback<T> = fn(&CrawlFrame<'_>, &mut T) -> StackWalkAction;

/// Where a walk is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkState
{
    /// Skipping frames until the crawl mark is satisfied.
    Seeking,
    /// Handing frames to the caller.
    Reporting,
    /// The outermost frame was unwound.
    Done,
    /// The caller stopped the walk.
    Aborted,
    /// The walk could not complete.
    Failed,
}

impl WalkState
{
    /// Returns `true` for states a walk never leaves.
    pub const fn is_terminal(self) -> bool
    {
        matches!(self, Self::Done | Self::Aborted | Self::Failed)
    }
}

impl fmt::Display for WalkState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Self::Seeking => "seeking",
            Self::Reporting => "reporting",
            Self::Done => "done",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a frame's caller registers were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindSource
{
    /// Popped from a cached entry.
    Cache,
    /// Produced by the unwind-info decoder.
    Decoder,
}

/// One frame handed to the walk callback.
#[derive(Debug, Clone, Copy)]
pub struct CrawlFrame<'a>
{
    index: usize,
    regs: FrameRegisters,
    caller: FrameRegisters,
    token: MethodToken<'a>,
    source: UnwindSource,
    security_object_offset: Option<u32>,
}

impl<'a> CrawlFrame<'a>
{
    /// Physical depth of the frame; 0 is the innermost frame unwound.
    pub fn index(&self) -> usize
    {
        self.index
    }

    /// Registers at this frame.
    pub fn registers(&self) -> &FrameRegisters
    {
        &self.regs
    }

    /// Registers of the caller after popping this frame.
    pub fn caller(&self) -> &FrameRegisters
    {
        &self.caller
    }

    /// The frame's method.
    pub fn token(&self) -> MethodToken<'a>
    {
        self.token
    }

    /// Whether the frame was popped from the cache or decoded.
    pub fn source(&self) -> UnwindSource
    {
        self.source
    }

    /// Stack offset of the frame's security object, if it has one.
    pub fn security_object_offset(&self) -> Option<u32>
    {
        self.security_object_offset
    }

    /// Returns `true` if this is the last frame of the stack.
    pub fn is_outermost(&self) -> bool
    {
        self.caller.is_end_of_stack()
    }
}

/// Minimal memory accessor required to pop frames.
pub trait MemoryAccess
{
    /// Read an 8-byte stack slot.
    ///
    /// ## Errors
    ///
    /// Returns [`StackcrawlError::MemoryRead`] if the address is unreadable.
    fn read_u64(&self, address: Address) -> Result<u64>;

    /// Read a 4-byte stack slot.
    ///
    /// ## Errors
    ///
    /// Returns [`StackcrawlError::MemoryRead`] if the address is unreadable.
    fn read_u32(&self, address: Address) -> Result<u32>;
}

/// What the decoder learns from fully unwinding one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame<F>
{
    /// The caller's registers.
    pub caller: FrameRegisters,
    /// Minimal facts for caching the frame.
    pub facts: F,
    /// Distance from the frame's SP to its return-address slot at this IP.
    pub sp_offset: u64,
    /// Bytes of arguments the frame pops on return.
    pub args_size: u64,
}

/// Full unwind-info decoding, consulted on every cache miss.
pub trait UnwindDecoder<L: crate::layout::FrameLayout>
{
    /// Unwind the frame at `regs` inside the method `token` names.
    ///
    /// ## Errors
    ///
    /// Returns an error when the method's unwind info is missing or does not
    /// describe `regs.ip`; the walk then fails.
    fn unwind(&self, token: &MethodToken<'_>, regs: &FrameRegisters) -> Result<DecodedFrame<L::Facts>>;
}

/// Summary of a finished walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkOutcome
{
    /// Terminal state.
    pub state: WalkState,
    /// Frames popped, including skipped ones.
    pub frames_unwound: usize,
    /// Frames handed to the caller.
    pub frames_reported: usize,
    /// Frames popped straight from the cache.
    pub cache_hits: usize,
    /// Frames sent to the decoder.
    pub decoder_calls: usize,
    /// Why the walk failed, if it did.
    pub error: Option<StackcrawlError>,
}

impl WalkOutcome
{
    /// The walk's result as a [`StackWalkAction`].
    pub fn action(&self) -> StackWalkAction
    {
        match self.state {
            WalkState::Failed => StackWalkAction::Failed,
            WalkState::Aborted | WalkState::Seeking | WalkState::Reporting => StackWalkAction::Abort,
            WalkState::Done => StackWalkAction::DONE,
        }
    }
}

/// Per-walk knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkOptions
{
    /// Skip frames until this mark is satisfied.
    pub mark: Option<CrawlMark>,
    /// Give up after this many frames.
    pub max_frames: usize,
    /// Consult and populate the cache.
    pub use_cache: bool,
}

impl Default for WalkOptions
{
    fn default() -> Self
    {
        Self {
            mark: None,
            max_frames: 4096,
            use_cache: true,
        }
    }
}
