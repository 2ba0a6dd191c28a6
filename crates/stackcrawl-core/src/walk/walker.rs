use tracing::{debug, trace};

use super::{
    CrawlFrame, CrawlMark, MemoryAccess, StackWalkAction, UnwindDecoder, UnwindSource, WalkOptions, WalkOutcome,
    WalkState,
};
use crate::cache::{CacheEntry, LocalCache, StackwalkCache};
use crate::code::{CodeRegions, MethodToken};
use crate::error::{Result, StackcrawlError};
use crate::layout::FrameLayout;
use crate::types::{Address, FrameRegisters};

/// Cache-accelerated stack walker.
///
/// Holds the collaborators a walk needs; each call to [`StackWalker::begin`]
/// or [`StackWalker::walk`] starts an independent walk with its own working
/// copy of the cache entry.
pub struct StackWalker<'a, L, R, D, M>
where
    L: FrameLayout,
    R: CodeRegions + ?Sized,
    D: UnwindDecoder<L> + ?Sized,
    M: MemoryAccess + ?Sized,
{
    cache: &'a StackwalkCache<L>,
    regions: &'a R,
    decoder: &'a D,
    memory: &'a M,
}

impl<'a, L, R, D, M> StackWalker<'a, L, R, D, M>
where
    L: FrameLayout,
    R: CodeRegions + ?Sized,
    D: UnwindDecoder<L> + ?Sized,
    M: MemoryAccess + ?Sized,
{
    pub fn new(cache: &'a StackwalkCache<L>, regions: &'a R, decoder: &'a D, memory: &'a M) -> Self
    {
        Self {
            cache,
            regions,
            decoder,
            memory,
        }
    }

    /// Start a pull-style walk from `start`.
    pub fn begin(&self, start: FrameRegisters, options: &WalkOptions) -> Walk<'a, L, R, D, M>
    {
        let seek = Seek::new(options.mark);
        let state = if matches!(seek, Seek::Report) {
            WalkState::Reporting
        } else {
            WalkState::Seeking
        };

        Walk {
            local: self.cache.local(),
            regions: self.regions,
            decoder: self.decoder,
            memory: self.memory,
            regs: start,
            options: *options,
            seek,
            state,
            pending: false,
            frames_unwound: 0,
            frames_reported: 0,
            cache_hits: 0,
            decoder_calls: 0,
            error: None,
        }
    }

    /// Walk from `start`, calling `callback` with `data` for every reported frame.
    pub fn walk<T, F>(&self, start: FrameRegisters, options: &WalkOptions, callback: F, data: &mut T) -> WalkOutcome
    where
        F: FnMut(&CrawlFrame<'a>, &mut T) -> StackWalkAction,
    {
        self.begin(start, options).run(callback, data)
    }
}

/// Where the walk stands relative to its crawl mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seek
{
    /// Report every frame.
    Report,
    /// Looking for the frame that owns `address`, then skipping `skip` more.
    FindMark
    {
        address: Address,
        skip: usize,
    },
    /// The marked frame was found; skip this many more before reporting.
    Skip(usize),
}

impl Seek
{
    fn new(mark: Option<CrawlMark>) -> Self
    {
        match mark.and_then(|mark| mark.kind.callers_to_skip().map(|skip| (mark.address, skip))) {
            Some((address, skip)) => Self::FindMark { address, skip },
            None => Self::Report,
        }
    }

    /// Decide whether `frame` is reported, advancing the seek.
    fn admit(&mut self, frame: &CrawlFrame<'_>) -> bool
    {
        match *self {
            Self::Report => true,
            Self::FindMark { address, skip } => {
                // The mark lives in this frame once the caller's SP is above it.
                if frame.caller().sp <= address {
                    return false;
                }
                *self = if skip == 0 { Self::Report } else { Self::Skip(skip) };
                skip == 0
            }
            Self::Skip(remaining) => {
                *self = if remaining == 1 {
                    Self::Report
                } else {
                    Self::Skip(remaining - 1)
                };
                remaining == 1
            }
        }
    }
}

/// One walk in progress.
///
/// Call [`Walk::next_frame`] to get the next reported frame and
/// [`Walk::resolve`] to give the verdict for it. Calling `next_frame` again
/// without resolving counts as `Continue`.
pub struct Walk<'a, L, R, D, M>
where
    L: FrameLayout,
    R: CodeRegions + ?Sized,
    D: UnwindDecoder<L> + ?Sized,
    M: MemoryAccess + ?Sized,
{
    local: LocalCache<'a, L>,
    regions: &'a R,
    decoder: &'a D,
    memory: &'a M,
    regs: FrameRegisters,
    options: WalkOptions,
    seek: Seek,
    state: WalkState,
    pending: bool,
    frames_unwound: usize,
    frames_reported: usize,
    cache_hits: usize,
    decoder_calls: usize,
    error: Option<StackcrawlError>,
}

impl<'a, L, R, D, M> Walk<'a, L, R, D, M>
where
    L: FrameLayout,
    R: CodeRegions + ?Sized,
    D: UnwindDecoder<L> + ?Sized,
    M: MemoryAccess + ?Sized,
{
    /// Current state.
    pub fn state(&self) -> WalkState
    {
        self.state
    }

    /// Registers of the next frame to unwind.
    pub fn registers(&self) -> &FrameRegisters
    {
        &self.regs
    }

    /// Unwind until the next frame to report, or `None` once the walk ends.
    pub fn next_frame(&mut self) -> Option<CrawlFrame<'a>>
    {
        if self.pending {
            self.resolve(StackWalkAction::Continue);
        }

        loop {
            if self.state.is_terminal() {
                return None;
            }
            if self.regs.is_end_of_stack() {
                self.finish(WalkState::Done);
                return None;
            }
            if self.frames_unwound >= self.options.max_frames {
                self.fail(StackcrawlError::TooManyFrames(self.options.max_frames));
                return None;
            }

            let frame = match self.unwind_current() {
                Ok(frame) => frame,
                Err(err) => {
                    self.fail(err);
                    return None;
                }
            };
            self.frames_unwound += 1;
            self.regs = *frame.caller();

            if self.seek.admit(&frame) {
                self.state = WalkState::Reporting;
                self.pending = true;
                return Some(frame);
            }
            trace!(index = frame.index(), ip = %frame.registers().ip, "skipping frame before crawl mark");
        }
    }

    /// Apply the caller's verdict for the frame last returned.
    pub fn resolve(&mut self, action: StackWalkAction)
    {
        if !self.pending {
            return;
        }
        self.pending = false;
        self.frames_reported += 1;

        match action {
            StackWalkAction::Continue => {
                if self.regs.is_end_of_stack() {
                    self.finish(WalkState::Done);
                }
            }
            StackWalkAction::Abort => self.finish(WalkState::Aborted),
            StackWalkAction::Failed => self.fail(StackcrawlError::CallbackFailed {
                frame: self.frames_reported - 1,
            }),
        }
    }

    /// Drive the walk to completion with `callback`.
    pub fn run<T, F>(mut self, mut callback: F, data: &mut T) -> WalkOutcome
    where
        F: FnMut(&CrawlFrame<'a>, &mut T) -> StackWalkAction,
    {
        while let Some(frame) = self.next_frame() {
            let action = callback(&frame, data);
            self.resolve(action);
        }
        self.into_outcome()
    }

    /// Finish the walk and summarise it. A walk abandoned mid-way counts as aborted.
    pub fn into_outcome(mut self) -> WalkOutcome
    {
        if self.pending {
            self.resolve(StackWalkAction::Abort);
        } else if !self.state.is_terminal() {
            self.finish(WalkState::Aborted);
        }

        WalkOutcome {
            state: self.state,
            frames_unwound: self.frames_unwound,
            frames_reported: self.frames_reported,
            cache_hits: self.cache_hits,
            decoder_calls: self.decoder_calls,
            error: self.error,
        }
    }

    fn finish(&mut self, state: WalkState)
    {
        self.state = state;
        debug!(
            %state,
            unwound = self.frames_unwound,
            reported = self.frames_reported,
            cache_hits = self.cache_hits,
            decoder_calls = self.decoder_calls,
            "stack walk finished"
        );
    }

    fn fail(&mut self, err: StackcrawlError)
    {
        debug!(error = %err, ip = %self.regs.ip, "stack walk failed");
        self.error = Some(err);
        self.finish(WalkState::Failed);
    }

    fn unwind_current(&mut self) -> Result<CrawlFrame<'a>>
    {
        let regs = self.regs;
        let token = self.regions.method_token(regs.ip);
        if token.is_null() {
            return Err(StackcrawlError::UnknownCode(regs.ip));
        }

        if let Some(frame) = self.try_cached(&regs, token) {
            self.cache_hits += 1;
            return Ok(frame);
        }

        self.decoder_calls += 1;
        let decoded = self.decoder.unwind(&token, &regs)?;
        check_caller(&regs, &decoded.caller)?;

        if self.options.use_cache && self.local.enabled() {
            match CacheEntry::<L>::build(regs.ip, decoded.sp_offset, &decoded.facts, decoded.args_size) {
                Ok(entry) => self.local.insert(&entry),
                Err(err) => {
                    self.local.cache().note_uncacheable();
                    trace!(ip = %regs.ip, error = %err, "frame not cacheable");
                }
            }
        }

        Ok(CrawlFrame {
            index: self.frames_unwound,
            regs,
            caller: decoded.caller,
            token,
            source: UnwindSource::Decoder,
            security_object_offset: L::security_object_offset(&decoded.facts),
        })
    }

    /// Pop the frame from the cache if it holds a usable entry for `regs.ip`.
    ///
    /// Every way this can go wrong ends in `None` and a decode.
    fn try_cached(&mut self, regs: &FrameRegisters, token: MethodToken<'a>) -> Option<CrawlFrame<'a>>
    {
        if !self.options.use_cache || !self.local.lookup(regs.ip) {
            return None;
        }

        let entry = *self.local.entry();
        if !entry.is_safe_to_use_cache() {
            self.local.cache().note_unsafe_bypass();
            trace!(ip = %regs.ip, "cached entry unsafe to use; decoding");
            return None;
        }

        let caller = match L::pop(&entry.record(), regs, self.memory).and_then(|caller| {
            check_caller(regs, &caller)?;
            Ok(caller)
        }) {
            Ok(caller) => caller,
            Err(err) => {
                trace!(ip = %regs.ip, error = %err, "cached pop failed; decoding");
                return None;
            }
        };

        trace!(ip = %regs.ip, caller_ip = %caller.ip, "frame popped from cache");
        Some(CrawlFrame {
            index: self.frames_unwound,
            regs: *regs,
            caller,
            token,
            source: UnwindSource::Cache,
            security_object_offset: L::security_object_offset(&entry.unwind_facts()),
        })
    }
}

/// Stacks grow down: a caller's SP must be strictly above its callee's.
fn check_caller(regs: &FrameRegisters, caller: &FrameRegisters) -> Result<()>
{
    if caller.sp > regs.sp {
        Ok(())
    } else {
        Err(StackcrawlError::UnwindInconsistent {
            ip: regs.ip,
            sp: regs.sp,
            caller_sp: caller.sp,
        })
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::walk::StackCrawlMark;

    fn frame_with_caller_sp(caller_sp: u64) -> CrawlFrame<'static>
    {
        CrawlFrame {
            index: 0,
            regs: FrameRegisters::new(0x1000, caller_sp - 0x10, 0),
            caller: FrameRegisters::new(0x2000, caller_sp, 0),
            token: MethodToken::null(),
            source: UnwindSource::Decoder,
            security_object_offset: None,
        }
    }

    #[test]
    fn test_seek_without_mark_reports_everything()
    {
        let mut seek = Seek::new(None);
        assert!(seek.admit(&frame_with_caller_sp(0x100)));
        assert!(seek.admit(&frame_with_caller_sp(0x200)));
    }

    #[test]
    fn test_seek_thread_mark_reports_everything()
    {
        let mut seek = Seek::new(Some(CrawlMark {
            kind: StackCrawlMark::LookForThread,
            address: Address::from(0x150),
        }));
        assert!(seek.admit(&frame_with_caller_sp(0x100)));
    }

    #[test]
    fn test_seek_finds_callers_caller()
    {
        let mut seek = Seek::new(Some(CrawlMark {
            kind: StackCrawlMark::LookForMyCallersCaller,
            address: Address::from(0x150),
        }));
        assert!(!seek.admit(&frame_with_caller_sp(0x100))); // below the mark
        assert!(!seek.admit(&frame_with_caller_sp(0x200))); // owns the mark
        assert!(!seek.admit(&frame_with_caller_sp(0x300))); // caller
        assert!(seek.admit(&frame_with_caller_sp(0x400))); // caller's caller
        assert!(seek.admit(&frame_with_caller_sp(0x500)));
    }

    #[test]
    fn test_check_caller_requires_growth()
    {
        let regs = FrameRegisters::new(0x1000, 0x100, 0);
        assert!(check_caller(&regs, &FrameRegisters::new(0x2000, 0x108, 0)).is_ok());
        assert!(check_caller(&regs, &FrameRegisters::new(0x2000, 0x100, 0)).is_err());
    }
}
