//! Common module for library exports

pub use crate::cache::{CacheConfig, CacheEntry, CacheStats, InvalidationStrategy, LocalCache, StackwalkCache};
pub use crate::code::{CodeRegions, CodeScope, MethodToken, RangeSection, RangeSectionMap, ScopeId};
pub use crate::error::{Result, StackcrawlError};
pub use crate::layout::{FrameLayout, NativeLayout};
pub use crate::types::{Address, FrameRegisters};
pub use crate::walk::{
    CrawlFrame, CrawlMark, MemoryAccess, StackCrawlMark, StackWalkAction, StackWalker, UnwindDecoder, WalkOptions,
    WalkOutcome, WalkState,
};
