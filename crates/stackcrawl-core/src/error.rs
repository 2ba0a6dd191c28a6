//! # Error Types
//!
//! General error handling for stack walking.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.
//!
//! Most cache anomalies are not errors at all: a miss, an entry that is unsafe
//! to consume, or a frame whose facts do not fit the packed layout simply send
//! the walker down the decoder path. Only a genuine unwind failure ends a walk.

use thiserror::Error;

use crate::types::Address;

/// Main error type for stack-walk operations
///
/// ## Error Categories
///
/// 1. **Code lookup errors**: UnknownCode, RegionOverlap
/// 2. **Unwind errors**: UnwindInfoUnavailable, UnwindInconsistent, MemoryRead
/// 3. **Walk control errors**: TooManyFrames, CallbackFailed
/// 4. **Configuration errors**: InvalidConfig
/// 5. **Packing errors**: Pack (only surfaced when a caller builds entries directly)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackcrawlError
{
    /// The instruction pointer is not inside any known code region, or the
    /// region has no method header for it.
    #[error("No code found at {0}")]
    UnknownCode(Address),

    /// A code region was registered over addresses another region already covers.
    #[error("Code region starting at {0} overlaps an existing region")]
    RegionOverlap(Address),

    /// The unwind-info decoder could not describe the frame at `ip`.
    #[error("Unwind info unavailable at {ip}: {reason}")]
    UnwindInfoUnavailable
    {
        /// Instruction pointer of the frame being unwound
        ip: Address,
        /// Decoder-supplied explanation
        reason: String,
    },

    /// Unwinding produced a caller frame that is not older than its callee.
    ///
    /// Stacks grow down, so a caller's stack pointer must be strictly above
    /// the callee's. Anything else means the unwind data is wrong and the
    /// walk would loop or wander off the stack.
    #[error("Inconsistent unwind at {ip}: caller sp {caller_sp} is not above sp {sp}")]
    UnwindInconsistent
    {
        /// Instruction pointer of the frame being unwound
        ip: Address,
        /// Stack pointer of the frame being unwound
        sp: Address,
        /// Stack pointer the unwind produced for the caller
        caller_sp: Address,
    },

    /// Stack memory needed to pop a frame could not be read.
    #[error("Failed to read stack memory at {0}")]
    MemoryRead(Address),

    /// The walk exceeded its frame limit without reaching the outermost frame.
    #[error("Stack walk exceeded {0} frames")]
    TooManyFrames(usize),

    /// The walk callback returned `FAILED` for the frame at the given index.
    #[error("Stack walk callback failed at frame {frame}")]
    CallbackFailed
    {
        /// Zero-based index of the reported frame
        frame: usize,
    },

    /// A configuration value was rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A cache entry could not be built from the supplied facts.
    #[error("Cache entry not representable: {0}")]
    Pack(#[from] crate::layout::PackError),
}

/// Convenience type alias for `Result<T, StackcrawlError>`
///
/// ```rust
/// use stackcrawl_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, StackcrawlError>;
