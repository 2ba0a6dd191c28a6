//! # stackcrawl-core
//!
//! Lock-free stack-walk cache and frame-walking driver for a managed runtime's
//! jitted code.
//!
//! This crate provides:
//! - A shared, fixed-size cache of per-IP unwind facts ([`cache`])
//! - Per-architecture packed entry layouts ([`layout`])
//! - Code-region lookup and method tokens ([`code`])
//! - The frame-by-frame walker with its callback protocol ([`walk`])
//! - Synthetic stacks for driving the walker without a live process ([`sim`])
//!
//! ## Architecture Support
//!
//! - **x86**: [`layout::FramePointerLayout`], a packed 32-bit facts word
//! - **x86-64**: [`layout::WindowedLayout`], two 32-bit offsets
//! - **Everything else**: [`layout::NoCacheLayout`]; every frame is decoded
//!
//! The build script picks [`layout::NativeLayout`] from the target
//! architecture. All layouts are compiled on every host.
//!
//! ## Concurrency
//!
//! The cache is shared by every thread and takes no locks. Entries are moved
//! as single 128-bit atomic values, so a reader never sees one entry's IP
//! paired with another entry's facts.

pub mod cache;
pub mod code;
pub mod error;
pub mod layout;
pub mod prelude;
pub mod sim;
pub mod types;
pub mod walk;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheEntry, StackwalkCache};
pub use error::{Result, StackcrawlError};
pub use types::{Address, FrameRegisters};
pub use walk::{StackWalkAction, StackWalker, WalkOptions, WalkOutcome};
