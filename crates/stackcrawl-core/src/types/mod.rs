//! # Types
//!
//! Platform-agnostic types used throughout the stack walker.

pub mod address;
pub mod registers;

// Re-export all public types
pub use address::Address;
pub use registers::FrameRegisters;
