//! Tests for error handling

use stackcrawl_core::error::{Result, StackcrawlError};
use stackcrawl_core::layout::PackError;
use stackcrawl_core::types::Address;

#[test]
fn test_unknown_code_display()
{
    let error = StackcrawlError::UnknownCode(Address::from(0x1234));
    let message = format!("{}", error);
    assert!(message.contains("0x0000000000001234"));
    assert!(message.contains("No code"));
}

#[test]
fn test_unwind_info_unavailable_display()
{
    let error = StackcrawlError::UnwindInfoUnavailable {
        ip: Address::from(0x1000),
        reason: "missing epilog".to_string(),
    };
    let message = format!("{}", error);
    assert!(message.contains("Unwind info unavailable"));
    assert!(message.contains("missing epilog"));
}

#[test]
fn test_unwind_inconsistent_display()
{
    let error = StackcrawlError::UnwindInconsistent {
        ip: Address::from(0x1000),
        sp: Address::from(0x8000),
        caller_sp: Address::from(0x7ff0),
    };
    let message = format!("{}", error);
    assert!(message.contains("0x0000000000008000"));
    assert!(message.contains("0x0000000000007ff0"));
}

#[test]
fn test_memory_read_display()
{
    let error = StackcrawlError::MemoryRead(Address::from(0xdead));
    let message = format!("{}", error);
    assert!(message.contains("read"));
    assert!(message.contains("dead"));
}

#[test]
fn test_walk_control_display()
{
    assert!(StackcrawlError::TooManyFrames(4096).to_string().contains("4096"));
    assert!(StackcrawlError::CallbackFailed { frame: 3 }.to_string().contains("frame 3"));
}

#[test]
fn test_invalid_config_display()
{
    let error = StackcrawlError::InvalidConfig("log2 entries out of range".to_string());
    let message = format!("{}", error);
    assert!(message.contains("Invalid configuration"));
    assert!(message.contains("log2 entries"));
}

#[test]
fn test_pack_error_display()
{
    let error = StackcrawlError::from(PackError::Overflow {
        field: "argsSize",
        value: 4096,
        bits: 11,
    });
    let message = format!("{}", error);
    assert!(message.contains("argsSize"));
    assert!(message.contains("11 bits"));
}

#[test]
fn test_result_type()
{
    fn test_function() -> Result<u32>
    {
        Ok(42)
    }

    assert_eq!(test_function().unwrap(), 42);
}

#[test]
fn test_result_error()
{
    fn test_function() -> Result<u32>
    {
        Err(StackcrawlError::TooManyFrames(1))
    }

    assert!(test_function().is_err());
}
