//! Tests for building cache entries on each layout

use stackcrawl_core::cache::{CacheConfig, CacheEntry, StackwalkCache};
use stackcrawl_core::error::StackcrawlError;
use stackcrawl_core::layout::{
    FrameLayout, FramePointerFacts, FramePointerLayout, NoCacheLayout, PackError, WindowedFacts, WindowedLayout,
};
use stackcrawl_core::types::Address;

const IP: Address = Address::new(0x1000_0040);

fn frame_pointer_facts(security: u32) -> FramePointerFacts
{
    FramePointerFacts {
        security_object_offset: security,
        uses_frame_pointer_reg: true,
        frame_pointer_is_frame_reg: true,
    }
}

#[test]
fn test_frame_pointer_entry_survives_the_table()
{
    let cache = StackwalkCache::<FramePointerLayout>::new(&CacheConfig::default()).unwrap();
    let entry = CacheEntry::<FramePointerLayout>::build(IP, 0x7fff, &frame_pointer_facts(7), 0x7ff).unwrap();
    cache.insert(&entry);

    let found = cache.probe(IP).unwrap();
    assert_eq!(found, entry);
    assert_eq!(found.record().stack_pointer_offset, 0x7fff);
    assert_eq!(found.record().args_size, 0x7ff);
    assert_eq!(found.unwind_facts(), frame_pointer_facts(7));
    assert!(found.has_security_object());
    assert!(found.is_safe_to_use_cache());
}

#[test]
fn test_frame_pointer_field_limits()
{
    let facts = frame_pointer_facts(0);
    assert!(CacheEntry::<FramePointerLayout>::build(IP, 0x8000, &facts, 0).is_err());
    assert!(CacheEntry::<FramePointerLayout>::build(IP, 0, &facts, 0x800).is_err());
    assert!(CacheEntry::<FramePointerLayout>::build(IP, 0, &frame_pointer_facts(8), 0).is_err());

    let entry = CacheEntry::<FramePointerLayout>::build(IP, 0, &facts, 0).unwrap();
    assert!(!entry.has_security_object());
}

#[test]
fn test_frame_pointer_scratch_register_is_cacheable_but_unsafe()
{
    let facts = FramePointerFacts {
        security_object_offset: 0,
        uses_frame_pointer_reg: true,
        frame_pointer_is_frame_reg: false,
    };
    let entry = CacheEntry::<FramePointerLayout>::build(IP, 0x20, &facts, 0).unwrap();
    assert!(!entry.is_safe_to_use_cache());
}

#[test]
fn test_windowed_entry_folds_growth()
{
    let facts = WindowedFacts {
        stack_pointer_offset: 0x28,
        frame_pointer_offset: 0x20,
    };
    let entry = CacheEntry::<WindowedLayout>::build(IP, 0x68, &facts, 0).unwrap();
    let record = entry.record();
    assert_eq!(record.stack_pointer_offset, 0x68);
    assert_eq!(record.frame_pointer_offset, 0x60);
    assert!(!entry.has_security_object());
    assert!(entry.is_safe_to_use_cache());
}

#[test]
fn test_windowed_offsets_use_full_words()
{
    let facts = WindowedFacts {
        stack_pointer_offset: u32::MAX,
        frame_pointer_offset: 0,
    };
    let entry = CacheEntry::<WindowedLayout>::build(IP, u64::from(u32::MAX), &facts, 0).unwrap();
    assert_eq!(entry.record().stack_pointer_offset, u32::MAX);
    assert_eq!(entry.record().frame_pointer_offset, 0);

    let too_far = CacheEntry::<WindowedLayout>::build(IP, u64::from(u32::MAX) + 1, &facts, 0);
    assert!(matches!(too_far, Err(PackError::Overflow { .. })));
}

#[test]
fn test_null_ip_is_never_an_entry()
{
    let facts = WindowedFacts::default();
    assert_eq!(
        CacheEntry::<WindowedLayout>::build(Address::ZERO, 0x10, &facts, 0),
        Err(PackError::NullInstructionPointer)
    );
    assert!(CacheEntry::<WindowedLayout>::empty().is_empty());
}

#[test]
fn test_no_cache_layout_refuses()
{
    let result = CacheEntry::<NoCacheLayout>::build(IP, 0x10, &(), 0);
    assert_eq!(result, Err(PackError::Unsupported(NoCacheLayout::NAME)));
}

#[test]
fn test_pack_error_converts()
{
    let err: StackcrawlError = PackError::FramePointerFlags.into();
    assert!(matches!(err, StackcrawlError::Pack(PackError::FramePointerFlags)));
    assert!(err.to_string().contains("frame register"));
}
