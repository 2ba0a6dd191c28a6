//! Tests for the shared cache table under concurrency and invalidation

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use stackcrawl_core::cache::{CacheConfig, CacheEntry, InvalidationStrategy, StackwalkCache};
use stackcrawl_core::code::{CodeScope, ScopeId};
use stackcrawl_core::error::StackcrawlError;
use stackcrawl_core::layout::{WindowedFacts, WindowedLayout};
use stackcrawl_core::sim::{SyntheticMethod, SyntheticStack};
use stackcrawl_core::types::Address;
use stackcrawl_core::walk::{CrawlFrame, StackWalkAction, WalkOptions, WalkState};

fn cache(log2_entries: u32, invalidation: InvalidationStrategy) -> StackwalkCache<WindowedLayout>
{
    StackwalkCache::new(&CacheConfig {
        log2_entries,
        invalidation,
        ..CacheConfig::default()
    })
    .unwrap()
}

fn entry(ip: u64, sp_offset: u32) -> CacheEntry<WindowedLayout>
{
    let facts = WindowedFacts {
        stack_pointer_offset: sp_offset,
        frame_pointer_offset: 0,
    };
    CacheEntry::build(Address::from(ip), u64::from(sp_offset), &facts, 0).unwrap()
}

fn continue_all(_frame: &CrawlFrame<'_>, _: &mut ()) -> StackWalkAction
{
    StackWalkAction::Continue
}

/// IPs that all hash to the slot of the first one.
fn colliding_ips(cache: &StackwalkCache<WindowedLayout>, count: usize) -> Vec<Address>
{
    let first = Address::from(0x1000_0040);
    let mut ips = vec![first];
    ips.extend(
        (1..u64::from(u32::MAX))
            .map(|n| Address::from(0x1000_0040 + (n << 32)))
            .filter(|ip| cache.key(*ip) == cache.key(first))
            .take(count - 1),
    );
    ips
}

#[test]
fn test_racing_writers_never_tear_entries()
{
    let cache = cache(4, InvalidationStrategy::FullClear);
    let ips = colliding_ips(&cache, 4);
    // Each IP carries its own index as its stack offset.
    let entries: Vec<_> = ips
        .iter()
        .enumerate()
        .map(|(n, ip)| entry(ip.value(), 0x10 * (n as u32 + 1)))
        .collect();
    let stop = AtomicBool::new(false);
    let cache = &cache;

    thread::scope(|scope| {
        for writer in 0..entries.len() {
            let entries = &entries;
            scope.spawn(move || {
                for round in 0..20_000 {
                    cache.insert(&entries[(writer + round) % entries.len()]);
                }
            });
        }

        for _ in 0..2 {
            scope.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    for (n, ip) in ips.iter().enumerate() {
                        if let Some(found) = cache.probe(*ip) {
                            assert_eq!(found.ip(), *ip);
                            assert_eq!(found.record().stack_pointer_offset, 0x10 * (n as u32 + 1));
                        }
                    }
                }
            });
        }

        thread::sleep(std::time::Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
    });

    let survivor = ips.iter().filter(|ip| cache.probe(**ip).is_some()).count();
    assert_eq!(survivor, 1, "one slot holds exactly one entry");
}

#[test]
fn test_full_invalidation_empties_table()
{
    let cache = cache(10, InvalidationStrategy::FullClear);
    for n in 0..16u64 {
        cache.insert(&entry(0x2000_0000 + n * 0x10, 0x18));
    }
    let occupied = cache.occupied();
    assert!(occupied > 0);

    let scope = CodeScope::new(ScopeId::from_raw(3)).with_range(Address::from(0x9000)..Address::from(0xa000));
    let receipt = cache.invalidate(&scope);

    assert_eq!(receipt.strategy, InvalidationStrategy::FullClear);
    assert_eq!(receipt.scope, ScopeId::from_raw(3));
    assert_eq!(receipt.slots_cleared, occupied);
    assert_eq!(cache.occupied(), 0);
    assert_eq!(cache.stats().invalidation_count, 1);
}

#[test]
fn test_selective_invalidation_keeps_other_scopes()
{
    let cache = cache(10, InvalidationStrategy::Selective);
    let unloaded: Vec<u64> = (0..4).map(|n| 0x1000 + n * 0x10).collect();
    let kept: Vec<u64> = (0..4).map(|n| 0x5200 + n * 0x10).collect();
    let keys: HashSet<_> = unloaded
        .iter()
        .chain(&kept)
        .map(|ip| cache.key(Address::from(*ip)))
        .collect();
    assert_eq!(keys.len(), 8, "test IPs must not share slots");

    for ip in unloaded.iter().chain(&kept) {
        cache.insert(&entry(*ip, 0x20));
    }

    let scope = CodeScope::new(ScopeId::from_raw(9)).with_range(Address::from(0x1000)..Address::from(0x2000));
    let receipt = cache.invalidate(&scope);

    assert_eq!(receipt.slots_cleared, unloaded.len());
    assert!(unloaded.iter().all(|ip| cache.probe(Address::from(*ip)).is_none()));
    assert!(kept.iter().all(|ip| cache.probe(Address::from(*ip)).is_some()));
}

#[test]
fn test_selective_invalidation_under_concurrent_inserts()
{
    let cache = cache(8, InvalidationStrategy::Selective);
    let scope = CodeScope::new(ScopeId::from_raw(2)).with_range(Address::from(0x4000_0000)..Address::from(0x4000_1000));
    for n in 0..64u64 {
        cache.insert(&entry(0x4000_0000 + n * 0x40, 0x10));
    }

    thread::scope(|threads| {
        threads.spawn(|| {
            for n in 0..10_000u64 {
                cache.insert(&entry(0x7000_0000 + (n % 512) * 0x8, 0x10));
            }
        });
        threads.spawn(|| {
            let _receipt = cache.invalidate(&scope);
        });
    });

    for n in 0..64u64 {
        assert!(cache.probe(Address::from(0x4000_0000 + n * 0x40)).is_none());
    }
}

#[test]
fn test_disabled_cache_is_inert()
{
    let cache = StackwalkCache::<WindowedLayout>::new(&CacheConfig::disabled()).unwrap();
    cache.insert(&entry(0x1234, 0x10));

    assert!(cache.probe(Address::from(0x1234)).is_none());
    assert_eq!(cache.occupied(), 0);

    let receipt = cache.invalidate(&CodeScope::new(ScopeId::from_raw(1)));
    assert_eq!(receipt.slots_cleared, 0);

    let stats = cache.stats();
    assert_eq!(stats.insert_count, 0);
    assert_eq!(stats.lookups(), 0);
}

#[test]
fn test_diagnostic_attach_disables_cache()
{
    let config = CacheConfig {
        diagnostic_attach: true,
        ..CacheConfig::default()
    };
    let cache = StackwalkCache::<WindowedLayout>::new(&config).unwrap();
    assert!(!cache.enabled());
}

#[test]
fn test_invalid_size_rejected()
{
    let config = CacheConfig {
        log2_entries: 40,
        ..CacheConfig::default()
    };
    assert!(matches!(
        StackwalkCache::<WindowedLayout>::new(&config),
        Err(StackcrawlError::InvalidConfig(_))
    ));
}

#[test]
fn test_unload_invalidates_before_dropping_regions()
{
    let method = SyntheticMethod::new(
        WindowedFacts {
            stack_pointer_offset: 0x38,
            frame_pointer_offset: 0x30,
        },
        0x38,
        0,
    );
    let mut stack = SyntheticStack::<WindowedLayout>::builder()
        .scope(ScopeId::from_raw(7))
        .push(method)
        .push(method)
        .push(method)
        .build()
        .unwrap();
    let cache = cache(10, InvalidationStrategy::Selective);

    let first = stack.walker(&cache).walk(stack.start(), &WalkOptions::default(), continue_all, &mut ());
    assert_eq!(first.state, WalkState::Done);
    assert_eq!(cache.occupied(), 3);

    let receipt = stack.regions_mut().unload(ScopeId::from_raw(7), &cache);
    assert_eq!(receipt.scope, ScopeId::from_raw(7));
    assert_eq!(receipt.slots_cleared, 3);
    assert!(stack.regions().is_empty());
    assert_eq!(cache.occupied(), 0);

    let second = stack.walker(&cache).walk(stack.start(), &WalkOptions::default(), continue_all, &mut ());
    assert_eq!(second.state, WalkState::Failed);
    assert_eq!(second.error, Some(StackcrawlError::UnknownCode(stack.start().ip)));
}
