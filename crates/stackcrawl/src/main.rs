use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use stackcrawl_core::cache;
use stackcrawl_core::layout::{FramePointerFacts, FramePointerLayout, WindowedFacts, WindowedLayout};
use stackcrawl_core::prelude::{
    CacheConfig, CacheStats, FrameLayout, FrameRegisters, InvalidationStrategy, NativeLayout, ScopeId,
    StackWalkAction, StackwalkCache, WalkOptions, WalkOutcome, WalkState,
};
use stackcrawl_core::sim::{SyntheticLayout, SyntheticMethod, SyntheticStack};
use stackcrawl_core::walk::UnwindSource;
use stackcrawl_utils::{debug, info, init_logging};
use tokio::task::JoinSet;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Unload scope owning the synthetic code.
const DEMO_SCOPE: ScopeId = ScopeId::from_raw(1);

/// Inspect and exercise the stackwalk cache on synthetic stacks.
#[derive(Parser, Debug)]
#[command(name = "stackcrawl")]
#[command(version)]
#[command(about = "Inspect and exercise the stackwalk cache on synthetic stacks", long_about = None)]
struct Cli
{
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Show the native layout and cache configuration
    Info
    {
        #[command(flatten)]
        cache: CacheArgs,
    },
    /// Build a synthetic stack and walk it repeatedly
    Walk
    {
        /// Number of frames on the stack
        #[arg(long, default_value_t = 16)]
        depth: usize,
        /// Number of walks over the same stack
        #[arg(long, default_value_t = 2)]
        passes: usize,
        /// Entry layout (defaults to the native one)
        #[arg(long, value_enum)]
        layout: Option<LayoutArg>,
        /// Abort each walk after reporting this frame
        #[arg(long)]
        abort_at: Option<usize>,
        #[command(flatten)]
        cache: CacheArgs,
    },
    /// Walk one stack from many threads sharing one cache
    Stress
    {
        /// Number of concurrent walkers
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Walks per walker
        #[arg(long, default_value_t = 1000)]
        walks: usize,
        /// Number of frames on the stack
        #[arg(long, default_value_t = 32)]
        depth: usize,
        /// Entry layout (defaults to the native one)
        #[arg(long, value_enum)]
        layout: Option<LayoutArg>,
        /// Milliseconds between invalidation passes (no invalidation if unset)
        #[arg(long)]
        invalidate_every: Option<u64>,
        #[command(flatten)]
        cache: CacheArgs,
    },
}

/// Cache flags; each overrides its environment variable.
#[derive(Args, Debug, Clone)]
struct CacheArgs
{
    /// Disable the stackwalk cache
    #[arg(long, default_value_t = false)]
    no_cache: bool,
    /// Table size as a power of two
    #[arg(long)]
    log2_entries: Option<u32>,
    /// Invalidate only entries inside the unloaded scope
    #[arg(long, default_value_t = false)]
    selective: bool,
}

impl CacheArgs
{
    fn config(&self) -> stackcrawl_core::Result<CacheConfig>
    {
        let mut config = CacheConfig::from_env()?;
        if self.no_cache {
            config.enabled = false;
        }
        if let Some(log2_entries) = self.log2_entries {
            config.log2_entries = log2_entries;
        }
        if self.selective {
            config.invalidation = InvalidationStrategy::Selective;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LayoutArg
{
    /// 32-bit frame-pointer layout
    #[value(name = "a", alias = "frame-pointer")]
    FramePointer,
    /// 64-bit windowed layout
    #[value(name = "b", alias = "windowed")]
    Windowed,
}

impl LayoutArg
{
    fn resolve(arg: Option<Self>) -> Self
    {
        arg.unwrap_or(if NativeLayout::NAME == FramePointerLayout::NAME {
            Self::FramePointer
        } else {
            Self::Windowed
        })
    }
}

/// Method shapes for the demo stacks.
trait DemoLayout: SyntheticLayout
{
    fn method(index: usize) -> SyntheticMethod<Self::Facts>;
}

impl DemoLayout for FramePointerLayout
{
    fn method(index: usize) -> SyntheticMethod<FramePointerFacts>
    {
        let framed = index % 3 != 2;
        // Every seventh method borrows the frame pointer as a scratch register.
        let scratch = index % 7 == 6;
        let facts = FramePointerFacts {
            security_object_offset: if index % 5 == 0 { 4 } else { 0 },
            uses_frame_pointer_reg: framed || scratch,
            frame_pointer_is_frame_reg: framed && !scratch,
        };
        SyntheticMethod::new(facts, 0x10 + 4 * (index % 6) as u64, 4 * (index % 3) as u64)
    }
}

impl DemoLayout for WindowedLayout
{
    #[allow(clippy::cast_possible_truncation)] // index % 4
    fn method(index: usize) -> SyntheticMethod<WindowedFacts>
    {
        let frame = 0x20 + 0x10 * (index % 4) as u32;
        let facts = WindowedFacts {
            stack_pointer_offset: frame,
            frame_pointer_offset: if index % 2 == 0 { frame - 8 } else { 0 },
        };
        // Some frames grew the stack after their prologue.
        let growth = if index % 4 == 3 { 0x40 } else { 0 };
        SyntheticMethod::new(facts, u64::from(frame) + growth, 0)
    }
}

fn build_stack<L: DemoLayout>(depth: usize) -> stackcrawl_core::Result<SyntheticStack<L>>
{
    (0..depth)
        .fold(SyntheticStack::<L>::builder().scope(DEMO_SCOPE), |builder, index| {
            builder.push(L::method(index))
        })
        .build()
}

fn main()
{
    // Initialize logging (reads from RUST_LOG env var)
    // Defaults to INFO level and Pretty format if not set
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let cli = Cli::parse();

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run_command(cli: Cli) -> CliResult<()>
{
    match cli.command {
        Commands::Info { cache } => print_info(&cache.config()?),
        Commands::Walk {
            depth,
            passes,
            layout,
            abort_at,
            cache,
        } => {
            let config = cache.config()?;
            match LayoutArg::resolve(layout) {
                LayoutArg::FramePointer => run_walk::<FramePointerLayout>(depth, passes, abort_at, &config),
                LayoutArg::Windowed => run_walk::<WindowedLayout>(depth, passes, abort_at, &config),
            }
        }
        Commands::Stress {
            threads,
            walks,
            depth,
            layout,
            invalidate_every,
            cache,
        } => {
            let config = cache.config()?;
            let plan = StressPlan {
                threads: threads.max(1),
                walks,
                depth,
                invalidate_every: invalidate_every.map(Duration::from_millis),
            };
            match LayoutArg::resolve(layout) {
                LayoutArg::FramePointer => run_stress::<FramePointerLayout>(&plan, &config),
                LayoutArg::Windowed => run_stress::<WindowedLayout>(&plan, &config),
            }
        }
    }
}

fn print_info(config: &CacheConfig) -> CliResult<()>
{
    let global = cache::init(config)?;

    println!("stackcrawl {}", env!("CARGO_PKG_VERSION"));
    println!("  Native layout: {}", NativeLayout::NAME);
    println!("  Stack slot size: {} bytes", NativeLayout::WORD_SIZE);
    println!("  Cache enabled: {}", global.enabled());
    println!("  Cache slots: {}", global.capacity());
    println!("  Invalidation: {}", global.config().invalidation);
    println!("  Diagnostic attach: {}", global.config().diagnostic_attach);
    println!(
        "  Lock-free slots: {}",
        StackwalkCache::<NativeLayout>::is_lock_free()
    );
    Ok(())
}

fn run_walk<L: DemoLayout>(depth: usize, passes: usize, abort_at: Option<usize>, config: &CacheConfig) -> CliResult<()>
{
    let stack = build_stack::<L>(depth)?;
    let cache = StackwalkCache::<L>::new(config)?;
    info!(layout = L::NAME, depth, passes, "walking synthetic stack");

    println!(
        "Walking {depth} synthetic frames on the {} layout ({} slots, cache {})",
        L::NAME,
        cache.capacity(),
        if cache.enabled() { "enabled" } else { "disabled" }
    );

    let mut stop_at = abort_at;
    for pass in 1..=passes {
        println!("\nPass {pass}:");
        let outcome = stack.walker(&cache).walk(
            stack.start(),
            &WalkOptions::default(),
            |frame, stop_at: &mut Option<usize>| {
                let regs = frame.registers();
                let source = match frame.source() {
                    UnwindSource::Cache => "cache",
                    UnwindSource::Decoder => "decoder",
                };
                println!(
                    "  #{:<4} ip={} sp={} fp={} [{source}]",
                    frame.index(),
                    regs.ip,
                    regs.sp,
                    regs.fp
                );
                if *stop_at == Some(frame.index()) {
                    StackWalkAction::Abort
                } else {
                    StackWalkAction::Continue
                }
            },
            &mut stop_at,
        );
        print_outcome(&outcome);

        if let Some(err) = outcome.error {
            return Err(err.into());
        }
    }

    print_stats(&cache.stats());
    Ok(())
}

fn print_outcome(outcome: &WalkOutcome)
{
    println!(
        "  => {} after {} frames ({} reported, {} from cache, {} decoded)",
        outcome.state, outcome.frames_unwound, outcome.frames_reported, outcome.cache_hits, outcome.decoder_calls
    );
    if let Some(err) = &outcome.error {
        println!("  => error: {err}");
    }
}

fn print_stats(stats: &CacheStats)
{
    println!("\nCache statistics:");
    println!(
        "  Lookups: {} ({} hits, {} empty-slot misses, {} wrong-address misses)",
        stats.lookups(),
        stats.hit_count,
        stats.miss_empty_slot_count,
        stats.miss_wrong_address_count
    );
    println!("  Hit ratio: {:.1}%", stats.hit_ratio() * 100.0);
    println!("  Inserts: {}", stats.insert_count);
    println!("  Unsafe entries bypassed: {}", stats.unsafe_bypass_count);
    println!("  Uncacheable frames: {}", stats.uncacheable_count);
    println!(
        "  Invalidations: {} ({} slots cleared)",
        stats.invalidation_count, stats.slots_cleared_count
    );
}

#[derive(Debug, Clone, Copy)]
struct StressPlan
{
    threads: usize,
    walks: usize,
    depth: usize,
    invalidate_every: Option<Duration>,
}

fn run_stress<L: DemoLayout>(plan: &StressPlan, config: &CacheConfig) -> CliResult<()>
{
    let stack = Arc::new(build_stack::<L>(plan.depth)?);
    let cache = Arc::new(StackwalkCache::<L>::new(config)?);
    info!(layout = L::NAME, ?plan, "starting stress run");

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_time().build()?;
    let started = Instant::now();
    let mismatches = runtime.block_on(stress(Arc::clone(&stack), Arc::clone(&cache), *plan))?;
    let elapsed = started.elapsed();

    let total = plan.threads * plan.walks;
    println!(
        "{total} walks of {} frames on {} threads in {:.2?} ({} layout)",
        plan.depth,
        plan.threads,
        elapsed,
        L::NAME
    );
    print_stats(&cache.stats());

    if mismatches > 0 {
        return Err(format!("{mismatches} of {total} walks did not produce the expected frames").into());
    }
    println!("\nAll walks produced the expected frames.");
    Ok(())
}

/// Run the walkers on the blocking pool, with an optional periodic unloader,
/// and return how many walks went wrong.
async fn stress<L: DemoLayout>(
    stack: Arc<SyntheticStack<L>>,
    cache: Arc<StackwalkCache<L>>,
    plan: StressPlan,
) -> CliResult<usize>
{
    let done = Arc::new(AtomicBool::new(false));

    let unloader = plan.invalidate_every.map(|period| {
        let scope = stack.regions().scope(DEMO_SCOPE);
        let cache = Arc::clone(&cache);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            let mut passes = 0usize;
            loop {
                ticker.tick().await;
                let receipt = cache.invalidate(&scope);
                debug!(slots_cleared = receipt.slots_cleared, "periodic invalidation");
                passes += 1;
                if done.load(Ordering::Acquire) {
                    break passes;
                }
            }
        })
    });

    let mut walkers = JoinSet::new();
    for walker in 0..plan.threads {
        let stack = Arc::clone(&stack);
        let cache = Arc::clone(&cache);
        walkers.spawn_blocking(move || {
            let mismatches = (0..plan.walks).filter(|_| !walk_matches(&stack, &cache)).count();
            debug!(walker, mismatches, "walker finished");
            mismatches
        });
    }

    let mut mismatches = 0;
    while let Some(joined) = walkers.join_next().await {
        mismatches += joined?;
    }

    done.store(true, Ordering::Release);
    if let Some(unloader) = unloader {
        let passes = unloader.await?;
        info!(passes, "unloader stopped");
    }
    Ok(mismatches)
}

fn walk_matches<L: DemoLayout>(stack: &SyntheticStack<L>, cache: &StackwalkCache<L>) -> bool
{
    let mut seen = Vec::with_capacity(stack.expected_frames().len());
    let outcome = stack.walker(cache).walk(
        stack.start(),
        &WalkOptions::default(),
        |frame, seen: &mut Vec<FrameRegisters>| {
            seen.push(*frame.registers());
            StackWalkAction::Continue
        },
        &mut seen,
    );
    outcome.state == WalkState::Done && seen == stack.expected_frames()
}

#[cfg(test)]
mod tests
{
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition()
    {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_walk()
    {
        let cli = Cli::try_parse_from(["stackcrawl", "walk", "--depth", "8", "--layout", "a", "--no-cache"]).unwrap();
        match cli.command {
            Commands::Walk {
                depth, layout, cache, ..
            } => {
                assert_eq!(depth, 8);
                assert_eq!(layout, Some(LayoutArg::FramePointer));
                assert!(cache.no_cache);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_layout_alias()
    {
        let cli = Cli::try_parse_from(["stackcrawl", "stress", "--layout", "windowed"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Stress {
                layout: Some(LayoutArg::Windowed),
                ..
            }
        ));
    }

    #[test]
    fn test_demo_stacks_walk_cleanly()
    {
        let config = CacheConfig::default();

        let stack = build_stack::<FramePointerLayout>(24).unwrap();
        let cache = StackwalkCache::new(&config).unwrap();
        assert!(walk_matches(&stack, &cache));
        assert!(walk_matches(&stack, &cache));

        let stack = build_stack::<WindowedLayout>(24).unwrap();
        let cache = StackwalkCache::new(&config).unwrap();
        assert!(walk_matches(&stack, &cache));
        assert!(walk_matches(&stack, &cache));
        assert!(cache.stats().hit_count > 0);
    }

    #[test]
    fn test_stress_with_unloader()
    {
        let stack = Arc::new(build_stack::<WindowedLayout>(12).unwrap());
        let cache = Arc::new(StackwalkCache::new(&CacheConfig::default()).unwrap());
        let plan = StressPlan {
            threads: 3,
            walks: 50,
            depth: 12,
            invalidate_every: Some(Duration::from_millis(1)),
        };

        let runtime = tokio::runtime::Builder::new_multi_thread().enable_time().build().unwrap();
        let mismatches = runtime.block_on(stress(stack, Arc::clone(&cache), plan)).unwrap();
        assert_eq!(mismatches, 0);
        assert!(cache.stats().invalidation_count > 0);
    }
}
