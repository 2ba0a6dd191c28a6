//! # Code Regions
//!
//! Locating the jitted method that owns an instruction pointer.
//!
//! The walker resolves every frame's IP to a [`MethodToken`]: the code region
//! that contains the IP plus the method's code header inside that region.
//! Holding on to the region reference means later queries about the same
//! frame (decoding, reporting) never pay for a second range search.
//!
//! Region lookup is an external concern; [`CodeRegions`] is the seam. The
//! [`RangeSectionMap`] implementation here is a plain sorted table used by the
//! synthetic stack and the command-line front end.

use std::fmt;
use std::ops::Range;

use smallvec::SmallVec;
use tracing::debug;

use crate::cache::{Invalidation, StackwalkCache};
use crate::error::{Result, StackcrawlError};
use crate::layout::FrameLayout;
use crate::types::Address;

/// Identifier of a code-unload scope (a collectible loader context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId
{
    /// Create a new identifier from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self
    {
        Self(value)
    }

    /// Get the raw numeric representation (useful for logging / errors).
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

impl fmt::Display for ScopeId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "scope#{}", self.0)
    }
}

/// One method's code inside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodRange
{
    /// First byte of the method's code.
    pub start: Address,
    /// One past the last byte of the method's code.
    pub end: Address,
    /// Address of the method's code header.
    pub code_header: Address,
}

/// A contiguous block of jitted code owned by a single unload scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSection
{
    start: Address,
    end: Address,
    scope: ScopeId,
    methods: Vec<MethodRange>,
}

impl RangeSection
{
    /// Create an empty region covering `[start, end)`.
    pub fn new(start: Address, end: Address, scope: ScopeId) -> Self
    {
        Self {
            start,
            end,
            scope,
            methods: Vec::new(),
        }
    }

    /// Register a method inside this region. Methods are kept sorted by start.
    ///
    /// ## Errors
    ///
    /// Returns [`StackcrawlError::RegionOverlap`] if the method leaves the
    /// region or overlaps a method already registered.
    pub fn add_method(&mut self, method: MethodRange) -> Result<()>
    {
        if method.start < self.start || method.end > self.end || method.start >= method.end {
            return Err(StackcrawlError::RegionOverlap(method.start));
        }

        let index = self.methods.partition_point(|existing| existing.start < method.start);
        let clashes_prev = index > 0 && self.methods[index - 1].end > method.start;
        let clashes_next = self.methods.get(index).is_some_and(|next| next.start < method.end);
        if clashes_prev || clashes_next {
            return Err(StackcrawlError::RegionOverlap(method.start));
        }

        self.methods.insert(index, method);
        Ok(())
    }

    /// Address range covered by this region.
    pub fn range(&self) -> Range<Address>
    {
        self.start..self.end
    }

    /// Scope that owns the region's memory.
    pub fn scope(&self) -> ScopeId
    {
        self.scope
    }

    /// Returns `true` if `ip` falls inside this region.
    pub fn contains(&self, ip: Address) -> bool
    {
        self.range().contains(&ip)
    }

    /// Find the code header of the method containing `ip`.
    pub fn code_header_for(&self, ip: Address) -> Option<Address>
    {
        let index = self.methods.partition_point(|method| method.start <= ip);
        let method = self.methods.get(index.checked_sub(1)?)?;
        (ip < method.end).then_some(method.code_header)
    }

    /// Methods registered in this region, sorted by start address.
    pub fn methods(&self) -> &[MethodRange]
    {
        &self.methods
    }
}

/// Opaque handle to the method owning an instruction pointer.
///
/// Pairs the region found by the first lookup with the method's code header.
/// It carries no ownership and is cheap to copy; a token with a null code
/// header means "no method found".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodToken<'a>
{
    section: Option<&'a RangeSection>,
    code_header: Address,
}

impl<'a> MethodToken<'a>
{
    /// Token for a method found inside `section`.
    pub fn new(section: &'a RangeSection, code_header: Address) -> Self
    {
        Self {
            section: Some(section),
            code_header,
        }
    }

    /// Token denoting "no method found".
    pub const fn null() -> Self
    {
        Self {
            section: None,
            code_header: Address::ZERO,
        }
    }

    /// Returns `true` if no code location was found.
    pub const fn is_null(&self) -> bool
    {
        self.code_header.is_null()
    }

    /// Region the method lives in.
    pub fn section(&self) -> Option<&'a RangeSection>
    {
        self.section
    }

    /// The method's code header.
    pub fn code_header(&self) -> Address
    {
        self.code_header
    }
}

/// Region lookup consumed by the walker.
pub trait CodeRegions
{
    /// Find the region containing `ip`, if any.
    fn locate_region(&self, ip: Address) -> Option<&RangeSection>;

    /// Resolve `ip` to a method token, or [`MethodToken::null`] when no method
    /// owns it.
    fn method_token(&self, ip: Address) -> MethodToken<'_>
    {
        self.locate_region(ip)
            .and_then(|section| section.code_header_for(ip).map(|header| MethodToken::new(section, header)))
            .unwrap_or_default()
    }
}

/// Address ranges whose code is about to be released.
///
/// Handed to [`StackwalkCache::invalidate`] so it can drop every entry that
/// could still match an IP inside the released memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeScope
{
    id: ScopeId,
    ranges: SmallVec<[Range<Address>; 4]>,
}

impl CodeScope
{
    /// A scope with no ranges yet.
    pub fn new(id: ScopeId) -> Self
    {
        Self {
            id,
            ranges: SmallVec::new(),
        }
    }

    /// Add a range of code owned by this scope.
    #[must_use]
    pub fn with_range(mut self, range: Range<Address>) -> Self
    {
        self.ranges.push(range);
        self
    }

    /// The scope identifier.
    pub fn id(&self) -> ScopeId
    {
        self.id
    }

    /// Ranges owned by this scope.
    pub fn ranges(&self) -> &[Range<Address>]
    {
        &self.ranges
    }

    /// Returns `true` if `ip` lies in any of the scope's ranges.
    pub fn contains(&self, ip: Address) -> bool
    {
        self.ranges.iter().any(|range| range.contains(&ip))
    }
}

/// Sorted, non-overlapping table of code regions.
#[derive(Debug, Default, Clone)]
pub struct RangeSectionMap
{
    sections: Vec<RangeSection>,
}

impl RangeSectionMap
{
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self
    {
        Self { sections: Vec::new() }
    }

    /// Register a region.
    ///
    /// ## Errors
    ///
    /// Returns [`StackcrawlError::RegionOverlap`] if the region is empty or
    /// intersects one already registered.
    pub fn insert(&mut self, section: RangeSection) -> Result<()>
    {
        if section.start >= section.end {
            return Err(StackcrawlError::RegionOverlap(section.start));
        }

        let index = self.sections.partition_point(|existing| existing.start < section.start);
        let clashes_prev = index > 0 && self.sections[index - 1].end > section.start;
        let clashes_next = self.sections.get(index).is_some_and(|next| next.start < section.end);
        if clashes_prev || clashes_next {
            return Err(StackcrawlError::RegionOverlap(section.start));
        }

        self.sections.insert(index, section);
        Ok(())
    }

    /// Describe everything `scope` owns, for invalidation.
    pub fn scope(&self, scope: ScopeId) -> CodeScope
    {
        self.sections
            .iter()
            .filter(|section| section.scope == scope)
            .fold(CodeScope::new(scope), |acc, section| acc.with_range(section.range()))
    }

    /// Unload every region owned by `scope`.
    ///
    /// The cache is invalidated first; the regions are only dropped once the
    /// invalidation receipt is in hand, so no walker can hit a stale entry
    /// pointing into memory that is about to be reused.
    pub fn unload<L: FrameLayout>(&mut self, scope: ScopeId, cache: &StackwalkCache<L>) -> Invalidation
    {
        let code = self.scope(scope);
        let receipt = cache.invalidate(&code);
        let before = self.sections.len();
        self.sections.retain(|section| section.scope != scope);
        debug!(
            %scope,
            regions = before - self.sections.len(),
            slots_cleared = receipt.slots_cleared,
            "unloaded code scope"
        );
        receipt
    }

    /// Number of registered regions.
    pub fn len(&self) -> usize
    {
        self.sections.len()
    }

    /// Returns `true` if no regions are registered.
    pub fn is_empty(&self) -> bool
    {
        self.sections.is_empty()
    }
}

impl CodeRegions for RangeSectionMap
{
    fn locate_region(&self, ip: Address) -> Option<&RangeSection>
    {
        let index = self.sections.partition_point(|section| section.start <= ip);
        let section = self.sections.get(index.checked_sub(1)?)?;
        section.contains(ip).then_some(section)
    }
}
