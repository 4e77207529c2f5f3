//! Composable restrictions on which regions and addresses a search may touch.

use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::rc::Rc;

use crate::flags::FlagSpecification;
use crate::region::{FlaggedRegion, MemoryRegion, NamedRegion, PathedRegion, SharedRegion};

pub type RegionPredicate<R> = dyn Fn(&R) -> bool;

/// A reusable bundle of region predicates plus an address window.
///
/// Builder methods are additive and return the builder; predicates are
/// evaluated in insertion order. Methods touching an optional region
/// attribute only exist when the region type has that attribute, so asking a
/// flag question about a flag-less region is a compile error rather than a
/// runtime surprise.
///
/// Flag and sharing requirements are kept as plain fields (last write per
/// axis wins) and lowered into attribute checks when set; `allows_region`
/// stays uniform over every region type.
pub struct SearchConstraints<R: MemoryRegion> {
    predicates: Vec<Rc<RegionPredicate<R>>>,
    address_range: (usize, usize),
    flags: FlagSpecification,
    flags_check: Option<Rc<RegionPredicate<R>>>,
    shared_check: Option<Rc<RegionPredicate<R>>>,
}

impl<R: MemoryRegion> SearchConstraints<R> {
    /// A constraint set that admits every region and address.
    pub fn everything() -> Self {
        Self {
            predicates: Vec::new(),
            address_range: (usize::MIN, usize::MAX),
            flags: FlagSpecification::ANY,
            flags_check: None,
            shared_check: None,
        }
    }

    /// Half-open `[from, to)` window the constraints admit.
    pub fn address_range(&self) -> (usize, usize) {
        self.address_range
    }

    /// Narrows the lower bound, dragging the upper bound along so that
    /// `from <= to` always holds.
    pub fn from(mut self, address: usize) -> Self {
        self.address_range.0 = address;
        self.address_range.1 = self.address_range.1.max(address);
        self
    }

    /// Narrows the upper bound; counterpart of [`from`](Self::from).
    pub fn to(mut self, address: usize) -> Self {
        self.address_range.1 = address;
        self.address_range.0 = self.address_range.0.min(address);
        self
    }

    /// Adds an arbitrary region predicate.
    pub fn also(mut self, predicate: impl Fn(&R) -> bool + 'static) -> Self {
        self.predicates.push(Rc::new(predicate));
        self
    }

    /// Whether `address` lies inside the window. Region predicates are not
    /// consulted.
    pub fn allows_address(&self, address: usize) -> bool {
        address >= self.address_range.0 && address < self.address_range.1
    }

    /// Whether the region passes every predicate, overlaps the window and
    /// satisfies the flag and sharing requirements.
    pub fn allows_region(&self, region: &R) -> bool {
        for predicate in &self.predicates {
            if !predicate(region) {
                return false;
            }
        }

        if self.address_range.0 > region.end() || self.address_range.1 < region.address() {
            return false;
        }

        if let Some(check) = &self.flags_check {
            if !check(region) {
                return false;
            }
        }

        if let Some(check) = &self.shared_check {
            if !check(region) {
                return false;
            }
        }

        true
    }

    /// Narrows a range of view offsets to the address window. `base` is the
    /// address of offset zero. The result never widens `bounds`, and an empty
    /// window yields an empty range.
    pub fn clamp_to_range(&self, base: usize, bounds: Range<usize>) -> Range<usize> {
        let (from, to) = self.address_range;
        let start = from.saturating_sub(base).clamp(bounds.start, bounds.end);
        let end = to.saturating_sub(base).min(bounds.end).max(start);
        start..end
    }
}

impl<R: NamedRegion> SearchConstraints<R> {
    /// Keeps regions whose name matches `name` exactly.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.also(move |region: &R| region.name() == Some(name.as_str()))
    }
}

impl<R: PathedRegion> SearchConstraints<R> {
    /// Keeps regions backed by exactly `path`.
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.also(move |region: &R| region.path() == Some(path.as_path()))
    }
}

impl<R: FlaggedRegion> SearchConstraints<R> {
    /// Replaces the permission requirement with `specification`.
    pub fn with_flags(mut self, specification: impl Into<FlagSpecification>) -> Self {
        self.flags = specification.into();
        self.sync_flags_check()
    }

    pub fn thats_readable(mut self) -> Self {
        self.flags.readable = Some(true);
        self.sync_flags_check()
    }

    pub fn thats_not_readable(mut self) -> Self {
        self.flags.readable = Some(false);
        self.sync_flags_check()
    }

    pub fn thats_writable(mut self) -> Self {
        self.flags.writable = Some(true);
        self.sync_flags_check()
    }

    pub fn thats_not_writable(mut self) -> Self {
        self.flags.writable = Some(false);
        self.sync_flags_check()
    }

    pub fn thats_executable(mut self) -> Self {
        self.flags.executable = Some(true);
        self.sync_flags_check()
    }

    pub fn thats_not_executable(mut self) -> Self {
        self.flags.executable = Some(false);
        self.sync_flags_check()
    }

    fn sync_flags_check(mut self) -> Self {
        let specification = self.flags;
        self.flags_check = Some(Rc::new(move |region: &R| {
            specification.allows(region.flags())
        }));
        self
    }
}

impl<R: SharedRegion> SearchConstraints<R> {
    pub fn thats_shared(self) -> Self {
        self.require_sharing(true)
    }

    pub fn thats_private(self) -> Self {
        self.require_sharing(false)
    }

    fn require_sharing(mut self, shared: bool) -> Self {
        self.shared_check = Some(Rc::new(move |region: &R| region.is_shared() == shared));
        self
    }
}

impl<R: MemoryRegion> Default for SearchConstraints<R> {
    fn default() -> Self {
        Self::everything()
    }
}

impl<R: MemoryRegion> Clone for SearchConstraints<R> {
    fn clone(&self) -> Self {
        Self {
            predicates: self.predicates.clone(),
            address_range: self.address_range,
            flags: self.flags,
            flags_check: self.flags_check.clone(),
            shared_check: self.shared_check.clone(),
        }
    }
}

impl<R: MemoryRegion> fmt::Debug for SearchConstraints<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchConstraints")
            .field("predicates", &self.predicates.len())
            .field("address_range", &self.address_range)
            .field("flags", &self.flags)
            .finish()
    }
}
