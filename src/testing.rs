//! Hand-built memory managers for tests.
//!
//! `FakeMemory` places regions at arbitrary addresses with arbitrary bytes,
//! flags and gaps, and demands read permission so the permission-gated
//! validity path is exercised.

use std::path::{Path, PathBuf};

use crate::flags::RegionFlags;
use crate::layout::Layout;
use crate::manager::MemoryManager;
use crate::region::{
    FlaggedRegion, MemoryRegion, NamedRegion, PathedRegion, SharedRegion, ViewableRegion,
};

#[derive(Debug, Clone)]
pub struct FakeRegion {
    address: usize,
    flags: RegionFlags,
    shared: bool,
    name: Option<String>,
    path: Option<PathBuf>,
    bytes: Vec<u8>,
}

impl FakeRegion {
    /// A readable region at `address` holding `bytes`.
    pub fn new(address: usize, bytes: Vec<u8>) -> Self {
        Self {
            address,
            flags: RegionFlags::READ,
            shared: false,
            name: None,
            path: None,
            bytes,
        }
    }

    pub fn with_flags(mut self, flags: RegionFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }
}

impl MemoryRegion for FakeRegion {
    fn address(&self) -> usize {
        self.address
    }

    fn length(&self) -> usize {
        self.bytes.len()
    }
}

impl FlaggedRegion for FakeRegion {
    fn flags(&self) -> RegionFlags {
        self.flags
    }
}

impl NamedRegion for FakeRegion {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl PathedRegion for FakeRegion {
    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl SharedRegion for FakeRegion {
    fn is_shared(&self) -> bool {
        self.shared
    }
}

impl ViewableRegion for FakeRegion {
    fn view(&self) -> &[u8] {
        &self.bytes
    }
}

pub struct FakeMemory {
    layout: Layout<FakeRegion>,
}

impl FakeMemory {
    pub fn new(regions: Vec<FakeRegion>) -> Self {
        Self {
            layout: Layout::new(regions),
        }
    }
}

impl MemoryManager for FakeMemory {
    type Region = FakeRegion;

    const REQUIRES_PERMISSIONS_FOR_READING: bool = true;

    fn layout(&self) -> &Layout<FakeRegion> {
        &self.layout
    }

    fn read(&self, mut address: usize, out: &mut [u8]) -> bool {
        let mut filled = 0;
        while filled < out.len() {
            let Some(region) = self.layout.find_region(address) else {
                return false;
            };
            let offset = address - region.address;
            let take = (region.bytes.len() - offset).min(out.len() - filled);
            out[filled..filled + take].copy_from_slice(&region.bytes[offset..offset + take]);
            filled += take;
            address += take;
        }
        true
    }

    fn region_is_readable(&self, region: &FakeRegion) -> bool {
        region.flags.is_readable()
    }
}
