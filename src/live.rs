//! The uncached, remote-style memory manager.
//!
//! Keeps only region metadata; every read goes through a positioned read on
//! `/proc/<pid>/mem`. Regions carry no byte view, so pattern and
//! cross-reference searches against this manager do not compile — reads,
//! arithmetic and region filters work as usual.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use procfs::process::{MMPermissions, Process};
use tracing::debug;

use crate::flags::RegionFlags;
use crate::layout::Layout;
use crate::manager::MemoryManager;
use crate::region::{FlaggedRegion, MemoryRegion, NamedRegion, PathedRegion, SharedRegion};
use crate::snapshot::{describe, SnapshotError};

/// Region metadata without a cached byte image.
#[derive(Debug)]
pub struct MappedRegion {
    address: usize,
    length: usize,
    flags: RegionFlags,
    shared: bool,
    name: Option<String>,
    path: Option<PathBuf>,
}

impl MemoryRegion for MappedRegion {
    fn address(&self) -> usize {
        self.address
    }

    fn length(&self) -> usize {
        self.length
    }
}

impl FlaggedRegion for MappedRegion {
    fn flags(&self) -> RegionFlags {
        self.flags
    }
}

impl NamedRegion for MappedRegion {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl PathedRegion for MappedRegion {
    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl SharedRegion for MappedRegion {
    fn is_shared(&self) -> bool {
        self.shared
    }
}

/// A live view of another process's memory.
pub struct LiveProcess {
    pid: i32,
    mem: File,
    layout: Layout<MappedRegion>,
}

impl LiveProcess {
    pub fn current() -> Result<Self, SnapshotError> {
        Self::from_process(&Process::myself()?)
    }

    pub fn attach(pid: i32) -> Result<Self, SnapshotError> {
        Self::from_process(&Process::new(pid)?)
    }

    pub fn from_process(process: &Process) -> Result<Self, SnapshotError> {
        Ok(Self {
            pid: process.pid,
            mem: process.mem()?,
            layout: Self::enumerate(process)?,
        })
    }

    /// Re-enumerates the mappings. Reads are live anyway; only the layout
    /// needs refreshing after the target maps or unmaps something.
    pub fn refresh(&mut self) -> Result<(), SnapshotError> {
        let process = Process::new(self.pid)?;
        self.layout = Self::enumerate(&process)?;
        Ok(())
    }

    fn enumerate(process: &Process) -> Result<Layout<MappedRegion>, SnapshotError> {
        let maps = process.maps()?;

        let mut regions = Vec::new();
        for map in &maps {
            let (name, path) = describe(&map.pathname);
            regions.push(MappedRegion {
                address: map.address.0 as usize,
                length: (map.address.1 - map.address.0) as usize,
                flags: live_flags(map.perms),
                shared: map.perms.contains(MMPermissions::SHARED),
                name,
                path,
            });
        }

        debug!(pid = process.pid, regions = regions.len(), "enumerated live mappings");
        Ok(Layout::new(regions))
    }
}

impl MemoryManager for LiveProcess {
    type Region = MappedRegion;

    const REQUIRES_PERMISSIONS_FOR_READING: bool = true;

    fn layout(&self) -> &Layout<MappedRegion> {
        &self.layout
    }

    fn read(&self, address: usize, out: &mut [u8]) -> bool {
        self.mem.read_exact_at(out, address as u64).is_ok()
    }

    fn region_is_readable(&self, region: &MappedRegion) -> bool {
        region.flags.is_readable()
    }
}

fn live_flags(perms: MMPermissions) -> RegionFlags {
    let mut flags = RegionFlags::empty();
    if perms.contains(MMPermissions::READ) {
        flags |= RegionFlags::READ;
    }
    if perms.contains(MMPermissions::WRITE) {
        flags |= RegionFlags::WRITE;
    }
    if perms.contains(MMPermissions::EXECUTE) {
        flags |= RegionFlags::EXECUTE;
    }
    flags
}
