//! The cached, local-style memory manager.
//!
//! Enumerates `/proc/<pid>/maps`, slurps the bytes of every captured mapping
//! through `/proc/<pid>/mem` once, and serves all reads from that image.
//! Reads against the cache cannot fault, so validity walks skip the
//! permission check.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use procfs::process::{MMPermissions, MMapPath, Process};
use procfs::ProcError;
use thiserror::Error;
use tracing::{debug, trace};

use crate::flags::RegionFlags;
use crate::layout::Layout;
use crate::manager::MemoryManager;
use crate::region::{
    FlaggedRegion, MemoryRegion, NamedRegion, PathedRegion, SharedRegion, ViewableRegion,
};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to inspect the process: {0}")]
    Proc(#[from] ProcError),
    #[error("failed to read process memory: {0}")]
    Io(#[from] std::io::Error),
}

/// One captured mapping: metadata plus its byte image.
#[derive(Debug)]
pub struct SnapshotRegion {
    address: usize,
    flags: RegionFlags,
    shared: bool,
    name: Option<String>,
    path: Option<PathBuf>,
    bytes: Box<[u8]>,
}

impl MemoryRegion for SnapshotRegion {
    fn address(&self) -> usize {
        self.address
    }

    fn length(&self) -> usize {
        self.bytes.len()
    }
}

impl FlaggedRegion for SnapshotRegion {
    fn flags(&self) -> RegionFlags {
        self.flags
    }
}

impl NamedRegion for SnapshotRegion {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl PathedRegion for SnapshotRegion {
    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl SharedRegion for SnapshotRegion {
    fn is_shared(&self) -> bool {
        self.shared
    }
}

impl ViewableRegion for SnapshotRegion {
    fn view(&self) -> &[u8] {
        &self.bytes
    }
}

/// A frozen image of a process's readable memory.
#[derive(Debug)]
pub struct ProcessSnapshot {
    pid: i32,
    capture_anonymous: bool,
    layout: Layout<SnapshotRegion>,
}

impl ProcessSnapshot {
    /// Snapshots the calling process.
    pub fn current() -> Result<Self, SnapshotError> {
        Self::from_process(&Process::myself()?, true)
    }

    /// Snapshots another process by pid.
    pub fn attach(pid: i32) -> Result<Self, SnapshotError> {
        Self::from_process(&Process::new(pid)?, true)
    }

    /// Snapshots `process`. With `capture_anonymous` unset, mappings not
    /// backed by a device (heap, stacks, arenas) are skipped, which shrinks
    /// the image considerably for file-oriented searches.
    pub fn from_process(process: &Process, capture_anonymous: bool) -> Result<Self, SnapshotError> {
        Ok(Self {
            pid: process.pid,
            capture_anonymous,
            layout: Self::capture(process, capture_anonymous)?,
        })
    }

    /// Replaces the snapshot with a fresh one. Sessions referencing the old
    /// snapshot must have been dropped; the borrow checker enforces that.
    pub fn refresh(&mut self) -> Result<(), SnapshotError> {
        let process = Process::new(self.pid)?;
        self.layout = Self::capture(&process, self.capture_anonymous)?;
        Ok(())
    }

    fn capture(
        process: &Process,
        capture_anonymous: bool,
    ) -> Result<Layout<SnapshotRegion>, SnapshotError> {
        let maps = process.maps()?;
        let mem: File = process.mem()?;

        let mut regions = Vec::new();
        for map in &maps {
            if !capture_anonymous && map.dev.0 == 0 {
                continue;
            }

            let length = (map.address.1 - map.address.0) as usize;
            let mut bytes = vec![0u8; length];
            match mem.read_at(&mut bytes, map.address.0) {
                Ok(read) if read == length => {}
                _ => {
                    trace!(address = map.address.0, "mapping not captured");
                    continue;
                }
            }

            let (name, path) = describe(&map.pathname);
            regions.push(SnapshotRegion {
                address: map.address.0 as usize,
                flags: permission_flags(map.perms),
                shared: map.perms.contains(MMPermissions::SHARED),
                name,
                path,
                bytes: bytes.into_boxed_slice(),
            });
        }

        debug!(pid = process.pid, regions = regions.len(), "captured memory snapshot");
        Ok(Layout::new(regions))
    }
}

impl MemoryManager for ProcessSnapshot {
    type Region = SnapshotRegion;

    const REQUIRES_PERMISSIONS_FOR_READING: bool = false;

    fn layout(&self) -> &Layout<SnapshotRegion> {
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
}

fn permission_flags(perms: MMPermissions) -> RegionFlags {
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

pub(crate) fn describe(pathname: &MMapPath) -> (Option<String>, Option<PathBuf>) {
    match pathname {
        MMapPath::Path(path) => (
            path.file_name()
                .and_then(|name| name.to_str())
                .map(String::from),
            Some(path.clone()),
        ),
        MMapPath::Heap => (Some("[heap]".into()), None),
        MMapPath::Stack => (Some("[stack]".into()), None),
        MMapPath::Vdso => (Some("[vdso]".into()), None),
        MMapPath::Vvar => (Some("[vvar]".into()), None),
        MMapPath::Vsyscall => (Some("[vsyscall]".into()), None),
        MMapPath::Anonymous => (None, None),
        MMapPath::Other(label) => (
            Some(label.split('/').last().unwrap_or(label.as_str()).to_string()),
            None,
        ),
        _ => (None, None),
    }
}
