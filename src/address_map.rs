//! The sparse address map: an ordered list of `(base, length, mem_or_path)`
//! regions and the read-demux that answers an arbitrary `(offset, len)`
//! block read against them (spec §4.2).
//!
//! Grounded on `original_source/address.c` (`add_address_region`) and the
//! overlap/zero-fill arithmetic in `vsfat.c`'s `xmp_read`.

use std::cell::RefCell;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use io_at::ReadAt;

/// A RAM-backed region's storage while the image is still being built.
/// Shared via `Rc<RefCell<_>>` because the FAT table and directory
/// clusters keep being written to after they've already been registered
/// (a directory's first cluster is mapped the moment it's allocated, then
/// filled in as entries are appended).
pub type BuildBuffer = Rc<RefCell<Vec<u8>>>;

enum BuildData {
    Mem(BuildBuffer),
    File(PathBuf),
}

struct BuildRegion {
    base: u64,
    length: u64,
    data: BuildData,
}

/// Accumulates address regions while an image is under construction.
#[derive(Default)]
pub struct BuildAddressMap {
    regions: Vec<BuildRegion>,
}

impl BuildAddressMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a RAM-backed region. `base`/`length` describe where it sits
    /// on the synthetic disk; `mem`'s *current* length must already be
    /// `length` bytes (later in-place writes to `mem` are reflected by
    /// `freeze`, but its size must not change after registration).
    pub fn add_mem(&mut self, base: u64, length: u64, mem: BuildBuffer) {
        debug_assert!(length > 0);
        self.regions.push(BuildRegion { base, length, data: BuildData::Mem(mem) });
    }

    /// Register a region backed by `size` bytes of `host_path`, starting at
    /// the file's own offset 0.
    pub fn add_file(&mut self, base: u64, length: u64, host_path: impl Into<PathBuf>) {
        debug_assert!(length > 0);
        self.regions.push(BuildRegion { base, length, data: BuildData::File(host_path.into()) });
    }

    /// Freeze into an immutable, `Send + Sync` snapshot. RAM regions are
    /// copied out of their `Rc<RefCell<_>>` cells into `Arc<[u8]>`; no
    /// further mutation of the image is possible after this point (spec §5).
    pub fn freeze(self) -> FrozenAddressMap {
        let regions = self
            .regions
            .into_iter()
            .map(|r| FrozenRegion {
                base: r.base,
                length: r.length,
                data: match r.data {
                    BuildData::Mem(buf) => FrozenData::Mem(Arc::from(buf.borrow().as_slice())),
                    BuildData::File(path) => FrozenData::File(path),
                },
            })
            .collect();
        FrozenAddressMap { regions }
    }
}

enum FrozenData {
    Mem(Arc<[u8]>),
    File(PathBuf),
}

struct FrozenRegion {
    base: u64,
    length: u64,
    data: FrozenData,
}

/// The immutable, query-only form of the address map used by the block
/// backend. O(R) per read, per spec §4.2 — region counts are in the low
/// thousands in practice, which was judged not to warrant an interval tree.
#[derive(Default)]
pub struct FrozenAddressMap {
    regions: Vec<FrozenRegion>,
}

impl FrozenAddressMap {
    /// Read `len` bytes starting at `offset`. Always succeeds: gaps and
    /// unreadable host files are filled with zeros (spec §4.2/§7).
    pub fn read(&self, offset: u64, len: u32) -> Vec<u8> {
        let mut out = vec![0u8; len as usize];
        let want_end = offset.saturating_add(len as u64);

        for region in &self.regions {
            if len == 0 {
                break;
            }
            let region_end = region.base + region.length;
            let overlaps = offset < region_end && want_end > region.base;
            if !overlaps {
                continue;
            }

            let copy_start = offset.max(region.base);
            let copy_end = want_end.min(region_end);
            if copy_end <= copy_start {
                continue;
            }

            let out_pos = (copy_start - offset) as usize;
            let region_pos = copy_start - region.base;
            let copy_len = (copy_end - copy_start) as usize;

            match &region.data {
                FrozenData::Mem(buf) => {
                    let src = &buf[region_pos as usize..region_pos as usize + copy_len];
                    out[out_pos..out_pos + copy_len].copy_from_slice(src);
                }
                FrozenData::File(path) => {
                    if let Err(e) = read_file_region(path, region_pos, &mut out[out_pos..out_pos + copy_len]) {
                        log::warn!("host I/O error reading {}: {e}; zero-filling", path.display());
                    }
                }
            }
        }

        out
    }
}

/// Open, read, and close a per-call handle — no file cursor is shared
/// across reads (spec §5). `ReadAt::read_at` only promises *a* byte
/// count, not that `buf` is filled in one call (the teacher's own
/// `lib.rs` flags this), so short reads are retried at the advanced
/// offset until `buf` is full or the file is exhausted.
fn read_file_region(path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let file = std::fs::File::open(path)?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(())
}
