//! Ties every other module together: MBR, boot sector (+ backup),
//! FSInfo, FAT initialization, and the directory tree, then freezes
//! everything into an immutable [`Image`] (spec §4, §6).
//!
//! Grounded byte-for-byte on `original_source/setup.c` (`build_mbr`,
//! `build_boot_sector`, `build_fats`) — same boot code, same partition
//! table bytes, same FSInfo signature constants — generalized per
//! Design Note 9 to consolidate the source's globals (`bootentry`,
//! `fat`, `current_fat_position`, `current_dir`, `address_regions`)
//! into one owned value.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use crate::address_map::{BuildAddressMap, FrozenAddressMap};
use crate::dir::{DirBuilder, DirTree};
use crate::error::{ScanError, VsfatError};
use crate::fat::{FatAllocator, FatTable};
use crate::geometry::Geometry;
use crate::scanner;

/// Same boot code `original_source/setup.c`'s `build_mbr` embeds: a
/// tiny real-mode loader that prints "boot error" and halts if this
/// disk is ever actually booted from (it is not meant to be).
const MBR_BOOT_CODE: [u8; 76] = [
    0xFA, 0xB8, 0x00, 0x10, 0x8E, 0xD0, 0xBC, 0x00, 0xB0, 0xB8, 0x00, 0x00,
    0x8E, 0xD8, 0x8E, 0xC0, 0xFB, 0xBE, 0x00, 0x7C, 0xBF, 0x00, 0x06, 0xB9, 0x00, 0x02, 0xF3, 0xA4,
    0xEA, 0x21, 0x06, 0x00, 0x00, 0xBE, 0xBE, 0x07, 0x38, 0x04, 0x75, 0x0B, 0x83, 0xC6, 0x10, 0x81,
    0xFE, 0xFE, 0x07, 0x75, 0xF3, 0xEB, 0x16, 0xB4, 0x02, 0xB0, 0x01, 0xBB, 0x00, 0x7C, 0xB2, 0x80,
    0x8A, 0x74, 0x01, 0x8B, 0x4C, 0x02, 0xCD, 0x13, 0xEA, 0x00, 0x7C, 0x00, 0x00, 0xEB, 0xFE, 0x00,
];
const MBR_SERIAL: [u8; 4] = [0xDE, 0xAB, 0xBE, 0xEF];
/// The single partition entry the source hardcodes: type 0x0C (FAT32 LBA),
/// starting at LBA 0x800 (sector 2048, i.e. `Geometry::PART1_BASE` / 512).
const MBR_PARTITION0: [u8; 16] = [
    0x00, 0x20, 0x21, 0x00, 0x0c, 0xcd, 0xfb, 0xd2, 0x00, 0x08, 0x00, 0x00,
    0x00, 0xf8, 0xdf, 0xff,
];

const FSI_LEAD_SIG: u32 = 0x4161_5252;
const FSI_STRUC_SIG: u32 = 0x6141_7272;
const FSI_TRAIL_SIG: u32 = 0xAAAA_5555;

/// A synthetic FAT32 disk image under construction.
pub struct ImageBuilder {
    geometry: Geometry,
    fat: FatTable,
    alloc: FatAllocator,
    addr: BuildAddressMap,
    tree: DirTree,
}

impl ImageBuilder {
    /// Build the MBR, boot sector (+ backup), FSInfo sector, and both
    /// FAT copies, leaving the root directory ready for entries.
    /// Mirrors `main`'s `build_mbr`/`build_boot_sector`/`build_fats`/
    /// `build_root_dir` sequence.
    pub fn new(geometry: Geometry) -> Self {
        let fat = FatTable::new(geometry.fat_entry_count());
        let mut addr = BuildAddressMap::new();

        Self::build_mbr(&mut addr, &geometry);
        Self::build_boot_sector(&mut addr, &geometry);
        Self::build_fsinfo(&mut addr, &geometry);
        Self::build_fats(&mut addr, &geometry, &fat);

        let tree = DirTree::new(geometry.root_dir_loc());
        ImageBuilder { geometry, fat, alloc: FatAllocator::new(), addr, tree }
    }

    fn build_mbr(addr: &mut BuildAddressMap, geometry: &Geometry) {
        let mut mbr = vec![0u8; 512];
        mbr[0..MBR_BOOT_CODE.len()].copy_from_slice(&MBR_BOOT_CODE);
        mbr[440..444].copy_from_slice(&MBR_SERIAL);
        mbr[446..462].copy_from_slice(&MBR_PARTITION0);
        // Overwrite the partition's sector count (offset 446+12) with the
        // actual size for this geometry, matching `build_boot_sector`'s
        // `memcpy(mbr + 458, &PartSize, 4)`.
        mbr[458..462].copy_from_slice(&geometry.total_sectors().to_le_bytes());
        mbr[510..512].copy_from_slice(&[0x55, 0xAA]);
        addr.add_mem(0, 512, Rc::new(RefCell::new(mbr)));
    }

    fn build_boot_sector(addr: &mut BuildAddressMap, g: &Geometry) {
        let mut bs = vec![0u8; 512];
        bs[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
        bs[3..11].copy_from_slice(b"VSFAT1.0");
        bs[11..13].copy_from_slice(&(g.bytes_per_sector as u16).to_le_bytes());
        bs[13] = g.sectors_per_cluster as u8;
        bs[14..16].copy_from_slice(&(g.reserved_sectors as u16).to_le_bytes());
        bs[16] = g.num_fats as u8;
        // BPB_RootEntCnt, BPB_TotSec16, BPB_FATSz16, BPB_HiddSec: always 0.
        bs[21] = 0xF8; // BPB_Media
        bs[24..26].copy_from_slice(&32u16.to_le_bytes()); // BPB_SecPerTrk
        bs[26..28].copy_from_slice(&64u16.to_le_bytes()); // BPB_NumHeads
        bs[36..40].copy_from_slice(&g.fat_size_sectors.to_le_bytes()); // BPB_FATSz32
        bs[44..48].copy_from_slice(&g.root_dir_loc().to_le_bytes()); // BPB_RootClus
        bs[48..50].copy_from_slice(&1u16.to_le_bytes()); // BPB_FSInfo
        bs[50..52].copy_from_slice(&6u16.to_le_bytes()); // BPB_BkBootSec
        bs[64] = 128; // BS_DrvNum
        bs[66] = 29; // BS_BootSig
        bs[67..71].copy_from_slice(&0x8456_f237u32.to_le_bytes()); // BS_VolID
        bs[71..82].copy_from_slice(b"VSFATFS    "); // BS_VolLab, 11 bytes
        bs[82..90].copy_from_slice(b"FAT32   "); // BS_FilSysType, 8 bytes
        bs[510..512].copy_from_slice(&[0x55, 0xAA]);

        bs[32..36].copy_from_slice(&g.total_sectors().to_le_bytes()); // BPB_TotSec32

        addr.add_mem(g.part1_base, 512, Rc::new(RefCell::new(bs.clone())));
        let backup_offset = g.part1_base + 6 * g.bytes_per_sector as u64;
        addr.add_mem(backup_offset, 512, Rc::new(RefCell::new(bs)));
    }

    fn build_fsinfo(addr: &mut BuildAddressMap, g: &Geometry) {
        let mut fsi = vec![0u8; 512];
        fsi[0..4].copy_from_slice(&FSI_LEAD_SIG.to_le_bytes());
        fsi[484..488].copy_from_slice(&FSI_STRUC_SIG.to_le_bytes());
        // FSI_Free_Count / FSI_Nxt_Free: left at 0 (spec §9 Open Question (b)
        // — free-cluster accounting is out of scope).
        fsi[508..512].copy_from_slice(&FSI_TRAIL_SIG.to_le_bytes());
        addr.add_mem(g.part1_base + g.bytes_per_sector as u64, 512, Rc::new(RefCell::new(fsi)));
    }

    fn build_fats(addr: &mut BuildAddressMap, g: &Geometry, fat: &FatTable) {
        let buffer = fat.buffer();
        let length = g.fat_size_sectors as u64 * g.bytes_per_sector as u64;
        for fatnum in 0..g.num_fats {
            addr.add_mem(
                g.address_from_fatsec(g.fat_location(fatnum)),
                length,
                buffer.clone(),
            );
        }
    }

    /// Populate the tree from a host directory, in the same pre-order
    /// traversal as `scan_folder`. Per-entry failures are logged and
    /// skipped; only a directory open failure on the root itself aborts.
    pub fn scan_folder(&mut self, root: &Path) -> Result<(), ScanError> {
        let mut builder = DirBuilder::new(&self.geometry, &self.fat, &mut self.alloc, &mut self.addr, &mut self.tree);
        scanner::scan_folder(&mut builder, root)
    }

    /// Add a single file or directory entry directly, bypassing the
    /// host-directory scanner. Exposed for tests and for callers that
    /// already enumerate entries some other way. Safe to call more than
    /// once: each call resumes the same persistent directory tree
    /// rather than starting a new one.
    pub fn add_entry(
        &mut self,
        name: &[u8],
        size: u64,
        is_directory: bool,
        host_path: Option<std::path::PathBuf>,
    ) -> Result<(), VsfatError> {
        let mut builder = DirBuilder::new(&self.geometry, &self.fat, &mut self.alloc, &mut self.addr, &mut self.tree);
        builder.add_file(name, size, is_directory, host_path)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Freeze into an immutable, concurrently-readable image (spec §5).
    pub fn freeze(self) -> Image {
        Image { geometry: self.geometry, map: Arc::new(self.addr.freeze()) }
    }
}

/// The finished, read-only synthetic disk. Cheap to clone (an `Arc`
/// around the frozen address map) and safe to share across the
/// transport's reader threads.
#[derive(Clone)]
pub struct Image {
    geometry: Geometry,
    map: Arc<FrozenAddressMap>,
}

impl Image {
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn size_bytes(&self) -> u64 {
        self.geometry.disk_size_bytes()
    }

    pub fn read(&self, offset: u64, len: u32) -> Vec<u8> {
        self.map.read(offset, len)
    }
}
