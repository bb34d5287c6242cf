//! The directory tree under construction: an arena of [`DirNode`]s plus
//! the [`DirBuilder`] operations that append entries to the "current"
//! node and descend/ascend the tree (spec §4.6).
//!
//! Grounded end to end on `original_source/fatfiles.c`
//! (`dir_add_entry`, `add_file`, `up_dir`) and `vsfat.h`'s
//! `Fat_Directory`/`FileEntry` linked lists, restructured per
//! Design Note 9: the `Fat_Directory` linked list (raw `parent`
//! pointers, `malloc`/`free`) becomes a `Vec<DirNode>` arena indexed by
//! `usize`, with the root self-referencing at index 0 exactly as the
//! source sets `root_dir.parent = &root_dir`; the `FileEntry` linked
//! list becomes a plain `Vec<ShortName>`.

use crate::address_map::{BuildAddressMap, BuildBuffer};
use crate::dirent::{build_lfn_entries, dot_entries, Attr, ShortDirEntry, DIR_ENTRY_SIZE};
use crate::error::VsfatError;
use crate::fat::FatAllocator;
use crate::fat::FatTable;
use crate::geometry::Geometry;
use crate::name::{encode_name, ShortName};
use std::cell::RefCell;
use std::rc::Rc;

/// One cluster's worth of raw directory-entry bytes, already registered
/// in the address map at the cluster it was allocated for.
struct DirCluster {
    buf: BuildBuffer,
}

/// A directory under construction. Index 0 is always the root, and the
/// root is its own parent (mirrors `build_root_dir`'s
/// `root_dir.parent = &root_dir`).
pub struct DirNode {
    /// First cluster of this directory's entry chain.
    pub dir_location: u32,
    /// The chain's current tail cluster, i.e. the one the FAT entry for
    /// a freshly allocated next cluster must be written into.
    last_cluster_loc: u32,
    /// Number of 32-byte entries written so far, across every cluster
    /// in this directory's chain.
    current_dir_position: u32,
    clusters: Vec<DirCluster>,
    /// Short names already used in this directory, consulted for
    /// collision disambiguation (mirrors `Fat_Directory::files`).
    files: Vec<ShortName>,
    pub parent: usize,
}

/// Upper bound on a single directory's entry count (spec §4.6): 2 MiB
/// worth of 32-byte entries.
const MAX_DIR_ENTRIES: u32 = (2 * 1024 * 1024) / DIR_ENTRY_SIZE as u32;

/// The persistent arena of [`DirNode`]s and the "current directory"
/// cursor, kept alive across every [`DirBuilder`] session for one image.
/// Splitting this out from `DirBuilder` itself lets a caller make
/// several independent `add_file`/`up_dir` calls (e.g. one `add_entry`
/// call per top-level file) without losing previously-built
/// directories or re-registering the root cluster — `DirBuilder` is
/// just a transient borrowing view over this plus the shared
/// FAT/address-map state.
pub struct DirTree {
    nodes: Vec<DirNode>,
    current: usize,
}

impl DirTree {
    /// The root directory always starts out empty and self-parented;
    /// its first cluster is registered the first time a [`DirBuilder`]
    /// is opened over this tree.
    pub fn new(root_loc: u32) -> Self {
        let root = DirNode {
            dir_location: root_loc,
            last_cluster_loc: root_loc,
            current_dir_position: 0,
            clusters: Vec::new(),
            files: Vec::new(),
            parent: 0,
        };
        DirTree { nodes: vec![root], current: 0 }
    }
}

pub struct DirBuilder<'a> {
    geometry: &'a Geometry,
    fat: &'a FatTable,
    alloc: &'a mut FatAllocator,
    addr: &'a mut BuildAddressMap,
    tree: &'a mut DirTree,
}

impl<'a> DirBuilder<'a> {
    /// Open a builder session over `tree`, registering the root
    /// directory's first cluster the first time this is ever called
    /// for a given tree.
    pub fn new(
        geometry: &'a Geometry,
        fat: &'a FatTable,
        alloc: &'a mut FatAllocator,
        addr: &'a mut BuildAddressMap,
        tree: &'a mut DirTree,
    ) -> Self {
        let root_loc = tree.nodes[0].dir_location;
        let mut builder = DirBuilder { geometry, fat, alloc, addr, tree };
        builder.ensure_initial_cluster(0, root_loc);
        builder
    }

    pub fn current_dir_location(&self) -> u32 {
        self.tree.nodes[self.tree.current].dir_location
    }

    fn entries_per_cluster(&self) -> u32 {
        (self.geometry.cluster_size() / DIR_ENTRY_SIZE as u64) as u32
    }

    fn ensure_initial_cluster(&mut self, node: usize, location: u32) {
        if !self.tree.nodes[node].clusters.is_empty() {
            return;
        }
        let buf = Rc::new(RefCell::new(vec![0u8; self.geometry.cluster_size() as usize]));
        self.addr.add_mem(self.geometry.address_from_fatclus(location), self.geometry.cluster_size(), buf.clone());
        self.fat.set_end_of_chain(location);
        self.tree.nodes[node].clusters.push(DirCluster { buf });
    }

    /// Append raw 32-byte entries to the current directory, allocating
    /// a new cluster (and extending the FAT chain) when the current one
    /// is full. Mirrors `dir_add_entry`.
    fn add_raw_entries(&mut self, entries: &[[u8; DIR_ENTRY_SIZE]]) -> Result<(), VsfatError> {
        let entries_per_cluster = self.entries_per_cluster();
        let node = self.tree.current;

        if self.tree.nodes[node].current_dir_position as u64 + entries.len() as u64 > MAX_DIR_ENTRIES as u64 {
            return Err(VsfatError::DirTooLarge);
        }

        for entry in entries {
            let pos = self.tree.nodes[node].current_dir_position;
            let cluster_index = (pos / entries_per_cluster) as usize;

            if cluster_index == self.tree.nodes[node].clusters.len() {
                self.alloc.find_free(self.fat);
                let new_loc = self.alloc.current();
                if new_loc >= self.fat.entry_count() {
                    return Err(VsfatError::AllocExhausted);
                }
                let buf = Rc::new(RefCell::new(vec![0u8; self.geometry.cluster_size() as usize]));
                self.addr.add_mem(self.geometry.address_from_fatclus(new_loc), self.geometry.cluster_size(), buf.clone());
                self.fat.set_end_of_chain(new_loc);
                self.tree.nodes[node].clusters.push(DirCluster { buf });

                // Link the previous tail of the chain to this new cluster.
                self.fat.set(self.tree.nodes[node].last_cluster_loc, new_loc);
                self.tree.nodes[node].last_cluster_loc = new_loc;
            }

            let within = (pos % entries_per_cluster) as usize;
            let mut buf = self.tree.nodes[node].clusters[cluster_index].buf.borrow_mut();
            let off = within * DIR_ENTRY_SIZE;
            buf[off..off + DIR_ENTRY_SIZE].copy_from_slice(entry);
            drop(buf);

            self.tree.nodes[node].current_dir_position += 1;
        }

        Ok(())
    }

    /// Add a file (or directory) entry named `name` to the current
    /// directory. For a directory, this also allocates the new child's
    /// first cluster, writes its `.`/`..` entries, and enters it. For a
    /// plain file, this allocates and chains its data clusters via
    /// `fat_alloc` and registers `host_path` in the address map. Mirrors
    /// `add_file` (`host_path` is `None` for directories, `Some` for
    /// regular files — the source's `add_file(name, filepath, size,
    /// isDirectory)` always takes a path but ignores it when
    /// `isDirectory` is set).
    pub fn add_file(
        &mut self,
        name: &[u8],
        size: u64,
        is_directory: bool,
        host_path: Option<std::path::PathBuf>,
    ) -> Result<(), VsfatError> {
        let node = self.tree.current;
        let encoded = encode_name(name, &self.tree.nodes[node].files)?;

        let lfn_entries = if encoded.lfn_required {
            build_lfn_entries(&encoded.lfn_units, &encoded.short)
        } else {
            Vec::new()
        };

        if !lfn_entries.is_empty() {
            let raw: Vec<[u8; DIR_ENTRY_SIZE]> = lfn_entries.iter().map(|e| e.to_bytes()).collect();
            self.add_raw_entries(&raw)?;
        }

        self.tree.nodes[node].files.push(encoded.short);

        // Snapshot the next free cluster, then look ahead: if the short
        // entry we're about to write won't fit in the current tail
        // cluster, writing it will itself consume this very cluster for
        // a new directory cluster. Reserve the file's first cluster one
        // past that so the two allocations can't collide. Mirrors
        // `add_file`'s `filePosition += dir_entry_sectors_needed(...)`.
        self.alloc.find_free(self.fat);
        let entries_per_cluster = self.entries_per_cluster();
        let short_entry_cluster_index = (self.tree.nodes[node].current_dir_position / entries_per_cluster) as usize;
        let short_entry_needs_new_cluster = short_entry_cluster_index >= self.tree.nodes[node].clusters.len();
        let file_position = self.alloc.current() + if short_entry_needs_new_cluster { 1 } else { 0 };
        if file_position >= self.fat.entry_count() {
            return Err(VsfatError::AllocExhausted);
        }

        let attr = if is_directory { Attr::DIRECTORY } else { Attr::ARCHIVE };
        let short_entry = ShortDirEntry {
            short: encoded.short,
            attr,
            first_cluster: file_position,
            file_size: if is_directory { 0 } else { size as u32 },
        };
        self.add_raw_entries(&[short_entry.to_bytes()])?;

        if is_directory {
            let parent_location = self.tree.nodes[node].dir_location;
            let child = DirNode {
                dir_location: file_position,
                last_cluster_loc: file_position,
                current_dir_position: 0,
                clusters: Vec::new(),
                files: Vec::new(),
                parent: node,
            };
            self.tree.nodes.push(child);
            let child_index = self.tree.nodes.len() - 1;
            self.tree.current = child_index;
            self.ensure_initial_cluster(child_index, file_position);

            let [dot, dotdot] = dot_entries(file_position, parent_location);
            self.add_raw_entries(&[dot.to_bytes(), dotdot.to_bytes()])?;
        } else if let Some(path) = host_path {
            // Mirrors `fat_new_file`, called synchronously right after
            // the short entry lands, before any other directory entry
            // can advance the allocator past `file_position`.
            self.addr.add_file(self.geometry.address_from_fatclus(file_position), size.max(1), path);
            self.alloc.allocate_chain(self.fat, file_position, size, self.geometry.cluster_size())?;
        }

        Ok(())
    }

    /// Leave the current directory and return to its parent. A no-op at
    /// the root, mirroring `up_dir`'s "if the parent is root, we just
    /// stay at the root" (here: root is already its own parent).
    pub fn up_dir(&mut self) {
        self.tree.current = self.tree.nodes[self.tree.current].parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> Geometry {
        Geometry { sectors_per_cluster: 1, fat_size_sectors: 64, ..Geometry::default() }
    }

    #[test]
    fn root_is_its_own_parent() {
        let g = geom();
        let fat = FatTable::new(g.fat_entry_count());
        let mut alloc = FatAllocator::new();
        let mut addr = BuildAddressMap::new();
        let mut tree = DirTree::new(g.root_dir_loc());
        let builder = DirBuilder::new(&g, &fat, &mut alloc, &mut addr, &mut tree);
        assert_eq!(builder.tree.nodes[0].parent, 0);
        assert_eq!(builder.tree.current, 0);
    }

    #[test]
    fn up_dir_at_root_is_a_no_op() {
        let g = geom();
        let fat = FatTable::new(g.fat_entry_count());
        let mut alloc = FatAllocator::new();
        let mut addr = BuildAddressMap::new();
        let mut tree = DirTree::new(g.root_dir_loc());
        let mut builder = DirBuilder::new(&g, &fat, &mut alloc, &mut addr, &mut tree);
        builder.up_dir();
        assert_eq!(builder.tree.current, 0);
    }

    #[test]
    fn adding_a_file_appends_one_short_entry() {
        let g = geom();
        let fat = FatTable::new(g.fat_entry_count());
        let mut alloc = FatAllocator::new();
        let mut addr = BuildAddressMap::new();
        let mut tree = DirTree::new(g.root_dir_loc());
        let mut builder = DirBuilder::new(&g, &fat, &mut alloc, &mut addr, &mut tree);
        builder.add_file(b"readme.txt", 0, false, None).unwrap();
        assert_eq!(builder.tree.nodes[0].current_dir_position, 1);
        assert_eq!(builder.tree.nodes[0].files.len(), 1);
    }

    #[test]
    fn adding_a_directory_enters_it_and_writes_dot_entries() {
        let g = geom();
        let fat = FatTable::new(g.fat_entry_count());
        let mut alloc = FatAllocator::new();
        let mut addr = BuildAddressMap::new();
        let mut tree = DirTree::new(g.root_dir_loc());
        let mut builder = DirBuilder::new(&g, &fat, &mut alloc, &mut addr, &mut tree);
        builder.add_file(b"sub", 0, true, None).unwrap();
        assert_eq!(builder.tree.current, 1);
        assert_eq!(builder.tree.nodes[1].current_dir_position, 2); // . and ..
        builder.up_dir();
        assert_eq!(builder.tree.current, 0);
    }

    #[test]
    fn lfn_name_also_writes_leading_lfn_entries() {
        let g = geom();
        let fat = FatTable::new(g.fat_entry_count());
        let mut alloc = FatAllocator::new();
        let mut addr = BuildAddressMap::new();
        let mut tree = DirTree::new(g.root_dir_loc());
        let mut builder = DirBuilder::new(&g, &fat, &mut alloc, &mut addr, &mut tree);
        builder.add_file(b"Hello World.txt", 0, false, None).unwrap();
        // 2 LFN entries (15 chars / 13 per entry) + 1 short entry.
        assert_eq!(builder.tree.nodes[0].current_dir_position, 3);
    }

    #[test]
    fn short_entry_crossing_a_cluster_boundary_does_not_collide_with_the_files_own_cluster() {
        // Regression test: fill the root directory's one cluster exactly
        // (16 entries of 32 bytes each in a 512-byte cluster), then add
        // one more short-only entry. Writing that entry forces a second
        // directory cluster to be allocated; the file's own first data
        // cluster must be reserved one cluster past that, not on top of
        // it (spec's `add_file` step 4: reserve past `dir_entry_clusters_needed`).
        let g = geom();
        let fat = FatTable::new(g.fat_entry_count());
        let mut alloc = FatAllocator::new();
        let mut addr = BuildAddressMap::new();
        let mut tree = DirTree::new(g.root_dir_loc());
        let mut builder = DirBuilder::new(&g, &fat, &mut alloc, &mut addr, &mut tree);

        for i in 0..16 {
            let name = format!("F{i:02}");
            builder.add_file(name.as_bytes(), 0, false, None).unwrap();
        }
        assert_eq!(builder.tree.nodes[0].clusters.len(), 1);
        assert_eq!(builder.tree.nodes[0].current_dir_position, 16);

        builder.add_file(b"OVERFLOW", 0, false, None).unwrap();
        assert_eq!(builder.tree.nodes[0].clusters.len(), 2);
        assert_eq!(builder.tree.nodes[0].current_dir_position, 17);

        // The 17th entry (index 0 of the new second cluster) carries the
        // file's own first cluster; the directory's second cluster lives
        // at a different (the immediately preceding) cluster number.
        let entry_bytes = {
            let buf = builder.tree.nodes[0].clusters[1].buf.borrow();
            let mut e = [0u8; DIR_ENTRY_SIZE];
            e.copy_from_slice(&buf[0..DIR_ENTRY_SIZE]);
            e
        };
        let hi = u16::from_le_bytes([entry_bytes[20], entry_bytes[21]]);
        let lo = u16::from_le_bytes([entry_bytes[26], entry_bytes[27]]);
        let file_cluster = ((hi as u32) << 16) | lo as u32;

        let dir_cluster_1_loc = builder.tree.nodes[0].last_cluster_loc;
        assert_ne!(file_cluster, dir_cluster_1_loc);
        // The file's own cluster is independently terminated as
        // end-of-chain, distinct from the directory chain it sits next to.
        assert_eq!(fat.get(file_cluster) & 0x0FFF_FFFF, 0x0FFF_FFFF);
    }

    #[test]
    fn two_separate_builder_sessions_over_one_tree_both_survive() {
        // Regression test: opening a fresh `DirBuilder` a second time
        // over the same `DirTree` (as `ImageBuilder::add_entry` does
        // per call) must not re-zero the root cluster or lose the
        // first session's entry.
        let g = geom();
        let fat = FatTable::new(g.fat_entry_count());
        let mut alloc = FatAllocator::new();
        let mut addr = BuildAddressMap::new();
        let mut tree = DirTree::new(g.root_dir_loc());

        DirBuilder::new(&g, &fat, &mut alloc, &mut addr, &mut tree)
            .add_file(b"first.txt", 0, false, None)
            .unwrap();
        DirBuilder::new(&g, &fat, &mut alloc, &mut addr, &mut tree)
            .add_file(b"second.txt", 0, false, None)
            .unwrap();

        assert_eq!(tree.nodes[0].current_dir_position, 2);
        assert_eq!(tree.nodes[0].files.len(), 2);

        let map = addr.freeze();
        let root = map.read(g.address_from_fatclus(g.root_dir_loc()), g.cluster_size() as u32);
        assert_eq!(&root[0..8], b"FIRST   ");
        assert_eq!(&root[32..40], b"SECOND  ");
    }
}
