//! Synthesizes an in-memory FAT32 disk image over a host directory tree
//! and serves it read-only over a network block device.
//!
//! A userspace process scans a host folder and builds a FAT32 volume
//! whose data clusters are *lazily backed* by the underlying host
//! files: directory structure, the FAT chains, and the boot region all
//! live in RAM, while file contents are read straight out of the real
//! files on demand. [`ImageBuilder`] produces the layout; [`Image`]
//! (via [`backend::Backend`]) answers block reads against it.
//!
//! ```text
//! ImageBuilder::new(geometry)   // MBR, boot sector(s), FSInfo, FAT
//!     .scan_folder(path)?       // walk a host directory into it
//!     .freeze()                 // -> Image, read-only from here on
//! ```
//!
//! The five on-disk regions ([`geometry`], [`address_map`], [`fat`],
//! [`name`]/[`dirent`], [`dir`]/[`image`]) are the core of this crate;
//! [`backend`] and [`transport`] are the network-facing edges, and
//! [`scanner`] is the host-filesystem-facing edge.

pub mod address_map;
pub mod backend;
pub mod dir;
pub mod dirent;
pub mod error;
pub mod fat;
pub mod geometry;
pub mod image;
pub mod name;
pub mod scanner;
pub mod transport;

pub use backend::{Backend, BlockDevice};
pub use error::{ScanError, TransportWriteRefused, VsfatError};
pub use geometry::Geometry;
pub use image::{Image, ImageBuilder};
