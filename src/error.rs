//! Error taxonomy for image construction (spec §7).
//!
//! Host I/O errors deliberately have no variant here: they degrade to
//! zero-fill inside [`crate::backend`] and are only logged, never
//! propagated across the transport boundary.

use std::path::PathBuf;

use fmt_extra::AsciiStr;

/// Build-time failure for a single file or directory being added to the
/// synthetic image. The scanner logs these and continues with the next
/// entry rather than aborting the whole scan.
#[derive(Debug, thiserror::Error)]
pub enum VsfatError {
    #[error("FAT exhausted: no free cluster available")]
    AllocExhausted,

    #[error("directory exceeds the 2 MiB / 65536-entry limit")]
    DirTooLarge,

    #[error("short-name collisions exhausted (~99) for {name:?}")]
    NameCollisionUnresolvable { name: AsciiStr<Vec<u8>> },

    #[error("path too long to encode: {name}")]
    PathTooLong { name: String },
}

/// Raised by [`crate::backend::BlockDevice::write`] for a write outside
/// the declared disk span. Writes inside the span are silently dropped
/// (spec §4.2/§4.7), never mutating the image.
#[derive(Debug, thiserror::Error)]
#[error("write refused: offset {offset} len {len} exceeds the declared disk span")]
pub struct TransportWriteRefused {
    pub offset: u64,
    pub len: u32,
}

/// Failure scanning a host directory into the image. Carries enough
/// context for the caller to log and move on; scanning itself never
/// aborts on a per-file failure (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("could not read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
