//! The block-device surface the transport drives: `read`/`write`/
//! `flush`/`trim`/`disc` (spec §4.7, §6).
//!
//! Grounded on `original_source/buse.h`'s `buse_operations` (the
//! five-callback shape is taken directly from there) and `vsfat.c`'s
//! `xmp_read`/`xmp_write`/`xmp_disc`/`xmp_flush`/`xmp_trim` for the
//! semantics of each.

use crate::error::TransportWriteRefused;
use crate::image::Image;

/// The operations a network-block-device transport needs from a served
/// disk. All reads always succeed (gaps zero-fill); writes, flushes,
/// and trims are accepted but have no effect on a read-only image.
pub trait BlockDevice: Send + Sync {
    fn read(&self, offset: u64, len: u32) -> Vec<u8>;
    /// Returns an error only when `offset`/`len` falls outside the
    /// declared disk span; writes within the span are silently
    /// dropped, matching `xmp_write`'s behavior exactly (it never
    /// mutates the backing data either).
    fn write(&self, offset: u64, len: u32) -> Result<(), TransportWriteRefused>;
    fn flush(&self);
    fn trim(&self, from: u64, len: u32);
    fn disc(&self);
    fn size_bytes(&self) -> u64;
}

/// The concrete [`BlockDevice`] backing a synthesized [`Image`].
pub struct Backend {
    image: Image,
}

impl Backend {
    pub fn new(image: Image) -> Self {
        Backend { image }
    }
}

impl BlockDevice for Backend {
    fn read(&self, offset: u64, len: u32) -> Vec<u8> {
        self.image.read(offset, len)
    }

    fn write(&self, offset: u64, len: u32) -> Result<(), TransportWriteRefused> {
        if offset > self.image.size_bytes() {
            return Err(TransportWriteRefused { offset, len });
        }
        Ok(())
    }

    fn flush(&self) {}

    fn trim(&self, _from: u64, _len: u32) {}

    fn disc(&self) {}

    fn size_bytes(&self) -> u64 {
        self.image.size_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::image::ImageBuilder;

    fn backend() -> Backend {
        let g = Geometry { sectors_per_cluster: 1, fat_size_sectors: 64, ..Geometry::default() };
        Backend::new(ImageBuilder::new(g).freeze())
    }

    #[test]
    fn read_past_every_region_still_zero_fills() {
        let b = backend();
        let out = b.read(b.size_bytes() / 2, 32);
        assert_eq!(out.len(), 32);
    }

    #[test]
    fn write_within_span_is_accepted_and_has_no_effect() {
        let b = backend();
        let before = b.read(0, 512);
        b.write(0, 512).unwrap();
        let after = b.read(0, 512);
        assert_eq!(before, after);
    }

    #[test]
    fn write_beyond_span_is_refused() {
        let b = backend();
        let err = b.write(b.size_bytes() + 1, 512).unwrap_err();
        assert_eq!(err.offset, b.size_bytes() + 1);
    }

    #[test]
    fn flush_trim_disc_never_panic() {
        let b = backend();
        b.flush();
        b.trim(0, 512);
        b.disc();
    }
}
