#![forbid(unsafe_code)]
//! CRC32 helpers guarding the on-disk log framing.

/// Incremental checksum over byte slices.
pub trait Checksum {
    /// Clears the running state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;

    /// Checksum of a sequence of slices, as if they were concatenated.
    fn digest(mut self, parts: &[&[u8]]) -> u32
    where
        Self: Sized,
    {
        self.reset();
        for part in parts {
            self.update(part);
        }
        self.finalize()
    }
}

/// [`Checksum`] backed by `crc32fast`.
#[derive(Clone, Default)]
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC of a WAL frame. The LSN is folded in so a frame copied to the wrong
/// position fails validation.
pub fn frame_crc32(lsn: u64, payload: &[u8]) -> u32 {
    Crc32Fast::default().digest(&[&lsn.to_be_bytes(), payload])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_matches_digest() {
        let mut c = Crc32Fast::default();
        c.update(b"hello");
        let first = c.finalize();
        c.update(b" world");
        let second = c.finalize();
        assert_ne!(first, second);
        assert_eq!(Crc32Fast::default().digest(&[b"hello world"]), second);
        c.reset();
        c.update(b"hello world");
        assert_eq!(c.finalize(), second);
    }

    #[test]
    fn frame_crc_depends_on_lsn() {
        let payload = b"record";
        assert_eq!(frame_crc32(3, payload), frame_crc32(3, payload));
        assert_ne!(frame_crc32(3, payload), frame_crc32(4, payload));
        assert_ne!(frame_crc32(3, payload), frame_crc32(3, b"recorc"));
    }
}
