//! SHA-1 message digests, the content addresses of WIM blobs.

use std::fmt;

use binrw::prelude::*;

/// A SHA-1 message digest.
///
/// Every blob in a WIM archive is identified by the SHA-1 hash of its
/// uncompressed contents; the all-zero hash denotes an empty stream.
#[derive(BinRead, BinWrite, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Sha1Hash(pub [u8; 20]);

impl Sha1Hash {
    pub const SIZE: usize = 20;

    /// The hash reserved for zero-length streams.
    pub const ZERO: Sha1Hash = Sha1Hash([0u8; 20]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for Sha1Hash {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Hash({self})")
    }
}
