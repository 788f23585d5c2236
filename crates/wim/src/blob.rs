//! The content-addressed blob store: descriptors, the digest-keyed table,
//! and the per-extraction reference lists.

use std::collections::HashMap;
use std::path::PathBuf;

use wim_dtyp::Sha1Hash;

use crate::tree::DentryId;

/// Index of a [`BlobDescriptor`] in its [`BlobTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub u32);

/// How many back-references fit before spilling to the heap.
///
/// Nearly every blob is referenced by a single dentry; a handful (shared
/// DLLs, duplicated files) fan out wider.
const INLINE_REFS: usize = 4;

/// Dentry back-reference list with inline storage for the common small
/// case and heap-grown storage past [`INLINE_REFS`].
#[derive(Debug, Default)]
pub struct RefList {
    inline: [DentryId; INLINE_REFS],
    len: u32,
    spill: Vec<DentryId>,
}

impl RefList {
    pub fn push(&mut self, item: DentryId) {
        let len = self.len as usize;
        if self.spill.is_empty() && len < INLINE_REFS {
            self.inline[len] = item;
        } else {
            if self.spill.is_empty() {
                // First spill: migrate the inline entries.
                self.spill.reserve(INLINE_REFS * 2);
                self.spill.extend_from_slice(&self.inline);
            }
            self.spill.push(item);
        }
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn last(&self) -> Option<DentryId> {
        self.len
            .checked_sub(1)
            .map(|last| self.as_slice()[last as usize])
    }

    pub fn as_slice(&self) -> &[DentryId] {
        if self.spill.is_empty() {
            &self.inline[..self.len as usize]
        } else {
            &self.spill[..]
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DentryId> {
        self.as_slice().iter()
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.spill = Vec::new();
    }
}

/// Where a blob's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobLocation {
    /// A resource inside the archive itself.
    InArchive {
        /// Absolute offset of the resource in the archive source.
        offset: u64,
        /// On-disk size of the resource (chunk table included when
        /// compressed).
        size_in_archive: u64,
    },
    /// A staging file on the local filesystem.
    InFileOnDisk(PathBuf),
    /// Bytes held in memory.
    InMemory(Vec<u8>),
    /// Known by digest only; no part of the archive set carries the data.
    Nonexistent,
}

/// Per-blob compression, matching the archive's active codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionKind {
    #[default]
    None,
    Xpress,
    Lzx,
    Lzms,
}

/// One entry of the blob table.
#[derive(Debug)]
pub struct BlobDescriptor {
    pub hash: Sha1Hash,
    /// Uncompressed size in bytes.
    pub size: u64,
    pub location: BlobLocation,
    pub compression: CompressionKind,
    /// The blob lives inside a multi-blob solid pack.
    pub solid: bool,

    pub(crate) scratch: BlobScratch,
}

#[derive(Debug, Default)]
pub(crate) struct BlobScratch {
    /// Number of streams that will extract this blob.
    pub out_refcnt: u32,
    /// Membership in the current extraction list.
    pub in_extraction_list: bool,
    /// Back-references, built only for sequential extraction.
    pub refs: RefList,
    /// First path the blob was materialized at.
    pub extracted_file: Option<PathBuf>,
}

impl BlobDescriptor {
    pub fn new(hash: Sha1Hash, size: u64, location: BlobLocation) -> Self {
        Self {
            hash,
            size,
            location,
            compression: CompressionKind::None,
            solid: false,
            scratch: BlobScratch::default(),
        }
    }

    pub fn with_compression(mut self, compression: CompressionKind) -> Self {
        self.compression = compression;
        self
    }

    /// The archive offset, used to sort the sequential extraction list.
    pub fn archive_offset(&self) -> Option<u64> {
        match self.location {
            BlobLocation::InArchive { offset, .. } => Some(offset),
            _ => None,
        }
    }

    pub(crate) fn reset_scratch(&mut self) {
        self.scratch = BlobScratch::default();
    }
}

/// The merged, digest-keyed blob table of an archive set.
#[derive(Debug, Default)]
pub struct BlobTable {
    blobs: Vec<BlobDescriptor>,
    by_hash: HashMap<Sha1Hash, BlobId>,
}

impl BlobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a descriptor, keeping the first entry on digest collisions
    /// (all copies carry the same bytes by definition).
    pub fn insert(&mut self, blob: BlobDescriptor) -> BlobId {
        if let Some(&existing) = self.by_hash.get(&blob.hash) {
            return existing;
        }
        let id = BlobId(self.blobs.len() as u32);
        self.by_hash.insert(blob.hash, id);
        self.blobs.push(blob);
        id
    }

    pub fn lookup(&self, hash: &Sha1Hash) -> Option<BlobId> {
        self.by_hash.get(hash).copied()
    }

    pub fn get(&self, id: BlobId) -> &BlobDescriptor {
        &self.blobs[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: BlobId) -> &mut BlobDescriptor {
        &mut self.blobs[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlobDescriptor> {
        self.blobs.iter()
    }

    pub(crate) fn reset_scratch(&mut self) {
        for blob in &mut self.blobs {
            blob.reset_scratch();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_list_stays_inline_below_threshold() {
        let mut refs = RefList::default();
        for n in 0..INLINE_REFS as u32 {
            refs.push(DentryId(n));
        }
        assert_eq!(refs.len(), INLINE_REFS);
        assert!(refs.spill.is_empty());
        let collected: Vec<_> = refs.iter().map(|d| d.0).collect();
        assert_eq!(collected, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_ref_list_spills_and_keeps_order() {
        let mut refs = RefList::default();
        for n in 0..10 {
            refs.push(DentryId(n));
        }
        assert_eq!(refs.len(), 10);
        assert!(!refs.spill.is_empty());
        assert_eq!(refs.last(), Some(DentryId(9)));
        let collected: Vec<_> = refs.iter().map(|d| d.0).collect();
        assert_eq!(collected, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_ref_list_clear_releases_spill() {
        let mut refs = RefList::default();
        for n in 0..10 {
            refs.push(DentryId(n));
        }
        refs.clear();
        assert!(refs.is_empty());
        assert_eq!(refs.iter().count(), 0);
    }

    #[test]
    fn test_blob_table_dedupes_by_hash() {
        let mut table = BlobTable::new();
        let hash = Sha1Hash::from([7u8; 20]);
        let a = table.insert(BlobDescriptor::new(hash, 3, BlobLocation::InMemory(vec![1, 2, 3])));
        let b = table.insert(BlobDescriptor::new(hash, 3, BlobLocation::Nonexistent));
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
        // The first location wins.
        assert!(matches!(table.get(a).location, BlobLocation::InMemory(_)));
    }
}
