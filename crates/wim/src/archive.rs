//! The opened-archive handle the extraction engine works against.
//!
//! Opening and parsing a `.wim` file (headers, XML metadata, the on-disk
//! dentry tree) is the opener's job; what arrives here is the digested
//! form: per-image metadata and trees, the merged blob table, the security
//! descriptor tables, and a raw byte source for in-archive resources.
//! Compression codecs are likewise plugged in from outside through the
//! [`Decompressor`] trait.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use sha1::{Digest, Sha1};
use wim_dtyp::Sha1Hash;

use crate::blob::{BlobDescriptor, BlobLocation, BlobTable, CompressionKind};
use crate::error::ResourceOp;
use crate::tree::ImageTree;
use crate::{Error, Result};

/// Combined `Read + Seek` bound for seekable archive sources.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// The raw byte source of an archive.
pub enum Source {
    /// A regular file or any other seekable reader.
    Seekable(Box<dyn ReadSeek>),
    /// A forward-only reader (pipe); only pipable archives extract from
    /// this.
    Pipe(Box<dyn Read>),
    /// No source at all: every blob is memory- or file-backed.
    Detached,
}

impl Source {
    /// Probes whether the source supports random access by attempting a
    /// relative no-op seek.
    pub fn is_seekable(&mut self) -> bool {
        match self {
            Source::Seekable(reader) => reader.seek(SeekFrom::Current(0)).is_ok(),
            Source::Pipe(_) | Source::Detached => false,
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Seekable(_) => write!(f, "Source::Seekable"),
            Source::Pipe(_) => write!(f, "Source::Pipe"),
            Source::Detached => write!(f, "Source::Detached"),
        }
    }
}

/// Decompresses one resource chunk. Implementations wrap the XPRESS, LZX
/// and LZMS codecs; the engine never implements a codec itself.
pub trait Decompressor {
    /// Decompresses `input` into exactly `output.len()` bytes.
    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<()>;
}

/// Archive-wide properties relevant to extraction.
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub compression: CompressionKind,
    /// Chunk size of compressed resources, in bytes.
    pub chunk_size: u32,
    /// The archive uses the pipable layout (streams carry record headers).
    pub pipable: bool,
    /// The archive was captured with reparse-point fixup enabled.
    pub rpfix: bool,
}

impl Default for ArchiveInfo {
    fn default() -> Self {
        Self {
            compression: CompressionKind::None,
            chunk_size: 32 * 1024,
            pipable: false,
            rpfix: false,
        }
    }
}

/// XML-derived metadata of one image.
#[derive(Debug, Clone)]
pub struct ImageMeta {
    /// 1-based image index.
    pub index: u32,
    pub name: String,
    /// Total byte estimate from the XML descriptor.
    pub total_bytes: u64,
    pub boot: bool,
}

/// The raw self-relative security descriptors of one image, indexed by
/// security id.
#[derive(Debug, Default)]
pub struct SecurityTable {
    descriptors: Vec<Vec<u8>>,
}

impl SecurityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, descriptor: Vec<u8>) -> u32 {
        self.descriptors.push(descriptor);
        (self.descriptors.len() - 1) as u32
    }

    pub fn get(&self, security_id: u32) -> Option<&[u8]> {
        self.descriptors.get(security_id as usize).map(|d| &d[..])
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// One image of the archive: metadata, security table and filesystem tree.
#[derive(Debug)]
pub struct Image {
    pub meta: ImageMeta,
    pub security: SecurityTable,
    pub(crate) tree: ImageTree,
}

impl Image {
    pub fn tree(&self) -> &ImageTree {
        &self.tree
    }
}

/// An opened WIM archive.
pub struct Archive {
    pub(crate) info: ArchiveInfo,
    pub(crate) images: Vec<Image>,
    pub(crate) blobs: BlobTable,
    pub(crate) source: Source,
    pub(crate) decompressor: Option<Box<dyn Decompressor>>,
}

impl Archive {
    pub fn new(info: ArchiveInfo, source: Source) -> Self {
        Self {
            info,
            images: Vec::new(),
            blobs: BlobTable::new(),
            source,
            decompressor: None,
        }
    }

    pub fn info(&self) -> &ArchiveInfo {
        &self.info
    }

    pub fn set_decompressor(&mut self, decompressor: Box<dyn Decompressor>) {
        self.decompressor = Some(decompressor);
    }

    pub fn blob_table(&self) -> &BlobTable {
        &self.blobs
    }

    pub fn blob_table_mut(&mut self) -> &mut BlobTable {
        &mut self.blobs
    }

    /// Appends an image; its 1-based index is assigned and returned.
    pub fn add_image(&mut self, name: &str, security: SecurityTable, tree: ImageTree) -> u32 {
        let index = self.images.len() as u32 + 1;
        self.images.push(Image {
            meta: ImageMeta {
                index,
                name: name.to_string(),
                total_bytes: 0,
                boot: false,
            },
            security,
            tree,
        });
        index
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn image(&self, index: u32) -> Result<&Image> {
        if index == 0 || index > self.image_count() {
            return Err(Error::InvalidImage(index.to_string()));
        }
        Ok(&self.images[index as usize - 1])
    }

    /// Mutable access to an image's XML-derived metadata, for openers
    /// filling in totals and the boot flag.
    pub fn image_meta_mut(&mut self, index: u32) -> Result<&mut ImageMeta> {
        if index == 0 || index > self.images.len() as u32 {
            return Err(Error::InvalidImage(index.to_string()));
        }
        Ok(&mut self.images[index as usize - 1].meta)
    }

    /// Resolves an image by its XML name.
    pub fn image_by_name(&self, name: &str) -> Result<u32> {
        self.images
            .iter()
            .find(|img| img.meta.name == name)
            .map(|img| img.meta.index)
            .ok_or_else(|| Error::InvalidImage(name.to_string()))
    }

    /// Reads a whole blob into memory by digest. Mostly useful for small
    /// metadata blobs and tests; extraction streams blobs instead.
    pub fn read_blob_to_vec(&mut self, hash: &Sha1Hash) -> Result<Vec<u8>> {
        let id = self.blobs.lookup(hash).ok_or(Error::BlobMissing(*hash))?;
        let blob = self.blobs.get(id);
        let mut out = Vec::with_capacity(blob.size as usize);
        read_blob(
            &mut self.source,
            self.decompressor.as_deref(),
            self.info.chunk_size,
            blob,
            &mut out,
        )?;
        Ok(out)
    }

    /// Clears every per-extraction scratch field on blobs and trees.
    pub(crate) fn reset_extraction_scratch(&mut self) {
        self.blobs.reset_scratch();
        for image in &mut self.images {
            image.tree.reset_scratch();
        }
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("info", &self.info)
            .field("images", &self.images.len())
            .field("blobs", &self.blobs.len())
            .field("source", &self.source)
            .finish()
    }
}

/// A pull-based reader over one blob's uncompressed bytes.
pub(crate) enum BlobReader<'a> {
    Memory(Cursor<&'a [u8]>),
    File(std::io::Take<File>),
    /// Raw (uncompressed) section of the seekable archive source.
    Section {
        source: &'a mut dyn ReadSeek,
        remaining: u64,
    },
    /// Decompressed in-archive resource, buffered up front.
    Buffered(Cursor<Vec<u8>>),
}

impl Read for BlobReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            BlobReader::Memory(cursor) => cursor.read(buf),
            BlobReader::File(file) => file.read(buf),
            BlobReader::Buffered(cursor) => cursor.read(buf),
            BlobReader::Section { source, remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let want = buf.len().min(*remaining as usize);
                let n = source.read(&mut buf[..want])?;
                *remaining -= n as u64;
                Ok(n)
            }
        }
    }
}

/// Opens a pull-based reader for `blob`.
///
/// In-archive compressed resources are decompressed up front; everything
/// else streams.
pub(crate) fn open_blob_reader<'a>(
    source: &'a mut Source,
    decompressor: Option<&dyn Decompressor>,
    chunk_size: u32,
    blob: &'a BlobDescriptor,
) -> Result<BlobReader<'a>> {
    match &blob.location {
        BlobLocation::InMemory(data) => {
            if data.len() as u64 != blob.size {
                return Err(Error::CorruptBlob(blob.hash));
            }
            Ok(BlobReader::Memory(Cursor::new(data.as_slice())))
        }
        BlobLocation::InFileOnDisk(path) => {
            let file =
                File::open(path).map_err(|e| Error::resource(ResourceOp::Open, path, e))?;
            Ok(BlobReader::File(file.take(blob.size)))
        }
        BlobLocation::Nonexistent => Err(Error::BlobMissing(blob.hash)),
        BlobLocation::InArchive {
            offset,
            size_in_archive,
        } => {
            if blob.solid {
                return Err(Error::Unsupported(
                    "solid resources must be staged by the opener".to_string(),
                ));
            }
            let reader = match source {
                Source::Seekable(reader) => reader.as_mut(),
                Source::Pipe(_) | Source::Detached => return Err(Error::NotPipable),
            };
            reader.seek(SeekFrom::Start(*offset))?;
            if blob.compression == CompressionKind::None {
                Ok(BlobReader::Section {
                    source: reader,
                    remaining: blob.size,
                })
            } else {
                let mut out = Vec::with_capacity(blob.size as usize);
                read_chunked_resource(
                    reader,
                    decompressor,
                    chunk_size,
                    blob.size,
                    *size_in_archive,
                    &mut out,
                )?;
                Ok(BlobReader::Buffered(Cursor::new(out)))
            }
        }
    }
}

/// Streams a whole blob into `out`, decompressing as needed.
pub(crate) fn read_blob(
    source: &mut Source,
    decompressor: Option<&dyn Decompressor>,
    chunk_size: u32,
    blob: &BlobDescriptor,
    out: &mut dyn Write,
) -> Result<()> {
    let mut reader = open_blob_reader(source, decompressor, chunk_size, blob)?;
    let copied = std::io::copy(&mut reader, out)?;
    if copied != blob.size {
        return Err(Error::CorruptBlob(blob.hash));
    }
    Ok(())
}

/// Reads and decompresses a chunked in-archive resource.
///
/// Layout: a chunk table of `num_chunks - 1` entries (32-bit when the
/// uncompressed size fits, 64-bit otherwise) holding offsets of every chunk
/// but the first, relative to the start of the chunk data area, followed by
/// the chunk data. A chunk whose stored size equals its uncompressed size
/// is stored raw.
fn read_chunked_resource(
    reader: &mut dyn ReadSeek,
    decompressor: Option<&dyn Decompressor>,
    chunk_size: u32,
    uncompressed_size: u64,
    size_in_archive: u64,
    out: &mut dyn Write,
) -> Result<()> {
    let decompressor = decompressor.ok_or_else(|| {
        Error::Unsupported("archive is compressed but no decompressor was provided".to_string())
    })?;

    let num_chunks = uncompressed_size.div_ceil(chunk_size as u64);
    let entry_width: u64 = if uncompressed_size > u32::MAX as u64 {
        8
    } else {
        4
    };
    let table_entries = num_chunks.saturating_sub(1);
    let table_size = table_entries * entry_width;

    let mut chunk_offsets = Vec::with_capacity(num_chunks as usize);
    chunk_offsets.push(0u64);
    for _ in 0..table_entries {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf[..entry_width as usize])?;
        let offset = if entry_width == 8 {
            u64::from_le_bytes(buf)
        } else {
            u32::from_le_bytes(buf[..4].try_into().expect("4-byte slice")) as u64
        };
        chunk_offsets.push(offset);
    }

    let data_size = size_in_archive
        .checked_sub(table_size)
        .ok_or_else(|| Error::InvalidResource("chunk table larger than resource".to_string()))?;

    let mut chunk_buf = Vec::new();
    let mut out_buf = vec![0u8; chunk_size as usize];
    for i in 0..num_chunks {
        let start = chunk_offsets[i as usize];
        let end = if i + 1 < num_chunks {
            chunk_offsets[i as usize + 1]
        } else {
            data_size
        };
        let stored_size = end
            .checked_sub(start)
            .ok_or_else(|| Error::InvalidResource("chunk table not monotonic".to_string()))?;
        let expected = (uncompressed_size - i * chunk_size as u64).min(chunk_size as u64) as usize;

        chunk_buf.resize(stored_size as usize, 0);
        reader.read_exact(&mut chunk_buf)?;
        if stored_size as usize == expected {
            out.write_all(&chunk_buf)?;
        } else {
            decompressor.decompress(&chunk_buf, &mut out_buf[..expected])?;
            out.write_all(&out_buf[..expected])?;
        }
    }
    Ok(())
}

/// `Read` adapter that hashes everything passing through, so stream
/// contents can be verified against their blob digest after the copy.
pub(crate) struct HashingReader<R> {
    inner: R,
    hasher: Sha1,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
        }
    }

    pub fn digest(self) -> Sha1Hash {
        Sha1Hash(self.hasher.finalize().into())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// `Write` adapter mirroring [`HashingReader`] for push-style copies.
pub(crate) struct HashingWriter<W> {
    inner: W,
    hasher: Sha1,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
        }
    }

    pub fn digest(self) -> Sha1Hash {
        Sha1Hash(self.hasher.finalize().into())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Computes the SHA-1 digest of a byte slice. The digest of the empty
/// stream is represented as the all-zero hash in blob tables, which this
/// helper does *not* special-case.
pub fn sha1_of(data: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    Sha1Hash(hasher.finalize().into())
}

/// Opens a file as a seekable archive source.
pub fn file_source(path: &Path) -> Result<Source> {
    let file = File::open(path).map_err(|e| Error::resource(ResourceOp::Open, path, e))?;
    Ok(Source::Seekable(Box::new(file)))
}
