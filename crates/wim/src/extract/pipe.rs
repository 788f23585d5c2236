//! Record-by-record extraction from a pipable archive on a non-seekable
//! source.
//!
//! In the pipable layout every stream is preceded by a `PWMS` record
//! header carrying the digest, size and flags. Compressed payloads are
//! self-framing: `ceil(size / chunk_size)` chunks, each prefixed with its
//! stored size as a little-endian u32 (a chunk stored at its uncompressed
//! size is raw). The reader walks the records, extracts the ones the
//! selected image references and discards the rest, until every planned
//! stream has been seen.

use std::io::{Cursor, Read, Write};

use binrw::prelude::*;
use modular_bitfield::prelude::*;

use wim_dtyp::Sha1Hash;

use super::streams::{BlobSource, fan_out_blob, write_one_stream};
use super::ExtractOp;
use crate::archive::{Decompressor, HashingReader, HashingWriter, Source};
use crate::blob::BlobId;
use crate::error::ResourceOp;
use crate::tree::StreamSource;
use crate::{Error, Result};

/// Flags word of a pipable stream record.
#[bitfield]
#[derive(BinWrite, BinRead, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[bw(map = |&x| Self::into_bytes(x))]
#[br(map = Self::from_bytes)]
pub struct PipeStreamFlags {
    /// The payload uses the chunked encoding with the archive's active
    /// compressor.
    pub compressed: bool,
    #[skip]
    __: B31,
}

/// Header preceding every stream in a pipable archive.
#[binrw::binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little, magic = b"PWMS")]
pub struct PipableStreamHeader {
    pub uncompressed_size: u64,
    pub hash: Sha1Hash,
    pub flags: PipeStreamFlags,
}

impl PipableStreamHeader {
    /// Encoded size: magic + size + digest + flags.
    pub const SIZE: usize = 4 + 8 + Sha1Hash::SIZE + 4;
}

pub(crate) fn extract_from_pipe(op: &mut ExtractOp<'_, '_>) -> Result<()> {
    while op.num_streams_remaining > 0 {
        let mut header_bytes = [0u8; PipableStreamHeader::SIZE];
        {
            let reader = pipe_reader(op.source)?;
            reader.read_exact(&mut header_bytes).map_err(|e| {
                Error::InvalidPipableWim(format!(
                    "archive ended with {} streams outstanding: {e}",
                    op.num_streams_remaining
                ))
            })?;
        }
        let header = PipableStreamHeader::read(&mut Cursor::new(&header_bytes))
            .map_err(|_| Error::InvalidPipableWim("bad stream record header".to_string()))?;

        let wanted = op.blobs.lookup(&header.hash).filter(|&id| {
            let blob = op.blobs.get(id);
            blob.scratch.in_extraction_list && blob.scratch.out_refcnt > 0
        });
        match wanted {
            Some(blob_id) => {
                if op.blobs.get(blob_id).size != header.uncompressed_size {
                    return Err(Error::InvalidPipableWim(format!(
                        "stream {} size disagrees with the blob table",
                        header.hash
                    )));
                }
                materialize_from_pipe(op, blob_id, &header)?;
            }
            None => {
                // Not referenced by the selected image; read and discard.
                log::debug!("skipping unreferenced pipable stream {}", header.hash);
                let chunk_size = op.info.chunk_size;
                let decompressor = op.decompressor;
                let reader = pipe_reader(op.source)?;
                copy_pipe_payload(
                    reader,
                    header.flags.compressed(),
                    header.uncompressed_size,
                    chunk_size,
                    decompressor,
                    &mut std::io::sink(),
                )?;
            }
        }
    }
    Ok(())
}

fn pipe_reader(source: &mut Source) -> Result<&mut dyn Read> {
    match source {
        Source::Pipe(reader) => Ok(reader.as_mut()),
        _ => Err(Error::NotPipable),
    }
}

/// Extracts one referenced record: straight to its single target when
/// possible, through a temporary spill file when several streams fan out
/// of it.
fn materialize_from_pipe(
    op: &mut ExtractOp<'_, '_>,
    blob_id: BlobId,
    header: &PipableStreamHeader,
) -> Result<()> {
    let refcnt = op.blobs.get(blob_id).scratch.out_refcnt;

    if refcnt == 1 && !header.flags.compressed() {
        return stream_single_target(op, blob_id, header);
    }

    let temp = tempfile::NamedTempFile::new_in(op.target)
        .map_err(|e| Error::resource(ResourceOp::Open, op.target, e))?;
    {
        let chunk_size = op.info.chunk_size;
        let decompressor = op.decompressor;
        let reader = pipe_reader(op.source)?;
        let mut hashing = HashingWriter::new(temp.as_file());
        copy_pipe_payload(
            reader,
            header.flags.compressed(),
            header.uncompressed_size,
            chunk_size,
            decompressor,
            &mut hashing,
        )?;
        if hashing.digest() != header.hash {
            return Err(Error::CorruptBlob(header.hash));
        }
    }
    fan_out_blob(op, blob_id, BlobSource::TempFile(temp.path()))
}

/// The single-reference fast path: the payload flows from the pipe to the
/// one referencing stream without touching intermediate storage.
fn stream_single_target(
    op: &mut ExtractOp<'_, '_>,
    blob_id: BlobId,
    header: &PipableStreamHeader,
) -> Result<()> {
    let dentry = op.blobs.get(blob_id).scratch.refs.last().ok_or_else(|| {
        Error::InvalidPipableWim("referenced stream has no back-reference".to_string())
    })?;
    let size = header.uncompressed_size;

    if op.tree.dentry(dentry).scratch.was_hardlinked {
        // Target became a link; the payload still has to leave the pipe.
        let reader = pipe_reader(op.source)?;
        let mut take = TakeReader {
            inner: reader,
            remaining: size,
        };
        std::io::copy(&mut take, &mut std::io::sink())?;
    } else {
        let path = op.dentry_output_path(dentry);
        let name = {
            let inode = op.tree.inode_of(dentry);
            if inode.unnamed_blob_hash() == Some(header.hash) {
                None
            } else {
                inode
                    .named_streams
                    .iter()
                    .find(|s| s.source == Some(StreamSource::Blob(header.hash)))
                    .map(|s| s.name.clone())
            }
        };
        let ExtractOp {
            source, backend, ..
        } = op;
        let reader = pipe_reader(source)?;
        let mut hashing = HashingReader::new(TakeReader {
            inner: reader,
            remaining: size,
        });
        write_one_stream(&mut **backend, &path, name.as_ref(), size, &mut hashing)?;
        if hashing.digest() != header.hash {
            return Err(Error::CorruptBlob(header.hash));
        }
        if name.is_none() {
            op.blobs.get_mut(blob_id).scratch.extracted_file = Some(path);
        }
    }

    let blob = op.blobs.get_mut(blob_id);
    blob.scratch.out_refcnt = 0;
    blob.scratch.in_extraction_list = false;
    op.blob_done(size)
}

/// Copies one record payload from the pipe into `out`, undoing the
/// chunked encoding when present.
fn copy_pipe_payload(
    reader: &mut dyn Read,
    compressed: bool,
    size: u64,
    chunk_size: u32,
    decompressor: Option<&dyn Decompressor>,
    out: &mut dyn Write,
) -> Result<()> {
    if !compressed {
        let mut take = TakeReader {
            inner: reader,
            remaining: size,
        };
        let copied = std::io::copy(&mut take, out)?;
        if copied != size {
            return Err(Error::InvalidPipableWim(format!(
                "stream payload ended after {copied} of {size} bytes"
            )));
        }
        return Ok(());
    }

    let decompressor = decompressor.ok_or_else(|| {
        Error::Unsupported("archive is compressed but no decompressor was provided".to_string())
    })?;
    let num_chunks = size.div_ceil(chunk_size as u64);
    let mut chunk_buf = Vec::new();
    let mut out_buf = vec![0u8; chunk_size as usize];
    for i in 0..num_chunks {
        let expected = (size - i * chunk_size as u64).min(chunk_size as u64) as usize;
        let mut size_bytes = [0u8; 4];
        reader.read_exact(&mut size_bytes)?;
        let stored = u32::from_le_bytes(size_bytes) as usize;
        chunk_buf.resize(stored, 0);
        reader.read_exact(&mut chunk_buf)?;
        if stored == expected {
            out.write_all(&chunk_buf)?;
        } else {
            decompressor.decompress(&chunk_buf, &mut out_buf[..expected])?;
            out.write_all(&out_buf[..expected])?;
        }
    }
    Ok(())
}

/// Bounded reader over the pipe, so a consumer sees exactly one payload.
struct TakeReader<'a> {
    inner: &'a mut dyn Read,
    remaining: u64,
}

impl Read for TakeReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..want])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    wim_tests::test_binrw_case! {
        pipable_stream_header: PipableStreamHeader {
            uncompressed_size: 0x0102u64,
            hash: Sha1Hash([0xaa; 20]),
            flags: PipeStreamFlags::new().with_compressed(true),
        } <=> [
            b'P', b'W', b'M', b'S',
            0x02, 0x01, 0, 0, 0, 0, 0, 0,
            0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa,
            0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa,
            0x01, 0x00, 0x00, 0x00,
        ]
    }

    #[test]
    fn test_copy_pipe_payload_chunked() {
        // size 7, chunk 4: chunk 0 stored compressed (doubled bytes),
        // chunk 1 stored raw.
        let mut payload = Vec::new();
        payload.extend_from_slice(&8u32.to_le_bytes());
        payload.extend_from_slice(b"aabbccdd");
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.extend_from_slice(b"EFG");

        struct Halving;
        impl Decompressor for Halving {
            fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<()> {
                for (i, pair) in input.chunks(2).enumerate() {
                    output[i] = pair[0];
                }
                Ok(())
            }
        }

        let mut out = Vec::new();
        copy_pipe_payload(&mut &payload[..], true, 7, 4, Some(&Halving), &mut out).unwrap();
        assert_eq!(out, b"abcdEFG");
    }

    #[test]
    fn test_copy_pipe_payload_truncated_raw() {
        let payload = b"abc";
        let mut out = Vec::new();
        let err = copy_pipe_payload(&mut &payload[..], false, 5, 4, None, &mut out).unwrap_err();
        assert!(matches!(err, Error::InvalidPipableWim(_)));
    }
}
