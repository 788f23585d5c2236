//! Writing blob contents to their target paths.
//!
//! Two shapes: single-pass (streams written per dentry right after the
//! skeleton creates it, random-reading the archive) and sequential (one
//! pass over the offset-sorted extraction list, fanning each blob out to
//! every back-referencing dentry). The pipe reader reuses the fan-out
//! half.
//!
//! Every full read of a blob is verified against its SHA-1 digest.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use wim_dtyp::{Sha1Hash, WideString};

use super::ExtractOp;
use super::backend::Backend;
use crate::archive::{HashingReader, HashingWriter, open_blob_reader, read_blob};
use crate::blob::{BlobId, BlobLocation};
use crate::error::ResourceOp;
use crate::tree::{DentryId, StreamSource};
use crate::{Error, Result};

/// Where fan-out reads a blob's bytes from.
#[derive(Clone, Copy)]
pub(crate) enum BlobSource<'a> {
    /// The blob's own location (archive, staging file or memory).
    Original,
    /// A temporary spill file holding the uncompressed bytes.
    TempFile(&'a Path),
}

/// Writes the streams of one dentry to `path`: the unnamed stream first,
/// then named streams. With `include_blobs` unset only metadata-resident
/// (inline) stream bytes are written; blob-backed streams are left to the
/// fan-out pass.
pub(crate) fn write_dentry_streams(
    op: &mut ExtractOp<'_, '_>,
    id: DentryId,
    path: &Path,
    include_blobs: bool,
) -> Result<()> {
    let inode_id = op.tree.dentry(id).inode;
    let mut streams: Vec<(Option<WideString>, StreamSource)> = Vec::new();
    {
        let inode = op.tree.inode(inode_id);
        if let Some(source) = &inode.unnamed_stream {
            streams.push((None, source.clone()));
        }
        if op.features.named_data_streams && !op.opts.linked_extraction() {
            for stream in &inode.named_streams {
                if let Some(source) = &stream.source {
                    streams.push((Some(stream.name.clone()), source.clone()));
                }
            }
        }
    }

    for (name, source) in streams {
        match source {
            StreamSource::Inline(bytes) => {
                let mut reader = Cursor::new(&bytes[..]);
                write_one_stream(
                    &mut *op.backend,
                    path,
                    name.as_ref(),
                    bytes.len() as u64,
                    &mut reader,
                )?;
            }
            StreamSource::Blob(hash) if include_blobs => {
                write_blob_stream_single_pass(op, hash, path, name.as_ref())?;
            }
            StreamSource::Blob(_) => {}
        }
    }
    Ok(())
}

pub(crate) fn write_one_stream(
    backend: &mut dyn Backend,
    path: &Path,
    name: Option<&WideString>,
    size: u64,
    reader: &mut dyn Read,
) -> Result<()> {
    match name {
        Some(name) => backend.write_named_stream(path, name, size, Some(reader)),
        None => backend.write_unnamed_stream(path, size, reader),
    }
}

/// Single-pass write of one blob-backed stream, with digest verification
/// and progress accounting on the blob's last remaining reference.
fn write_blob_stream_single_pass(
    op: &mut ExtractOp<'_, '_>,
    hash: Sha1Hash,
    path: &Path,
    name: Option<&WideString>,
) -> Result<()> {
    let Some(blob_id) = op.blobs.lookup(&hash) else {
        // The planner skipped this stream already.
        return Ok(());
    };
    if !op.blobs.get(blob_id).scratch.in_extraction_list {
        return Ok(());
    }
    let size = op.blobs.get(blob_id).size;

    write_blob_once(op, blob_id, path, name, BlobSource::Original)?;

    let blob = op.blobs.get_mut(blob_id);
    blob.scratch.out_refcnt = blob.scratch.out_refcnt.saturating_sub(1);
    let done = blob.scratch.out_refcnt == 0;
    if done {
        blob.scratch.in_extraction_list = false;
        op.blob_done(size)?;
    }
    Ok(())
}

/// The sequential strategy: iterate the extraction list, fanning each
/// blob out over its back-references; blobs that cannot be re-read are
/// spilled to a temporary file first.
pub(crate) fn extract_sequential(op: &mut ExtractOp<'_, '_>) -> Result<()> {
    let list = std::mem::take(&mut op.extraction_list);
    for blob_id in list {
        let refcnt = op.blobs.get(blob_id).scratch.out_refcnt;
        let in_archive = matches!(
            op.blobs.get(blob_id).location,
            BlobLocation::InArchive { .. }
        );
        // A seekable source (or a single reference, or a blob stored
        // outside the archive) can be read as many times as needed.
        let direct = refcnt <= 1 || !in_archive || op.source.is_seekable();
        if direct {
            fan_out_blob(op, blob_id, BlobSource::Original)?;
        } else {
            spill_and_fan_out(op, blob_id)?;
        }
    }
    Ok(())
}

/// Extracts the blob once into a fresh temporary file, fans out from
/// there, and unlinks the file before moving on.
fn spill_and_fan_out(op: &mut ExtractOp<'_, '_>, blob_id: BlobId) -> Result<()> {
    let temp = tempfile::NamedTempFile::new_in(op.target)
        .map_err(|e| Error::resource(ResourceOp::Open, op.target, e))?;
    {
        let ExtractOp {
            source,
            decompressor,
            blobs,
            info,
            ..
        } = op;
        let blob = blobs.get(blob_id);
        let mut hashing = HashingWriter::new(temp.as_file());
        read_blob(source, *decompressor, info.chunk_size, blob, &mut hashing)?;
        if hashing.digest() != blob.hash {
            return Err(Error::CorruptBlob(blob.hash));
        }
    }
    fan_out_blob(op, blob_id, BlobSource::TempFile(temp.path()))?;
    // NamedTempFile unlinks on drop.
    Ok(())
}

/// Writes one blob to every back-referencing dentry, then finishes its
/// accounting. Each dentry is processed once, guarded by its `tmp_flag`.
pub(crate) fn fan_out_blob(
    op: &mut ExtractOp<'_, '_>,
    blob_id: BlobId,
    source: BlobSource<'_>,
) -> Result<()> {
    let refs: Vec<DentryId> = op.blobs.get(blob_id).scratch.refs.iter().copied().collect();
    let size = op.blobs.get(blob_id).size;

    let result = (|| -> Result<()> {
        for &dentry in &refs {
            write_blob_to_dentry(op, blob_id, dentry, source)?;
        }
        Ok(())
    })();

    for &dentry in &refs {
        op.tree.dentry_mut(dentry).scratch.tmp_flag = false;
    }
    result?;

    let blob = op.blobs.get_mut(blob_id);
    blob.scratch.out_refcnt = 0;
    blob.scratch.in_extraction_list = false;
    op.blob_done(size)
}

/// Writes every stream of `dentry` that references `blob_id` to the
/// dentry's path.
fn write_blob_to_dentry(
    op: &mut ExtractOp<'_, '_>,
    blob_id: BlobId,
    dentry: DentryId,
    source: BlobSource<'_>,
) -> Result<()> {
    if op.tree.dentry(dentry).scratch.tmp_flag || op.tree.dentry(dentry).scratch.was_hardlinked {
        return Ok(());
    }
    op.tree.dentry_mut(dentry).scratch.tmp_flag = true;

    let path = op.dentry_output_path(dentry);
    let hash = op.blobs.get(blob_id).hash;
    let inode_id = op.tree.dentry(dentry).inode;

    let mut matching: Vec<Option<WideString>> = Vec::new();
    {
        let inode = op.tree.inode(inode_id);
        if inode.unnamed_blob_hash() == Some(hash) {
            matching.push(None);
        }
        if op.features.named_data_streams && !op.opts.linked_extraction() {
            for stream in &inode.named_streams {
                if stream.source == Some(StreamSource::Blob(hash)) {
                    matching.push(Some(stream.name.clone()));
                }
            }
        }
    }

    for name in matching {
        write_blob_once(op, blob_id, &path, name.as_ref(), source)?;
    }
    Ok(())
}

/// One verified write of a whole blob to one stream of one path.
///
/// The archive itself is only read for the blob's first materialization;
/// later copies re-read the first extracted file, so a blob costs one
/// archive read no matter how wide it fans out.
fn write_blob_once(
    op: &mut ExtractOp<'_, '_>,
    blob_id: BlobId,
    path: &Path,
    name: Option<&WideString>,
    blob_source: BlobSource<'_>,
) -> Result<()> {
    let ExtractOp {
        source,
        decompressor,
        blobs,
        backend,
        info,
        ..
    } = op;
    let blob = blobs.get(blob_id);
    let (expected_hash, size) = (blob.hash, blob.size);

    match (blob_source, &blob.scratch.extracted_file) {
        (BlobSource::TempFile(temp_path), _) => {
            let file = File::open(temp_path)
                .map_err(|e| Error::resource(ResourceOp::Open, temp_path, e))?;
            let mut reader = file.take(size);
            write_one_stream(&mut **backend, path, name, size, &mut reader)?;
        }
        (BlobSource::Original, Some(first)) => {
            let file =
                File::open(first).map_err(|e| Error::resource(ResourceOp::Open, first, e))?;
            let mut reader = file.take(size);
            write_one_stream(&mut **backend, path, name, size, &mut reader)?;
        }
        (BlobSource::Original, None) => {
            let reader = open_blob_reader(source, *decompressor, info.chunk_size, blob)?;
            let mut hashing = HashingReader::new(reader);
            write_one_stream(&mut **backend, path, name, size, &mut hashing)?;
            if hashing.digest() != expected_hash {
                return Err(Error::CorruptBlob(expected_hash));
            }
        }
    }

    if name.is_none() {
        let blob = blobs.get_mut(blob_id);
        if blob.scratch.extracted_file.is_none() {
            blob.scratch.extracted_file = Some(path.to_path_buf());
        }
    }
    Ok(())
}
