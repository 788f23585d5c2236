//! Blob reference planning: resolving every extractable stream to a blob
//! and counting how many places each blob has to be written to.
//!
//! Inodes are visited once when the backend supports hard links (later
//! links reuse the first materialization and contribute no stream
//! references). Back-reference lists are populated only when a later
//! fan-out pass will need them; the single-pass strategy extracts per
//! dentry and never consults them.

use wim_dtyp::Sha1Hash;

use super::ExtractOp;
use crate::Result;
use crate::blob::BlobLocation;
use crate::tree::{DentryId, StreamSource};

pub(crate) fn plan_refs(op: &mut ExtractOp<'_, '_>) -> Result<()> {
    let linked = op.opts.linked_extraction();
    let ids: Vec<DentryId> = op.tree.preorder(op.root).collect();

    for id in ids {
        if op.tree.dentry(id).scratch.skipped {
            continue;
        }
        let inode_id = op.tree.dentry(id).inode;
        if op.features.hard_links {
            if op.tree.inode(inode_id).scratch.visited {
                // A later hard link of an already-planned inode.
                continue;
            }
            op.tree.inode_mut(inode_id).scratch.visited = true;
        }
        if op.is_unix_special(inode_id) {
            // FIFOs, device nodes and sockets carry no stream data.
            continue;
        }

        let mut hashes: Vec<Sha1Hash> = Vec::new();
        {
            let inode = op.tree.inode(inode_id);
            if let Some(StreamSource::Blob(hash)) = &inode.unnamed_stream {
                hashes.push(*hash);
            }
            if op.features.named_data_streams && !linked {
                for stream in &inode.named_streams {
                    if let Some(StreamSource::Blob(hash)) = &stream.source {
                        hashes.push(*hash);
                    }
                }
            }
        }
        for hash in hashes {
            add_ref(op, id, hash);
        }
    }

    op.total_streams = op.extraction_list.len() as u64;
    op.progress_step = (op.total_bytes / 128).max(1);
    op.next_progress = op.progress_step;
    Ok(())
}

fn add_ref(op: &mut ExtractOp<'_, '_>, dentry: DentryId, hash: Sha1Hash) {
    // A stream whose blob is nowhere to be found is silently skipped.
    let Some(blob_id) = op.blobs.lookup(&hash) else {
        return;
    };
    let blob = op.blobs.get_mut(blob_id);
    if matches!(blob.location, BlobLocation::Nonexistent) {
        return;
    }

    if blob.scratch.out_refcnt == 0 {
        blob.scratch.in_extraction_list = true;
        op.extraction_list.push(blob_id);
        op.num_streams_remaining += 1;
        op.total_bytes += blob.size;
    }
    if op.sequential_refs && blob.scratch.refs.last() != Some(dentry) {
        blob.scratch.refs.push(dentry);
    }
    blob.scratch.out_refcnt += 1;
}

/// Orders the extraction list by on-archive offset so sequential
/// extraction reads the source front to back. Blobs living outside the
/// archive sort last.
pub(crate) fn sort_extraction_list(op: &mut ExtractOp<'_, '_>) {
    let mut list = std::mem::take(&mut op.extraction_list);
    list.sort_by_key(|&id| op.blobs.get(id).archive_offset().unwrap_or(u64::MAX));
    op.extraction_list = list;
}
