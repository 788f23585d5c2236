//! Per-image feature tally and capability matching.
//!
//! The tree is walked once to count what the image actually uses; the
//! counts are then compared against the backend's advertised feature set.
//! Most mismatches demote to warnings (the feature is stripped); the
//! strict options and the linked-extraction modes turn the corresponding
//! mismatch into a hard error before any file is created.

use super::ExtractOp;
use super::backend::BackendFeatures;
use crate::extract::ExtractOptions;
use crate::{Error, Result};

/// How often each extractable feature occurs in the image.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct FeatureCounts {
    pub archive_files: u64,
    pub hidden_files: u64,
    pub system_files: u64,
    pub compressed_files: u64,
    pub encrypted_files: u64,
    pub not_content_indexed_files: u64,
    pub sparse_files: u64,
    pub named_data_streams: u64,
    pub hard_links: u64,
    pub reparse_points: u64,
    pub symlink_reparse_points: u64,
    pub other_reparse_points: u64,
    pub security_descriptors: u64,
    pub short_names: u64,
    pub unix_data: u64,
}

/// Tallies features over the non-skipped part of the tree. Inode-level
/// features are counted once per inode; every additional dentry of a
/// shared inode counts as one hard link.
pub(crate) fn tally(op: &ExtractOp<'_, '_>) -> FeatureCounts {
    let mut counts = FeatureCounts::default();
    let mut seen = vec![false; op.tree.inode_count()];

    for id in op.tree.preorder(op.root) {
        let dentry = op.tree.dentry(id);
        if dentry.scratch.skipped {
            continue;
        }
        if dentry.short_name.is_some() {
            counts.short_names += 1;
        }

        let inode_idx = dentry.inode.0 as usize;
        if seen[inode_idx] {
            counts.hard_links += 1;
            continue;
        }
        seen[inode_idx] = true;

        let inode = op.tree.inode(dentry.inode);
        let attrs = &inode.attributes;
        counts.archive_files += attrs.archive() as u64;
        counts.hidden_files += attrs.hidden() as u64;
        counts.system_files += attrs.system() as u64;
        counts.compressed_files += attrs.compressed() as u64;
        counts.encrypted_files += attrs.encrypted() as u64;
        counts.not_content_indexed_files += attrs.not_content_indexed() as u64;
        counts.sparse_files += attrs.sparse_file() as u64;

        counts.named_data_streams += inode.named_streams.len() as u64;
        if inode.is_reparse_point() {
            counts.reparse_points += 1;
            if inode.reparse_tag.is_symlink() {
                counts.symlink_reparse_points += 1;
            } else {
                counts.other_reparse_points += 1;
            }
        }
        counts.security_descriptors += inode.security_id.is_some() as u64;
        counts.unix_data += inode.unix_data.is_some() as u64;
    }
    counts
}

/// Compares the tally against the backend capabilities, logging a warning
/// for each stripped feature and failing where the options demand
/// fidelity.
pub(crate) fn check(
    counts: &FeatureCounts,
    features: &BackendFeatures,
    opts: &ExtractOptions,
) -> Result<()> {
    // Hard failures first, so nothing is created on a doomed extraction.
    if opts.hardlink && !features.hard_links {
        return Err(Error::Unsupported(
            "hardlink extraction requested but the backend cannot create hard links".to_string(),
        ));
    }
    if opts.symlink && !features.symlink_reparse_points {
        return Err(Error::Unsupported(
            "symlink extraction requested but the backend cannot create symlinks".to_string(),
        ));
    }
    if opts.unix_data && !features.unix_data {
        return Err(Error::Unsupported(
            "UNIX metadata extraction requested but the backend does not support it".to_string(),
        ));
    }
    if opts.strict_acls && counts.security_descriptors > 0 && !features.security_descriptors {
        return Err(Error::Unsupported(format!(
            "strict ACL mode: {} security descriptors cannot be applied by this backend",
            counts.security_descriptors
        )));
    }
    if opts.strict_short_names && counts.short_names > 0 && !features.short_names {
        return Err(Error::Unsupported(format!(
            "strict short-name mode: {} short names cannot be applied by this backend",
            counts.short_names
        )));
    }
    if opts.strict_symlinks && counts.symlink_reparse_points > 0 && !features.symlink_reparse_points
    {
        return Err(Error::Unsupported(format!(
            "strict symlink mode: {} symlinks cannot be created by this backend",
            counts.symlink_reparse_points
        )));
    }
    if opts.strict_timestamps && !features.timestamps {
        return Err(Error::Unsupported(
            "strict timestamp mode: the backend cannot set timestamps".to_string(),
        ));
    }

    // The rest strips with a warning.
    if !features.file_attributes {
        warn_stripped(counts.archive_files, "the archive attribute");
        warn_stripped(counts.hidden_files, "the hidden attribute");
        warn_stripped(counts.system_files, "the system attribute");
    }
    if !features.not_content_indexed {
        warn_stripped(
            counts.not_content_indexed_files,
            "the not-content-indexed attribute",
        );
    }
    if !features.compressed_files {
        warn_stripped(counts.compressed_files, "transparent compression");
    }
    if !features.encrypted_files {
        warn_stripped(counts.encrypted_files, "encryption");
    }
    if !features.sparse_files {
        warn_stripped(counts.sparse_files, "the sparse attribute");
    }
    if !features.named_data_streams {
        warn_stripped(counts.named_data_streams, "named data streams");
    }
    if !features.hard_links && counts.hard_links > 0 {
        log::warn!(
            "{} hard links are not supported by this backend; files will be duplicated",
            counts.hard_links
        );
    }
    if !features.reparse_points {
        let inexpressible = if features.symlink_reparse_points {
            counts.other_reparse_points
        } else {
            counts.reparse_points
        };
        if inexpressible > 0 {
            log::warn!("{inexpressible} reparse points will be omitted");
        }
    }
    if !features.security_descriptors && !opts.no_acls {
        warn_stripped(counts.security_descriptors, "security descriptors");
    }
    if !features.short_names {
        warn_stripped(counts.short_names, "short (DOS) names");
    }
    Ok(())
}

fn warn_stripped(count: u64, what: &str) {
    if count > 0 {
        log::warn!("{count} files use {what}, which this backend cannot preserve");
    }
}
