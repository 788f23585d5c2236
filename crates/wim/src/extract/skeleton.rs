//! The first filesystem pass: directories, empty files, empty named
//! streams, attributes, short names, and hardlink wiring.
//!
//! Stream contents are written here too when the single-pass strategy is
//! active; otherwise a later pass fans blobs out over the skeleton.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use super::{ExtractOp, LinkPhase, streams};
use crate::progress::ProgressEvent;
use crate::tree::DentryId;
use crate::{Error, Result};

pub(crate) fn build(op: &mut ExtractOp<'_, '_>, single_pass: bool) -> Result<()> {
    visit(op, op.root, op.root_path.clone(), single_pass)
}

fn visit(op: &mut ExtractOp<'_, '_>, id: DentryId, path: PathBuf, single_pass: bool) -> Result<()> {
    if op.tree.dentry(id).scratch.skipped {
        return Ok(());
    }
    let is_root = id == op.root;
    let inode_id = op.tree.dentry(id).inode;
    let (is_dir, is_regular, link_count, unnamed_hash, attributes, defer_as_symlink) = {
        let inode = op.tree.inode(inode_id);
        let defer = inode.is_reparse_point()
            && !op.features.reparse_points
            && op.features.symlink_reparse_points
            && inode.reparse_tag.is_link();
        (
            inode.is_directory(),
            inode.is_regular_file(),
            inode.link_count,
            inode.unnamed_blob_hash(),
            inode.attributes,
            defer,
        )
    };

    if !is_root {
        // A link of an inode that already has a body on disk.
        if let Some(existing) = op.tree.inode(inode_id).scratch.extracted_path.clone() {
            op.backend.create_hardlink(&existing, &path)?;
            op.tree.dentry_mut(id).scratch.was_hardlinked = true;
            op.emit(&ProgressEvent::ExtractDentry { path: &path })?;
            return Ok(());
        }
        // Identical file already extracted by an earlier image.
        if op.link_phase == LinkPhase::Link && is_regular {
            if let Some(first) = unnamed_hash.and_then(|h| op.link_map.get(&h)).cloned() {
                if op.opts.hardlink {
                    op.backend.create_hardlink(&first, &path)?;
                } else {
                    let rel = relative_symlink_target(&path, &first)?;
                    op.backend.create_symlink(&rel, &path)?;
                }
                op.tree.dentry_mut(id).scratch.was_hardlinked = true;
                op.emit(&ProgressEvent::ExtractDentry { path: &path })?;
                return Ok(());
            }
        }
    }

    // Symlink-style reparse points on backends without native reparse
    // support are created whole by the finalizer; nothing to do yet.
    if !defer_as_symlink {
        let is_special = !is_dir && op.is_unix_special(inode_id);
        if is_dir {
            // The extraction root directory was already set up by
            // start_extract when it coincides with the target.
            if !(is_root && path == op.target) {
                op.backend.create_directory(&path)?;
            }
        } else if is_special {
            let data = op
                .tree
                .inode(inode_id)
                .unix_data
                .expect("special files carry UNIX data");
            op.backend.create_special_file(&path, &data)?;
        } else {
            op.backend.create_file(&path)?;
        }

        if !is_special {
            if single_pass {
                streams::write_dentry_streams(op, id, &path, true)?;
            } else {
                // Metadata-resident stream bytes never reach the blob
                // passes.
                streams::write_dentry_streams(op, id, &path, false)?;
            }
        }

        // Named streams without a blob still need their (empty) stream
        // entries.
        if !is_special && op.features.named_data_streams && !op.opts.linked_extraction() {
            let empty_names: Vec<_> = op
                .tree
                .inode(inode_id)
                .named_streams
                .iter()
                .filter(|s| s.source.is_none())
                .map(|s| s.name.clone())
                .collect();
            for name in empty_names {
                op.backend.write_named_stream(&path, &name, 0, None)?;
            }
        }

        if op.features.file_attributes {
            op.backend.set_file_attributes(&path, attributes)?;
        }

        if op.features.short_names {
            if let Some(short) = op.tree.dentry(id).short_name.clone() {
                match op.backend.set_short_name(&path, &short) {
                    Ok(()) => {}
                    Err(err) if op.opts.strict_short_names => return Err(err),
                    Err(err) => {
                        log::warn!("failed to set short name on '{}': {err}", path.display())
                    }
                }
            }
        }

        if link_count > 1 && op.features.hard_links {
            op.tree.inode_mut(inode_id).scratch.extracted_path = Some(path.clone());
        }

        if op.link_phase == LinkPhase::Record && is_regular {
            if let Some(hash) = unnamed_hash {
                op.link_map.entry(hash).or_insert_with(|| path.clone());
            }
        }

        op.emit(&ProgressEvent::ExtractDentry { path: &path })?;
    }

    let children = op.tree.dentry(id).children.clone();
    for child in children {
        if op.tree.dentry(child).scratch.skipped {
            continue;
        }
        let name = op
            .tree
            .dentry(child)
            .scratch
            .extraction_name
            .clone()
            .expect("non-skipped dentry has a sanitized name");
        visit(op, child, path.join(name), single_pass)?;
    }
    Ok(())
}

/// Builds the relative symlink target for multi-image symlink extraction:
/// walk up from the link's directory to the common ancestor, then down
/// the first extraction's path.
fn relative_symlink_target(link: &Path, first: &Path) -> Result<OsString> {
    let link_dir = link.parent().ok_or_else(|| {
        Error::InvalidParameter(format!("link path '{}' has no parent", link.display()))
    })?;
    let from: Vec<Component<'_>> = link_dir.components().collect();
    let to: Vec<Component<'_>> = first.components().collect();
    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for component in &to[common..] {
        rel.push(component);
    }
    Ok(rel.into_os_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_symlink_target_shared_root() {
        let rel = relative_symlink_target(
            Path::new("/out/img2/dir/app.exe"),
            Path::new("/out/img1/dir/app.exe"),
        )
        .unwrap();
        assert_eq!(rel, OsString::from("../../img1/dir/app.exe"));
    }

    #[test]
    fn test_relative_symlink_target_sibling() {
        let rel =
            relative_symlink_target(Path::new("/out/b.txt"), Path::new("/out/a.txt")).unwrap();
        assert_eq!(rel, OsString::from("a.txt"));
    }
}
