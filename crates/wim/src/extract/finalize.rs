//! The metadata finalization pass.
//!
//! Runs post-order so directory timestamps land after their children have
//! been fully materialized. Per dentry: reparse data (with optional
//! absolute-target fixup), then security descriptors or UNIX metadata,
//! then timestamps last so nothing clobbers them afterwards.

use std::path::{Path, PathBuf};

use wim_dtyp::{ReparseData, WideString, reparse::LinkReparse};

use super::ExtractOp;
use crate::progress::ProgressEvent;
use crate::tree::{DentryId, InodeId};
use crate::{Error, Result};

pub(crate) fn apply_metadata(op: &mut ExtractOp<'_, '_>) -> Result<()> {
    op.emit(&ProgressEvent::ApplyTimestamps)?;

    let ids: Vec<DentryId> = op.tree.postorder(op.root).collect();
    for id in ids {
        let scratch = &op.tree.dentry(id).scratch;
        if scratch.skipped || scratch.was_hardlinked {
            continue;
        }
        let path = op.dentry_output_path(id);
        let inode_id = op.tree.dentry(id).inode;

        apply_reparse(op, id, inode_id, &path)?;
        apply_security(op, inode_id, &path)?;
        apply_timestamps(op, inode_id, &path)?;
    }
    Ok(())
}

fn apply_reparse(
    op: &mut ExtractOp<'_, '_>,
    id: DentryId,
    inode_id: InodeId,
    path: &Path,
) -> Result<()> {
    let (is_reparse, tag, reparse) = {
        let inode = op.tree.inode(inode_id);
        (
            inode.is_reparse_point(),
            inode.reparse_tag,
            inode.reparse.clone(),
        )
    };
    if !is_reparse {
        return Ok(());
    }
    let expressible =
        op.features.reparse_points || (op.features.symlink_reparse_points && tag.is_link());
    if !expressible {
        // The sanitizer skips these; nothing to do if one slips through.
        return Ok(());
    }
    let Some(mut reparse) = reparse else {
        log::warn!(
            "reparse point {} has no reparse data; leaving it as created",
            op.tree.source_path(id)
        );
        return Ok(());
    };

    if op.rpfix {
        if let ReparseData::Link(link) = &mut reparse {
            if !link.relative {
                fixup_link_target(link, op.root_path.as_path())
                    .map_err(|_| Error::ReparsePointFixupFailed(op.tree.source_path(id)))?;
            }
        }
    }

    match op.backend.set_reparse_data(path, &reparse) {
        Ok(()) => Ok(()),
        Err(err) if op.opts.strict_symlinks => Err(err),
        // Symlink creation on Win32 needs a privilege many accounts do
        // not hold; only that specific failure is demoted.
        Err(err) if op.backend.name() == "Win32" && access_denied(&err) => {
            log::warn!(
                "no permission to set reparse data on '{}': {err}",
                path.display()
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn access_denied(err: &Error) -> bool {
    let kind = match err {
        Error::Resource { source, .. } => source.kind(),
        Error::IoError(source) => source.kind(),
        _ => return false,
    };
    kind == std::io::ErrorKind::PermissionDenied
}

/// Rewrites an absolute link target captured inside the image so it
/// points below the extraction root: the stored volume prefix (NT
/// namespace prefix plus drive specifier) is replaced with the root's
/// real path.
fn fixup_link_target(link: &mut LinkReparse, root: &Path) -> std::io::Result<()> {
    let stored = link.substitute_name.to_string_lossy();
    let mut rest = stored.as_str();
    for prefix in ["\\??\\", "\\\\?\\"] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    if rest.len() >= 2 && rest.as_bytes()[1] == b':' {
        rest = &rest[2..];
    }
    if !rest.starts_with('\\') && !rest.starts_with('/') {
        // Not an absolute target; leave it alone.
        return Ok(());
    }

    let root_real = root.canonicalize()?;
    let mut fixed = root_real;
    for component in rest.split(['\\', '/']).filter(|c| !c.is_empty()) {
        fixed.push(component);
    }
    let fixed = fixed_to_wide(&fixed);
    link.substitute_name = fixed.clone();
    link.print_name = fixed;
    Ok(())
}

fn fixed_to_wide(path: &PathBuf) -> WideString {
    WideString::from(path.to_string_lossy().as_ref())
}

fn apply_security(op: &mut ExtractOp<'_, '_>, inode_id: InodeId, path: &Path) -> Result<()> {
    let (security_id, unix_data) = {
        let inode = op.tree.inode(inode_id);
        (inode.security_id, inode.unix_data)
    };

    if !op.opts.no_acls && op.features.security_descriptors {
        if let Some(security_id) = security_id {
            match op.security.get(security_id) {
                None => log::warn!(
                    "security id {security_id} is out of range for this image; skipping"
                ),
                Some(descriptor) => {
                    match op.backend.set_security_descriptor(path, descriptor) {
                        Ok(()) => {}
                        Err(err) if op.opts.strict_acls => return Err(err),
                        Err(err) => log::warn!(
                            "failed to set security descriptor on '{}': {err}",
                            path.display()
                        ),
                    }
                }
            }
        }
    }

    if op.opts.unix_data {
        if let Some(unix_data) = unix_data {
            if let Err(err) = op.backend.set_unix_data(path, &unix_data) {
                log::warn!(
                    "failed to set UNIX metadata on '{}': {err}",
                    path.display()
                );
            }
        }
    }
    Ok(())
}

fn apply_timestamps(op: &mut ExtractOp<'_, '_>, inode_id: InodeId, path: &Path) -> Result<()> {
    if !op.features.timestamps {
        return Ok(());
    }
    let (creation, last_write, last_access) = {
        let inode = op.tree.inode(inode_id);
        (
            inode.creation_time,
            inode.last_write_time,
            inode.last_access_time,
        )
    };
    match op
        .backend
        .set_timestamps(path, creation, last_write, last_access)
    {
        Ok(()) => Ok(()),
        Err(err) if op.opts.strict_timestamps => Err(err),
        Err(err) => {
            log::warn!("failed to set timestamps on '{}': {err}", path.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixup_rewrites_absolute_target_under_root() {
        let root = tempfile::tempdir().unwrap();
        let mut link = LinkReparse::symlink(
            WideString::from("\\??\\C:\\Windows\\System32"),
            WideString::from("C:\\Windows\\System32"),
            false,
        );
        fixup_link_target(&mut link, root.path()).unwrap();
        let expected = root
            .path()
            .canonicalize()
            .unwrap()
            .join("Windows")
            .join("System32");
        assert_eq!(
            link.substitute_name.to_string_lossy(),
            expected.to_string_lossy()
        );
    }

    #[test]
    fn test_fixup_leaves_relative_target() {
        let root = tempfile::tempdir().unwrap();
        let mut link = LinkReparse::symlink(
            WideString::from("..\\other"),
            WideString::from("..\\other"),
            true,
        );
        let before = link.substitute_name.clone();
        fixup_link_target(&mut link, root.path()).unwrap();
        assert_eq!(link.substitute_name, before);
    }
}
