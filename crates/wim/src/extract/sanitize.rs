//! Mapping WIM filenames onto host-legal path components.
//!
//! Runs before anything touches the target filesystem. Every dentry either
//! receives an `extraction_name` (a single, host-legal path component) or
//! is marked skipped together with its whole subtree. The extraction root
//! itself is never renamed; it maps onto the target path.

use std::ffi::OsString;

use wim_dtyp::WideString;

use super::ExtractOp;
use crate::Result;
use crate::tree::{DentryId, ImageTree};

pub(crate) fn sanitize_tree(op: &mut ExtractOp<'_, '_>) -> Result<()> {
    let caps = op.backend.path_caps();
    let windows_rules = caps.windows_naming_rules;
    let case_sensitive = caps.supports_case_sensitive_filenames;

    let mut stack = vec![op.root];
    while let Some(dir) = stack.pop() {
        let children = op.tree.dentry(dir).children.clone();
        // Names accepted so far in this directory, for collision checks.
        let mut accepted: Vec<WideString> = Vec::new();

        for child in children {
            let name = op.tree.dentry(child).name.clone();

            if name == "." || name == ".." {
                log::warn!(
                    "skipping unexpected '{}' entry at {}",
                    name,
                    op.tree.source_path(dir)
                );
                mark_subtree_skipped(op.tree, child);
                continue;
            }

            // Entry types the backend has no representation for at all.
            let inode = op.tree.inode_of(child);
            if inode.is_reparse_point() {
                let expressible = op.features.reparse_points
                    || (op.features.symlink_reparse_points && inode.reparse_tag.is_link());
                if !expressible {
                    log::warn!(
                        "skipping {}: reparse point with tag {:?} is not supported by the {} backend",
                        op.tree.source_path(child),
                        inode.reparse_tag,
                        op.backend.name()
                    );
                    mark_subtree_skipped(op.tree, child);
                    continue;
                }
            }

            let mut chosen: Option<String> = None;

            if windows_rules
                && !case_sensitive
                && accepted.iter().any(|a| a.eq_ignore_case(&name))
            {
                if op.opts.all_case_conflicts {
                    op.invalid_name_counter += 1;
                    let dummy = format!(
                        "{} (invalid filename #{})",
                        substitute_invalid_units(&name, windows_rules),
                        op.invalid_name_counter
                    );
                    log::warn!(
                        "{} collides case-insensitively with a sibling; extracting as '{dummy}'",
                        op.tree.source_path(child)
                    );
                    chosen = Some(dummy);
                } else {
                    log::warn!(
                        "skipping {}: name collides case-insensitively with a sibling",
                        op.tree.source_path(child)
                    );
                    mark_subtree_skipped(op.tree, child);
                    continue;
                }
            }

            if chosen.is_none() && name_has_invalid_units(&name, windows_rules) {
                if op.opts.replace_invalid_filenames {
                    op.invalid_name_counter += 1;
                    let replaced = format!(
                        "{} (invalid filename #{})",
                        substitute_invalid_units(&name, windows_rules),
                        op.invalid_name_counter
                    );
                    log::warn!(
                        "{} contains characters invalid on this target; extracting as '{replaced}'",
                        op.tree.source_path(child)
                    );
                    chosen = Some(replaced);
                } else {
                    log::warn!(
                        "skipping {}: filename is invalid on this target",
                        op.tree.source_path(child)
                    );
                    mark_subtree_skipped(op.tree, child);
                    continue;
                }
            }

            let extraction_name =
                chosen.unwrap_or_else(|| substitute_invalid_units(&name, windows_rules));
            op.tree.dentry_mut(child).scratch.extraction_name =
                Some(OsString::from(extraction_name));
            accepted.push(name);

            if op.tree.inode_of(child).is_directory() {
                stack.push(child);
            }
        }
    }
    Ok(())
}

/// Marks a dentry and every descendant as excluded from extraction.
fn mark_subtree_skipped(tree: &mut ImageTree, root: DentryId) {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        tree.dentry_mut(id).scratch.skipped = true;
        stack.extend(tree.dentry(id).children.iter().copied());
    }
}

/// `/` and NUL are forbidden everywhere; Windows-family targets also
/// forbid `\ : * ? " < > |` and names ending in a space or dot.
fn unit_is_invalid(unit: u16, windows_rules: bool) -> bool {
    if unit == 0 || unit == u16::from(b'/') {
        return true;
    }
    windows_rules
        && matches!(
            unit,
            0x5c | 0x3a | 0x2a | 0x3f | 0x22 | 0x3c | 0x3e | 0x7c
        )
}

fn name_has_invalid_units(name: &WideString, windows_rules: bool) -> bool {
    let units = name.code_units();
    if units.iter().any(|&u| unit_is_invalid(u, windows_rules)) {
        return true;
    }
    if windows_rules {
        if let Some(&last) = units.last() {
            return last == u16::from(b' ') || last == u16::from(b'.');
        }
    }
    false
}

/// Replaces each offending code unit: U+FFFD on Windows-family targets,
/// `?` on POSIX targets.
fn substitute_invalid_units(name: &WideString, windows_rules: bool) -> String {
    let replacement: u16 = if windows_rules { 0xFFFD } else { u16::from(b'?') };
    let mut units: Vec<u16> = name
        .code_units()
        .iter()
        .map(|&u| {
            if unit_is_invalid(u, windows_rules) {
                replacement
            } else {
                u
            }
        })
        .collect();
    if windows_rules {
        if let Some(last) = units.last_mut() {
            if *last == u16::from(b' ') || *last == u16::from(b'.') {
                *last = replacement;
            }
        }
    }
    WideString::from_iter(units).to_string_lossy()
}
