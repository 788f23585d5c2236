//! The pluggable filesystem-writer layer.
//!
//! A backend is a capability bundle: a feature set describing what the
//! target filesystem can represent, path-handling properties, and the
//! write operations themselves. The engine consults [`Backend::features`]
//! before invoking an operation; operations a target cannot support keep
//! their default body and return [`Error::Unsupported`] if called anyway.

use std::ffi::OsStr;
use std::io::Read;
use std::path::Path;

use wim_dtyp::{FileAttributes, FileTime, ReparseData, WideString};

use crate::tree::UnixData;
use crate::{Error, Result};

#[cfg(unix)]
mod posix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use posix::PosixBackend;
#[cfg(windows)]
pub use windows::Win32Backend;

/// Feature categories a target filesystem may or may not support.
///
/// Mirrors the per-image feature tally; the extraction engine compares the
/// two and warns or fails before touching the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendFeatures {
    /// DOS attribute flags (archive, hidden, system, ...).
    pub file_attributes: bool,
    pub compressed_files: bool,
    pub encrypted_files: bool,
    pub not_content_indexed: bool,
    pub sparse_files: bool,
    pub named_data_streams: bool,
    pub hard_links: bool,
    /// Reparse points with arbitrary tags.
    pub reparse_points: bool,
    /// Symlink/junction reparse points, possibly expressed natively.
    pub symlink_reparse_points: bool,
    pub security_descriptors: bool,
    pub short_names: bool,
    pub unix_data: bool,
    pub timestamps: bool,
}

/// Path-handling properties of a backend.
#[derive(Debug, Clone, Copy)]
pub struct PathCaps {
    pub path_max: usize,
    /// Prefix prepended to absolute target paths (e.g. `\\?\`).
    pub path_prefix: &'static str,
    pub path_separator: char,
    pub requires_target_in_paths: bool,
    pub requires_realtarget_in_paths: bool,
    pub realpath_works_on_nonexisting_files: bool,
    pub supports_case_sensitive_filenames: bool,
    pub target_is_root: bool,
    pub root_directory_is_special: bool,
    /// Apply the Windows filename character rules during sanitization.
    pub windows_naming_rules: bool,
}

/// Abstract filesystem-write operations.
///
/// Paths handed to operations are always target-absolute and consist only
/// of components the name sanitizer approved.
pub trait Backend {
    fn name(&self) -> &'static str;
    fn features(&self) -> BackendFeatures;
    fn path_caps(&self) -> PathCaps;

    /// Prepares the target; called once before any other operation.
    /// The target directory exists (or was just created) when this
    /// returns.
    fn start_extract(&mut self, target: &Path) -> Result<()>;

    /// Called once after a fully successful extraction.
    fn finish_extract(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when extraction unwinds on an error; best-effort cleanup.
    fn abort_extract(&mut self) {}

    fn create_directory(&mut self, path: &Path) -> Result<()>;
    fn create_file(&mut self, path: &Path) -> Result<()>;
    fn create_hardlink(&mut self, existing: &Path, link: &Path) -> Result<()>;
    fn create_symlink(&mut self, target: &OsStr, link: &Path) -> Result<()>;

    /// Creates a FIFO, device node or socket from UNIX sidecar data.
    fn create_special_file(&mut self, _path: &Path, _data: &UnixData) -> Result<()> {
        Err(self.unsupported("special files"))
    }

    /// Writes `size` bytes from `data` as the file's default contents.
    fn write_unnamed_stream(&mut self, path: &Path, size: u64, data: &mut dyn Read)
    -> Result<()>;

    /// Writes an alternate data stream; `data` is `None` for a zero-length
    /// stream.
    fn write_named_stream(
        &mut self,
        _path: &Path,
        _name: &WideString,
        _size: u64,
        _data: Option<&mut dyn Read>,
    ) -> Result<()> {
        Err(self.unsupported("named data streams"))
    }

    /// Writes raw EFS data for an encrypted file.
    fn write_encrypted_stream(
        &mut self,
        _path: &Path,
        _size: u64,
        _data: &mut dyn Read,
    ) -> Result<()> {
        Err(self.unsupported("encrypted streams"))
    }

    fn set_file_attributes(&mut self, _path: &Path, _attributes: FileAttributes) -> Result<()> {
        Err(self.unsupported("file attributes"))
    }

    fn set_short_name(&mut self, _path: &Path, _short_name: &WideString) -> Result<()> {
        Err(self.unsupported("short names"))
    }

    fn set_reparse_data(&mut self, _path: &Path, _reparse: &ReparseData) -> Result<()> {
        Err(self.unsupported("reparse points"))
    }

    fn set_security_descriptor(&mut self, _path: &Path, _descriptor: &[u8]) -> Result<()> {
        Err(self.unsupported("security descriptors"))
    }

    fn set_unix_data(&mut self, _path: &Path, _data: &UnixData) -> Result<()> {
        Err(self.unsupported("UNIX metadata"))
    }

    fn set_timestamps(
        &mut self,
        _path: &Path,
        _creation: FileTime,
        _last_write: FileTime,
        _last_access: FileTime,
    ) -> Result<()> {
        Err(self.unsupported("timestamps"))
    }

    #[doc(hidden)]
    fn unsupported(&self, what: &str) -> Error {
        Error::Unsupported(format!("the {} backend does not support {what}", self.name()))
    }
}

/// Picks the platform's native backend.
pub fn make_backend(ntfs_volume: bool) -> Result<Box<dyn Backend>> {
    if ntfs_volume {
        return Err(Error::Unsupported(
            "extraction directly to an NTFS volume requires a libntfs-3g backend, \
             which is not built into this crate"
                .to_string(),
        ));
    }
    #[cfg(unix)]
    {
        return Ok(Box::new(PosixBackend::new()));
    }
    #[cfg(windows)]
    {
        return Ok(Box::new(Win32Backend::new()));
    }
    #[cfg(not(any(unix, windows)))]
    {
        Err(Error::Unsupported(
            "no extraction backend for this platform".to_string(),
        ))
    }
}
