//! Extraction backend for POSIX filesystems.
//!
//! DOS attributes, named data streams, short names and security
//! descriptors have no POSIX representation and are advertised as
//! unsupported; the engine strips them with warnings. Symlink reparse
//! points are expressed as native symlinks during finalization.

use std::ffi::{CString, OsStr, OsString};
use std::fs;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use wim_dtyp::{FileTime, ReparseData, WideString};

use super::{Backend, BackendFeatures, PathCaps};
use crate::error::ResourceOp;
use crate::tree::UnixData;
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct PosixBackend {
    _private: (),
}

impl PosixBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for PosixBackend {
    fn name(&self) -> &'static str {
        "POSIX"
    }

    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            hard_links: true,
            symlink_reparse_points: true,
            unix_data: true,
            timestamps: true,
            ..BackendFeatures::default()
        }
    }

    fn path_caps(&self) -> PathCaps {
        PathCaps {
            path_max: 4096,
            path_prefix: "",
            path_separator: '/',
            requires_target_in_paths: true,
            requires_realtarget_in_paths: false,
            realpath_works_on_nonexisting_files: false,
            supports_case_sensitive_filenames: true,
            target_is_root: false,
            root_directory_is_special: false,
            windows_naming_rules: false,
        }
    }

    fn start_extract(&mut self, target: &Path) -> Result<()> {
        match fs::metadata(target) {
            Ok(meta) if !meta.is_dir() => return Err(Error::NotADirectory(target.to_path_buf())),
            Ok(_) => return Ok(()),
            Err(_) => {}
        }
        fs::create_dir_all(target).map_err(|e| Error::resource(ResourceOp::Mkdir, target, e))
    }

    fn create_directory(&mut self, path: &Path) -> Result<()> {
        match fs::create_dir(path) {
            Ok(()) => Ok(()),
            // Re-extraction over an existing tree is allowed.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists
                && path.is_dir() =>
            {
                Ok(())
            }
            Err(e) => Err(Error::resource(ResourceOp::Mkdir, path, e)),
        }
    }

    fn create_file(&mut self, path: &Path) -> Result<()> {
        fs::File::create(path)
            .map(drop)
            .map_err(|e| Error::resource(ResourceOp::Open, path, e))
    }

    fn create_hardlink(&mut self, existing: &Path, link: &Path) -> Result<()> {
        if fs::symlink_metadata(link).is_ok() {
            fs::remove_file(link).map_err(|e| Error::resource(ResourceOp::Write, link, e))?;
        }
        fs::hard_link(existing, link).map_err(|e| Error::resource(ResourceOp::Write, link, e))
    }

    fn create_symlink(&mut self, target: &OsStr, link: &Path) -> Result<()> {
        if fs::symlink_metadata(link).is_ok() {
            fs::remove_file(link).map_err(|e| Error::resource(ResourceOp::Write, link, e))?;
        }
        std::os::unix::fs::symlink(target, link)
            .map_err(|e| Error::resource(ResourceOp::Write, link, e))
    }

    fn create_special_file(&mut self, path: &Path, data: &UnixData) -> Result<()> {
        if fs::symlink_metadata(path).is_ok() {
            fs::remove_file(path).map_err(|e| Error::resource(ResourceOp::Write, path, e))?;
        }
        let cpath = cstring_path(path)?;
        let perms = (data.mode & 0o7777) as libc::mode_t;
        let rc = if data.is_fifo() {
            unsafe { libc::mkfifo(cpath.as_ptr(), perms) }
        } else {
            unsafe {
                libc::mknod(
                    cpath.as_ptr(),
                    (data.file_type() | perms as u32) as libc::mode_t,
                    data.rdev as libc::dev_t,
                )
            }
        };
        if rc != 0 {
            return Err(Error::resource(
                ResourceOp::Open,
                path,
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    fn write_unnamed_stream(
        &mut self,
        path: &Path,
        size: u64,
        data: &mut dyn Read,
    ) -> Result<()> {
        let mut file =
            fs::File::create(path).map_err(|e| Error::resource(ResourceOp::Open, path, e))?;
        let copied = std::io::copy(data, &mut file)
            .map_err(|e| Error::resource(ResourceOp::Write, path, e))?;
        if copied != size {
            return Err(Error::InvalidResource(format!(
                "stream for '{}' ended after {copied} of {size} bytes",
                path.display()
            )));
        }
        Ok(())
    }

    fn set_reparse_data(&mut self, path: &Path, reparse: &ReparseData) -> Result<()> {
        let ReparseData::Link(link) = reparse else {
            return Err(self.unsupported("non-symlink reparse points"));
        };
        self.create_symlink(&symlink_target_from(&link.substitute_name), path)
    }

    fn set_unix_data(&mut self, path: &Path, data: &UnixData) -> Result<()> {
        let cpath = cstring_path(path)?;
        // lchown so symlink ownership lands on the link itself.
        let rc = unsafe { libc::lchown(cpath.as_ptr(), data.uid, data.gid) };
        if rc != 0 {
            return Err(Error::resource(
                ResourceOp::Write,
                path,
                std::io::Error::last_os_error(),
            ));
        }
        let meta = fs::symlink_metadata(path)
            .map_err(|e| Error::resource(ResourceOp::Stat, path, e))?;
        if !meta.file_type().is_symlink() {
            let rc = unsafe { libc::chmod(cpath.as_ptr(), (data.mode & 0o7777) as libc::mode_t) };
            if rc != 0 {
                return Err(Error::resource(
                    ResourceOp::Write,
                    path,
                    std::io::Error::last_os_error(),
                ));
            }
        }
        Ok(())
    }

    fn set_timestamps(
        &mut self,
        path: &Path,
        _creation: FileTime,
        last_write: FileTime,
        last_access: FileTime,
    ) -> Result<()> {
        // Creation time is not settable through POSIX interfaces.
        let cpath = cstring_path(path)?;
        let times = [
            filetime_to_timespec(last_access),
            filetime_to_timespec(last_write),
        ];
        let rc = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                cpath.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc != 0 {
            return Err(Error::resource(
                ResourceOp::Write,
                path,
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

/// Converts a stored link target to the host form: strips the NT object
/// namespace prefix and flips the separators.
fn symlink_target_from(substitute_name: &WideString) -> OsString {
    let mut target = substitute_name.to_string_lossy();
    for prefix in ["\\??\\", "\\\\?\\"] {
        if let Some(stripped) = target.strip_prefix(prefix) {
            target = stripped.to_string();
            break;
        }
    }
    OsString::from(target.replace('\\', "/"))
}

fn cstring_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidParameter(format!("path contains NUL: {}", path.display())))
}

fn filetime_to_timespec(time: FileTime) -> libc::timespec {
    if !time.is_set() {
        // Unset in the archive; leave whatever the filesystem put there.
        return libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        };
    }
    let (secs, nanos) = time.unix_parts();
    libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: nanos as libc::c_long,
    }
}
