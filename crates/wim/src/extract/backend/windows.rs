//! Extraction backend for Win32 targets.
//!
//! Uses only the standard library surface: files, directories, hard
//! links, symlinks, alternate data streams through `path:stream` names,
//! and full timestamp application (creation time included). DOS attribute
//! words, short names and security descriptors need native API calls and
//! are advertised as unsupported here.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::Read;
use std::os::windows::fs::FileTimesExt;
use std::path::Path;

use wim_dtyp::{FileTime, ReparseData, WideString};

use super::{Backend, BackendFeatures, PathCaps};
use crate::error::ResourceOp;
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct Win32Backend {
    _private: (),
}

impl Win32Backend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for Win32Backend {
    fn name(&self) -> &'static str {
        "Win32"
    }

    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            named_data_streams: true,
            hard_links: true,
            symlink_reparse_points: true,
            timestamps: true,
            ..BackendFeatures::default()
        }
    }

    fn path_caps(&self) -> PathCaps {
        PathCaps {
            path_max: 32767,
            path_prefix: "\\\\?\\",
            path_separator: '\\',
            requires_target_in_paths: true,
            requires_realtarget_in_paths: true,
            realpath_works_on_nonexisting_files: false,
            supports_case_sensitive_filenames: false,
            target_is_root: false,
            root_directory_is_special: false,
            windows_naming_rules: true,
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
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
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
        std::os::windows::fs::symlink_file(target, link)
            .map_err(|e| Error::resource(ResourceOp::Write, link, e))
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

    fn write_named_stream(
        &mut self,
        path: &Path,
        name: &WideString,
        size: u64,
        data: Option<&mut dyn Read>,
    ) -> Result<()> {
        let stream_path = ads_path(path, name);
        let mut file = fs::File::create(&stream_path)
            .map_err(|e| Error::resource(ResourceOp::Open, Path::new(&stream_path), e))?;
        let Some(data) = data else {
            return Ok(());
        };
        let copied = std::io::copy(data, &mut file)
            .map_err(|e| Error::resource(ResourceOp::Write, Path::new(&stream_path), e))?;
        if copied != size {
            return Err(Error::InvalidResource(format!(
                "stream for '{}' ended after {copied} of {size} bytes",
                Path::new(&stream_path).display()
            )));
        }
        Ok(())
    }

    fn set_reparse_data(&mut self, path: &Path, reparse: &ReparseData) -> Result<()> {
        let ReparseData::Link(link) = reparse else {
            return Err(self.unsupported("non-symlink reparse points"));
        };
        let mut target = link.substitute_name.to_string_lossy();
        for prefix in ["\\??\\", "\\\\?\\"] {
            if let Some(stripped) = target.strip_prefix(prefix) {
                target = stripped.to_string();
                break;
            }
        }
        self.create_symlink(OsStr::new(&target), path)
    }

    fn set_timestamps(
        &mut self,
        path: &Path,
        creation: FileTime,
        last_write: FileTime,
        last_access: FileTime,
    ) -> Result<()> {
        let file = fs::File::options()
            .write(true)
            .open(path)
            .map_err(|e| Error::resource(ResourceOp::Open, path, e))?;
        let mut times = fs::FileTimes::new();
        if creation.is_set() {
            times = times.set_created(creation.into());
        }
        if last_write.is_set() {
            times = times.set_modified(last_write.into());
        }
        if last_access.is_set() {
            times = times.set_accessed(last_access.into());
        }
        file.set_times(times)
            .map_err(|e| Error::resource(ResourceOp::Write, path, e))
    }
}

/// `file.txt:stream` form addressing an alternate data stream.
fn ads_path(path: &Path, name: &WideString) -> OsString {
    let mut full = path.as_os_str().to_os_string();
    full.push(":");
    full.push(name.to_string_lossy());
    full
}
