#![allow(dead_code)]

//! Shared fixtures for the extraction integration tests: synthetic image
//! trees, in-memory archives (seekable and pipable), and a recording
//! backend.

use std::ffi::{OsStr, OsString};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use binrw::BinWrite;
use wim::{
    Archive, ArchiveInfo, Backend, BackendFeatures, BlobDescriptor, BlobLocation, DentryId,
    FileAttributes, FileTime, ImageTree, Inode, LinkReparse, PathCaps, PipableStreamHeader,
    PipeStreamFlags, ProgressEvent, ProgressListener, ReparseData, ReparseTag, Result,
    SecurityTable, Sha1Hash, Source, StreamSource, UnixData, WideString, sha1_of,
};

#[cfg(unix)]
use wim::PosixBackend;

/// Tree-building helpers over the arena API.
pub struct ImageBuilder {
    pub tree: ImageTree,
    pub security: SecurityTable,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            tree: ImageTree::new(),
            security: SecurityTable::new(),
        }
    }

    pub fn root(&self) -> DentryId {
        self.tree.root()
    }

    pub fn dir(&mut self, parent: DentryId, name: &str) -> DentryId {
        let inode = self
            .tree
            .add_inode(Inode::new(FileAttributes::new().with_directory(true)));
        self.tree.add_child(parent, WideString::from(name), inode)
    }

    pub fn file(&mut self, parent: DentryId, name: &str, hash: Sha1Hash) -> DentryId {
        let mut inode = Inode::new(FileAttributes::new().with_normal(true));
        inode.unnamed_stream = Some(StreamSource::Blob(hash));
        let inode = self.tree.add_inode(inode);
        self.tree.add_child(parent, WideString::from(name), inode)
    }

    pub fn file_inline(&mut self, parent: DentryId, name: &str, data: &[u8]) -> DentryId {
        let mut inode = Inode::new(FileAttributes::new().with_normal(true));
        inode.unnamed_stream = Some(StreamSource::Inline(data.to_vec()));
        let inode = self.tree.add_inode(inode);
        self.tree.add_child(parent, WideString::from(name), inode)
    }

    pub fn empty_file(&mut self, parent: DentryId, name: &str) -> DentryId {
        let inode = self
            .tree
            .add_inode(Inode::new(FileAttributes::new().with_normal(true)));
        self.tree.add_child(parent, WideString::from(name), inode)
    }

    /// A FIFO, device node or socket, typed by the mode's `S_IFMT` bits.
    pub fn special_file(
        &mut self,
        parent: DentryId,
        name: &str,
        mode: u32,
        rdev: u32,
    ) -> DentryId {
        let mut inode = Inode::new(FileAttributes::new().with_normal(true));
        inode.unix_data = Some(UnixData {
            uid: 0,
            gid: 0,
            mode,
            rdev,
        });
        let inode = self.tree.add_inode(inode);
        self.tree.add_child(parent, WideString::from(name), inode)
    }

    /// One inode, several names.
    pub fn hardlinked_files(
        &mut self,
        locations: &[(DentryId, &str)],
        hash: Sha1Hash,
    ) -> Vec<DentryId> {
        let mut inode = Inode::new(FileAttributes::new().with_normal(true));
        inode.unnamed_stream = Some(StreamSource::Blob(hash));
        inode.link_count = locations.len() as u32;
        let inode = self.tree.add_inode(inode);
        locations
            .iter()
            .map(|(parent, name)| self.tree.add_child(*parent, WideString::from(*name), inode))
            .collect()
    }

    pub fn symlink(
        &mut self,
        parent: DentryId,
        name: &str,
        target: &str,
        relative: bool,
    ) -> DentryId {
        let mut inode = Inode::new(FileAttributes::new().with_reparse_point(true));
        inode.reparse_tag = ReparseTag::SYMLINK;
        inode.reparse = Some(ReparseData::Link(LinkReparse::symlink(
            WideString::from(target),
            WideString::from(target),
            relative,
        )));
        let inode = self.tree.add_inode(inode);
        self.tree.add_child(parent, WideString::from(name), inode)
    }

    /// Attaches a named stream to a dentry's inode.
    pub fn named_stream(&mut self, dentry: DentryId, name: &str, source: Option<StreamSource>) {
        let inode_id = self.tree.dentry(dentry).inode;
        self.tree
            .inode_mut(inode_id)
            .named_streams
            .push(wim::NamedStream {
                name: WideString::from(name),
                source,
            });
    }

    pub fn set_security(&mut self, dentry: DentryId, descriptor: &[u8]) {
        let id = self.security.push(descriptor.to_vec());
        let inode_id = self.tree.dentry(dentry).inode;
        self.tree.inode_mut(inode_id).security_id = Some(id);
    }

    pub fn set_times(&mut self, dentry: DentryId, ticks: u64) {
        let inode_id = self.tree.dentry(dentry).inode;
        let inode = self.tree.inode_mut(inode_id);
        inode.creation_time = FileTime::from(ticks);
        inode.last_write_time = FileTime::from(ticks);
        inode.last_access_time = FileTime::from(ticks);
    }
}

/// Read+Seek wrapper counting how many payload bytes are read.
pub struct CountingReader<R> {
    inner: R,
    pub read_bytes: Rc<std::cell::Cell<u64>>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> (Self, Rc<std::cell::Cell<u64>>) {
        let counter = Rc::new(std::cell::Cell::new(0));
        (
            Self {
                inner,
                read_bytes: counter.clone(),
            },
            counter,
        )
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read_bytes.set(self.read_bytes.get() + n as u64);
        Ok(n)
    }
}

impl<R: std::io::Seek> std::io::Seek for CountingReader<R> {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Builds archives whose blobs live in a seekable byte buffer.
#[derive(Default)]
pub struct ArchiveBuilder {
    bytes: Vec<u8>,
    entries: Vec<(Sha1Hash, u64, u64)>,
    rpfix: bool,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rpfix(mut self) -> Self {
        self.rpfix = true;
        self
    }

    pub fn add_blob(&mut self, data: &[u8]) -> Sha1Hash {
        let hash = sha1_of(data);
        self.entries
            .push((hash, self.bytes.len() as u64, data.len() as u64));
        self.bytes.extend_from_slice(data);
        hash
    }

    pub fn build(self, images: Vec<(&str, ImageBuilder)>) -> Archive {
        let (archive, _) = self.build_counting(images);
        archive
    }

    /// Like [`ArchiveBuilder::build`], also returning a counter of bytes
    /// read back out of the archive source.
    pub fn build_counting(
        self,
        images: Vec<(&str, ImageBuilder)>,
    ) -> (Archive, Rc<std::cell::Cell<u64>>) {
        let info = ArchiveInfo {
            rpfix: self.rpfix,
            ..ArchiveInfo::default()
        };
        let (reader, counter) = CountingReader::new(Cursor::new(self.bytes));
        let mut archive = Archive::new(info, Source::Seekable(Box::new(reader)));
        for (hash, offset, size) in self.entries {
            archive.blob_table_mut().insert(BlobDescriptor::new(
                hash,
                size,
                BlobLocation::InArchive {
                    offset,
                    size_in_archive: size,
                },
            ));
        }
        for (name, image) in images {
            archive.add_image(name, image.security, image.tree);
        }
        (archive, counter)
    }
}

/// Builds pipable archives: a stream of `PWMS` records.
#[derive(Default)]
pub struct PipableBuilder {
    records: Vec<u8>,
    entries: Vec<(Sha1Hash, u64)>,
}

impl PipableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_record(&mut self, data: &[u8]) -> Sha1Hash {
        let hash = sha1_of(data);
        let header = PipableStreamHeader {
            uncompressed_size: data.len() as u64,
            hash,
            flags: PipeStreamFlags::new(),
        };
        let mut encoded = Cursor::new(Vec::new());
        header.write(&mut encoded).unwrap();
        self.records.extend_from_slice(&encoded.into_inner());
        self.records.extend_from_slice(data);
        self.entries.push((hash, data.len() as u64));
        hash
    }

    pub fn total_len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn build(self, images: Vec<(&str, ImageBuilder)>) -> Archive {
        let (archive, _) = self.build_counting(images);
        archive
    }

    /// Drops the last `missing` bytes of the record stream before
    /// building, to simulate a pipe that ends early.
    pub fn build_truncated(mut self, images: Vec<(&str, ImageBuilder)>, missing: usize) -> Archive {
        let len = self.records.len().saturating_sub(missing);
        self.records.truncate(len);
        self.build(images)
    }

    pub fn build_counting(
        self,
        images: Vec<(&str, ImageBuilder)>,
    ) -> (Archive, Rc<std::cell::Cell<u64>>) {
        let info = ArchiveInfo {
            pipable: true,
            ..ArchiveInfo::default()
        };
        let (reader, counter) = CountingReader::new(Cursor::new(self.records));
        let mut archive = Archive::new(info, Source::Pipe(Box::new(reader)));
        for (hash, size) in self.entries {
            archive.blob_table_mut().insert(BlobDescriptor::new(
                hash,
                size,
                BlobLocation::InArchive {
                    offset: 0,
                    size_in_archive: size,
                },
            ));
        }
        for (name, image) in images {
            archive.add_image(name, image.security, image.tree);
        }
        (archive, counter)
    }
}

/// Everything a backend was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockOp {
    StartExtract(PathBuf),
    FinishExtract,
    AbortExtract,
    CreateDirectory(PathBuf),
    CreateFile(PathBuf),
    CreateHardlink(PathBuf, PathBuf),
    CreateSymlink(OsString, PathBuf),
    CreateSpecialFile(PathBuf, u32, u32),
    WriteUnnamed(PathBuf, Vec<u8>),
    WriteNamed(PathBuf, String, Vec<u8>),
    SetAttributes(PathBuf),
    SetShortName(PathBuf, String),
    SetReparse(PathBuf, String),
    SetSecurity(PathBuf, Vec<u8>),
    SetUnixData(PathBuf),
    SetTimestamps(PathBuf),
}

/// A backend that records every operation. With a wrapped
/// [`PosixBackend`] it also performs the real filesystem work for the
/// operations POSIX can express; without one it only records.
pub struct RecordingBackend {
    #[cfg(unix)]
    inner: Option<PosixBackend>,
    pub features: BackendFeatures,
    pub windows_naming: bool,
    pub ops: Vec<MockOp>,
}

impl RecordingBackend {
    /// Pure recorder, touching no real filesystem.
    pub fn detached(features: BackendFeatures) -> Self {
        Self {
            #[cfg(unix)]
            inner: None,
            features,
            windows_naming: false,
            ops: Vec::new(),
        }
    }

    /// Recorder delegating to a real [`PosixBackend`].
    #[cfg(unix)]
    pub fn over_posix(features: BackendFeatures) -> Self {
        Self {
            inner: Some(PosixBackend::new()),
            features,
            windows_naming: false,
            ops: Vec::new(),
        }
    }

    pub fn with_windows_naming(mut self) -> Self {
        self.windows_naming = true;
        self
    }

    pub fn aborted(&self) -> bool {
        self.ops.contains(&MockOp::AbortExtract)
    }

    pub fn created_anything(&self) -> bool {
        self.ops.iter().any(|op| {
            matches!(
                op,
                MockOp::CreateDirectory(_)
                    | MockOp::CreateFile(_)
                    | MockOp::CreateHardlink(..)
                    | MockOp::CreateSymlink(..)
                    | MockOp::CreateSpecialFile(..)
            )
        })
    }

    pub fn unnamed_writes(&self) -> Vec<(&PathBuf, &Vec<u8>)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                MockOp::WriteUnnamed(path, data) => Some((path, data)),
                _ => None,
            })
            .collect()
    }

    pub fn named_writes(&self) -> Vec<(&PathBuf, &String, &Vec<u8>)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                MockOp::WriteNamed(path, name, data) => Some((path, name, data)),
                _ => None,
            })
            .collect()
    }
}

pub fn full_features() -> BackendFeatures {
    BackendFeatures {
        file_attributes: true,
        compressed_files: true,
        encrypted_files: true,
        not_content_indexed: true,
        sparse_files: true,
        named_data_streams: true,
        hard_links: true,
        reparse_points: true,
        symlink_reparse_points: true,
        security_descriptors: true,
        short_names: true,
        unix_data: true,
        timestamps: true,
    }
}

impl Backend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn features(&self) -> BackendFeatures {
        self.features
    }

    fn path_caps(&self) -> PathCaps {
        PathCaps {
            path_max: 4096,
            path_prefix: "",
            path_separator: if self.windows_naming { '\\' } else { '/' },
            requires_target_in_paths: true,
            requires_realtarget_in_paths: false,
            realpath_works_on_nonexisting_files: false,
            supports_case_sensitive_filenames: !self.windows_naming,
            target_is_root: false,
            root_directory_is_special: false,
            windows_naming_rules: self.windows_naming,
        }
    }

    fn start_extract(&mut self, target: &Path) -> Result<()> {
        self.ops.push(MockOp::StartExtract(target.to_path_buf()));
        #[cfg(unix)]
        if let Some(inner) = self.inner.as_mut() {
            return inner.start_extract(target);
        }
        Ok(())
    }

    fn finish_extract(&mut self) -> Result<()> {
        self.ops.push(MockOp::FinishExtract);
        Ok(())
    }

    fn abort_extract(&mut self) {
        self.ops.push(MockOp::AbortExtract);
    }

    fn create_directory(&mut self, path: &Path) -> Result<()> {
        self.ops.push(MockOp::CreateDirectory(path.to_path_buf()));
        #[cfg(unix)]
        if let Some(inner) = self.inner.as_mut() {
            return inner.create_directory(path);
        }
        Ok(())
    }

    fn create_file(&mut self, path: &Path) -> Result<()> {
        self.ops.push(MockOp::CreateFile(path.to_path_buf()));
        #[cfg(unix)]
        if let Some(inner) = self.inner.as_mut() {
            return inner.create_file(path);
        }
        Ok(())
    }

    fn create_hardlink(&mut self, existing: &Path, link: &Path) -> Result<()> {
        self.ops.push(MockOp::CreateHardlink(
            existing.to_path_buf(),
            link.to_path_buf(),
        ));
        #[cfg(unix)]
        if let Some(inner) = self.inner.as_mut() {
            return inner.create_hardlink(existing, link);
        }
        Ok(())
    }

    fn create_symlink(&mut self, target: &OsStr, link: &Path) -> Result<()> {
        self.ops
            .push(MockOp::CreateSymlink(target.to_os_string(), link.to_path_buf()));
        #[cfg(unix)]
        if let Some(inner) = self.inner.as_mut() {
            return inner.create_symlink(target, link);
        }
        Ok(())
    }

    fn create_special_file(&mut self, path: &Path, data: &UnixData) -> Result<()> {
        self.ops.push(MockOp::CreateSpecialFile(
            path.to_path_buf(),
            data.mode,
            data.rdev,
        ));
        #[cfg(unix)]
        if let Some(inner) = self.inner.as_mut() {
            return inner.create_special_file(path, data);
        }
        Ok(())
    }

    fn write_unnamed_stream(
        &mut self,
        path: &Path,
        size: u64,
        data: &mut dyn Read,
    ) -> Result<()> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        self.ops
            .push(MockOp::WriteUnnamed(path.to_path_buf(), buf.clone()));
        #[cfg(unix)]
        if let Some(inner) = self.inner.as_mut() {
            return inner.write_unnamed_stream(path, size, &mut Cursor::new(buf));
        }
        let _ = size;
        Ok(())
    }

    fn write_named_stream(
        &mut self,
        path: &Path,
        name: &WideString,
        _size: u64,
        data: Option<&mut dyn Read>,
    ) -> Result<()> {
        let mut buf = Vec::new();
        if let Some(data) = data {
            data.read_to_end(&mut buf)?;
        }
        // POSIX has no ADS; bytes are recorded but not delegated.
        self.ops.push(MockOp::WriteNamed(
            path.to_path_buf(),
            name.to_string_lossy(),
            buf,
        ));
        Ok(())
    }

    fn set_file_attributes(&mut self, path: &Path, _attributes: FileAttributes) -> Result<()> {
        self.ops.push(MockOp::SetAttributes(path.to_path_buf()));
        Ok(())
    }

    fn set_short_name(&mut self, path: &Path, short_name: &WideString) -> Result<()> {
        self.ops.push(MockOp::SetShortName(
            path.to_path_buf(),
            short_name.to_string_lossy(),
        ));
        Ok(())
    }

    fn set_reparse_data(&mut self, path: &Path, reparse: &ReparseData) -> Result<()> {
        let target = match reparse {
            ReparseData::Link(link) => link.substitute_name.to_string_lossy(),
            ReparseData::Raw { tag, .. } => format!("{tag:?}"),
        };
        self.ops
            .push(MockOp::SetReparse(path.to_path_buf(), target));
        #[cfg(unix)]
        if let Some(inner) = self.inner.as_mut() {
            return inner.set_reparse_data(path, reparse);
        }
        Ok(())
    }

    fn set_security_descriptor(&mut self, path: &Path, descriptor: &[u8]) -> Result<()> {
        self.ops.push(MockOp::SetSecurity(
            path.to_path_buf(),
            descriptor.to_vec(),
        ));
        Ok(())
    }

    fn set_unix_data(&mut self, path: &Path, data: &wim::UnixData) -> Result<()> {
        self.ops.push(MockOp::SetUnixData(path.to_path_buf()));
        #[cfg(unix)]
        if let Some(inner) = self.inner.as_mut() {
            return inner.set_unix_data(path, data);
        }
        let _ = data;
        Ok(())
    }

    fn set_timestamps(
        &mut self,
        path: &Path,
        creation: FileTime,
        last_write: FileTime,
        last_access: FileTime,
    ) -> Result<()> {
        self.ops.push(MockOp::SetTimestamps(path.to_path_buf()));
        #[cfg(unix)]
        if let Some(inner) = self.inner.as_mut() {
            return inner.set_timestamps(path, creation, last_write, last_access);
        }
        let _ = (creation, last_write, last_access);
        Ok(())
    }
}

/// Progress listener collecting an owned summary of every event.
#[derive(Default)]
pub struct ProgressLog {
    pub stream_events: Vec<(u64, u64)>,
    pub images_begun: u32,
    pub images_ended: u32,
    pub dentries: Vec<PathBuf>,
    pub dir_structure_events: u32,
    pub timestamp_events: u32,
}

impl ProgressLog {
    pub fn last_stream_event(&self) -> Option<(u64, u64)> {
        self.stream_events.last().copied()
    }
}

impl ProgressListener for ProgressLog {
    fn update(&mut self, event: &ProgressEvent<'_>) -> Result<()> {
        match event {
            ProgressEvent::ExtractStreams {
                completed_bytes,
                total_bytes,
                ..
            } => self.stream_events.push((*completed_bytes, *total_bytes)),
            ProgressEvent::ExtractImageBegin { .. } => self.images_begun += 1,
            ProgressEvent::ExtractImageEnd { .. } => self.images_ended += 1,
            ProgressEvent::ExtractDentry { path } => self.dentries.push(path.to_path_buf()),
            ProgressEvent::ExtractDirStructureBegin | ProgressEvent::ExtractDirStructureEnd => {
                self.dir_structure_events += 1
            }
            ProgressEvent::ApplyTimestamps => self.timestamp_events += 1,
            _ => {}
        }
        Ok(())
    }
}
