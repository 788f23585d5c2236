//! The extraction engine.
//!
//! Extraction runs as a staged pipeline over one image tree:
//!
//! ```text
//! sanitize names -> match capabilities -> plan blob references
//!     -> create skeleton -> write streams -> finalize metadata
//! ```
//!
//! The stream-writing stage runs in one of three shapes: interleaved with
//! skeleton creation (single-pass, the default for seekable sources),
//! as a separate pass over the offset-sorted extraction list
//! (`sequential`), or driven by the record headers of a pipable archive
//! read from a non-seekable source. Any stage error unwinds through the
//! backend's abort hook, and every scratch field is cleared on both the
//! success and the error path so the archive handle stays reusable.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use wim_dtyp::Sha1Hash;

use crate::archive::{Archive, ArchiveInfo, Decompressor, Source};
use crate::blob::{BlobId, BlobTable};
use crate::progress::{ProgressEvent, ProgressListener};
use crate::tree::{DentryId, ImageTree, InodeId};
use crate::{Error, Result, SecurityTable};

pub mod backend;
mod features;
mod finalize;
mod pipe;
mod plan;
mod sanitize;
mod skeleton;
mod streams;

use backend::{Backend, BackendFeatures, make_backend};
pub use pipe::{PipableStreamHeader, PipeStreamFlags};

/// Configuration of one extraction operation.
///
/// Mutually exclusive pairs (`hardlink`/`symlink`, `no_acls`/`strict_acls`)
/// are rejected by [`ExtractOptions::validate`]; reparse-point fixup is a
/// tri-state where `None` defers to the archive header and extraction
/// shape.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Extract directly to an NTFS volume instead of a directory.
    pub ntfs: bool,
    /// In multi-image extraction, materialize files of later images as
    /// hardlinks to the first image's copies.
    pub hardlink: bool,
    /// Like `hardlink`, but with relative symlinks.
    pub symlink: bool,
    /// Force the two-pass strategy with an offset-sorted blob list.
    pub sequential: bool,
    /// Absolute symlink target rewriting; `None` applies the archive
    /// default.
    pub rpfix: Option<bool>,
    /// Apply POSIX owner/group/mode sidecar data.
    pub unix_data: bool,
    /// Do not apply security descriptors at all.
    pub no_acls: bool,
    /// Fail instead of warning when a descriptor cannot be applied.
    pub strict_acls: bool,
    pub strict_short_names: bool,
    pub strict_timestamps: bool,
    pub strict_symlinks: bool,
    /// Substitute invalid filename characters instead of skipping.
    pub replace_invalid_filenames: bool,
    /// Substitute dummy names for case-insensitive collisions instead of
    /// skipping.
    pub all_case_conflicts: bool,
    /// Write the selected file's unnamed stream to standard output.
    pub to_stdout: bool,
    /// The source is a non-seekable pipe; set by
    /// [`extract_image_from_pipe`].
    pub(crate) from_pipe: bool,
}

impl ExtractOptions {
    pub fn validate(&self) -> Result<()> {
        if self.hardlink && self.symlink {
            return Err(Error::InvalidParameter(
                "hardlink and symlink extraction are mutually exclusive".to_string(),
            ));
        }
        if self.no_acls && self.strict_acls {
            return Err(Error::InvalidParameter(
                "no_acls and strict_acls are mutually exclusive".to_string(),
            ));
        }
        if self.to_stdout && (self.ntfs || self.hardlink || self.symlink) {
            return Err(Error::InvalidParameter(
                "to_stdout cannot be combined with a filesystem backend mode".to_string(),
            ));
        }
        Ok(())
    }

    /// Linked extraction replaces whole files, so per-file extras are
    /// skipped.
    pub(crate) fn linked_extraction(&self) -> bool {
        self.hardlink || self.symlink
    }
}

/// How one image participates in multi-image linked extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkPhase {
    /// Normal extraction; the cross-image map is not consulted.
    Disabled,
    /// Extract normally, recording every file for later images.
    Record,
    /// Link to the recorded first-image copies where possible.
    Link,
}

/// How the stream-writing stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    SinglePass,
    Sequential,
    Pipe,
}

/// All state of one in-flight extraction.
pub(crate) struct ExtractOp<'a, 'p> {
    pub info: &'a ArchiveInfo,
    pub source: &'a mut Source,
    pub decompressor: Option<&'a dyn Decompressor>,
    pub blobs: &'a mut BlobTable,
    pub tree: &'a mut ImageTree,
    pub security: &'a SecurityTable,
    pub backend: &'a mut dyn Backend,
    /// Snapshot of the backend's capabilities.
    pub features: BackendFeatures,
    pub opts: &'a ExtractOptions,
    /// Directory the extraction lands in.
    pub target: &'a Path,
    /// Path the extraction root maps to (equals `target` for full-image
    /// extraction).
    pub root_path: PathBuf,
    pub root: DentryId,
    /// Resolved reparse-point fixup decision.
    pub rpfix: bool,
    pub link_phase: LinkPhase,
    /// Unnamed-blob digest -> first extracted path, across images.
    pub link_map: &'a mut HashMap<Sha1Hash, PathBuf>,
    pub progress: Option<&'p mut dyn ProgressListener>,
    pub sequential_refs: bool,

    pub invalid_name_counter: u32,
    pub extraction_list: Vec<BlobId>,
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub total_streams: u64,
    pub completed_streams: u64,
    pub next_progress: u64,
    pub progress_step: u64,
    pub num_streams_remaining: u64,
}

impl ExtractOp<'_, '_> {
    pub fn emit(&mut self, event: &ProgressEvent<'_>) -> Result<()> {
        match self.progress.as_mut() {
            Some(listener) => listener.update(event),
            None => Ok(()),
        }
    }

    /// Byte accounting after a blob finished extracting (to every
    /// referencing stream). Fires the progress callback at
    /// `total_bytes / 128` steps.
    pub fn blob_done(&mut self, size: u64) -> Result<()> {
        self.completed_bytes += size;
        self.completed_streams += 1;
        self.num_streams_remaining = self.num_streams_remaining.saturating_sub(1);
        if self.completed_bytes >= self.next_progress || self.num_streams_remaining == 0 {
            let event = ProgressEvent::ExtractStreams {
                total_bytes: self.total_bytes,
                completed_bytes: self.completed_bytes,
                total_streams: self.total_streams,
                completed_streams: self.completed_streams,
            };
            self.emit(&event)?;
            while self.next_progress <= self.completed_bytes {
                self.next_progress += self.progress_step;
            }
        }
        Ok(())
    }

    /// Whether the inode extracts as a UNIX special file (FIFO, device
    /// node, socket) instead of a regular file with stream data.
    pub fn is_unix_special(&self, inode: InodeId) -> bool {
        self.opts.unix_data
            && self.features.unix_data
            && self
                .tree
                .inode(inode)
                .unix_data
                .is_some_and(|data| data.is_special_file())
    }

    /// Absolute output path of a sanitized, non-skipped dentry.
    pub fn dentry_output_path(&self, id: DentryId) -> PathBuf {
        let mut components = Vec::new();
        let mut current = id;
        while current != self.root {
            let dentry = self.tree.dentry(current);
            components.push(
                dentry
                    .scratch
                    .extraction_name
                    .clone()
                    .expect("path requested for unsanitized dentry"),
            );
            current = dentry.parent.expect("walked past the extraction root");
        }
        let mut path = self.root_path.clone();
        for component in components.iter().rev() {
            path.push(component);
        }
        path
    }
}

/// Extracts one image to `target` with the platform's native backend.
pub fn extract_image(
    archive: &mut Archive,
    image: u32,
    target: &Path,
    options: &ExtractOptions,
    progress: Option<&mut dyn ProgressListener>,
) -> Result<()> {
    options.validate()?;
    let mut backend = make_backend(options.ntfs)?;
    extract_image_with_backend(archive, image, target, options, backend.as_mut(), progress)
}

/// Extracts one image through a caller-provided backend.
pub fn extract_image_with_backend(
    archive: &mut Archive,
    image: u32,
    target: &Path,
    options: &ExtractOptions,
    backend: &mut dyn Backend,
    progress: Option<&mut dyn ProgressListener>,
) -> Result<()> {
    options.validate()?;
    let mut link_map = HashMap::new();
    extract_one(
        archive,
        image,
        target,
        options,
        backend,
        LinkPhase::Disabled,
        &mut link_map,
        progress,
    )
}

/// Extracts an image from a pipable archive streamed over a non-seekable
/// source.
pub fn extract_image_from_pipe(
    archive: &mut Archive,
    image: u32,
    target: &Path,
    options: &ExtractOptions,
    progress: Option<&mut dyn ProgressListener>,
) -> Result<()> {
    let mut options = options.clone();
    options.from_pipe = true;
    extract_image(archive, image, target, &options, progress)
}

/// Extracts every image, each into `target/<image-name>`.
///
/// With the `hardlink` or `symlink` option, the first image extracts
/// normally and identical files of later images become links to it.
pub fn extract_all_images(
    archive: &mut Archive,
    target: &Path,
    options: &ExtractOptions,
    progress: Option<&mut dyn ProgressListener>,
) -> Result<()> {
    options.validate()?;
    let count = archive.image_count();
    if count == 0 {
        return Err(Error::ImageCount(0));
    }
    let mut backend = make_backend(options.ntfs)?;
    let mut link_map = HashMap::new();
    let mut progress = progress;
    for index in 1..=count {
        let meta = &archive.image(index)?.meta;
        let subdir = if meta.name.is_empty() {
            target.join(index.to_string())
        } else {
            target.join(&meta.name)
        };
        let phase = if !options.linked_extraction() {
            LinkPhase::Disabled
        } else if index == 1 {
            LinkPhase::Record
        } else {
            LinkPhase::Link
        };
        extract_one(
            archive,
            index,
            &subdir,
            options,
            backend.as_mut(),
            phase,
            &mut link_map,
            progress.as_deref_mut(),
        )?;
    }
    Ok(())
}

/// Extracts selected subtrees of an image into `target`, or (with
/// `to_stdout`) writes the selected files' contents to standard output.
pub fn extract_paths(
    archive: &mut Archive,
    image: u32,
    paths: &[&str],
    target: &Path,
    options: &ExtractOptions,
    progress: Option<&mut dyn ProgressListener>,
) -> Result<()> {
    options.validate()?;
    if options.to_stdout {
        return extract_to_stdout(archive, image, paths);
    }
    let mut backend = make_backend(options.ntfs)?;
    let mut link_map = HashMap::new();
    let mut progress = progress;
    for source_path in paths {
        extract_subtree(
            archive,
            image,
            source_path,
            target,
            options,
            backend.as_mut(),
            &mut link_map,
            progress.as_deref_mut(),
        )?;
    }
    Ok(())
}

/// Writes each selected file's unnamed stream to standard output.
fn extract_to_stdout(archive: &mut Archive, image: u32, paths: &[&str]) -> Result<()> {
    use crate::tree::StreamSource;

    for source_path in paths {
        let source = {
            let tree = archive.image(image)?.tree();
            let dentry = tree
                .lookup_path(source_path)
                .ok_or_else(|| Error::PathDoesNotExist(PathBuf::from(source_path)))?;
            let inode = tree.inode_of(dentry);
            if !inode.is_regular_file() {
                return Err(Error::NotARegularFile(source_path.to_string()));
            }
            inode.unnamed_stream.clone()
        };
        let data = match source {
            None => Vec::new(),
            Some(StreamSource::Inline(bytes)) => bytes,
            Some(StreamSource::Blob(hash)) => archive.read_blob_to_vec(&hash)?,
        };
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&data)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn extract_subtree<'a, 'p>(
    archive: &'a mut Archive,
    image: u32,
    source_path: &str,
    target: &'a Path,
    options: &'a ExtractOptions,
    backend: &'a mut dyn Backend,
    link_map: &'a mut HashMap<Sha1Hash, PathBuf>,
    mut progress: Option<&'p mut dyn ProgressListener>,
) -> Result<()> {
    let root = {
        let tree = archive.image(image)?.tree();
        tree.lookup_path(source_path)
            .ok_or_else(|| Error::PathDoesNotExist(PathBuf::from(source_path)))?
    };
    if let Some(p) = progress.as_mut() {
        p.update(&ProgressEvent::ExtractTreeBegin {
            source_path,
            target,
        })?;
    }
    run_extraction(
        archive,
        image,
        root,
        target,
        options,
        backend,
        LinkPhase::Disabled,
        link_map,
        progress.as_deref_mut(),
    )?;
    if let Some(p) = progress.as_mut() {
        p.update(&ProgressEvent::ExtractTreeEnd {
            source_path,
            target,
        })?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn extract_one<'a, 'p>(
    archive: &'a mut Archive,
    image: u32,
    target: &'a Path,
    options: &'a ExtractOptions,
    backend: &'a mut dyn Backend,
    link_phase: LinkPhase,
    link_map: &'a mut HashMap<Sha1Hash, PathBuf>,
    mut progress: Option<&'p mut dyn ProgressListener>,
) -> Result<()> {
    let (image_name, root) = {
        let img = archive.image(image)?;
        (img.meta.name.clone(), img.tree().root())
    };
    if let Some(p) = progress.as_mut() {
        p.update(&ProgressEvent::ExtractImageBegin {
            image,
            image_name: &image_name,
        })?;
    }
    run_extraction(
        archive,
        image,
        root,
        target,
        options,
        backend,
        link_phase,
        link_map,
        progress.as_deref_mut(),
    )?;
    if let Some(p) = progress.as_mut() {
        p.update(&ProgressEvent::ExtractImageEnd { image })?;
    }
    Ok(())
}

/// Runs the extraction pipeline over one extraction root, then releases
/// scratch state on every exit path.
#[allow(clippy::too_many_arguments)]
fn run_extraction<'a, 'p>(
    archive: &'a mut Archive,
    image: u32,
    root: DentryId,
    target: &'a Path,
    options: &'a ExtractOptions,
    backend: &'a mut dyn Backend,
    link_phase: LinkPhase,
    link_map: &'a mut HashMap<Sha1Hash, PathBuf>,
    progress: Option<&'p mut dyn ProgressListener>,
) -> Result<()> {
    let Archive {
        info,
        images,
        blobs,
        source,
        decompressor,
    } = archive;
    let entry = images
        .get_mut(image as usize - 1)
        .ok_or_else(|| Error::InvalidImage(image.to_string()))?;

    let from_pipe = options.from_pipe || matches!(source, Source::Pipe(_));
    if from_pipe && !info.pipable {
        return Err(Error::NotPipable);
    }
    let strategy = if from_pipe {
        Strategy::Pipe
    } else if options.sequential {
        Strategy::Sequential
    } else {
        Strategy::SinglePass
    };

    let full_image = root == entry.tree.root();
    let root_path = if full_image {
        target.to_path_buf()
    } else {
        let root_name = entry.tree.dentry(root).name.to_string_lossy();
        target.join(root_name)
    };

    let mut op = ExtractOp {
        features: backend.features(),
        rpfix: options.rpfix.unwrap_or(info.rpfix && full_image),
        info,
        source: &mut *source,
        decompressor: decompressor.as_deref(),
        blobs: &mut *blobs,
        tree: &mut entry.tree,
        security: &entry.security,
        backend,
        opts: options,
        target,
        root_path,
        root,
        link_phase,
        link_map,
        progress,
        sequential_refs: strategy != Strategy::SinglePass,
        invalid_name_counter: 0,
        extraction_list: Vec::new(),
        total_bytes: 0,
        completed_bytes: 0,
        total_streams: 0,
        completed_streams: 0,
        next_progress: 0,
        progress_step: 0,
        num_streams_remaining: 0,
    };

    let mut result = run_stages(&mut op, strategy);
    match &result {
        Ok(()) => result = op.backend.finish_extract(),
        Err(err) => {
            log::debug!("extraction of image {image} failed, aborting: {err}");
            op.backend.abort_extract();
        }
    }

    // The archive handle stays reusable either way.
    blobs.reset_scratch();
    entry.tree.reset_scratch();

    result
}

fn run_stages(op: &mut ExtractOp<'_, '_>, strategy: Strategy) -> Result<()> {
    sanitize::sanitize_tree(op)?;

    let counts = features::tally(op);
    features::check(&counts, &op.features, op.opts)?;

    plan::plan_refs(op)?;
    if strategy == Strategy::Sequential {
        plan::sort_extraction_list(op);
    }
    log::debug!(
        "extracting {} blobs ({} bytes) using {strategy:?}",
        op.extraction_list.len(),
        op.total_bytes
    );

    op.backend.start_extract(op.target)?;

    op.emit(&ProgressEvent::ExtractDirStructureBegin)?;
    skeleton::build(op, strategy == Strategy::SinglePass)?;
    op.emit(&ProgressEvent::ExtractDirStructureEnd)?;

    match strategy {
        Strategy::SinglePass => {}
        Strategy::Sequential => streams::extract_sequential(op)?,
        Strategy::Pipe => pipe::extract_from_pipe(op)?,
    }

    finalize::apply_metadata(op)?;
    Ok(())
}
