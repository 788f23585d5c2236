//! Extraction engine for Windows Imaging (WIM) archives.
//!
//! A WIM archive stores one or more named images (filesystem trees) backed
//! by a content-addressed, optionally compressed blob store. This crate
//! implements the part that turns an opened archive plus a selected image
//! into a directory tree on a target filesystem:
//!
//! * [`archive::Archive`]: the opened-archive handle (image metadata,
//!   blob table, raw stream reads), filled in by an opener.
//! * [`tree::ImageTree`]: the arena-allocated dentry/inode tree of one
//!   image.
//! * [`extract`]: the extraction engine itself: name sanitization,
//!   capability matching, blob-reference planning, skeleton creation,
//!   stream extraction (single-pass, sequential, or pipe-fed) and metadata
//!   finalization, all delegating filesystem writes to a pluggable
//!   [`extract::backend::Backend`].

pub mod archive;
pub mod blob;
pub mod error;
pub mod extract;
pub mod progress;
pub mod tree;

pub use archive::{
    Archive, ArchiveInfo, Decompressor, Image, ImageMeta, SecurityTable, Source, file_source,
    sha1_of,
};
pub use blob::{BlobDescriptor, BlobLocation, BlobTable, CompressionKind};
pub use error::{Error, ResourceOp};
pub use extract::backend::{Backend, BackendFeatures, PathCaps, make_backend};
#[cfg(unix)]
pub use extract::backend::PosixBackend;
#[cfg(windows)]
pub use extract::backend::Win32Backend;
pub use extract::{
    ExtractOptions, PipableStreamHeader, PipeStreamFlags, extract_all_images, extract_image,
    extract_image_from_pipe, extract_image_with_backend, extract_paths,
};
pub use progress::{ProgressEvent, ProgressListener};
pub use tree::{Dentry, DentryId, ImageTree, Inode, InodeId, NamedStream, StreamSource, UnixData};

// Re-export the data-type crate the public API surfaces.
pub use wim_dtyp::reparse::LinkReparse;
pub use wim_dtyp::{FileAttributes, FileTime, ReparseData, ReparseTag, Sha1Hash, WideString};

pub type Result<T> = std::result::Result<T, Error>;
