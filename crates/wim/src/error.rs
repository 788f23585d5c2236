use std::path::PathBuf;

use thiserror::Error;
use wim_dtyp::Sha1Hash;

/// The filesystem operation a [`Error::Resource`] failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOp {
    Open,
    Read,
    Write,
    Stat,
    Mkdir,
    Readlink,
}

impl std::fmt::Display for ResourceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceOp::Open => "open",
            ResourceOp::Read => "read",
            ResourceOp::Write => "write",
            ResourceOp::Stat => "stat",
            ResourceOp::Mkdir => "mkdir",
            ResourceOp::Readlink => "readlink",
        };
        write!(f, "{name}")
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Path does not exist: {}", .0.display())]
    PathDoesNotExist(PathBuf),
    #[error("Failed to {op} '{}': {source}", .path.display())]
    Resource {
        op: ResourceOp,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Binrw Error: {0}")]
    BinRwError(#[from] binrw::Error),
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("'{0}' is not a regular file")]
    NotARegularFile(String),
    #[error("Failed to fix up the reparse point target of '{0}'")]
    ReparsePointFixupFailed(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("The archive source is not seekable and the archive is not pipable")]
    NotPipable,
    #[error("Invalid pipable archive: {0}")]
    InvalidPipableWim(String),
    #[error("No image matching '{0}' exists in the archive")]
    InvalidImage(String),
    #[error("Invalid image count: {0}")]
    ImageCount(u32),
    #[error("XML metadata error: {0}")]
    Xml(String),
    #[error("Malformed resource: {0}")]
    InvalidResource(String),
    #[error("Blob {0} is not present in the archive")]
    BlobMissing(Sha1Hash),
    #[error("Blob {0} is corrupted (SHA-1 mismatch)")]
    CorruptBlob(Sha1Hash),
    #[error("Extraction cancelled by the progress listener")]
    Cancelled,
}

impl Error {
    /// Tags an IO error with the failed operation and path.
    pub(crate) fn resource(op: ResourceOp, path: &std::path::Path, source: std::io::Error) -> Self {
        Error::Resource {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}
