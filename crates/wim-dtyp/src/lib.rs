//! Common data types shared across the `wim-rs` crates.
//!
//! WIM metadata reuses many on-disk primitives from the NTFS/Win32 world:
//! FILETIME timestamps, UTF-16LE names, MS-FSCC file attribute words,
//! reparse-point buffers, and SHA-1 message digests. This crate contains
//! the binrw-enabled representations of those primitives.

pub mod file_attributes;
pub mod file_time;
pub mod hash;
pub mod reparse;
pub mod wide_string;

pub use file_attributes::FileAttributes;
pub use file_time::FileTime;
pub use hash::Sha1Hash;
pub use reparse::{ReparseData, ReparseTag};
pub use wide_string::WideString;
