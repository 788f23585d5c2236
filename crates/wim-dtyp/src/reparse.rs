//! Reparse point tags and data buffers, [MS-FSCC 2.1.2](<https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-fscc/c8e77b37-3909-4fe6-a4ea-2b9d423b1ee4>).
//!
//! WIM metadata stores the reparse tag on the inode and the reparse data
//! portion (everything after the 8-byte REPARSE_DATA_BUFFER header) as a
//! stream. Symlinks and junctions get a structured representation here;
//! every other tag is carried through opaque.

use binrw::io::Cursor;
use binrw::prelude::*;

use crate::WideString;

/// A reparse point tag value.
#[derive(BinRead, BinWrite, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReparseTag(pub u32);

impl ReparseTag {
    /// IO_REPARSE_TAG_MOUNT_POINT - an NTFS junction.
    pub const MOUNT_POINT: ReparseTag = ReparseTag(0xA000_0003);
    /// IO_REPARSE_TAG_SYMLINK.
    pub const SYMLINK: ReparseTag = ReparseTag(0xA000_000C);

    pub fn is_symlink(&self) -> bool {
        *self == Self::SYMLINK
    }

    pub fn is_mount_point(&self) -> bool {
        *self == Self::MOUNT_POINT
    }

    /// Whether the tag is one of the two link-style tags with a
    /// substitute/print name pair.
    pub fn is_link(&self) -> bool {
        self.is_symlink() || self.is_mount_point()
    }
}

impl std::fmt::Debug for ReparseTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::MOUNT_POINT => write!(f, "ReparseTag(MOUNT_POINT)"),
            Self::SYMLINK => write!(f, "ReparseTag(SYMLINK)"),
            Self(other) => write!(f, "ReparseTag({other:#010x})"),
        }
    }
}

/// SYMLINK_FLAG_RELATIVE: the substitute name is relative to the link's
/// parent directory rather than an absolute NT path.
const SYMLINK_FLAG_RELATIVE: u32 = 0x0000_0001;

/// Common prefix of the substitute/print name table in link-style reparse
/// buffers.
#[binrw::binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
struct LinkNameTable {
    substitute_name_offset: u16,
    substitute_name_nbytes: u16,
    print_name_offset: u16,
    print_name_nbytes: u16,
}

/// A symlink or junction reparse buffer in parsed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkReparse {
    tag: ReparseTag,
    pub substitute_name: WideString,
    pub print_name: WideString,
    /// Only meaningful for symlinks; junction targets are always absolute.
    pub relative: bool,
}

impl LinkReparse {
    pub fn symlink(substitute_name: WideString, print_name: WideString, relative: bool) -> Self {
        Self {
            tag: ReparseTag::SYMLINK,
            substitute_name,
            print_name,
            relative,
        }
    }

    pub fn junction(substitute_name: WideString, print_name: WideString) -> Self {
        Self {
            tag: ReparseTag::MOUNT_POINT,
            substitute_name,
            print_name,
            relative: false,
        }
    }

    pub fn tag(&self) -> ReparseTag {
        self.tag
    }

    /// The name the filesystem resolves: the substitute name.
    pub fn target(&self) -> &WideString {
        &self.substitute_name
    }
}

/// The data portion of a reparse point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReparseData {
    Link(LinkReparse),
    /// Any non-link tag, kept byte-exact.
    Raw { tag: ReparseTag, data: Vec<u8> },
}

impl ReparseData {
    pub fn tag(&self) -> ReparseTag {
        match self {
            ReparseData::Link(link) => link.tag,
            ReparseData::Raw { tag, .. } => *tag,
        }
    }

    /// Parses the reparse data portion for the given tag.
    pub fn parse(tag: ReparseTag, data: &[u8]) -> BinResult<Self> {
        if !tag.is_link() {
            return Ok(ReparseData::Raw {
                tag,
                data: data.to_vec(),
            });
        }

        let mut reader = Cursor::new(data);
        let names = LinkNameTable::read(&mut reader)?;
        let relative = if tag.is_symlink() {
            let flags = u32::read_le(&mut reader)?;
            flags & SYMLINK_FLAG_RELATIVE != 0
        } else {
            false
        };

        let path_buffer_start = reader.position();
        let read_name = |offset: u16, nbytes: u16| -> BinResult<WideString> {
            let start = path_buffer_start + offset as u64;
            let end = start + nbytes as u64;
            if end > data.len() as u64 || nbytes % 2 != 0 {
                return Err(binrw::Error::AssertFail {
                    pos: start,
                    message: "reparse name exceeds buffer".to_string(),
                });
            }
            let mut name_reader = Cursor::new(data);
            name_reader.set_position(start);
            WideString::read_le_args(&mut name_reader, (nbytes as u64,))
        };

        let substitute_name =
            read_name(names.substitute_name_offset, names.substitute_name_nbytes)?;
        let print_name = read_name(names.print_name_offset, names.print_name_nbytes)?;

        Ok(ReparseData::Link(LinkReparse {
            tag,
            substitute_name,
            print_name,
            relative,
        }))
    }

    /// Serializes back to the reparse data portion.
    ///
    /// Link names are laid out substitute-first. Junction names carry the
    /// null terminators Windows expects in MOUNT_POINT buffers.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ReparseData::Raw { data, .. } => data.clone(),
            ReparseData::Link(link) => {
                let terminator = if link.tag.is_mount_point() { 2 } else { 0 };
                let substitute_nbytes = link.substitute_name.size() as u16;
                let print_nbytes = link.print_name.size() as u16;

                let names = LinkNameTable {
                    substitute_name_offset: 0,
                    substitute_name_nbytes: substitute_nbytes,
                    print_name_offset: substitute_nbytes + terminator,
                    print_name_nbytes: print_nbytes,
                };

                let mut writer = Cursor::new(Vec::new());
                names.write(&mut writer).unwrap();
                if link.tag.is_symlink() {
                    let flags: u32 = if link.relative {
                        SYMLINK_FLAG_RELATIVE
                    } else {
                        0
                    };
                    flags.write_le(&mut writer).unwrap();
                }
                link.substitute_name.write_le(&mut writer).unwrap();
                if terminator != 0 {
                    0u16.write_le(&mut writer).unwrap();
                }
                link.print_name.write_le(&mut writer).unwrap();
                if terminator != 0 {
                    0u16.write_le(&mut writer).unwrap();
                }
                writer.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symlink_reparse_round_trip() {
        let link = LinkReparse::symlink(
            WideString::from("\\??\\C:\\target"),
            WideString::from("C:\\target"),
            false,
        );
        let bytes = ReparseData::Link(link.clone()).to_bytes();
        let parsed = ReparseData::parse(ReparseTag::SYMLINK, &bytes).unwrap();
        assert_eq!(parsed, ReparseData::Link(link));
    }

    #[test]
    fn test_relative_symlink_flag_preserved() {
        let link = LinkReparse::symlink(
            WideString::from("../shared"),
            WideString::from("../shared"),
            true,
        );
        let bytes = ReparseData::Link(link).to_bytes();
        match ReparseData::parse(ReparseTag::SYMLINK, &bytes).unwrap() {
            ReparseData::Link(parsed) => assert!(parsed.relative),
            other => panic!("expected link, got {other:?}"),
        }
    }

    #[test]
    fn test_junction_reparse_has_no_flags_field() {
        let link = LinkReparse::junction(
            WideString::from("\\??\\D:\\mount"),
            WideString::from("D:\\mount"),
        );
        let bytes = ReparseData::Link(link.clone()).to_bytes();
        // Name table only, no flags word before the path buffer.
        let parsed = ReparseData::parse(ReparseTag::MOUNT_POINT, &bytes).unwrap();
        assert_eq!(parsed, ReparseData::Link(link));
    }

    #[test]
    fn test_unknown_tag_is_opaque() {
        let tag = ReparseTag(0x8000_0017);
        let data = vec![1u8, 2, 3, 4];
        let parsed = ReparseData::parse(tag, &data).unwrap();
        assert_eq!(
            parsed,
            ReparseData::Raw {
                tag,
                data: data.clone()
            }
        );
        assert_eq!(parsed.to_bytes(), data);
    }

    #[test]
    fn test_truncated_link_buffer_rejected() {
        // Name table claims 8 bytes of substitute name, buffer has none.
        let bytes = [8u8, 0, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(ReparseData::parse(ReparseTag::SYMLINK, &bytes).is_err());
    }
}
