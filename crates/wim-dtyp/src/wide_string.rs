//! UTF-16LE strings sized by an explicit byte length, as WIM metadata
//! stores filenames and alternate stream names.

use core::fmt::{self, Write as _};
use std::io::prelude::*;
use std::string::FromUtf16Error;

use binrw::io::Write;
use binrw::{Endian, prelude::*};

/// A UTF-16 string terminated by a provided byte size rather than a null
/// character.
///
/// Dentry filenames, DOS names and alternate-stream names are all encoded
/// this way in WIM metadata. The code units are kept raw: WIM names are not
/// required to be valid UTF-16, so conversion to [`String`] is fallible.
#[derive(Clone, Eq, PartialEq, Default, Hash)]
pub struct WideString {
    /// The raw UTF-16LE code units.
    data: Vec<u16>,
}

impl WideString {
    const CHAR_WIDTH: u64 = std::mem::size_of::<u16>() as u64;

    /// Size of the string's data, in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64 * Self::CHAR_WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn code_units(&self) -> &[u16] {
        &self.data
    }

    /// Lossy conversion for display and logging; unpaired surrogates become
    /// U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        char::decode_utf16(self.data.iter().copied())
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }

    /// Case-insensitive comparison using simple (per-code-unit) upcasing,
    /// the same collation WIM metadata applies to sibling names.
    pub fn eq_ignore_case(&self, other: &WideString) -> bool {
        if self.data.len() != other.data.len() {
            return false;
        }
        self.data
            .iter()
            .zip(other.data.iter())
            .all(|(a, b)| upcase(*a) == upcase(*b))
    }
}

/// Simple upcase of a single UTF-16 code unit.
fn upcase(unit: u16) -> u16 {
    match char::from_u32(unit as u32) {
        Some(c) => {
            let mut up = c.to_uppercase();
            let first = up.next().unwrap_or(c);
            // Multi-char expansions do not round-trip through one unit.
            if up.next().is_some() || first as u32 > u16::MAX as u32 {
                unit
            } else {
                first as u16
            }
        }
        None => unit,
    }
}

impl BinRead for WideString {
    type Args<'a> = (u64,);

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        size_bytes: Self::Args<'_>,
    ) -> BinResult<Self> {
        // Size is in bytes, but we need to read in chars.
        assert!(
            size_bytes.0 % Self::CHAR_WIDTH == 0,
            "Size must be a multiple of char width"
        );
        let size_chars = size_bytes.0 / Self::CHAR_WIDTH;

        let mut values = Vec::with_capacity(size_chars as usize);
        for _ in 0..size_chars {
            values.push(u16::read_options(reader, endian, ())?);
        }
        Ok(Self { data: values })
    }
}

impl BinWrite for WideString {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        args: Self::Args<'_>,
    ) -> BinResult<()> {
        self.data.write_options(writer, endian, args)
    }
}

impl From<&str> for WideString {
    fn from(s: &str) -> Self {
        Self {
            data: s.encode_utf16().collect(),
        }
    }
}

impl From<String> for WideString {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl FromIterator<u16> for WideString {
    fn from_iter<T: IntoIterator<Item = u16>>(iter: T) -> Self {
        Self {
            data: iter.into_iter().collect(),
        }
    }
}

impl TryFrom<&WideString> for String {
    type Error = FromUtf16Error;

    fn try_from(value: &WideString) -> Result<Self, Self::Error> {
        String::from_utf16(&value.data)
    }
}

impl PartialEq<&str> for WideString {
    fn eq(&self, other: &&str) -> bool {
        other.encode_utf16().eq(self.data.iter().copied())
    }
}

impl fmt::Display for WideString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        display_utf16(&self.data, f, core::iter::once)
    }
}

impl fmt::Debug for WideString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WideString(\"")?;
        display_utf16(&self.data, f, char::escape_debug)?;
        write!(f, "\")")
    }
}

#[inline]
fn display_utf16<Transformer: Fn(char) -> O, O: Iterator<Item = char>>(
    input: &[u16],
    f: &mut fmt::Formatter<'_>,
    t: Transformer,
) -> fmt::Result {
    char::decode_utf16(input.iter().copied())
        .flat_map(|r| t(r.unwrap_or(char::REPLACEMENT_CHARACTER)))
        .try_for_each(|c| f.write_char(c))
}
