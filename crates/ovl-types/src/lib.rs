#![forbid(unsafe_code)]
//! Shared types for the overlay checker.
//!
//! Inode and shard newtypes, the on-disk layout constants, the parse-layer
//! [`ParseError`], and bounds-checked byte readers used by `ovl-ondisk`.

use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use thiserror::Error;

/// Inode number of the checkout root directory.
pub const ROOT_INODE: InodeNumber = InodeNumber(1);

/// Number of shard subdirectories below the overlay root (`00`..`ff`).
pub const NUM_SHARDS: u32 = 256;

/// File at the overlay root holding the next inode number to allocate.
pub const NEXT_INODE_NUMBER_FILE: &str = "next-inode-number";

/// Staging directory for atomic record writes.
pub const TMP_DIR: &str = "tmp";

pub const DIR_MAGIC: [u8; 4] = *b"OVDR";
pub const FILE_MAGIC: [u8; 4] = *b"OVFL";
pub const FORMAT_VERSION: u32 = 1;

/// Magic + version.
pub const RECORD_PREFIX_LEN: usize = 8;
/// One timestamp: 8-byte seconds + 4-byte nanoseconds.
pub const TIMESTAMP_LEN: usize = 12;
/// Magic + version + mtime/ctime/atime.
pub const DIR_HEADER_LEN: usize = RECORD_PREFIX_LEN + 3 * TIMESTAMP_LEN;
pub const FILE_HEADER_LEN: usize = RECORD_PREFIX_LEN;

/// Exact size of the next-inode-number payload.
pub const NEXT_INODE_NUMBER_LEN: usize = 8;

/// Longest child name accepted in a directory record.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    /// Shard directory that must hold this inode's record.
    #[must_use]
    pub fn shard(self) -> ShardId {
        ShardId((self.0 & 0xff) as u8)
    }

    /// Inode `0` marks a child entry that never had a number allocated.
    #[must_use]
    pub fn is_allocated(self) -> bool {
        self.0 != 0
    }

    /// The next number after this one, or `None` at `u64::MAX`.
    #[must_use]
    pub fn successor(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of one of the [`NUM_SHARDS`] shard directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u8);

impl ShardId {
    /// Every shard in scan order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..=u8::MAX).map(Self)
    }

    /// Two lowercase hex digits, e.g. `0a`.
    #[must_use]
    pub fn dir_name(self) -> String {
        format!("{:02x}", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// Path of an inode relative to some starting directory, as raw name bytes.
///
/// Only used for reporting and for naming extracted data; identity is always
/// the inode number.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodePath {
    components: Vec<Vec<u8>>,
}

impl InodePath {
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn join(&self, name: &[u8]) -> Self {
        let mut components = self.components.clone();
        components.push(name.to_vec());
        Self { components }
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    #[must_use]
    pub fn file_name(&self) -> Option<&[u8]> {
        self.components.last().map(Vec::as_slice)
    }

    /// Relative filesystem path built from the raw name bytes.
    #[must_use]
    pub fn to_path_buf(&self) -> PathBuf {
        self.components
            .iter()
            .map(|c| OsStr::from_bytes(c))
            .collect()
    }
}

impl From<&str> for InodePath {
    fn from(value: &str) -> Self {
        Self {
            components: value
                .split('/')
                .filter(|c| !c.is_empty())
                .map(|c| c.as_bytes().to_vec())
                .collect(),
        }
    }
}

impl fmt::Display for InodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "<root>");
        }
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", String::from_utf8_lossy(component))?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    Ok(u16::from_be_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_be_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_be_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}
