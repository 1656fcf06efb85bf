//! Directory and file records.
//!
//! ```text
//! directory: "OVDR" | version u32 BE | mtime | ctime | atime | child*
//!            timestamp = secs u64 BE | nanos u32 BE
//!            child     = name_len u16 BE | name | inode u64 BE | mode u32 BE
//!                        | flags u8 | hash_len u8 | hash
//! file:      "OVFL" | version u32 BE | content
//! ```
//!
//! Decoding never fails outright: bytes that do not form a valid record
//! become [`OverlayEntry::Corrupt`], keeping the raw bytes and every child
//! entry that was fully parsed before the failure point.

use crate::mode::EntryKind;
use ovl_types::{
    DIR_HEADER_LEN, DIR_MAGIC, FILE_HEADER_LEN, FILE_MAGIC, FORMAT_VERSION, InodeNumber,
    MAX_NAME_LEN, ParseError, RECORD_PREFIX_LEN, TIMESTAMP_LEN, ensure_slice, read_be_u16,
    read_be_u32, read_be_u64, read_fixed, read_u8,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Child flag bit: content lives in the overlay rather than source control.
const FLAG_MATERIALIZED: u8 = 0x01;

/// name_len + inode + mode + flags + hash_len, with an empty name and hash.
const CHILD_FIXED_LEN: usize = 2 + 8 + 4 + 1 + 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self {
            secs: since_epoch.as_secs(),
            nanos: since_epoch.subsec_nanos(),
        }
    }

    fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            secs: read_be_u64(data, offset)?,
            nanos: read_be_u32(data, offset + 8)?,
        })
    }

    fn write(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.nanos.to_be_bytes());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeTimestamps {
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub atime: Timestamp,
}

impl InodeTimestamps {
    /// All three timestamps set to the same instant.
    #[must_use]
    pub fn uniform(at: Timestamp) -> Self {
        Self {
            mtime: at,
            ctime: at,
            atime: at,
        }
    }
}

/// One entry in a directory record's child list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEntry {
    pub name: Vec<u8>,
    pub inode: InodeNumber,
    pub mode: u32,
    pub materialized: bool,
    /// Source-control content hash; empty for materialized entries.
    pub hash: Vec<u8>,
}

impl ChildEntry {
    /// A materialized entry (no hash).
    #[must_use]
    pub fn materialized(name: &[u8], inode: InodeNumber, mode: u32) -> Self {
        Self {
            name: name.to_vec(),
            inode,
            mode,
            materialized: true,
            hash: Vec::new(),
        }
    }

    /// An entry backed by source control content.
    #[must_use]
    pub fn from_source_control(name: &[u8], inode: InodeNumber, mode: u32, hash: &[u8]) -> Self {
        Self {
            name: name.to_vec(),
            inode,
            mode,
            materialized: false,
            hash: hash.to_vec(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> EntryKind {
        EntryKind::from_mode(self.mode)
    }

    /// Whether the entry's content must be present in the overlay.
    ///
    /// An entry carrying a hash is backed by source control even if the flag
    /// bit is set.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.materialized && self.hash.is_empty()
    }

    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    fn encoded_len(&self) -> usize {
        CHILD_FIXED_LEN + self.name.len() + self.hash.len()
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), ParseError> {
        validate_name(&self.name)?;
        let name_len = u16::try_from(self.name.len())
            .map_err(|_| ParseError::IntegerConversion { field: "name_len" })?;
        let hash_len = u8::try_from(self.hash.len())
            .map_err(|_| ParseError::IntegerConversion { field: "hash_len" })?;
        out.extend_from_slice(&name_len.to_be_bytes());
        out.extend_from_slice(&self.name);
        out.extend_from_slice(&self.inode.0.to_be_bytes());
        out.extend_from_slice(&self.mode.to_be_bytes());
        out.push(if self.materialized { FLAG_MATERIALIZED } else { 0 });
        out.push(hash_len);
        out.extend_from_slice(&self.hash);
        Ok(())
    }
}

/// Reject names that could escape their directory when extracted.
pub fn validate_name(name: &[u8]) -> Result<(), ParseError> {
    if name.is_empty() {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "empty",
        });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "longer than 255 bytes",
        });
    }
    if name == b"." || name == b".." {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "reserved dot entry",
        });
    }
    if name.iter().any(|&b| b == b'/' || b == 0) {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "contains '/' or NUL",
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub timestamps: InodeTimestamps,
    pub entries: Vec<ChildEntry>,
}

impl DirectoryRecord {
    #[must_use]
    pub fn new(timestamps: InodeTimestamps, mut entries: Vec<ChildEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            timestamps,
            entries,
        }
    }

    /// Encode the record. Child entries are written in their current order.
    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let body: usize = self.entries.iter().map(ChildEntry::encoded_len).sum();
        let mut out = Vec::with_capacity(DIR_HEADER_LEN + body);
        out.extend_from_slice(&DIR_MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        self.timestamps.mtime.write(&mut out);
        self.timestamps.ctime.write(&mut out);
        self.timestamps.atime.write(&mut out);
        for entry in &self.entries {
            entry.write(&mut out)?;
        }
        Ok(out)
    }

    #[must_use]
    pub fn find(&self, name: &[u8]) -> Option<&ChildEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub content: Vec<u8>,
}

impl FileRecord {
    #[must_use]
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FILE_HEADER_LEN + self.content.len());
        out.extend_from_slice(&FILE_MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        out.extend_from_slice(&self.content);
        out
    }
}

/// Why a record failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorruptKind {
    /// Fewer bytes than the header for this record type.
    ShortHeader { len: usize, needed: usize },
    /// The first four bytes are neither `OVDR` nor `OVFL`.
    BadMagic { magic: [u8; 4] },
    UnsupportedVersion { version: u32 },
    /// The child stream ends in the middle of an entry.
    ShortBody { offset: usize },
    /// A child name is empty, a dot entry, or contains `/` or NUL.
    InvalidName { offset: usize },
    /// The record exists but could not be read.
    Unreadable { detail: String },
    /// Well-formed, but not the record type the referencing entry's mode
    /// requires. Assigned by the checker; decoding never produces it.
    TypeMismatch { expected: EntryKind },
}

impl fmt::Display for CorruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortHeader { len: 0, .. } => write!(f, "zero-sized overlay file"),
            Self::ShortHeader { len, needed } => {
                write!(f, "short header: {len} bytes, expected at least {needed}")
            }
            Self::BadMagic { magic } => write!(
                f,
                "unknown overlay file type ID: {:02x}{:02x}{:02x}{:02x}",
                magic[0], magic[1], magic[2], magic[3]
            ),
            Self::UnsupportedVersion { version } => {
                write!(f, "unknown overlay file format version {version}")
            }
            Self::ShortBody { offset } => {
                write!(f, "short body: child entry truncated at offset {offset}")
            }
            Self::InvalidName { offset } => {
                write!(f, "invalid child name at offset {offset}")
            }
            Self::Unreadable { detail } => write!(f, "error reading file: {detail}"),
            Self::TypeMismatch { expected } => {
                write!(f, "record type does not match mode: expected {}", expected.describe())
            }
        }
    }
}

/// A record that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptRecord {
    pub kind: CorruptKind,
    #[serde(skip)]
    pub raw: Vec<u8>,
    /// Children parsed before a `ShortBody`/`InvalidName` failure.
    pub salvaged: Vec<ChildEntry>,
}

impl CorruptRecord {
    #[must_use]
    pub fn new(kind: CorruptKind, raw: Vec<u8>) -> Self {
        Self {
            kind,
            raw,
            salvaged: Vec::new(),
        }
    }

    /// Whether the raw bytes carry the directory magic.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.raw.starts_with(&DIR_MAGIC)
    }
}

/// A decoded overlay record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEntry {
    Directory(DirectoryRecord),
    File(FileRecord),
    Corrupt(CorruptRecord),
}

impl OverlayEntry {
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }

    #[must_use]
    pub fn as_directory(&self) -> Option<&DirectoryRecord> {
        match self {
            Self::Directory(dir) => Some(dir),
            Self::File(_) | Self::Corrupt(_) => None,
        }
    }

    /// Every inode number this record mentions, including salvaged children.
    pub fn referenced_inodes(&self) -> impl Iterator<Item = InodeNumber> + '_ {
        let entries: &[ChildEntry] = match self {
            Self::Directory(dir) => &dir.entries,
            Self::Corrupt(corrupt) => &corrupt.salvaged,
            Self::File(_) => &[],
        };
        entries.iter().map(|e| e.inode)
    }

    /// Bytes that reproduce this record on disk.
    #[must_use]
    pub fn raw_bytes(&self) -> Vec<u8> {
        match self {
            Self::Directory(dir) => dir.encode().unwrap_or_default(),
            Self::File(file) => file.encode(),
            Self::Corrupt(corrupt) => corrupt.raw.clone(),
        }
    }
}

/// Decode one overlay record.
#[must_use]
pub fn decode_record(raw: Vec<u8>) -> OverlayEntry {
    let magic: [u8; 4] = match read_fixed(&raw, 0) {
        Ok(magic) => magic,
        Err(_) => {
            let kind = CorruptKind::ShortHeader {
                len: raw.len(),
                needed: RECORD_PREFIX_LEN,
            };
            return OverlayEntry::Corrupt(CorruptRecord::new(kind, raw));
        }
    };
    let is_dir = match magic {
        DIR_MAGIC => true,
        FILE_MAGIC => false,
        _ => {
            return OverlayEntry::Corrupt(CorruptRecord::new(
                CorruptKind::BadMagic { magic },
                raw,
            ));
        }
    };

    let needed = if is_dir { DIR_HEADER_LEN } else { FILE_HEADER_LEN };
    let Ok(version) = read_be_u32(&raw, 4) else {
        let kind = CorruptKind::ShortHeader {
            len: raw.len(),
            needed,
        };
        return OverlayEntry::Corrupt(CorruptRecord::new(kind, raw));
    };
    if version != FORMAT_VERSION {
        return OverlayEntry::Corrupt(CorruptRecord::new(
            CorruptKind::UnsupportedVersion { version },
            raw,
        ));
    }

    if !is_dir {
        let content = raw[FILE_HEADER_LEN..].to_vec();
        return OverlayEntry::File(FileRecord { content });
    }

    if raw.len() < DIR_HEADER_LEN {
        let kind = CorruptKind::ShortHeader {
            len: raw.len(),
            needed,
        };
        return OverlayEntry::Corrupt(CorruptRecord::new(kind, raw));
    }
    decode_directory(raw)
}

fn decode_directory(raw: Vec<u8>) -> OverlayEntry {
    let timestamps = match parse_timestamps(&raw) {
        Ok(ts) => ts,
        Err(_) => {
            let kind = CorruptKind::ShortHeader {
                len: raw.len(),
                needed: DIR_HEADER_LEN,
            };
            return OverlayEntry::Corrupt(CorruptRecord::new(kind, raw));
        }
    };

    let mut entries = Vec::new();
    let mut offset = DIR_HEADER_LEN;
    while offset < raw.len() {
        match parse_child(&raw, offset) {
            Ok((entry, next)) => {
                entries.push(entry);
                offset = next;
            }
            Err(failure) => {
                let kind = match failure {
                    ChildFailure::Truncated => CorruptKind::ShortBody { offset },
                    ChildFailure::InvalidName => CorruptKind::InvalidName { offset },
                };
                return OverlayEntry::Corrupt(CorruptRecord {
                    kind,
                    raw,
                    salvaged: entries,
                });
            }
        }
    }

    OverlayEntry::Directory(DirectoryRecord {
        timestamps,
        entries,
    })
}

fn parse_timestamps(data: &[u8]) -> Result<InodeTimestamps, ParseError> {
    let base = RECORD_PREFIX_LEN;
    Ok(InodeTimestamps {
        mtime: Timestamp::parse(data, base)?,
        ctime: Timestamp::parse(data, base + TIMESTAMP_LEN)?,
        atime: Timestamp::parse(data, base + 2 * TIMESTAMP_LEN)?,
    })
}

enum ChildFailure {
    Truncated,
    InvalidName,
}

impl From<ParseError> for ChildFailure {
    fn from(_: ParseError) -> Self {
        Self::Truncated
    }
}

fn parse_child(data: &[u8], offset: usize) -> Result<(ChildEntry, usize), ChildFailure> {
    let name_len = usize::from(read_be_u16(data, offset)?);
    let mut cursor = offset + 2;
    let name = ensure_slice(data, cursor, name_len)?.to_vec();
    cursor += name_len;
    let inode = InodeNumber(read_be_u64(data, cursor)?);
    cursor += 8;
    let mode = read_be_u32(data, cursor)?;
    cursor += 4;
    let flags = read_u8(data, cursor)?;
    cursor += 1;
    let hash_len = usize::from(read_u8(data, cursor)?);
    cursor += 1;
    let hash = ensure_slice(data, cursor, hash_len)?.to_vec();
    cursor += hash_len;

    // Only judge the name once the whole entry is present, so a cut inside
    // an entry is always reported as a short body.
    if validate_name(&name).is_err() {
        return Err(ChildFailure::InvalidName);
    }

    Ok((
        ChildEntry {
            name,
            inode,
            mode,
            materialized: flags & FLAG_MATERIALIZED != 0,
            hash,
        },
        cursor,
    ))
}
