#![forbid(unsafe_code)]
//! On-disk format parsing for overlay records.
//!
//! Pure parsing crate with no I/O. Decodes byte slices into
//! directory records (header plus child entries), file records (header plus
//! opaque content), or a corrupt record that keeps the raw bytes and any
//! children salvaged before the failure point. Also encodes the same
//! structures and the next-inode-number payload.

pub mod counter;
pub mod mode;
pub mod record;

pub use counter::{decode_next_inode_number, encode_next_inode_number};
pub use mode::EntryKind;
pub use record::{
    ChildEntry, CorruptKind, CorruptRecord, DirectoryRecord, FileRecord, InodeTimestamps,
    OverlayEntry, Timestamp, decode_record, validate_name,
};
