//! File-type classification of the mode bits stored in child entries.

use serde::{Deserialize, Serialize};

const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFDIR: u32 = libc::S_IFDIR as u32;
const S_IFREG: u32 = libc::S_IFREG as u32;
const S_IFLNK: u32 = libc::S_IFLNK as u32;
const S_IFSOCK: u32 = libc::S_IFSOCK as u32;

/// Default mode for directories created by the checker.
pub const DIR_MODE: u32 = S_IFDIR | 0o755;
/// Default mode for regular files created by the checker.
pub const FILE_MODE: u32 = S_IFREG | 0o644;
/// Default mode for symlinks created by the checker.
pub const SYMLINK_MODE: u32 = S_IFLNK | 0o777;
/// Socket mode, only used by tests and fixtures.
pub const SOCKET_MODE: u32 = S_IFSOCK | 0o755;

/// File type encoded in a mode's `S_IFMT` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Directory,
    Regular,
    Symlink,
    Socket,
    /// FIFOs, device nodes, and unknown type bits.
    Other,
}

impl EntryKind {
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Directory,
            S_IFREG => Self::Regular,
            S_IFLNK => Self::Symlink,
            S_IFSOCK => Self::Socket,
            _ => Self::Other,
        }
    }

    /// Human-readable name used in finding descriptions.
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::Symlink => "symlink",
            Self::Regular | Self::Socket | Self::Other => "file",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_type_bits() {
        assert_eq!(EntryKind::from_mode(DIR_MODE), EntryKind::Directory);
        assert_eq!(EntryKind::from_mode(FILE_MODE), EntryKind::Regular);
        assert_eq!(EntryKind::from_mode(S_IFREG | 0o755), EntryKind::Regular);
        assert_eq!(EntryKind::from_mode(SYMLINK_MODE), EntryKind::Symlink);
        assert_eq!(EntryKind::from_mode(SOCKET_MODE), EntryKind::Socket);
        assert_eq!(EntryKind::from_mode(0), EntryKind::Other);
    }

    #[test]
    fn sockets_describe_as_files() {
        assert_eq!(EntryKind::Socket.describe(), "file");
        assert_eq!(EntryKind::Symlink.describe(), "symlink");
        assert_eq!(EntryKind::Directory.describe(), "directory");
    }
}
