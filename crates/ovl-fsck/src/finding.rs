//! Findings reported by a scan.
//!
//! A finding describes one inconsistency in the overlay. Findings are
//! collected, never thrown; the repair engine consumes the whole batch.

use ovl_ondisk::{CorruptKind, EntryKind};
use ovl_types::{InodeNumber, InodePath, ShardId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ── Orphans ─────────────────────────────────────────────────────────────────

/// What an orphan node's record turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanNodeKind {
    Directory,
    File,
    /// Undecodable; extracted as raw bytes.
    Corrupt,
}

/// A node inside an orphaned directory subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanNode {
    pub inode: InodeNumber,
    /// Path relative to the orphan directory.
    pub path: InodePath,
    /// Mode from the entry that names this node.
    pub mode: u32,
    pub kind: OrphanNodeKind,
}

/// An unreferenced directory and everything recoverable below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanDirectory {
    pub inode: InodeNumber,
    /// Descendants in parent-before-child order.
    pub descendants: Vec<OrphanNode>,
}

impl OrphanDirectory {
    /// Number of non-directory descendants.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.descendants
            .iter()
            .filter(|node| node.kind != OrphanNodeKind::Directory)
            .count()
    }
}

/// Every orphan found in one scan, reported as a single finding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanInodes {
    /// Top-level orphan file records.
    pub files: Vec<InodeNumber>,
    pub directories: Vec<OrphanDirectory>,
}

impl OrphanInodes {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }

    /// Every inode covered, top-level and nested.
    #[must_use]
    pub fn total_inodes(&self) -> usize {
        self.files.len()
            + self
                .directories
                .iter()
                .map(|dir| 1 + dir.descendants.len())
                .sum::<usize>()
    }
}

// ── Finding ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Finding {
    /// A shard directory could not be listed.
    ShardDirectoryUnreadable { path: PathBuf, missing: bool },
    /// A shard directory entry whose name is not an inode number.
    UnexpectedOverlayFile { path: PathBuf },
    /// A record stored in a shard other than the one its number maps to.
    UnexpectedInodeShard { inode: InodeNumber, shard: ShardId },
    /// A materialized entry whose record does not exist.
    MissingMaterializedInode {
        inode: InodeNumber,
        parent: Option<InodeNumber>,
        path: InodePath,
        mode: u32,
    },
    /// A record that exists but cannot be used.
    InvalidMaterializedInode {
        inode: InodeNumber,
        parent: Option<InodeNumber>,
        path: InodePath,
        mode: u32,
        kind: CorruptKind,
        #[serde(skip)]
        bad_data: Vec<u8>,
    },
    /// An inode named by more than one directory entry.
    HardLinkedInode {
        inode: InodeNumber,
        paths: Vec<InodePath>,
    },
    OrphanInodes(OrphanInodes),
    MissingNextInodeNumber { correct_value: InodeNumber },
    CorruptNextInodeNumber { correct_value: InodeNumber },
    BadNextInodeNumber {
        read_value: InodeNumber,
        correct_value: InodeNumber,
    },
}

impl Finding {
    /// Whether the repair engine knows how to fix this finding.
    #[must_use]
    pub fn is_repairable(&self) -> bool {
        match self {
            Self::ShardDirectoryUnreadable { missing, .. } => *missing,
            Self::HardLinkedInode { .. } => false,
            Self::UnexpectedOverlayFile { .. }
            | Self::UnexpectedInodeShard { .. }
            | Self::MissingMaterializedInode { .. }
            | Self::InvalidMaterializedInode { .. }
            | Self::OrphanInodes(_)
            | Self::MissingNextInodeNumber { .. }
            | Self::CorruptNextInodeNumber { .. }
            | Self::BadNextInodeNumber { .. } => true,
        }
    }

    /// The single inode this finding is about, if any.
    #[must_use]
    pub fn inode(&self) -> Option<InodeNumber> {
        match self {
            Self::UnexpectedInodeShard { inode, .. }
            | Self::MissingMaterializedInode { inode, .. }
            | Self::InvalidMaterializedInode { inode, .. }
            | Self::HardLinkedInode { inode, .. } => Some(*inode),
            _ => None,
        }
    }

    /// Stable snake_case name, used in the repair ledger.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ShardDirectoryUnreadable { .. } => "shard_directory_unreadable",
            Self::UnexpectedOverlayFile { .. } => "unexpected_overlay_file",
            Self::UnexpectedInodeShard { .. } => "unexpected_inode_shard",
            Self::MissingMaterializedInode { .. } => "missing_materialized_inode",
            Self::InvalidMaterializedInode { .. } => "invalid_materialized_inode",
            Self::HardLinkedInode { .. } => "hard_linked_inode",
            Self::OrphanInodes(_) => "orphan_inodes",
            Self::MissingNextInodeNumber { .. } => "missing_next_inode_number",
            Self::CorruptNextInodeNumber { .. } => "corrupt_next_inode_number",
            Self::BadNextInodeNumber { .. } => "bad_next_inode_number",
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShardDirectoryUnreadable { path, missing } => {
                write!(f, "unable to read overlay shard directory {}", path.display())?;
                if *missing {
                    write!(f, " (missing)")?;
                }
                Ok(())
            }
            Self::UnexpectedOverlayFile { path } => {
                write!(f, "unexpected file present in overlay: {}", path.display())
            }
            Self::UnexpectedInodeShard { inode, shard } => {
                write!(f, "found inode {inode} in unexpected shard directory {shard}")
            }
            Self::MissingMaterializedInode {
                inode, path, mode, ..
            } => write!(
                f,
                "missing overlay file for materialized {} inode {inode} ({path})",
                EntryKind::from_mode(*mode).describe()
            ),
            Self::InvalidMaterializedInode {
                inode,
                path,
                mode,
                kind,
                ..
            } => write!(
                f,
                "invalid overlay file for materialized {} inode {inode} ({path}): {kind}",
                EntryKind::from_mode(*mode).describe()
            ),
            Self::HardLinkedInode { inode, paths } => {
                write!(f, "found hard linked inode {inode}:")?;
                for path in paths {
                    write!(f, " {path}")?;
                }
                Ok(())
            }
            Self::OrphanInodes(orphans) => write!(
                f,
                "found {} orphan inodes: {} files, {} directories",
                orphans.total_inodes(),
                orphans.files.len(),
                orphans.directories.len()
            ),
            Self::MissingNextInodeNumber { correct_value } => write!(
                f,
                "missing next inode number file, correct value is {correct_value}"
            ),
            Self::CorruptNextInodeNumber { correct_value } => write!(
                f,
                "corrupt next inode number file, correct value is {correct_value}"
            ),
            Self::BadNextInodeNumber {
                read_value,
                correct_value,
            } => write!(
                f,
                "bad stored next inode number: read {read_value} but should be at least {correct_value}"
            ),
        }
    }
}
