//! Reachability walk from the root directory.

use crate::catalog::Catalog;
use crate::finding::Finding;
use ovl_ondisk::mode::DIR_MODE;
use ovl_ondisk::{ChildEntry, CorruptKind, EntryKind, OverlayEntry};
use ovl_types::{InodeNumber, InodePath, ROOT_INODE};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Output of [`walk`].
#[derive(Debug, Default)]
pub struct WalkResult {
    /// Structural findings in discovery order.
    pub findings: Vec<Finding>,
    /// Every inode named by a reachable directory entry, plus the root.
    pub referenced: BTreeSet<InodeNumber>,
}

/// Walk the tree from [`ROOT_INODE`], depth first.
///
/// Each directory is descended into at most once, so cycles and hard links
/// terminate. Entries backed by source control are linked when a record
/// exists but are never reported missing. A corrupt node is reported and not
/// descended into; anything only reachable through it is left for the
/// orphan collector.
#[must_use]
pub fn walk(catalog: &Catalog) -> WalkResult {
    let mut result = WalkResult::default();
    let mut links: BTreeMap<InodeNumber, Vec<InodePath>> = BTreeMap::new();
    let mut stack: Vec<(InodeNumber, InodePath)> = Vec::new();

    result.referenced.insert(ROOT_INODE);
    links.insert(ROOT_INODE, vec![InodePath::root()]);
    match catalog.get(ROOT_INODE) {
        Some(OverlayEntry::Directory(_)) => stack.push((ROOT_INODE, InodePath::root())),
        Some(OverlayEntry::Corrupt(corrupt)) => result.findings.push(invalid(
            ROOT_INODE,
            None,
            InodePath::root(),
            DIR_MODE,
            corrupt.kind.clone(),
            corrupt.raw.clone(),
        )),
        Some(record @ OverlayEntry::File(_)) => result.findings.push(invalid(
            ROOT_INODE,
            None,
            InodePath::root(),
            DIR_MODE,
            CorruptKind::TypeMismatch {
                expected: EntryKind::Directory,
            },
            record.raw_bytes(),
        )),
        None => result.findings.push(Finding::MissingMaterializedInode {
            inode: ROOT_INODE,
            parent: None,
            path: InodePath::root(),
            mode: DIR_MODE,
        }),
    }

    while let Some((parent, parent_path)) = stack.pop() {
        let Some(dir) = catalog.get(parent).and_then(OverlayEntry::as_directory) else {
            continue;
        };
        trace!(target: "ovl::fsck", inode = parent.0, path = %parent_path, "visiting directory");

        let mut subdirs = Vec::new();
        for child in &dir.entries {
            if !child.inode.is_allocated() {
                continue;
            }
            let path = parent_path.join(&child.name);
            let paths = links.entry(child.inode).or_default();
            paths.push(path.clone());
            if paths.len() > 1 {
                continue;
            }
            result.referenced.insert(child.inode);
            if let Some(finding) = check_child(catalog, parent, child, &path, &mut subdirs) {
                result.findings.push(finding);
            }
        }
        // Reversed so subdirectories pop in name order.
        stack.extend(subdirs.into_iter().rev());
    }

    for (inode, paths) in links {
        if paths.len() > 1 {
            debug!(target: "ovl::fsck", inode = inode.0, links = paths.len(), "hard linked inode");
            result.findings.push(Finding::HardLinkedInode { inode, paths });
        }
    }
    result
}

fn check_child(
    catalog: &Catalog,
    parent: InodeNumber,
    child: &ChildEntry,
    path: &InodePath,
    subdirs: &mut Vec<(InodeNumber, InodePath)>,
) -> Option<Finding> {
    let wants_dir = child.kind() == EntryKind::Directory;
    match catalog.get(child.inode) {
        None if child.is_materialized() => Some(Finding::MissingMaterializedInode {
            inode: child.inode,
            parent: Some(parent),
            path: path.clone(),
            mode: child.mode,
        }),
        None => None,
        Some(OverlayEntry::Corrupt(corrupt)) => Some(invalid(
            child.inode,
            Some(parent),
            path.clone(),
            child.mode,
            corrupt.kind.clone(),
            corrupt.raw.clone(),
        )),
        Some(OverlayEntry::Directory(_)) if wants_dir => {
            subdirs.push((child.inode, path.clone()));
            None
        }
        Some(OverlayEntry::File(_)) if !wants_dir => None,
        Some(record) => Some(invalid(
            child.inode,
            Some(parent),
            path.clone(),
            child.mode,
            CorruptKind::TypeMismatch {
                expected: child.kind(),
            },
            record.raw_bytes(),
        )),
    }
}

fn invalid(
    inode: InodeNumber,
    parent: Option<InodeNumber>,
    path: InodePath,
    mode: u32,
    kind: CorruptKind,
    bad_data: Vec<u8>,
) -> Finding {
    Finding::InvalidMaterializedInode {
        inode,
        parent,
        path,
        mode,
        kind,
        bad_data,
    }
}
