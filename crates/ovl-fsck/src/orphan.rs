//! Grouping of unreferenced records into recoverable orphans.

use crate::catalog::Catalog;
use crate::finding::{OrphanDirectory, OrphanInodes, OrphanNode, OrphanNodeKind};
use ovl_ondisk::OverlayEntry;
use ovl_types::{InodeNumber, InodePath};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Collect every catalog record not in `referenced`.
///
/// An unreferenced directory claims its unreferenced descendants, which are
/// then reported only inside that directory's subtree. Corrupt records are
/// recovered as raw bytes when a claiming directory names them; unclaimed
/// corrupt records have no name to recover under and are only logged.
///
/// Returns `None` when nothing is orphaned.
#[must_use]
pub fn collect_orphans(catalog: &Catalog, referenced: &BTreeSet<InodeNumber>) -> Option<OrphanInodes> {
    let unreferenced: BTreeSet<InodeNumber> = catalog
        .iter()
        .map(|(inode, _)| *inode)
        .filter(|inode| !referenced.contains(inode))
        .collect();
    if unreferenced.is_empty() {
        return None;
    }

    let mut claimed = BTreeSet::new();
    for &inode in &unreferenced {
        if let Some(OverlayEntry::Directory(dir)) = catalog.get(inode) {
            claimed.extend(
                dir.entries
                    .iter()
                    .map(|child| child.inode)
                    .filter(|child| *child != inode && unreferenced.contains(child)),
            );
        }
    }

    let mut orphans = OrphanInodes::default();
    let mut covered = BTreeSet::new();
    let roots: Vec<InodeNumber> = unreferenced
        .iter()
        .copied()
        .filter(|inode| !claimed.contains(inode))
        .collect();
    for inode in roots {
        adopt(catalog, referenced, inode, &mut covered, &mut orphans);
    }

    // Directories that only claim each other never surface as roots above.
    // Break each such cycle at its smallest member.
    for &inode in &unreferenced {
        let is_dir = catalog.get(inode).and_then(OverlayEntry::as_directory).is_some();
        if is_dir && !covered.contains(&inode) {
            debug!(target: "ovl::fsck", inode = inode.0, "breaking orphan directory cycle");
            adopt(catalog, referenced, inode, &mut covered, &mut orphans);
        }
    }

    for &inode in &unreferenced {
        if !covered.contains(&inode) {
            warn!(target: "ovl::fsck", inode = inode.0, "unreferenced corrupt record cannot be recovered");
        }
    }

    (!orphans.is_empty()).then_some(orphans)
}

fn adopt(
    catalog: &Catalog,
    referenced: &BTreeSet<InodeNumber>,
    inode: InodeNumber,
    covered: &mut BTreeSet<InodeNumber>,
    orphans: &mut OrphanInodes,
) {
    match catalog.get(inode) {
        Some(OverlayEntry::File(_)) => {
            covered.insert(inode);
            orphans.files.push(inode);
        }
        Some(OverlayEntry::Directory(_)) => {
            covered.insert(inode);
            let descendants = subtree(catalog, referenced, inode, covered);
            orphans.directories.push(OrphanDirectory { inode, descendants });
        }
        Some(OverlayEntry::Corrupt(_)) | None => {}
    }
}

/// Every unreferenced node below `top`, parents before children.
fn subtree(
    catalog: &Catalog,
    referenced: &BTreeSet<InodeNumber>,
    top: InodeNumber,
    covered: &mut BTreeSet<InodeNumber>,
) -> Vec<OrphanNode> {
    let mut nodes = Vec::new();
    let mut worklist = vec![(top, InodePath::root())];

    while let Some((inode, path)) = worklist.pop() {
        let Some(OverlayEntry::Directory(dir)) = catalog.get(inode) else {
            continue;
        };
        let mut subdirs = Vec::new();
        let mut used_names = BTreeSet::new();
        for child in &dir.entries {
            if !child.inode.is_allocated()
                || referenced.contains(&child.inode)
                || covered.contains(&child.inode)
            {
                continue;
            }
            // Absent children were never materialized; nothing to recover.
            let Some(record) = catalog.get(child.inode) else {
                continue;
            };
            covered.insert(child.inode);
            let name = unique_name(&mut used_names, &child.name, child.inode);
            let child_path = path.join(&name);
            let kind = match record {
                OverlayEntry::Directory(_) => {
                    subdirs.push((child.inode, child_path.clone()));
                    OrphanNodeKind::Directory
                }
                OverlayEntry::File(_) => OrphanNodeKind::File,
                OverlayEntry::Corrupt(_) => OrphanNodeKind::Corrupt,
            };
            nodes.push(OrphanNode {
                inode: child.inode,
                path: child_path,
                mode: child.mode,
                kind,
            });
        }
        worklist.extend(subdirs.into_iter().rev());
    }
    nodes
}

/// `name`, or `name.<inode>` if a sibling already took it.
///
/// Directory records may repeat a name; extraction needs distinct paths.
fn unique_name(used: &mut BTreeSet<Vec<u8>>, name: &[u8], inode: InodeNumber) -> Vec<u8> {
    let mut candidate = name.to_vec();
    while used.contains(&candidate) {
        candidate.extend_from_slice(format!(".{inode}").as_bytes());
    }
    used.insert(candidate.clone());
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovl_ondisk::mode::{DIR_MODE, FILE_MODE};
    use ovl_ondisk::{ChildEntry, DirectoryRecord, FileRecord, InodeTimestamps, decode_record};

    fn dir(children: &[(&str, u64, u32)]) -> OverlayEntry {
        OverlayEntry::Directory(DirectoryRecord::new(
            InodeTimestamps::default(),
            children
                .iter()
                .map(|(name, inode, mode)| {
                    ChildEntry::materialized(name.as_bytes(), InodeNumber(*inode), *mode)
                })
                .collect(),
        ))
    }

    fn file() -> OverlayEntry {
        OverlayEntry::File(FileRecord::new(b"data".to_vec()))
    }

    fn build(records: Vec<(u64, OverlayEntry)>) -> Catalog {
        let mut catalog = Catalog::default();
        for (inode, record) in records {
            catalog.insert(InodeNumber(inode), record);
        }
        catalog
    }

    fn set(inodes: &[u64]) -> BTreeSet<InodeNumber> {
        inodes.iter().copied().map(InodeNumber).collect()
    }

    #[test]
    fn nothing_unreferenced_means_none() {
        let catalog = build(vec![(1, dir(&[("a", 2, FILE_MODE)])), (2, file())]);
        assert_eq!(collect_orphans(&catalog, &set(&[1, 2])), None);
    }

    #[test]
    fn directory_claims_its_descendants() {
        let catalog = build(vec![
            (1, dir(&[])),
            (50, dir(&[("a", 51, FILE_MODE), ("sub", 58, DIR_MODE)])),
            (51, file()),
            (57, file()),
            (58, dir(&[("c", 53, FILE_MODE), ("lost", 99, FILE_MODE)])),
            (53, file()),
        ]);
        let orphans = collect_orphans(&catalog, &set(&[1])).expect("orphans");
        assert_eq!(orphans.files, vec![InodeNumber(57)]);
        assert_eq!(orphans.directories.len(), 1);
        let top = &orphans.directories[0];
        assert_eq!(top.inode, InodeNumber(50));
        let paths: Vec<String> = top.descendants.iter().map(|n| n.path.to_string()).collect();
        assert_eq!(paths, vec!["a", "sub", "sub/c"]);
        assert_eq!(top.file_count(), 2);
    }

    #[test]
    fn referenced_children_stay_with_their_parent() {
        let catalog = build(vec![
            (1, dir(&[("kept", 3, FILE_MODE)])),
            (2, dir(&[("kept", 3, FILE_MODE)])),
            (3, file()),
        ]);
        let orphans = collect_orphans(&catalog, &set(&[1, 3])).expect("orphans");
        assert_eq!(orphans.directories[0].inode, InodeNumber(2));
        assert!(orphans.directories[0].descendants.is_empty());
    }

    #[test]
    fn corrupt_descendants_are_kept_and_unclaimed_corrupt_records_dropped() {
        let catalog = build(vec![
            (1, dir(&[])),
            (10, dir(&[("bad", 11, FILE_MODE)])),
            (11, decode_record(b"junk".to_vec())),
            (12, decode_record(Vec::new())),
        ]);
        let orphans = collect_orphans(&catalog, &set(&[1])).expect("orphans");
        assert!(orphans.files.is_empty());
        assert_eq!(orphans.directories.len(), 1);
        assert_eq!(
            orphans.directories[0].descendants[0].kind,
            OrphanNodeKind::Corrupt
        );
    }

    #[test]
    fn mutually_claiming_directories_break_at_smallest() {
        let catalog = build(vec![
            (1, dir(&[])),
            (20, dir(&[("b", 21, DIR_MODE)])),
            (21, dir(&[("a", 20, DIR_MODE), ("f", 22, FILE_MODE)])),
            (22, file()),
        ]);
        let orphans = collect_orphans(&catalog, &set(&[1])).expect("orphans");
        assert_eq!(orphans.directories.len(), 1);
        let top = &orphans.directories[0];
        assert_eq!(top.inode, InodeNumber(20));
        let inodes: Vec<u64> = top.descendants.iter().map(|n| n.inode.0).collect();
        assert_eq!(inodes, vec![21, 22]);
    }

    #[test]
    fn repeated_names_get_distinct_paths() {
        let catalog = build(vec![
            (1, dir(&[])),
            (
                10,
                dir(&[
                    ("same", 11, FILE_MODE),
                    ("same", 12, FILE_MODE),
                    ("same.12", 13, FILE_MODE),
                ]),
            ),
            (11, file()),
            (12, file()),
            (13, file()),
        ]);
        let orphans = collect_orphans(&catalog, &set(&[1])).expect("orphans");
        let paths: Vec<String> = orphans.directories[0]
            .descendants
            .iter()
            .map(|n| n.path.to_string())
            .collect();
        assert_eq!(paths, vec!["same", "same.12", "same.12.13"]);
    }
}
