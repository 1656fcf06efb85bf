//! Flat index of every record found in the shard directories.

use crate::finding::Finding;
use ovl_error::Result;
use ovl_ondisk::OverlayEntry;
use ovl_store::{Overlay, ShardEntry};
use ovl_types::{InodeNumber, NUM_SHARDS, ROOT_INODE, ShardId};
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::io;
use tracing::{debug, warn};

/// Every decoded record, keyed by inode number.
///
/// Built once per run and only borrowed afterwards. Parent links are not
/// known here; the walker derives them.
#[derive(Debug, Default)]
pub struct Catalog {
    entries: BTreeMap<InodeNumber, OverlayEntry>,
    /// Inodes stored more than once; the later record was kept.
    duplicates: Vec<InodeNumber>,
}

impl Catalog {
    /// Scan every shard, decoding each record.
    ///
    /// Layout problems found along the way are appended to `findings`.
    /// `progress` receives completed tenths (0..=10).
    pub fn scan(
        overlay: &Overlay,
        findings: &mut Vec<Finding>,
        progress: &mut dyn FnMut(u32),
    ) -> Result<Self> {
        let mut catalog = Self::default();
        let mut reported = 0;
        progress(0);

        for (done, shard) in ShardId::all().enumerate() {
            match overlay.list_shard(shard) {
                Ok(listing) => catalog.load_shard(overlay, shard, listing, findings)?,
                Err(err) => {
                    let path = overlay.shard_dir(shard);
                    warn!(target: "ovl::fsck", shard = %shard, error = %err, "shard directory unreadable");
                    findings.push(Finding::ShardDirectoryUnreadable {
                        path,
                        missing: err.kind() == io::ErrorKind::NotFound,
                    });
                }
            }

            let tenths = (u32::try_from(done + 1).unwrap_or(NUM_SHARDS) * 10) / NUM_SHARDS;
            if tenths > reported {
                reported = tenths;
                progress(tenths);
            }
        }

        debug!(
            target: "ovl::fsck",
            records = catalog.entries.len(),
            duplicates = catalog.duplicates.len(),
            "catalog built"
        );
        Ok(catalog)
    }

    fn load_shard(
        &mut self,
        overlay: &Overlay,
        shard: ShardId,
        listing: Vec<ShardEntry>,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        for entry in listing {
            match entry {
                ShardEntry::Unexpected { path } => {
                    debug!(target: "ovl::fsck", path = %path.display(), "unexpected overlay file");
                    findings.push(Finding::UnexpectedOverlayFile { path });
                }
                ShardEntry::Record { inode, path } if !inode.is_allocated() => {
                    findings.push(Finding::UnexpectedOverlayFile { path });
                }
                ShardEntry::Record { inode, path } => {
                    if inode.shard() != shard {
                        findings.push(Finding::UnexpectedInodeShard { inode, shard });
                    }
                    if let Some(record) = overlay.read_record_at(&path)? {
                        self.insert(inode, record);
                    }
                }
            }
        }
        Ok(())
    }

    /// Insert a record. A second record for the same inode replaces the first.
    pub fn insert(&mut self, inode: InodeNumber, record: OverlayEntry) {
        if self.entries.insert(inode, record).is_some() {
            warn!(target: "ovl::fsck", inode = inode.0, "inode stored more than once; keeping the later record");
            self.duplicates.push(inode);
        }
    }

    #[must_use]
    pub fn get(&self, inode: InodeNumber) -> Option<&OverlayEntry> {
        self.entries.get(&inode)
    }

    #[must_use]
    pub fn contains(&self, inode: InodeNumber) -> bool {
        self.entries.contains_key(&inode)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records in ascending inode order.
    pub fn iter(&self) -> btree_map::Iter<'_, InodeNumber, OverlayEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn duplicates(&self) -> &[InodeNumber] {
        &self.duplicates
    }

    /// Largest inode number stored or named anywhere, never below the root.
    ///
    /// Covers record names, every child entry (materialized or not), and
    /// children salvaged from truncated directories.
    #[must_use]
    pub fn max_inode(&self) -> InodeNumber {
        self.entries
            .iter()
            .flat_map(|(inode, record)| std::iter::once(*inode).chain(record.referenced_inodes()))
            .fold(ROOT_INODE, InodeNumber::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovl_ondisk::mode::FILE_MODE;
    use ovl_ondisk::{ChildEntry, DirectoryRecord, FileRecord};
    use ovl_store::now_timestamps;
    use std::fs;

    fn scan(overlay: &Overlay) -> (Catalog, Vec<Finding>) {
        let mut findings = Vec::new();
        let catalog = Catalog::scan(overlay, &mut findings, &mut |_| {}).unwrap();
        (catalog, findings)
    }

    #[test]
    fn fresh_overlay_has_only_root() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = Overlay::create(dir.path().join("local")).unwrap();
        let (catalog, findings) = scan(&overlay);
        assert!(findings.is_empty());
        assert_eq!(catalog.len(), 1);
        assert!(catalog.contains(ROOT_INODE));
        assert_eq!(catalog.max_inode(), ROOT_INODE);
    }

    #[test]
    fn max_inode_counts_unstored_children() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = Overlay::create(dir.path().join("local")).unwrap();
        let root = DirectoryRecord::new(
            now_timestamps(),
            vec![
                ChildEntry::materialized(b"a", InodeNumber(5), FILE_MODE),
                ChildEntry::from_source_control(b"b", InodeNumber(90), FILE_MODE, &[1; 20]),
            ],
        );
        overlay.save_directory(ROOT_INODE, &root).unwrap();
        overlay.save_file(InodeNumber(5), b"x").unwrap();
        let (catalog, _) = scan(&overlay);
        assert_eq!(catalog.max_inode(), InodeNumber(90));
    }

    #[test]
    fn reports_layout_problems() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = Overlay::create(dir.path().join("local")).unwrap();
        fs::remove_dir(overlay.shard_dir(ShardId(0x7f))).unwrap();
        fs::write(overlay.shard_dir(ShardId(3)).join("junk"), b"?").unwrap();
        // Inode 0x105 belongs in shard 05.
        fs::write(
            overlay.shard_dir(ShardId(6)).join("261"),
            FileRecord::new(b"x".to_vec()).encode(),
        )
        .unwrap();

        let (catalog, findings) = scan(&overlay);
        assert!(catalog.contains(InodeNumber(261)));
        assert_eq!(
            findings,
            vec![
                Finding::UnexpectedOverlayFile {
                    path: overlay.shard_dir(ShardId(3)).join("junk"),
                },
                Finding::UnexpectedInodeShard {
                    inode: InodeNumber(261),
                    shard: ShardId(6),
                },
                Finding::ShardDirectoryUnreadable {
                    path: overlay.shard_dir(ShardId(0x7f)),
                    missing: true,
                },
            ]
        );
    }

    #[test]
    fn later_duplicate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = Overlay::create(dir.path().join("local")).unwrap();
        overlay.save_file(InodeNumber(0x105), b"first").unwrap();
        fs::write(
            overlay.shard_dir(ShardId(0x20)).join("261"),
            FileRecord::new(b"second".to_vec()).encode(),
        )
        .unwrap();

        let (catalog, _) = scan(&overlay);
        assert_eq!(catalog.duplicates(), &[InodeNumber(261)]);
        assert_eq!(
            catalog.get(InodeNumber(261)),
            Some(&OverlayEntry::File(FileRecord::new(b"second".to_vec())))
        );
    }

    #[test]
    fn progress_reports_every_tenth() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = Overlay::create(dir.path().join("local")).unwrap();
        let mut seen = Vec::new();
        Catalog::scan(&overlay, &mut Vec::new(), &mut |p| seen.push(p)).unwrap();
        assert_eq!(seen, (0..=10).collect::<Vec<_>>());
    }
}
