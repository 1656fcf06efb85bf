#![allow(dead_code)]

use ovl_fsck::{Finding, OverlayChecker, RepairReport};
use ovl_ondisk::mode::{DIR_MODE, FILE_MODE, SYMLINK_MODE};
use ovl_ondisk::{ChildEntry, DirectoryRecord, InodeTimestamps, Timestamp};
use ovl_store::Overlay;
use ovl_types::InodeNumber;
use std::path::PathBuf;
use tempfile::TempDir;

pub const D: u32 = DIR_MODE;
pub const F: u32 = FILE_MODE;
pub const L: u32 = SYMLINK_MODE;

/// Largest inode number in [`sample`]: the source-control entry `scm`.
pub const SAMPLE_MAX: u64 = 64;

pub struct TestOverlay {
    pub tmp: TempDir,
    pub overlay: Overlay,
}

impl TestOverlay {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let overlay = Overlay::create(tmp.path().join("local")).expect("create overlay");
        Self { tmp, overlay }
    }

    pub fn dir(&self, inode: u64, children: &[(&str, u64, u32)]) {
        let entries = children
            .iter()
            .map(|(name, child, mode)| {
                ChildEntry::materialized(name.as_bytes(), InodeNumber(*child), *mode)
            })
            .collect();
        self.save_dir(inode, entries);
    }

    pub fn save_dir(&self, inode: u64, entries: Vec<ChildEntry>) {
        let timestamps = InodeTimestamps::uniform(Timestamp {
            secs: 1_700_000_000,
            nanos: 0,
        });
        self.overlay
            .save_directory(InodeNumber(inode), &DirectoryRecord::new(timestamps, entries))
            .expect("save directory");
    }

    pub fn file(&self, inode: u64, content: &[u8]) {
        self.overlay
            .save_file(InodeNumber(inode), content)
            .expect("save file");
    }

    pub fn counter(&self, next: u64) {
        self.overlay
            .write_next_inode_number(InodeNumber(next))
            .expect("write counter");
    }

    pub fn record_path(&self, inode: u64) -> PathBuf {
        self.overlay.record_path(InodeNumber(inode))
    }

    pub fn scan(&self) -> Vec<Finding> {
        OverlayChecker::new(&self.overlay)
            .scan_for_errors()
            .expect("scan")
            .to_vec()
    }

    /// Scan and repair; returns the findings and the report.
    pub fn scan_and_fix(&self) -> (Vec<Finding>, Option<RepairReport>) {
        let mut checker = OverlayChecker::new(&self.overlay);
        let findings = checker.scan_for_errors().expect("scan").to_vec();
        let report = checker.fix_errors(&findings).expect("fix");
        (findings, report)
    }
}

/// ```text
/// 1  /
/// 2  ├── README
/// 3  ├── src/
/// 4  │   ├── main.rs
/// 5  │   └── link -> ../README
/// 64 ├── scm             (source control, no record)
/// 49 └── untracked/
/// 50     ├── new/
/// 51     │   ├── a
/// 52     │   ├── b
/// 58     │   └── sub/
/// 53     │       ├── c
/// 54     │       ├── d
/// 55     │       └── e
/// 57     └── notes.txt
/// ```
pub fn sample() -> TestOverlay {
    let t = TestOverlay::new();
    let mut root = vec![
        ChildEntry::materialized(b"README", InodeNumber(2), F),
        ChildEntry::materialized(b"src", InodeNumber(3), D),
        ChildEntry::materialized(b"untracked", InodeNumber(49), D),
    ];
    root.push(ChildEntry::from_source_control(
        b"scm",
        InodeNumber(SAMPLE_MAX),
        F,
        &[0x5a; 20],
    ));
    t.save_dir(1, root);
    t.file(2, b"readme\n");
    t.dir(3, &[("main.rs", 4, F), ("link", 5, L)]);
    t.file(4, b"fn main() {}\n");
    t.file(5, b"../README");
    t.dir(49, &[("new", 50, D), ("notes.txt", 57, F)]);
    t.dir(50, &[("a", 51, F), ("b", 52, F), ("sub", 58, D)]);
    t.file(51, b"contents of a");
    t.file(52, b"contents of b");
    t.dir(58, &[("c", 53, F), ("d", 54, F), ("e", 55, F)]);
    t.file(53, b"contents of c");
    t.file(54, b"contents of d");
    t.file(55, b"contents of e");
    t.file(57, b"notes");
    t.counter(SAMPLE_MAX + 1);
    t
}
