#![forbid(unsafe_code)]
//! Overlay directory layout and record I/O.
//!
//! An overlay root holds 256 shard directories (`00`..`ff`), each containing
//! records named by decimal inode number, a `next-inode-number` file, and a
//! `tmp/` staging directory used to make every record write atomic.
//!
//! Reads never fail on malformed content: undecodable bytes come back as
//! [`OverlayEntry::Corrupt`]. Only environment failures surface as errors.

pub mod lock;

pub use lock::CheckoutLock;

use ovl_error::{FsckError, Result};
use ovl_ondisk::{
    CorruptKind, CorruptRecord, DirectoryRecord, FileRecord, InodeTimestamps, OverlayEntry,
    Timestamp, decode_next_inode_number, decode_record, encode_next_inode_number,
};
use ovl_types::{InodeNumber, NEXT_INODE_NUMBER_FILE, ROOT_INODE, ShardId, TMP_DIR};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// One directory entry found while listing a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardEntry {
    /// A file whose name parses as a decimal inode number.
    Record { inode: InodeNumber, path: PathBuf },
    /// Anything else.
    Unexpected { path: PathBuf },
}

/// State of the next-inode-number file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextInodeNumberState {
    Missing,
    /// Present but not a valid 8-byte payload.
    Corrupt { raw: Vec<u8> },
    Present(InodeNumber),
}

/// Handle on one checkout's overlay directory.
#[derive(Debug, Clone)]
pub struct Overlay {
    root: PathBuf,
}

impl Overlay {
    /// Open an existing overlay.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        match fs::metadata(&root) {
            Ok(meta) if meta.is_dir() => Ok(Self { root }),
            Ok(_) => Err(FsckError::NotADirectory(root)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(FsckError::OverlayNotFound(root))
            }
            Err(err) => Err(FsckError::Io(err)),
        }
    }

    /// Initialize a new overlay: shard tree, staging dir, an empty root
    /// directory, and a next-inode-number of `ROOT_INODE + 1`.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let overlay = Self {
            root: root.as_ref().to_path_buf(),
        };
        fs::create_dir_all(&overlay.root)?;
        for shard in ShardId::all() {
            fs::create_dir_all(overlay.shard_dir(shard))?;
        }
        fs::create_dir_all(overlay.tmp_dir())?;
        overlay.save_directory(ROOT_INODE, &DirectoryRecord::new(now_timestamps(), Vec::new()))?;
        overlay.write_next_inode_number(InodeNumber(ROOT_INODE.0 + 1))?;
        info!(target: "ovl::store", root = %overlay.root.display(), "initialized overlay");
        Ok(overlay)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The checkout state directory holding the overlay, the lock file, and
    /// `fsck/` repair directories.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root
            .parent()
            .map_or_else(|| self.root.clone(), Path::to_path_buf)
    }

    #[must_use]
    pub fn shard_dir(&self, shard: ShardId) -> PathBuf {
        self.root.join(shard.dir_name())
    }

    #[must_use]
    pub fn record_path(&self, inode: InodeNumber) -> PathBuf {
        self.shard_dir(inode.shard()).join(inode.0.to_string())
    }

    #[must_use]
    pub fn next_inode_number_path(&self) -> PathBuf {
        self.root.join(NEXT_INODE_NUMBER_FILE)
    }

    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    /// Read and decode the record for `inode`.
    ///
    /// `Ok(None)` means no record exists: the inode was never materialized or
    /// was removed. The caller decides whether that is a problem.
    pub fn read_inode(&self, inode: InodeNumber) -> Result<Option<OverlayEntry>> {
        self.read_record_at(&self.record_path(inode))
    }

    /// Read and decode the record stored at `path`.
    pub fn read_record_at(&self, path: &Path) -> Result<Option<OverlayEntry>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(decode_record(bytes))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                debug!(target: "ovl::store", path = %path.display(), error = %err, "record unreadable");
                Ok(Some(OverlayEntry::Corrupt(CorruptRecord::new(
                    CorruptKind::Unreadable {
                        detail: err.to_string(),
                    },
                    Vec::new(),
                ))))
            }
        }
    }

    #[must_use]
    pub fn has_record(&self, inode: InodeNumber) -> bool {
        self.record_path(inode).exists()
    }

    /// List one shard directory, sorted by file name.
    ///
    /// Errors are returned as raw `io::Error`s so the caller can record them
    /// as findings rather than aborting.
    pub fn list_shard(&self, shard: ShardId) -> io::Result<Vec<ShardEntry>> {
        let mut entries = Vec::new();
        for dirent in fs::read_dir(self.shard_dir(shard))? {
            let dirent = dirent?;
            let path = dirent.path();
            let inode = dirent
                .file_name()
                .to_str()
                .and_then(parse_inode_file_name);
            let is_file = dirent.file_type()?.is_file();
            entries.push(match inode {
                Some(inode) if is_file => ShardEntry::Record { inode, path },
                _ => ShardEntry::Unexpected { path },
            });
        }
        entries.sort_by(|a, b| entry_path(a).cmp(entry_path(b)));
        Ok(entries)
    }

    pub fn save_directory(&self, inode: InodeNumber, dir: &DirectoryRecord) -> Result<()> {
        let bytes = dir
            .encode()
            .map_err(|err| FsckError::Format(format!("directory inode {inode}: {err}")))?;
        self.save_raw(inode, &bytes)
    }

    pub fn save_file(&self, inode: InodeNumber, content: &[u8]) -> Result<()> {
        self.save_raw(inode, &FileRecord::new(content.to_vec()).encode())
    }

    /// Atomically replace the record for `inode` with `bytes`, unvalidated.
    pub fn save_raw(&self, inode: InodeNumber, bytes: &[u8]) -> Result<()> {
        let dest = self.record_path(inode);
        fs::create_dir_all(self.tmp_dir())?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write(&self.tmp_dir(), &dest, bytes)?;
        debug!(target: "ovl::store", inode = inode.0, len = bytes.len(), "record written");
        Ok(())
    }

    /// Remove the record for `inode`. Returns whether a record existed.
    pub fn remove_inode(&self, inode: InodeNumber) -> Result<bool> {
        match fs::remove_file(self.record_path(inode)) {
            Ok(()) => {
                debug!(target: "ovl::store", inode = inode.0, "record removed");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(FsckError::Io(err)),
        }
    }

    pub fn read_next_inode_number(&self) -> Result<NextInodeNumberState> {
        match fs::read(self.next_inode_number_path()) {
            Ok(raw) => Ok(match decode_next_inode_number(&raw) {
                Ok(next) => NextInodeNumberState::Present(next),
                Err(_) => NextInodeNumberState::Corrupt { raw },
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(NextInodeNumberState::Missing),
            Err(err) => Err(FsckError::Io(err)),
        }
    }

    pub fn write_next_inode_number(&self, next: InodeNumber) -> Result<()> {
        fs::create_dir_all(self.tmp_dir())?;
        atomic_write(
            &self.tmp_dir(),
            &self.next_inode_number_path(),
            &encode_next_inode_number(next),
        )?;
        debug!(target: "ovl::store", next = next.0, "next inode number written");
        Ok(())
    }
}

/// Timestamps for records created now.
#[must_use]
pub fn now_timestamps() -> InodeTimestamps {
    InodeTimestamps::uniform(Timestamp::from_system_time(SystemTime::now()))
}

/// Write `bytes` to a temporary file in `staging_dir`, sync it, and rename it
/// over `dest`. `staging_dir` must be on the same filesystem as `dest`.
///
/// The file is created owner-only (`0600`).
pub fn atomic_write(staging_dir: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(staging_dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|err| FsckError::Io(err.error))?;
    Ok(())
}

/// Inode named by a record file. Only the canonical decimal spelling counts:
/// `0100` names no record, since every other operation addresses inode 100
/// as `100`.
fn parse_inode_file_name(name: &str) -> Option<InodeNumber> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let inode = name.parse::<u64>().ok().map(InodeNumber)?;
    (inode.0.to_string() == name).then_some(inode)
}

fn entry_path(entry: &ShardEntry) -> &Path {
    match entry {
        ShardEntry::Record { path, .. } | ShardEntry::Unexpected { path } => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovl_ondisk::ChildEntry;
    use ovl_ondisk::mode::FILE_MODE;

    fn fresh() -> (tempfile::TempDir, Overlay) {
        let dir = tempfile::tempdir().unwrap();
        let overlay = Overlay::create(dir.path().join("local")).unwrap();
        (dir, overlay)
    }

    #[test]
    fn create_lays_out_shards_root_and_counter() {
        let (dir, overlay) = fresh();
        assert_eq!(overlay.state_dir(), dir.path());
        for shard in ShardId::all() {
            assert!(overlay.shard_dir(shard).is_dir(), "missing shard {shard}");
        }
        assert!(matches!(
            overlay.read_inode(ROOT_INODE).unwrap(),
            Some(OverlayEntry::Directory(_))
        ));
        assert_eq!(
            overlay.read_next_inode_number().unwrap(),
            NextInodeNumberState::Present(InodeNumber(2))
        );
    }

    #[test]
    fn open_distinguishes_missing_and_non_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Overlay::open(dir.path().join("nope")),
            Err(FsckError::OverlayNotFound(_))
        ));
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            Overlay::open(&file),
            Err(FsckError::NotADirectory(_))
        ));
    }

    #[test]
    fn record_path_uses_low_byte_shard() {
        let (_dir, overlay) = fresh();
        assert_eq!(
            overlay.record_path(InodeNumber(0x131)),
            overlay.root().join("31").join("305")
        );
    }

    #[test]
    fn missing_record_reads_as_none() {
        let (_dir, overlay) = fresh();
        assert_eq!(overlay.read_inode(InodeNumber(42)).unwrap(), None);
        assert!(!overlay.remove_inode(InodeNumber(42)).unwrap());
    }

    #[test]
    fn saved_records_read_back() {
        let (_dir, overlay) = fresh();
        overlay.save_file(InodeNumber(7), b"hello").unwrap();
        assert_eq!(
            overlay.read_inode(InodeNumber(7)).unwrap(),
            Some(OverlayEntry::File(FileRecord::new(b"hello".to_vec())))
        );

        let dir = DirectoryRecord::new(
            now_timestamps(),
            vec![ChildEntry::materialized(b"a", InodeNumber(7), FILE_MODE)],
        );
        overlay.save_directory(ROOT_INODE, &dir).unwrap();
        assert_eq!(
            overlay.read_inode(ROOT_INODE).unwrap(),
            Some(OverlayEntry::Directory(dir))
        );
        assert!(overlay.remove_inode(InodeNumber(7)).unwrap());
        assert!(!overlay.has_record(InodeNumber(7)));
    }

    #[test]
    fn list_shard_flags_non_numeric_names() {
        let (_dir, overlay) = fresh();
        overlay.save_file(InodeNumber(0x105), b"x").unwrap();
        let stray = overlay.shard_dir(ShardId(0x05)).join("notes.txt");
        fs::write(&stray, b"?").unwrap();

        let entries = overlay.list_shard(ShardId(0x05)).unwrap();
        assert_eq!(
            entries,
            vec![
                ShardEntry::Record {
                    inode: InodeNumber(0x105),
                    path: overlay.record_path(InodeNumber(0x105)),
                },
                ShardEntry::Unexpected { path: stray },
            ]
        );
    }

    #[test]
    fn unreadable_record_decodes_as_corrupt() {
        let (_dir, overlay) = fresh();
        fs::create_dir(overlay.record_path(InodeNumber(9))).unwrap();

        match overlay.read_inode(InodeNumber(9)).unwrap() {
            Some(OverlayEntry::Corrupt(corrupt)) => {
                assert!(matches!(corrupt.kind, CorruptKind::Unreadable { .. }));
                assert!(corrupt.raw.is_empty());
            }
            other => panic!("expected corrupt record, got {other:?}"),
        }
        assert_eq!(overlay.read_inode(InodeNumber(10)).unwrap(), None);
    }

    #[test]
    fn counter_states() {
        let (_dir, overlay) = fresh();
        overlay.write_next_inode_number(InodeNumber(65)).unwrap();
        assert_eq!(
            fs::read(overlay.next_inode_number_path()).unwrap(),
            65_u64.to_le_bytes()
        );

        fs::write(overlay.next_inode_number_path(), b"abc").unwrap();
        assert_eq!(
            overlay.read_next_inode_number().unwrap(),
            NextInodeNumberState::Corrupt {
                raw: b"abc".to_vec()
            }
        );

        fs::remove_file(overlay.next_inode_number_path()).unwrap();
        assert_eq!(
            overlay.read_next_inode_number().unwrap(),
            NextInodeNumberState::Missing
        );
    }

    #[test]
    fn parse_inode_file_name_rejects_signs_and_junk() {
        assert_eq!(parse_inode_file_name("49"), Some(InodeNumber(49)));
        assert_eq!(parse_inode_file_name("+49"), None);
        assert_eq!(parse_inode_file_name("49.tmp"), None);
        assert_eq!(parse_inode_file_name(""), None);
        assert_eq!(parse_inode_file_name("99999999999999999999999"), None);
        assert_eq!(parse_inode_file_name("0"), Some(InodeNumber(0)));
        assert_eq!(parse_inode_file_name("0100"), None);
        assert_eq!(parse_inode_file_name("00"), None);
    }
}
