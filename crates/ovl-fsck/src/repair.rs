//! Repair and quarantine of scan findings.
//!
//! Every repair pass gets a fresh directory next to the overlay:
//!
//! ```text
//! <state>/fsck/YYYYMMDD_HHMMSS[.N]/
//!     fsck.log                      JSONL ledger
//!     lost+found/<inode>            orphan files and directory subtrees
//!     lost+found/<parent>/<name>    bytes of invalid records
//!     unexpected/<shard>/<name>     stray shard entries
//!     misplaced/<shard>/<inode>     records that could not be moved home
//! ```
//!
//! Extracted data is owner-only: directories `0700`, files `0600`.

use crate::catalog::Catalog;
use crate::finding::{Finding, OrphanDirectory, OrphanInodes, OrphanNode, OrphanNodeKind};
use crate::ledger::{LEDGER_FILE, RepairAction, RepairEvent, RepairLedger};
use ovl_error::{FsckError, Result};
use ovl_ondisk::{DirectoryRecord, EntryKind, OverlayEntry};
use ovl_store::{Overlay, atomic_write, now_timestamps};
use ovl_types::{InodeNumber, InodePath};
use serde::Serialize;
use std::ffi::OsStr;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

/// Directory beside the overlay that holds one subdirectory per repair run.
pub const FSCK_DIR: &str = "fsck";
pub const LOST_AND_FOUND: &str = "lost+found";
/// Content written for a symlink whose target could not be recovered.
pub const LOST_SYMLINK_TARGET: &[u8] = b"[lost]";

const MAX_DIR_ATTEMPTS: u32 = 100;
/// Orphan symlink targets at least this long are extracted as plain files.
const MAX_SYMLINK_TARGET: usize = 4096;
const PRIVATE_DIR_MODE: u32 = 0o700;
const PRIVATE_FILE_MODE: u32 = 0o600;

// ── Report ──────────────────────────────────────────────────────────────────

/// Outcome of a repair pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub repair_dir: PathBuf,
    pub total_errors: usize,
    pub fixed_errors: usize,
}

impl RepairReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.fixed_errors == self.total_errors
    }
}

// ── Repair directory ────────────────────────────────────────────────────────

/// `YYYYMMDD_HHMMSS` in UTC.
#[must_use]
pub fn utc_stamp(time: SystemTime) -> String {
    let secs = time.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    let (year, month, day) = civil_from_days(secs / 86_400);
    let rem = secs % 86_400;
    format!(
        "{year:04}{month:02}{day:02}_{:02}{:02}{:02}",
        rem / 3600,
        (rem / 60) % 60,
        rem % 60
    )
}

/// Proleptic Gregorian date for a day count since 1970-01-01.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z % 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

/// Create `base/stamp`, or `base/stamp.N` if that exists.
pub fn create_repair_dir(base: &Path, stamp: &str) -> Result<PathBuf> {
    let log_dir_error = |detail: String| FsckError::LogDirectory {
        base: base.to_path_buf(),
        detail,
    };
    DirBuilder::new()
        .recursive(true)
        .mode(PRIVATE_DIR_MODE)
        .create(base)
        .map_err(|err| log_dir_error(err.to_string()))?;

    for attempt in 0..MAX_DIR_ATTEMPTS {
        let name = if attempt == 0 {
            stamp.to_owned()
        } else {
            format!("{stamp}.{attempt}")
        };
        let path = base.join(name);
        match DirBuilder::new().mode(PRIVATE_DIR_MODE).create(&path) {
            Ok(()) => return Ok(path),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(log_dir_error(err.to_string())),
        }
    }
    Err(log_dir_error(format!(
        "{MAX_DIR_ATTEMPTS} directories named {stamp} already exist"
    )))
}

// ── Repair pass ─────────────────────────────────────────────────────────────

pub(crate) struct RepairState<'a> {
    overlay: &'a Overlay,
    catalog: &'a Catalog,
    dir: PathBuf,
    lost_and_found: PathBuf,
    ledger: RepairLedger<File>,
}

impl<'a> RepairState<'a> {
    pub(crate) fn create(overlay: &'a Overlay, catalog: &'a Catalog) -> Result<Self> {
        let base = overlay.state_dir().join(FSCK_DIR);
        let dir = create_repair_dir(&base, &utc_stamp(SystemTime::now()))?;
        let lost_and_found = dir.join(LOST_AND_FOUND);
        make_private_dir(&lost_and_found)?;
        let ledger = RepairLedger::new(File::create(dir.join(LEDGER_FILE))?);
        info!(target: "ovl::fsck", dir = %dir.display(), "created repair directory");
        Ok(Self {
            overlay,
            catalog,
            dir,
            lost_and_found,
            ledger,
        })
    }

    /// Repair every finding, structural problems before orphans and the
    /// counter last. A failed repair is logged and counted as unfixed.
    pub(crate) fn repair_all(mut self, findings: &[Finding]) -> Result<RepairReport> {
        self.ledger.append(&RepairEvent::new(
            RepairAction::Started,
            format!("{} findings in {}", findings.len(), self.overlay.root().display()),
        ))?;

        let mut ordered: Vec<&Finding> = findings.iter().collect();
        ordered.sort_by_key(|finding| phase(finding));

        let mut fixed_errors = 0;
        for finding in ordered {
            let event = |action, detail: String| {
                RepairEvent::new(action, detail)
                    .with_finding(finding.name(), finding.inode().map(|inode| inode.0))
            };
            if !finding.is_repairable() {
                warn!(target: "ovl::fsck", finding = %finding, "no automatic repair");
                self.ledger
                    .append(&event(RepairAction::Skipped, finding.to_string()))?;
                continue;
            }
            self.ledger
                .append(&event(RepairAction::Attempted, finding.to_string()))?;
            match self.repair(finding) {
                Ok(()) => {
                    fixed_errors += 1;
                    info!(target: "ovl::fsck", finding = %finding, "repaired");
                    self.ledger
                        .append(&event(RepairAction::Succeeded, finding.to_string()))?;
                }
                Err(err) => {
                    error!(target: "ovl::fsck", finding = %finding, error = %err, "repair failed");
                    self.ledger
                        .append(&event(RepairAction::Failed, err.to_string()))?;
                }
            }
        }

        let report = RepairReport {
            repair_dir: self.dir.clone(),
            total_errors: findings.len(),
            fixed_errors,
        };
        self.ledger.append(&RepairEvent::new(
            RepairAction::Finished,
            format!("fixed {fixed_errors} of {} findings", report.total_errors),
        ))?;
        Ok(report)
    }

    fn repair(&self, finding: &Finding) -> Result<()> {
        match finding {
            Finding::ShardDirectoryUnreadable { path, .. } => {
                fs::create_dir_all(path)?;
                Ok(())
            }
            Finding::UnexpectedOverlayFile { path } => {
                let shard = path.parent().and_then(Path::file_name).unwrap_or_default();
                let name = path.file_name().unwrap_or_default();
                let dest = self.dir.join("unexpected").join(shard).join(name);
                move_into(path, &dest)
            }
            Finding::UnexpectedInodeShard { inode, shard } => {
                let src = self.overlay.shard_dir(*shard).join(inode.0.to_string());
                let home = self.overlay.record_path(*inode);
                if home.exists() {
                    let dest = self
                        .dir
                        .join("misplaced")
                        .join(shard.dir_name())
                        .join(inode.0.to_string());
                    move_into(&src, &dest)
                } else {
                    fs::rename(&src, &home)?;
                    Ok(())
                }
            }
            Finding::MissingMaterializedInode { inode, mode, .. } => {
                self.write_replacement(*inode, *mode)
            }
            Finding::InvalidMaterializedInode {
                inode,
                parent,
                path,
                mode,
                bad_data,
                ..
            } => {
                self.archive_bad_data(*inode, *parent, path, bad_data)?;
                self.write_replacement(*inode, *mode)
            }
            Finding::OrphanInodes(orphans) => self.extract_orphans(orphans),
            Finding::MissingNextInodeNumber { correct_value }
            | Finding::CorruptNextInodeNumber { correct_value }
            | Finding::BadNextInodeNumber { correct_value, .. } => {
                self.overlay.write_next_inode_number(*correct_value)
            }
            Finding::HardLinkedInode { .. } => Err(FsckError::RepairFailed(
                "hard linked inodes are not repaired automatically".into(),
            )),
        }
    }

    /// Recreate `inode` as an empty record of the type `mode` names.
    fn write_replacement(&self, inode: InodeNumber, mode: u32) -> Result<()> {
        match EntryKind::from_mode(mode) {
            EntryKind::Directory => self
                .overlay
                .save_directory(inode, &DirectoryRecord::new(now_timestamps(), Vec::new())),
            EntryKind::Symlink => self.overlay.save_file(inode, LOST_SYMLINK_TARGET),
            EntryKind::Regular | EntryKind::Socket | EntryKind::Other => {
                self.overlay.save_file(inode, &[])
            }
        }
    }

    fn archive_bad_data(
        &self,
        inode: InodeNumber,
        parent: Option<InodeNumber>,
        path: &InodePath,
        bad_data: &[u8],
    ) -> Result<()> {
        let dest = match (parent, path.file_name()) {
            (Some(parent), Some(name)) => {
                let dir = self.lost_and_found.join(parent.0.to_string());
                make_private_dir(&dir)?;
                dir.join(OsStr::from_bytes(name))
            }
            _ => self.lost_and_found.join(inode.0.to_string()),
        };
        atomic_write(&self.lost_and_found, &dest, bad_data)
    }

    fn extract_orphans(&self, orphans: &OrphanInodes) -> Result<()> {
        let mut first_error = None;
        for &inode in &orphans.files {
            if let Err(err) = self.extract_orphan_file(inode) {
                error!(target: "ovl::fsck", inode = inode.0, error = %err, "failed to extract orphan file");
                first_error.get_or_insert(err);
            }
        }
        for dir in &orphans.directories {
            if let Err(err) = self.extract_orphan_dir(dir) {
                error!(target: "ovl::fsck", inode = dir.inode.0, error = %err, "failed to extract orphan directory");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn extract_orphan_file(&self, inode: InodeNumber) -> Result<()> {
        let dest = self.lost_and_found.join(inode.0.to_string());
        atomic_write(&self.lost_and_found, &dest, &self.record_bytes(inode)?)?;
        self.overlay.remove_inode(inode)?;
        Ok(())
    }

    /// Build the subtree under `<inode>.partial`, rename it into place, then
    /// drop the overlay records of what was extracted.
    ///
    /// A node that fails keeps its record, and so does the orphan directory,
    /// so the next pass can retry it. Its siblings are still extracted.
    fn extract_orphan_dir(&self, orphan: &OrphanDirectory) -> Result<()> {
        let name = orphan.inode.0.to_string();
        let partial = self.lost_and_found.join(format!("{name}.partial"));
        if partial.exists() {
            fs::remove_dir_all(&partial)?;
        }
        make_private_dir(&partial)?;

        let mut first_error = None;
        let mut extracted = Vec::with_capacity(orphan.descendants.len());
        for node in &orphan.descendants {
            match self.extract_node(&partial, node) {
                Ok(()) => extracted.push(node.inode),
                Err(err) => {
                    warn!(
                        target: "ovl::fsck",
                        inode = node.inode.0,
                        path = %node.path,
                        error = %err,
                        "failed to extract orphan node"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        fs::rename(&partial, self.lost_and_found.join(&name))?;

        for inode in extracted {
            self.overlay.remove_inode(inode)?;
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                self.overlay.remove_inode(orphan.inode)?;
                Ok(())
            }
        }
    }

    fn extract_node(&self, base: &Path, node: &OrphanNode) -> Result<()> {
        let dest = base.join(node.path.to_path_buf());
        match node.kind {
            OrphanNodeKind::Directory => make_private_dir(&dest),
            OrphanNodeKind::Corrupt => write_private_file(&dest, &self.record_bytes(node.inode)?),
            OrphanNodeKind::File => {
                let content = self.record_bytes(node.inode)?;
                if EntryKind::from_mode(node.mode) == EntryKind::Symlink
                    && is_plausible_symlink_target(&content)
                {
                    std::os::unix::fs::symlink(OsStr::from_bytes(&content), &dest)?;
                    Ok(())
                } else {
                    write_private_file(&dest, &content)
                }
            }
        }
    }

    /// File content for file records, raw bytes for anything else.
    fn record_bytes(&self, inode: InodeNumber) -> Result<Vec<u8>> {
        match self.catalog.get(inode) {
            Some(OverlayEntry::File(file)) => Ok(file.content.clone()),
            Some(OverlayEntry::Corrupt(corrupt)) => Ok(corrupt.raw.clone()),
            Some(record @ OverlayEntry::Directory(_)) => Ok(record.raw_bytes()),
            None => Err(FsckError::RepairFailed(format!(
                "inode {inode} is not in the catalog"
            ))),
        }
    }
}

fn phase(finding: &Finding) -> u8 {
    match finding {
        Finding::ShardDirectoryUnreadable { .. } => 0,
        Finding::UnexpectedOverlayFile { .. } | Finding::UnexpectedInodeShard { .. } => 1,
        Finding::MissingMaterializedInode { .. }
        | Finding::InvalidMaterializedInode { .. }
        | Finding::HardLinkedInode { .. } => 2,
        Finding::OrphanInodes(_) => 3,
        Finding::MissingNextInodeNumber { .. }
        | Finding::CorruptNextInodeNumber { .. }
        | Finding::BadNextInodeNumber { .. } => 4,
    }
}

fn is_plausible_symlink_target(content: &[u8]) -> bool {
    !content.is_empty() && content.len() < MAX_SYMLINK_TARGET && !content.contains(&0)
}

fn make_private_dir(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(PRIVATE_DIR_MODE)
        .create(path)?;
    Ok(())
}

fn write_private_file(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(PRIVATE_FILE_MODE)
        .open(path)?;
    file.write_all(content)?;
    file.sync_all()?;
    Ok(())
}

fn move_into(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        make_private_dir(parent)?;
    }
    fs::rename(src, dest)?;
    Ok(())
}
