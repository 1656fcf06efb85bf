#![forbid(unsafe_code)]
//! Offline consistency checker for an overlay.
//!
//! A run has two strictly sequential phases. The scan reads every shard into
//! a [`Catalog`], walks the tree from the root, groups unreferenced records
//! into orphans, and validates the next-inode-number counter. It performs no
//! writes. The repair phase consumes the resulting [`Finding`]s, archives
//! anything it removes into a timestamped repair directory, and leaves the
//! overlay in a state that rescans clean.
//!
//! The checkout must be quiesced: hold [`ovl_store::CheckoutLock`] across
//! both phases.

pub mod catalog;
pub mod checker;
pub mod finding;
pub mod ledger;
pub mod next_inode;
pub mod orphan;
pub mod repair;
pub mod walk;

pub use catalog::Catalog;
pub use checker::{CheckerOptions, DEFAULT_MAX_LOGGED_FINDINGS, OverlayChecker};
pub use finding::{Finding, OrphanDirectory, OrphanInodes, OrphanNode, OrphanNodeKind};
pub use ledger::{RepairAction, RepairEvent, parse_repair_ledger};
pub use orphan::collect_orphans;
pub use repair::{FSCK_DIR, LOST_AND_FOUND, RepairReport};
pub use walk::{WalkResult, walk};
