//! Append-only JSONL ledger of repair actions (`fsck.log`).
//!
//! Each line is one self-contained [`RepairEvent`]. The writer flushes after
//! every event so an interrupted repair still leaves a readable trail.

use serde::{Deserialize, Serialize};
use std::io::{self, Write};

/// File name of the ledger inside the repair directory.
pub const LEDGER_FILE: &str = "fsck.log";

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    /// Repair pass began.
    Started,
    /// A finding was about to be repaired.
    Attempted,
    Succeeded,
    Failed,
    /// The finding has no automatic repair.
    Skipped,
    /// Repair pass ended.
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairEvent {
    /// Nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    pub action: RepairAction,
    /// Finding name, e.g. `orphan_inodes`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inode: Option<u64>,
    /// Human-readable description or error text.
    pub detail: String,
}

impl RepairEvent {
    #[must_use]
    pub fn new(action: RepairAction, detail: impl Into<String>) -> Self {
        Self {
            timestamp_ns: now_ns(),
            action,
            finding: None,
            inode: None,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn with_finding(mut self, name: &str, inode: Option<u64>) -> Self {
        self.finding = Some(name.to_owned());
        self.inode = inode;
        self
    }
}

pub struct RepairLedger<W: Write> {
    writer: W,
}

impl<W: Write> RepairLedger<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Append one event as a JSON line and flush.
    pub fn append(&mut self, event: &RepairEvent) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, event)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    #[must_use]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Parse a ledger, skipping blank and torn lines.
#[must_use]
pub fn parse_repair_ledger(data: &[u8]) -> Vec<RepairEvent> {
    let text = String::from_utf8_lossy(data);
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}
