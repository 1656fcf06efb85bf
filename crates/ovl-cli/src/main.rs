#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ovl_error::{EXIT_OPERATIONAL, EXIT_SKIPPED, FsckError};
use ovl_fsck::{CheckerOptions, DEFAULT_MAX_LOGGED_FINDINGS, Finding, OverlayChecker, RepairReport};
use ovl_ondisk::{ChildEntry, CorruptRecord, OverlayEntry};
use ovl_store::{CheckoutLock, Overlay};
use ovl_types::InodeNumber;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

/// Exit code when the scan reported findings, fixed or not.
const EXIT_FINDINGS: i32 = 3;

// ── Logging ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

/// Install the stderr subscriber. `RUST_LOG` filters, defaulting to `info`.
fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    let installed = match format {
        LogFormat::Human => builder.compact().try_init(),
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .try_init(),
    };
    installed.map_err(|err| anyhow::anyhow!("failed to install {format:?} log subscriber: {err}"))
}

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "ovl-fsck", about = "Check and repair a checkout overlay")]
struct Cli {
    /// Log output format on stderr.
    #[arg(
        long,
        value_enum,
        global = true,
        env = "OVL_LOG_FORMAT",
        default_value_t = LogFormat::Human
    )]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan an overlay and report findings without modifying it.
    Check {
        /// Overlay root directory.
        overlay: PathBuf,
        #[command(flatten)]
        flags: ScanFlags,
    },
    /// Scan an overlay and repair what it finds.
    Repair {
        /// Overlay root directory.
        overlay: PathBuf,
        /// Report findings but do not repair them.
        #[arg(long)]
        check_only: bool,
        #[command(flatten)]
        flags: ScanFlags,
    },
    /// Decode and print a single inode record.
    Inspect {
        /// Overlay root directory.
        overlay: PathBuf,
        inode: u64,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args, Debug, Clone, Copy)]
struct ScanFlags {
    /// Scan even if the checkout lock is held. Never repairs without the lock.
    #[arg(long)]
    force: bool,
    /// Output in JSON format.
    #[arg(long)]
    json: bool,
    /// Report scan progress.
    #[arg(long)]
    verbose: bool,
    /// Maximum number of findings written to the log.
    #[arg(long, default_value_t = DEFAULT_MAX_LOGGED_FINDINGS)]
    max_logged_findings: usize,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Check { .. } => "check",
            Self::Repair { .. } => "repair",
            Self::Inspect { .. } => "inspect",
        }
    }

    fn json(&self) -> bool {
        match self {
            Self::Check { flags, .. } | Self::Repair { flags, .. } => flags.json,
            Self::Inspect { json, .. } => *json,
        }
    }
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();
    let json = cli.command.json();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let code = err
                .downcast_ref::<FsckError>()
                .map_or(EXIT_OPERATIONAL, FsckError::exit_code);
            if json {
                let status = if code == EXIT_SKIPPED {
                    "skipped"
                } else {
                    "operational_error"
                };
                println!(
                    "{}",
                    serde_json::json!({
                        "status": status,
                        "exit_code": code,
                        "error": format!("{err:#}"),
                    })
                );
            } else {
                eprintln!("error: {err:#}");
            }
            std::process::exit(code);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let log_format = cli.log_format;
    init_tracing(log_format)?;
    let command_name = cli.command.name();
    let run_span = info_span!(target: "ovl::cli", "command", command = command_name);
    let _run_guard = run_span.enter();
    let started = Instant::now();
    info!(target: "ovl::cli", command = command_name, ?log_format, "command_start");

    let result = match cli.command {
        Command::Check { overlay, flags } => fsck_cmd(&overlay, flags, true),
        Command::Repair {
            overlay,
            check_only,
            flags,
        } => fsck_cmd(&overlay, flags, check_only),
        Command::Inspect {
            overlay,
            inode,
            json,
        } => inspect_cmd(&overlay, InodeNumber(inode), json).map(|()| 0),
    };

    let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    match &result {
        Ok(exit_code) => info!(
            target: "ovl::cli",
            command = command_name,
            duration_us,
            exit_code,
            "command_succeeded"
        ),
        Err(err) => error!(
            target: "ovl::cli",
            command = command_name,
            duration_us,
            error = %err,
            "command_failed"
        ),
    }
    result
}

// ── fsck ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum FsckStatus {
    Clean,
    Findings,
}

#[derive(Debug, Serialize)]
struct FsckOutput {
    overlay: PathBuf,
    status: FsckStatus,
    /// Whether the scan ran without the checkout lock.
    forced: bool,
    findings: Vec<Finding>,
    descriptions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repair: Option<RepairReport>,
    exit_code: i32,
}

fn fsck_cmd(path: &Path, flags: ScanFlags, check_only: bool) -> Result<i32> {
    let command_span = info_span!(
        target: "ovl::cli::fsck",
        "fsck",
        overlay = %path.display(),
        check_only,
        force = flags.force
    );
    let _command_guard = command_span.enter();

    let output = build_fsck_output(path, flags, check_only)?;
    print_fsck_output(flags.json, &output)?;
    info!(
        target: "ovl::cli::fsck",
        findings = output.findings.len(),
        exit_code = output.exit_code,
        "fsck_complete"
    );
    Ok(output.exit_code)
}

fn build_fsck_output(path: &Path, flags: ScanFlags, check_only: bool) -> Result<FsckOutput> {
    let overlay = Overlay::open(path)?;
    let state_dir = overlay.state_dir();
    let (lock, forced) = match CheckoutLock::try_acquire(&state_dir) {
        Ok(lock) => (Some(lock), false),
        Err(FsckError::Locked(lock_path)) if flags.force => {
            warn!(
                target: "ovl::cli::fsck",
                lock = %lock_path.display(),
                "checkout lock is held; scanning anyway and skipping repair"
            );
            (None, true)
        }
        Err(err) => return Err(err.into()),
    };

    let options = CheckerOptions {
        check_only: check_only || lock.is_none(),
        max_logged_findings: flags.max_logged_findings,
    };
    let mut checker = OverlayChecker::with_options(&overlay, options);
    let mut progress = |tenths: u32| {
        if flags.verbose {
            info!(target: "ovl::cli::fsck", percent = tenths * 10, "scan progress");
        }
    };
    let findings = checker
        .scan_for_errors_with_progress(&mut progress)
        .with_context(|| format!("failed to scan overlay {}", path.display()))?
        .to_vec();
    let repair = checker.fix_errors(&findings)?;
    drop(lock);

    let status = if findings.is_empty() {
        FsckStatus::Clean
    } else {
        FsckStatus::Findings
    };
    let exit_code = if findings.is_empty() { 0 } else { EXIT_FINDINGS };
    Ok(FsckOutput {
        overlay: path.to_path_buf(),
        status,
        forced,
        descriptions: findings.iter().map(ToString::to_string).collect(),
        findings,
        repair,
        exit_code,
    })
}

fn print_fsck_output(json: bool, output: &FsckOutput) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(output).context("serialize fsck output")?
        );
        return Ok(());
    }

    println!("overlay: {}", output.overlay.display());
    if output.forced {
        println!("warning: checkout lock was held; no repairs attempted");
    }
    if output.findings.is_empty() {
        println!("no problems found");
        return Ok(());
    }
    println!("found {} problem(s):", output.findings.len());
    for description in &output.descriptions {
        println!("  - {description}");
    }
    if let Some(report) = &output.repair {
        println!(
            "fixed {} of {} problem(s); repair log in {}",
            report.fixed_errors,
            report.total_errors,
            report.repair_dir.display()
        );
    }
    Ok(())
}

// ── inspect ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum InspectRecord {
    Missing,
    Directory { entries: Vec<ChildEntry> },
    File { size: usize },
    Corrupt(CorruptRecord),
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    inode: InodeNumber,
    path: PathBuf,
    #[serde(flatten)]
    record: InspectRecord,
}

fn inspect_cmd(path: &Path, inode: InodeNumber, json: bool) -> Result<()> {
    let overlay = Overlay::open(path)?;
    let record = match overlay.read_inode(inode)? {
        None => InspectRecord::Missing,
        Some(OverlayEntry::Directory(dir)) => InspectRecord::Directory {
            entries: dir.entries,
        },
        Some(OverlayEntry::File(file)) => InspectRecord::File {
            size: file.content.len(),
        },
        Some(OverlayEntry::Corrupt(corrupt)) => InspectRecord::Corrupt(corrupt),
    };
    let output = InspectOutput {
        inode,
        path: overlay.record_path(inode),
        record,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize inspect output")?
        );
        return Ok(());
    }

    println!("inode {} ({})", output.inode, output.path.display());
    match &output.record {
        InspectRecord::Missing => println!("  no record"),
        InspectRecord::File { size } => println!("  file, {size} bytes"),
        InspectRecord::Directory { entries } => {
            println!("  directory, {} entries", entries.len());
            for entry in entries {
                let state = if entry.is_materialized() {
                    "materialized"
                } else {
                    "source control"
                };
                println!(
                    "    {:<24} inode {:<8} mode {:o} {state}",
                    entry.name_str(),
                    entry.inode,
                    entry.mode
                );
            }
        }
        InspectRecord::Corrupt(corrupt) => {
            println!("  corrupt: {}", corrupt.kind);
            if !corrupt.salvaged.is_empty() {
                println!("  {} entries salvaged", corrupt.salvaged.len());
            }
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
