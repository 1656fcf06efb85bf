//! Scan-then-repair driver.

use crate::catalog::Catalog;
use crate::finding::Finding;
use crate::next_inode;
use crate::orphan::collect_orphans;
use crate::repair::{RepairReport, RepairState};
use crate::walk::walk;
use ovl_error::{FsckError, Result};
use ovl_store::Overlay;
use tracing::{info, info_span, warn};

/// Default cap on findings written to the log by [`OverlayChecker::log_errors`].
pub const DEFAULT_MAX_LOGGED_FINDINGS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckerOptions {
    /// Report findings but never modify the overlay.
    pub check_only: bool,
    pub max_logged_findings: usize,
}

impl Default for CheckerOptions {
    fn default() -> Self {
        Self {
            check_only: false,
            max_logged_findings: DEFAULT_MAX_LOGGED_FINDINGS,
        }
    }
}

struct Scan {
    catalog: Catalog,
    findings: Vec<Finding>,
}

/// Checks one overlay. The caller must hold the checkout lock.
///
/// ```ignore
/// let overlay = Overlay::open(path)?;
/// let mut checker = OverlayChecker::new(&overlay);
/// let findings = checker.scan_for_errors()?.to_vec();
/// if let Some(report) = checker.fix_errors(&findings)? {
///     println!("fixed {} of {}", report.fixed_errors, report.total_errors);
/// }
/// ```
pub struct OverlayChecker<'a> {
    overlay: &'a Overlay,
    options: CheckerOptions,
    scan: Option<Scan>,
}

impl<'a> OverlayChecker<'a> {
    #[must_use]
    pub fn new(overlay: &'a Overlay) -> Self {
        Self::with_options(overlay, CheckerOptions::default())
    }

    #[must_use]
    pub fn with_options(overlay: &'a Overlay, options: CheckerOptions) -> Self {
        Self {
            overlay,
            options,
            scan: None,
        }
    }

    pub fn scan_for_errors(&mut self) -> Result<&[Finding]> {
        self.scan_for_errors_with_progress(&mut |_| {})
    }

    /// Scan the overlay. `progress` receives completed tenths of the shard
    /// scan (0..=10). Performs no writes.
    pub fn scan_for_errors_with_progress(
        &mut self,
        progress: &mut dyn FnMut(u32),
    ) -> Result<&[Finding]> {
        let span = info_span!(target: "ovl::fsck", "scan", root = %self.overlay.root().display());
        let _guard = span.enter();

        let mut findings = Vec::new();
        let catalog = Catalog::scan(self.overlay, &mut findings, progress)?;

        let walked = walk(&catalog);
        findings.extend(walked.findings);
        if let Some(orphans) = collect_orphans(&catalog, &walked.referenced) {
            findings.push(Finding::OrphanInodes(orphans));
        }

        let counter = self.overlay.read_next_inode_number()?;
        if let Some(finding) = next_inode::validate(&counter, catalog.max_inode())? {
            findings.push(finding);
        }

        info!(
            target: "ovl::fsck",
            records = catalog.len(),
            referenced = walked.referenced.len(),
            findings = findings.len(),
            "scan complete"
        );
        let scan = self.scan.insert(Scan { catalog, findings });
        Ok(&scan.findings)
    }

    /// Findings from the last scan.
    #[must_use]
    pub fn findings(&self) -> &[Finding] {
        self.scan
            .as_ref()
            .map(|scan| scan.findings.as_slice())
            .unwrap_or_default()
    }

    /// Catalog from the last scan.
    #[must_use]
    pub fn catalog(&self) -> Option<&Catalog> {
        self.scan.as_ref().map(|scan| &scan.catalog)
    }

    #[must_use]
    pub fn options(&self) -> &CheckerOptions {
        &self.options
    }

    /// Log up to `max_logged_findings` findings at warn level.
    pub fn log_errors(&self, findings: &[Finding]) {
        let limit = self.options.max_logged_findings;
        for finding in findings.iter().take(limit) {
            warn!(target: "ovl::fsck", finding = finding.name(), "{finding}");
        }
        if findings.len() > limit {
            warn!(target: "ovl::fsck", omitted = findings.len() - limit, "more findings not shown");
        }
    }

    /// Repair `findings` against the catalog of the last scan.
    ///
    /// Returns `None` when there is nothing to repair or the checker is in
    /// check-only mode. Per-finding failures are counted in the report;
    /// only environment failures are returned as errors.
    pub fn fix_errors(&self, findings: &[Finding]) -> Result<Option<RepairReport>> {
        let scan = self.scan.as_ref().ok_or(FsckError::NotScanned)?;
        if findings.is_empty() {
            return Ok(None);
        }
        if self.options.check_only {
            self.log_errors(findings);
            return Ok(None);
        }

        let span = info_span!(target: "ovl::fsck", "repair", findings = findings.len());
        let _guard = span.enter();
        let report = RepairState::create(self.overlay, &scan.catalog)?.repair_all(findings)?;
        info!(
            target: "ovl::fsck",
            dir = %report.repair_dir.display(),
            fixed = report.fixed_errors,
            total = report.total_errors,
            "repair complete"
        );
        Ok(Some(report))
    }
}
