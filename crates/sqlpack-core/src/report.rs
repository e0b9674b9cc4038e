//! Machine-readable status and verify reports
//!
//! `status --output` and `verify --output` write this shape as JSON. Field
//! names are part of the output contract; `format` changes only when a
//! field is removed or changes meaning.

use crate::diagnostic::{Diagnostic, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Output format revision
pub const REPORT_FORMAT: u32 = 1;

/// Command that produced a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Status,
    Verify,
}

/// Diagnostic tallies and registry counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub errors: usize,
    pub warnings: usize,
    pub info: usize,

    /// Changes in the merged plan
    pub changes_planned: usize,

    /// Planned changes with a registry entry
    pub changes_deployed: usize,
}

impl ReportSummary {
    pub fn total(&self) -> usize {
        self.errors + self.warnings + self.info
    }

    /// Planned changes still waiting for a deploy
    pub fn changes_pending(&self) -> usize {
        self.changes_planned.saturating_sub(self.changes_deployed)
    }

    fn tally(&mut self, severity: Severity) {
        match severity {
            Severity::Error => self.errors += 1,
            Severity::Warn => self.warnings += 1,
            Severity::Info => self.info += 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("invalid report JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write report {path}: {message}")]
    Write { path: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub format: u32,
    pub kind: ReportKind,

    /// `name@version` of the root module the plan was compiled for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,

    pub generated_at: DateTime<Utc>,
    pub summary: ReportSummary,
    pub diagnostics: Vec<Diagnostic>,
}

impl Report {
    pub fn new(kind: ReportKind) -> Self {
        Self {
            format: REPORT_FORMAT,
            kind,
            root: None,
            generated_at: Utc::now(),
            summary: ReportSummary::default(),
            diagnostics: Vec::new(),
        }
    }

    pub fn for_root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Record how much of the plan the registry holds
    pub fn with_counts(mut self, planned: usize, deployed: usize) -> Self {
        self.summary.changes_planned = planned;
        self.summary.changes_deployed = deployed;
        self
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.summary.tally(diagnostic.severity);
        self.diagnostics.push(diagnostic);
    }

    pub fn has_errors(&self) -> bool {
        self.summary.errors > 0
    }

    /// Everything planned is deployed and nothing is flagged as an error
    pub fn is_up_to_date(&self) -> bool {
        !self.has_errors() && self.summary.changes_pending() == 0
    }

    /// Diagnostics grouped by the module they point at; unlocated ones under `""`
    pub fn by_module(&self) -> BTreeMap<&str, Vec<&Diagnostic>> {
        let mut grouped: BTreeMap<&str, Vec<&Diagnostic>> = BTreeMap::new();
        for diagnostic in &self.diagnostics {
            let module = diagnostic.location.as_ref().map(|l| l.module.as_str()).unwrap_or("");
            grouped.entry(module).or_default().push(diagnostic);
        }
        grouped
    }

    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a report written by `write_json`; the summary is recounted from the diagnostics
    pub fn from_json(raw: &str) -> Result<Self, ReportError> {
        let mut report: Self = serde_json::from_str(raw)?;
        let mut summary = ReportSummary {
            changes_planned: report.summary.changes_planned,
            changes_deployed: report.summary.changes_deployed,
            ..ReportSummary::default()
        };
        for diagnostic in &report.diagnostics {
            summary.tally(diagnostic.severity);
        }
        report.summary = summary;
        Ok(report)
    }

    /// Write JSON next to `path` and rename it into place
    pub fn write_json(&self, path: &Path) -> Result<(), ReportError> {
        let write_err = |e: std::io::Error| ReportError::Write {
            path: path.display().to_string(),
            message: e.to_string(),
        };
        let json = self.to_json()?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let file_name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let staging = path.with_file_name(format!(".{}.partial", file_name));
        std::fs::write(&staging, json).map_err(write_err)?;
        std::fs::rename(&staging, path).map_err(|e| {
            let _ = std::fs::remove_file(&staging);
            write_err(e)
        })
    }
}
