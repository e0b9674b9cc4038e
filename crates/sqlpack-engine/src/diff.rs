//! Registry diff
//!
//! Compares a merged plan with the registry of a target database:
//! - Changes without a registry entry are pending
//! - Deployed changes whose recorded hash matches are verifiable
//! - Deployed changes whose recorded hash differs are drift
//! - Entries of planned modules that the plan no longer has are unknown

use crate::compiler::MergedPlan;
use sqlpack_core::{Diagnostic, DiagnosticCode, Location, Report, ReportKind, Severity};
use sqlpack_db::{RegistryEntry, RegistryError, TargetDatabase};
use std::collections::{HashMap, HashSet};

/// A deployed change whose deploy script changed since it was recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashMismatch {
    /// Position in the merged plan
    pub index: usize,
    pub module: String,
    pub change: String,
    pub recorded: String,
    pub current: String,
}

impl HashMismatch {
    pub fn to_error(&self) -> RegistryError {
        RegistryError::HashMismatch {
            module: self.module.clone(),
            change: self.change.clone(),
            recorded: self.recorded.clone(),
            current: self.current.clone(),
        }
    }
}

/// Registry state relative to a merged plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployState {
    /// Merged plan positions with no registry entry, in plan order
    pub to_deploy: Vec<usize>,

    /// Deployed positions whose recorded hash matches
    pub to_verify: Vec<usize>,

    pub hash_mismatches: Vec<HashMismatch>,

    /// Registry entries of planned modules that are not in the plan
    pub unknown: Vec<RegistryEntry>,

    /// Planned changes that have a registry entry
    pub deployed: usize,
}

impl DeployState {
    /// Nothing to deploy and no drift
    pub fn is_up_to_date(&self) -> bool {
        self.to_deploy.is_empty() && self.hash_mismatches.is_empty()
    }

    /// Status report with stable registry diagnostics
    pub fn to_report(&self, plan: &MergedPlan) -> Report {
        let mut report = Report::new(ReportKind::Status)
            .for_root(format!("{}@{}", plan.root(), plan.root_version()))
            .with_counts(plan.len(), self.deployed);

        for &idx in &self.to_deploy {
            let change = &plan.changes()[idx];
            report.push(
                Diagnostic::new(
                    DiagnosticCode::RegistryPendingChange,
                    Severity::Info,
                    format!("{} is not deployed", change.label()),
                )
                .with_location(Location::change(&change.module, &change.change)),
            );
        }

        for mismatch in &self.hash_mismatches {
            report.push(
                Diagnostic::new(
                    DiagnosticCode::RegistryHashMismatch,
                    Severity::Error,
                    format!(
                        "{}:{} was deployed from a different script",
                        mismatch.module, mismatch.change
                    ),
                )
                .with_location(Location::change(&mismatch.module, &mismatch.change))
                .with_comparison(&mismatch.recorded, &mismatch.current)
                .with_hint("revert then redeploy the change, or re-run with --allow-drift to accept the drift"),
            );
        }

        for entry in &self.unknown {
            report.push(
                Diagnostic::new(
                    DiagnosticCode::RegistryUnknownChange,
                    Severity::Warn,
                    format!("{}:{} is deployed but no longer planned", entry.module, entry.change),
                )
                .with_location(Location::change(&entry.module, &entry.change)),
            );
        }

        report
    }
}

/// Diff a merged plan against registry entries
pub fn diff_entries(plan: &MergedPlan, entries: &[RegistryEntry]) -> DeployState {
    let recorded: HashMap<(&str, &str), &RegistryEntry> = entries
        .iter()
        .map(|e| ((e.module.as_str(), e.change.as_str()), e))
        .collect();

    let mut state = DeployState::default();
    for (idx, change) in plan.changes().iter().enumerate() {
        match recorded.get(&change.key()) {
            None => state.to_deploy.push(idx),
            Some(entry) if entry.script_hash == change.hash() => {
                state.deployed += 1;
                state.to_verify.push(idx);
            }
            Some(entry) => {
                state.deployed += 1;
                state.hash_mismatches.push(HashMismatch {
                    index: idx,
                    module: change.module.clone(),
                    change: change.change.clone(),
                    recorded: entry.script_hash.clone(),
                    current: change.hash().to_string(),
                });
            }
        }
    }

    let modules: HashSet<&str> = plan.modules().into_iter().collect();
    let planned: HashSet<(&str, &str)> = plan.changes().iter().map(|c| c.key()).collect();
    state.unknown = entries
        .iter()
        .filter(|e| modules.contains(e.module.as_str()))
        .filter(|e| !planned.contains(&(e.module.as_str(), e.change.as_str())))
        .cloned()
        .collect();

    state
}

/// Diff a merged plan against the target's registry, creating the registry if absent
pub async fn diff(plan: &MergedPlan, db: &dyn TargetDatabase) -> Result<DeployState, RegistryError> {
    db.ensure_registry().await?;
    let entries = db.registry_entries().await?;
    let state = diff_entries(plan, &entries);

    tracing::debug!(
        pending = state.to_deploy.len(),
        deployed = state.deployed,
        drift = state.hash_mismatches.len(),
        unknown = state.unknown.len(),
        "computed registry diff"
    );
    Ok(state)
}

/// Registry status of a merged plan as a report
pub async fn status(plan: &MergedPlan, db: &dyn TargetDatabase) -> Result<Report, RegistryError> {
    Ok(diff(plan, db).await?.to_report(plan))
}
