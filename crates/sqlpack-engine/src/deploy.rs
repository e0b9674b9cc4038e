//! Deployment engine
//!
//! Applies pending changes of a merged plan in plan order, reverts deployed
//! changes in reverse order, and runs verify scripts.
//!
//! Per change: `Pending -> Deploying -> Deployed`, or `-> Failed`, which
//! stops the run. Changes recorded before a failure stay recorded, so the
//! next run resumes from the first pending change. Nothing is retried.
//!
//! ## Strategies
//!
//! - `Fast`: consecutive pending changes of one module run as one script in
//!   one transaction together with their registry rows. A change whose
//!   deploy script issues top-level `BEGIN`/`COMMIT` is refused before
//!   anything runs
//! - `Stream`: each change runs in its own external session; its registry
//!   row is written right after the session exits successfully

use crate::compiler::{MergedPlan, PlannedChange};
use crate::diff::{diff, HashMismatch};
use sqlpack_core::{DeployConfig, Diagnostic, DiagnosticCode, DeployStrategy, Location, Report, ReportKind, Severity};
use sqlpack_db::{transaction_control, ExecError, RegistryError, RegistryOp, TargetDatabase};
use std::collections::HashSet;

/// Deployment options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOptions {
    pub strategy: DeployStrategy,

    /// Treat drifted changes as deployed instead of refusing to run
    pub allow_drift: bool,
}

impl From<&DeployConfig> for DeployOptions {
    fn from(config: &DeployConfig) -> Self {
        Self {
            strategy: config.strategy,
            allow_drift: config.allow_drift,
        }
    }
}

/// `(module, change)` of a change the engine touched
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeRef {
    pub module: String,
    pub change: String,
}

impl ChangeRef {
    fn of(change: &PlannedChange) -> Self {
        Self {
            module: change.module.clone(),
            change: change.change.clone(),
        }
    }
}

impl std::fmt::Display for ChangeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.module, self.change)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployResult {
    /// Changes deployed by this run, in order
    pub deployed: Vec<ChangeRef>,

    /// Changes that were already deployed
    pub already_deployed: usize,

    /// Drift accepted under `allow_drift`
    pub drifted: Vec<HashMismatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevertResult {
    /// Changes reverted by this run, in order
    pub reverted: Vec<ChangeRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyFailure {
    pub change: ChangeRef,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyResult {
    pub verified: Vec<ChangeRef>,

    /// Deployed changes without a verify script
    pub skipped: usize,

    /// Deployed changes not yet verifiable (pending or drifted)
    pub not_deployed: usize,

    pub failures: Vec<VerifyFailure>,
}

impl VerifyResult {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn to_report(&self, plan: &MergedPlan) -> Report {
        let checked = self.verified.len() + self.skipped + self.failures.len();
        let mut report = Report::new(ReportKind::Verify)
            .for_root(format!("{}@{}", plan.root(), plan.root_version()))
            .with_counts(plan.len(), checked);
        for failure in &self.failures {
            report.push(
                Diagnostic::new(
                    DiagnosticCode::VerifyFailed,
                    Severity::Error,
                    format!("verify of {} failed: {}", failure.change, failure.message),
                )
                .with_location(Location::change(&failure.change.module, &failure.change.change)),
            );
        }
        report
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The deploy script failed; nothing of `changes` was recorded
    #[error("deploy of {module}:{} failed: {source}", .changes.join(", "))]
    Script {
        module: String,
        changes: Vec<String>,
        source: ExecError,
    },

    /// A deploy script manages its own transaction and cannot run batched
    #[error(
        "{module}:{change} issues a top-level {statement}, which would commit part of its batch; \
         deploy it with --strategy stream"
    )]
    TransactionControl {
        module: String,
        change: String,
        statement: String,
    },

    /// The script ran but its registry row could not be written
    #[error("{module}:{change} was deployed but could not be recorded: {source}")]
    Record {
        module: String,
        change: String,
        source: RegistryError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RevertError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("revert target '{0}' is not a unique change of the plan")]
    UnknownTarget(String),

    #[error("revert of {module}:{change} failed: {source}")]
    Script {
        module: String,
        change: String,
        source: ExecError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Deploy every pending change of a merged plan
pub async fn deploy(
    plan: &MergedPlan,
    db: &dyn TargetDatabase,
    options: &DeployOptions,
) -> Result<DeployResult, DeployError> {
    let state = diff(plan, db).await?;

    for mismatch in &state.hash_mismatches {
        tracing::warn!(
            module = %mismatch.module,
            change = %mismatch.change,
            recorded = %mismatch.recorded,
            current = %mismatch.current,
            "deployed change has drifted"
        );
    }
    if !options.allow_drift {
        if let Some(first) = state.hash_mismatches.first() {
            return Err(DeployError::Registry(first.to_error()));
        }
    }

    let mut result = DeployResult {
        deployed: Vec::new(),
        already_deployed: state.deployed,
        drifted: state.hash_mismatches.clone(),
    };

    let pending: Vec<&PlannedChange> = state.to_deploy.iter().map(|&idx| &plan.changes()[idx]).collect();
    tracing::info!(
        root = %plan.root(),
        target = db.name(),
        strategy = %options.strategy,
        pending = pending.len(),
        "deploying"
    );

    match options.strategy {
        DeployStrategy::Fast => {
            check_batchable(&pending)?;
            for batch in module_batches(&pending) {
                deploy_batch(db, batch).await?;
                result.deployed.extend(batch.iter().map(|c| ChangeRef::of(c)));
            }
        }
        DeployStrategy::Stream => {
            for change in &pending {
                deploy_streamed(db, change).await?;
                result.deployed.push(ChangeRef::of(change));
            }
        }
    }

    tracing::info!(deployed = result.deployed.len(), "deploy complete");
    Ok(result)
}

/// Refuse the run when any pending deploy script controls its own transaction
fn check_batchable(pending: &[&PlannedChange]) -> Result<(), DeployError> {
    for change in pending {
        if let Some(statement) = transaction_control(&change.scripts.deploy) {
            return Err(DeployError::TransactionControl {
                module: change.module.clone(),
                change: change.change.clone(),
                statement,
            });
        }
    }
    Ok(())
}

/// Split pending changes into runs of consecutive changes of one module
fn module_batches<'a, 'b>(pending: &'b [&'a PlannedChange]) -> Vec<&'b [&'a PlannedChange]> {
    let mut batches = Vec::new();
    let mut start = 0;
    for idx in 1..=pending.len() {
        if idx == pending.len() || pending[idx].module != pending[start].module {
            if start < idx {
                batches.push(&pending[start..idx]);
            }
            start = idx;
        }
    }
    batches
}

async fn deploy_batch(db: &dyn TargetDatabase, batch: &[&PlannedChange]) -> Result<(), DeployError> {
    let Some(first) = batch.first() else {
        return Ok(());
    };

    let mut script = String::new();
    let mut ops = Vec::with_capacity(batch.len());
    for change in batch {
        tracing::debug!(module = %change.module, change = %change.change, "deploying change");
        script.push_str(&format!("-- sqlpack deploy {}\n", change.label()));
        script.push_str(&change.scripts.deploy);
        if !change.scripts.deploy.ends_with('\n') {
            script.push('\n');
        }
        ops.push(RegistryOp::insert(&change.module, &change.change, change.hash()));
    }

    if let Err(source) = db.apply(&script, &ops).await {
        // The whole batch rolled back
        for change in batch {
            note_failure(db, change).await;
        }
        return Err(DeployError::Script {
            module: first.module.clone(),
            changes: batch.iter().map(|c| c.change.clone()).collect(),
            source,
        });
    }
    Ok(())
}

async fn deploy_streamed(db: &dyn TargetDatabase, change: &PlannedChange) -> Result<(), DeployError> {
    tracing::debug!(module = %change.module, change = %change.change, "deploying change");

    if let Err(source) = db.run_streamed(&change.scripts.deploy).await {
        note_failure(db, change).await;
        return Err(DeployError::Script {
            module: change.module.clone(),
            changes: vec![change.change.clone()],
            source,
        });
    }

    db.record(&[RegistryOp::insert(&change.module, &change.change, change.hash())])
        .await
        .map_err(|source| DeployError::Record {
            module: change.module.clone(),
            change: change.change.clone(),
            source,
        })
}

/// Append a failure event; the original error is what the caller reports
async fn note_failure(db: &dyn TargetDatabase, change: &PlannedChange) {
    if let Err(e) = db.record_failure(&change.module, &change.change, Some(change.hash())).await {
        tracing::warn!(change = %change.label(), error = %e, "could not record deploy failure");
    }
}

/// Revert deployed changes after `through` (every deployed change when `None`), newest first
///
/// `through` is `module:change` or a change name unique within the plan.
pub async fn revert(
    plan: &MergedPlan,
    db: &dyn TargetDatabase,
    through: Option<&str>,
) -> Result<RevertResult, RevertError> {
    let start = match through {
        Some(target) => plan
            .find(target)
            .map(|idx| idx + 1)
            .ok_or_else(|| RevertError::UnknownTarget(target.to_string()))?,
        None => 0,
    };

    db.ensure_registry().await?;
    let entries = db.registry_entries().await?;
    let deployed: HashSet<(&str, &str)> = entries
        .iter()
        .map(|e| (e.module.as_str(), e.change.as_str()))
        .collect();

    let targets: Vec<&PlannedChange> = plan.changes()[start.min(plan.len())..]
        .iter()
        .filter(|c| deployed.contains(&c.key()))
        .rev()
        .collect();

    tracing::info!(root = %plan.root(), target = db.name(), changes = targets.len(), "reverting");

    let mut result = RevertResult::default();
    for change in targets {
        tracing::debug!(module = %change.module, change = %change.change, "reverting change");
        let script = format!("-- sqlpack revert {}\n{}", change.label(), change.scripts.revert);

        if let Err(source) = db
            .apply(&script, &[RegistryOp::delete(&change.module, &change.change)])
            .await
        {
            note_failure(db, change).await;
            return Err(RevertError::Script {
                module: change.module.clone(),
                change: change.change.clone(),
                source,
            });
        }
        result.reverted.push(ChangeRef::of(change));
    }

    tracing::info!(reverted = result.reverted.len(), "revert complete");
    Ok(result)
}

/// Run verify scripts of every deployed change whose hash matches
pub async fn verify(plan: &MergedPlan, db: &dyn TargetDatabase) -> Result<VerifyResult, VerifyError> {
    let state = diff(plan, db).await?;

    let mut result = VerifyResult {
        not_deployed: state.to_deploy.len() + state.hash_mismatches.len(),
        ..VerifyResult::default()
    };

    for &idx in &state.to_verify {
        let change = &plan.changes()[idx];
        let Some(script) = &change.scripts.verify else {
            result.skipped += 1;
            continue;
        };

        match db.verify(script).await {
            Ok(()) => result.verified.push(ChangeRef::of(change)),
            Err(e) => {
                tracing::warn!(change = %change.label(), error = %e, "verify failed");
                result.failures.push(VerifyFailure {
                    change: ChangeRef::of(change),
                    message: e.to_string(),
                });
            }
        }
    }

    tracing::info!(
        verified = result.verified.len(),
        failed = result.failures.len(),
        "verify complete"
    );
    Ok(result)
}
