//! Target database trait and registry types

use crate::bootstrap::{GrantSpec, ProvisionError, ProvisionOptions, RoleSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One deployed change as recorded in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub module: String,
    pub change: String,

    /// Deploy script hash at deployment time
    pub script_hash: String,

    pub deployed_at: DateTime<Utc>,
    pub deployed_by: String,
}

/// Registry mutation applied together with a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryOp {
    /// Record a deployed change
    Insert {
        module: String,
        change: String,
        script_hash: String,
    },

    /// Forget a reverted change
    Delete { module: String, change: String },
}

impl RegistryOp {
    pub fn insert(module: impl Into<String>, change: impl Into<String>, script_hash: impl Into<String>) -> Self {
        Self::Insert {
            module: module.into(),
            change: change.into(),
            script_hash: script_hash.into(),
        }
    }

    pub fn delete(module: impl Into<String>, change: impl Into<String>) -> Self {
        Self::Delete {
            module: module.into(),
            change: change.into(),
        }
    }

    pub fn key(&self) -> (&str, &str) {
        match self {
            Self::Insert { module, change, .. } | Self::Delete { module, change } => (module, change),
        }
    }

    pub fn event(&self) -> EventKind {
        match self {
            Self::Insert { .. } => EventKind::Deploy,
            Self::Delete { .. } => EventKind::Revert,
        }
    }
}

/// Audit event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Deploy,
    Revert,
    Fail,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Revert => "revert",
            Self::Fail => "fail",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "deploy" => Some(Self::Deploy),
            "revert" => Some(Self::Revert),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub id: i64,
    pub event: EventKind,
    pub module: String,
    pub change: String,
    pub script_hash: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub occurred_by: String,
}

/// Output of an external SQL session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutput {
    pub stdout: String,

    /// Notices and warnings; never a failure signal on its own
    pub stderr: String,
}

/// Registry access errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Registry query failed: {0}")]
    Query(String),

    #[error(
        "change {module}:{change} was deployed with hash {recorded} but its deploy script now hashes to {current}; \
         revert it and redeploy, or re-run with --allow-drift to accept the drift"
    )]
    HashMismatch {
        module: String,
        change: String,
        recorded: String,
        current: String,
    },
}

/// Script execution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    /// The database rejected a statement
    #[error("{message}{}", .code.as_ref().map(|c| format!(" (SQLSTATE {})", c)).unwrap_or_default())]
    Sql { code: Option<String>, message: String },

    /// The external session exited unsuccessfully
    #[error("{program} exited with {status}: {stderr}")]
    Process {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("failed to run {program}: {message}")]
    Spawn { program: String, message: String },

    /// The script opens or closes a transaction of its own
    #[error("script issues a top-level {statement}, which would end the deploy transaction early; deploy it with the stream strategy")]
    TransactionControl { statement: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A database changes are deployed to
///
/// Implementations keep the registry of deployed changes inside the target
/// itself. `apply` must be atomic: the script and its registry operations
/// commit together or not at all.
#[async_trait::async_trait]
pub trait TargetDatabase: Send + Sync {
    /// Target kind (e.g., "PostgreSQL", "Memory")
    fn name(&self) -> &'static str;

    /// Check connectivity before doing any work
    async fn test_connection(&self) -> Result<(), RegistryError>;

    /// Create the registry schema if it is absent
    async fn ensure_registry(&self) -> Result<(), RegistryError>;

    /// All registry entries in deployment order
    async fn registry_entries(&self) -> Result<Vec<RegistryEntry>, RegistryError>;

    /// Audit events in the order they occurred
    async fn events(&self) -> Result<Vec<RegistryEvent>, RegistryError>;

    /// Run a script and its registry operations in one transaction
    ///
    /// Scripts with top-level transaction control are refused with
    /// [`ExecError::TransactionControl`] before anything runs.
    async fn apply(&self, script: &str, ops: &[RegistryOp]) -> Result<(), ExecError>;

    /// Run a script in an external session (one transaction, stops on first error)
    async fn run_streamed(&self, script: &str) -> Result<SessionOutput, ExecError>;

    /// Apply registry operations on their own
    async fn record(&self, ops: &[RegistryOp]) -> Result<(), RegistryError>;

    /// Append a failure event for a change
    async fn record_failure(&self, module: &str, change: &str, script_hash: Option<&str>) -> Result<(), RegistryError>;

    /// Run a verify script without keeping its effects
    async fn verify(&self, script: &str) -> Result<(), ExecError>;

    /// Create a role unless it exists
    async fn ensure_role(&self, role: &RoleSpec, options: &ProvisionOptions) -> Result<(), ProvisionError>;

    /// Grant role membership unless already granted
    async fn ensure_grant(&self, grant: &GrantSpec, options: &ProvisionOptions) -> Result<(), ProvisionError>;
}
