//! In-memory target database for testing
//!
//! This target keeps the registry, audit events, executed scripts, roles and
//! role memberships in memory. It does not interpret SQL: a script "runs"
//! by being appended to the execution log, and fails when it contains one
//! of the configured failure patterns.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sqlpack_db::{MemoryDatabase, TargetDatabase};
//!
//! let db = MemoryDatabase::new();
//! db.ensure_registry().await?;
//!
//! // Any script containing "boom" fails with the given message
//! let db = MemoryDatabase::builder()
//!     .with_script_failure("boom", "syntax error at or near \"boom\"")
//!     .build();
//! ```

use crate::bootstrap::{grant_sql, role_sql, GrantSpec, MissingRolePolicy, ProvisionError, ProvisionOptions, RoleSpec};
use crate::script::transaction_control;
use crate::target::{
    EventKind, ExecError, RegistryEntry, RegistryError, RegistryEvent, RegistryOp, SessionOutput, TargetDatabase,
};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct State {
    registry_ready: bool,
    entries: Vec<RegistryEntry>,
    events: Vec<RegistryEvent>,
    executed: Vec<String>,
    roles: BTreeSet<String>,
    memberships: BTreeSet<(String, String)>,
}

impl State {
    fn require_registry(&self) -> Result<(), RegistryError> {
        if self.registry_ready {
            Ok(())
        } else {
            Err(RegistryError::Query("registry schema does not exist".to_string()))
        }
    }

    /// Reject operations that would violate the registry primary key
    fn check_ops(&self, ops: &[RegistryOp]) -> Result<(), RegistryError> {
        let mut present: BTreeSet<(&str, &str)> = self
            .entries
            .iter()
            .map(|e| (e.module.as_str(), e.change.as_str()))
            .collect();
        for op in ops {
            match op {
                RegistryOp::Insert { module, change, .. } => {
                    if !present.insert((module.as_str(), change.as_str())) {
                        return Err(RegistryError::Query(format!(
                            "duplicate key value violates unique constraint: ({}, {})",
                            module, change
                        )));
                    }
                }
                RegistryOp::Delete { module, change } => {
                    present.remove(&(module.as_str(), change.as_str()));
                }
            }
        }
        Ok(())
    }

    fn push_event(&mut self, event: EventKind, module: &str, change: &str, script_hash: Option<&str>, identity: &str) {
        let id = self.events.len() as i64 + 1;
        self.events.push(RegistryEvent {
            id,
            event,
            module: module.to_string(),
            change: change.to_string(),
            script_hash: script_hash.map(str::to_string),
            occurred_at: Utc::now(),
            occurred_by: identity.to_string(),
        });
    }

    fn apply_ops(&mut self, ops: &[RegistryOp], identity: &str) {
        for op in ops {
            match op {
                RegistryOp::Insert { module, change, script_hash } => {
                    self.entries.push(RegistryEntry {
                        module: module.clone(),
                        change: change.clone(),
                        script_hash: script_hash.clone(),
                        deployed_at: Utc::now(),
                        deployed_by: identity.to_string(),
                    });
                    self.push_event(EventKind::Deploy, module, change, Some(script_hash.as_str()), identity);
                }
                RegistryOp::Delete { module, change } => {
                    let removed = self
                        .entries
                        .iter()
                        .position(|e| &e.module == module && &e.change == change)
                        .map(|idx| self.entries.remove(idx));
                    let hash = removed.map(|e| e.script_hash);
                    self.push_event(EventKind::Revert, module, change, hash.as_deref(), identity);
                }
            }
        }
    }
}

/// In-memory target database
///
/// Clones share state, so a test can keep a handle while the engine owns another.
pub struct MemoryDatabase {
    state: Arc<RwLock<State>>,

    /// (pattern, message): scripts containing the pattern fail
    failures: Arc<RwLock<Vec<(String, String)>>>,

    fail_connection: bool,
    identity: String,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            failures: Arc::new(RwLock::new(Vec::new())),
            fail_connection: false,
            identity: "sqlpack".to_string(),
        }
    }

    pub fn builder() -> MemoryDatabaseBuilder {
        MemoryDatabaseBuilder::new()
    }

    /// Make every script containing `pattern` fail with `message`
    pub async fn fail_scripts_containing(&self, pattern: impl Into<String>, message: impl Into<String>) {
        self.failures.write().await.push((pattern.into(), message.into()));
    }

    pub async fn clear_failures(&self) {
        self.failures.write().await.clear();
    }

    /// Scripts executed so far, in order
    pub async fn executed_scripts(&self) -> Vec<String> {
        self.state.read().await.executed.clone()
    }

    pub async fn roles(&self) -> Vec<String> {
        self.state.read().await.roles.iter().cloned().collect()
    }

    pub async fn has_membership(&self, role: &str, member: &str) -> bool {
        self.state
            .read()
            .await
            .memberships
            .contains(&(role.to_string(), member.to_string()))
    }

    /// Add a role directly, bypassing provisioning
    pub async fn add_role(&self, name: impl Into<String>) {
        self.state.write().await.roles.insert(name.into());
    }

    /// Overwrite the recorded hash of a deployed change
    pub async fn tamper_hash(&self, module: &str, change: &str, hash: impl Into<String>) -> bool {
        let mut state = self.state.write().await;
        match state.entries.iter_mut().find(|e| e.module == module && e.change == change) {
            Some(entry) => {
                entry.script_hash = hash.into();
                true
            }
            None => false,
        }
    }

    fn check_connection(&self) -> Result<(), RegistryError> {
        if self.fail_connection {
            Err(RegistryError::Connection("Simulated connection failure".to_string()))
        } else {
            Ok(())
        }
    }

    async fn check_script(&self, script: &str) -> Result<(), ExecError> {
        self.check_connection()?;
        let failures = self.failures.read().await;
        if let Some((_, message)) = failures.iter().find(|(pattern, _)| script.contains(pattern.as_str())) {
            return Err(ExecError::Sql {
                code: Some("P0001".to_string()),
                message: message.clone(),
            });
        }
        Ok(())
    }

    /// Apply the missing-role policy; `Ok(false)` means skip the step
    fn missing_role(policy: MissingRolePolicy, role: &str) -> Result<bool, ProvisionError> {
        match policy {
            MissingRolePolicy::Error => Err(ProvisionError::MissingRole(format!("role \"{}\" does not exist", role))),
            MissingRolePolicy::Notice => {
                tracing::warn!(role, "role does not exist, skipping");
                Ok(false)
            }
            MissingRolePolicy::Ignore => Ok(false),
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryDatabase {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            failures: Arc::clone(&self.failures),
            fail_connection: self.fail_connection,
            identity: self.identity.clone(),
        }
    }
}

#[async_trait::async_trait]
impl TargetDatabase for MemoryDatabase {
    fn name(&self) -> &'static str {
        "Memory"
    }

    async fn test_connection(&self) -> Result<(), RegistryError> {
        self.check_connection()
    }

    async fn ensure_registry(&self) -> Result<(), RegistryError> {
        self.check_connection()?;
        self.state.write().await.registry_ready = true;
        Ok(())
    }

    async fn registry_entries(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        self.check_connection()?;
        let state = self.state.read().await;
        state.require_registry()?;
        Ok(state.entries.clone())
    }

    async fn events(&self) -> Result<Vec<RegistryEvent>, RegistryError> {
        self.check_connection()?;
        let state = self.state.read().await;
        state.require_registry()?;
        Ok(state.events.clone())
    }

    async fn apply(&self, script: &str, ops: &[RegistryOp]) -> Result<(), ExecError> {
        if let Some(statement) = transaction_control(script) {
            return Err(ExecError::TransactionControl { statement });
        }
        self.check_script(script).await?;

        let mut state = self.state.write().await;
        state.require_registry()?;
        state.check_ops(ops)?;

        state.executed.push(script.to_string());
        state.apply_ops(ops, &self.identity);
        Ok(())
    }

    async fn run_streamed(&self, script: &str) -> Result<SessionOutput, ExecError> {
        self.check_script(script).await?;
        self.state.write().await.executed.push(script.to_string());
        Ok(SessionOutput::default())
    }

    async fn record(&self, ops: &[RegistryOp]) -> Result<(), RegistryError> {
        self.check_connection()?;
        let mut state = self.state.write().await;
        state.require_registry()?;
        state.check_ops(ops)?;
        state.apply_ops(ops, &self.identity);
        Ok(())
    }

    async fn record_failure(&self, module: &str, change: &str, script_hash: Option<&str>) -> Result<(), RegistryError> {
        self.check_connection()?;
        let mut state = self.state.write().await;
        state.require_registry()?;
        state.push_event(EventKind::Fail, module, change, script_hash, &self.identity);
        Ok(())
    }

    async fn verify(&self, script: &str) -> Result<(), ExecError> {
        self.check_script(script).await
    }

    async fn ensure_role(&self, role: &RoleSpec, options: &ProvisionOptions) -> Result<(), ProvisionError> {
        // Same input validation as the PostgreSQL block
        role_sql(role, options)?;
        self.check_connection()
            .map_err(|e| ProvisionError::Connection(e.to_string()))?;

        let mut state = self.state.write().await;
        let mut grants = Vec::new();
        for parent in &role.in_roles {
            if state.roles.contains(parent) || Self::missing_role(options.on_missing_role, parent)? {
                grants.push(parent.clone());
            }
        }
        // Memberships are reconciled even when the role already exists
        state.roles.insert(role.name.clone());
        for parent in grants {
            state.memberships.insert((parent, role.name.clone()));
        }
        Ok(())
    }

    async fn ensure_grant(&self, grant: &GrantSpec, options: &ProvisionOptions) -> Result<(), ProvisionError> {
        grant_sql(grant, options)?;
        self.check_connection()
            .map_err(|e| ProvisionError::Connection(e.to_string()))?;

        let mut state = self.state.write().await;
        for name in [&grant.role, &grant.member] {
            if !state.roles.contains(name) && !Self::missing_role(options.on_missing_role, name)? {
                return Ok(());
            }
        }
        state.memberships.insert((grant.role.clone(), grant.member.clone()));
        Ok(())
    }
}

/// Builder for creating a MemoryDatabase with preset state
pub struct MemoryDatabaseBuilder {
    failures: Vec<(String, String)>,
    roles: BTreeSet<String>,
    fail_connection: bool,
    identity: String,
    registry_ready: bool,
}

impl MemoryDatabaseBuilder {
    pub fn new() -> Self {
        Self {
            failures: Vec::new(),
            roles: BTreeSet::new(),
            fail_connection: false,
            identity: "sqlpack".to_string(),
            registry_ready: false,
        }
    }

    /// Scripts containing `pattern` fail with `message`
    pub fn with_script_failure(mut self, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.push((pattern.into(), message.into()));
        self
    }

    pub fn with_role(mut self, name: impl Into<String>) -> Self {
        self.roles.insert(name.into());
        self
    }

    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Identity recorded as `deployed_by`
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Start with the registry schema already created
    pub fn with_registry(mut self) -> Self {
        self.registry_ready = true;
        self
    }

    pub fn build(self) -> MemoryDatabase {
        let state = State {
            registry_ready: self.registry_ready,
            roles: self.roles,
            ..State::default()
        };
        MemoryDatabase {
            state: Arc::new(RwLock::new(state)),
            failures: Arc::new(RwLock::new(self.failures)),
            fail_connection: self.fail_connection,
            identity: self.identity,
        }
    }
}

impl Default for MemoryDatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}
