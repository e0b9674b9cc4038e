//! PostgreSQL target database
//!
//! Registry reads and writes, batched deploys and verification go through a
//! single tokio-postgres connection. The stream strategy hands scripts to
//! an external `psql` session connected with the same settings.
//!
//! ## Usage
//!
//! ```rust,ignore
//! // Plain connection
//! let db = PostgresTarget::connect(&config.database, "sqlpack_registry").await?;
//!
//! // TLS connection
//! let db = PostgresTarget::connect_with_tls(&config.database, "sqlpack_registry").await?;
//!
//! // External session binary for the stream strategy
//! let db = db.with_psql(PsqlRunner::new("/usr/lib/postgresql/16/bin/psql", &config.database));
//! ```

use crate::bootstrap::{grant_sql, role_sql, GrantSpec, ProvisionError, ProvisionOptions, RoleSpec};
use crate::psql::PsqlRunner;
use crate::registry;
use crate::script::transaction_control;
use crate::target::{
    EventKind, ExecError, RegistryEntry, RegistryError, RegistryEvent, RegistryOp, SessionOutput, TargetDatabase,
};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use sqlpack_core::ConnectionConfig;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Transaction};

/// PostgreSQL target database
pub struct PostgresTarget {
    client: Mutex<Client>,

    /// Registry schema (validated lowercase identifier)
    schema: String,

    psql: PsqlRunner,

    host: String,
    port: u16,
    database: String,
}

/// SQLSTATE and message of a tokio-postgres error
fn split_error(e: &tokio_postgres::Error) -> (Option<String>, String) {
    match e.as_db_error() {
        Some(db) => {
            let mut message = db.message().to_string();
            if let Some(detail) = db.detail() {
                message.push_str(&format!(" ({})", detail));
            }
            (Some(db.code().code().to_string()), message)
        }
        None => (e.code().map(|c| c.code().to_string()), e.to_string()),
    }
}

fn registry_err(e: tokio_postgres::Error) -> RegistryError {
    if e.is_closed() {
        return RegistryError::Connection(e.to_string());
    }
    let (code, message) = split_error(&e);
    match code {
        Some(code) => RegistryError::Query(format!("{} (SQLSTATE {})", message, code)),
        None => RegistryError::Query(message),
    }
}

fn exec_err(e: tokio_postgres::Error) -> ExecError {
    if e.is_closed() {
        return ExecError::Registry(RegistryError::Connection(e.to_string()));
    }
    let (code, message) = split_error(&e);
    ExecError::Sql { code, message }
}

impl PostgresTarget {
    /// Connect without TLS
    pub async fn connect(config: &ConnectionConfig, schema: &str) -> Result<Self, RegistryError> {
        let (client, connection) = tokio_postgres::connect(&config.to_connection_string(), NoTls)
            .await
            .map_err(|e| {
                RegistryError::Connection(format!(
                    "Failed to connect to PostgreSQL at {}:{}: {}",
                    config.host, config.port, e
                ))
            })?;

        // Spawn connection handler in background
        let host = config.host.clone();
        let port = config.port;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(%host, port, error = %e, "PostgreSQL connection error");
            }
        });

        Ok(Self::from_client(client, config, schema))
    }

    /// Connect with TLS via native-tls
    pub async fn connect_with_tls(config: &ConnectionConfig, schema: &str) -> Result<Self, RegistryError> {
        let connector = TlsConnector::builder()
            .build()
            .map_err(|e| RegistryError::Connection(format!("Failed to create TLS connector: {}", e)))?;
        let tls = MakeTlsConnector::new(connector);

        let (client, connection) = tokio_postgres::connect(&config.to_connection_string(), tls)
            .await
            .map_err(|e| {
                RegistryError::Connection(format!(
                    "Failed to connect to PostgreSQL at {}:{} with TLS: {}",
                    config.host, config.port, e
                ))
            })?;

        let host = config.host.clone();
        let port = config.port;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(%host, port, error = %e, "PostgreSQL TLS connection error");
            }
        });

        Ok(Self::from_client(client, config, schema))
    }

    fn from_client(client: Client, config: &ConnectionConfig, schema: &str) -> Self {
        Self {
            client: Mutex::new(client),
            schema: schema.to_string(),
            psql: PsqlRunner::new("psql", config),
            host: config.host.clone(),
            port: config.port,
            database: config.database.clone(),
        }
    }

    /// Use a specific `psql` binary for the stream strategy
    pub fn with_psql(mut self, runner: PsqlRunner) -> Self {
        self.psql = runner;
        self
    }

    /// `host:port/database`
    pub fn describe(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    async fn write_ops(&self, tx: &Transaction<'_>, ops: &[RegistryOp]) -> Result<(), tokio_postgres::Error> {
        let insert = registry::insert_entry_sql(&self.schema);
        let delete = registry::delete_entry_sql(&self.schema);
        let event = registry::insert_event_sql(&self.schema);

        for op in ops {
            match op {
                RegistryOp::Insert { module, change, script_hash } => {
                    tx.execute(insert.as_str(), &[module, change, script_hash]).await?;
                    tx.execute(
                        event.as_str(),
                        &[&EventKind::Deploy.as_str(), module, change, &Some(script_hash.as_str())],
                    )
                    .await?;
                }
                RegistryOp::Delete { module, change } => {
                    let removed = tx.query_opt(delete.as_str(), &[module, change]).await?;
                    let hash: Option<String> = removed.map(|row| row.get(0));
                    tx.execute(event.as_str(), &[&EventKind::Revert.as_str(), module, change, &hash])
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TargetDatabase for PostgresTarget {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    async fn test_connection(&self) -> Result<(), RegistryError> {
        let client = self.client.lock().await;
        client.batch_execute("SELECT 1").await.map_err(registry_err)
    }

    async fn ensure_registry(&self) -> Result<(), RegistryError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(registry_err)?;
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&registry::lock_key(&self.schema)])
            .await
            .map_err(registry_err)?;
        tx.batch_execute(&registry::ensure_sql(&self.schema))
            .await
            .map_err(registry_err)?;
        tx.commit().await.map_err(registry_err)?;

        tracing::debug!(schema = %self.schema, db = %self.describe(), "registry ready");
        Ok(())
    }

    async fn registry_entries(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        let client = self.client.lock().await;
        let rows = client
            .query(registry::select_entries_sql(&self.schema).as_str(), &[])
            .await
            .map_err(registry_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(RegistryEntry {
                module: row.try_get("module").map_err(registry_err)?,
                change: row.try_get("change_name").map_err(registry_err)?,
                script_hash: row.try_get("script_hash").map_err(registry_err)?,
                deployed_at: row.try_get("deployed_at").map_err(registry_err)?,
                deployed_by: row.try_get("deployed_by").map_err(registry_err)?,
            });
        }
        Ok(entries)
    }

    async fn events(&self) -> Result<Vec<RegistryEvent>, RegistryError> {
        let client = self.client.lock().await;
        let rows = client
            .query(registry::select_events_sql(&self.schema).as_str(), &[])
            .await
            .map_err(registry_err)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("event").map_err(registry_err)?;
            let event = EventKind::parse(&raw)
                .ok_or_else(|| RegistryError::Query(format!("unknown registry event '{}'", raw)))?;
            events.push(RegistryEvent {
                id: row.try_get("id").map_err(registry_err)?,
                event,
                module: row.try_get("module").map_err(registry_err)?,
                change: row.try_get("change_name").map_err(registry_err)?,
                script_hash: row.try_get("script_hash").map_err(registry_err)?,
                occurred_at: row.try_get("occurred_at").map_err(registry_err)?,
                occurred_by: row.try_get("occurred_by").map_err(registry_err)?,
            });
        }
        Ok(events)
    }

    async fn apply(&self, script: &str, ops: &[RegistryOp]) -> Result<(), ExecError> {
        if let Some(statement) = transaction_control(script) {
            return Err(ExecError::TransactionControl { statement });
        }
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(exec_err)?;
        tx.batch_execute(script).await.map_err(exec_err)?;
        self.write_ops(&tx, ops).await.map_err(|e| ExecError::Registry(registry_err(e)))?;
        tx.commit().await.map_err(exec_err)
    }

    async fn run_streamed(&self, script: &str) -> Result<SessionOutput, ExecError> {
        self.psql.run(script).await
    }

    async fn record(&self, ops: &[RegistryOp]) -> Result<(), RegistryError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(registry_err)?;
        self.write_ops(&tx, ops).await.map_err(registry_err)?;
        tx.commit().await.map_err(registry_err)
    }

    async fn record_failure(&self, module: &str, change: &str, script_hash: Option<&str>) -> Result<(), RegistryError> {
        let client = self.client.lock().await;
        client
            .execute(
                registry::insert_event_sql(&self.schema).as_str(),
                &[&EventKind::Fail.as_str(), &module, &change, &script_hash],
            )
            .await
            .map(|_| ())
            .map_err(registry_err)
    }

    async fn verify(&self, script: &str) -> Result<(), ExecError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(exec_err)?;
        let outcome = tx.batch_execute(script).await.map_err(exec_err);
        // Verification never keeps its effects
        tx.rollback().await.map_err(exec_err)?;
        outcome
    }

    async fn ensure_role(&self, role: &RoleSpec, options: &ProvisionOptions) -> Result<(), ProvisionError> {
        let sql = role_sql(role, options)?;
        let client = self.client.lock().await;
        client.batch_execute(&sql).await.map_err(|e| {
            if e.is_closed() {
                return ProvisionError::Connection(e.to_string());
            }
            let (code, message) = split_error(&e);
            ProvisionError::role_failed(role, code, message)
        })
    }

    async fn ensure_grant(&self, grant: &GrantSpec, options: &ProvisionOptions) -> Result<(), ProvisionError> {
        let sql = grant_sql(grant, options)?;
        let client = self.client.lock().await;
        client.batch_execute(&sql).await.map_err(|e| {
            if e.is_closed() {
                return ProvisionError::Connection(e.to_string());
            }
            let (code, message) = split_error(&e);
            ProvisionError::grant_failed(grant, code, message)
        })
    }
}
