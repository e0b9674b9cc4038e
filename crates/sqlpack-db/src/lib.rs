//! Target database access for deployments
//!
//! This crate provides the registry of deployed changes, script execution
//! and role/grant bootstrap against a target database.
//!
//! ## Features
//!
//! - `postgres` (default) - PostgreSQL target via tokio-postgres, plus the
//!   `psql` session runner used by the stream strategy
//!
//! [`MemoryDatabase`] is always available for tests and dry runs.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpack_db::{PostgresTarget, TargetDatabase};
//!
//! let db = PostgresTarget::connect(&config.database, &config.registry.schema).await?;
//! db.ensure_registry().await?;
//! let deployed = db.registry_entries().await?;
//! ```

pub mod target;
pub mod registry;
pub mod bootstrap;
pub mod memory;
pub mod psql;
pub mod script;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use target::{
    TargetDatabase, RegistryEntry, RegistryEvent, RegistryOp, EventKind, SessionOutput,
    RegistryError, ExecError,
};
pub use bootstrap::{RoleSpec, GrantSpec, ProvisionOptions, MissingRolePolicy, ProvisionError};
pub use memory::{MemoryDatabase, MemoryDatabaseBuilder};
pub use psql::PsqlRunner;
pub use script::transaction_control;

#[cfg(feature = "postgres")]
pub use postgres::PostgresTarget;
