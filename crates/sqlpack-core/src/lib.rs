//! sqlpack Core
//!
//! Shared domain types with stable, versioned shapes.
//! Never rename diagnostic codes - they are part of the public API.

pub mod diagnostic;
pub mod report;
pub mod config;
pub mod hash;
pub mod version;

pub use diagnostic::{Diagnostic, DiagnosticCode, Severity, Location};
pub use report::{Report, ReportError, ReportKind, ReportSummary, REPORT_FORMAT};
pub use config::{Config, ConfigError, ConnectionConfig, DeployConfig, DeployStrategy, SourceConfig, WorkspaceConfig, RegistryConfig};
pub use hash::{script_hash, advisory_key};
pub use version::{VersionConstraint, VersionError, parse_version};
pub use semver::Version;
