//! sqlpack Engine
//!
//! Dependency resolution, plan compilation and deployment:
//! - Resolve a module's requirement closure against the workspace and sources
//! - Compile the closure into one merged plan in dependency order
//! - Diff the merged plan against the target's registry
//! - Deploy, revert and verify changes
//! - Install and upgrade requirements in a module manifest
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpack_engine::{deploy, Project};
//!
//! let project = Project::new(config);
//! let planned = project.plan(&module_dir, project.compile_options())?;
//! let result = deploy(&planned.plan, &db, &project.deploy_options()).await?;
//! ```

pub mod resolver;
pub mod compiler;
pub mod diff;
pub mod deploy;
pub mod install;
pub mod cache;
pub mod project;

#[cfg(test)]
mod test_support;

pub use resolver::{FetchPolicy, Resolution, ResolutionError, Resolver};
pub use compiler::{compile, CompileError, CompileOptions, MergedPlan, PlannedChange};
pub use diff::{diff, diff_entries, status, DeployState, HashMismatch};
pub use deploy::{
    deploy, revert, verify, ChangeRef, DeployError, DeployOptions, DeployResult, RevertError,
    RevertResult, VerifyError, VerifyFailure, VerifyResult,
};
pub use install::{
    parse_request, InstallError, InstallReport, Installer, UpgradeOptions, UpgradeReport,
    VersionChange,
};
pub use cache::{fingerprint, CachedPlan, ResolutionCache};
pub use project::{Project, ProjectError};
