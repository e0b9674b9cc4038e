//! Module plans, manifests and on-disk layout
//!
//! This crate handles:
//! - Parsing and writing plan files (ordered changes and tags)
//! - Parsing and rewriting module manifests (`module.toml`)
//! - Loading a module directory with its deploy/revert/verify scripts
//! - Building the module dependency graph for impact analysis

pub mod plan;
pub mod manifest;
pub mod layout;
pub mod graph;

pub use plan::{Plan, Change, Tag, Require, PlanError, PLAN_FILE, SYNTAX_VERSION};
pub use manifest::{ModuleManifest, ManifestError, MANIFEST_FILE, validate_module_name};
pub use layout::{Module, ChangeScripts, LayoutError};
pub use graph::ModuleGraph;
