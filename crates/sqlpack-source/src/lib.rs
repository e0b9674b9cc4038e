//! Module sources and the local module workspace
//!
//! A module that is not present locally is located in one of the configured
//! sources and materialized into the workspace directory, so that the
//! resolver and compiler can read its plan and scripts synchronously.
//!
//! ## Sources
//!
//! - [`DirectorySource`] - `<path>/<name>/<version>/` module directories
//! - [`RegistrySource`] - HTTP (or `file://`) registry serving
//!   `<name>/@v/list` and `<name>/@v/<version>.zip`
//! - [`SourceSet`] - ordered combination of several sources

pub mod source;
pub mod directory;
pub mod registry;
pub mod archive;
pub mod workspace;

pub use source::{ModuleSource, SourceError, SourceSet};
pub use directory::DirectorySource;
pub use registry::{RegistrySource, publish};
pub use archive::{pack_dir, unpack_into};
pub use workspace::{Workspace, escape_module};
