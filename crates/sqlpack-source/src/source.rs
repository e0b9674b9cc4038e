//! Module source trait and source combinator

use crate::directory::DirectorySource;
use crate::registry::RegistrySource;
use semver::Version;
use sqlpack_core::SourceConfig;
use std::path::Path;

/// Errors that can occur when listing or fetching modules
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("module not found: {0}")]
    NotFound(String),

    #[error("IO error on {0}: {1}")]
    Io(String, String),

    #[error("HTTP GET {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("invalid module archive: {0}")]
    Archive(String),

    #[error("invalid module {module}: {message}")]
    Invalid { module: String, message: String },
}

impl SourceError {
    pub(crate) fn io(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Io(path.display().to_string(), err.to_string())
    }
}

/// A place modules can be fetched from
///
/// Fetching is blocking; resolution is a sequential walk.
pub trait ModuleSource: Send + Sync {
    /// Human readable description for logs and errors
    fn describe(&self) -> String;

    /// Versions of `module` this source can provide, ascending
    ///
    /// An unknown module yields an empty list rather than an error.
    fn versions(&self, module: &str) -> Result<Vec<Version>, SourceError>;

    /// Write the module directory for `module@version` into `dest`
    ///
    /// `dest` exists and is empty.
    fn fetch(&self, module: &str, version: &Version, dest: &Path) -> Result<(), SourceError>;
}

/// Ordered list of sources; earlier sources win for the same version
#[derive(Default)]
pub struct SourceSet {
    sources: Vec<Box<dyn ModuleSource>>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build sources from configuration, resolving relative paths against `project_root`
    pub fn from_config(configs: &[SourceConfig], project_root: &Path) -> Self {
        let mut set = Self::new();
        for config in configs {
            match config {
                SourceConfig::Directory { path } => {
                    let path = if path.is_absolute() {
                        path.clone()
                    } else {
                        project_root.join(path)
                    };
                    set.push(DirectorySource::new(path));
                }
                SourceConfig::Registry { url } => set.push(RegistrySource::new(url.clone())),
            }
        }
        set
    }

    pub fn push(&mut self, source: impl ModuleSource + 'static) {
        self.sources.push(Box::new(source));
    }

    pub fn with(mut self, source: impl ModuleSource + 'static) -> Self {
        self.push(source);
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl ModuleSource for SourceSet {
    fn describe(&self) -> String {
        let names: Vec<String> = self.sources.iter().map(|s| s.describe()).collect();
        format!("[{}]", names.join(", "))
    }

    fn versions(&self, module: &str) -> Result<Vec<Version>, SourceError> {
        let mut all = Vec::new();
        for source in &self.sources {
            all.extend(source.versions(module)?);
        }
        all.sort();
        all.dedup();
        Ok(all)
    }

    fn fetch(&self, module: &str, version: &Version, dest: &Path) -> Result<(), SourceError> {
        for source in &self.sources {
            if source.versions(module)?.contains(version) {
                tracing::debug!(module, %version, source = %source.describe(), "fetching module");
                return source.fetch(module, version, dest);
            }
        }
        Err(SourceError::NotFound(format!("{}@{}", module, version)))
    }
}
