//! Local module workspace
//!
//! Fetched modules live in `<root>/<escaped-name>@<version>/`. A module is
//! written to a fresh hidden temporary directory, loaded and checked there,
//! and only then renamed into place, so a directory that exists under its
//! final name is always a complete, valid module.

use crate::source::{ModuleSource, SourceError};
use semver::Version;
use sqlpack_core::parse_version;
use sqlpack_plan::Module;
use std::path::{Path, PathBuf};

/// Directory name form of a module name (`@acme/totp` -> `@acme!totp`)
pub fn escape_module(module: &str) -> String {
    module.replace(['/', '\\'], "!")
}

/// Local workspace of materialized modules
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of `module@version`, whether or not it exists
    pub fn path(&self, module: &str, version: &Version) -> PathBuf {
        self.root.join(format!("{}@{}", escape_module(module), version))
    }

    pub fn is_installed(&self, module: &str, version: &Version) -> bool {
        self.path(module, version).is_dir()
    }

    /// Versions of `module` already present, ascending
    pub fn installed_versions(&self, module: &str) -> Result<Vec<Version>, SourceError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}@", escape_module(module));
        let entries = std::fs::read_dir(&self.root).map_err(|e| SourceError::io(&self.root, e))?;

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SourceError::io(&self.root, e))?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some(label) = file_name.strip_prefix(&prefix) {
                if let Ok(version) = parse_version(label) {
                    if entry.path().is_dir() {
                        versions.push(version);
                    }
                }
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Ensure `module@version` is present locally, fetching it from `source` if needed
    pub fn materialize(
        &self,
        source: &dyn ModuleSource,
        module: &str,
        version: &Version,
    ) -> Result<PathBuf, SourceError> {
        let dest = self.path(module, version);
        if dest.is_dir() {
            return Ok(dest);
        }

        std::fs::create_dir_all(&self.root).map_err(|e| SourceError::io(&self.root, e))?;
        // Unique per call; dropping it removes whatever was fetched
        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{}@{}.", escape_module(module), version))
            .tempdir_in(&self.root)
            .map_err(|e| SourceError::io(&self.root, e))?;

        source.fetch(module, version, tmp.path())?;
        check_fetched(tmp.path(), module, version)?;

        if let Err(e) = std::fs::rename(tmp.path(), &dest) {
            // Another process may have finished the same module first
            if !dest.is_dir() {
                return Err(SourceError::io(&dest, e));
            }
        }

        tracing::info!(module, %version, path = %dest.display(), "materialized module");
        Ok(dest)
    }
}

/// A fetched directory must load as exactly `module@version`
fn check_fetched(dir: &Path, module: &str, version: &Version) -> Result<(), SourceError> {
    let invalid = |message: String| SourceError::Invalid {
        module: format!("{}@{}", module, version),
        message,
    };
    let loaded = Module::load(dir).map_err(|e| invalid(e.to_string()))?;
    if loaded.manifest.name != module || &loaded.manifest.version != version {
        return Err(invalid(format!("source delivered {}", loaded.manifest.id())));
    }
    Ok(())
}

/// The workspace doubles as a source for offline resolution
impl ModuleSource for Workspace {
    fn describe(&self) -> String {
        format!("workspace {}", self.root.display())
    }

    fn versions(&self, module: &str) -> Result<Vec<Version>, SourceError> {
        self.installed_versions(module)
    }

    fn fetch(&self, module: &str, version: &Version, dest: &Path) -> Result<(), SourceError> {
        let src = self.path(module, version);
        if !src.is_dir() {
            return Err(SourceError::NotFound(format!("{}@{}", module, version)));
        }
        crate::directory::copy_tree(&src, dest)
    }
}
