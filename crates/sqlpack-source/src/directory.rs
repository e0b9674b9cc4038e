//! Filesystem module source
//!
//! Layout: `<root>/<name>/<version>/` where `<version>` may carry a leading `v`.

use crate::source::{ModuleSource, SourceError};
use semver::Version;
use sqlpack_core::parse_version;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Module source backed by a directory tree
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Version directories of a module with their parsed versions
    fn version_dirs(&self, module: &str) -> Result<Vec<(Version, PathBuf)>, SourceError> {
        let module_dir = self.root.join(module);
        if !module_dir.is_dir() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&module_dir).map_err(|e| SourceError::io(&module_dir, e))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SourceError::io(&module_dir, e))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let label = entry.file_name().to_string_lossy().to_string();
            match parse_version(&label) {
                Ok(version) => out.push((version, path)),
                Err(_) => tracing::debug!(path = %path.display(), "skipping non-version directory"),
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

impl ModuleSource for DirectorySource {
    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    fn versions(&self, module: &str) -> Result<Vec<Version>, SourceError> {
        Ok(self.version_dirs(module)?.into_iter().map(|(v, _)| v).collect())
    }

    fn fetch(&self, module: &str, version: &Version, dest: &Path) -> Result<(), SourceError> {
        let src = self
            .version_dirs(module)?
            .into_iter()
            .find(|(v, _)| v == version)
            .map(|(_, path)| path)
            .ok_or_else(|| SourceError::NotFound(format!("{}@{}", module, version)))?;

        copy_tree(&src, dest)
    }
}

/// Recursively copy the contents of `src` into `dest`
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<(), SourceError> {
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| SourceError::io(src, e))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| SourceError::io(entry.path(), e))?;
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| SourceError::io(&target, e))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| SourceError::io(parent, e))?;
            }
            std::fs::copy(entry.path(), &target).map_err(|e| SourceError::io(&target, e))?;
        }
    }
    Ok(())
}
