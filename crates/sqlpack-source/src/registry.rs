//! HTTP module registry
//!
//! ```text
//! GET {base}/{name}/@v/list            one version per line
//! GET {base}/{name}/@v/{version}.zip   zip of the module directory
//! ```
//!
//! A `file://` base reads the same layout from disk, which is also what
//! [`publish`] writes.

use crate::archive::{pack_dir, unpack_into};
use crate::source::{ModuleSource, SourceError};
use semver::Version;
use sqlpack_core::parse_version;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Module source backed by a registry
#[derive(Debug, Clone)]
pub struct RegistrySource {
    base: String,
}

impl RegistrySource {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Read a registry-relative path; `Ok(None)` when it does not exist
    fn read_bytes(&self, rel: &str) -> Result<Option<Vec<u8>>, SourceError> {
        if let Some(dir) = file_url_to_path(&self.base) {
            let path = dir.join(rel);
            if !path.is_file() {
                return Ok(None);
            }
            return std::fs::read(&path).map(Some).map_err(|e| SourceError::io(&path, e));
        }

        let url = format!("{}/{}", self.base, rel);
        let response = match ureq::get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) | Err(ureq::Error::Status(410, _)) => return Ok(None),
            Err(e) => {
                return Err(SourceError::Http {
                    url,
                    message: e.to_string(),
                })
            }
        };

        let mut buf = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut buf)
            .map_err(|e| SourceError::Http {
                url: url.clone(),
                message: e.to_string(),
            })?;
        Ok(Some(buf))
    }

    /// Raw version labels as listed by the registry
    fn labels(&self, module: &str) -> Result<Vec<String>, SourceError> {
        let Some(bytes) = self.read_bytes(&format!("{}/@v/list", module))? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&bytes);
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl ModuleSource for RegistrySource {
    fn describe(&self) -> String {
        format!("registry {}", self.base)
    }

    fn versions(&self, module: &str) -> Result<Vec<Version>, SourceError> {
        let mut versions = Vec::new();
        for label in self.labels(module)? {
            match parse_version(&label) {
                Ok(version) => versions.push(version),
                Err(_) => tracing::warn!(module, label = %label, "registry lists an invalid version"),
            }
        }
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    fn fetch(&self, module: &str, version: &Version, dest: &Path) -> Result<(), SourceError> {
        // The archive is named after the listed label, which may carry a `v`
        let label = self
            .labels(module)?
            .into_iter()
            .find(|l| parse_version(l).map(|v| &v == version).unwrap_or(false))
            .unwrap_or_else(|| version.to_string());

        let rel = format!("{}/@v/{}.zip", module, label);
        let bytes = self
            .read_bytes(&rel)?
            .ok_or_else(|| SourceError::NotFound(format!("{}@{} ({})", module, version, self.describe())))?;
        unpack_into(&bytes, dest)
    }
}

fn file_url_to_path(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file://").map(PathBuf::from)
}

/// Publish a module directory into a filesystem registry
///
/// Writes `<registry>/<name>/@v/<version>.zip` and appends the version to
/// `<registry>/<name>/@v/list` if it is not listed yet.
pub fn publish(module_dir: &Path, registry: &Path, name: &str, version: &Version) -> Result<PathBuf, SourceError> {
    let vdir = registry.join(name).join("@v");
    std::fs::create_dir_all(&vdir).map_err(|e| SourceError::io(&vdir, e))?;

    let archive = vdir.join(format!("{}.zip", version));
    let bytes = pack_dir(module_dir)?;
    std::fs::write(&archive, bytes).map_err(|e| SourceError::io(&archive, e))?;

    let list = vdir.join("list");
    let mut labels: Vec<String> = match std::fs::read_to_string(&list) {
        Ok(text) => text.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(SourceError::io(&list, e)),
    };
    let label = version.to_string();
    if !labels.contains(&label) {
        labels.push(label);
    }
    let mut text = labels.join("\n");
    text.push('\n');
    std::fs::write(&list, text).map_err(|e| SourceError::io(&list, e))?;

    tracing::info!(module = name, %version, archive = %archive.display(), "published module");
    Ok(archive)
}
