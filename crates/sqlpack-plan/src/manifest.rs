//! Module manifest (`module.toml`) parsing
//!
//! The manifest names a module, its version, and its direct requirements on
//! other modules. Install and upgrade rewrite the `[requires]` pins and the
//! `[resolved]` dependency closure.

use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use sqlpack_core::VersionConstraint;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

/// Default manifest file name inside a module directory
pub const MANIFEST_FILE: &str = "module.toml";

/// Module manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Module name (e.g., "totp" or "@acme/totp")
    pub name: String,

    /// Module version
    pub version: Version,

    /// Short description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Native library or extension the module builds on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<String>,

    /// Direct requirements: module name -> version constraint
    #[serde(default)]
    pub requires: BTreeMap<String, VersionConstraint>,

    /// Pinned dependency closure written by install/upgrade
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved: BTreeMap<String, Version>,
}

impl ModuleManifest {
    /// Create a manifest with no requirements
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: None,
            native: None,
            requires: BTreeMap::new(),
            resolved: BTreeMap::new(),
        }
    }

    /// Load manifest from file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_toml(&contents)
    }

    /// Parse manifest from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ManifestError> {
        let manifest: ModuleManifest = toml::from_str(toml)
            .map_err(|e| ManifestError::ParseError(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Save manifest to file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ManifestError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ManifestError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))
    }

    /// Add or replace a direct requirement
    pub fn set_requirement(&mut self, name: &str, constraint: VersionConstraint) -> Result<(), ManifestError> {
        validate_module_name(name)?;
        if name == self.name {
            return Err(ManifestError::SelfRequirement(name.to_string()));
        }
        self.requires.insert(name.to_string(), constraint);
        Ok(())
    }

    /// Drop a direct requirement, returning its previous constraint
    pub fn remove_requirement(&mut self, name: &str) -> Option<VersionConstraint> {
        self.requires.remove(name)
    }

    /// Replace the pinned dependency closure
    pub fn set_resolved<I>(&mut self, closure: I)
    where
        I: IntoIterator<Item = (String, Version)>,
    {
        self.resolved = closure.into_iter().filter(|(name, _)| name != &self.name).collect();
    }

    /// `name@version` identity string
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        validate_module_name(&self.name)?;
        for name in self.requires.keys() {
            validate_module_name(name)?;
            if name == &self.name {
                return Err(ManifestError::SelfRequirement(name.clone()));
            }
        }
        Ok(())
    }
}

fn module_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(@[a-z0-9][a-z0-9._-]*/)?[a-z0-9][a-z0-9._-]*$").expect("module name pattern is valid")
    })
}

/// Check a module name (lowercase, optionally `@scope/`-prefixed)
pub fn validate_module_name(name: &str) -> Result<(), ManifestError> {
    if module_name_regex().is_match(name) && !name.contains("..") {
        Ok(())
    } else {
        Err(ManifestError::InvalidName(name.to_string()))
    }
}

/// Manifest parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest file {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse manifest: {0}")]
    ParseError(String),

    #[error("Failed to serialize manifest: {0}")]
    SerializeError(String),

    #[error("invalid module name '{0}'")]
    InvalidName(String),

    #[error("module '{0}' cannot require itself")]
    SelfRequirement(String),
}
