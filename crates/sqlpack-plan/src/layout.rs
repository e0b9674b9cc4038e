//! Module directory layout
//!
//! ```text
//! <root>/module.toml
//! <root>/sqlpack.plan
//! <root>/deploy/<change>.sql
//! <root>/revert/<change>.sql
//! <root>/verify/<change>.sql   (optional)
//! ```

use crate::manifest::{ManifestError, ModuleManifest, MANIFEST_FILE};
use crate::plan::{Plan, PlanError, PLAN_FILE};
use sqlpack_core::script_hash;
use std::path::{Path, PathBuf};

/// Scripts for one change, index-aligned with the plan's changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeScripts {
    pub deploy: String,
    pub revert: String,
    pub verify: Option<String>,

    /// SHA-256 of the deploy script
    pub hash: String,
}

impl ChangeScripts {
    pub fn new(deploy: impl Into<String>, revert: impl Into<String>, verify: Option<String>) -> Self {
        let deploy = deploy.into();
        let hash = script_hash(deploy.as_bytes());
        Self {
            deploy,
            revert: revert.into(),
            verify,
            hash,
        }
    }
}

/// A module loaded from disk: manifest, plan and scripts
#[derive(Debug, Clone)]
pub struct Module {
    pub root: PathBuf,
    pub manifest: ModuleManifest,
    pub plan: Plan,
    scripts: Vec<ChangeScripts>,
}

impl Module {
    /// Load a module directory
    pub fn load(root: &Path) -> Result<Self, LayoutError> {
        let manifest = ModuleManifest::from_file(&root.join(MANIFEST_FILE))?;
        let plan = Plan::from_file(&root.join(PLAN_FILE)).map_err(|e| LayoutError::Plan {
            module: manifest.name.clone(),
            source: e,
        })?;

        if plan.project != manifest.name {
            return Err(LayoutError::ProjectMismatch {
                manifest: manifest.name.clone(),
                plan: plan.project.clone(),
            });
        }

        let mut scripts = Vec::with_capacity(plan.len());
        for change in plan.changes() {
            let deploy = read_required(root, "deploy", &change.name)?;
            let revert = read_required(root, "revert", &change.name)?;
            let verify = read_optional(root, "verify", &change.name)?;
            scripts.push(ChangeScripts::new(deploy, revert, verify));
        }

        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            plan,
            scripts,
        })
    }

    /// Module name
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Scripts of the change at a plan index
    pub fn scripts(&self, index: usize) -> Option<&ChangeScripts> {
        self.scripts.get(index)
    }

    /// Script path for a change in one of `deploy`, `revert`, `verify`
    pub fn script_path(root: &Path, kind: &str, change: &str) -> PathBuf {
        let mut path = root.join(kind);
        let mut segments = change.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{}.sql", segment));
            }
        }
        path
    }

    /// Write a change's scripts into a module directory
    ///
    /// Only touches the script files; the caller is responsible for the plan.
    pub fn write_scripts(
        root: &Path,
        change: &str,
        scripts: &ChangeScripts,
    ) -> Result<(), LayoutError> {
        let mut files = vec![("deploy", &scripts.deploy), ("revert", &scripts.revert)];
        if let Some(verify) = &scripts.verify {
            files.push(("verify", verify));
        }
        for (kind, body) in files {
            let path = Self::script_path(root, kind, change);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LayoutError::Io(parent.display().to_string(), e.to_string()))?;
            }
            std::fs::write(&path, body)
                .map_err(|e| LayoutError::Io(path.display().to_string(), e.to_string()))?;
        }
        Ok(())
    }
}

fn read_required(root: &Path, kind: &str, change: &str) -> Result<String, LayoutError> {
    let path = Module::script_path(root, kind, change);
    if !path.is_file() {
        return Err(LayoutError::MissingScript {
            change: change.to_string(),
            path: path.display().to_string(),
        });
    }
    std::fs::read_to_string(&path).map_err(|e| LayoutError::Io(path.display().to_string(), e.to_string()))
}

fn read_optional(root: &Path, kind: &str, change: &str) -> Result<Option<String>, LayoutError> {
    let path = Module::script_path(root, kind, change);
    if !path.is_file() {
        return Ok(None);
    }
    std::fs::read_to_string(&path)
        .map(Some)
        .map_err(|e| LayoutError::Io(path.display().to_string(), e.to_string()))
}

/// Module directory errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("plan of module '{module}': {source}")]
    Plan { module: String, source: PlanError },

    #[error("plan project '{plan}' does not match manifest name '{manifest}'")]
    ProjectMismatch { manifest: String, plan: String },

    #[error("change '{change}' is missing script {path}")]
    MissingScript { change: String, path: String },

    #[error("IO error on {0}: {1}")]
    Io(String, String),
}
