//! Install and upgrade module requirements
//!
//! Both operations rewrite a module's manifest: the direct requirement is
//! pinned to the selected version in `[requires]`, and the full dependency
//! closure is recorded in `[resolved]`.
//!
//! Upgrades stay within the current requirement: a range keeps its range and
//! an exact pin moves to the newest semver-compatible release. Crossing a
//! major version needs `UpgradeOptions::major`. A dry run resolves into a
//! scratch workspace, so the real workspace only ever holds modules a
//! manifest actually selected.

use crate::resolver::{FetchPolicy, ResolutionError, Resolver};
use semver::{Comparator, Op, Version, VersionReq};
use sqlpack_core::VersionConstraint;
use sqlpack_plan::{validate_module_name, ManifestError, ModuleManifest, MANIFEST_FILE};
use sqlpack_source::{ModuleSource, SourceError, Workspace};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstallError {
    #[error("invalid install request '{0}': expected name or name@constraint")]
    InvalidRequest(String),

    #[error("'{0}' is not a requirement of this module")]
    NotRequired(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("failed to create scratch workspace: {0}")]
    Scratch(String),
}

/// Outcome of an install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub module: String,
    pub version: Version,

    /// Dependency closure now recorded in `[resolved]`
    pub closure: Vec<(String, Version)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpgradeOptions {
    /// Report what would change without rewriting the manifest
    pub dry_run: bool,

    /// Allow moving to a newer major version
    pub major: bool,
}

/// A module whose selected version changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionChange {
    pub module: String,
    pub from: Option<Version>,
    pub to: Version,
}

/// Outcome of an upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    pub changes: Vec<VersionChange>,

    /// Modules that transitively require an upgraded module
    pub affected: Vec<String>,

    pub closure: Vec<(String, Version)>,
    pub dry_run: bool,
}

impl UpgradeReport {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Split `name@constraint`; a leading `@` belongs to a scoped name
pub fn parse_request(request: &str) -> Result<(String, VersionConstraint), InstallError> {
    let request = request.trim();
    let split = request
        .char_indices()
        .filter(|(idx, c)| *c == '@' && *idx > 0)
        .map(|(idx, _)| idx)
        .last();

    let (name, constraint) = match split {
        Some(idx) => {
            let constraint = VersionConstraint::parse(&request[idx + 1..])
                .map_err(|_| InstallError::InvalidRequest(request.to_string()))?;
            (&request[..idx], constraint)
        }
        None => (request, VersionConstraint::Any),
    };

    if name.is_empty() {
        return Err(InstallError::InvalidRequest(request.to_string()));
    }
    Ok((name.to_string(), constraint))
}

/// Installs and upgrades requirements of a module directory
pub struct Installer<'a> {
    workspace: &'a Workspace,
    source: &'a dyn ModuleSource,
}

impl<'a> Installer<'a> {
    pub fn new(workspace: &'a Workspace, source: &'a dyn ModuleSource) -> Self {
        Self { workspace, source }
    }

    /// Install `name@constraint` as a requirement of the module in `target_dir`
    pub fn install(&self, target_dir: &Path, request: &str) -> Result<InstallReport, InstallError> {
        let (name, constraint) = parse_request(request)?;
        validate_module_name(&name)?;

        let path = target_dir.join(MANIFEST_FILE);
        let mut manifest = ModuleManifest::from_file(&path)?;

        let mut pins = manifest.resolved.clone();
        pins.remove(&name);
        let resolver = Resolver::new(self.workspace, self.source)
            .with_policy(FetchPolicy::Latest)
            .with_pins(pins);

        let requested = resolver.resolve(&name, &constraint)?;
        let version = requested
            .root()
            .map(|m| m.manifest.version.clone())
            .ok_or_else(|| InstallError::InvalidRequest(request.to_string()))?;

        manifest.set_requirement(&name, VersionConstraint::Exact(version.clone()))?;

        // Re-resolve from the target so its other requirements stay consistent
        let resolution = resolver.resolve_requirements(&manifest)?;
        manifest.set_resolved(resolution.closure());
        manifest.save_to_file(&path)?;

        tracing::info!(module = %name, %version, target = %manifest.name, "installed module");
        Ok(InstallReport {
            module: name,
            version,
            closure: resolution.closure(),
        })
    }

    /// Move the named requirements (every requirement when empty) to their newest version
    pub fn upgrade(
        &self,
        target_dir: &Path,
        names: &[String],
        options: UpgradeOptions,
    ) -> Result<UpgradeReport, InstallError> {
        let path = target_dir.join(MANIFEST_FILE);
        let manifest = ModuleManifest::from_file(&path)?;

        let targets: Vec<String> = if names.is_empty() {
            manifest.requires.keys().cloned().collect()
        } else {
            for name in names {
                if !manifest.requires.contains_key(name) {
                    return Err(InstallError::NotRequired(name.clone()));
                }
            }
            names.to_vec()
        };

        let mut pins = manifest.resolved.clone();
        for name in &targets {
            pins.remove(name);
        }

        let mut next = manifest.clone();
        for name in &targets {
            let current = manifest.requires.get(name).cloned().unwrap_or(VersionConstraint::Any);
            let version = self.upgrade_version(name, &current, options.major)?;
            let requirement = match current {
                VersionConstraint::Exact(_) => VersionConstraint::Exact(version),
                range if range.matches(&version) => range,
                _ => VersionConstraint::Exact(version),
            };
            next.set_requirement(name, requirement)?;
        }

        let scratch = match options.dry_run {
            true => Some(tempfile::tempdir().map_err(|e| InstallError::Scratch(e.to_string()))?),
            false => None,
        };
        let scratch_workspace = scratch.as_ref().map(|dir| Workspace::new(dir.path()));
        let installed_first = InstalledFirst {
            workspace: self.workspace,
            source: self.source,
        };
        let resolver = match &scratch_workspace {
            Some(workspace) => Resolver::new(workspace, &installed_first),
            None => Resolver::new(self.workspace, self.source),
        }
        .with_policy(FetchPolicy::Latest)
        .with_pins(pins);

        let resolution = resolver.resolve_requirements(&next)?;
        next.set_resolved(resolution.closure());

        let changes = version_changes(&manifest, &next);
        let mut affected = BTreeSet::new();
        for change in &changes {
            affected.extend(resolution.graph().downstream(&change.module));
        }
        for change in &changes {
            affected.remove(&change.module);
        }

        for change in &changes {
            tracing::info!(
                module = %change.module,
                from = %change.from.as_ref().map(Version::to_string).unwrap_or_else(|| "-".to_string()),
                to = %change.to,
                dry_run = options.dry_run,
                "upgrade"
            );
        }

        if !options.dry_run && next != manifest {
            next.save_to_file(&path)?;
        }

        Ok(UpgradeReport {
            changes,
            affected: affected.into_iter().collect(),
            closure: resolution.closure(),
            dry_run: options.dry_run,
        })
    }

    /// Newest offered version an upgrade of `current` may move to
    fn upgrade_version(&self, module: &str, current: &VersionConstraint, major: bool) -> Result<Version, InstallError> {
        let fetch_failed = |source: SourceError| ResolutionError::FetchFailed {
            module: module.to_string(),
            source,
        };
        let mut all = self.source.versions(module).map_err(fetch_failed)?;
        all.extend(self.workspace.installed_versions(module).map_err(fetch_failed)?);

        let bound = match current {
            _ if major => VersionConstraint::Any,
            VersionConstraint::Exact(pinned) => compatible_with(pinned),
            range => range.clone(),
        };
        bound.select_highest(&all).cloned().ok_or_else(|| {
            InstallError::Resolution(ResolutionError::ModuleNotFound {
                module: module.to_string(),
                constraint: bound.to_string(),
                available: all.clone(),
            })
        })
    }
}

/// `^version`: releases semver-compatible with a pin
fn compatible_with(version: &Version) -> VersionConstraint {
    VersionConstraint::Req(VersionReq {
        comparators: vec![Comparator {
            op: Op::Caret,
            major: version.major,
            minor: Some(version.minor),
            patch: Some(version.patch),
            pre: version.pre.clone(),
        }],
    })
}

/// Installed modules first, then the configured sources
///
/// Feeds a scratch workspace during dry runs.
struct InstalledFirst<'a> {
    workspace: &'a Workspace,
    source: &'a dyn ModuleSource,
}

impl ModuleSource for InstalledFirst<'_> {
    fn describe(&self) -> String {
        format!("{}, then {}", self.workspace.describe(), self.source.describe())
    }

    fn versions(&self, module: &str) -> Result<Vec<Version>, SourceError> {
        let mut all = self.source.versions(module)?;
        all.extend(self.workspace.installed_versions(module)?);
        all.sort();
        all.dedup();
        Ok(all)
    }

    fn fetch(&self, module: &str, version: &Version, dest: &Path) -> Result<(), SourceError> {
        if self.workspace.is_installed(module, version) {
            self.workspace.fetch(module, version, dest)
        } else {
            self.source.fetch(module, version, dest)
        }
    }
}

/// Effective version of each module: the resolved pin, else an exact requirement
fn selected_versions(manifest: &ModuleManifest) -> BTreeMap<String, Version> {
    let mut versions = manifest.resolved.clone();
    for (name, constraint) in &manifest.requires {
        if let VersionConstraint::Exact(version) = constraint {
            versions.entry(name.clone()).or_insert_with(|| version.clone());
        }
    }
    versions
}

fn version_changes(before: &ModuleManifest, after: &ModuleManifest) -> Vec<VersionChange> {
    let old = selected_versions(before);
    selected_versions(after)
        .into_iter()
        .filter(|(name, version)| old.get(name) != Some(version))
        .map(|(name, to)| VersionChange {
            from: old.get(&name).cloned(),
            module: name,
            to,
        })
        .collect()
}
