//! Dependency resolver
//!
//! Walks `requires` edges depth first from a root module using an explicit
//! frame stack, so deep graphs never recurse. Modules are emitted in
//! post-order: every module appears after everything it requires, and
//! independent modules keep the order in which they were first discovered.
//!
//! Modules that are not yet in the local workspace are fetched from the
//! configured sources and materialized before they are loaded.

use semver::Version;
use sqlpack_core::VersionConstraint;
use sqlpack_plan::{Module, ModuleGraph, ModuleManifest};
use sqlpack_source::{ModuleSource, SourceError, Workspace};
use std::collections::{BTreeMap, HashMap};

/// How versions are chosen when several sources can provide a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchPolicy {
    /// Use the highest installed version that satisfies the constraint,
    /// asking sources only when none does
    #[default]
    PreferLocal,

    /// Pick the highest version offered by any source or the workspace
    Latest,

    /// Only consider installed versions; sources are never contacted
    Offline,
}

/// Errors that end a resolve call; no partial module list is returned
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("version conflict on '{module}': {selected} is already selected but '{required_by}' requires {constraint}")]
    VersionConflict {
        module: String,
        selected: Version,
        constraint: String,
        required_by: String,
    },

    #[error("module not found: no version of '{module}' satisfies {constraint}{}", available_suffix(.available))]
    ModuleNotFound {
        module: String,
        constraint: String,
        available: Vec<Version>,
    },

    #[error("failed to fetch '{module}': {source}")]
    FetchFailed { module: String, source: SourceError },

    #[error("invalid module '{module}': {message}")]
    InvalidModule { module: String, message: String },
}

fn available_suffix(available: &[Version]) -> String {
    if available.is_empty() {
        return String::new();
    }
    let list: Vec<String> = available.iter().map(Version::to_string).collect();
    format!(" (available: {})", list.join(", "))
}

/// Resolved modules in dependency order, plus their requirement graph
#[derive(Debug, Clone)]
pub struct Resolution {
    root: String,

    /// Topological order; the root module comes last when it was loaded
    modules: Vec<Module>,

    graph: ModuleGraph,
}

impl Resolution {
    /// Name of the module resolution started from
    pub fn root_name(&self) -> &str {
        &self.root
    }

    /// The root module, when resolution started from a loaded module
    pub fn root(&self) -> Option<&Module> {
        self.modules.last().filter(|m| m.name() == self.root)
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name() == name)
    }

    /// Module names in resolved order
    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Selected `(name, version)` of every module except the root
    pub fn closure(&self) -> Vec<(String, Version)> {
        self.modules
            .iter()
            .filter(|m| m.name() != self.root)
            .map(|m| (m.manifest.name.clone(), m.manifest.version.clone()))
            .collect()
    }

    pub fn graph(&self) -> &ModuleGraph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// One module on the DFS stack
struct Frame {
    name: String,
    requires: Vec<(String, VersionConstraint)>,
    next: usize,
    module: Option<Module>,
}

impl Frame {
    fn new(manifest: &ModuleManifest, module: Option<Module>) -> Self {
        Self {
            name: manifest.name.clone(),
            requires: manifest
                .requires
                .iter()
                .map(|(name, constraint)| (name.clone(), constraint.clone()))
                .collect(),
            next: 0,
            module,
        }
    }
}

/// Resolves module requirement graphs against a workspace and its sources
pub struct Resolver<'a> {
    workspace: &'a Workspace,
    source: &'a dyn ModuleSource,
    policy: FetchPolicy,

    /// Preferred versions (a manifest's `[resolved]` table)
    pins: BTreeMap<String, Version>,
}

impl<'a> Resolver<'a> {
    pub fn new(workspace: &'a Workspace, source: &'a dyn ModuleSource) -> Self {
        Self {
            workspace,
            source,
            policy: FetchPolicy::default(),
            pins: BTreeMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Prefer these versions whenever they satisfy the constraints
    pub fn with_pins(mut self, pins: BTreeMap<String, Version>) -> Self {
        self.pins = pins;
        self
    }

    /// Resolve a module by name, fetching it and its requirements as needed
    pub fn resolve(&self, name: &str, constraint: &VersionConstraint) -> Result<Resolution, ResolutionError> {
        let version = self.select(name, constraint)?;
        let root = self.load(name, &version)?;
        self.resolve_module(&root)
    }

    /// Resolve the requirements of an already loaded module; the module itself comes last
    pub fn resolve_module(&self, root: &Module) -> Result<Resolution, ResolutionError> {
        self.walk(&root.manifest, Some(root.clone()))
    }

    /// Resolve a manifest's requirements without loading the manifest's own module
    pub fn resolve_requirements(&self, manifest: &ModuleManifest) -> Result<Resolution, ResolutionError> {
        self.walk(manifest, None)
    }

    fn walk(&self, root: &ModuleManifest, root_module: Option<Module>) -> Result<Resolution, ResolutionError> {
        let mut selected: HashMap<String, Version> = HashMap::new();
        let mut modules = Vec::new();
        let mut graph = ModuleGraph::new();

        selected.insert(root.name.clone(), root.version.clone());
        let mut stack = vec![Frame::new(root, root_module)];

        loop {
            let step = match stack.last_mut() {
                None => break,
                Some(frame) => match frame.requires.get(frame.next).cloned() {
                    Some((dep, constraint)) => {
                        frame.next += 1;
                        Some((frame.name.clone(), dep, constraint))
                    }
                    None => None,
                },
            };

            let Some((parent, dep, constraint)) = step else {
                // Every requirement of the top module is resolved
                if let Some(frame) = stack.pop() {
                    let requires: Vec<String> = frame.requires.iter().map(|(n, _)| n.clone()).collect();
                    graph.add_module(&frame.name, &requires);
                    if let Some(module) = frame.module {
                        modules.push(module);
                    }
                }
                continue;
            };

            if let Some(pos) = stack.iter().position(|f| f.name == dep) {
                let mut path: Vec<String> = stack[pos..].iter().map(|f| f.name.clone()).collect();
                path.push(dep);
                return Err(ResolutionError::CycleDetected { path });
            }

            if let Some(version) = selected.get(&dep) {
                if !constraint.matches(version) {
                    return Err(ResolutionError::VersionConflict {
                        module: dep,
                        selected: version.clone(),
                        constraint: constraint.to_string(),
                        required_by: parent,
                    });
                }
                continue;
            }

            let version = self.select(&dep, &constraint)?;
            let module = self.load(&dep, &version)?;
            tracing::debug!(module = %dep, %version, required_by = %parent, "selected module");

            selected.insert(dep, version);
            let manifest = module.manifest.clone();
            stack.push(Frame::new(&manifest, Some(module)));
        }

        tracing::info!(root = %root.name, modules = modules.len(), "resolved module graph");
        Ok(Resolution {
            root: root.name.clone(),
            modules,
            graph,
        })
    }

    /// Highest acceptable version of `module` under the fetch policy
    fn select(&self, module: &str, constraint: &VersionConstraint) -> Result<Version, ResolutionError> {
        let fetch_failed = |source: SourceError| ResolutionError::FetchFailed {
            module: module.to_string(),
            source,
        };
        let local = self.workspace.installed_versions(module).map_err(fetch_failed)?;

        if let Some(pin) = self.pins.get(module) {
            if constraint.matches(pin) && (self.policy != FetchPolicy::Offline || local.contains(pin)) {
                return Ok(pin.clone());
            }
        }

        let candidates = match self.policy {
            FetchPolicy::Offline => local,
            FetchPolicy::PreferLocal if constraint.select_highest(&local).is_some() => {
                tracing::debug!(
                    module,
                    %constraint,
                    "installed version satisfies constraint, sources not consulted for newer versions"
                );
                local
            }
            _ => {
                let mut all = self.source.versions(module).map_err(fetch_failed)?;
                all.extend(local);
                all.sort();
                all.dedup();
                all
            }
        };

        constraint
            .select_highest(&candidates)
            .cloned()
            .ok_or_else(|| ResolutionError::ModuleNotFound {
                module: module.to_string(),
                constraint: constraint.to_string(),
                available: candidates,
            })
    }

    /// Load `module@version` from the workspace, materializing it first if needed
    fn load(&self, module: &str, version: &Version) -> Result<Module, ResolutionError> {
        let dir = if self.workspace.is_installed(module, version) {
            self.workspace.path(module, version)
        } else if self.policy == FetchPolicy::Offline {
            return Err(ResolutionError::ModuleNotFound {
                module: module.to_string(),
                constraint: version.to_string(),
                available: Vec::new(),
            });
        } else {
            self.workspace
                .materialize(self.source, module, version)
                .map_err(|source| ResolutionError::FetchFailed {
                    module: module.to_string(),
                    source,
                })?
        };

        let loaded = Module::load(&dir).map_err(|e| ResolutionError::InvalidModule {
            module: module.to_string(),
            message: e.to_string(),
        })?;

        if loaded.manifest.name != module || &loaded.manifest.version != version {
            return Err(ResolutionError::InvalidModule {
                module: module.to_string(),
                message: format!(
                    "{} contains {} instead of {}@{}",
                    dir.display(),
                    loaded.manifest.id(),
                    module,
                    version
                ),
            });
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use pretty_assertions::assert_eq;
    use sqlpack_source::DirectorySource;

    fn any() -> VersionConstraint {
        VersionConstraint::Any
    }

    #[test]
    fn module_without_requires_resolves_to_itself() {
        let fx = Fixture::new();
        fx.module("base32", "1.1.0").change("schemas/base32", &[]).write();

        let source = DirectorySource::new(fx.source_dir());
        let workspace = fx.workspace();
        let resolution = Resolver::new(&workspace, &source).resolve("base32", &any()).unwrap();

        assert_eq!(resolution.names(), vec!["base32"]);
        assert!(resolution.closure().is_empty());
        assert!(workspace.is_installed("base32", &Version::new(1, 1, 0)));
    }

    #[test]
    fn requirements_come_before_dependents_in_discovery_order() {
        let fx = Fixture::new();
        fx.module("base32", "1.1.0").change("schemas/base32", &[]).write();
        fx.module("verify", "1.0.0").change("schemas/verify", &[]).write();
        fx.module("totp", "1.2.0")
            .requires("verify", "^1.0")
            .requires("base32", "1.1.0")
            .change("schemas/totp", &[])
            .write();
        fx.module("app", "0.1.0")
            .requires("totp", "*")
            .requires("base32", "^1")
            .change("schemas/app", &[])
            .write();

        let source = DirectorySource::new(fx.source_dir());
        let workspace = fx.workspace();
        let resolution = Resolver::new(&workspace, &source).resolve("app", &any()).unwrap();

        // [requires] is a sorted table: base32 is discovered before totp
        assert_eq!(resolution.names(), vec!["base32", "verify", "totp", "app"]);
        assert_eq!(resolution.graph().downstream("base32"), vec!["totp".to_string(), "app".to_string()]);
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let fx = Fixture::new();
        fx.module("a", "1.0.0").requires("b", "*").change("one", &[]).write();
        fx.module("b", "1.0.0").requires("a", "*").change("two", &[]).write();

        let source = DirectorySource::new(fx.source_dir());
        let workspace = fx.workspace();
        let err = Resolver::new(&workspace, &source).resolve("a", &any()).unwrap_err();

        assert_eq!(
            err,
            ResolutionError::CycleDetected {
                path: vec!["a".to_string(), "b".to_string(), "a".to_string()]
            }
        );
    }

    #[test]
    fn later_constraint_conflicting_with_selection_is_an_error() {
        let fx = Fixture::new();
        fx.module("base32", "1.1.0").change("schemas/base32", &[]).write();
        fx.module("base32", "2.0.0").change("schemas/base32", &[]).write();
        fx.module("legacy", "1.0.0").requires("base32", "^1").change("legacy", &[]).write();
        fx.module("app", "1.0.0")
            .requires("base32", "*")
            .requires("legacy", "*")
            .change("app", &[])
            .write();

        let source = DirectorySource::new(fx.source_dir());
        let workspace = fx.workspace();
        let err = Resolver::new(&workspace, &source)
            .with_policy(FetchPolicy::Latest)
            .resolve("app", &any())
            .unwrap_err();

        match err {
            ResolutionError::VersionConflict { module, selected, required_by, .. } => {
                assert_eq!(module, "base32");
                assert_eq!(selected, Version::new(2, 0, 0));
                assert_eq!(required_by, "legacy");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_module_lists_available_versions() {
        let fx = Fixture::new();
        fx.module("base32", "1.1.0").change("schemas/base32", &[]).write();

        let source = DirectorySource::new(fx.source_dir());
        let workspace = fx.workspace();
        let err = Resolver::new(&workspace, &source)
            .resolve("base32", &VersionConstraint::parse("^2").unwrap())
            .unwrap_err();

        assert!(matches!(err, ResolutionError::ModuleNotFound { ref available, .. } if available.len() == 1));
        assert!(err.to_string().contains("available: 1.1.0"));
    }

    #[test]
    fn policies_choose_between_installed_and_newest() {
        let fx = Fixture::new();
        fx.module("base32", "1.1.0").change("schemas/base32", &[]).write();
        let source = DirectorySource::new(fx.source_dir());
        let workspace = fx.workspace();
        Resolver::new(&workspace, &source).resolve("base32", &any()).unwrap();

        fx.module("base32", "1.2.0").change("schemas/base32", &[]).write();

        let local = Resolver::new(&workspace, &source).resolve("base32", &any()).unwrap();
        assert_eq!(local.modules()[0].manifest.version, Version::new(1, 1, 0));

        let latest = Resolver::new(&workspace, &source)
            .with_policy(FetchPolicy::Latest)
            .resolve("base32", &any())
            .unwrap();
        assert_eq!(latest.modules()[0].manifest.version, Version::new(1, 2, 0));

        let pinned = Resolver::new(&workspace, &source)
            .with_policy(FetchPolicy::Latest)
            .with_pins(BTreeMap::from([("base32".to_string(), Version::new(1, 1, 0))]))
            .resolve("base32", &any())
            .unwrap();
        assert_eq!(pinned.modules()[0].manifest.version, Version::new(1, 1, 0));
    }

    #[test]
    fn offline_never_fetches() {
        let fx = Fixture::new();
        fx.module("base32", "1.1.0").change("schemas/base32", &[]).write();
        let source = DirectorySource::new(fx.source_dir());
        let workspace = fx.workspace();

        let err = Resolver::new(&workspace, &source)
            .with_policy(FetchPolicy::Offline)
            .resolve("base32", &any())
            .unwrap_err();
        assert!(matches!(err, ResolutionError::ModuleNotFound { .. }));
        assert!(!workspace.is_installed("base32", &Version::new(1, 1, 0)));
    }
}
