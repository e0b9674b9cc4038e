//! Plan compiler
//!
//! Flattens resolved modules into one merged change sequence: each module's
//! plan in resolver order, the root module last. Compilation is pure, so
//! the rendered merged plan is byte-identical across builds of the same
//! inputs and can be diffed as a build artifact.

use semver::Version;
use sqlpack_plan::{ChangeScripts, Module, Require};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// What goes into a merged plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompileOptions {
    /// Include the changes of dependency modules; when false only the root
    /// module's changes are compiled and dependencies are assumed deployed
    pub include_dependency_changes: bool,

    /// Drop changes after each module's last tag
    pub include_tags_only: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            include_dependency_changes: true,
            include_tags_only: false,
        }
    }
}

/// Plan compilation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("malformed plan in module '{module}': {message}")]
    MalformedPlan { module: String, message: String },

    #[error("change '{module}:{change}' requires '{require}', which is not part of the merged plan")]
    DanglingRequire {
        module: String,
        change: String,
        require: String,
    },

    #[error("change '{change}' is defined by both '{first}' and '{second}' with different deploy scripts")]
    NameConflict {
        change: String,
        first: String,
        second: String,
    },

    #[error("IO error on {0}: {1}")]
    Io(String, String),
}

/// One change of the merged plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub module: String,
    pub version: Version,
    pub change: String,

    /// Position within the module's own plan
    pub index: usize,

    /// Requires as `module:change` labels
    pub requires: Vec<String>,

    /// Release tag containing this change
    pub tag: Option<String>,

    pub scripts: ChangeScripts,
}

impl PlannedChange {
    /// `(module, change)` registry key
    pub fn key(&self) -> (&str, &str) {
        (&self.module, &self.change)
    }

    pub fn hash(&self) -> &str {
        &self.scripts.hash
    }

    /// `module:change`
    pub fn label(&self) -> String {
        format!("{}:{}", self.module, self.change)
    }
}

/// Flattened, deduplicated change sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedPlan {
    root: String,
    root_version: Version,
    options: CompileOptions,
    changes: Vec<PlannedChange>,
}

impl MergedPlan {
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn root_version(&self) -> &Version {
        &self.root_version
    }

    pub fn options(&self) -> CompileOptions {
        self.options
    }

    pub fn changes(&self) -> &[PlannedChange] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Position of a change in the merged plan
    pub fn position(&self, module: &str, change: &str) -> Option<usize> {
        self.changes.iter().position(|c| c.module == module && c.change == change)
    }

    /// Find a change by `module:change` or by a bare change name
    ///
    /// A bare name matching changes of several modules is ambiguous and yields `None`.
    pub fn find(&self, target: &str) -> Option<usize> {
        if let Some((module, change)) = target.split_once(':') {
            return self.position(module, change);
        }
        let mut matches = self.changes.iter().enumerate().filter(|(_, c)| c.change == target);
        match (matches.next(), matches.next()) {
            (Some((idx, _)), None) => Some(idx),
            _ => None,
        }
    }

    /// Modules contributing at least one change, in plan order
    pub fn modules(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.changes
            .iter()
            .map(|c| c.module.as_str())
            .filter(|m| seen.insert(*m))
            .collect()
    }

    /// Byte-stable text form: no timestamps, one change per line
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("%root={}@{}\n", self.root, self.root_version));
        out.push_str(&format!(
            "%dependencies={}\n%tags-only={}\n\n",
            self.options.include_dependency_changes, self.options.include_tags_only
        ));

        for change in &self.changes {
            out.push_str(&format!("{}@{} {}", change.module, change.version, change.change));
            if !change.requires.is_empty() {
                out.push_str(&format!(" [{}]", change.requires.join(" ")));
            }
            out.push_str(&format!(" {}", change.scripts.hash));
            if let Some(tag) = &change.tag {
                out.push_str(&format!(" @{}", tag));
            }
            out.push('\n');
        }
        out
    }

    /// Write the rendered plan as a build artifact
    pub fn write_to(&self, path: &Path) -> Result<(), CompileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CompileError::Io(parent.display().to_string(), e.to_string()))?;
        }
        std::fs::write(path, self.render()).map_err(|e| CompileError::Io(path.display().to_string(), e.to_string()))
    }
}

/// Label a require points at, following collapsed changes to their survivor
fn required_label(survivors: &HashMap<(String, String), String>, module: &str, change: &str) -> String {
    survivors
        .get(&(module.to_string(), change.to_string()))
        .cloned()
        .unwrap_or_else(|| format!("{}:{}", module, change))
}

/// Compile resolved modules (root last) into a merged plan
pub fn compile(modules: &[Module], options: CompileOptions) -> Result<MergedPlan, CompileError> {
    let root = modules.last().ok_or_else(|| CompileError::MalformedPlan {
        module: String::new(),
        message: "no modules to compile".to_string(),
    })?;

    let mut changes: Vec<PlannedChange> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    // Changes compiled so far, or supplied by skipped dependency modules
    let mut known: HashSet<(String, String)> = HashSet::new();

    // change name -> (module, hash) of its first definition
    let mut owners: HashMap<String, (String, String)> = HashMap::new();

    // collapsed (module, change) -> label of the planned change it became
    let mut survivors: HashMap<(String, String), String> = HashMap::new();

    for (position, module) in modules.iter().enumerate() {
        let name = module.name();
        let is_root = position + 1 == modules.len();
        let plan = &module.plan;

        let limit = if options.include_tags_only {
            plan.last_tag_index().map(|idx| idx + 1).unwrap_or(0)
        } else {
            plan.len()
        };

        for index in 0..limit {
            let Some(change) = plan.change(index) else { break };
            let scripts = module.scripts(index).ok_or_else(|| CompileError::MalformedPlan {
                module: name.to_string(),
                message: format!("change '{}' has no scripts", change.name),
            })?;

            known.insert((name.to_string(), change.name.clone()));
            if !is_root && !options.include_dependency_changes {
                continue;
            }
            if !seen.insert((name.to_string(), change.name.clone())) {
                continue;
            }

            if let Some((owner, hash)) = owners.get(&change.name) {
                if owner != name {
                    if hash == &scripts.hash {
                        tracing::debug!(
                            change = %change.name,
                            module = %name,
                            first = %owner,
                            "identical change already planned"
                        );
                        survivors.insert(
                            (name.to_string(), change.name.clone()),
                            format!("{}:{}", owner, change.name),
                        );
                        continue;
                    }
                    return Err(CompileError::NameConflict {
                        change: change.name.clone(),
                        first: owner.clone(),
                        second: name.to_string(),
                    });
                }
            }
            owners.insert(change.name.clone(), (name.to_string(), scripts.hash.clone()));

            let mut requires = Vec::with_capacity(change.requires.len());
            for require in &change.requires {
                match require {
                    Require::Local(idx) => {
                        let target = plan.change(*idx).filter(|_| *idx < index).ok_or_else(|| {
                            CompileError::MalformedPlan {
                                module: name.to_string(),
                                message: format!("change '{}' has an invalid local require", change.name),
                            }
                        })?;
                        requires.push(required_label(&survivors, name, &target.name));
                    }
                    Require::External { module: dep, change: dep_change } => {
                        if !known.contains(&(dep.clone(), dep_change.clone())) {
                            return Err(CompileError::DanglingRequire {
                                module: name.to_string(),
                                change: change.name.clone(),
                                require: format!("{}:{}", dep, dep_change),
                            });
                        }
                        requires.push(required_label(&survivors, dep, dep_change));
                    }
                }
            }

            changes.push(PlannedChange {
                module: name.to_string(),
                version: module.manifest.version.clone(),
                change: change.name.clone(),
                index,
                requires,
                tag: plan.tag_for(index).map(|t| t.name.clone()),
                scripts: scripts.clone(),
            });
        }
    }

    tracing::debug!(root = %root.name(), changes = changes.len(), "compiled merged plan");
    Ok(MergedPlan {
        root: root.name().to_string(),
        root_version: root.manifest.version.clone(),
        options,
        changes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Resolver;
    use crate::test_support::Fixture;
    use pretty_assertions::assert_eq;
    use sqlpack_core::VersionConstraint;
    use sqlpack_source::DirectorySource;

    fn resolve(fx: &Fixture, root: &str) -> Vec<Module> {
        let source = DirectorySource::new(fx.source_dir());
        let workspace = fx.workspace();
        Resolver::new(&workspace, &source)
            .resolve(root, &VersionConstraint::Any)
            .unwrap()
            .modules()
            .to_vec()
    }

    fn labels(plan: &MergedPlan) -> Vec<String> {
        plan.changes().iter().map(PlannedChange::label).collect()
    }

    fn totp_fixture() -> Fixture {
        let fx = Fixture::new();
        fx.module("base32", "1.1.0")
            .change("schemas/base32", &[])
            .change("procedures/encode", &["schemas/base32"])
            .tag("v1.1.0")
            .change("procedures/decode", &["schemas/base32"])
            .write();
        fx.module("totp", "1.2.0")
            .requires("base32", "^1.1")
            .change("schemas/totp", &[])
            .change("procedures/generate", &["schemas/totp", "base32:procedures/encode"])
            .tag("v1.2.0")
            .write();
        fx
    }

    #[test]
    fn dependencies_come_first_in_module_order() {
        let fx = totp_fixture();
        let plan = compile(&resolve(&fx, "totp"), CompileOptions::default()).unwrap();

        assert_eq!(
            labels(&plan),
            vec![
                "base32:schemas/base32",
                "base32:procedures/encode",
                "base32:procedures/decode",
                "totp:schemas/totp",
                "totp:procedures/generate",
            ]
        );
        assert_eq!(
            plan.changes()[4].requires,
            vec!["totp:schemas/totp".to_string(), "base32:procedures/encode".to_string()]
        );
        assert_eq!(plan.changes()[1].tag.as_deref(), Some("v1.1.0"));
        assert_eq!(plan.changes()[2].tag, None);
    }

    #[test]
    fn root_only_and_tags_only() {
        let fx = totp_fixture();
        let modules = resolve(&fx, "totp");

        let root_only = compile(
            &modules,
            CompileOptions {
                include_dependency_changes: false,
                include_tags_only: false,
            },
        )
        .unwrap();
        assert_eq!(labels(&root_only), vec!["totp:schemas/totp", "totp:procedures/generate"]);

        let released = compile(
            &modules,
            CompileOptions {
                include_dependency_changes: true,
                include_tags_only: true,
            },
        )
        .unwrap();
        assert_eq!(released.position("base32", "procedures/decode"), None);
        assert_eq!(released.len(), 4);
    }

    #[test]
    fn compilation_is_byte_stable() {
        let fx = totp_fixture();
        let modules = resolve(&fx, "totp");

        let first = compile(&modules, CompileOptions::default()).unwrap().render();
        let second = compile(&modules, CompileOptions::default()).unwrap().render();
        assert_eq!(first, second);
        assert!(first.starts_with("%root=totp@1.2.0\n"));
        assert!(!first.contains("T0"), "rendered plan must not carry timestamps");

        let out = fx.path().join("build").join("merged.plan");
        compile(&modules, CompileOptions::default()).unwrap().write_to(&out).unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), first);
    }

    #[test]
    fn same_name_same_script_collapses_but_different_script_conflicts() {
        let fx = Fixture::new();
        fx.module("a", "1.0.0").change_sql("extensions/pgcrypto", "CREATE EXTENSION pgcrypto;").write();
        fx.module("b", "1.0.0").change_sql("extensions/pgcrypto", "CREATE EXTENSION pgcrypto;").write();
        fx.module("app", "1.0.0")
            .requires("a", "*")
            .requires("b", "*")
            .change("app", &[])
            .write();

        let plan = compile(&resolve(&fx, "app"), CompileOptions::default()).unwrap();
        assert_eq!(labels(&plan), vec!["a:extensions/pgcrypto", "app:app"]);

        let fx = Fixture::new();
        fx.module("a", "1.0.0").change_sql("extensions/pgcrypto", "CREATE EXTENSION pgcrypto;").write();
        fx.module("b", "1.0.0")
            .change_sql("extensions/pgcrypto", "CREATE EXTENSION IF NOT EXISTS pgcrypto;")
            .write();
        fx.module("app", "1.0.0")
            .requires("a", "*")
            .requires("b", "*")
            .change("app", &[])
            .write();

        let err = compile(&resolve(&fx, "app"), CompileOptions::default()).unwrap_err();
        assert_eq!(
            err,
            CompileError::NameConflict {
                change: "extensions/pgcrypto".to_string(),
                first: "a".to_string(),
                second: "b".to_string(),
            }
        );
    }

    #[test]
    fn requires_of_a_collapsed_change_point_at_its_survivor() {
        let fx = Fixture::new();
        fx.module("a", "1.0.0").change_sql("extensions/pgcrypto", "CREATE EXTENSION pgcrypto;").write();
        fx.module("b", "1.0.0")
            .change_sql("extensions/pgcrypto", "CREATE EXTENSION pgcrypto;")
            .change("functions/digest", &["extensions/pgcrypto"])
            .write();
        fx.module("app", "1.0.0")
            .requires("a", "*")
            .requires("b", "*")
            .change("app", &["b:extensions/pgcrypto", "b:functions/digest"])
            .write();

        let plan = compile(&resolve(&fx, "app"), CompileOptions::default()).unwrap();
        assert_eq!(
            labels(&plan),
            vec!["a:extensions/pgcrypto", "b:functions/digest", "app:app"]
        );

        let digest = &plan.changes()[plan.position("b", "functions/digest").unwrap()];
        assert_eq!(digest.requires, vec!["a:extensions/pgcrypto".to_string()]);
        let app = &plan.changes()[plan.position("app", "app").unwrap()];
        assert_eq!(
            app.requires,
            vec!["a:extensions/pgcrypto".to_string(), "b:functions/digest".to_string()]
        );

        // Every require names a change of the merged plan
        let planned: HashSet<String> = labels(&plan).into_iter().collect();
        assert!(plan.changes().iter().flat_map(|c| &c.requires).all(|r| planned.contains(r)));
    }

    #[test]
    fn unresolved_cross_module_require_is_dangling() {
        let fx = Fixture::new();
        fx.module("totp", "1.0.0")
            .change("procedures/generate", &["base32:procedures/encode"])
            .write();

        let err = compile(&resolve(&fx, "totp"), CompileOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::DanglingRequire { ref require, .. } if require == "base32:procedures/encode"));
    }

    #[test]
    fn find_accepts_qualified_and_unique_bare_names() {
        let fx = totp_fixture();
        let plan = compile(&resolve(&fx, "totp"), CompileOptions::default()).unwrap();

        assert_eq!(plan.find("totp:schemas/totp"), Some(3));
        assert_eq!(plan.find("procedures/generate"), Some(4));
        assert_eq!(plan.find("missing"), None);
        assert_eq!(plan.modules(), vec!["base32", "totp"]);
    }
}
