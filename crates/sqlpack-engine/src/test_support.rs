//! Module directory fixtures for unit tests

use sqlpack_source::Workspace;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Temporary directory holding a directory source and a workspace
pub(crate) struct Fixture {
    dir: TempDir,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    /// `<name>/<version>/` module directories
    pub(crate) fn source_dir(&self) -> PathBuf {
        self.dir.path().join("source")
    }

    pub(crate) fn workspace(&self) -> Workspace {
        Workspace::new(self.dir.path().join("workspace"))
    }

    /// Module published in the directory source
    pub(crate) fn module(&self, name: &str, version: &str) -> ModuleBuilder {
        ModuleBuilder::new(self.source_dir().join(name).join(version), name, version)
    }

    /// Module at an arbitrary path (a project being deployed)
    pub(crate) fn module_at(&self, rel: &str, name: &str, version: &str) -> ModuleBuilder {
        ModuleBuilder::new(self.dir.path().join(rel), name, version)
    }
}

struct ChangeFixture {
    name: String,
    requires: Vec<String>,
    deploy: Option<String>,
}

pub(crate) struct ModuleBuilder {
    dir: PathBuf,
    name: String,
    version: String,
    requires: Vec<(String, String)>,
    changes: Vec<ChangeFixture>,
    tags: Vec<(usize, String)>,
}

impl ModuleBuilder {
    fn new(dir: PathBuf, name: &str, version: &str) -> Self {
        Self {
            dir,
            name: name.to_string(),
            version: version.to_string(),
            requires: Vec::new(),
            changes: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub(crate) fn requires(mut self, name: &str, constraint: &str) -> Self {
        self.requires.push((name.to_string(), constraint.to_string()));
        self
    }

    pub(crate) fn change(mut self, name: &str, requires: &[&str]) -> Self {
        self.changes.push(ChangeFixture {
            name: name.to_string(),
            requires: requires.iter().map(|r| r.to_string()).collect(),
            deploy: None,
        });
        self
    }

    /// Change with an explicit deploy script
    pub(crate) fn change_sql(mut self, name: &str, deploy: &str) -> Self {
        self.changes.push(ChangeFixture {
            name: name.to_string(),
            requires: Vec::new(),
            deploy: Some(deploy.to_string()),
        });
        self
    }

    /// Tag the last change added so far
    pub(crate) fn tag(mut self, name: &str) -> Self {
        self.tags.push((self.changes.len(), name.to_string()));
        self
    }

    pub(crate) fn write(self) -> PathBuf {
        std::fs::create_dir_all(&self.dir).unwrap();

        let mut manifest = format!("name = \"{}\"\nversion = \"{}\"\n", self.name, self.version);
        if !self.requires.is_empty() {
            manifest.push_str("\n[requires]\n");
            for (name, constraint) in &self.requires {
                manifest.push_str(&format!("\"{}\" = \"{}\"\n", name, constraint));
            }
        }
        std::fs::write(self.dir.join("module.toml"), manifest).unwrap();

        let mut plan = format!("%syntax-version=1.0.0\n%project={}\n\n", self.name);
        for (idx, change) in self.changes.iter().enumerate() {
            if change.requires.is_empty() {
                plan.push_str(&format!("{}\n", change.name));
            } else {
                plan.push_str(&format!("{} [{}]\n", change.name, change.requires.join(" ")));
            }
            for (after, tag) in &self.tags {
                if *after == idx + 1 {
                    plan.push_str(&format!("@{}\n", tag));
                }
            }

            let deploy = change
                .deploy
                .clone()
                .unwrap_or_else(|| format!("-- deploy {} {}\n", self.name, change.name));
            write_script(&self.dir, "deploy", &change.name, &deploy);
            write_script(&self.dir, "revert", &change.name, &format!("-- revert {} {}\n", self.name, change.name));
            write_script(&self.dir, "verify", &change.name, &format!("-- verify {} {}\n", self.name, change.name));
        }
        std::fs::write(self.dir.join("sqlpack.plan"), plan).unwrap();

        self.dir
    }
}

fn write_script(root: &Path, kind: &str, change: &str, body: &str) {
    let path = root.join(kind).join(format!("{}.sql", change));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}
