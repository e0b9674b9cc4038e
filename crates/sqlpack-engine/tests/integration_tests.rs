//! End-to-end engine tests
//!
//! These tests publish small module trees into a temporary directory source,
//! resolve and compile them, and deploy the result into the in-memory target.

use pretty_assertions::assert_eq;
use sqlpack_core::{Config, DeployStrategy, Version, VersionConstraint};
use sqlpack_db::{MemoryDatabase, RegistryError, TargetDatabase};
use sqlpack_engine::{
    compile, deploy, revert, status, verify, CompileOptions, DeployError, DeployOptions, FetchPolicy,
    InstallError, Installer, MergedPlan, Project, ResolutionError, Resolver, UpgradeOptions,
};
use sqlpack_plan::ModuleManifest;
use sqlpack_source::{DirectorySource, Workspace};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write a module directory with one deploy/revert/verify script per change
fn write_module(dir: &Path, name: &str, version: &str, requires: &[(&str, &str)], changes: &[(&str, &[&str])]) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();

    let mut manifest = format!("name = \"{}\"\nversion = \"{}\"\n", name, version);
    if !requires.is_empty() {
        manifest.push_str("\n[requires]\n");
        for (dep, constraint) in requires {
            manifest.push_str(&format!("{} = \"{}\"\n", dep, constraint));
        }
    }
    std::fs::write(dir.join("module.toml"), manifest).unwrap();

    let mut plan = format!("%syntax-version=1.0.0\n%project={}\n\n", name);
    for (change, reqs) in changes {
        if reqs.is_empty() {
            plan.push_str(&format!("{}\n", change));
        } else {
            plan.push_str(&format!("{} [{}]\n", change, reqs.join(" ")));
        }
        for kind in ["deploy", "revert", "verify"] {
            let path = dir.join(kind).join(format!("{}.sql", change));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, format!("-- {} {}@{} {}\n", kind, name, version, change)).unwrap();
        }
    }
    std::fs::write(dir.join("sqlpack.plan"), plan).unwrap();
    dir.to_path_buf()
}

struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn source_dir(&self) -> PathBuf {
        self.dir.path().join("source")
    }

    fn source(&self) -> DirectorySource {
        DirectorySource::new(self.source_dir())
    }

    fn workspace(&self) -> Workspace {
        Workspace::new(self.dir.path().join("workspace"))
    }

    fn publish(&self, name: &str, version: &str, requires: &[(&str, &str)], changes: &[(&str, &[&str])]) {
        write_module(&self.source_dir().join(name).join(version), name, version, requires, changes);
    }

    fn project_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// base32 1.1.0 and 1.2.0, verify 1.0.0, totp 1.2.0
    fn auth_modules(&self) {
        for version in ["1.1.0", "1.2.0"] {
            self.publish(
                "base32",
                version,
                &[],
                &[("schemas/base32", &[]), ("procedures/encode", &["schemas/base32"])],
            );
        }
        self.publish(
            "verify",
            "1.0.0",
            &[("base32", "^1")],
            &[("procedures/verify_code", &["base32:procedures/encode"])],
        );
        self.publish(
            "totp",
            "1.2.0",
            &[("base32", "^1.1"), ("verify", "^1")],
            &[
                ("schemas/totp", &[]),
                ("procedures/generate", &["schemas/totp", "verify:procedures/verify_code"]),
            ],
        );
    }
}

fn merged(env: &Env, name: &str) -> MergedPlan {
    let workspace = env.workspace();
    let source = env.source();
    let resolution = Resolver::new(&workspace, &source)
        .resolve(name, &VersionConstraint::Any)
        .unwrap();
    compile(resolution.modules(), CompileOptions::default()).unwrap()
}

async fn registry_rows(db: &MemoryDatabase) -> Vec<(String, String, String)> {
    let mut rows: Vec<_> = db
        .registry_entries()
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.module, e.change, e.script_hash))
        .collect();
    rows.sort();
    rows
}

#[test]
fn test_single_module_resolves_to_itself() {
    let env = Env::new();
    env.publish("base32", "1.0.0", &[], &[("schemas/base32", &[])]);

    let workspace = env.workspace();
    let source = env.source();
    let resolution = Resolver::new(&workspace, &source)
        .resolve("base32", &VersionConstraint::Any)
        .unwrap();

    assert_eq!(resolution.names(), vec!["base32"]);
    assert!(resolution.closure().is_empty());
    assert!(workspace.is_installed("base32", &Version::new(1, 0, 0)));
}

#[test]
fn test_dependencies_come_before_dependents() {
    let env = Env::new();
    env.auth_modules();

    let plan = merged(&env, "totp");
    let modules = plan.modules();
    assert_eq!(modules, vec!["base32", "verify", "totp"]);

    let labels: Vec<String> = plan.changes().iter().map(|c| c.label()).collect();
    assert_eq!(
        labels,
        vec![
            "base32:schemas/base32",
            "base32:procedures/encode",
            "verify:procedures/verify_code",
            "totp:schemas/totp",
            "totp:procedures/generate",
        ]
    );
}

#[test]
fn test_cycle_is_reported_with_its_path() {
    let env = Env::new();
    env.publish("a", "1.0.0", &[("b", "*")], &[("one", &[])]);
    env.publish("b", "1.0.0", &[("a", "*")], &[("two", &[])]);

    let workspace = env.workspace();
    let source = env.source();
    let err = Resolver::new(&workspace, &source)
        .resolve("a", &VersionConstraint::Any)
        .unwrap_err();

    assert_eq!(
        err,
        ResolutionError::CycleDetected {
            path: vec!["a".to_string(), "b".to_string(), "a".to_string()]
        }
    );
}

#[test]
fn test_compiling_twice_is_byte_identical() {
    let env = Env::new();
    env.auth_modules();

    let first = merged(&env, "totp").render();
    let second = merged(&env, "totp").render();
    assert_eq!(first, second);
    assert!(first.starts_with("%root=totp"));
}

#[test]
fn test_offline_resolution_uses_only_the_workspace() {
    let env = Env::new();
    env.auth_modules();

    let workspace = env.workspace();
    let source = env.source();
    let err = Resolver::new(&workspace, &source)
        .with_policy(FetchPolicy::Offline)
        .resolve("totp", &VersionConstraint::Any)
        .unwrap_err();
    assert!(matches!(err, ResolutionError::ModuleNotFound { .. }));

    merged(&env, "totp");
    let offline = Resolver::new(&workspace, &source)
        .with_policy(FetchPolicy::Offline)
        .resolve("totp", &VersionConstraint::Any)
        .unwrap();
    assert_eq!(offline.len(), 3);
}

#[tokio::test]
async fn test_deploying_twice_leaves_the_registry_unchanged() {
    let env = Env::new();
    env.auth_modules();
    let plan = merged(&env, "totp");
    let db = MemoryDatabase::new();

    let first = deploy(&plan, &db, &DeployOptions::default()).await.unwrap();
    assert_eq!(first.deployed.len(), 5);
    let rows = registry_rows(&db).await;

    let second = deploy(&plan, &db, &DeployOptions::default()).await.unwrap();
    assert!(second.deployed.is_empty());
    assert_eq!(second.already_deployed, 5);
    assert_eq!(registry_rows(&db).await, rows);
}

#[tokio::test]
async fn test_revert_then_redeploy_reproduces_the_registry() {
    let env = Env::new();
    env.auth_modules();
    let plan = merged(&env, "totp");
    let db = MemoryDatabase::new();

    deploy(&plan, &db, &DeployOptions::default()).await.unwrap();
    let rows = registry_rows(&db).await;

    let reverted = revert(&plan, &db, Some("base32:procedures/encode")).await.unwrap();
    let names: Vec<String> = reverted.reverted.iter().map(|c| c.to_string()).collect();
    assert_eq!(
        names,
        vec![
            "totp:procedures/generate",
            "totp:schemas/totp",
            "verify:procedures/verify_code",
        ]
    );
    assert_eq!(registry_rows(&db).await.len(), 2);

    let options = DeployOptions {
        strategy: DeployStrategy::Stream,
        allow_drift: false,
    };
    let redeployed = deploy(&plan, &db, &options).await.unwrap();
    assert_eq!(redeployed.deployed.len(), 3);
    assert_eq!(registry_rows(&db).await, rows);
}

#[tokio::test]
async fn test_drifted_change_halts_deploy_until_allowed() {
    let env = Env::new();
    env.auth_modules();
    let plan = merged(&env, "totp");
    let db = MemoryDatabase::new();

    deploy(&plan, &db, &DeployOptions::default()).await.unwrap();
    revert(&plan, &db, Some("totp:schemas/totp")).await.unwrap();
    assert!(db.tamper_hash("base32", "schemas/base32", "0000").await);

    let err = deploy(&plan, &db, &DeployOptions::default()).await.unwrap_err();
    match err {
        DeployError::Registry(RegistryError::HashMismatch { module, change, recorded, .. }) => {
            assert_eq!(module, "base32");
            assert_eq!(change, "schemas/base32");
            assert_eq!(recorded, "0000");
        }
        other => panic!("expected hash mismatch, got {other:?}"),
    }
    assert_eq!(registry_rows(&db).await.len(), 4);

    let report = status(&plan, &db).await.unwrap();
    assert_eq!(report.summary.errors, 1);
    assert_eq!(report.summary.changes_deployed, 4);

    let options = DeployOptions {
        strategy: DeployStrategy::Fast,
        allow_drift: true,
    };
    let result = deploy(&plan, &db, &options).await.unwrap();
    assert_eq!(result.drifted.len(), 1);
    assert_eq!(result.deployed.len(), 1);
}

#[tokio::test]
async fn test_failed_change_stops_and_resumes() {
    let env = Env::new();
    env.auth_modules();
    let plan = merged(&env, "totp");
    let db = MemoryDatabase::builder()
        .with_script_failure("verify:procedures/verify_code", "function base32_encode does not exist")
        .build();

    let err = deploy(&plan, &db, &DeployOptions::default()).await.unwrap_err();
    assert!(matches!(err, DeployError::Script { ref module, .. } if module == "verify"));
    assert_eq!(registry_rows(&db).await.len(), 2);

    db.clear_failures().await;
    let resumed = deploy(&plan, &db, &DeployOptions::default()).await.unwrap();
    assert_eq!(resumed.already_deployed, 2);
    assert_eq!(resumed.deployed.len(), 3);

    let verified = verify(&plan, &db).await.unwrap();
    assert!(verified.is_success());
    assert_eq!(verified.verified.len(), 5);
}

#[test]
fn test_install_records_the_dependency_closure() {
    let env = Env::new();
    env.auth_modules();
    let app = write_module(&env.project_dir("app"), "app", "0.1.0", &[], &[("schemas/app", &[])]);

    let workspace = env.workspace();
    let source = env.source();
    let report = Installer::new(&workspace, &source).install(&app, "totp@1.2.0").unwrap();

    assert_eq!(report.module, "totp");
    assert_eq!(report.version, Version::new(1, 2, 0));
    assert_eq!(
        report.closure,
        vec![
            ("base32".to_string(), Version::new(1, 2, 0)),
            ("verify".to_string(), Version::new(1, 0, 0)),
            ("totp".to_string(), Version::new(1, 2, 0)),
        ]
    );

    let manifest = ModuleManifest::from_file(&app.join("module.toml")).unwrap();
    assert_eq!(
        manifest.requires.get("totp"),
        Some(&VersionConstraint::Exact(Version::new(1, 2, 0)))
    );
    assert_eq!(manifest.resolved.len(), 3);
}

#[test]
fn test_upgrade_moves_a_requirement_to_its_newest_version() {
    let env = Env::new();
    env.auth_modules();
    let app = write_module(
        &env.project_dir("app"),
        "app",
        "0.1.0",
        &[("base32", "1.1.0"), ("totp", "^1")],
        &[("schemas/app", &[])],
    );

    let workspace = env.workspace();
    let source = env.source();
    let installer = Installer::new(&workspace, &source);

    // Pin the current closure the way an earlier install would have
    let manifest_path = app.join("module.toml");
    let mut manifest = ModuleManifest::from_file(&manifest_path).unwrap();
    let current = Resolver::new(&workspace, &source)
        .resolve_requirements(&manifest)
        .unwrap();
    manifest.set_resolved(current.closure());
    manifest.save_to_file(&manifest_path).unwrap();
    assert_eq!(manifest.resolved.get("base32"), Some(&Version::new(1, 1, 0)));

    let before = std::fs::read_to_string(&manifest_path).unwrap();

    let preview = installer
        .upgrade(
            &app,
            &["base32".to_string()],
            UpgradeOptions {
                dry_run: true,
                ..UpgradeOptions::default()
            },
        )
        .unwrap();
    assert!(preview.dry_run);
    assert_eq!(preview.changes.len(), 1);
    assert_eq!(preview.changes[0].module, "base32");
    assert_eq!(preview.changes[0].from, Some(Version::new(1, 1, 0)));
    assert_eq!(preview.changes[0].to, Version::new(1, 2, 0));
    assert_eq!(preview.affected, vec!["app", "totp", "verify"]);
    assert_eq!(std::fs::read_to_string(app.join("module.toml")).unwrap(), before);
    assert!(!workspace.is_installed("base32", &Version::new(1, 2, 0)));

    let applied = installer
        .upgrade(&app, &["base32".to_string()], UpgradeOptions::default())
        .unwrap();
    assert_eq!(applied.changes, preview.changes);

    let manifest = ModuleManifest::from_file(&app.join("module.toml")).unwrap();
    assert_eq!(
        manifest.requires.get("base32"),
        Some(&VersionConstraint::Exact(Version::new(1, 2, 0)))
    );
    assert_eq!(manifest.resolved.get("base32"), Some(&Version::new(1, 2, 0)));

    let again = installer
        .upgrade(&app, &["base32".to_string()], UpgradeOptions::default())
        .unwrap();
    assert!(again.is_noop());
}

#[test]
fn test_upgrade_stays_within_the_major_version_unless_asked() {
    let env = Env::new();
    env.auth_modules();
    env.publish("base32", "2.0.0", &[], &[("schemas/base32", &[])]);
    let app = write_module(
        &env.project_dir("app"),
        "app",
        "0.1.0",
        &[("base32", "1.1.0"), ("verify", "^1")],
        &[("schemas/app", &[])],
    );

    let workspace = env.workspace();
    let source = env.source();
    let installer = Installer::new(&workspace, &source);

    let minor = installer
        .upgrade(
            &app,
            &["base32".to_string()],
            UpgradeOptions {
                dry_run: true,
                ..UpgradeOptions::default()
            },
        )
        .unwrap();
    assert_eq!(minor.changes[0].to, Version::new(1, 2, 0));
    assert!(!workspace.is_installed("base32", &Version::new(2, 0, 0)));

    // verify still requires ^1
    let err = installer
        .upgrade(
            &app,
            &["base32".to_string()],
            UpgradeOptions {
                dry_run: true,
                major: true,
            },
        )
        .unwrap_err();
    assert!(matches!(
        err,
        InstallError::Resolution(ResolutionError::VersionConflict { ref module, .. }) if module == "base32"
    ));
    assert!(!workspace.is_installed("base32", &Version::new(2, 0, 0)));
}

#[tokio::test]
async fn test_project_deploys_from_configuration() {
    let env = Env::new();
    env.auth_modules();
    let app = write_module(
        &env.project_dir("app"),
        "app",
        "0.1.0",
        &[("totp", "^1")],
        &[("schemas/app", &["totp:schemas/totp"])],
    );

    let mut config = Config::from_toml(
        r#"
[deploy]
strategy = "fast"
cache = true

[[sources]]
type = "directory"
path = "source"
"#,
    )
    .unwrap();
    config.project_root = env.dir.path().to_path_buf();

    let project = Project::new(config);
    let planned = project.plan(&app, project.compile_options()).unwrap();
    assert_eq!(planned.resolution.names(), vec!["base32", "verify", "totp", "app"]);
    assert_eq!(planned.plan.len(), 6);
    assert!(project.workspace().root().starts_with(env.dir.path()));

    let db = MemoryDatabase::new();
    let result = deploy(&planned.plan, &db, &project.deploy_options()).await.unwrap();
    assert_eq!(result.deployed.len(), 6);

    let again = project.plan(&app, project.compile_options()).unwrap();
    let report = status(&again.plan, &db).await.unwrap();
    assert_eq!(report.summary.errors, 0);
    assert_eq!(report.summary.changes_deployed, 6);
}
