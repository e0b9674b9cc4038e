//! Integration tests for module sources and workspace materialization
//!
//! All sources here are filesystem backed; the HTTP transport shares the
//! same code path as `file://` registries apart from the GET itself.

use semver::Version;
use sqlpack_core::SourceConfig;
use sqlpack_source::{publish, DirectorySource, ModuleSource, RegistrySource, SourceSet, Workspace};
use std::path::Path;

fn write_module(dir: &Path, name: &str, version: &str) {
    std::fs::create_dir_all(dir.join("deploy")).unwrap();
    std::fs::create_dir_all(dir.join("revert")).unwrap();
    std::fs::write(
        dir.join("module.toml"),
        format!("name = \"{}\"\nversion = \"{}\"\n", name, version),
    )
    .unwrap();
    std::fs::write(
        dir.join("sqlpack.plan"),
        format!("%syntax-version=1.0.0\n%project={}\n\nschema\n", name),
    )
    .unwrap();
    std::fs::write(dir.join("deploy").join("schema.sql"), format!("-- {} {}", name, version)).unwrap();
    std::fs::write(dir.join("revert").join("schema.sql"), format!("-- revert {}", name)).unwrap();
}

#[test]
fn source_set_merges_versions_and_prefers_first_source() {
    let vendor = tempfile::tempdir().unwrap();
    write_module(&vendor.path().join("base32").join("1.1.0"), "base32", "1.1.0");

    let staging = tempfile::tempdir().unwrap();
    write_module(staging.path(), "base32", "1.2.0");
    let registry = tempfile::tempdir().unwrap();
    publish(staging.path(), registry.path(), "base32", &Version::new(1, 2, 0)).unwrap();

    let set = SourceSet::new()
        .with(DirectorySource::new(vendor.path()))
        .with(RegistrySource::new(format!("file://{}", registry.path().display())));

    assert_eq!(
        set.versions("base32").unwrap(),
        vec![Version::new(1, 1, 0), Version::new(1, 2, 0)]
    );

    let ws = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(ws.path());
    let older = workspace.materialize(&set, "base32", &Version::new(1, 1, 0)).unwrap();
    let newer = workspace.materialize(&set, "base32", &Version::new(1, 2, 0)).unwrap();

    assert_eq!(
        std::fs::read_to_string(older.join("deploy/schema.sql")).unwrap(),
        "-- base32 1.1.0"
    );
    assert_eq!(
        std::fs::read_to_string(newer.join("deploy/schema.sql")).unwrap(),
        "-- base32 1.2.0"
    );
    assert_eq!(workspace.installed_versions("base32").unwrap().len(), 2);
}

#[test]
fn sources_from_config() {
    let vendor = tempfile::tempdir().unwrap();
    write_module(&vendor.path().join("verify").join("1.0.0"), "verify", "1.0.0");

    let configs = vec![SourceConfig::Directory {
        path: vendor.path().to_path_buf(),
    }];
    let set = SourceSet::from_config(&configs, Path::new("/unused"));

    assert_eq!(set.versions("verify").unwrap(), vec![Version::new(1, 0, 0)]);
}

#[test]
fn workspace_serves_as_offline_source() {
    let vendor = tempfile::tempdir().unwrap();
    write_module(&vendor.path().join("totp").join("1.2.0"), "totp", "1.2.0");

    let ws = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(ws.path());
    workspace
        .materialize(&DirectorySource::new(vendor.path()), "totp", &Version::new(1, 2, 0))
        .unwrap();

    let dest = tempfile::tempdir().unwrap();
    workspace.fetch("totp", &Version::new(1, 2, 0), dest.path()).unwrap();
    assert!(dest.path().join("module.toml").is_file());
}
