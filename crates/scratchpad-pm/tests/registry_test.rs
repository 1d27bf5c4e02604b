//! Integration tests for the package registry adapter.

use scratchpad_pm::{PackageJson, PackageRegistry, RegistryConfig};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write_manifest(dir: &Path, deps: &[(&str, &str)]) {
    let mut manifest = PackageJson::install_root();
    for (name, version) in deps {
        manifest
            .dependencies
            .insert(name.to_string(), version.to_string());
    }
    fs::create_dir_all(dir).unwrap();
    manifest.write(&dir.join("package.json")).unwrap();
}

fn write_package(dir: &Path, name: &str, version: &str) {
    let pkg_dir = dir.join("node_modules").join(name);
    fs::create_dir_all(&pkg_dir).unwrap();
    fs::write(
        pkg_dir.join("package.json"),
        format!(r#"{{ "name": "{name}", "version": "{version}", "main": "index.js" }}"#),
    )
    .unwrap();
    fs::write(pkg_dir.join("index.js"), "module.exports = {};").unwrap();
}

#[test]
fn test_missing_manifest_yields_empty_set() {
    let dir = TempDir::new().unwrap();
    let registry = PackageRegistry::with_dir(dir.path().join("does-not-exist"));

    assert!(registry.list_installed_names().is_empty());
    assert!(registry.installed_packages().is_empty());
    assert!(registry.resolve_on_disk("lodash").is_none());
}

#[test]
fn test_corrupt_manifest_yields_empty_set() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("package.json"), "{ broken").unwrap();

    let registry = PackageRegistry::with_dir(dir.path());
    assert!(registry.list_installed_names().is_empty());
}

#[test]
fn test_lists_dependencies() {
    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), &[("lodash", "^4.17.21"), ("dayjs", "^1.11.13")]);

    let registry = PackageRegistry::with_dir(dir.path());
    let names: Vec<_> = registry.list_installed_names().into_iter().collect();
    assert_eq!(names, vec!["dayjs".to_string(), "lodash".to_string()]);
    assert!(registry.is_installed("lodash"));
    assert!(!registry.is_installed("left-pad"));
}

#[test]
fn test_reads_fresh_on_every_call() {
    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), &[("lodash", "^4.17.21")]);
    let registry = PackageRegistry::with_dir(dir.path());
    assert_eq!(registry.list_installed_names().len(), 1);

    write_manifest(dir.path(), &[("lodash", "^4.17.21"), ("uuid", "^11.0.5")]);
    assert_eq!(registry.list_installed_names().len(), 2);

    write_manifest(dir.path(), &[]);
    assert!(registry.list_installed_names().is_empty());
}

#[test]
fn test_resolve_on_disk() {
    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), &[("lodash", "^4.17.21"), ("@scope/tool", "1.0.0")]);
    write_package(dir.path(), "lodash", "4.17.21");
    write_package(dir.path(), "@scope/tool", "1.0.0");

    let registry = PackageRegistry::with_dir(dir.path());
    assert_eq!(
        registry.resolve_on_disk("lodash"),
        Some(dir.path().join("node_modules").join("lodash"))
    );
    assert!(registry.resolve_on_disk("@scope/tool").is_some());
    assert_eq!(registry.package_version("lodash").as_deref(), Some("4.17.21"));
    assert!(registry.resolve_on_disk("../lodash").is_none());
    assert!(registry.resolve_on_disk("dayjs").is_none());
}

#[test]
fn test_ensure_install_dir_creates_manifest_once() {
    let dir = TempDir::new().unwrap();
    let install = dir.path().join("npm_packages");
    let registry = PackageRegistry::with_dir(&install);

    let created = registry.ensure_install_dir().unwrap();
    assert_eq!(created, install);
    let manifest = PackageJson::read(&install.join("package.json")).unwrap();
    assert_eq!(manifest.private, Some(true));
    assert!(manifest.dependencies.is_empty());

    write_manifest(&install, &[("lodash", "^4.17.21")]);
    registry.ensure_install_dir().unwrap();
    assert!(registry.is_installed("lodash"));
}

#[test]
fn test_registry_from_config_override() {
    let data = TempDir::new().unwrap();
    let custom = data.path().join("custom-install");
    let mut config = RegistryConfig::with_data_dir(data.path());
    config.install_path = Some(custom.clone());
    config.save().unwrap();

    let registry = PackageRegistry::new(&RegistryConfig::load(data.path()));
    assert_eq!(registry.install_dir(), custom);
    assert_eq!(registry.node_modules_dir(), custom.join("node_modules"));
}
