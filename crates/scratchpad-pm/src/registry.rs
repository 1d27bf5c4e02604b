//! Installed-package view over the install directory.

use crate::config::RegistryConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::PackageJson;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Read-only adapter over a package install directory.
///
/// Nothing is cached: every query re-reads `<install dir>/package.json`.
#[derive(Debug, Clone)]
pub struct PackageRegistry {
    install_dir: PathBuf,
}

impl PackageRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            install_dir: config.install_dir(),
        }
    }

    /// Registry over an explicit install directory.
    pub fn with_dir(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
        }
    }

    /// Registry configured from `npm-config.json` in the default data dir.
    pub fn from_default_config() -> Self {
        Self::new(&RegistryConfig::load(&RegistryConfig::default_data_dir()))
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn node_modules_dir(&self) -> PathBuf {
        self.install_dir.join("node_modules")
    }

    fn manifest_path(&self) -> PathBuf {
        self.install_dir.join("package.json")
    }

    /// Installed package names mapped to their declared version ranges.
    ///
    /// A missing or unreadable manifest yields an empty map.
    pub fn installed_packages(&self) -> BTreeMap<String, String> {
        let path = self.manifest_path();
        if !path.exists() {
            return BTreeMap::new();
        }
        match PackageJson::read(&path) {
            Ok(manifest) => manifest.dependencies,
            Err(e) => {
                debug!(error = %e, "Ignoring unreadable install manifest");
                BTreeMap::new()
            }
        }
    }

    /// Names of currently installed packages.
    pub fn list_installed_names(&self) -> BTreeSet<String> {
        self.installed_packages().into_keys().collect()
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.installed_packages().contains_key(name)
    }

    /// Directory of an installed package, if its files are present on disk.
    pub fn resolve_on_disk(&self, name: &str) -> Option<PathBuf> {
        if !is_valid_package_name(name) {
            return None;
        }
        let dir = self.node_modules_dir().join(name);
        dir.join("package.json").is_file().then_some(dir)
    }

    /// Version recorded in an installed package's own manifest.
    pub fn package_version(&self, name: &str) -> Option<String> {
        let dir = self.resolve_on_disk(name)?;
        PackageJson::read(&dir.join("package.json")).ok()?.version
    }

    /// Create the install directory with an empty manifest if it is missing.
    pub fn ensure_install_dir(&self) -> RegistryResult<PathBuf> {
        let manifest = self.manifest_path();
        if !self.install_dir.exists() {
            std::fs::create_dir_all(&self.install_dir)
                .map_err(|e| RegistryError::io(&self.install_dir, e))?;
            info!(dir = %self.install_dir.display(), "Created package install directory");
        }
        if !manifest.exists() {
            PackageJson::install_root().write(&manifest)?;
        }
        Ok(self.install_dir.clone())
    }
}

/// Package name portion of a module specifier.
///
/// `lodash/fp` → `lodash`, `@scope/pkg/sub` → `@scope/pkg`.
pub fn package_name_of(specifier: &str) -> &str {
    let mut parts = specifier.splitn(3, '/');
    let first = parts.next().unwrap_or_default();
    if first.starts_with('@') {
        match parts.next() {
            Some(second) if !second.is_empty() => &specifier[..first.len() + 1 + second.len()],
            _ => specifier,
        }
    } else {
        first
    }
}

fn is_valid_package_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('\\')
        && name.split('/').all(|segment| !segment.is_empty() && segment != "..")
        && package_name_of(name) == name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_name_of() {
        assert_eq!(package_name_of("lodash"), "lodash");
        assert_eq!(package_name_of("lodash/fp"), "lodash");
        assert_eq!(package_name_of("lodash/fp/map"), "lodash");
        assert_eq!(package_name_of("@scope/pkg"), "@scope/pkg");
        assert_eq!(package_name_of("@scope/pkg/sub/path"), "@scope/pkg");
        assert_eq!(package_name_of("@scope"), "@scope");
    }

    #[test]
    fn test_valid_package_names() {
        assert!(is_valid_package_name("lodash"));
        assert!(is_valid_package_name("@types/node"));
        assert!(!is_valid_package_name("../etc"));
        assert!(!is_valid_package_name("lodash/fp"));
        assert!(!is_valid_package_name(""));
        assert!(!is_valid_package_name("@scope/.."));
    }
}
