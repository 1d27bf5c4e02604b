//! `npm-config.json` handling.
//!
//! The package manager stores a single override in the application data
//! directory: where packages get installed. When the override is absent the
//! install directory is `<data dir>/npm_packages`.

use crate::error::{RegistryError, RegistryResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// File name of the package manager config inside the data directory.
pub const CONFIG_FILE_NAME: &str = "npm-config.json";

/// Directory name used when no install path override is configured.
pub const DEFAULT_INSTALL_DIR_NAME: &str = "npm_packages";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Custom install directory chosen by the user.
    #[serde(rename = "installPath", default)]
    pub install_path: Option<PathBuf>,

    /// Directory holding `npm-config.json` and the default install dir.
    #[serde(skip)]
    pub data_dir: PathBuf,
}

impl RegistryConfig {
    /// Config rooted at an explicit data directory with no override.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_path: None,
            data_dir: data_dir.into(),
        }
    }

    /// Default application data directory (`<platform data dir>/scratchpad`).
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scratchpad")
    }

    /// Load `npm-config.json` from `data_dir`.
    ///
    /// A missing file is not an error. An unreadable or malformed file is
    /// logged and treated as "no override", matching how the package manager
    /// itself falls back.
    pub fn load(data_dir: &Path) -> Self {
        match Self::try_load(data_dir) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Failed to load package manager config");
                Self::with_data_dir(data_dir)
            }
        }
    }

    /// Strict variant of [`RegistryConfig::load`].
    pub fn try_load(data_dir: &Path) -> RegistryResult<Self> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::with_data_dir(data_dir));
        }

        let content =
            std::fs::read_to_string(&path).map_err(|e| RegistryError::io(&path, e))?;
        let mut config: RegistryConfig =
            serde_json::from_str(&content).map_err(|e| RegistryError::parse(&path, e))?;
        config.data_dir = data_dir.to_path_buf();

        if let Some(install_path) = &config.install_path {
            if install_path.as_os_str().is_empty() {
                config.install_path = None;
            } else if install_path.is_relative() {
                return Err(RegistryError::Config(format!(
                    "installPath must be absolute, got {}",
                    install_path.display()
                )));
            }
        }

        Ok(config)
    }

    /// Persist this config as `npm-config.json`.
    pub fn save(&self) -> RegistryResult<()> {
        std::fs::create_dir_all(&self.data_dir).map_err(|e| RegistryError::io(&self.data_dir, e))?;
        let path = self.data_dir.join(CONFIG_FILE_NAME);
        let json = serde_json::to_string_pretty(self).map_err(|e| RegistryError::parse(&path, e))?;
        std::fs::write(&path, json).map_err(|e| RegistryError::io(&path, e))
    }

    /// The effective install directory.
    pub fn install_dir(&self) -> PathBuf {
        match &self.install_path {
            Some(path) => path.clone(),
            None => self.data_dir.join(DEFAULT_INSTALL_DIR_NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_install_dir() {
        let config = RegistryConfig::with_data_dir("/data/scratchpad");
        assert_eq!(
            config.install_dir(),
            PathBuf::from("/data/scratchpad/npm_packages")
        );
    }

    #[test]
    fn test_missing_config_file() {
        let dir = TempDir::new().unwrap();
        let config = RegistryConfig::try_load(dir.path()).unwrap();
        assert!(config.install_path.is_none());
        assert_eq!(config.data_dir, dir.path());
    }

    #[test]
    fn test_install_path_override() {
        let dir = TempDir::new().unwrap();
        let custom = dir.path().join("custom");
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            format!(r#"{{ "installPath": {} }}"#, serde_json::to_string(&custom).unwrap()),
        )
        .unwrap();

        let config = RegistryConfig::load(dir.path());
        assert_eq!(config.install_dir(), custom);
    }

    #[test]
    fn test_null_install_path() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), r#"{ "installPath": null }"#).unwrap();

        let config = RegistryConfig::load(dir.path());
        assert_eq!(config.install_dir(), dir.path().join(DEFAULT_INSTALL_DIR_NAME));
    }

    #[test]
    fn test_malformed_config_falls_back() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{ not json").unwrap();

        assert!(RegistryConfig::try_load(dir.path()).is_err());
        let config = RegistryConfig::load(dir.path());
        assert!(config.install_path.is_none());
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut config = RegistryConfig::with_data_dir(dir.path());
        config.install_path = Some(dir.path().join("elsewhere"));
        config.save().unwrap();

        let content = std::fs::read_to_string(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert!(content.contains("installPath"));
        assert_eq!(RegistryConfig::load(dir.path()), config);
    }
}
