//! `scratchpad.toml` loading.
//!
//! The file is looked up from the current directory upwards, then in the
//! user config directory. Values in the file are defaults; command line
//! flags override them.

use anyhow::{Context, Result};
use scratchpad_pm::{PackageRegistry, RegistryConfig};
use scratchpad_runtime::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAMES: [&str; 2] = ["scratchpad.toml", ".scratchpadrc.toml"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub packages: PackagesConfig,
}

/// Where installed packages live.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    /// Install directory, bypassing `npm-config.json`.
    pub install_dir: Option<PathBuf>,

    /// Data directory holding `npm-config.json`.
    pub data_dir: Option<PathBuf>,
}

impl PackagesConfig {
    pub fn registry(&self) -> PackageRegistry {
        if let Some(dir) = &self.install_dir {
            return PackageRegistry::with_dir(dir);
        }
        let data_dir = self
            .data_dir
            .clone()
            .unwrap_or_else(RegistryConfig::default_data_dir);
        PackageRegistry::new(&RegistryConfig::load(&data_dir))
    }
}

/// Load the config from `explicit`, or search for one. No file means defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => std::env::current_dir()
            .ok()
            .and_then(|cwd| find_config(&cwd))
            .or_else(user_config),
    };

    let Some(path) = path else {
        return Ok(Config::default());
    };
    tracing::debug!(path = %path.display(), "Loading config");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_config(&text).with_context(|| format!("Invalid config in {}", path.display()))
}

pub fn parse_config(text: &str) -> Result<Config> {
    Ok(toml::from_str(text)?)
}

fn find_config(start: &Path) -> Option<PathBuf> {
    start.ancestors().find_map(|dir| {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

fn user_config() -> Option<PathBuf> {
    let path = dirs::config_dir()?.join("scratchpad").join(CONFIG_FILE_NAMES[0]);
    path.is_file().then_some(path)
}
