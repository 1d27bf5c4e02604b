//! `package.json` model shared by the install directory manifest and the
//! manifests of installed packages.

use crate::error::{RegistryError, RegistryResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub dependencies: BTreeMap<String, String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl PackageJson {
    /// Manifest written into a freshly created install directory.
    pub fn install_root() -> Self {
        Self {
            name: Some("scratchpad-packages".to_string()),
            version: Some("1.0.0".to_string()),
            description: Some("Scratchpad installed packages".to_string()),
            private: Some(true),
            main: None,
            dependencies: BTreeMap::new(),
        }
    }

    pub fn read(path: &Path) -> RegistryResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RegistryError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| RegistryError::parse(path, e))
    }

    pub fn write(&self, path: &Path) -> RegistryResult<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| RegistryError::parse(path, e))?;
        std::fs::write(path, json).map_err(|e| RegistryError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_json_parse() {
        let json = r#"{
            "name": "scratchpad-packages",
            "version": "1.0.0",
            "private": true,
            "dependencies": {
                "lodash": "^4.17.21",
                "dayjs": "^1.11.13"
            }
        }"#;

        let pkg: PackageJson = serde_json::from_str(json).unwrap();
        assert_eq!(pkg.name.as_deref(), Some("scratchpad-packages"));
        assert_eq!(pkg.dependencies.len(), 2);
        assert_eq!(pkg.dependencies["lodash"], "^4.17.21");
    }

    #[test]
    fn test_missing_dependencies_is_empty() {
        let pkg: PackageJson = serde_json::from_str(r#"{ "name": "x" }"#).unwrap();
        assert!(pkg.dependencies.is_empty());
    }

    #[test]
    fn test_null_dependencies_is_empty() {
        let pkg: PackageJson = serde_json::from_str(r#"{ "dependencies": null }"#).unwrap();
        assert!(pkg.dependencies.is_empty());
    }

    #[test]
    fn test_install_root_shape() {
        let json = serde_json::to_value(PackageJson::install_root()).unwrap();
        assert_eq!(json["private"], true);
        assert!(json["dependencies"].as_object().unwrap().is_empty());
        assert!(json.get("main").is_none());
    }
}
