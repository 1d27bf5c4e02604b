//! Packages command - inspect the install directory.

use anyhow::Result;
use clap::{Args, Subcommand};
use scratchpad_pm::PackageRegistry;
use serde::Serialize;

use super::Output;
use crate::config::Config;

#[derive(Args)]
pub struct PackagesCommand {
    #[command(subcommand)]
    pub action: PackagesAction,
}

#[derive(Subcommand)]
pub enum PackagesAction {
    /// List installed packages
    List,
    /// Print the install directory
    Dir,
    /// Create the install directory and its manifest
    Init,
}

#[derive(Debug, Serialize)]
struct InstalledPackage {
    name: String,
    range: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

impl PackagesCommand {
    pub fn run(&self, config: &Config, output: Output) -> Result<bool> {
        let registry = config.packages.registry();
        match self.action {
            PackagesAction::List => list(&registry, output)?,
            PackagesAction::Dir => {
                let dir = registry.install_dir();
                if output.json {
                    output.print_json(&serde_json::json!({ "installDir": dir }))?;
                } else {
                    println!("{}", dir.display());
                }
            }
            PackagesAction::Init => {
                let dir = registry.ensure_install_dir()?;
                println!("Package directory ready: {}", dir.display());
            }
        }
        Ok(true)
    }
}

fn installed(registry: &PackageRegistry) -> Vec<InstalledPackage> {
    registry
        .installed_packages()
        .into_iter()
        .map(|(name, range)| InstalledPackage {
            version: registry.package_version(&name),
            name,
            range,
        })
        .collect()
}

fn list(registry: &PackageRegistry, output: Output) -> Result<()> {
    let packages = installed(registry);
    if output.json {
        return output.print_json(&packages);
    }
    if packages.is_empty() {
        println!("No packages installed in {}", registry.install_dir().display());
        return Ok(());
    }
    for package in &packages {
        match &package.version {
            Some(version) => println!("{}@{} ({})", package.name, version, package.range),
            None => println!("{} ({}, not on disk)", package.name, package.range),
        }
    }
    Ok(())
}
