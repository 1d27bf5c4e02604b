//! Package registry adapter for scratchpad.
//!
//! Answers two questions for the execution engine: which third-party
//! packages are installed, and where their files live on disk. The view is
//! read fresh from the install directory's `package.json` on every call so
//! installs and uninstalls performed out of band take effect immediately.

pub mod config;
pub mod error;
pub mod manifest;
pub mod registry;

pub use config::RegistryConfig;
pub use error::{RegistryError, RegistryResult};
pub use manifest::PackageJson;
pub use registry::{PackageRegistry, package_name_of};
