//! CommonJS loading of installed packages.

use crate::error::EngineError;
use dashmap::DashMap;
use oxc_resolver::{ResolveOptions, Resolver};
use rquickjs::{Ctx, Value};
use std::cell::RefCell;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// File contents read for module loading, shared by every run of an engine.
#[derive(Debug, Clone, Default)]
pub struct SourceCache {
    files: Arc<DashMap<PathBuf, Arc<str>>>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, path: &Path) -> io::Result<Arc<str>> {
        if let Some(source) = self.files.get(path) {
            return Ok(source.clone());
        }
        let source: Arc<str> = std::fs::read_to_string(path)?.into();
        self.files.insert(path.to_path_buf(), source.clone());
        trace!(path = %path.display(), "Cached module source");
        Ok(source)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Wrap a CommonJS file so evaluating it yields its module function.
pub fn wrap_commonjs(source: &str) -> String {
    let body = if source.starts_with("#!") {
        // Keep line numbers: drop only the shebang text.
        source.find('\n').map_or("", |i| &source[i..])
    } else {
        source
    };
    format!("(function (exports, require, module, __filename, __dirname) {{{body}\n}})")
}

pub struct PackageLoader {
    resolver: Resolver,
    bundled_dir: Option<PathBuf>,
    install_dir: PathBuf,
    /// Extra lookup roots, active while an install-dir load is running.
    extra_roots: RefCell<Vec<PathBuf>>,
    sources: SourceCache,
}

impl PackageLoader {
    pub fn new(install_dir: PathBuf, bundled_dir: Option<PathBuf>, sources: SourceCache) -> Self {
        let options = ResolveOptions {
            extensions: vec![
                ".js".to_string(),
                ".cjs".to_string(),
                ".mjs".to_string(),
                ".json".to_string(),
            ],
            main_fields: vec!["main".to_string()],
            condition_names: vec![
                "require".to_string(),
                "node".to_string(),
                "default".to_string(),
            ],
            ..Default::default()
        };
        Self {
            resolver: Resolver::new(options),
            bundled_dir,
            install_dir,
            extra_roots: RefCell::new(Vec::new()),
            sources,
        }
    }

    pub fn sources(&self) -> &SourceCache {
        &self.sources
    }

    /// Resolve `specifier` as seen from a file in `dir`, then from the extra roots.
    pub fn resolve_from(&self, dir: &Path, specifier: &str) -> Result<PathBuf, String> {
        if let Ok(resolution) = self.resolver.resolve(dir, specifier) {
            return Ok(resolution.into_path_buf());
        }
        for root in self.extra_roots.borrow().iter().rev() {
            if let Ok(resolution) = self.resolver.resolve(root, specifier) {
                return Ok(resolution.into_path_buf());
            }
        }
        Err(format!(
            "Cannot find module '{specifier}' from '{}'",
            dir.display()
        ))
    }

    /// Load an installed package: bundled copy first, then the install dir.
    ///
    /// `load_file` evaluates a resolved file and returns its exports or the
    /// error text. A `default` export is unwrapped.
    pub fn load<'js, F>(&self, ctx: &Ctx<'js>, specifier: &str, load_file: F) -> rquickjs::Result<Value<'js>>
    where
        F: Fn(&Path) -> Result<Value<'js>, String>,
    {
        // Installs may have changed since the last lookup.
        self.resolver.clear_cache();

        if let Some(bundled) = &self.bundled_dir {
            if let Ok(resolution) = self.resolver.resolve(bundled, specifier) {
                match load_file(resolution.path()) {
                    Ok(exports) => return unwrap_default(exports),
                    Err(reason) => {
                        debug!(module = specifier, %reason, "Bundled copy failed, trying install dir");
                    }
                }
            }
        }

        self.extra_roots.borrow_mut().push(self.install_dir.clone());
        let _restore = scopeguard::guard((), |_| {
            self.extra_roots.borrow_mut().pop();
        });

        let failed = |reason: String| {
            crate::ops::throw(
                ctx,
                EngineError::ModuleLoadFailed {
                    name: specifier.to_string(),
                    reason,
                },
            )
        };

        let path = self
            .resolver
            .resolve(&self.install_dir, specifier)
            .map_err(|e| failed(format!("Cannot find module '{specifier}': {e}")))?
            .into_path_buf();
        debug!(module = specifier, path = %path.display(), "Loading installed package");
        let exports = load_file(&path).map_err(failed)?;
        unwrap_default(exports)
    }
}

fn unwrap_default(exports: Value<'_>) -> rquickjs::Result<Value<'_>> {
    if let Some(obj) = exports.as_object() {
        if obj.contains_key("default")? {
            return obj.get("default");
        }
    }
    Ok(exports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn install(root: &Path, name: &str, main: &str, body: &str) {
        let dir = root.join("node_modules").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("package.json"),
            format!(r#"{{ "name": "{name}", "main": "{main}" }}"#),
        )
        .unwrap();
        fs::write(dir.join(main), body).unwrap();
    }

    #[test]
    fn test_wrap_commonjs_strips_shebang() {
        let wrapped = wrap_commonjs("#!/usr/bin/env node\nmodule.exports = 1;");
        assert!(wrapped.starts_with("(function (exports, require, module, __filename, __dirname) {\n"));
        assert!(!wrapped.contains("#!"));
        assert!(wrapped.ends_with("\n})"));
    }

    #[test]
    fn test_resolve_from_uses_main_and_extra_roots() {
        let dir = TempDir::new().unwrap();
        install(dir.path(), "dep", "lib.js", "module.exports = 1;");
        let loader = PackageLoader::new(dir.path().to_path_buf(), None, SourceCache::new());

        let found = loader.resolve_from(dir.path(), "dep").unwrap();
        assert!(found.ends_with("node_modules/dep/lib.js"));

        let elsewhere = TempDir::new().unwrap();
        assert!(loader.resolve_from(elsewhere.path(), "dep").is_err());

        loader.extra_roots.borrow_mut().push(dir.path().to_path_buf());
        assert!(loader.resolve_from(elsewhere.path(), "dep").is_ok());
    }

    #[test]
    fn test_source_cache_keeps_first_read() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.js");
        fs::write(&file, "one").unwrap();

        let cache = SourceCache::new();
        assert_eq!(&*cache.read(&file).unwrap(), "one");
        fs::write(&file, "two").unwrap();
        assert_eq!(&*cache.read(&file).unwrap(), "one");
        assert_eq!(cache.len(), 1);
        assert!(cache.read(&dir.path().join("missing.js")).is_err());
    }
}
