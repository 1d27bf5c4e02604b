//! The `require` gate: which module names guest code may load, and from where.
//!
//! A name is either one of the fixed builtins, or belongs to a package that
//! is installed right now. The installed set is re-read from the registry on
//! every check, so installs and uninstalls apply to the next `require`.

mod builtins;
mod loader;

pub use builtins::builtin_source;
pub use loader::{PackageLoader, SourceCache};

use crate::error::{EngineError, EngineResult};
use crate::format::format_caught;
use rquickjs::{CatchResultExt, Ctx, Function, Object, Value};
use scratchpad_pm::{PackageRegistry, package_name_of};
use std::path::Path;
use std::rc::Rc;
use tracing::debug;

/// Modules every run may `require`, with or without a `node:` prefix.
pub const BUILTIN_MODULES: [&str; 15] = [
    "fs",
    "path",
    "url",
    "querystring",
    "crypto",
    "util",
    "buffer",
    "stream",
    "events",
    "os",
    "assert",
    "zlib",
    "http",
    "https",
    "net",
];

/// Canonical builtin name for `name`, if it is one.
pub fn normalize_builtin(name: &str) -> Option<&'static str> {
    let bare = name.strip_prefix("node:").unwrap_or(name);
    BUILTIN_MODULES.iter().copied().find(|b| *b == bare)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleKind {
    Builtin(&'static str),
    /// Specifier of an installed package, possibly with a subpath.
    Package(String),
}

#[derive(Debug, Clone)]
pub struct ModuleGate {
    registry: PackageRegistry,
}

impl ModuleGate {
    pub fn new(registry: PackageRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PackageRegistry {
        &self.registry
    }

    /// Decide whether `name` may be loaded.
    pub fn classify(&self, name: &str) -> EngineResult<ModuleKind> {
        if let Some(builtin) = normalize_builtin(name) {
            return Ok(ModuleKind::Builtin(builtin));
        }

        let installed = self.registry.list_installed_names();
        let is_bare = !name.is_empty() && !name.starts_with('.') && !Path::new(name).is_absolute();
        if is_bare && installed.contains(package_name_of(name)) {
            debug!(module = name, "Installed package allowed");
            return Ok(ModuleKind::Package(name.to_string()));
        }

        let installed = if installed.is_empty() {
            "(none)".to_string()
        } else {
            installed.into_iter().collect::<Vec<_>>().join(", ")
        };
        Err(EngineError::ModuleNotAllowed {
            name: name.to_string(),
            installed,
            builtins: BUILTIN_MODULES.join(", "),
        })
    }
}

/// Register `gate`, `isBuiltin`, `builtinFactory`, `loadPackage`,
/// `resolveFrom`, `compileModule` and `readSource` on the host object.
pub(crate) fn register<'js>(
    ctx: &Ctx<'js>,
    host: &Object<'js>,
    gate: Rc<ModuleGate>,
    loader: Rc<PackageLoader>,
) -> rquickjs::Result<()> {
    host.set(
        "gate",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, name: String| -> rquickjs::Result<Object<'js>> {
            let kind = gate
                .classify(&name)
                .map_err(|e| crate::ops::throw(&ctx, e))?;
            let out = Object::new(ctx.clone())?;
            match kind {
                ModuleKind::Builtin(builtin) => {
                    out.set("kind", "builtin")?;
                    out.set("name", builtin)?;
                }
                ModuleKind::Package(specifier) => {
                    out.set("kind", "package")?;
                    out.set("name", specifier)?;
                }
            }
            Ok(out)
        })?,
    )?;

    host.set(
        "isBuiltin",
        Function::new(ctx.clone(), |name: String| normalize_builtin(&name))?,
    )?;

    host.set(
        "builtinFactory",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, name: String| -> rquickjs::Result<Function<'js>> {
            let source = builtin_source(&name)
                .ok_or_else(|| crate::ops::throw(&ctx, format!("No such builtin module: {name}")))?;
            ctx.eval(source)
        })?,
    )?;

    let packages = loader.clone();
    host.set(
        "loadPackage",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, specifier: String, load_file: Function<'js>| -> rquickjs::Result<Value<'js>> {
                packages.load(&ctx, &specifier, |path| {
                    load_file
                        .call::<_, Value>((path.to_string_lossy().into_owned(),))
                        .catch(&ctx)
                        .map_err(|e| format_caught(&ctx, e))
                })
            },
        )?,
    )?;

    let packages = loader.clone();
    host.set(
        "resolveFrom",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, dir: String, specifier: String| -> rquickjs::Result<String> {
            packages
                .resolve_from(Path::new(&dir), &specifier)
                .map(|p| p.to_string_lossy().into_owned())
                .map_err(|e| crate::ops::throw(&ctx, e))
        })?,
    )?;

    let packages = loader.clone();
    host.set(
        "compileModule",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, path: String| -> rquickjs::Result<Function<'js>> {
            let source = packages
                .sources()
                .read(Path::new(&path))
                .map_err(|e| crate::ops::throw(&ctx, format!("Cannot read {path}: {e}")))?;
            ctx.eval(loader::wrap_commonjs(&source))
        })?,
    )?;

    let packages = loader;
    host.set(
        "readSource",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, path: String| -> rquickjs::Result<String> {
            packages
                .sources()
                .read(Path::new(&path))
                .map(|s| s.to_string())
                .map_err(|e| crate::ops::throw(&ctx, format!("Cannot read {path}: {e}")))
        })?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn registry_with(deps: &[&str]) -> (TempDir, PackageRegistry) {
        let dir = TempDir::new().unwrap();
        let deps = deps
            .iter()
            .map(|d| format!("\"{d}\": \"^1.0.0\""))
            .collect::<Vec<_>>()
            .join(", ");
        fs::write(
            dir.path().join("package.json"),
            format!(r#"{{ "name": "scratchpad-packages", "dependencies": {{ {deps} }} }}"#),
        )
        .unwrap();
        let registry = PackageRegistry::with_dir(dir.path());
        (dir, registry)
    }

    #[test]
    fn test_builtins_with_and_without_prefix() {
        let gate = ModuleGate::new(PackageRegistry::with_dir("/nonexistent"));
        assert_eq!(gate.classify("fs").unwrap(), ModuleKind::Builtin("fs"));
        assert_eq!(gate.classify("node:http").unwrap(), ModuleKind::Builtin("http"));
        assert!(gate.classify("child_process").is_err());
    }

    #[test]
    fn test_installed_packages_and_subpaths() {
        let (_dir, registry) = registry_with(&["dayjs", "@scope/pkg"]);
        let gate = ModuleGate::new(registry);
        assert_eq!(
            gate.classify("dayjs").unwrap(),
            ModuleKind::Package("dayjs".into())
        );
        assert_eq!(
            gate.classify("dayjs/plugin/utc").unwrap(),
            ModuleKind::Package("dayjs/plugin/utc".into())
        );
        assert!(gate.classify("@scope/pkg/sub").is_ok());
        assert!(gate.classify("./dayjs").is_err());
    }

    #[test]
    fn test_not_allowed_lists_installed_and_builtins() {
        let (_dir, registry) = registry_with(&["dayjs", "lodash"]);
        let err = ModuleGate::new(registry).classify("left-pad").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("Installed modules: dayjs, lodash"), "{text}");
        assert!(text.contains("Builtin modules: fs, path, url"), "{text}");
    }

    #[test]
    fn test_installed_set_is_read_fresh() {
        let (dir, registry) = registry_with(&[]);
        let gate = ModuleGate::new(registry);
        let err = gate.classify("dayjs").unwrap_err().to_string();
        assert!(err.contains("Installed modules: (none)"));

        fs::write(
            dir.path().join("package.json"),
            r#"{ "dependencies": { "dayjs": "^1.11.0" } }"#,
        )
        .unwrap();
        assert!(gate.classify("dayjs").is_ok());
    }
}
