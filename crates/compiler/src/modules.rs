//! Compiled-module cache
//!
//! The module loader (out of scope here) parses and name-resolves every
//! imported file and deposits the result in this cache before code
//! generation starts. The generator consumes modules read-only: the
//! orchestrator walks import statements, looks modules up by absolute path,
//! and emits each one's functions, globals, and guarded init exactly once.

use crate::ast::Stmt;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

/// One exported binding of a module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleExport {
    /// The C identifier the export lowers to: a global name for values,
    /// a function name for functions.
    pub mangled: String,
    pub is_function: bool,
    pub arity: usize,
    pub has_rest: bool,
}

/// A binding created by an import statement inside a module.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportBinding {
    /// The name as exported by the source module
    pub original: String,
    /// Prefix of the module the binding comes from
    pub prefix: String,
    pub is_function: bool,
    pub arity: usize,
    pub is_extern: bool,
}

/// A parsed, name-resolved module as produced by the loader.
#[derive(Debug, Clone, Default)]
pub struct CompiledModule {
    /// Unique C-identifier prefix, e.g. `"m1_"`. All of the module's
    /// top-level names mangle to `<prefix><name>`.
    pub prefix: String,
    pub path: PathBuf,
    pub statements: Vec<Stmt>,
    pub exports: HashMap<String, ModuleExport>,
    /// Names declared `extern fn` in this module
    pub extern_fns: HashSet<String>,
    /// Local import bindings of this module
    pub imports: HashMap<String, ImportBinding>,
}

impl CompiledModule {
    pub fn new(prefix: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        CompiledModule {
            prefix: prefix.into(),
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Cache of compiled modules keyed by absolute path.
#[derive(Debug, Default)]
pub struct ModuleCache {
    modules: HashMap<PathBuf, CompiledModule>,
}

impl ModuleCache {
    pub fn new() -> Self {
        ModuleCache::default()
    }

    /// Resolve a relative import path against the importing file's
    /// directory. Purely lexical: `.` and `..` components are folded
    /// without touching the filesystem, so cache keys stay stable even
    /// for modules that only exist in tests.
    pub fn resolve_path(&self, cwd: &Path, rel: &str) -> PathBuf {
        let joined = cwd.join(rel);
        let mut out = PathBuf::new();
        for comp in joined.components() {
            match comp {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !out.pop() {
                        out.push("..");
                    }
                }
                other => out.push(other.as_os_str()),
            }
        }
        out
    }

    pub fn insert(&mut self, module: CompiledModule) {
        self.modules.insert(module.path.clone(), module);
    }

    pub fn get_cached(&self, abs: &Path) -> Option<&CompiledModule> {
        self.modules.get(abs)
    }

    pub fn find_export<'a>(
        &self,
        module: &'a CompiledModule,
        name: &str,
    ) -> Option<&'a ModuleExport> {
        module.exports.get(name)
    }

    pub fn is_extern_fn(&self, module: &CompiledModule, name: &str) -> bool {
        module.extern_fns.contains(name)
    }

    pub fn find_import<'a>(
        &self,
        module: &'a CompiledModule,
        local: &str,
    ) -> Option<&'a ImportBinding> {
        module.imports.get(local)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path_folds_dots() {
        let cache = ModuleCache::new();
        let abs = cache.resolve_path(Path::new("/proj/src"), "./util/../lib/m.hml");
        assert_eq!(abs, PathBuf::from("/proj/src/lib/m.hml"));
    }

    #[test]
    fn test_resolve_path_parent() {
        let cache = ModuleCache::new();
        let abs = cache.resolve_path(Path::new("/proj/src"), "../shared/m.hml");
        assert_eq!(abs, PathBuf::from("/proj/shared/m.hml"));
    }

    #[test]
    fn test_cache_roundtrip() {
        let mut cache = ModuleCache::new();
        let mut module = CompiledModule::new("m1_", "/proj/m.hml");
        module.exports.insert(
            "helper".to_string(),
            ModuleExport {
                mangled: "hml_fn_m1_helper".to_string(),
                is_function: true,
                arity: 2,
                has_rest: false,
            },
        );
        cache.insert(module);

        let found = cache.get_cached(Path::new("/proj/m.hml")).unwrap();
        let export = cache.find_export(found, "helper").unwrap();
        assert!(export.is_function);
        assert_eq!(export.arity, 2);
        assert!(cache.find_export(found, "missing").is_none());
    }

    #[test]
    fn test_resolve_against_real_directories() {
        // The lexical resolver must agree with the filesystem for paths
        // that actually exist.
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("src");
        std::fs::create_dir(&sub).unwrap();
        let target = dir.path().join("m.hml");
        std::fs::write(&target, "").unwrap();

        let cache = ModuleCache::new();
        let abs = cache.resolve_path(&sub, "../m.hml");
        assert_eq!(abs, target);
        assert!(abs.exists());
    }
}
