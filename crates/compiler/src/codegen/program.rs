//! Program orchestration
//!
//! The fixed multi-pass schedule: compile imported modules (depth first),
//! pre-pass the main scope so forward references resolve, emit module
//! functions and guarded inits, emit named functions, emit the main body,
//! drain the closure list, then assemble every buffer in the fixed section
//! order. Nothing is written to the final string until assembly.

use crate::ast::{Expr, ExternFn, Param, Program, Stmt, StmtKind, TypeDef};
use crate::modules::{CompiledModule, ModuleCache};

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::error::CodeGenError;
use super::runtime::{HEADER_PROLOGUE, SIGNAL_CONSTANTS, escape_c_string};
use super::state::{
    CodegenContext, LocalEntry, MainImport, ModuleScope, Sink, Storage, TopVar, sanitize_ident,
};

/// Signature metadata recorded for forward declarations.
#[derive(Debug, Clone)]
struct FnMeta {
    c_name: String,
    params: Vec<Param>,
    has_rest: bool,
}

/// Everything remembered about an emitted module for assembly.
#[derive(Debug, Clone)]
struct ModuleMeta {
    init_name: String,
    globals: Vec<String>,
    fns: Vec<FnMeta>,
}

impl CodegenContext {
    /// Generate the complete C translation unit for a program.
    pub fn run(
        &mut self,
        program: &Program,
        cache: &ModuleCache,
        main_dir: &Path,
    ) -> Result<String, CodeGenError> {
        // Pass 1: the module cache is already populated by the loader; the
        // recursion below visits it in import order.

        // Pass 2: main-scope pre-pass, so forward references resolve.
        let mut extern_fns = Vec::new();
        let mut type_defs = Vec::new();
        self.prepass_main(program, cache, main_dir, &mut extern_fns, &mut type_defs);

        // Pass 3: module functions and guarded inits, depth first.
        let mut emitted = HashSet::new();
        let mut module_metas = Vec::new();
        let mut module_inits_called = Vec::new();
        self.emit_modules(
            &program.statements,
            cache,
            main_dir,
            &mut emitted,
            &mut module_metas,
            &mut module_inits_called,
            &mut extern_fns,
        )?;

        // Pass 4: named functions.
        let mut named_fns = Vec::new();
        self.sink = Sink::Functions;
        for stmt in &program.statements {
            if let StmtKind::Function { name, func } = &stmt.kind {
                let c_name = format!("hml_fn_{}", sanitize_ident(name));
                named_fns.push(FnMeta {
                    c_name: c_name.clone(),
                    params: func.params.clone(),
                    has_rest: func.rest.is_some(),
                });
                self.emit_named_function(&c_name, name, func)?;
            }
        }

        // Pass 5: main body.
        self.emit_main_body(program, cache, main_dir, &module_inits_called, &type_defs, &extern_fns)?;

        // Pass 6: closure implementations until the list is stable.
        self.emit_pending_closures()?;

        if !self.diagnostics.is_empty() {
            let joined: Vec<String> = self.diagnostics.iter().map(|d| d.to_string()).collect();
            return Err(CodeGenError::Logic(joined.join("\n")));
        }

        // Pass 7: assembly.
        self.assemble(&module_metas, &named_fns, &extern_fns)
    }

    // =========================================================================
    // Modules
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    fn emit_modules(
        &mut self,
        statements: &[Stmt],
        cache: &ModuleCache,
        cwd: &Path,
        emitted: &mut HashSet<PathBuf>,
        metas: &mut Vec<ModuleMeta>,
        inits_called: &mut Vec<String>,
        extern_fns: &mut Vec<ExternFn>,
    ) -> Result<(), CodeGenError> {
        for stmt in statements {
            let StmtKind::Import { path, .. } = &stmt.kind else {
                continue;
            };
            let abs = cache.resolve_path(cwd, path);
            if emitted.contains(&abs) {
                continue;
            }
            let Some(module) = cache.get_cached(&abs) else {
                self.error(stmt.line, format!("module not in cache: {}", path));
                continue;
            };
            emitted.insert(abs.clone());
            let module = module.clone();
            let module_dir = module.path.parent().map(Path::to_path_buf).unwrap_or_default();

            // Dependencies first, so their inits exist before ours runs.
            self.emit_modules(
                &module.statements,
                cache,
                &module_dir,
                emitted,
                metas,
                inits_called,
                extern_fns,
            )?;

            let meta = self.emit_one_module(&module, cache, &module_dir, extern_fns)?;
            inits_called.push(meta.init_name.clone());
            metas.push(meta);
        }
        Ok(())
    }

    fn emit_one_module(
        &mut self,
        module: &CompiledModule,
        cache: &ModuleCache,
        module_dir: &Path,
        extern_fns: &mut Vec<ExternFn>,
    ) -> Result<ModuleMeta, CodeGenError> {
        let scope = build_module_scope(module);
        collect_extern_fns(&module.statements, extern_fns);

        let mut meta = ModuleMeta {
            init_name: format!("_mod_init_{}", sanitize_ident(&module.prefix)),
            globals: Vec::new(),
            fns: Vec::new(),
        };
        for name in &scope.var_order {
            if !scope.vars[name].is_function {
                meta.globals.push(format!("{}{}", module.prefix, sanitize_ident(name)));
            }
        }

        // Module functions.
        self.sink = Sink::ModuleFns;
        self.current_module = Some(scope.clone());
        for stmt in &module.statements {
            let inner = export_inner(stmt);
            if let StmtKind::Function { name, func } = &inner.kind {
                let c_name = format!("hml_fn_{}{}", module.prefix, sanitize_ident(name));
                meta.fns.push(FnMeta {
                    c_name: c_name.clone(),
                    params: func.params.clone(),
                    has_rest: func.rest.is_some(),
                });
                self.current_module = Some(scope.clone());
                self.emit_named_function(&c_name, name, func)?;
            }
        }

        // Module init: guarded, imported inits first, then the top-level
        // statements assigning each global.
        self.sink = Sink::ModuleInits;
        self.current_module = Some(scope.clone());
        self.begin_function_scope(&format!("{}init", module.prefix));
        self.open_block(&format!("static void {}(void)", meta.init_name));
        self.emit("static int _done = 0;");
        self.emit("if (_done) return;");
        self.emit("_done = 1;");
        for stmt in &module.statements {
            if let StmtKind::Import { path, .. } = &export_inner(stmt).kind {
                let abs = cache.resolve_path(module_dir, path);
                if let Some(dep) = cache.get_cached(&abs) {
                    self.emit(&format!("_mod_init_{}();", sanitize_ident(&dep.prefix)));
                }
            }
        }
        self.setup_shared_env(&[], None, &module.statements);
        for stmt in &module.statements {
            self.lower_top_stmt(stmt, true)?;
        }
        self.pop_locals_to(0);
        self.close_block();
        self.emit_blank();

        self.current_module = None;
        self.begin_function_scope("main");
        Ok(meta)
    }

    // =========================================================================
    // Main pre-pass
    // =========================================================================

    fn prepass_main(
        &mut self,
        program: &Program,
        cache: &ModuleCache,
        main_dir: &Path,
        extern_fns: &mut Vec<ExternFn>,
        type_defs: &mut Vec<TypeDef>,
    ) {
        // The built-in args array is a main global like any other const.
        self.add_main_var("args", true, usize::MAX);

        for (i, stmt) in program.statements.iter().enumerate() {
            match &export_inner(stmt).kind {
                StmtKind::Let { name, mutable, .. } => {
                    self.add_main_var(name, !mutable, i);
                }
                StmtKind::Enum { name, .. } => {
                    self.add_main_var(name, true, i);
                }
                StmtKind::Function { name, func } => {
                    let ref_mask = func.params.iter().map(|p| p.by_ref).collect();
                    self.add_main_func(name, func.params.len(), func.rest.is_some(), ref_mask, i);
                }
                StmtKind::Import {
                    names,
                    path,
                    namespace,
                } => {
                    let abs = cache.resolve_path(main_dir, path);
                    let Some(module) = cache.get_cached(&abs) else {
                        self.error(stmt.line, format!("module not in cache: {}", path));
                        continue;
                    };
                    for (original, alias) in names {
                        let Some(export) = cache.find_export(module, original) else {
                            self.error(
                                stmt.line,
                                format!("module '{}' has no export '{}'", path, original),
                            );
                            continue;
                        };
                        self.add_main_import(
                            alias,
                            MainImport {
                                original: original.clone(),
                                prefix: module.prefix.clone(),
                                is_function: export.is_function,
                                arity: export.arity,
                                has_rest: export.has_rest,
                                is_extern: cache.is_extern_fn(module, original),
                            },
                        );
                    }
                    if let Some(ns) = namespace {
                        self.add_main_var(ns, true, i);
                    }
                }
                StmtKind::TypeDef(def) => type_defs.push(def.clone()),
                _ => {}
            }
        }
        // Extern declarations may sit inside nested blocks; all of them
        // share the unprefixed hml_fn_ namespace.
        collect_extern_fns(&program.statements, extern_fns);
        for e in extern_fns.iter() {
            let arity = e.params.len();
            self.add_main_func(&e.name, arity, false, vec![false; arity], usize::MAX);
        }
    }

    // =========================================================================
    // Main body
    // =========================================================================

    fn emit_main_body(
        &mut self,
        program: &Program,
        cache: &ModuleCache,
        main_dir: &Path,
        inits: &[String],
        type_defs: &[TypeDef],
        extern_fns: &[ExternFn],
    ) -> Result<(), CodeGenError> {
        self.sink = Sink::Main;
        self.begin_function_scope("main");
        self.open_block("int main(int argc, char** argv)");
        self.emit("hml_runtime_init(argc, argv);");
        if self.options.sandbox.enabled {
            let root = match &self.options.sandbox.root {
                Some(p) => format!("\"{}\"", escape_c_string(&p.to_string_lossy())),
                None => "NULL".to_string(),
            };
            let bits = self.options.sandbox.flag_bits();
            self.emit(&format!("hml_sandbox_init({}, {});", bits, root));
        }

        // Every main global starts as a proper null value.
        let order = self.main_var_order.clone();
        for name in &order {
            if self.main_vars[name].is_function {
                continue;
            }
            if self.types_native_main(name).is_none() {
                self.emit(&format!("_main_{} = hml_val_null();", sanitize_ident(name)));
            }
        }
        self.emit("_main_args = hml_args_create(argc, argv);");

        for init in inits {
            self.emit(&format!("{}();", init));
        }

        for def in type_defs {
            let spec: Vec<String> = def
                .fields
                .iter()
                .map(|(f, ty)| format!("{}:{}", f, ty))
                .collect();
            self.emit(&format!(
                "hml_register_object_type(\"{}\", \"{}\");",
                escape_c_string(&def.name),
                escape_c_string(&spec.join(","))
            ));
        }
        // Struct types referenced by extern signatures register with the
        // FFI layer as well.
        for def in type_defs {
            let referenced = extern_fns.iter().any(|e| {
                e.ret == def.name || e.params.iter().any(|p| p == &def.name)
            });
            if referenced {
                let spec: Vec<String> = def
                    .fields
                    .iter()
                    .map(|(f, ty)| format!("{}:{}", f, ty))
                    .collect();
                self.emit(&format!(
                    "hml_ffi_register_struct(\"{}\", \"{}\");",
                    escape_c_string(&def.name),
                    escape_c_string(&spec.join(","))
                ));
            }
        }

        self.setup_shared_env(&[], None, &program.statements);
        for stmt in &program.statements {
            self.lower_top_stmt_main(stmt, cache, main_dir)?;
        }

        self.emit("hml_runtime_cleanup();");
        self.emit("return 0;");
        self.close_block();
        Ok(())
    }

    fn types_native_main(&self, name: &str) -> Option<crate::types::NativeType> {
        if !self.options.native_arith_enabled() {
            return None;
        }
        self.types.as_ref()?.lookup("main", name)
    }

    /// Top-level statement inside the main body.
    fn lower_top_stmt_main(
        &mut self,
        stmt: &Stmt,
        cache: &ModuleCache,
        main_dir: &Path,
    ) -> Result<(), CodeGenError> {
        if let StmtKind::Import {
            namespace: Some(ns),
            path,
            ..
        } = &export_inner(stmt).kind
        {
            // A namespace import materializes one object holding every
            // export of the module.
            let abs = cache.resolve_path(main_dir, path);
            let Some(module) = cache.get_cached(&abs) else {
                return Ok(()); // already diagnosed in the pre-pass
            };
            let module = module.clone();
            let g = format!("_main_{}", sanitize_ident(ns));
            self.emit(&format!("hml_release_if_needed({});", g));
            self.emit(&format!("{} = hml_val_object();", g));
            let mut exports: Vec<_> = module.exports.iter().collect();
            exports.sort_by(|a, b| a.0.cmp(b.0));
            for (name, export) in exports {
                if export.is_function {
                    let t = self.fresh_temp();
                    self.emit(&format!(
                        "HmlValue {} = hml_val_function_rest((HmlFn){}_wrapper, {}, {});",
                        t,
                        export.mangled,
                        export.arity,
                        if export.has_rest { 1 } else { 0 }
                    ));
                    self.emit(&format!(
                        "hml_object_set({}, \"{}\", {});",
                        g,
                        escape_c_string(name),
                        t
                    ));
                    self.release_if_needed(&t);
                } else {
                    self.emit(&format!(
                        "hml_object_set({}, \"{}\", {});",
                        g,
                        escape_c_string(name),
                        export.mangled
                    ));
                }
            }
            return Ok(());
        }
        self.lower_top_stmt(stmt, false)
    }

    /// Shared top-level lowering for the main body and module inits:
    /// `let`/`enum` assign their global storage, functions and imports were
    /// handled by earlier passes, everything else lowers normally.
    fn lower_top_stmt(&mut self, stmt: &Stmt, in_module: bool) -> Result<(), CodeGenError> {
        let line = stmt.line;
        let storage = if in_module {
            Storage::ModuleGlobal
        } else {
            Storage::MainGlobal
        };
        match &export_inner(stmt).kind {
            StmtKind::Let { name, ty, init, .. } => {
                // Unboxable top-level variables assign their raw static.
                if !in_module
                    && let Some(native) = self.types_native_main(name)
                {
                    let c_name = format!("_main_{}", sanitize_ident(name));
                    let raw = match init {
                        Expr::IntLit(n) if native.is_integer() => n.to_string(),
                        Expr::FloatLit(f) if !native.is_integer() => format!("{:?}", f),
                        _ => {
                            let t = self.lower_expr(init, line)?;
                            let raw = format!("{}({})", native.accessor(), t);
                            self.release_if_needed(&t);
                            raw
                        }
                    };
                    self.emit(&format!("{} = {};", c_name, raw));
                    self.locals.push(LocalEntry {
                        name: name.clone(),
                        c_name,
                        storage: Storage::Native(native),
                        declared_in_loop: false,
                    });
                    return Ok(());
                }

                let c_name = self.add_local(name, storage);
                if matches!(init, Expr::Function(_)) {
                    self.pending_self = Some(name.clone());
                    let t = self.lower_expr(init, line)?;
                    self.pending_self = None;
                    self.emit(&format!("hml_release_if_needed({});", c_name));
                    self.emit(&format!("{} = {};", c_name, t));
                    self.emit_env_write_through(name, &c_name);
                    self.patch_self_reference(name, &c_name);
                } else {
                    let mut t = self.lower_expr(init, line)?;
                    t = self.apply_type_annotation(t, ty.as_ref());
                    self.emit(&format!("hml_release_if_needed({});", c_name));
                    self.emit(&format!("{} = {};", c_name, t));
                    self.emit_env_write_through(name, &c_name);
                    self.last_closure = None;
                }
                Ok(())
            }
            StmtKind::Enum { name, members } => {
                let t = self.lower_enum_value(members, line)?;
                let c_name = self.add_local(name, storage);
                self.emit(&format!("hml_release_if_needed({});", c_name));
                self.emit(&format!("{} = {};", c_name, t));
                self.emit_env_write_through(name, &c_name);
                Ok(())
            }
            StmtKind::Function { .. }
            | StmtKind::Import { .. }
            | StmtKind::ExternFn(_)
            | StmtKind::TypeDef(_) => Ok(()),
            _ => self.lower_stmt(stmt),
        }
    }

    // =========================================================================
    // Assembly
    // =========================================================================

    fn assemble(
        &mut self,
        modules: &[ModuleMeta],
        named_fns: &[FnMeta],
        extern_fns: &[ExternFn],
    ) -> Result<String, CodeGenError> {
        // Extern wrappers emit last-minute into their own buffer; do it
        // before concatenation so temp numbering stays inside this unit.
        let extern_wrappers = self.emit_extern_wrappers(extern_fns)?;

        let mut out = String::new();
        out.push_str(HEADER_PROLOGUE);
        writeln!(out)?;

        for (name, num) in SIGNAL_CONSTANTS {
            writeln!(out, "#define {} {}", name, num)?;
        }
        writeln!(out)?;

        if !extern_fns.is_empty() {
            writeln!(out, "static void* _ffi_lib_handle = NULL;")?;
            for e in extern_fns {
                writeln!(out, "static void* _ffi_fn_{} = NULL;", sanitize_ident(&e.name))?;
            }
            writeln!(out)?;
        }

        // Static globals: one per main-file const/let/enum/namespace
        // import, plus the built-in args.
        let order = self.main_var_order.clone();
        for name in &order {
            if self.main_vars[name].is_function {
                continue;
            }
            match self.types_native_main(name) {
                Some(native) => {
                    writeln!(out, "static {} _main_{};", native.c_type(), sanitize_ident(name))?
                }
                None => writeln!(out, "static HmlValue _main_{};", sanitize_ident(name))?,
            }
        }
        writeln!(out)?;

        // Closure forward declarations.
        for info in &self.closures {
            let params: Vec<Param> = info.params.clone();
            writeln!(out, "{};", decl_signature(&info.c_name, &params, info.rest.is_some()))?;
            writeln!(
                out,
                "static HmlValue {}_wrapper(HmlValue*, int, HmlEnv*);",
                info.c_name
            )?;
        }
        if !self.closures.is_empty() {
            writeln!(out)?;
        }

        // Module global storage.
        for module in modules {
            for global in &module.globals {
                writeln!(out, "static HmlValue {};", global)?;
            }
        }

        // Module function forward declarations.
        for module in modules {
            for f in &module.fns {
                writeln!(out, "{};", decl_signature(&f.c_name, &f.params, f.has_rest))?;
                writeln!(
                    out,
                    "static HmlValue {}_wrapper(HmlValue*, int, HmlEnv*);",
                    f.c_name
                )?;
            }
        }

        // Module init forward declarations.
        for module in modules {
            writeln!(out, "static void {}(void);", module.init_name)?;
        }
        if !modules.is_empty() {
            writeln!(out)?;
        }

        // Named-function forward declarations.
        for f in named_fns {
            writeln!(out, "{};", decl_signature(&f.c_name, &f.params, f.has_rest))?;
            writeln!(
                out,
                "static HmlValue {}_wrapper(HmlValue*, int, HmlEnv*);",
                f.c_name
            )?;
        }

        // Extern-function forward declarations.
        for e in extern_fns {
            let params: Vec<Param> = e
                .params
                .iter()
                .enumerate()
                .map(|(i, _)| Param::new(format!("_a{}", i)))
                .collect();
            let c_name = format!("hml_fn_{}", sanitize_ident(&e.name));
            writeln!(out, "{};", decl_signature(&c_name, &params, false))?;
            writeln!(
                out,
                "static HmlValue {}_wrapper(HmlValue*, int, HmlEnv*);",
                c_name
            )?;
        }
        writeln!(out)?;

        out.push_str(&self.closures_out);
        out.push_str(&extern_wrappers);
        out.push_str(&self.module_fns_out);
        out.push_str(&self.module_inits_out);
        out.push_str(&self.functions_out);
        out.push_str(&self.main_out);
        Ok(out)
    }

    /// Lazy-binding FFI wrappers: resolve the symbol once, then forward
    /// through `hml_ffi_call` with the declared signature string.
    fn emit_extern_wrappers(&mut self, extern_fns: &[ExternFn]) -> Result<String, CodeGenError> {
        let saved_sink = self.sink;
        let saved = std::mem::take(&mut self.functions_out);
        self.sink = Sink::Functions;

        for e in extern_fns {
            let c_name = format!("hml_fn_{}", sanitize_ident(&e.name));
            let ptr = format!("_ffi_fn_{}", sanitize_ident(&e.name));
            let params: Vec<Param> = e
                .params
                .iter()
                .enumerate()
                .map(|(i, _)| Param::new(format!("_a{}", i)))
                .collect();
            let sig = self.function_signature(&c_name, &params, None, true);
            self.open_block(&sig);
            self.open_block(&format!("if ({} == NULL)", ptr));
            self.emit(&format!(
                "{} = hml_ffi_sym(&_ffi_lib_handle, \"{}\", \"{}\");",
                ptr,
                escape_c_string(&e.lib),
                escape_c_string(&e.name)
            ));
            self.close_block();

            let ffi_sig = format!("{}:{}", e.params.join(","), e.ret);
            let call = if e.params.is_empty() {
                format!("hml_ffi_call({}, \"{}\", NULL, 0)", ptr, escape_c_string(&ffi_sig))
            } else {
                let arr = self.fresh_temp();
                let names: Vec<String> =
                    params.iter().map(|p| sanitize_ident(&p.name)).collect();
                self.emit(&format!(
                    "HmlValue {}[{}] = {{ {} }};",
                    arr,
                    names.len(),
                    names.join(", ")
                ));
                format!(
                    "hml_ffi_call({}, \"{}\", {}, {})",
                    ptr,
                    escape_c_string(&ffi_sig),
                    arr,
                    names.len()
                )
            };
            let result = self.fresh_temp();
            self.emit(&format!("HmlValue {} = {};", result, call));
            for p in &params {
                self.emit(&format!(
                    "hml_release_if_needed({});",
                    sanitize_ident(&p.name)
                ));
            }
            self.emit(&format!("return {};", result));
            self.close_block();
            self.emit_blank();

            self.emit_wrapper(&c_name, &params, false);
        }

        let wrappers = std::mem::replace(&mut self.functions_out, saved);
        self.sink = saved_sink;
        Ok(wrappers)
    }
}

/// Unwrap an `export` statement to the definition it carries.
fn export_inner(stmt: &Stmt) -> &Stmt {
    match &stmt.kind {
        StmtKind::Export(inner) => export_inner(inner),
        _ => stmt,
    }
}

/// A forward declaration with parameter types only.
fn decl_signature(c_name: &str, params: &[Param], has_rest: bool) -> String {
    let mut sig = format!("static HmlValue {}(HmlEnv*", c_name);
    for p in params {
        if p.by_ref {
            sig.push_str(", HmlValue*");
        } else {
            sig.push_str(", HmlValue");
        }
    }
    if has_rest {
        sig.push_str(", HmlValue");
    }
    sig.push(')');
    sig
}

/// Pre-pass over a module's statements: its top-level symbol tables.
fn build_module_scope(module: &CompiledModule) -> ModuleScope {
    let mut scope = ModuleScope {
        prefix: module.prefix.clone(),
        ..Default::default()
    };
    for (i, stmt) in module.statements.iter().enumerate() {
        match &export_inner(stmt).kind {
            StmtKind::Let { name, mutable, .. } => {
                if !scope.vars.contains_key(name) {
                    scope.var_order.push(name.clone());
                }
                scope.vars.insert(
                    name.clone(),
                    TopVar {
                        is_const: !mutable,
                        stmt_index: i,
                        ..Default::default()
                    },
                );
            }
            StmtKind::Enum { name, .. } => {
                if !scope.vars.contains_key(name) {
                    scope.var_order.push(name.clone());
                }
                scope.vars.insert(
                    name.clone(),
                    TopVar {
                        is_const: true,
                        stmt_index: i,
                        ..Default::default()
                    },
                );
            }
            StmtKind::Function { name, func } => {
                if !scope.vars.contains_key(name) {
                    scope.var_order.push(name.clone());
                }
                scope.vars.insert(
                    name.clone(),
                    TopVar {
                        is_function: true,
                        arity: func.params.len(),
                        has_rest: func.rest.is_some(),
                        ref_mask: func.params.iter().map(|p| p.by_ref).collect(),
                        is_const: true,
                        stmt_index: i,
                    },
                );
            }
            _ => {}
        }
    }
    for (local, binding) in &module.imports {
        scope.imports.insert(
            local.clone(),
            MainImport {
                original: binding.original.clone(),
                prefix: binding.prefix.clone(),
                is_function: binding.is_function,
                arity: binding.arity,
                has_rest: false,
                is_extern: binding.is_extern,
            },
        );
    }
    scope
}

/// Collect every `extern fn` declaration, including those nested inside
/// blocks and function bodies.
fn collect_extern_fns(stmts: &[Stmt], out: &mut Vec<ExternFn>) {
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::ExternFn(e) => {
                if !out.iter().any(|x| x.name == e.name) {
                    out.push(e.clone());
                }
            }
            StmtKind::Block(b) | StmtKind::While { body: b, .. } => collect_extern_fns(b, out),
            StmtKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                collect_extern_fns(then_branch, out);
                if let Some(eb) = else_branch {
                    collect_extern_fns(eb, out);
                }
            }
            StmtKind::For { init, body, .. } => {
                if let Some(i) = init {
                    collect_extern_fns(std::slice::from_ref(i.as_ref()), out);
                }
                collect_extern_fns(body, out);
            }
            StmtKind::ForIn { body, .. } => collect_extern_fns(body, out),
            StmtKind::Match { arms, .. } => {
                for arm in arms {
                    collect_extern_fns(&arm.body, out);
                }
            }
            StmtKind::Try {
                body,
                catch_body,
                finally_body,
                ..
            } => {
                collect_extern_fns(body, out);
                collect_extern_fns(catch_body, out);
                if let Some(fb) = finally_body {
                    collect_extern_fns(fb, out);
                }
            }
            StmtKind::Function { func, .. } => collect_extern_fns(&func.body, out),
            StmtKind::Defer(body) => collect_extern_fns(body, out),
            StmtKind::Export(inner) => collect_extern_fns(std::slice::from_ref(inner.as_ref()), out),
            _ => {}
        }
    }
}
