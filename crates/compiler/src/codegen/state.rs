//! CodegenContext and core types
//!
//! All state of a translation-unit compilation lives in one struct that is
//! threaded explicitly through every lowering call: the output buffers, the
//! temp counter, the scope and symbol tables, the closure records, and the
//! accumulated diagnostics. There is no process-wide state.

use crate::ast::{Param, Stmt};
use crate::config::CodegenOptions;
use crate::types::{NativeType, TypeTable};
use std::collections::HashMap;

use super::runtime::is_reserved;

/// Which buffer `emit` currently writes into. The orchestrator switches the
/// sink as it walks the passes; final assembly concatenates the buffers in
/// the fixed section order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Sink {
    ModuleFns,
    ModuleInits,
    Closures,
    Functions,
    Main,
}

/// How a tracked name is stored in the emitted C.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum Storage {
    /// A block-scoped `HmlValue` local, released at scope exit
    Boxed,
    /// Raw C storage for an unboxable variable
    Native(NativeType),
    /// A positional parameter; the callee owns it and releases at exit
    Param,
    /// A by-reference parameter (`HmlValue *`); never released by the callee
    RefParam,
    /// The collected rest-argument array; owned by the wrapper or call site
    Rest,
    /// A main-file top-level name backed by a `_main_*` static
    MainGlobal,
    /// A module top-level name backed by a `<prefix><name>` static
    ModuleGlobal,
}

#[derive(Debug, Clone)]
pub(super) struct LocalEntry {
    pub name: String,
    pub c_name: String,
    pub storage: Storage,
    /// Declared while `loop_depth > 0`; such captures force a fresh
    /// per-closure environment
    pub declared_in_loop: bool,
}

/// A main-file top-level binding, populated by the pre-pass so forward
/// references to top-level functions resolve.
#[derive(Debug, Clone, Default)]
pub(super) struct TopVar {
    pub is_function: bool,
    pub arity: usize,
    pub has_rest: bool,
    pub ref_mask: Vec<bool>,
    pub is_const: bool,
    /// Index of the defining statement in its statement list
    pub stmt_index: usize,
}

/// An import binding visible in the main file.
#[derive(Debug, Clone)]
pub(super) struct MainImport {
    pub original: String,
    pub prefix: String,
    pub is_function: bool,
    pub arity: usize,
    pub has_rest: bool,
    pub is_extern: bool,
}

/// Top-level symbol tables for the module currently being lowered.
#[derive(Debug, Clone, Default)]
pub(super) struct ModuleScope {
    pub prefix: String,
    pub vars: HashMap<String, TopVar>,
    pub var_order: Vec<String>,
    pub imports: HashMap<String, MainImport>,
}

/// Environment strategy decided at closure-creation time.
#[derive(Debug, Clone)]
pub(super) enum EnvStrategy {
    /// No captures; bare function value with a null environment
    None,
    /// Reuses the enclosing scope's shared environment
    Shared { slots: Vec<(String, usize)> },
    /// Fresh environment holding a copy of each captured value
    Fresh { captures: Vec<String> },
}

/// One anonymous function awaiting implementation emission.
#[derive(Debug, Clone)]
pub(super) struct ClosureInfo {
    pub c_name: String,
    pub params: Vec<Param>,
    pub rest: Option<String>,
    pub body: Vec<Stmt>,
    /// Symbol tables of the defining module, so the deferred body emission
    /// resolves module globals and imports the way the creation site did
    pub module: Option<ModuleScope>,
    pub env: EnvStrategy,
    /// The `let` name this closure may call itself through, for tail-call
    /// rewriting inside the body
    pub self_name: Option<String>,
}

/// The shared environment of the function scope currently being emitted.
#[derive(Debug, Clone, Default)]
pub(super) struct SharedEnv {
    pub var: String,
    pub slots: HashMap<String, usize>,
    pub order: Vec<String>,
}

impl SharedEnv {
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.slots.get(name).copied()
    }
}

/// Tracking for the most recently created closure, so a following
/// `let name = fn ...` can back-patch the slot holding `name` itself.
#[derive(Debug, Clone)]
pub(super) struct LastClosure {
    pub env_var: String,
    pub slots: HashMap<String, usize>,
}

/// Per-loop bookkeeping for `break`/`continue` unwinding.
#[derive(Debug, Clone)]
pub(super) struct LoopScope {
    pub locals_len: usize,
    pub try_len: usize,
    /// Defer high-water mark variable taken at loop entry, present only
    /// when the loop body contains defer statements
    pub defer_mark: Option<String>,
    /// Label before the update clause of a C-style for; `continue` must
    /// jump here instead of using the C keyword
    pub continue_label: Option<String>,
}

/// Per-try bookkeeping for early-exit unwinding.
#[derive(Debug, Clone)]
pub(super) struct TryScope {
    pub finally: Option<Vec<Stmt>>,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Sanitize a source identifier into a C identifier fragment. Pure.
pub(super) fn sanitize_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_alphanumeric() || c == '_' {
            if i == 0 && c.is_ascii_digit() {
                out.push('_');
            }
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    if is_reserved(&out) {
        out.push('_');
    }
    out
}

pub struct CodegenContext {
    pub(super) options: CodegenOptions,
    pub(super) types: Option<TypeTable>,

    // Output buffers, concatenated at assembly in fixed section order
    pub(super) sink: Sink,
    pub(super) module_fns_out: String,
    pub(super) module_inits_out: String,
    pub(super) closures_out: String,
    pub(super) functions_out: String,
    pub(super) main_out: String,
    pub(super) indent: usize,

    // Monotonic counters; never reset within a translation unit
    pub(super) temp_counter: usize,
    pub(super) env_counter: usize,
    pub(super) closure_counter: usize,
    pub(super) label_counter: usize,

    // Scope tracking for the function body currently being lowered
    pub(super) locals: Vec<LocalEntry>,
    pub(super) loop_stack: Vec<LoopScope>,
    pub(super) try_stack: Vec<TryScope>,
    pub(super) loop_depth: usize,
    pub(super) defer_mark: Option<String>,
    /// Scope key for `TypeTable` lookups
    pub(super) scope_id: String,

    // Main-file symbol tables (filled by the pre-pass)
    pub(super) main_vars: HashMap<String, TopVar>,
    pub(super) main_var_order: Vec<String>,
    pub(super) main_imports: HashMap<String, MainImport>,

    // Module currently being lowered, if any
    pub(super) current_module: Option<ModuleScope>,

    // Closure conversion state
    pub(super) closures: Vec<ClosureInfo>,
    pub(super) closures_emitted: usize,
    pub(super) current_captures: HashMap<String, usize>,
    pub(super) inside_closure: bool,
    pub(super) shared_env: Option<SharedEnv>,
    pub(super) last_closure: Option<LastClosure>,
    /// C variable holding the most recently allocated fresh environment
    pub(super) last_env_var: String,
    pub(super) pending_self: Option<String>,

    // Tail-call rewriting state for the current function
    pub(super) tco_self: Option<String>,
    pub(super) tco_params: Vec<(String, bool)>,

    pub(super) diagnostics: Vec<Diagnostic>,
}

impl CodegenContext {
    pub fn new(options: CodegenOptions, types: Option<TypeTable>) -> Self {
        CodegenContext {
            options,
            types,
            sink: Sink::Main,
            module_fns_out: String::new(),
            module_inits_out: String::new(),
            closures_out: String::new(),
            functions_out: String::new(),
            main_out: String::new(),
            indent: 0,
            temp_counter: 0,
            env_counter: 0,
            closure_counter: 0,
            label_counter: 0,
            locals: Vec::new(),
            loop_stack: Vec::new(),
            try_stack: Vec::new(),
            loop_depth: 0,
            defer_mark: None,
            scope_id: "main".to_string(),
            main_vars: HashMap::new(),
            main_var_order: Vec::new(),
            main_imports: HashMap::new(),
            current_module: None,
            closures: Vec::new(),
            closures_emitted: 0,
            current_captures: HashMap::new(),
            inside_closure: false,
            shared_env: None,
            last_closure: None,
            last_env_var: String::new(),
            pending_self: None,
            tco_self: None,
            tco_params: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    // =========================================================================
    // Output
    // =========================================================================

    pub(super) fn out(&mut self) -> &mut String {
        match self.sink {
            Sink::ModuleFns => &mut self.module_fns_out,
            Sink::ModuleInits => &mut self.module_inits_out,
            Sink::Closures => &mut self.closures_out,
            Sink::Functions => &mut self.functions_out,
            Sink::Main => &mut self.main_out,
        }
    }

    /// Write one indented line into the active buffer.
    pub(super) fn emit(&mut self, line: &str) {
        let pad = "    ".repeat(self.indent);
        let buf = self.out();
        buf.push_str(&pad);
        buf.push_str(line);
        buf.push('\n');
    }

    pub(super) fn emit_blank(&mut self) {
        self.out().push('\n');
    }

    /// `emit(head + " {")` and indent the block body.
    pub(super) fn open_block(&mut self, head: &str) {
        self.emit(&format!("{} {{", head));
        self.indent += 1;
    }

    pub(super) fn close_block(&mut self) {
        self.indent -= 1;
        self.emit("}");
    }

    // =========================================================================
    // Temporaries and generated names
    // =========================================================================

    pub(super) fn fresh_temp(&mut self) -> String {
        let t = format!("_t{}", self.temp_counter);
        self.temp_counter += 1;
        t
    }

    pub(super) fn fresh_env(&mut self) -> String {
        let e = format!("_env{}", self.env_counter);
        self.env_counter += 1;
        e
    }

    pub(super) fn fresh_closure_name(&mut self) -> String {
        let c = format!("_closure_{}", self.closure_counter);
        self.closure_counter += 1;
        c
    }

    pub(super) fn fresh_label(&mut self, prefix: &str) -> String {
        let l = format!("_{}{}", prefix, self.label_counter);
        self.label_counter += 1;
        l
    }

    // =========================================================================
    // Scope and symbol tracking
    // =========================================================================

    /// Track a name in the current function scope and pick its C name.
    /// Shadows of an already-tracked name get a suffixed C identifier so
    /// early-exit release lists stay unambiguous.
    pub(super) fn add_local(&mut self, name: &str, storage: Storage) -> String {
        let c_name = match &storage {
            Storage::MainGlobal => format!("_main_{}", sanitize_ident(name)),
            Storage::ModuleGlobal => {
                let prefix = self
                    .current_module
                    .as_ref()
                    .map(|m| m.prefix.clone())
                    .unwrap_or_default();
                format!("{}{}", prefix, sanitize_ident(name))
            }
            _ => {
                let shadow = self.locals.iter().filter(|l| l.name == name).count();
                if shadow == 0 {
                    sanitize_ident(name)
                } else {
                    format!("{}_s{}", sanitize_ident(name), shadow)
                }
            }
        };
        self.locals.push(LocalEntry {
            name: name.to_string(),
            c_name: c_name.clone(),
            storage,
            declared_in_loop: self.loop_depth > 0,
        });
        c_name
    }

    pub(super) fn is_local(&self, name: &str) -> bool {
        self.locals.iter().any(|l| l.name == name)
    }

    pub(super) fn local(&self, name: &str) -> Option<&LocalEntry> {
        self.locals.iter().rev().find(|l| l.name == name)
    }

    /// Drop scope entries back to `len`, emitting releases for boxed
    /// block locals. Parameters and globals are not released here.
    pub(super) fn pop_locals_to(&mut self, len: usize) {
        let released: Vec<String> = self.locals[len..]
            .iter()
            .filter(|l| l.storage == Storage::Boxed)
            .map(|l| l.c_name.clone())
            .collect();
        self.locals.truncate(len);
        for c_name in released.iter().rev() {
            self.emit(&format!("hml_release_if_needed({});", c_name));
        }
    }

    /// Emit releases for boxed locals above `len` without dropping them
    /// from the scope; used on early-exit paths (`break`, `continue`,
    /// `return`) where lowering continues after the jump.
    pub(super) fn release_locals_above(&mut self, len: usize) {
        let released: Vec<String> = self.locals[len..]
            .iter()
            .filter(|l| l.storage == Storage::Boxed)
            .map(|l| l.c_name.clone())
            .collect();
        for c_name in released.iter().rev() {
            self.emit(&format!("hml_release_if_needed({});", c_name));
        }
    }

    /// Emit releases for every positional parameter of the current
    /// function; used on return paths (the callee owns its parameters).
    pub(super) fn release_params(&mut self) {
        let released: Vec<String> = self
            .locals
            .iter()
            .filter(|l| l.storage == Storage::Param)
            .map(|l| l.c_name.clone())
            .collect();
        for c_name in released {
            self.emit(&format!("hml_release_if_needed({});", c_name));
        }
    }

    pub(super) fn add_main_var(&mut self, name: &str, is_const: bool, stmt_index: usize) {
        if !self.main_vars.contains_key(name) {
            self.main_var_order.push(name.to_string());
        }
        self.main_vars.insert(
            name.to_string(),
            TopVar {
                is_function: false,
                is_const,
                stmt_index,
                ..Default::default()
            },
        );
    }

    pub(super) fn add_main_func(
        &mut self,
        name: &str,
        arity: usize,
        has_rest: bool,
        ref_mask: Vec<bool>,
        stmt_index: usize,
    ) {
        if !self.main_vars.contains_key(name) {
            self.main_var_order.push(name.to_string());
        }
        self.main_vars.insert(
            name.to_string(),
            TopVar {
                is_function: true,
                arity,
                has_rest,
                ref_mask,
                is_const: true,
                stmt_index,
            },
        );
    }

    pub(super) fn add_main_import(&mut self, local: &str, binding: MainImport) {
        self.main_imports.insert(local.to_string(), binding);
    }

    /// Is assignment to this name a const-reassignment error?
    pub(super) fn is_const(&self, name: &str) -> bool {
        if let Some(entry) = self.local(name) {
            match entry.storage {
                // Top-level bindings tracked as scope entries still answer
                // to their declaration's constness.
                Storage::MainGlobal | Storage::ModuleGlobal => {}
                // A true local shadow is a fresh binding.
                _ => return false,
            }
        }
        if let Some(module) = &self.current_module {
            if let Some(var) = module.vars.get(name) {
                return var.is_const;
            }
        }
        self.main_vars.get(name).map(|v| v.is_const).unwrap_or(false)
    }

    // =========================================================================
    // Reference counting helpers
    // =========================================================================

    pub(super) fn release_if_needed(&mut self, temp: &str) {
        self.emit(&format!("hml_release_if_needed({});", temp));
    }

    pub(super) fn retain_if_needed(&mut self, temp: &str) {
        self.emit(&format!("hml_retain_if_needed({});", temp));
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub(super) fn error(&mut self, line: usize, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            line,
            message: message.into(),
        });
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Emit a null placeholder so downstream lowering stays structurally
    /// well-formed after a diagnostic.
    pub(super) fn null_placeholder(&mut self) -> String {
        let t = self.fresh_temp();
        self.emit(&format!("HmlValue {} = hml_val_null();", t));
        t
    }

    // =========================================================================
    // Function-scope lifecycle
    // =========================================================================

    /// Reset per-function lowering state before emitting a body. Counters
    /// are left alone: temps stay unique across the whole unit.
    pub(super) fn begin_function_scope(&mut self, scope_id: &str) {
        self.locals.clear();
        self.loop_stack.clear();
        self.try_stack.clear();
        self.loop_depth = 0;
        self.defer_mark = None;
        self.shared_env = None;
        self.current_captures.clear();
        self.inside_closure = false;
        self.last_closure = None;
        self.pending_self = None;
        self.tco_self = None;
        self.tco_params.clear();
        self.scope_id = scope_id.to_string();
    }

    /// Lookup into the checker's unboxing hints for the current scope.
    pub(super) fn native_hint(&self, name: &str) -> Option<NativeType> {
        if !self.options.native_arith_enabled() {
            return None;
        }
        self.types.as_ref()?.lookup(&self.scope_id, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CodegenContext {
        CodegenContext::new(CodegenOptions::default(), None)
    }

    #[test]
    fn test_fresh_temps_are_unique_and_monotonic() {
        let mut c = ctx();
        let a = c.fresh_temp();
        let b = c.fresh_temp();
        c.begin_function_scope("hml_fn_f");
        let d = c.fresh_temp();
        assert_eq!(a, "_t0");
        assert_eq!(b, "_t1");
        // scope reset must not reuse temp names
        assert_eq!(d, "_t2");
    }

    #[test]
    fn test_sanitize_reserved_words() {
        assert_eq!(sanitize_ident("while"), "while_");
        assert_eq!(sanitize_ident("total"), "total");
        assert_eq!(sanitize_ident("1st"), "_1st");
        assert_eq!(sanitize_ident("a-b"), "a_b");
    }

    #[test]
    fn test_shadowed_local_gets_suffixed_c_name() {
        let mut c = ctx();
        let first = c.add_local("x", Storage::Boxed);
        let second = c.add_local("x", Storage::Boxed);
        assert_eq!(first, "x");
        assert_eq!(second, "x_s1");
        assert_eq!(c.local("x").unwrap().c_name, "x_s1");
    }

    #[test]
    fn test_main_global_storage_mangles() {
        let mut c = ctx();
        let name = c.add_local("counter", Storage::MainGlobal);
        assert_eq!(name, "_main_counter");
    }

    #[test]
    fn test_const_tracking() {
        let mut c = ctx();
        c.add_main_var("pi", true, 0);
        c.add_main_var("x", false, 1);
        assert!(c.is_const("pi"));
        assert!(!c.is_const("x"));
        // shadowing local makes the name assignable
        c.add_local("pi", Storage::Boxed);
        assert!(!c.is_const("pi"));
    }

    #[test]
    fn test_pop_locals_releases_in_reverse_order() {
        let mut c = ctx();
        let mark = c.locals.len();
        c.add_local("a", Storage::Boxed);
        c.add_local("b", Storage::Boxed);
        c.add_local("p", Storage::Param);
        c.pop_locals_to(mark);
        let out = c.main_out.clone();
        let a_pos = out.find("hml_release_if_needed(a);").unwrap();
        let b_pos = out.find("hml_release_if_needed(b);").unwrap();
        assert!(b_pos < a_pos, "later locals release first");
        // parameters are not released by scope pops
        assert!(!out.contains("hml_release_if_needed(p);"));
    }
}
