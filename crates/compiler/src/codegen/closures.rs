//! Closure conversion and function-body emission
//!
//! A function literal lowers at its creation site to an environment setup
//! plus a function value; the implementation body is recorded as a
//! `ClosureInfo` and emitted later by the closure pass, so nested closures
//! can be collected before anything is written out.
//!
//! Environment strategy, in order: no captures means a bare function value;
//! when the enclosing scope carries a shared environment and no captured
//! name is block-scoped inside a loop, the closure reuses it (siblings then
//! observe each other's writes through `hml_closure_env_set`); otherwise a
//! fresh environment is allocated and the captured values are copied in.
//!
//! Environments are reference counted like every other heap value and are
//! released when the owning function values die. A closure that escapes its
//! defining scope while capturing its own binding keeps its environment
//! alive through the cycle; that leak is the source language's documented
//! policy and is preserved here.

use crate::ast::{FnLit, Param};

use super::error::CodeGenError;
use super::free_vars::{
    contains_defer, declared_names, free_variables, has_self_tail_return, toplevel_fn_literals,
};
use super::state::{
    ClosureInfo, CodegenContext, EnvStrategy, LastClosure, SharedEnv, Sink, Storage,
};

impl CodegenContext {
    // =========================================================================
    // Creation site
    // =========================================================================

    pub(super) fn lower_fn_literal(
        &mut self,
        func: &FnLit,
        _line: usize,
    ) -> Result<String, CodeGenError> {
        let c_name = self.fresh_closure_name();

        // Free variables of the body against a synthetic scope holding the
        // parameters; only names currently tracked as locals (or captured
        // by the enclosing closure) are capturable. Everything else is a
        // global, a builtin, or a module export reached by mangled name.
        let param_names: Vec<String> = func.params.iter().map(|p| p.name.clone()).collect();
        let free = free_variables(&param_names, func.rest.as_deref(), &func.body);
        let captures: Vec<String> = free
            .into_iter()
            .filter(|name| {
                self.is_local(name)
                    || (self.inside_closure && self.current_captures.contains_key(name))
            })
            .collect();

        let env = self.pick_env_strategy(&captures);
        let value = self.emit_closure_value(&c_name, func, &env)?;

        self.last_closure = match &env {
            EnvStrategy::None => None,
            EnvStrategy::Shared { slots } => {
                let var = self
                    .shared_env
                    .as_ref()
                    .map(|s| s.var.clone())
                    .unwrap_or_default();
                Some(LastClosure {
                    env_var: var,
                    slots: slots.iter().cloned().collect(),
                })
            }
            EnvStrategy::Fresh { captures } => Some(LastClosure {
                env_var: self.last_env_var.clone(),
                slots: captures
                    .iter()
                    .enumerate()
                    .map(|(i, n)| (n.clone(), i))
                    .collect(),
            }),
        };

        self.closures.push(ClosureInfo {
            c_name,
            params: func.params.clone(),
            rest: func.rest.clone(),
            body: func.body.clone(),
            module: self.current_module.clone(),
            env,
            self_name: self.pending_self.clone(),
        });
        Ok(value)
    }

    fn pick_env_strategy(&self, captures: &[String]) -> EnvStrategy {
        if captures.is_empty() {
            return EnvStrategy::None;
        }
        if let Some(shared) = &self.shared_env {
            let loop_scoped = captures.iter().any(|name| {
                self.local(name).map(|l| l.declared_in_loop).unwrap_or(false)
            });
            let all_present = captures.iter().all(|name| shared.slot_of(name).is_some());
            if !loop_scoped && all_present {
                let slots = captures
                    .iter()
                    .map(|name| (name.clone(), shared.slot_of(name).unwrap()))
                    .collect();
                return EnvStrategy::Shared { slots };
            }
        }
        EnvStrategy::Fresh {
            captures: captures.to_vec(),
        }
    }

    /// Emit the environment setup (for fresh environments) and the function
    /// value construction. Returns the temp holding the function value.
    fn emit_closure_value(
        &mut self,
        c_name: &str,
        func: &FnLit,
        env: &EnvStrategy,
    ) -> Result<String, CodeGenError> {
        let arity = func.params.len();
        let has_rest = if func.rest.is_some() { 1 } else { 0 };
        let t = self.fresh_temp();
        match env {
            EnvStrategy::None => {
                self.emit(&format!(
                    "HmlValue {} = hml_val_function_rest((HmlFn){}_wrapper, {}, {});",
                    t, c_name, arity, has_rest
                ));
            }
            EnvStrategy::Shared { .. } => {
                let var = self
                    .shared_env
                    .as_ref()
                    .map(|s| s.var.clone())
                    .unwrap_or_default();
                self.emit(&format!(
                    "HmlValue {} = hml_val_function_with_env_rest((HmlFn){}_wrapper, {}, {}, {});",
                    t, c_name, var, arity, has_rest
                ));
            }
            EnvStrategy::Fresh { captures } => {
                let env_var = self.fresh_env();
                self.emit(&format!(
                    "HmlEnv* {} = hml_closure_env_new({});",
                    env_var,
                    captures.len()
                ));
                for (slot, name) in captures.iter().enumerate() {
                    let vt = self.lower_ident_read(name, 0)?;
                    self.emit(&format!(
                        "hml_closure_env_set({}, {}, {});",
                        env_var, slot, vt
                    ));
                    self.release_if_needed(&vt);
                }
                self.emit(&format!(
                    "HmlValue {} = hml_val_function_with_env_rest((HmlFn){}_wrapper, {}, {}, {});",
                    t, c_name, env_var, arity, has_rest
                ));
                self.last_env_var = env_var;
            }
        }
        Ok(t)
    }

    // =========================================================================
    // Shared environment prescan
    // =========================================================================

    /// Before emitting a function body, decide whether its scope needs a
    /// shared environment: every name of this scope captured by any
    /// immediate function literal gets a slot, and each definition or
    /// assignment of a slotted name writes through so sibling closures see
    /// it.
    pub(super) fn setup_shared_env(
        &mut self,
        params: &[String],
        rest: Option<&str>,
        body: &[crate::ast::Stmt],
    ) {
        let mut scope_defined: Vec<String> = params.to_vec();
        if let Some(r) = rest {
            scope_defined.push(r.to_string());
        }
        declared_names(body, &mut scope_defined);

        let mut literals = Vec::new();
        toplevel_fn_literals(body, &mut literals);
        if literals.is_empty() {
            self.shared_env = None;
            return;
        }

        let mut slots: Vec<String> = Vec::new();
        for lit in &literals {
            let names: Vec<String> = lit.params.iter().map(|p| p.name.clone()).collect();
            for free in free_variables(&names, lit.rest.as_deref(), &lit.body) {
                if scope_defined.contains(&free) && !slots.contains(&free) {
                    slots.push(free);
                }
            }
        }
        if slots.is_empty() {
            self.shared_env = None;
            return;
        }

        let var = self.fresh_env();
        self.emit(&format!(
            "HmlEnv* {} = hml_closure_env_new({});",
            var,
            slots.len()
        ));
        let mut shared = SharedEnv {
            var: var.clone(),
            ..Default::default()
        };
        for (i, name) in slots.into_iter().enumerate() {
            shared.slots.insert(name.clone(), i);
            shared.order.push(name);
        }
        // Slots for names already in scope (parameters) start out synced;
        // let-bound names sync through their definition's write-through.
        let preset: Vec<(usize, String)> = shared
            .order
            .iter()
            .enumerate()
            .filter_map(|(i, name)| self.local(name).map(|l| (i, l.c_name.clone())))
            .collect();
        for (i, c_name) in preset {
            self.emit(&format!("hml_closure_env_set({}, {}, {});", var, i, c_name));
        }
        self.shared_env = Some(shared);
    }

    // =========================================================================
    // Deferred body emission
    // =========================================================================

    /// Emit implementations for every recorded closure, including the ones
    /// discovered while doing so, until the list is stable.
    pub(super) fn emit_pending_closures(&mut self) -> Result<(), CodeGenError> {
        while self.closures_emitted < self.closures.len() {
            let info = self.closures[self.closures_emitted].clone();
            self.closures_emitted += 1;
            self.emit_closure_impl(&info)?;
        }
        Ok(())
    }

    fn emit_closure_impl(&mut self, info: &ClosureInfo) -> Result<(), CodeGenError> {
        let saved_sink = self.sink;
        let saved_module = self.current_module.clone();
        self.sink = Sink::Closures;
        self.current_module = info.module.clone();
        self.begin_function_scope(&info.c_name);
        self.inside_closure = true;
        self.current_captures = match &info.env {
            EnvStrategy::None => Default::default(),
            EnvStrategy::Shared { slots } => slots.iter().cloned().collect(),
            EnvStrategy::Fresh { captures } => captures
                .iter()
                .enumerate()
                .map(|(i, n)| (n.clone(), i))
                .collect(),
        };

        let sig = self.function_signature(&info.c_name, &info.params, info.rest.as_deref(), true);
        self.open_block(&sig);
        self.emit_function_body(&info.params, info.rest.as_deref(), &info.body, info.self_name.as_deref())?;
        self.close_block();
        self.emit_blank();

        self.emit_wrapper(&info.c_name, &info.params, info.rest.is_some());

        self.current_module = saved_module;
        self.sink = saved_sink;
        self.begin_function_scope("main");
        Ok(())
    }

    /// Emit a named top-level function (main file or module) plus its
    /// uniform-ABI wrapper into the active buffer. `source_name` is the
    /// name recursion inside the body spells, for the tail-call rewrite.
    pub(super) fn emit_named_function(
        &mut self,
        c_name: &str,
        source_name: &str,
        func: &FnLit,
    ) -> Result<(), CodeGenError> {
        self.begin_function_scope(c_name);
        let sig = self.function_signature(c_name, &func.params, func.rest.as_deref(), true);
        self.open_block(&sig);
        self.emit_function_body(
            &func.params,
            func.rest.as_deref(),
            &func.body,
            Some(source_name),
        )?;
        self.close_block();
        self.emit_blank();
        self.emit_wrapper(c_name, &func.params, func.rest.is_some());
        self.begin_function_scope("main");
        Ok(())
    }

    pub(super) fn function_signature(
        &self,
        c_name: &str,
        params: &[Param],
        rest: Option<&str>,
        is_static: bool,
    ) -> String {
        let mut sig = String::new();
        if is_static {
            sig.push_str("static ");
        }
        sig.push_str("HmlValue ");
        sig.push_str(c_name);
        sig.push_str("(HmlEnv* _env");
        for p in params {
            if p.by_ref {
                sig.push_str(&format!(", HmlValue* {}", super::state::sanitize_ident(&p.name)));
            } else {
                sig.push_str(&format!(", HmlValue {}", super::state::sanitize_ident(&p.name)));
            }
        }
        if let Some(r) = rest {
            sig.push_str(&format!(", HmlValue {}", super::state::sanitize_ident(r)));
        }
        sig.push(')');
        sig
    }

    /// Body emission shared by closures and named functions: prologue
    /// hooks, tail-call label, shared-environment prescan, the statements,
    /// and the implicit-return epilogue.
    fn emit_function_body(
        &mut self,
        params: &[Param],
        rest: Option<&str>,
        body: &[crate::ast::Stmt],
        self_name: Option<&str>,
    ) -> Result<(), CodeGenError> {
        for p in params {
            let storage = if p.by_ref {
                Storage::RefParam
            } else {
                Storage::Param
            };
            self.add_local(&p.name, storage);
        }
        if let Some(r) = rest {
            self.add_local(r, Storage::Rest);
        }

        if self.options.stack_check {
            self.emit("hml_stack_enter();");
        }
        if contains_defer(body) {
            let mark = self.fresh_temp();
            self.emit(&format!("int {} = hml_defer_mark();", mark));
            self.defer_mark = Some(mark);
        }

        let param_names: Vec<String> = params.iter().map(|p| p.name.clone()).collect();
        self.setup_shared_env(&param_names, rest, body);

        // Tail-call rewriting: syntactic self-recursion, no defers, no
        // rest parameter, no by-ref parameters. The label sits after the
        // environment setup so re-entry reuses the same scope environment.
        let tco = self.options.tail_calls_enabled()
            && rest.is_none()
            && self.defer_mark.is_none()
            && params.iter().all(|p| !p.by_ref)
            && self_name.is_some_and(|name| has_self_tail_return(body, name));
        if tco {
            self.tco_self = self_name.map(|s| s.to_string());
            self.tco_params = params
                .iter()
                .map(|p| {
                    let c = self
                        .local(&p.name)
                        .map(|l| l.c_name.clone())
                        .unwrap_or_else(|| p.name.clone());
                    (c, p.by_ref)
                })
                .collect();
            self.emit("_tco:;");
        }

        self.lower_stmts(body)?;

        // Implicit return path, skipped when the body already ended with a
        // terminating return.
        let ends_with_return = matches!(
            body.last().map(|s| &s.kind),
            Some(crate::ast::StmtKind::Return(_))
        );
        if !ends_with_return {
            if let Some(mark) = self.defer_mark.clone() {
                self.emit(&format!("hml_defer_run_to({});", mark));
            }
            self.release_locals_above(0);
            self.release_params();
            if self.options.stack_check {
                self.emit("hml_stack_exit();");
            }
            self.emit("return hml_val_null();");
        }
        Ok(())
    }

    /// The uniform-ABI thunk: extract positional arguments from the array,
    /// collect overflow into a rest array when declared, invoke the body,
    /// release the rest array, return the result.
    pub(crate) fn emit_wrapper(&mut self, c_name: &str, params: &[Param], has_rest: bool) {
        let args = self.fresh_temp();
        let nargs = self.fresh_temp();
        self.open_block(&format!(
            "static HmlValue {}_wrapper(HmlValue* {}, int {}, HmlEnv* _env)",
            c_name, args, nargs
        ));

        let mut call_args = vec!["_env".to_string()];
        let mut ref_temps = Vec::new();
        for (i, p) in params.iter().enumerate() {
            let t = self.fresh_temp();
            self.emit(&format!(
                "HmlValue {} = ({} > {}) ? {}[{}] : hml_val_null();",
                t, nargs, i, args, i
            ));
            self.retain_if_needed(&t);
            if p.by_ref {
                call_args.push(format!("&{}", t));
                ref_temps.push(t);
            } else {
                call_args.push(t);
            }
        }
        let rest_temp = if has_rest {
            let rest = self.fresh_temp();
            self.emit(&format!("HmlValue {} = hml_val_array();", rest));
            let i = self.fresh_temp();
            self.open_block(&format!(
                "for (int {i} = {count}; {i} < {nargs}; {i}++)",
                i = i,
                count = params.len(),
                nargs = nargs
            ));
            self.emit(&format!("hml_array_push({}, {}[{}]);", rest, args, i));
            self.close_block();
            call_args.push(rest.clone());
            Some(rest)
        } else {
            None
        };

        let result = self.fresh_temp();
        self.emit(&format!(
            "HmlValue {} = {}({});",
            result,
            c_name,
            call_args.join(", ")
        ));
        for t in &ref_temps {
            self.release_if_needed(t);
        }
        if let Some(rest) = &rest_temp {
            self.release_if_needed(rest);
        }
        self.emit(&format!("return {};", result));
        self.close_block();
        self.emit_blank();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, Expr, Stmt, StmtKind};
    use crate::config::CodegenOptions;

    fn ctx() -> CodegenContext {
        CodegenContext::new(CodegenOptions::default(), None)
    }

    fn stmt(kind: StmtKind) -> Stmt {
        Stmt::new(kind, 1)
    }

    fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    fn fn_lit(params: &[&str], body: Vec<Stmt>) -> FnLit {
        FnLit {
            params: params.iter().map(|p| Param::new(*p)).collect(),
            rest: None,
            body,
        }
    }

    #[test]
    fn test_capture_free_closure_gets_null_env() {
        let mut c = ctx();
        let f = fn_lit(&["x"], vec![stmt(StmtKind::Return(Some(ident("x"))))]);
        c.lower_fn_literal(&f, 1).unwrap();
        assert!(c
            .main_out
            .contains("hml_val_function_rest((HmlFn)_closure_0_wrapper, 1, 0);"));
        assert!(!c.main_out.contains("hml_closure_env_new"));
        assert!(c.last_closure.is_none());
    }

    #[test]
    fn test_capturing_closure_allocates_fresh_env() {
        let mut c = ctx();
        c.add_local("outer", Storage::Boxed);
        let f = fn_lit(&[], vec![stmt(StmtKind::Return(Some(ident("outer"))))]);
        c.lower_fn_literal(&f, 1).unwrap();
        let out = &c.main_out;
        assert!(out.contains("HmlEnv* _env0 = hml_closure_env_new(1);"));
        assert!(out.contains("hml_closure_env_set(_env0, 0, "));
        assert!(out.contains(
            "hml_val_function_with_env_rest((HmlFn)_closure_0_wrapper, _env0, 0, 0);"
        ));
    }

    #[test]
    fn test_globals_are_not_captured() {
        let mut c = ctx();
        c.add_main_var("g", false, 0);
        let f = fn_lit(&[], vec![stmt(StmtKind::Return(Some(ident("g"))))]);
        c.lower_fn_literal(&f, 1).unwrap();
        assert!(!c.main_out.contains("hml_closure_env_new"));
        // body resolves g through its global storage instead
        c.emit_pending_closures().unwrap();
        assert!(c.closures_out.contains("_main_g"));
    }

    #[test]
    fn test_closure_body_reads_captures_through_env() {
        let mut c = ctx();
        c.add_local("n", Storage::Boxed);
        let f = fn_lit(&[], vec![stmt(StmtKind::Return(Some(ident("n"))))]);
        c.lower_fn_literal(&f, 1).unwrap();
        c.emit_pending_closures().unwrap();
        assert!(c.closures_out.contains("hml_closure_env_get(_env, 0);"));
    }

    #[test]
    fn test_wrapper_extracts_collects_rest_and_releases_it() {
        let mut c = ctx();
        let f = FnLit {
            params: vec![Param::new("a")],
            rest: Some("xs".to_string()),
            body: vec![],
        };
        c.lower_fn_literal(&f, 1).unwrap();
        c.emit_pending_closures().unwrap();
        let out = &c.closures_out;
        assert!(out.contains("_closure_0_wrapper(HmlValue* "));
        assert!(out.contains("? _t"));
        assert!(out.contains("hml_val_array();"));
        assert!(out.contains("hml_array_push("));
        // wrapper owns and releases the rest array after the call
        let call = out.find("= _closure_0(_env, ").unwrap();
        let release = out[call..].find("hml_release_if_needed(").unwrap();
        assert!(release > 0);
    }

    #[test]
    fn test_shared_env_for_sibling_closures() {
        let mut c = ctx();
        // fn(x) { let a = fn() { return x; }; let b = fn() { return x; }; }
        let inner_a = fn_lit(&[], vec![stmt(StmtKind::Return(Some(ident("x"))))]);
        let inner_b = fn_lit(&[], vec![stmt(StmtKind::Return(Some(ident("x"))))]);
        let outer = fn_lit(
            &["x"],
            vec![
                stmt(StmtKind::Let {
                    name: "a".to_string(),
                    ty: None,
                    init: Expr::Function(inner_a),
                    mutable: true,
                }),
                stmt(StmtKind::Let {
                    name: "b".to_string(),
                    ty: None,
                    init: Expr::Function(inner_b),
                    mutable: true,
                }),
            ],
        );
        c.lower_fn_literal(&outer, 1).unwrap();
        c.emit_pending_closures().unwrap();
        let out = &c.closures_out;
        // one shared env allocated in the outer body, reused by both
        assert_eq!(out.matches("hml_closure_env_new(").count(), 1);
        assert!(out.matches("hml_val_function_with_env_rest(").count() >= 2);
    }

    #[test]
    fn test_assignment_to_captured_var_writes_through() {
        let mut c = ctx();
        let inner = fn_lit(&[], vec![stmt(StmtKind::Return(Some(ident("x"))))]);
        let outer = fn_lit(
            &["x"],
            vec![
                stmt(StmtKind::Let {
                    name: "f".to_string(),
                    ty: None,
                    init: Expr::Function(inner),
                    mutable: true,
                }),
                stmt(StmtKind::Expr(Expr::Assign {
                    target: Box::new(ident("x")),
                    value: Box::new(Expr::IntLit(5)),
                })),
            ],
        );
        c.lower_fn_literal(&outer, 1).unwrap();
        c.emit_pending_closures().unwrap();
        let out = &c.closures_out;
        // the assignment to x inside the outer body also updates its slot
        let assign = out.find("x = _t").unwrap();
        let through = out[assign..].find("hml_closure_env_set(").unwrap();
        assert!(through > 0);
    }

    #[test]
    fn test_self_reference_fix_up_after_let() {
        let mut c = ctx();
        c.begin_function_scope("main");
        // let fact = fn(n) { return fact(n - 1); };  (as a local)
        let body = vec![stmt(StmtKind::Return(Some(Expr::Call {
            callee: Box::new(ident("fact")),
            args: vec![Expr::Binary {
                op: BinOp::Sub,
                lhs: Box::new(ident("n")),
                rhs: Box::new(Expr::IntLit(1)),
            }],
        })))];
        c.lower_stmt(&stmt(StmtKind::Let {
            name: "fact".to_string(),
            ty: None,
            init: Expr::Function(fn_lit(&["n"], body)),
            mutable: true,
        }))
        .unwrap();
        let out = &c.main_out;
        // the binding exists (null) before the initializer so the closure
        // can capture it; after the assignment its slot is back-patched
        assert!(out.contains("HmlValue fact = hml_val_null();"));
        let assign = out.find("fact = _t").unwrap();
        let patch = out[assign..]
            .find("hml_closure_env_set(_env0, 0, fact);")
            .unwrap();
        assert!(patch > 0);
    }

    #[test]
    fn test_tail_call_label_and_goto() {
        let mut c = CodegenContext::new(
            CodegenOptions::default().with_tail_calls(true),
            None,
        );
        c.add_local("sum", Storage::Boxed);
        c.pending_self = Some("sum".to_string());
        let body = vec![stmt(StmtKind::Return(Some(Expr::Call {
            callee: Box::new(ident("sum")),
            args: vec![ident("n"), ident("acc")],
        })))];
        let f = fn_lit(&["n", "acc"], body);
        c.lower_fn_literal(&f, 1).unwrap();
        c.pending_self = None;
        c.emit_pending_closures().unwrap();
        let out = &c.closures_out;
        assert!(out.contains("_tco:;"));
        assert!(out.contains("goto _tco;"));
        // old parameter values released before rebinding
        let release_n = out.find("hml_release_if_needed(n);").unwrap();
        let rebind = out.find("n = _t").unwrap();
        assert!(release_n < rebind);
    }
}
