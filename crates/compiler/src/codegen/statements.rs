//! Statement lowering
//!
//! Every statement kind except `match` and `try` (see `control_flow.rs`)
//! lowers here. The early-exit paths (`return`, `break`, `continue`) carry
//! the whole unwinding discipline: pending finallys run first, open try
//! frames pop, defers unwind to the right mark, and every boxed local that
//! goes out of scope gets its release.

use crate::ast::{Expr, FnLit, Stmt, StmtKind, TypeAnn};

use super::error::CodeGenError;
use super::free_vars::contains_defer;
use super::state::{CodegenContext, LocalEntry, LoopScope, Storage};

impl CodegenContext {
    pub(super) fn lower_stmts(&mut self, stmts: &[Stmt]) -> Result<(), CodeGenError> {
        for stmt in stmts {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    pub(super) fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), CodeGenError> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Let {
                name,
                ty,
                init,
                mutable: _,
            } => self.lower_let(name, ty.as_ref(), init, line),
            StmtKind::Expr(e) => {
                let t = self.lower_expr(e, line)?;
                self.release_if_needed(&t);
                Ok(())
            }
            StmtKind::Block(body) => {
                self.emit("{");
                self.indent += 1;
                let mark = self.locals.len();
                self.lower_stmts(body)?;
                self.pop_locals_to(mark);
                self.indent -= 1;
                self.emit("}");
                Ok(())
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => self.lower_if(cond, then_branch, else_branch.as_deref(), line),
            StmtKind::While { cond, body } => self.lower_while(cond, body, line),
            StmtKind::For {
                init,
                cond,
                update,
                body,
            } => self.lower_for(init.as_deref(), cond.as_ref(), update.as_ref(), body, line),
            StmtKind::ForIn {
                var,
                index_var,
                iterable,
                body,
            } => self.lower_for_in(var, index_var.as_deref(), iterable, body, line),
            StmtKind::Match { subject, arms } => self.lower_match(subject, arms, line),
            StmtKind::Try {
                body,
                catch_var,
                catch_body,
                finally_body,
            } => self.lower_try(body, catch_var, catch_body, finally_body.as_deref(), line),
            StmtKind::Return(expr) => self.lower_return(expr.as_ref(), line),
            StmtKind::Break => self.lower_break(line),
            StmtKind::Continue => self.lower_continue(line),
            StmtKind::Defer(body) => self.lower_defer(body, line),
            StmtKind::Function { name, func } => {
                // A nested named function is a let bound to a closure that
                // may call itself through the binding.
                let init = Expr::Function(func.clone());
                self.lower_let(name, None, &init, line)
            }
            StmtKind::ExternFn(_) => Ok(()), // collected in the pre-pass
            StmtKind::Import { .. } => Ok(()), // handled by the orchestrator
            StmtKind::Export(inner) => self.lower_stmt(inner),
            StmtKind::Enum { name, members } => {
                let t = self.lower_enum_value(members, line)?;
                let c_name = self.add_local(name, Storage::Boxed);
                self.emit(&format!("HmlValue {} = {};", c_name, t));
                self.emit_env_write_through(name, &c_name);
                Ok(())
            }
            StmtKind::TypeDef(_) => Ok(()), // registered at program startup
        }
    }

    /// Build the frozen object an `enum` lowers to. Members number from 0.
    pub(super) fn lower_enum_value(
        &mut self,
        members: &[String],
        _line: usize,
    ) -> Result<String, CodeGenError> {
        let obj = self.fresh_temp();
        self.emit(&format!("HmlValue {} = hml_val_object();", obj));
        for (i, member) in members.iter().enumerate() {
            let mt = self.emit_int_literal(i as i64);
            self.emit(&format!(
                "hml_object_set({}, \"{}\", {});",
                obj,
                super::runtime::escape_c_string(member),
                mt
            ));
            self.release_if_needed(&mt);
        }
        self.emit(&format!("hml_object_freeze({});", obj));
        Ok(obj)
    }

    // =========================================================================
    // let / const
    // =========================================================================

    fn lower_let(
        &mut self,
        name: &str,
        ty: Option<&TypeAnn>,
        init: &Expr,
        line: usize,
    ) -> Result<(), CodeGenError> {
        // Unboxable locals get raw C storage when the checker marked them
        // and no annotation forces a runtime validation.
        if let Some(native) = self.native_hint(name)
            && matches!(ty, None | Some(TypeAnn::Primitive(_)))
        {
            let raw = self.native_let_initializer(init, native, line)?;
            let shadow = self.locals.iter().filter(|l| l.name == name).count();
            let c_name = if shadow == 0 {
                super::state::sanitize_ident(name)
            } else {
                format!("{}_s{}", super::state::sanitize_ident(name), shadow)
            };
            self.emit(&format!("{} {} = {};", native.c_type(), c_name, raw));
            self.locals.push(LocalEntry {
                name: name.to_string(),
                c_name,
                storage: Storage::Native(native),
                declared_in_loop: self.loop_depth > 0,
            });
            return Ok(());
        }

        // A function-literal initializer may capture its own binding, so
        // the binding exists (holding null) before the initializer runs;
        // the capture slot is back-patched after the assignment completes.
        if matches!(init, Expr::Function(_)) {
            let c_name = self.add_local(name, Storage::Boxed);
            self.emit(&format!("HmlValue {} = hml_val_null();", c_name));
            self.pending_self = Some(name.to_string());
            let t = self.lower_expr(init, line)?;
            self.pending_self = None;
            self.emit(&format!("{} = {};", c_name, t));
            self.emit_env_write_through(name, &c_name);
            self.patch_self_reference(name, &c_name);
            return Ok(());
        }

        let mut t = self.lower_expr(init, line)?;
        t = self.apply_type_annotation(t, ty);

        let c_name = self.add_local(name, Storage::Boxed);
        self.emit(&format!("HmlValue {} = {};", c_name, t));
        self.emit_env_write_through(name, &c_name);
        self.last_closure = None;
        Ok(())
    }

    /// Raw C initializer for a native let; falls back to unboxing a
    /// lowered value when the initializer is not native-computable.
    fn native_let_initializer(
        &mut self,
        init: &Expr,
        native: crate::types::NativeType,
        line: usize,
    ) -> Result<String, CodeGenError> {
        match init {
            Expr::IntLit(n) if native.is_integer() => Ok(n.to_string()),
            Expr::FloatLit(f) if !native.is_integer() => Ok(format!("{:?}", f)),
            _ => {
                let t = self.lower_expr(init, line)?;
                let out = format!("{}({})", native.accessor(), t);
                self.release_if_needed(&t);
                Ok(out)
            }
        }
    }

    /// Typed-let validation calls: primitive coercion, array element
    /// typing, nominal object validation.
    pub(super) fn apply_type_annotation(&mut self, temp: String, ty: Option<&TypeAnn>) -> String {
        let Some(ann) = ty else {
            return temp;
        };
        let (call, arg) = match ann {
            TypeAnn::Primitive(p) => ("hml_convert_to_type", p),
            TypeAnn::Array(elem) => ("hml_validate_typed_array", elem),
            TypeAnn::Object(nominal) => ("hml_validate_object_type", nominal),
        };
        let out = self.fresh_temp();
        self.emit(&format!(
            "HmlValue {} = {}({}, \"{}\");",
            out,
            call,
            temp,
            super::runtime::escape_c_string(arg)
        ));
        self.release_if_needed(&temp);
        out
    }

    /// After `let name = <closure>`, restore the fix-point for a closure
    /// that captured its own binding: its slot still holds the value the
    /// name had before the let.
    pub(super) fn patch_self_reference(&mut self, name: &str, c_name: &str) {
        if let Some(last) = self.last_closure.take()
            && let Some(&slot) = last.slots.get(name)
        {
            self.emit(&format!(
                "hml_closure_env_set({}, {}, {});",
                last.env_var, slot, c_name
            ));
        }
    }

    // =========================================================================
    // Conditionals and loops
    // =========================================================================

    fn lower_if(
        &mut self,
        cond: &Expr,
        then_branch: &[Stmt],
        else_branch: Option<&[Stmt]>,
        line: usize,
    ) -> Result<(), CodeGenError> {
        let ct = self.lower_expr(cond, line)?;
        let flag = self.fresh_temp();
        self.emit(&format!("int {} = hml_is_truthy({});", flag, ct));
        self.release_if_needed(&ct);
        self.open_block(&format!("if ({})", flag));
        let mark = self.locals.len();
        self.lower_stmts(then_branch)?;
        self.pop_locals_to(mark);
        if let Some(eb) = else_branch {
            self.indent -= 1;
            self.open_block("} else");
            let mark = self.locals.len();
            self.lower_stmts(eb)?;
            self.pop_locals_to(mark);
        }
        self.close_block();
        Ok(())
    }

    fn lower_while(&mut self, cond: &Expr, body: &[Stmt], line: usize) -> Result<(), CodeGenError> {
        let defer_mark = self.loop_defer_mark(body);
        self.open_block("while (1)");
        let ct = self.lower_expr(cond, line)?;
        let flag = self.fresh_temp();
        self.emit(&format!("int {} = hml_is_truthy({});", flag, ct));
        self.release_if_needed(&ct);
        self.emit(&format!("if (!{}) break;", flag));

        self.loop_depth += 1;
        self.loop_stack.push(LoopScope {
            locals_len: self.locals.len(),
            try_len: self.try_stack.len(),
            defer_mark,
            continue_label: None,
        });
        let mark = self.locals.len();
        self.lower_stmts(body)?;
        self.pop_locals_to(mark);
        self.loop_stack.pop();
        self.loop_depth -= 1;
        self.close_block();
        Ok(())
    }

    fn lower_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        update: Option<&Expr>,
        body: &[Stmt],
        line: usize,
    ) -> Result<(), CodeGenError> {
        let defer_mark = self.loop_defer_mark(body);
        self.emit("{");
        self.indent += 1;
        let outer_mark = self.locals.len();
        if let Some(i) = init {
            self.lower_stmt(i)?;
        }
        // `continue` must run the update clause, so it jumps to a label in
        // front of it instead of using the C keyword.
        let cont = self.fresh_label("fc");
        self.open_block("while (1)");
        if let Some(c) = cond {
            let ct = self.lower_expr(c, line)?;
            let flag = self.fresh_temp();
            self.emit(&format!("int {} = hml_is_truthy({});", flag, ct));
            self.release_if_needed(&ct);
            self.emit(&format!("if (!{}) break;", flag));
        }
        self.loop_depth += 1;
        self.loop_stack.push(LoopScope {
            locals_len: self.locals.len(),
            try_len: self.try_stack.len(),
            defer_mark,
            continue_label: Some(cont.clone()),
        });
        let mark = self.locals.len();
        self.lower_stmts(body)?;
        self.pop_locals_to(mark);
        self.loop_stack.pop();
        self.loop_depth -= 1;
        self.emit(&format!("{}:;", cont));
        if let Some(u) = update {
            let ut = self.lower_expr(u, line)?;
            self.release_if_needed(&ut);
        }
        self.close_block();
        self.pop_locals_to(outer_mark);
        self.indent -= 1;
        self.emit("}");
        Ok(())
    }

    fn lower_for_in(
        &mut self,
        var: &str,
        index_var: Option<&str>,
        iterable: &Expr,
        body: &[Stmt],
        line: usize,
    ) -> Result<(), CodeGenError> {
        // Range headers loop over raw integers without touching the heap.
        if let Expr::Range { start, end } = iterable {
            return self.lower_for_in_range(var, index_var, start, end, body, line);
        }

        let defer_mark = self.loop_defer_mark(body);
        self.emit("{");
        self.indent += 1;
        let it_value = self.lower_expr(iterable, line)?;
        let iter = self.fresh_temp();
        self.emit(&format!("HmlIter {};", iter));
        self.emit(&format!("hml_iter_init(&{}, {});", iter, it_value));
        let counter = if index_var.is_some() {
            let c = self.fresh_temp();
            self.emit(&format!("int64_t {} = 0;", c));
            Some(c)
        } else {
            None
        };

        self.open_block("while (1)");
        let mark = self.locals.len();
        let var_c = self.add_local(var, Storage::Boxed);
        self.emit(&format!("HmlValue {} = hml_val_null();", var_c));
        self.emit(&format!("if (!hml_iter_next(&{}, &{})) break;", iter, var_c));
        if let (Some(iv), Some(counter)) = (index_var, &counter) {
            let iv_c = self.add_local(iv, Storage::Boxed);
            self.emit(&format!("HmlValue {} = hml_val_i64({});", iv_c, counter));
            self.emit(&format!("{}++;", counter));
        }
        self.loop_depth += 1;
        self.loop_stack.push(LoopScope {
            locals_len: mark,
            try_len: self.try_stack.len(),
            defer_mark,
            continue_label: None,
        });
        self.lower_stmts(body)?;
        self.pop_locals_to(mark);
        self.loop_stack.pop();
        self.loop_depth -= 1;
        self.close_block();

        self.emit(&format!("hml_iter_close(&{});", iter));
        self.release_if_needed(&it_value);
        self.indent -= 1;
        self.emit("}");
        Ok(())
    }

    fn lower_for_in_range(
        &mut self,
        var: &str,
        index_var: Option<&str>,
        start: &Expr,
        end: &Expr,
        body: &[Stmt],
        line: usize,
    ) -> Result<(), CodeGenError> {
        let defer_mark = self.loop_defer_mark(body);
        self.emit("{");
        self.indent += 1;
        let st = self.lower_expr(start, line)?;
        let et = self.lower_expr(end, line)?;
        let lo = self.fresh_temp();
        let hi = self.fresh_temp();
        self.emit(&format!("int64_t {} = hml_get_i64({});", lo, st));
        self.emit(&format!("int64_t {} = hml_get_i64({});", hi, et));
        self.release_if_needed(&st);
        self.release_if_needed(&et);
        let i = self.fresh_temp();
        self.open_block(&format!(
            "for (int64_t {i} = {lo}; {i} < {hi}; {i}++)",
            i = i,
            lo = lo,
            hi = hi
        ));
        let mark = self.locals.len();
        let var_c = self.add_local(var, Storage::Boxed);
        self.emit(&format!("HmlValue {} = hml_val_i64({});", var_c, i));
        if let Some(iv) = index_var {
            let iv_c = self.add_local(iv, Storage::Boxed);
            self.emit(&format!("HmlValue {} = hml_val_i64({} - {});", iv_c, i, lo));
        }
        self.loop_depth += 1;
        self.loop_stack.push(LoopScope {
            locals_len: mark,
            try_len: self.try_stack.len(),
            defer_mark,
            // the C for-header update runs on `continue`
            continue_label: None,
        });
        self.lower_stmts(body)?;
        self.pop_locals_to(mark);
        self.loop_stack.pop();
        self.loop_depth -= 1;
        self.close_block();
        self.indent -= 1;
        self.emit("}");
        Ok(())
    }

    /// Take a defer high-water mark at loop entry when the body pushes
    /// defers, so `break`/`continue` can unwind to the loop scope.
    fn loop_defer_mark(&mut self, body: &[Stmt]) -> Option<String> {
        if contains_defer(body) {
            let mark = self.fresh_temp();
            self.emit(&format!("int {} = hml_defer_mark();", mark));
            Some(mark)
        } else {
            None
        }
    }

    // =========================================================================
    // Early exits
    // =========================================================================

    fn lower_return(&mut self, expr: Option<&Expr>, line: usize) -> Result<(), CodeGenError> {
        // Self-tail-recursion rewrite: evaluate arguments, release old
        // parameter values, reassign, jump back to the entry label.
        if let Some(Expr::Call { callee, args }) = expr
            && let Expr::Ident(name) = callee.as_ref()
            && self.tco_self.as_deref() == Some(name.as_str())
            && self.try_stack.is_empty()
            && args.len() == self.tco_params.len()
        {
            let mut temps = Vec::with_capacity(args.len());
            for arg in args {
                temps.push(self.lower_expr(arg, line)?);
            }
            self.release_locals_above(0);
            let params = self.tco_params.clone();
            for (c_name, _) in &params {
                self.emit(&format!("hml_release_if_needed({});", c_name));
            }
            let param_names: Vec<String> = params.iter().map(|(c, _)| c.clone()).collect();
            for (c_name, t) in param_names.iter().zip(&temps) {
                self.emit(&format!("{} = {};", c_name, t));
            }
            // Keep sibling closures in sync when parameters have slots.
            let with_slots: Vec<(String, String)> = param_names
                .iter()
                .filter_map(|c| {
                    let source_name = self
                        .locals
                        .iter()
                        .find(|l| &l.c_name == c)
                        .map(|l| l.name.clone())?;
                    Some((source_name, c.clone()))
                })
                .collect();
            for (source, c_name) in with_slots {
                self.emit_env_write_through(&source, &c_name);
            }
            self.emit("goto _tco;");
            return Ok(());
        }

        let rt = match expr {
            Some(e) => self.lower_expr(e, line)?,
            None => {
                let t = self.fresh_temp();
                self.emit(&format!("HmlValue {} = hml_val_null();", t));
                t
            }
        };
        self.unwind_tries_to(0)?;
        if let Some(mark) = self.defer_mark.clone() {
            self.emit(&format!("hml_defer_run_to({});", mark));
        }
        self.release_locals_above(0);
        self.release_params();
        if self.options.stack_check {
            self.emit("hml_stack_exit();");
        }
        self.emit(&format!("return {};", rt));
        Ok(())
    }

    fn lower_break(&mut self, line: usize) -> Result<(), CodeGenError> {
        let Some(scope) = self.loop_stack.last().cloned() else {
            self.error(line, "break outside of a loop");
            return Ok(());
        };
        self.unwind_tries_to(scope.try_len)?;
        if let Some(mark) = &scope.defer_mark {
            self.emit(&format!("hml_defer_run_to({});", mark));
        }
        self.release_locals_above(scope.locals_len);
        self.emit("break;");
        Ok(())
    }

    fn lower_continue(&mut self, line: usize) -> Result<(), CodeGenError> {
        let Some(scope) = self.loop_stack.last().cloned() else {
            self.error(line, "continue outside of a loop");
            return Ok(());
        };
        self.unwind_tries_to(scope.try_len)?;
        if let Some(mark) = &scope.defer_mark {
            self.emit(&format!("hml_defer_run_to({});", mark));
        }
        self.release_locals_above(scope.locals_len);
        match &scope.continue_label {
            Some(label) => self.emit(&format!("goto {};", label)),
            None => self.emit("continue;"),
        }
        Ok(())
    }

    /// Pop try frames above `keep`, running each frame's finally body on
    /// the way out. Innermost first.
    pub(super) fn unwind_tries_to(&mut self, keep: usize) -> Result<(), CodeGenError> {
        let pending: Vec<Option<Vec<Stmt>>> = self.try_stack[keep..]
            .iter()
            .rev()
            .map(|t| t.finally.clone())
            .collect();
        for finally in pending {
            self.emit("hml_try_exit();");
            if let Some(body) = finally {
                let mark = self.locals.len();
                self.lower_stmts(&body)?;
                self.pop_locals_to(mark);
            }
        }
        Ok(())
    }

    // =========================================================================
    // defer
    // =========================================================================

    fn lower_defer(&mut self, body: &[Stmt], line: usize) -> Result<(), CodeGenError> {
        let thunk = FnLit {
            params: Vec::new(),
            rest: None,
            body: body.to_vec(),
        };
        let t = self.lower_fn_literal(&thunk, line)?;
        self.emit(&format!("hml_defer_push({});", t));
        self.release_if_needed(&t);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinOp;
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

    fn let_stmt(name: &str, init: Expr) -> Stmt {
        stmt(StmtKind::Let {
            name: name.to_string(),
            ty: None,
            init,
            mutable: true,
        })
    }

    #[test]
    fn test_let_transfers_ownership_and_scope_release() {
        let mut c = ctx();
        c.lower_stmt(&stmt(StmtKind::Block(vec![let_stmt("x", Expr::IntLit(5))])))
            .unwrap();
        let out = &c.main_out;
        assert!(out.contains("HmlValue x = _t0;"));
        // released exactly once at block exit
        assert_eq!(out.matches("hml_release_if_needed(x);").count(), 1);
    }

    #[test]
    fn test_typed_let_coerces() {
        let mut c = ctx();
        c.lower_stmt(&stmt(StmtKind::Let {
            name: "x".to_string(),
            ty: Some(TypeAnn::Primitive("i32".to_string())),
            init: Expr::FloatLit(3.5),
            mutable: true,
        }))
        .unwrap();
        assert!(c.main_out.contains("hml_convert_to_type(_t0, \"i32\");"));
    }

    #[test]
    fn test_typed_array_and_object_validation() {
        let mut c = ctx();
        c.lower_stmt(&stmt(StmtKind::Let {
            name: "xs".to_string(),
            ty: Some(TypeAnn::Array("i32".to_string())),
            init: Expr::ArrayLit(vec![]),
            mutable: true,
        }))
        .unwrap();
        assert!(c.main_out.contains("hml_validate_typed_array("));
        c.lower_stmt(&stmt(StmtKind::Let {
            name: "p".to_string(),
            ty: Some(TypeAnn::Object("Point".to_string())),
            init: Expr::ObjectLit(vec![]),
            mutable: true,
        }))
        .unwrap();
        assert!(c.main_out.contains("hml_validate_object_type("));
    }

    #[test]
    fn test_while_checks_condition_each_iteration() {
        let mut c = ctx();
        c.add_local("n", Storage::Boxed);
        c.lower_stmt(&stmt(StmtKind::While {
            cond: ident("n"),
            body: vec![stmt(StmtKind::Expr(ident("n")))],
        }))
        .unwrap();
        let out = &c.main_out;
        assert!(out.contains("while (1) {"));
        assert!(out.contains("if (!_t"));
        assert!(out.contains("break;"));
    }

    #[test]
    fn test_for_continue_jumps_to_update_label() {
        let mut c = ctx();
        let body = vec![stmt(StmtKind::Continue)];
        c.lower_stmt(&stmt(StmtKind::For {
            init: Some(Box::new(let_stmt("i", Expr::IntLit(0)))),
            cond: Some(Expr::Binary {
                op: BinOp::Lt,
                lhs: Box::new(ident("i")),
                rhs: Box::new(Expr::IntLit(10)),
            }),
            update: Some(Expr::PostIncDec {
                target: Box::new(ident("i")),
                increment: true,
            }),
            body,
        }))
        .unwrap();
        let out = &c.main_out;
        assert!(out.contains("goto _fc0;"));
        assert!(out.contains("_fc0:;"));
        assert!(!out.contains("continue;"));
    }

    #[test]
    fn test_for_in_range_is_native_loop() {
        let mut c = ctx();
        c.lower_stmt(&stmt(StmtKind::ForIn {
            var: "x".to_string(),
            index_var: None,
            iterable: Expr::Range {
                start: Box::new(Expr::IntLit(0)),
                end: Box::new(Expr::IntLit(10)),
            },
            body: vec![stmt(StmtKind::Expr(ident("x")))],
        }))
        .unwrap();
        let out = &c.main_out;
        assert!(out.contains("for (int64_t "));
        assert!(out.contains("hml_val_i64("));
        assert!(!out.contains("hml_iter_init"));
    }

    #[test]
    fn test_for_in_generic_uses_iterator_protocol() {
        let mut c = ctx();
        c.add_local("xs", Storage::Boxed);
        c.lower_stmt(&stmt(StmtKind::ForIn {
            var: "x".to_string(),
            index_var: Some("i".to_string()),
            iterable: ident("xs"),
            body: vec![],
        }))
        .unwrap();
        let out = &c.main_out;
        assert!(out.contains("hml_iter_init(&"));
        assert!(out.contains("hml_iter_next(&"));
        assert!(out.contains("hml_iter_close(&"));
        assert!(out.contains("int64_t "));
    }

    #[test]
    fn test_break_releases_loop_locals() {
        let mut c = ctx();
        c.add_local("n", Storage::Boxed);
        c.lower_stmt(&stmt(StmtKind::While {
            cond: ident("n"),
            body: vec![let_stmt("tmp", Expr::IntLit(1)), stmt(StmtKind::Break)],
        }))
        .unwrap();
        let out = &c.main_out;
        // one release from break unwinding, one from normal scope exit
        assert_eq!(out.matches("hml_release_if_needed(tmp);").count(), 2);
    }

    #[test]
    fn test_defer_lowers_to_thunk_push() {
        let mut c = ctx();
        c.lower_stmt(&stmt(StmtKind::Defer(vec![stmt(StmtKind::Expr(
            Expr::IntLit(1),
        ))])))
        .unwrap();
        assert!(c.main_out.contains("hml_defer_push("));
    }

    #[test]
    fn test_enum_lowers_to_frozen_object() {
        let mut c = ctx();
        c.lower_stmt(&stmt(StmtKind::Enum {
            name: "Color".to_string(),
            members: vec!["Red".to_string(), "Green".to_string()],
        }))
        .unwrap();
        let out = &c.main_out;
        assert!(out.contains("hml_object_set(_t0, \"Red\", _t1);"));
        assert!(out.contains("hml_object_set(_t0, \"Green\", _t2);"));
        assert!(out.contains("hml_object_freeze(_t0);"));
    }

    #[test]
    fn test_break_outside_loop_diagnosed() {
        let mut c = ctx();
        c.lower_stmt(&stmt(StmtKind::Break)).unwrap();
        assert_eq!(c.diagnostics().len(), 1);
    }
}
