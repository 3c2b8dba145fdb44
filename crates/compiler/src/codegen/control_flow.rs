//! Match and exception lowering
//!
//! A `match` arm compiles in three phases: a test phase that computes a
//! matched flag (binding as it goes), the body guarded by that flag, and a
//! release phase for the bindings on arm exit. `try`/`catch` rides on the
//! runtime's frame stack with a direct `setjmp` in the emitted C; `finally`
//! bodies are duplicated onto every exit path by the statement lowerer.

use crate::ast::{Expr, MatchArm, Pattern, Stmt};
use crate::types::ValueTag;

use super::error::CodeGenError;
use super::runtime::escape_c_string;
use super::state::{CodegenContext, Storage, TryScope};

impl CodegenContext {
    // =========================================================================
    // match
    // =========================================================================

    pub(super) fn lower_match(
        &mut self,
        subject: &Expr,
        arms: &[MatchArm],
        line: usize,
    ) -> Result<(), CodeGenError> {
        self.emit("{");
        self.indent += 1;
        let subj = self.lower_expr(subject, line)?;
        let matched = self.fresh_temp();
        self.emit(&format!("int {} = 0;", matched));

        for arm in arms {
            self.open_block(&format!("if (!{})", matched));
            let mark = self.locals.len();

            // Bindings exist for the whole arm, null until the test phase
            // assigns them.
            let mut names = Vec::new();
            arm.pattern.binding_names(&mut names);
            for name in &names {
                let c_name = self.add_local(name, Storage::Boxed);
                self.emit(&format!("HmlValue {} = hml_val_null();", c_name));
            }

            let flag = self.fresh_temp();
            self.emit(&format!("int {} = 0;", flag));
            self.emit_pattern_test(&arm.pattern, &subj, &flag, line)?;

            self.open_block(&format!("if ({})", flag));
            self.emit(&format!("{} = 1;", matched));
            let body_mark = self.locals.len();
            self.lower_stmts(&arm.body)?;
            self.pop_locals_to(body_mark);
            self.close_block();

            // Release phase: bindings drop when the arm scope ends,
            // matched or not.
            self.pop_locals_to(mark);
            self.close_block();
        }

        self.release_if_needed(&subj);
        self.indent -= 1;
        self.emit("}");
        Ok(())
    }

    /// Emit code that sets `flag` to 1 when `value` matches the pattern,
    /// assigning binding locals along the way.
    fn emit_pattern_test(
        &mut self,
        pattern: &Pattern,
        value: &str,
        flag: &str,
        line: usize,
    ) -> Result<(), CodeGenError> {
        match pattern {
            Pattern::Wildcard => {
                self.emit(&format!("{} = 1;", flag));
                Ok(())
            }
            Pattern::Binding(name) => {
                self.emit_pattern_bind(name, value);
                self.emit(&format!("{} = 1;", flag));
                Ok(())
            }
            Pattern::Literal(e) => {
                let lt = self.lower_expr(e, line)?;
                let eq = self.fresh_temp();
                self.emit(&format!(
                    "HmlValue {} = hml_binary_op(HML_OP_EQ, {}, {});",
                    eq, value, lt
                ));
                self.emit(&format!("if (hml_is_truthy({})) {} = 1;", eq, flag));
                self.release_if_needed(&eq);
                self.release_if_needed(&lt);
                Ok(())
            }
            Pattern::Range { lo, hi } => {
                let lo_t = self.lower_expr(lo, line)?;
                let hi_t = self.lower_expr(hi, line)?;
                let ge = self.fresh_temp();
                let le = self.fresh_temp();
                self.emit(&format!(
                    "HmlValue {} = hml_binary_op(HML_OP_GE, {}, {});",
                    ge, value, lo_t
                ));
                self.emit(&format!(
                    "HmlValue {} = hml_binary_op(HML_OP_LE, {}, {});",
                    le, value, hi_t
                ));
                self.emit(&format!(
                    "if (hml_is_truthy({}) && hml_is_truthy({})) {} = 1;",
                    ge, le, flag
                ));
                self.release_if_needed(&ge);
                self.release_if_needed(&le);
                self.release_if_needed(&lo_t);
                self.release_if_needed(&hi_t);
                Ok(())
            }
            Pattern::Type(name) => {
                match ValueTag::from_type_name(name) {
                    Some(tag) => {
                        self.emit(&format!(
                            "if (hml_tag({}) == {}) {} = 1;",
                            value,
                            tag.c_const(),
                            flag
                        ));
                    }
                    None => {
                        // Nominal object types compare by registered name.
                        self.emit(&format!(
                            "if (hml_object_is_type({}, \"{}\")) {} = 1;",
                            value,
                            escape_c_string(name),
                            flag
                        ));
                    }
                }
                Ok(())
            }
            Pattern::Array { elements, rest } => {
                self.open_block(&format!("if (hml_tag({}) == HML_ARRAY)", value));
                let len = self.fresh_temp();
                self.emit(&format!("int64_t {} = hml_array_len({});", len, value));
                let len_cond = if rest.is_some() {
                    format!("{} >= {}", len, elements.len())
                } else {
                    format!("{} == {}", len, elements.len())
                };
                self.open_block(&format!("if ({})", len_cond));
                let mut sub_flags = Vec::with_capacity(elements.len());
                for (i, element) in elements.iter().enumerate() {
                    let elem = self.fresh_temp();
                    self.emit(&format!("HmlValue {} = hml_array_get({}, {});", elem, value, i));
                    let sub = self.fresh_temp();
                    self.emit(&format!("int {} = 0;", sub));
                    self.emit_pattern_test(element, &elem, &sub, line)?;
                    self.release_if_needed(&elem);
                    sub_flags.push(sub);
                }
                if sub_flags.is_empty() {
                    self.emit(&format!("{} = 1;", flag));
                    if let Some(rest_name) = rest {
                        self.emit_rest_bind(rest_name, value, elements.len());
                    }
                } else {
                    self.open_block(&format!("if ({})", sub_flags.join(" && ")));
                    self.emit(&format!("{} = 1;", flag));
                    if let Some(rest_name) = rest {
                        self.emit_rest_bind(rest_name, value, elements.len());
                    }
                    self.close_block();
                }
                self.close_block();
                self.close_block();
                Ok(())
            }
            Pattern::Object { fields } => {
                self.open_block(&format!("if (hml_tag({}) == HML_OBJECT)", value));
                let mut sub_flags = Vec::with_capacity(fields.len());
                for (key, sub_pattern) in fields {
                    let sub = self.fresh_temp();
                    self.emit(&format!("int {} = 0;", sub));
                    self.open_block(&format!(
                        "if (hml_object_has({}, \"{}\"))",
                        value,
                        escape_c_string(key)
                    ));
                    let field = self.fresh_temp();
                    self.emit(&format!(
                        "HmlValue {} = hml_object_get({}, \"{}\");",
                        field,
                        value,
                        escape_c_string(key)
                    ));
                    self.emit_pattern_test(sub_pattern, &field, &sub, line)?;
                    self.release_if_needed(&field);
                    self.close_block();
                    sub_flags.push(sub);
                }
                if sub_flags.is_empty() {
                    self.emit(&format!("{} = 1;", flag));
                } else {
                    self.emit(&format!(
                        "if ({}) {} = 1;",
                        sub_flags.join(" && "),
                        flag
                    ));
                }
                self.close_block();
                Ok(())
            }
            Pattern::Or(alts) => {
                // First matching alternative wins; all alternatives bind
                // the same variable set so rebinding is release-safe.
                for alt in alts {
                    self.open_block(&format!("if (!{})", flag));
                    self.emit_pattern_test(alt, value, flag, line)?;
                    self.close_block();
                }
                Ok(())
            }
        }
    }

    /// Assign a binding local from the matched value, releasing whatever a
    /// failed earlier alternative may have left in it.
    fn emit_pattern_bind(&mut self, name: &str, value: &str) {
        let c_name = self
            .local(name)
            .map(|l| l.c_name.clone())
            .unwrap_or_else(|| name.to_string());
        self.emit(&format!("hml_release_if_needed({});", c_name));
        self.emit(&format!("{} = {};", c_name, value));
        self.emit(&format!("hml_retain_if_needed({});", c_name));
    }

    /// Bind a `...rest` name to the surplus elements past `skip`.
    fn emit_rest_bind(&mut self, name: &str, value: &str, skip: usize) {
        let c_name = self
            .local(name)
            .map(|l| l.c_name.clone())
            .unwrap_or_else(|| name.to_string());
        self.emit(&format!("hml_release_if_needed({});", c_name));
        self.emit(&format!(
            "{} = hml_array_slice_from({}, {});",
            c_name, value, skip
        ));
    }

    // =========================================================================
    // try / catch / finally
    // =========================================================================

    pub(super) fn lower_try(
        &mut self,
        body: &[Stmt],
        catch_var: &str,
        catch_body: &[Stmt],
        finally_body: Option<&[Stmt]>,
        line: usize,
    ) -> Result<(), CodeGenError> {
        let _ = line;
        let frame = self.fresh_temp();
        self.emit(&format!("HmlTryFrame {};", frame));
        self.emit(&format!("hml_try_push(&{});", frame));
        self.open_block(&format!("if (setjmp({}.jb) == 0)", frame));
        self.try_stack.push(TryScope {
            finally: finally_body.map(|f| f.to_vec()),
        });
        let mark = self.locals.len();
        self.lower_stmts(body)?;
        self.pop_locals_to(mark);
        self.try_stack.pop();
        self.emit("hml_try_exit();");
        self.indent -= 1;
        self.open_block("} else");
        // The throw path pops the frame before the longjmp; the error
        // binding shadows any outer name for the catch body.
        let mark = self.locals.len();
        let err = self.add_local(catch_var, Storage::Boxed);
        self.emit(&format!("HmlValue {} = hml_catch_take_error();", err));
        self.lower_stmts(catch_body)?;
        self.pop_locals_to(mark);
        self.close_block();

        if let Some(fb) = finally_body {
            let mark = self.locals.len();
            self.lower_stmts(fb)?;
            self.pop_locals_to(mark);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::StmtKind;
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

    fn match_stmt(subject: Expr, arms: Vec<MatchArm>) -> Stmt {
        stmt(StmtKind::Match { subject, arms })
    }

    #[test]
    fn test_array_pattern_with_rest() {
        let mut c = ctx();
        c.add_local("xs", Storage::Boxed);
        let arm = MatchArm {
            pattern: Pattern::Array {
                elements: vec![Pattern::Binding("h".to_string())],
                rest: Some("t".to_string()),
            },
            body: vec![stmt(StmtKind::Expr(ident("h")))],
        };
        c.lower_stmt(&match_stmt(ident("xs"), vec![arm])).unwrap();
        let out = &c.main_out;
        assert!(out.contains("== HML_ARRAY"));
        assert!(out.contains(">= 1"));
        assert!(out.contains("hml_array_get(_t0, 0);"));
        assert!(out.contains("hml_array_slice_from(_t0, 1);"));
        // binding declared null, assigned with retain, released at arm end
        assert!(out.contains("HmlValue h = hml_val_null();"));
        assert!(out.contains("hml_retain_if_needed(h);"));
        assert!(out.contains("hml_release_if_needed(h);"));
    }

    #[test]
    fn test_literal_pattern_equality_test() {
        let mut c = ctx();
        c.add_local("x", Storage::Boxed);
        let arm = MatchArm {
            pattern: Pattern::Literal(Expr::IntLit(42)),
            body: vec![],
        };
        c.lower_stmt(&match_stmt(ident("x"), vec![arm])).unwrap();
        assert!(c.main_out.contains("hml_binary_op(HML_OP_EQ"));
    }

    #[test]
    fn test_range_pattern_two_inclusive_comparisons() {
        let mut c = ctx();
        c.add_local("x", Storage::Boxed);
        let arm = MatchArm {
            pattern: Pattern::Range {
                lo: Expr::IntLit(1),
                hi: Expr::IntLit(9),
            },
            body: vec![],
        };
        c.lower_stmt(&match_stmt(ident("x"), vec![arm])).unwrap();
        assert!(c.main_out.contains("HML_OP_GE"));
        assert!(c.main_out.contains("HML_OP_LE"));
    }

    #[test]
    fn test_type_pattern_tag_and_nominal() {
        let mut c = ctx();
        c.add_local("x", Storage::Boxed);
        let arms = vec![
            MatchArm {
                pattern: Pattern::Type("i32".to_string()),
                body: vec![],
            },
            MatchArm {
                pattern: Pattern::Type("Point".to_string()),
                body: vec![],
            },
        ];
        c.lower_stmt(&match_stmt(ident("x"), arms)).unwrap();
        assert!(c.main_out.contains("== HML_I32"));
        assert!(c.main_out.contains("hml_object_is_type(_t0, \"Point\")"));
    }

    #[test]
    fn test_or_pattern_first_alternative_wins() {
        let mut c = ctx();
        c.add_local("x", Storage::Boxed);
        let arm = MatchArm {
            pattern: Pattern::Or(vec![
                Pattern::Literal(Expr::IntLit(1)),
                Pattern::Literal(Expr::IntLit(2)),
            ]),
            body: vec![],
        };
        c.lower_stmt(&match_stmt(ident("x"), vec![arm])).unwrap();
        // second alternative is guarded on the flag still being unset
        let first = c.main_out.find("hml_val_i32(1)").unwrap();
        let guard = c.main_out[first..].find("if (!_t").unwrap();
        let second = c.main_out[first..].find("hml_val_i32(2)").unwrap();
        assert!(guard < second);
    }

    #[test]
    fn test_arms_after_match_are_skipped() {
        let mut c = ctx();
        c.add_local("x", Storage::Boxed);
        let arms = vec![
            MatchArm {
                pattern: Pattern::Wildcard,
                body: vec![],
            },
            MatchArm {
                pattern: Pattern::Wildcard,
                body: vec![],
            },
        ];
        c.lower_stmt(&match_stmt(ident("x"), arms)).unwrap();
        // every arm is guarded by the shared matched flag
        assert_eq!(c.main_out.matches("if (!_t1)").count(), 2);
    }

    #[test]
    fn test_try_catch_emits_setjmp_frame() {
        let mut c = ctx();
        c.lower_stmt(&stmt(StmtKind::Try {
            body: vec![stmt(StmtKind::Expr(Expr::IntLit(1)))],
            catch_var: "e".to_string(),
            catch_body: vec![stmt(StmtKind::Expr(ident("e")))],
            finally_body: None,
        }))
        .unwrap();
        let out = &c.main_out;
        assert!(out.contains("HmlTryFrame _t0;"));
        assert!(out.contains("hml_try_push(&_t0);"));
        assert!(out.contains("if (setjmp(_t0.jb) == 0) {"));
        assert!(out.contains("hml_try_exit();"));
        assert!(out.contains("HmlValue e = hml_catch_take_error();"));
        assert!(out.contains("hml_release_if_needed(e);"));
    }

    #[test]
    fn test_finally_runs_after_both_paths_and_on_return() {
        let mut c = ctx();
        c.begin_function_scope("hml_fn_f");
        c.lower_stmt(&stmt(StmtKind::Try {
            body: vec![stmt(StmtKind::Return(Some(Expr::IntLit(1))))],
            catch_var: "e".to_string(),
            catch_body: vec![],
            finally_body: Some(vec![stmt(StmtKind::Expr(Expr::IntLit(7)))]),
        }))
        .unwrap();
        let out = &c.main_out;
        // the return inside the try pops the frame and runs the finally
        // before returning; the fall-through path runs it after the join
        assert!(out.matches("hml_val_i32(7);").count() >= 2);
        let ret = out.find("return _t").unwrap();
        let exit_before_ret = out[..ret].rfind("hml_try_exit();").unwrap();
        let finally_before_ret = out[..ret].rfind("hml_val_i32(7);").unwrap();
        assert!(exit_before_ret < finally_before_ret);
    }
}
