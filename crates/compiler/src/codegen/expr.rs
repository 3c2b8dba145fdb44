//! Expression lowering
//!
//! `lower_expr` turns one AST expression into a flat sequence of runtime
//! calls written to the active buffer and returns the name of the temp
//! holding the result. The caller owns that temp and must release it
//! (normally through `hml_release_if_needed`, which skips unboxed
//! primitives).
//!
//! All peephole rewrites live here: constant folding, the algebraic
//! identities, strength reduction, the chained string-concat collapse, the
//! tagged i32/i64 fast paths, and raw arithmetic for variables the checker
//! marked unboxable.

use crate::ast::{BinOp, Expr, InterpPart, UnOp};
use crate::types::NativeType;

use super::error::CodeGenError;
use super::runtime::{escape_c_string, rune_literal};
use super::state::{CodegenContext, Storage, sanitize_ident};

/// Where an identifier read or write lands.
#[derive(Debug, Clone)]
pub(super) enum IdentPlace {
    /// A direct C lvalue: local, parameter, `_main_*` or module global
    Storage {
        c_expr: String,
        native: Option<NativeType>,
    },
    /// Captured by the closure currently being emitted; reads and writes
    /// go through the environment accessor
    EnvSlot(usize),
    /// A known function; materializes as a function value on demand
    Function {
        c_name: String,
        arity: usize,
        has_rest: bool,
        ref_mask: Vec<bool>,
    },
    Unknown,
}

impl CodegenContext {
    // =========================================================================
    // Identifier resolution
    // =========================================================================

    pub(super) fn resolve_ident(&self, name: &str) -> IdentPlace {
        if let Some(entry) = self.local(name) {
            let (c_expr, native) = match &entry.storage {
                Storage::RefParam => (format!("(*{})", entry.c_name), None),
                Storage::Native(ty) => (entry.c_name.clone(), Some(*ty)),
                _ => (entry.c_name.clone(), None),
            };
            return IdentPlace::Storage { c_expr, native };
        }

        if self.inside_closure
            && let Some(&slot) = self.current_captures.get(name)
        {
            return IdentPlace::EnvSlot(slot);
        }

        if let Some(module) = &self.current_module {
            if let Some(var) = module.vars.get(name) {
                if var.is_function {
                    return IdentPlace::Function {
                        c_name: format!("hml_fn_{}{}", module.prefix, sanitize_ident(name)),
                        arity: var.arity,
                        has_rest: var.has_rest,
                        ref_mask: var.ref_mask.clone(),
                    };
                }
                return IdentPlace::Storage {
                    c_expr: format!("{}{}", module.prefix, sanitize_ident(name)),
                    native: None,
                };
            }
            if let Some(import) = module.imports.get(name) {
                return Self::import_place(import);
            }
            return IdentPlace::Unknown;
        }

        if let Some(var) = self.main_vars.get(name) {
            if var.is_function {
                return IdentPlace::Function {
                    c_name: format!("hml_fn_{}", sanitize_ident(name)),
                    arity: var.arity,
                    has_rest: var.has_rest,
                    ref_mask: var.ref_mask.clone(),
                };
            }
            return IdentPlace::Storage {
                c_expr: format!("_main_{}", sanitize_ident(name)),
                native: None,
            };
        }
        if let Some(import) = self.main_imports.get(name) {
            return Self::import_place(import);
        }
        IdentPlace::Unknown
    }

    fn import_place(import: &super::state::MainImport) -> IdentPlace {
        if import.is_function {
            let c_name = if import.is_extern {
                // Extern functions share the hml_fn_ namespace without a
                // module prefix.
                format!("hml_fn_{}", sanitize_ident(&import.original))
            } else {
                format!("hml_fn_{}{}", import.prefix, sanitize_ident(&import.original))
            };
            IdentPlace::Function {
                c_name,
                arity: import.arity,
                has_rest: import.has_rest,
                ref_mask: Vec::new(),
            }
        } else {
            IdentPlace::Storage {
                c_expr: format!("{}{}", import.prefix, sanitize_ident(&import.original)),
                native: None,
            }
        }
    }

    // =========================================================================
    // Entry point
    // =========================================================================

    pub(super) fn lower_expr(&mut self, expr: &Expr, line: usize) -> Result<String, CodeGenError> {
        match expr {
            Expr::IntLit(n) => Ok(self.emit_int_literal(*n)),
            Expr::FloatLit(f) => {
                let t = self.fresh_temp();
                self.emit(&format!("HmlValue {} = hml_val_f64({});", t, c_float(*f)));
                Ok(t)
            }
            Expr::StringLit(s) => {
                let t = self.fresh_temp();
                self.emit(&format!(
                    "HmlValue {} = hml_val_string(\"{}\");",
                    t,
                    escape_c_string(s)
                ));
                Ok(t)
            }
            Expr::BoolLit(b) => {
                let t = self.fresh_temp();
                self.emit(&format!(
                    "HmlValue {} = hml_val_bool({});",
                    t,
                    if *b { 1 } else { 0 }
                ));
                Ok(t)
            }
            Expr::RuneLit(c) => {
                let t = self.fresh_temp();
                self.emit(&format!("HmlValue {} = hml_val_rune({});", t, rune_literal(*c)));
                Ok(t)
            }
            Expr::NullLit => {
                let t = self.fresh_temp();
                self.emit(&format!("HmlValue {} = hml_val_null();", t));
                Ok(t)
            }
            Expr::Ident(name) => self.lower_ident_read(name, line),
            Expr::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs, line),
            Expr::Unary { op, operand } => self.lower_unary(*op, operand, line),
            Expr::Ternary {
                cond,
                then,
                otherwise,
            } => self.lower_ternary(cond, then, otherwise, line),
            Expr::NullCoalesce { lhs, rhs } => self.lower_null_coalesce(lhs, rhs, line),
            Expr::OptionalChain { object, name } => self.lower_optional_chain(object, name, line),
            Expr::Assign { target, value } => self.lower_assign(target, value, line),
            Expr::Call { callee, args } => self.lower_call(callee, args, line),
            Expr::MethodCall {
                object,
                method,
                args,
            } => self.lower_method_call(object, method, args, line),
            Expr::Property { object, name } => self.lower_property_get(object, name, line),
            Expr::Index { object, index } => self.lower_index_get(object, index, line),
            Expr::ArrayLit(items) => self.lower_array_literal(items, line),
            Expr::ObjectLit(fields) => self.lower_object_literal(fields, line),
            Expr::Function(func) => self.lower_fn_literal(func, line),
            Expr::PreIncDec { target, increment } => {
                self.lower_incdec(target, *increment, false, line)
            }
            Expr::PostIncDec { target, increment } => {
                self.lower_incdec(target, *increment, true, line)
            }
            Expr::Interp(parts) => self.lower_interp(parts, line),
            Expr::Await(inner) => self.lower_await(inner, line),
            Expr::Spread(_) => {
                self.error(line, "spread is only valid in call arguments and array literals");
                Ok(self.null_placeholder())
            }
            Expr::Range { .. } => {
                self.error(line, "range expression outside for-in or pattern");
                Ok(self.null_placeholder())
            }
        }
    }

    /// Integer literals fitting 32 bits use the i32 constructor.
    pub(super) fn emit_int_literal(&mut self, n: i64) -> String {
        let t = self.fresh_temp();
        if n >= i32::MIN as i64 && n <= i32::MAX as i64 {
            self.emit(&format!("HmlValue {} = hml_val_i32({});", t, n));
        } else if n == i64::MIN {
            // i64::MIN has no C literal; the standard decomposition
            self.emit(&format!(
                "HmlValue {} = hml_val_i64(-9223372036854775807LL - 1);",
                t
            ));
        } else {
            self.emit(&format!("HmlValue {} = hml_val_i64({}LL);", t, n));
        }
        t
    }

    pub(super) fn lower_ident_read(
        &mut self,
        name: &str,
        line: usize,
    ) -> Result<String, CodeGenError> {
        match self.resolve_ident(name) {
            IdentPlace::Storage { c_expr, native } => {
                let t = self.fresh_temp();
                if let Some(ty) = native {
                    self.emit(&format!("HmlValue {} = {}({});", t, ty.constructor(), c_expr));
                } else {
                    self.emit(&format!("HmlValue {} = {};", t, c_expr));
                    self.retain_if_needed(&t);
                }
                Ok(t)
            }
            IdentPlace::EnvSlot(slot) => {
                let t = self.fresh_temp();
                self.emit(&format!(
                    "HmlValue {} = hml_closure_env_get(_env, {});",
                    t, slot
                ));
                Ok(t)
            }
            IdentPlace::Function {
                c_name,
                arity,
                has_rest,
                ..
            } => {
                let t = self.fresh_temp();
                self.emit(&format!(
                    "HmlValue {} = hml_val_function_rest((HmlFn){}_wrapper, {}, {});",
                    t,
                    c_name,
                    arity,
                    if has_rest { 1 } else { 0 }
                ));
                Ok(t)
            }
            IdentPlace::Unknown => {
                self.error(line, format!("unresolved identifier '{}'", name));
                Ok(self.null_placeholder())
            }
        }
    }

    // =========================================================================
    // Binary operators
    // =========================================================================

    fn lower_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        line: usize,
    ) -> Result<String, CodeGenError> {
        // Short-circuit forms evaluate the right operand conditionally.
        if op == BinOp::And || op == BinOp::Or {
            return self.lower_short_circuit(op, lhs, rhs, line);
        }

        // Chained string concatenation: a + b + c collapses to one
        // hml_string_concatN call when the chain has a literal-string leg.
        if op == BinOp::Add
            && self.options.optimize
            && let Some(chain) = collect_concat_chain(lhs, rhs)
        {
            return self.lower_concat_chain(&chain, line);
        }

        // Constant folding over two integer literals.
        if self.options.fold_enabled()
            && let (Expr::IntLit(a), Expr::IntLit(b)) = (lhs, rhs)
            && let Some(folded) = fold_int_binary(op, *a, *b)
        {
            return Ok(match folded {
                Folded::Int(n) => self.emit_int_literal(n),
                Folded::Bool(b) => {
                    let t = self.fresh_temp();
                    self.emit(&format!(
                        "HmlValue {} = hml_val_bool({});",
                        t,
                        if b { 1 } else { 0 }
                    ));
                    t
                }
            });
        }

        // Algebraic identities.
        if self.options.optimize
            && let Some(result) = self.try_algebraic_identity(op, lhs, rhs, line)?
        {
            return Ok(result);
        }

        // Strength reduction: multiply and modulo by a power of two.
        if self.options.strength_reduce_enabled()
            && let Some(result) = self.try_strength_reduce(op, lhs, rhs, line)?
        {
            return Ok(result);
        }

        // Raw C arithmetic when the checker marked both operands unboxable.
        if let Some(result) = self.try_native_binary(op, lhs, rhs) {
            return Ok(result);
        }

        let lt = self.lower_expr(lhs, line)?;
        let rt = self.lower_expr(rhs, line)?;
        Ok(self.emit_binary_dispatch(op, &lt, &rt))
    }

    /// The generic path plus the tagged integer fast-path cascade.
    fn emit_binary_dispatch(&mut self, op: BinOp, lt: &str, rt: &str) -> String {
        let t = self.fresh_temp();
        match op.fast_path_suffix() {
            Some(suffix) if self.options.optimize => {
                self.emit(&format!("HmlValue {};", t));
                self.open_block(&format!(
                    "if (hml_tag({}) == HML_I32 && hml_tag({}) == HML_I32)",
                    lt, rt
                ));
                self.emit(&format!("{} = hml_i32_{}({}, {});", t, suffix, lt, rt));
                self.indent -= 1;
                self.open_block(&format!(
                    "}} else if (hml_tag({}) == HML_I64 && hml_tag({}) == HML_I64)",
                    lt, rt
                ));
                self.emit(&format!("{} = hml_i64_{}({}, {});", t, suffix, lt, rt));
                self.indent -= 1;
                self.open_block("} else");
                self.emit(&format!(
                    "{} = hml_binary_op({}, {}, {});",
                    t,
                    op.runtime_op(),
                    lt,
                    rt
                ));
                self.close_block();
            }
            _ => {
                // Division always produces f64 through the generic entry.
                self.emit(&format!(
                    "HmlValue {} = hml_binary_op({}, {}, {});",
                    t,
                    op.runtime_op(),
                    lt,
                    rt
                ));
            }
        }
        self.release_if_needed(lt);
        self.release_if_needed(rt);
        t
    }

    fn lower_short_circuit(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        line: usize,
    ) -> Result<String, CodeGenError> {
        let result = self.fresh_temp();
        let lt = self.lower_expr(lhs, line)?;
        let cond = self.fresh_temp();
        self.emit(&format!("int {} = hml_is_truthy({});", cond, lt));
        self.release_if_needed(&lt);
        self.emit(&format!("HmlValue {};", result));
        let guard = if op == BinOp::And {
            format!("if ({})", cond)
        } else {
            format!("if (!{})", cond)
        };
        self.open_block(&guard);
        let rt = self.lower_expr(rhs, line)?;
        self.emit(&format!("{} = hml_val_bool(hml_is_truthy({}));", result, rt));
        self.release_if_needed(&rt);
        self.indent -= 1;
        self.open_block("} else");
        self.emit(&format!("{} = hml_val_bool({});", result, cond));
        self.close_block();
        Ok(result)
    }

    fn lower_concat_chain(
        &mut self,
        chain: &[&Expr],
        line: usize,
    ) -> Result<String, CodeGenError> {
        let mut temps = Vec::with_capacity(chain.len());
        for part in chain {
            temps.push(self.lower_expr(part, line)?);
        }
        let t = self.fresh_temp();
        self.emit(&format!(
            "HmlValue {} = hml_string_concat{}({});",
            t,
            temps.len(),
            temps.join(", ")
        ));
        for temp in &temps {
            self.release_if_needed(temp);
        }
        Ok(t)
    }

    fn try_algebraic_identity(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        line: usize,
    ) -> Result<Option<String>, CodeGenError> {
        let l0 = matches!(lhs, Expr::IntLit(0));
        let r0 = matches!(rhs, Expr::IntLit(0));
        let l1 = matches!(lhs, Expr::IntLit(1));
        let r1 = matches!(rhs, Expr::IntLit(1));

        let survivor = match op {
            BinOp::Add if r0 => Some(lhs),
            BinOp::Add if l0 => Some(rhs),
            BinOp::Sub if r0 => Some(lhs),
            BinOp::Mul if r1 => Some(lhs),
            BinOp::Mul if l1 => Some(rhs),
            BinOp::BitOr | BinOp::BitXor if r0 => Some(lhs),
            BinOp::BitOr | BinOp::BitXor if l0 => Some(rhs),
            BinOp::Shl | BinOp::Shr if r0 => Some(lhs),
            _ => None,
        };
        if let Some(e) = survivor {
            return Ok(Some(self.lower_expr(e, line)?));
        }

        // x * 0 evaluates x once for its effects, then yields the constant.
        if op == BinOp::Mul && (l0 || r0) {
            let effect = if l0 { rhs } else { lhs };
            let t = self.lower_expr(effect, line)?;
            self.release_if_needed(&t);
            return Ok(Some(self.emit_int_literal(0)));
        }
        Ok(None)
    }

    fn try_strength_reduce(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        line: usize,
    ) -> Result<Option<String>, CodeGenError> {
        match op {
            BinOp::Mul => {
                let (base, lit) = match (lhs, rhs) {
                    (e, Expr::IntLit(n)) if power_of_two(*n).is_some() => (e, *n),
                    (Expr::IntLit(n), e) if power_of_two(*n).is_some() => (e, *n),
                    _ => return Ok(None),
                };
                let k = power_of_two(lit).unwrap();
                let bt = self.lower_expr(base, line)?;
                let kt = self.emit_int_literal(k);
                Ok(Some(self.emit_binary_dispatch(BinOp::Shl, &bt, &kt)))
            }
            BinOp::Mod => {
                let Expr::IntLit(n) = rhs else {
                    return Ok(None);
                };
                if power_of_two(*n).is_none() {
                    return Ok(None);
                }
                let bt = self.lower_expr(lhs, line)?;
                let mt = self.emit_int_literal(*n - 1);
                Ok(Some(self.emit_binary_dispatch(BinOp::BitAnd, &bt, &mt)))
            }
            _ => Ok(None),
        }
    }

    /// The raw C operand of an expression, when the checker marked it
    /// unboxable (or it is an integer/float literal).
    fn native_operand(&self, expr: &Expr) -> Option<NativeOperand> {
        match expr {
            Expr::IntLit(n) => Some(NativeOperand::IntLit(*n)),
            Expr::FloatLit(f) => Some(NativeOperand::FloatLit(*f)),
            Expr::Ident(name) => {
                let ty = self.native_hint(name)?;
                if let IdentPlace::Storage {
                    c_expr,
                    native: Some(found),
                } = self.resolve_ident(name)
                {
                    debug_assert_eq!(found, ty);
                    Some(NativeOperand::Var(ty, c_expr))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn try_native_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Option<String> {
        let c_op = op.c_op()?;
        let l = self.native_operand(lhs)?;
        let r = self.native_operand(rhs)?;
        // The operation needs one concrete variable type; the other side
        // may be that same type or a bare literal.
        let ty = match (&l, &r) {
            (NativeOperand::Var(a, _), NativeOperand::Var(b, _)) if a == b => *a,
            (NativeOperand::Var(a, _), NativeOperand::IntLit(_)) if a.is_integer() => *a,
            (NativeOperand::IntLit(_), NativeOperand::Var(b, _)) if b.is_integer() => *b,
            (NativeOperand::Var(a, _), NativeOperand::FloatLit(_)) if !a.is_integer() => *a,
            (NativeOperand::FloatLit(_), NativeOperand::Var(b, _)) if !b.is_integer() => *b,
            _ => return None,
        };
        // `%` on raw floats is not valid C.
        if !ty.is_integer() && matches!(op, BinOp::Mod | BinOp::BitAnd | BinOp::BitOr
            | BinOp::BitXor | BinOp::Shl | BinOp::Shr)
        {
            return None;
        }
        let t = self.fresh_temp();
        self.emit(&format!(
            "HmlValue {} = {}({} {} {});",
            t,
            ty.constructor(),
            l.c_text(),
            c_op,
            r.c_text()
        ));
        Some(t)
    }

    // =========================================================================
    // Unary operators
    // =========================================================================

    fn lower_unary(
        &mut self,
        op: UnOp,
        operand: &Expr,
        line: usize,
    ) -> Result<String, CodeGenError> {
        if self.options.fold_enabled() {
            match (op, operand) {
                (UnOp::Neg, Expr::IntLit(n)) => {
                    return Ok(self.emit_int_literal(n.wrapping_neg()));
                }
                (UnOp::BitNot, Expr::IntLit(n)) => {
                    return Ok(self.emit_int_literal(!n));
                }
                (UnOp::Not, Expr::BoolLit(b)) => {
                    let t = self.fresh_temp();
                    self.emit(&format!(
                        "HmlValue {} = hml_val_bool({});",
                        t,
                        if *b { 0 } else { 1 }
                    ));
                    return Ok(t);
                }
                _ => {}
            }
        }
        if self.options.optimize {
            // !!x collapses to a boolean coercion, -(-x) to x itself.
            if let (
                UnOp::Not,
                Expr::Unary {
                    op: UnOp::Not,
                    operand: inner,
                },
            ) = (op, operand)
            {
                let vt = self.lower_expr(inner, line)?;
                let t = self.fresh_temp();
                self.emit(&format!("HmlValue {} = hml_to_bool({});", t, vt));
                self.release_if_needed(&vt);
                return Ok(t);
            }
            if let (
                UnOp::Neg,
                Expr::Unary {
                    op: UnOp::Neg,
                    operand: inner,
                },
            ) = (op, operand)
            {
                return self.lower_expr(inner, line);
            }
        }
        let vt = self.lower_expr(operand, line)?;
        let t = self.fresh_temp();
        self.emit(&format!(
            "HmlValue {} = hml_unary_op({}, {});",
            t,
            op.runtime_op(),
            vt
        ));
        self.release_if_needed(&vt);
        Ok(t)
    }

    // =========================================================================
    // Conditionals
    // =========================================================================

    fn lower_ternary(
        &mut self,
        cond: &Expr,
        then: &Expr,
        otherwise: &Expr,
        line: usize,
    ) -> Result<String, CodeGenError> {
        let result = self.fresh_temp();
        self.emit(&format!("HmlValue {};", result));
        let ct = self.lower_expr(cond, line)?;
        let flag = self.fresh_temp();
        self.emit(&format!("int {} = hml_is_truthy({});", flag, ct));
        self.release_if_needed(&ct);
        self.open_block(&format!("if ({})", flag));
        let tt = self.lower_expr(then, line)?;
        self.emit(&format!("{} = {};", result, tt));
        self.indent -= 1;
        self.open_block("} else");
        let et = self.lower_expr(otherwise, line)?;
        self.emit(&format!("{} = {};", result, et));
        self.close_block();
        Ok(result)
    }

    fn lower_null_coalesce(
        &mut self,
        lhs: &Expr,
        rhs: &Expr,
        line: usize,
    ) -> Result<String, CodeGenError> {
        let result = self.fresh_temp();
        self.emit(&format!("HmlValue {};", result));
        let lt = self.lower_expr(lhs, line)?;
        self.open_block(&format!("if (hml_tag({}) == HML_NULL)", lt));
        self.release_if_needed(&lt);
        let rt = self.lower_expr(rhs, line)?;
        self.emit(&format!("{} = {};", result, rt));
        self.indent -= 1;
        self.open_block("} else");
        self.emit(&format!("{} = {};", result, lt));
        self.close_block();
        Ok(result)
    }

    fn lower_optional_chain(
        &mut self,
        object: &Expr,
        name: &str,
        line: usize,
    ) -> Result<String, CodeGenError> {
        let result = self.fresh_temp();
        self.emit(&format!("HmlValue {};", result));
        let ot = self.lower_expr(object, line)?;
        self.open_block(&format!("if (hml_tag({}) == HML_NULL)", ot));
        self.emit(&format!("{} = hml_val_null();", result));
        self.indent -= 1;
        self.open_block("} else");
        let pt = self.emit_property_read(&ot, name);
        self.emit(&format!("{} = {};", result, pt));
        self.close_block();
        self.release_if_needed(&ot);
        Ok(result)
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    fn lower_assign(
        &mut self,
        target: &Expr,
        value: &Expr,
        line: usize,
    ) -> Result<String, CodeGenError> {
        match target {
            Expr::Ident(name) => self.lower_assign_ident(name, value, line),
            Expr::Index { object, index } => {
                let ot = self.lower_expr(object, line)?;
                let it = self.lower_expr(index, line)?;
                let vt = self.lower_expr(value, line)?;
                self.emit_index_write(&ot, &it, &vt);
                self.release_if_needed(&ot);
                self.release_if_needed(&it);
                Ok(vt)
            }
            Expr::Property { object, name } => {
                let ot = self.lower_expr(object, line)?;
                let vt = self.lower_expr(value, line)?;
                self.emit(&format!(
                    "hml_set_property({}, \"{}\", {});",
                    ot,
                    escape_c_string(name),
                    vt
                ));
                self.release_if_needed(&ot);
                Ok(vt)
            }
            _ => {
                self.error(line, "invalid assignment target");
                Ok(self.null_placeholder())
            }
        }
    }

    fn lower_assign_ident(
        &mut self,
        name: &str,
        value: &Expr,
        line: usize,
    ) -> Result<String, CodeGenError> {
        if self.is_const(name) {
            self.error(line, format!("cannot assign to constant '{}'", name));
            return Ok(self.null_placeholder());
        }

        let place = self.resolve_ident(name);

        // In-place append: `x = x + S` with a known string S mutates when
        // the refcount is one, turning repeated concatenation linear.
        if self.options.inplace_concat_enabled()
            && let IdentPlace::Storage { c_expr, native: None } = &place
            && let Expr::Binary {
                op: BinOp::Add,
                lhs,
                rhs,
            } = value
            && matches!(lhs.as_ref(), Expr::Ident(n) if n == name)
            && matches!(rhs.as_ref(), Expr::StringLit(_) | Expr::Interp(_))
        {
            let c_expr = c_expr.clone();
            let st = self.lower_expr(rhs, line)?;
            self.emit(&format!("hml_string_append_inplace(&{}, {});", c_expr, st));
            self.release_if_needed(&st);
            self.emit_env_write_through(name, &c_expr);
            let t = self.fresh_temp();
            self.emit(&format!("HmlValue {} = {};", t, c_expr));
            self.retain_if_needed(&t);
            return Ok(t);
        }

        match place {
            IdentPlace::Storage {
                c_expr,
                native: Some(ty),
            } => {
                // Raw assignment when the right side is native-computable,
                // unbox-assign otherwise; either way rebox the result.
                if let Some(raw) = self.native_rhs(value, ty) {
                    self.emit(&format!("{} = {};", c_expr, raw));
                    let t = self.fresh_temp();
                    self.emit(&format!("HmlValue {} = {}({});", t, ty.constructor(), c_expr));
                    Ok(t)
                } else {
                    let vt = self.lower_expr(value, line)?;
                    self.emit(&format!("{} = {}({});", c_expr, ty.accessor(), vt));
                    Ok(vt)
                }
            }
            IdentPlace::Storage { c_expr, native: None } => {
                let vt = self.lower_expr(value, line)?;
                self.emit(&format!("hml_release_if_needed({});", c_expr));
                self.emit(&format!("{} = {};", c_expr, vt));
                self.emit(&format!("hml_retain_if_needed({});", c_expr));
                self.emit_env_write_through(name, &c_expr);
                Ok(vt)
            }
            IdentPlace::EnvSlot(slot) => {
                let vt = self.lower_expr(value, line)?;
                self.emit(&format!("hml_closure_env_set(_env, {}, {});", slot, vt));
                Ok(vt)
            }
            IdentPlace::Function { .. } => {
                self.error(line, format!("cannot assign to function '{}'", name));
                Ok(self.null_placeholder())
            }
            IdentPlace::Unknown => {
                self.error(line, format!("unresolved identifier '{}'", name));
                Ok(self.null_placeholder())
            }
        }
    }

    /// A raw C expression for the right side of a native assignment, when
    /// the whole value is computable without boxing.
    fn native_rhs(&self, value: &Expr, ty: NativeType) -> Option<String> {
        match value {
            Expr::IntLit(n) if ty.is_integer() => Some(n.to_string()),
            Expr::FloatLit(f) if !ty.is_integer() => Some(c_float(*f)),
            Expr::Ident(_) => match self.native_operand(value)? {
                NativeOperand::Var(t, c) if t == ty => Some(c),
                _ => None,
            },
            Expr::Binary { op, lhs, rhs } => {
                let c_op = op.c_op()?;
                if !ty.is_integer() && matches!(op, BinOp::Mod) {
                    return None;
                }
                let l = self.native_rhs(lhs, ty)?;
                let r = self.native_rhs(rhs, ty)?;
                Some(format!("({} {} {})", l, c_op, r))
            }
            _ => None,
        }
    }

    /// Sibling closures observe writes through the scope's shared
    /// environment; emit the matching `hml_closure_env_set` after any
    /// store to a variable that has a slot.
    pub(super) fn emit_env_write_through(&mut self, name: &str, c_expr: &str) {
        let target = self
            .shared_env
            .as_ref()
            .and_then(|s| s.slot_of(name).map(|slot| (s.var.clone(), slot)));
        if let Some((var, slot)) = target {
            self.emit(&format!("hml_closure_env_set({}, {}, {});", var, slot, c_expr));
        }
    }

    // =========================================================================
    // Property and index access
    // =========================================================================

    fn emit_property_read(&mut self, obj: &str, name: &str) -> String {
        let t = self.fresh_temp();
        let call = match name {
            "length" => format!("hml_value_length({})", obj),
            "byte_length" => format!("hml_value_byte_length({})", obj),
            "capacity" => format!("hml_value_capacity({})", obj),
            "fd" => format!("hml_socket_fd({})", obj),
            "address" => format!("hml_socket_address({})", obj),
            "port" => format!("hml_socket_port({})", obj),
            "closed" => format!("hml_socket_closed({})", obj),
            _ => format!("hml_get_property({}, \"{}\")", obj, escape_c_string(name)),
        };
        self.emit(&format!("HmlValue {} = {};", t, call));
        t
    }

    fn lower_property_get(
        &mut self,
        object: &Expr,
        name: &str,
        line: usize,
    ) -> Result<String, CodeGenError> {
        let ot = self.lower_expr(object, line)?;
        let t = self.emit_property_read(&ot, name);
        self.release_if_needed(&ot);
        Ok(t)
    }

    pub(super) fn emit_index_read(&mut self, obj: &str, idx: &str) -> String {
        let t = self.fresh_temp();
        self.emit(&format!("HmlValue {};", t));
        self.open_block(&format!(
            "if (hml_tag({}) == HML_ARRAY && hml_tag({}) == HML_I32)",
            obj, idx
        ));
        self.emit(&format!("{} = hml_array_get_i32({}, {});", t, obj, idx));
        self.indent -= 1;
        self.open_block(&format!("}} else if (hml_tag({}) == HML_STRING)", obj));
        self.emit(&format!("{} = hml_string_index({}, {});", t, obj, idx));
        self.indent -= 1;
        self.open_block(&format!("}} else if (hml_tag({}) == HML_BUFFER)", obj));
        self.emit(&format!("{} = hml_buffer_index({}, {});", t, obj, idx));
        self.indent -= 1;
        self.open_block("} else");
        self.emit(&format!("{} = hml_index_get({}, {});", t, obj, idx));
        self.close_block();
        t
    }

    fn emit_index_write(&mut self, obj: &str, idx: &str, val: &str) {
        self.open_block(&format!(
            "if (hml_tag({}) == HML_ARRAY && hml_tag({}) == HML_I32)",
            obj, idx
        ));
        self.emit(&format!("hml_array_set_i32({}, {}, {});", obj, idx, val));
        self.indent -= 1;
        self.open_block("} else");
        self.emit(&format!("hml_index_set({}, {}, {});", obj, idx, val));
        self.close_block();
    }

    fn lower_index_get(
        &mut self,
        object: &Expr,
        index: &Expr,
        line: usize,
    ) -> Result<String, CodeGenError> {
        let ot = self.lower_expr(object, line)?;
        let it = self.lower_expr(index, line)?;
        let t = self.emit_index_read(&ot, &it);
        self.release_if_needed(&ot);
        self.release_if_needed(&it);
        Ok(t)
    }

    // =========================================================================
    // Container literals
    // =========================================================================

    fn lower_array_literal(
        &mut self,
        items: &[Expr],
        line: usize,
    ) -> Result<String, CodeGenError> {
        let arr = self.fresh_temp();
        self.emit(&format!("HmlValue {} = hml_val_array();", arr));
        for item in items {
            if let Expr::Spread(inner) = item {
                let st = self.lower_expr(inner, line)?;
                self.emit(&format!("hml_array_extend({}, {});", arr, st));
                self.release_if_needed(&st);
            } else {
                let it = self.lower_expr(item, line)?;
                self.emit(&format!("hml_array_push({}, {});", arr, it));
                self.release_if_needed(&it);
            }
        }
        Ok(arr)
    }

    fn lower_object_literal(
        &mut self,
        fields: &[(String, Expr)],
        line: usize,
    ) -> Result<String, CodeGenError> {
        let obj = self.fresh_temp();
        self.emit(&format!("HmlValue {} = hml_val_object();", obj));
        for (key, value) in fields {
            let vt = self.lower_expr(value, line)?;
            self.emit(&format!(
                "hml_object_set({}, \"{}\", {});",
                obj,
                escape_c_string(key),
                vt
            ));
            self.release_if_needed(&vt);
        }
        Ok(obj)
    }

    // =========================================================================
    // Increment / decrement
    // =========================================================================

    fn lower_incdec(
        &mut self,
        target: &Expr,
        increment: bool,
        postfix: bool,
        line: usize,
    ) -> Result<String, CodeGenError> {
        match target {
            Expr::Ident(name) => self.lower_incdec_ident(name, increment, postfix, line),
            Expr::Index { object, index } => {
                let ot = self.lower_expr(object, line)?;
                let it = self.lower_expr(index, line)?;
                let old = self.emit_index_read(&ot, &it);
                let new = self.emit_incdec_step(&old, increment);
                self.emit_index_write(&ot, &it, &new);
                self.release_if_needed(&ot);
                self.release_if_needed(&it);
                if postfix {
                    self.release_if_needed(&new);
                    Ok(old)
                } else {
                    self.release_if_needed(&old);
                    Ok(new)
                }
            }
            Expr::Property { object, name } => {
                let ot = self.lower_expr(object, line)?;
                let old = self.emit_property_read(&ot, name);
                let new = self.emit_incdec_step(&old, increment);
                self.emit(&format!(
                    "hml_set_property({}, \"{}\", {});",
                    ot,
                    escape_c_string(name),
                    new
                ));
                self.release_if_needed(&ot);
                if postfix {
                    self.release_if_needed(&new);
                    Ok(old)
                } else {
                    self.release_if_needed(&old);
                    Ok(new)
                }
            }
            _ => {
                self.error(line, "invalid increment/decrement target");
                Ok(self.null_placeholder())
            }
        }
    }

    fn lower_incdec_ident(
        &mut self,
        name: &str,
        increment: bool,
        postfix: bool,
        line: usize,
    ) -> Result<String, CodeGenError> {
        if self.is_const(name) {
            self.error(line, format!("cannot assign to constant '{}'", name));
            return Ok(self.null_placeholder());
        }
        if let IdentPlace::Storage {
            c_expr,
            native: Some(ty),
        } = self.resolve_ident(name)
        {
            let old = self.fresh_temp();
            self.emit(&format!("HmlValue {} = {}({});", old, ty.constructor(), c_expr));
            self.emit(&format!(
                "{} = {} {} 1;",
                c_expr,
                c_expr,
                if increment { "+" } else { "-" }
            ));
            let new = self.fresh_temp();
            self.emit(&format!("HmlValue {} = {}({});", new, ty.constructor(), c_expr));
            return Ok(if postfix { old } else { new });
        }

        let old = self.lower_ident_read(name, line)?;
        let new = self.emit_incdec_step(&old, increment);
        self.write_var(name, &new, line);
        if postfix {
            self.release_if_needed(&new);
            Ok(old)
        } else {
            self.release_if_needed(&old);
            Ok(new)
        }
    }

    /// The i32 fast path with the generic add/sub fallback.
    fn emit_incdec_step(&mut self, old: &str, increment: bool) -> String {
        let new = self.fresh_temp();
        self.emit(&format!("HmlValue {};", new));
        self.open_block(&format!("if (hml_tag({}) == HML_I32)", old));
        self.emit(&format!(
            "{} = hml_i32_{}({});",
            new,
            if increment { "inc" } else { "dec" },
            old
        ));
        self.indent -= 1;
        self.open_block("} else");
        let one = self.fresh_temp();
        self.emit(&format!("HmlValue {} = hml_val_i32(1);", one));
        self.emit(&format!(
            "{} = hml_binary_op({}, {}, {});",
            new,
            if increment { "HML_OP_ADD" } else { "HML_OP_SUB" },
            old,
            one
        ));
        self.release_if_needed(&one);
        self.close_block();
        new
    }

    /// Store an owned temp into a named variable: release-old / assign /
    /// retain, with the environment write-through for captured names. The
    /// temp stays owned by the caller.
    pub(super) fn write_var(&mut self, name: &str, temp: &str, line: usize) {
        match self.resolve_ident(name) {
            IdentPlace::Storage {
                c_expr,
                native: Some(ty),
            } => {
                self.emit(&format!("{} = {}({});", c_expr, ty.accessor(), temp));
            }
            IdentPlace::Storage { c_expr, native: None } => {
                self.emit(&format!("hml_release_if_needed({});", c_expr));
                self.emit(&format!("{} = {};", c_expr, temp));
                self.emit(&format!("hml_retain_if_needed({});", c_expr));
                self.emit_env_write_through(name, &c_expr);
            }
            IdentPlace::EnvSlot(slot) => {
                self.emit(&format!("hml_closure_env_set(_env, {}, {});", slot, temp));
            }
            _ => {
                self.error(line, format!("cannot assign to '{}'", name));
            }
        }
    }

    // =========================================================================
    // String interpolation
    // =========================================================================

    fn lower_interp(
        &mut self,
        parts: &[InterpPart],
        line: usize,
    ) -> Result<String, CodeGenError> {
        let mut acc = self.fresh_temp();
        let lead = match parts.first() {
            Some(InterpPart::Text(text)) => escape_c_string(text),
            _ => String::new(),
        };
        self.emit(&format!("HmlValue {} = hml_val_string(\"{}\");", acc, lead));
        let rest = if matches!(parts.first(), Some(InterpPart::Text(_))) {
            &parts[1..]
        } else {
            parts
        };
        for part in rest {
            let pt = match part {
                InterpPart::Text(text) => {
                    let t = self.fresh_temp();
                    self.emit(&format!(
                        "HmlValue {} = hml_val_string(\"{}\");",
                        t,
                        escape_c_string(text)
                    ));
                    t
                }
                InterpPart::Expr(e) => self.lower_expr(e, line)?,
            };
            let next = self.fresh_temp();
            self.emit(&format!("HmlValue {} = hml_string_concat({}, {});", next, acc, pt));
            self.release_if_needed(&pt);
            self.release_if_needed(&acc);
            acc = next;
        }
        Ok(acc)
    }

    // =========================================================================
    // Await
    // =========================================================================

    fn lower_await(&mut self, inner: &Expr, line: usize) -> Result<String, CodeGenError> {
        let vt = self.lower_expr(inner, line)?;
        let t = self.fresh_temp();
        self.emit(&format!("HmlValue {};", t));
        self.open_block(&format!("if (hml_tag({}) == HML_TASK)", vt));
        self.emit(&format!("{} = hml_join({});", t, vt));
        self.indent -= 1;
        self.open_block("} else");
        self.emit(&format!("{} = {};", t, vt));
        self.emit(&format!("hml_retain_if_needed({});", t));
        self.close_block();
        self.release_if_needed(&vt);
        Ok(t)
    }
}

// =========================================================================
// Pure helpers
// =========================================================================

enum NativeOperand {
    IntLit(i64),
    FloatLit(f64),
    Var(NativeType, String),
}

impl NativeOperand {
    fn c_text(&self) -> String {
        match self {
            NativeOperand::IntLit(n) => n.to_string(),
            NativeOperand::FloatLit(f) => c_float(*f),
            NativeOperand::Var(_, c) => c.clone(),
        }
    }
}

/// Render an f64 as a C double literal.
fn c_float(f: f64) -> String {
    if f.is_nan() {
        "NAN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "INFINITY".to_string() } else { "-INFINITY".to_string() }
    } else {
        format!("{:?}", f)
    }
}

enum Folded {
    Int(i64),
    Bool(bool),
}

/// Fold a binary op over two integer literals in two's-complement i64.
/// Division is never folded; neither is modulo by zero.
fn fold_int_binary(op: BinOp, a: i64, b: i64) -> Option<Folded> {
    Some(match op {
        BinOp::Add => Folded::Int(a.wrapping_add(b)),
        BinOp::Sub => Folded::Int(a.wrapping_sub(b)),
        BinOp::Mul => Folded::Int(a.wrapping_mul(b)),
        BinOp::Mod => {
            if b == 0 {
                return None;
            }
            Folded::Int(a.wrapping_rem(b))
        }
        BinOp::BitAnd => Folded::Int(a & b),
        BinOp::BitOr => Folded::Int(a | b),
        BinOp::BitXor => Folded::Int(a ^ b),
        BinOp::Shl => Folded::Int(a.wrapping_shl(b as u32 & 63)),
        BinOp::Shr => Folded::Int(a.wrapping_shr(b as u32 & 63)),
        BinOp::Eq => Folded::Bool(a == b),
        BinOp::Ne => Folded::Bool(a != b),
        BinOp::Lt => Folded::Bool(a < b),
        BinOp::Le => Folded::Bool(a <= b),
        BinOp::Gt => Folded::Bool(a > b),
        BinOp::Ge => Folded::Bool(a >= b),
        BinOp::Div | BinOp::And | BinOp::Or => return None,
    })
}

/// `n = 2^k` for positive k; returns k. One is left to the identity
/// rewrites, zero and negatives are not powers.
fn power_of_two(n: i64) -> Option<i64> {
    if n > 1 && (n & (n - 1)) == 0 {
        Some(n.trailing_zeros() as i64)
    } else {
        None
    }
}

/// Flatten a left-associative `+` chain of 3..=5 operands containing at
/// least one string literal. Returns the operands in evaluation order.
fn collect_concat_chain<'a>(lhs: &'a Expr, rhs: &'a Expr) -> Option<Vec<&'a Expr>> {
    let mut parts: Vec<&Expr> = Vec::new();
    fn flatten<'a>(e: &'a Expr, parts: &mut Vec<&'a Expr>) {
        if let Expr::Binary {
            op: BinOp::Add,
            lhs,
            rhs,
        } = e
        {
            flatten(lhs, parts);
            parts.push(rhs);
        } else {
            parts.push(e);
        }
    }
    flatten(lhs, &mut parts);
    parts.push(rhs);
    if !(3..=5).contains(&parts.len()) {
        return None;
    }
    if !parts.iter().any(|p| matches!(p, Expr::StringLit(_))) {
        return None;
    }
    Some(parts)
}
