//! Free-variable analysis for closure conversion
//!
//! Given a function body and the names bound by the function itself, this
//! pass returns every identifier the body references from an enclosing
//! scope, in first-reference order. References made by nested function
//! literals count too: the enclosing closure must capture them so the inner
//! one can in turn capture from it.
//!
//! The analyzer reports raw names; the closure emitter decides which of
//! them are actually capturable (locals of the enclosing scope) and which
//! resolve to globals, builtins, or module exports instead.

use crate::ast::{Expr, FnLit, InterpPart, MatchArm, Pattern, Stmt, StmtKind};

struct Scope {
    stack: Vec<Vec<String>>,
    free: Vec<String>,
}

impl Scope {
    fn bound(&self, name: &str) -> bool {
        self.stack.iter().any(|s| s.iter().any(|n| n == name))
    }

    fn bind(&mut self, name: &str) {
        self.stack
            .last_mut()
            .expect("scope stack never empty")
            .push(name.to_string());
    }

    fn reference(&mut self, name: &str) {
        if !self.bound(name) && !self.free.iter().any(|n| n == name) {
            self.free.push(name.to_string());
        }
    }

    fn enter(&mut self) {
        self.stack.push(Vec::new());
    }

    fn exit(&mut self) {
        self.stack.pop();
    }
}

/// Compute the free variables of a function with the given parameter names.
pub(super) fn free_variables(params: &[String], rest: Option<&str>, body: &[Stmt]) -> Vec<String> {
    let mut base: Vec<String> = params.to_vec();
    if let Some(r) = rest {
        base.push(r.to_string());
    }
    let mut scope = Scope {
        stack: vec![base],
        free: Vec::new(),
    };
    walk_stmts(body, &mut scope);
    scope.free
}

fn walk_stmts(stmts: &[Stmt], scope: &mut Scope) {
    for stmt in stmts {
        walk_stmt(stmt, scope);
    }
}

fn walk_stmt(stmt: &Stmt, scope: &mut Scope) {
    match &stmt.kind {
        StmtKind::Let { name, init, .. } => {
            // The initializer sees the outer binding, not the new one.
            walk_expr(init, scope);
            scope.bind(name);
        }
        StmtKind::Expr(e) => walk_expr(e, scope),
        StmtKind::Block(body) => {
            scope.enter();
            walk_stmts(body, scope);
            scope.exit();
        }
        StmtKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            walk_expr(cond, scope);
            scope.enter();
            walk_stmts(then_branch, scope);
            scope.exit();
            if let Some(eb) = else_branch {
                scope.enter();
                walk_stmts(eb, scope);
                scope.exit();
            }
        }
        StmtKind::While { cond, body } => {
            walk_expr(cond, scope);
            scope.enter();
            walk_stmts(body, scope);
            scope.exit();
        }
        StmtKind::For {
            init,
            cond,
            update,
            body,
        } => {
            scope.enter();
            if let Some(i) = init {
                walk_stmt(i, scope);
            }
            if let Some(c) = cond {
                walk_expr(c, scope);
            }
            if let Some(u) = update {
                walk_expr(u, scope);
            }
            walk_stmts(body, scope);
            scope.exit();
        }
        StmtKind::ForIn {
            var,
            index_var,
            iterable,
            body,
        } => {
            walk_expr(iterable, scope);
            scope.enter();
            scope.bind(var);
            if let Some(iv) = index_var {
                scope.bind(iv);
            }
            walk_stmts(body, scope);
            scope.exit();
        }
        StmtKind::Match { subject, arms } => {
            walk_expr(subject, scope);
            for arm in arms {
                walk_arm(arm, scope);
            }
        }
        StmtKind::Try {
            body,
            catch_var,
            catch_body,
            finally_body,
        } => {
            scope.enter();
            walk_stmts(body, scope);
            scope.exit();
            scope.enter();
            scope.bind(catch_var);
            walk_stmts(catch_body, scope);
            scope.exit();
            if let Some(fb) = finally_body {
                scope.enter();
                walk_stmts(fb, scope);
                scope.exit();
            }
        }
        StmtKind::Return(Some(e)) => walk_expr(e, scope),
        StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue => {}
        StmtKind::Defer(body) => {
            scope.enter();
            walk_stmts(body, scope);
            scope.exit();
        }
        StmtKind::Function { name, func } => {
            scope.bind(name);
            walk_fn_literal(func, scope);
        }
        StmtKind::ExternFn(_) | StmtKind::Import { .. } | StmtKind::TypeDef(_) => {}
        StmtKind::Export(inner) => walk_stmt(inner, scope),
        StmtKind::Enum { name, .. } => scope.bind(name),
    }
}

fn walk_arm(arm: &MatchArm, scope: &mut Scope) {
    scope.enter();
    let mut bindings = Vec::new();
    arm.pattern.binding_names(&mut bindings);
    walk_pattern(&arm.pattern, scope);
    for b in bindings {
        scope.bind(&b);
    }
    walk_stmts(&arm.body, scope);
    scope.exit();
}

fn walk_pattern(pattern: &Pattern, scope: &mut Scope) {
    match pattern {
        Pattern::Literal(e) => walk_expr(e, scope),
        Pattern::Range { lo, hi } => {
            walk_expr(lo, scope);
            walk_expr(hi, scope);
        }
        Pattern::Array { elements, .. } => {
            for p in elements {
                walk_pattern(p, scope);
            }
        }
        Pattern::Object { fields } => {
            for (_, p) in fields {
                walk_pattern(p, scope);
            }
        }
        Pattern::Or(alts) => {
            for p in alts {
                walk_pattern(p, scope);
            }
        }
        Pattern::Wildcard | Pattern::Binding(_) | Pattern::Type(_) => {}
    }
}

fn walk_fn_literal(func: &FnLit, scope: &mut Scope) {
    // A nested function opens its own scope layer; anything it references
    // beyond its own parameters and locals surfaces as free here, which is
    // exactly the conservative inclusion closure conversion needs.
    scope.enter();
    for p in &func.params {
        scope.bind(&p.name);
    }
    if let Some(r) = &func.rest {
        scope.bind(r);
    }
    walk_stmts(&func.body, scope);
    scope.exit();
}

fn walk_expr(expr: &Expr, scope: &mut Scope) {
    match expr {
        Expr::Ident(name) => scope.reference(name),
        Expr::Binary { lhs, rhs, .. } => {
            walk_expr(lhs, scope);
            walk_expr(rhs, scope);
        }
        Expr::Unary { operand, .. } => walk_expr(operand, scope),
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            walk_expr(cond, scope);
            walk_expr(then, scope);
            walk_expr(otherwise, scope);
        }
        Expr::NullCoalesce { lhs, rhs } => {
            walk_expr(lhs, scope);
            walk_expr(rhs, scope);
        }
        Expr::OptionalChain { object, .. } => walk_expr(object, scope),
        Expr::Assign { target, value } => {
            walk_expr(target, scope);
            walk_expr(value, scope);
        }
        Expr::Call { callee, args } => {
            walk_expr(callee, scope);
            for a in args {
                walk_expr(a, scope);
            }
        }
        Expr::MethodCall { object, args, .. } => {
            walk_expr(object, scope);
            for a in args {
                walk_expr(a, scope);
            }
        }
        Expr::Property { object, .. } => walk_expr(object, scope),
        Expr::Index { object, index } => {
            walk_expr(object, scope);
            walk_expr(index, scope);
        }
        Expr::ArrayLit(items) => {
            for e in items {
                walk_expr(e, scope);
            }
        }
        Expr::ObjectLit(fields) => {
            for (_, e) in fields {
                walk_expr(e, scope);
            }
        }
        Expr::Function(func) => walk_fn_literal(func, scope),
        Expr::PreIncDec { target, .. } | Expr::PostIncDec { target, .. } => {
            walk_expr(target, scope)
        }
        Expr::Interp(parts) => {
            for part in parts {
                if let InterpPart::Expr(e) = part {
                    walk_expr(e, scope);
                }
            }
        }
        Expr::Await(inner) | Expr::Spread(inner) => walk_expr(inner, scope),
        Expr::Range { start, end } => {
            walk_expr(start, scope);
            walk_expr(end, scope);
        }
        Expr::IntLit(_)
        | Expr::FloatLit(_)
        | Expr::StringLit(_)
        | Expr::BoolLit(_)
        | Expr::RuneLit(_)
        | Expr::NullLit => {}
    }
}

// =========================================================================
// Structural prescans used by the statement and closure emitters
// =========================================================================

/// Does this body contain a defer statement? Defers inside nested function
/// literals belong to those functions and do not count.
pub(super) fn contains_defer(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|s| stmt_contains_defer(s))
}

fn stmt_contains_defer(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Defer(_) => true,
        StmtKind::Block(b) | StmtKind::While { body: b, .. } => contains_defer(b),
        StmtKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            contains_defer(then_branch)
                || else_branch.as_ref().is_some_and(|e| contains_defer(e))
        }
        StmtKind::For { init, body, .. } => {
            init.as_ref().is_some_and(|i| stmt_contains_defer(i)) || contains_defer(body)
        }
        StmtKind::ForIn { body, .. } => contains_defer(body),
        StmtKind::Match { arms, .. } => arms.iter().any(|a| contains_defer(&a.body)),
        StmtKind::Try {
            body,
            catch_body,
            finally_body,
            ..
        } => {
            contains_defer(body)
                || contains_defer(catch_body)
                || finally_body.as_ref().is_some_and(|f| contains_defer(f))
        }
        StmtKind::Export(inner) => stmt_contains_defer(inner),
        _ => false,
    }
}

/// Names bound by `let`, `fn`, and `enum` anywhere in this body, at any
/// block depth, not descending into nested function literals. Used by the
/// shared-environment prescan.
pub(super) fn declared_names(stmts: &[Stmt], out: &mut Vec<String>) {
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::Let { name, .. }
            | StmtKind::Function { name, .. }
            | StmtKind::Enum { name, .. } => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            StmtKind::Block(b) | StmtKind::While { body: b, .. } => declared_names(b, out),
            StmtKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                declared_names(then_branch, out);
                if let Some(eb) = else_branch {
                    declared_names(eb, out);
                }
            }
            StmtKind::For { init, body, .. } => {
                if let Some(i) = init {
                    declared_names(std::slice::from_ref(i.as_ref()), out);
                }
                declared_names(body, out);
            }
            StmtKind::ForIn { var, index_var, body, .. } => {
                if !out.contains(var) {
                    out.push(var.clone());
                }
                if let Some(iv) = index_var
                    && !out.contains(iv)
                {
                    out.push(iv.clone());
                }
                declared_names(body, out);
            }
            StmtKind::Match { arms, .. } => {
                for arm in arms {
                    declared_names(&arm.body, out);
                }
            }
            StmtKind::Try {
                body,
                catch_body,
                finally_body,
                ..
            } => {
                declared_names(body, out);
                declared_names(catch_body, out);
                if let Some(fb) = finally_body {
                    declared_names(fb, out);
                }
            }
            StmtKind::Export(inner) => declared_names(std::slice::from_ref(inner.as_ref()), out),
            _ => {}
        }
    }
}

/// Collect function literals appearing in this body that are not nested
/// inside another function literal. Their free variables decide the
/// enclosing scope's shared-environment layout.
pub(super) fn toplevel_fn_literals<'a>(stmts: &'a [Stmt], out: &mut Vec<&'a FnLit>) {
    for stmt in stmts {
        stmt_fn_literals(stmt, out);
    }
}

fn stmt_fn_literals<'a>(stmt: &'a Stmt, out: &mut Vec<&'a FnLit>) {
    match &stmt.kind {
        StmtKind::Let { init, .. } => expr_fn_literals(init, out),
        StmtKind::Expr(e) => expr_fn_literals(e, out),
        StmtKind::Block(b) | StmtKind::While { body: b, .. } => toplevel_fn_literals(b, out),
        StmtKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            expr_fn_literals(cond, out);
            toplevel_fn_literals(then_branch, out);
            if let Some(eb) = else_branch {
                toplevel_fn_literals(eb, out);
            }
        }
        StmtKind::For {
            init,
            cond,
            update,
            body,
        } => {
            if let Some(i) = init {
                stmt_fn_literals(i, out);
            }
            if let Some(c) = cond {
                expr_fn_literals(c, out);
            }
            if let Some(u) = update {
                expr_fn_literals(u, out);
            }
            toplevel_fn_literals(body, out);
        }
        StmtKind::ForIn { iterable, body, .. } => {
            expr_fn_literals(iterable, out);
            toplevel_fn_literals(body, out);
        }
        StmtKind::While { cond, body } => {
            expr_fn_literals(cond, out);
            toplevel_fn_literals(body, out);
        }
        StmtKind::Match { subject, arms } => {
            expr_fn_literals(subject, out);
            for arm in arms {
                toplevel_fn_literals(&arm.body, out);
            }
        }
        StmtKind::Try {
            body,
            catch_body,
            finally_body,
            ..
        } => {
            toplevel_fn_literals(body, out);
            toplevel_fn_literals(catch_body, out);
            if let Some(fb) = finally_body {
                toplevel_fn_literals(fb, out);
            }
        }
        StmtKind::Return(Some(e)) => expr_fn_literals(e, out),
        StmtKind::Defer(body) => toplevel_fn_literals(body, out),
        StmtKind::Export(inner) => stmt_fn_literals(inner, out),
        _ => {}
    }
}

fn expr_fn_literals<'a>(expr: &'a Expr, out: &mut Vec<&'a FnLit>) {
    match expr {
        Expr::Function(f) => out.push(f),
        Expr::Binary { lhs, rhs, .. } => {
            expr_fn_literals(lhs, out);
            expr_fn_literals(rhs, out);
        }
        Expr::Unary { operand, .. } => expr_fn_literals(operand, out),
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            expr_fn_literals(cond, out);
            expr_fn_literals(then, out);
            expr_fn_literals(otherwise, out);
        }
        Expr::NullCoalesce { lhs, rhs } => {
            expr_fn_literals(lhs, out);
            expr_fn_literals(rhs, out);
        }
        Expr::OptionalChain { object, .. } => expr_fn_literals(object, out),
        Expr::Assign { target, value } => {
            expr_fn_literals(target, out);
            expr_fn_literals(value, out);
        }
        Expr::Call { callee, args } => {
            expr_fn_literals(callee, out);
            for a in args {
                expr_fn_literals(a, out);
            }
        }
        Expr::MethodCall { object, args, .. } => {
            expr_fn_literals(object, out);
            for a in args {
                expr_fn_literals(a, out);
            }
        }
        Expr::Property { object, .. } => expr_fn_literals(object, out),
        Expr::Index { object, index } => {
            expr_fn_literals(object, out);
            expr_fn_literals(index, out);
        }
        Expr::ArrayLit(items) => {
            for e in items {
                expr_fn_literals(e, out);
            }
        }
        Expr::ObjectLit(fields) => {
            for (_, e) in fields {
                expr_fn_literals(e, out);
            }
        }
        Expr::Interp(parts) => {
            for part in parts {
                if let InterpPart::Expr(e) = part {
                    expr_fn_literals(e, out);
                }
            }
        }
        Expr::Await(inner) | Expr::Spread(inner) => expr_fn_literals(inner, out),
        Expr::Range { start, end } => {
            expr_fn_literals(start, out);
            expr_fn_literals(end, out);
        }
        _ => {}
    }
}

/// Does this body contain `return <name>(...)` anywhere? Returns are tail
/// position by construction, so this is the syntactic self-tail-recursion
/// test for the tail-call rewrite.
pub(super) fn has_self_tail_return(stmts: &[Stmt], name: &str) -> bool {
    stmts.iter().any(|s| stmt_has_self_tail_return(s, name))
}

fn stmt_has_self_tail_return(stmt: &Stmt, name: &str) -> bool {
    match &stmt.kind {
        StmtKind::Return(Some(Expr::Call { callee, .. })) => {
            matches!(callee.as_ref(), Expr::Ident(n) if n == name)
        }
        StmtKind::Block(b) | StmtKind::While { body: b, .. } => has_self_tail_return(b, name),
        StmtKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            has_self_tail_return(then_branch, name)
                || else_branch
                    .as_ref()
                    .is_some_and(|e| has_self_tail_return(e, name))
        }
        StmtKind::For { body, .. } | StmtKind::ForIn { body, .. } => {
            has_self_tail_return(body, name)
        }
        StmtKind::Match { arms, .. } => arms.iter().any(|a| has_self_tail_return(&a.body, name)),
        StmtKind::Try {
            body,
            catch_body,
            finally_body,
            ..
        } => {
            has_self_tail_return(body, name)
                || has_self_tail_return(catch_body, name)
                || finally_body
                    .as_ref()
                    .is_some_and(|f| has_self_tail_return(f, name))
        }
        StmtKind::Export(inner) => stmt_has_self_tail_return(inner, name),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, Param};

    fn stmt(kind: StmtKind) -> Stmt {
        Stmt::new(kind, 1)
    }

    fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    #[test]
    fn test_free_variables_basic() {
        // fn(n) { return n * outer; }
        let body = vec![stmt(StmtKind::Return(Some(Expr::Binary {
            op: BinOp::Mul,
            lhs: Box::new(ident("n")),
            rhs: Box::new(ident("outer")),
        })))];
        let free = free_variables(&["n".to_string()], None, &body);
        assert_eq!(free, vec!["outer".to_string()]);
    }

    #[test]
    fn test_let_binds_after_initializer() {
        // let x = x; the initializer's x is free
        let body = vec![
            stmt(StmtKind::Let {
                name: "x".to_string(),
                ty: None,
                init: ident("x"),
                mutable: true,
            }),
            stmt(StmtKind::Expr(ident("x"))),
        ];
        let free = free_variables(&[], None, &body);
        assert_eq!(free, vec!["x".to_string()]);
    }

    #[test]
    fn test_nested_function_references_propagate() {
        // fn(a) { let g = fn(b) { return a + b + far; }; }
        let inner = FnLit {
            params: vec![Param::new("b")],
            rest: None,
            body: vec![stmt(StmtKind::Return(Some(Expr::Binary {
                op: BinOp::Add,
                lhs: Box::new(Expr::Binary {
                    op: BinOp::Add,
                    lhs: Box::new(ident("a")),
                    rhs: Box::new(ident("b")),
                }),
                rhs: Box::new(ident("far")),
            })))],
        };
        let body = vec![stmt(StmtKind::Let {
            name: "g".to_string(),
            ty: None,
            init: Expr::Function(inner),
            mutable: true,
        })];
        let free = free_variables(&["a".to_string()], None, &body);
        // `a` is bound here; `far` is free and must be captured so the
        // inner closure can reach it
        assert_eq!(free, vec!["far".to_string()]);
    }

    #[test]
    fn test_catch_var_shadows() {
        let body = vec![stmt(StmtKind::Try {
            body: vec![],
            catch_var: "e".to_string(),
            catch_body: vec![stmt(StmtKind::Expr(ident("e")))],
            finally_body: None,
        })];
        let free = free_variables(&[], None, &body);
        assert!(free.is_empty());
    }

    #[test]
    fn test_first_reference_order_dedup() {
        let body = vec![
            stmt(StmtKind::Expr(ident("b"))),
            stmt(StmtKind::Expr(ident("a"))),
            stmt(StmtKind::Expr(ident("b"))),
        ];
        let free = free_variables(&[], None, &body);
        assert_eq!(free, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_contains_defer_skips_nested_fns() {
        let nested = FnLit {
            params: vec![],
            rest: None,
            body: vec![stmt(StmtKind::Defer(vec![]))],
        };
        let body = vec![stmt(StmtKind::Expr(Expr::Function(nested)))];
        assert!(!contains_defer(&body));
        let direct = vec![stmt(StmtKind::Defer(vec![]))];
        assert!(contains_defer(&direct));
    }

    #[test]
    fn test_self_tail_return_detection() {
        let recur = vec![stmt(StmtKind::Return(Some(Expr::Call {
            callee: Box::new(ident("sum")),
            args: vec![ident("n")],
        })))];
        assert!(has_self_tail_return(&recur, "sum"));
        assert!(!has_self_tail_return(&recur, "other"));
    }
}
