//! C Code Generation
//!
//! This module lowers a parsed, name-resolved Hemlock program to a single
//! portable C translation unit that links against the fixed `hml_*`
//! runtime. Code generation is split into focused submodules.
//!
//! # Key Concepts
//!
//! ## Temporaries and ownership
//!
//! Every expression lowers to a fresh `_tN` temp holding one owned
//! reference; the consumer releases it through `hml_release_if_needed`,
//! which skips unboxed primitives. Positional arguments of direct calls
//! transfer ownership to the callee; builtin and generic-dispatch calls
//! borrow, so the caller releases. The retain/release pairing must balance
//! on every control-flow path, including early return, `break`/`continue`,
//! `defer` unwinding, and the catch side of a try frame.
//!
//! ## Closure conversion
//!
//! Function literals are analyzed for free variables against the enclosing
//! scope. Captures live in heap environments: a per-scope shared
//! environment when sibling closures should observe each other's writes, a
//! fresh copied environment otherwise, none at all for capture-free
//! literals. Implementation bodies are deferred to a drain pass so nested
//! closures collect before anything is emitted.
//!
//! ## Emission order
//!
//! All lowering writes into in-memory buffers; the orchestrator assembles
//! them in a fixed section order (prologue, signal constants, FFI handles,
//! globals, forward declarations, implementations, main). The same program
//! always produces byte-identical output.
//!
//! # Module Structure
//!
//! - `state.rs`: CodegenContext, scope tracking, mangling, counters
//! - `error.rs`: error types
//! - `free_vars.rs`: free-variable analysis and structural prescans
//! - `expr.rs`: expression lowering and the peephole rewrites
//! - `builtins.rs`: the builtin table and call dispatch
//! - `methods.rs`: the method-call table
//! - `statements.rs`: statement lowering and early-exit unwinding
//! - `control_flow.rs`: match patterns and try/catch/finally
//! - `closures.rs`: closure conversion and function-body emission
//! - `program.rs`: the multi-pass driver and final assembly
//! - `runtime.rs`: emitted-C prologue and runtime symbol knowledge

mod builtins;
mod closures;
mod control_flow;
mod error;
mod expr;
mod free_vars;
mod methods;
mod program;
mod runtime;
mod state;
mod statements;

pub use error::CodeGenError;
pub use state::{CodegenContext, Diagnostic};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        BinOp, Expr, FnLit, MatchArm, Param, Pattern, Program, Stmt, StmtKind,
    };
    use crate::config::CodegenOptions;
    use crate::modules::{CompiledModule, ModuleCache, ModuleExport};
    use crate::types::{NativeType, TypeTable};
    use std::collections::HashSet;
    use std::path::Path;

    fn stmt(kind: StmtKind) -> Stmt {
        Stmt::new(kind, 1)
    }

    fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    fn call(name: &str, args: Vec<Expr>) -> Expr {
        Expr::Call {
            callee: Box::new(ident(name)),
            args,
        }
    }

    fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn let_stmt(name: &str, init: Expr) -> Stmt {
        stmt(StmtKind::Let {
            name: name.to_string(),
            ty: None,
            init,
            mutable: true,
        })
    }

    fn generate(program: Program) -> String {
        generate_with(program, CodegenOptions::default(), None)
    }

    fn generate_with(
        program: Program,
        options: CodegenOptions,
        types: Option<TypeTable>,
    ) -> String {
        let cache = ModuleCache::new();
        let mut ctx = CodegenContext::new(options, types);
        ctx.run(&program, &cache, Path::new("/proj")).unwrap()
    }

    /// Every generated `_tN`/`_envN` declaration must be unique in the
    /// translation unit.
    fn assert_unique_temps(out: &str) {
        let mut seen = HashSet::new();
        for line in out.lines() {
            let l = line.trim_start();
            for (prefix, stem) in [
                ("HmlValue _t", "_t"),
                ("int _t", "_t"),
                ("int64_t _t", "_t"),
                ("HmlIter _t", "_t"),
                ("HmlTryFrame _t", "_t"),
                ("HmlEnv* _env", "_env"),
            ] {
                if let Some(rest) = l.strip_prefix(prefix) {
                    let digits: String =
                        rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                    if digits.is_empty() {
                        continue;
                    }
                    let after = &rest[digits.len()..];
                    if after.starts_with(" =") || after.starts_with(';') || after.starts_with('[')
                    {
                        let name = format!("{}{}", stem, digits);
                        assert!(seen.insert(name.clone()), "duplicate temp {}", name);
                    }
                }
            }
        }
    }

    // =====================================================================
    // End-to-end scenarios
    // =====================================================================

    #[test]
    fn test_self_referential_closure() {
        // let fact = fn(n) { if (n <= 1) { return 1; } return n * fact(n - 1); };
        // print(fact(5));
        let body = vec![
            stmt(StmtKind::If {
                cond: binary(BinOp::Le, ident("n"), Expr::IntLit(1)),
                then_branch: vec![stmt(StmtKind::Return(Some(Expr::IntLit(1))))],
                else_branch: None,
            }),
            stmt(StmtKind::Return(Some(binary(
                BinOp::Mul,
                ident("n"),
                call("fact", vec![binary(BinOp::Sub, ident("n"), Expr::IntLit(1))]),
            )))),
        ];
        let program = Program::new(vec![
            let_stmt(
                "fact",
                Expr::Function(FnLit {
                    params: vec![Param::new("n")],
                    rest: None,
                    body,
                }),
            ),
            stmt(StmtKind::Expr(call("print", vec![call("fact", vec![Expr::IntLit(5)])]))),
        ]);
        let out = generate(program);
        // the closure captures fact and reads it through the environment
        assert!(out.contains("hml_closure_env_get(_env, 0);"));
        // post-assignment back-patch of fact's slot
        assert!(out.contains("hml_closure_env_set(_env0, 0, _main_fact);"));
        assert!(out.contains("static HmlValue _main_fact;"));
        assert_unique_temps(&out);
    }

    #[test]
    fn test_string_concat_chain_single_call() {
        // let s = "a" + "b" + "c" + "d"; print(s);
        let chain = binary(
            BinOp::Add,
            binary(
                BinOp::Add,
                binary(
                    BinOp::Add,
                    Expr::StringLit("a".into()),
                    Expr::StringLit("b".into()),
                ),
                Expr::StringLit("c".into()),
            ),
            Expr::StringLit("d".into()),
        );
        let program = Program::new(vec![
            let_stmt("s", chain),
            stmt(StmtKind::Expr(call("print", vec![ident("s")]))),
        ]);
        let out = generate(program);
        assert_eq!(out.matches("hml_string_concat4(").count(), 1);
        assert!(!out.contains("hml_binary_op(HML_OP_ADD"));
    }

    #[test]
    fn test_unboxed_native_arithmetic() {
        // let x: i32 = 10; let y: i32 = 32; print(x + y);
        let mut table = TypeTable::new();
        table.mark("main", "x", NativeType::I32);
        table.mark("main", "y", NativeType::I32);
        let program = Program::new(vec![
            stmt(StmtKind::Let {
                name: "x".to_string(),
                ty: Some(crate::ast::TypeAnn::Primitive("i32".to_string())),
                init: Expr::IntLit(10),
                mutable: true,
            }),
            stmt(StmtKind::Let {
                name: "y".to_string(),
                ty: Some(crate::ast::TypeAnn::Primitive("i32".to_string())),
                init: Expr::IntLit(32),
                mutable: true,
            }),
            stmt(StmtKind::Expr(call(
                "print",
                vec![binary(BinOp::Add, ident("x"), ident("y"))],
            ))),
        ]);
        let out = generate_with(program, CodegenOptions::default(), Some(table));
        assert!(out.contains("static int32_t _main_x;"));
        assert!(out.contains("_main_x = 10;"));
        assert!(out.contains("hml_val_i32(_main_x + _main_y)"));
        assert!(!out.contains("hml_binary_op(HML_OP_ADD"));
    }

    #[test]
    fn test_tail_recursive_accumulator() {
        // let sum = fn(n, acc) { if (n == 0) { return acc; }
        //                        return sum(n - 1, acc + n); };
        let body = vec![
            stmt(StmtKind::If {
                cond: binary(BinOp::Eq, ident("n"), Expr::IntLit(0)),
                then_branch: vec![stmt(StmtKind::Return(Some(ident("acc"))))],
                else_branch: None,
            }),
            stmt(StmtKind::Return(Some(call(
                "sum",
                vec![
                    binary(BinOp::Sub, ident("n"), Expr::IntLit(1)),
                    binary(BinOp::Add, ident("acc"), ident("n")),
                ],
            )))),
        ];
        let program = Program::new(vec![
            let_stmt(
                "sum",
                Expr::Function(FnLit {
                    params: vec![Param::new("n"), Param::new("acc")],
                    rest: None,
                    body,
                }),
            ),
            stmt(StmtKind::Expr(call(
                "print",
                vec![call("sum", vec![Expr::IntLit(100000), Expr::IntLit(0)])],
            ))),
        ]);
        let out = generate_with(
            program,
            CodegenOptions::default().with_tail_calls(true),
            None,
        );
        assert!(out.contains("_tco:;"));
        assert!(out.contains("goto _tco;"));
        assert_unique_temps(&out);
    }

    #[test]
    fn test_match_array_pattern_with_rest() {
        // match [1,2,3,4] { case [h, ...t]: print(h); print(t.length); }
        let subject = Expr::ArrayLit(vec![
            Expr::IntLit(1),
            Expr::IntLit(2),
            Expr::IntLit(3),
            Expr::IntLit(4),
        ]);
        let arm = MatchArm {
            pattern: Pattern::Array {
                elements: vec![Pattern::Binding("h".to_string())],
                rest: Some("t".to_string()),
            },
            body: vec![
                stmt(StmtKind::Expr(call("print", vec![ident("h")]))),
                stmt(StmtKind::Expr(call(
                    "print",
                    vec![Expr::Property {
                        object: Box::new(ident("t")),
                        name: "length".to_string(),
                    }],
                ))),
            ],
        };
        let program = Program::new(vec![stmt(StmtKind::Match {
            subject,
            arms: vec![arm],
        })]);
        let out = generate(program);
        assert!(out.contains("== HML_ARRAY"));
        assert!(out.contains(">= 1"));
        assert!(out.contains("hml_array_slice_from("));
        assert!(out.contains("hml_value_length("));
        assert_unique_temps(&out);
    }

    #[test]
    fn test_spawn_and_channel() {
        // let c = channel(1); spawn(fn() { c.send(42); }); print(c.recv());
        let program = Program::new(vec![
            let_stmt("c", call("channel", vec![Expr::IntLit(1)])),
            stmt(StmtKind::Expr(call(
                "spawn",
                vec![Expr::Function(FnLit {
                    params: vec![],
                    rest: None,
                    body: vec![stmt(StmtKind::Expr(Expr::MethodCall {
                        object: Box::new(ident("c")),
                        method: "send".to_string(),
                        args: vec![Expr::IntLit(42)],
                    }))],
                })],
            ))),
            stmt(StmtKind::Expr(call(
                "print",
                vec![Expr::MethodCall {
                    object: Box::new(ident("c")),
                    method: "recv".to_string(),
                    args: vec![],
                }],
            ))),
        ]);
        let out = generate(program);
        assert!(out.contains("hml_channel(_t"));
        assert!(out.contains("hml_spawn("));
        assert!(out.contains("hml_channel_send"));
        assert!(out.contains("hml_channel_recv"));
        // the closure reaches c through its environment
        assert!(out.contains("hml_closure_env_get(_env, 0);"));
        assert_unique_temps(&out);
    }

    // =====================================================================
    // Structural properties
    // =====================================================================

    #[test]
    fn test_emission_section_order() {
        let mut cache = ModuleCache::new();
        let mut module = CompiledModule::new("m1_", "/proj/util.hml");
        module.statements = vec![
            stmt(StmtKind::Export(Box::new(stmt(StmtKind::Function {
                name: "helper".to_string(),
                func: FnLit {
                    params: vec![Param::new("x")],
                    rest: None,
                    body: vec![stmt(StmtKind::Return(Some(ident("x"))))],
                },
            })))),
            stmt(StmtKind::Export(Box::new(let_stmt("version", Expr::IntLit(1))))),
        ];
        module.exports.insert(
            "helper".to_string(),
            ModuleExport {
                mangled: "hml_fn_m1_helper".to_string(),
                is_function: true,
                arity: 1,
                has_rest: false,
            },
        );
        module.exports.insert(
            "version".to_string(),
            ModuleExport {
                mangled: "m1_version".to_string(),
                is_function: false,
                arity: 0,
                has_rest: false,
            },
        );
        cache.insert(module);

        let program = Program::new(vec![
            stmt(StmtKind::Import {
                names: vec![("helper".to_string(), "helper".to_string())],
                path: "./util.hml".to_string(),
                namespace: None,
            }),
            stmt(StmtKind::ExternFn(crate::ast::ExternFn {
                name: "cos_raw".to_string(),
                lib: "libm.so.6".to_string(),
                params: vec!["f64".to_string()],
                ret: "f64".to_string(),
            })),
            stmt(StmtKind::Function {
                name: "double".to_string(),
                func: FnLit {
                    params: vec![Param::new("x")],
                    rest: None,
                    body: vec![stmt(StmtKind::Return(Some(binary(
                        BinOp::Add,
                        ident("x"),
                        ident("x"),
                    ))))],
                },
            }),
            let_stmt(
                "f",
                Expr::Function(FnLit {
                    params: vec![],
                    rest: None,
                    body: vec![stmt(StmtKind::Return(Some(Expr::IntLit(1))))],
                }),
            ),
            stmt(StmtKind::Expr(call("print", vec![call("helper", vec![Expr::IntLit(2)])]))),
        ]);

        let mut ctx = CodegenContext::new(CodegenOptions::default(), None);
        let out = ctx.run(&program, &cache, Path::new("/proj")).unwrap();

        let pos = |needle: &str| {
            out.find(needle)
                .unwrap_or_else(|| panic!("missing section marker: {}", needle))
        };
        let prologue = pos("#include \"hemlock_runtime.h\"");
        let signals = pos("#define HML_SIGINT");
        let ffi_handle = pos("static void* _ffi_lib_handle");
        let globals = pos("static HmlValue _main_");
        let closure_decl = pos("static HmlValue _closure_0(HmlEnv*");
        let module_global = pos("static HmlValue m1_version;");
        let module_fn_decl = pos("static HmlValue hml_fn_m1_helper(HmlEnv*");
        let init_decl = pos("static void _mod_init_m1_(void);");
        let named_decl = pos("static HmlValue hml_fn_double(HmlEnv*");
        let closure_impl = pos("static HmlValue _closure_0(HmlEnv* _env) {");
        let ffi_wrapper = pos("hml_ffi_sym(");
        let module_fn_impl = pos("static HmlValue hml_fn_m1_helper(HmlEnv* _env, HmlValue x) {");
        let init_impl = pos("static void _mod_init_m1_(void) {");
        let named_impl = pos("static HmlValue hml_fn_double(HmlEnv* _env, HmlValue x) {");
        let main_impl = pos("int main(int argc, char** argv) {");

        let order = [
            prologue,
            signals,
            ffi_handle,
            globals,
            closure_decl,
            module_global,
            module_fn_decl,
            init_decl,
            named_decl,
            closure_impl,
            ffi_wrapper,
            module_fn_impl,
            init_impl,
            named_impl,
            main_impl,
        ];
        for pair in order.windows(2) {
            assert!(pair[0] < pair[1], "sections out of order: {:?}", order);
        }
        assert_unique_temps(&out);
    }

    #[test]
    fn test_module_init_is_guarded_and_called() {
        let mut cache = ModuleCache::new();
        let mut module = CompiledModule::new("m1_", "/proj/m.hml");
        module.statements = vec![stmt(StmtKind::Export(Box::new(let_stmt(
            "x",
            Expr::IntLit(7),
        ))))];
        module.exports.insert(
            "x".to_string(),
            ModuleExport {
                mangled: "m1_x".to_string(),
                is_function: false,
                arity: 0,
                has_rest: false,
            },
        );
        cache.insert(module);

        let program = Program::new(vec![
            stmt(StmtKind::Import {
                names: vec![("x".to_string(), "x".to_string())],
                path: "./m.hml".to_string(),
                namespace: None,
            }),
            stmt(StmtKind::Expr(call("print", vec![ident("x")]))),
        ]);
        let mut ctx = CodegenContext::new(CodegenOptions::default(), None);
        let out = ctx.run(&program, &cache, Path::new("/proj")).unwrap();

        assert!(out.contains("static int _done = 0;"));
        assert!(out.contains("if (_done) return;"));
        assert!(out.contains("_done = 1;"));
        assert!(out.contains("_mod_init_m1_();"));
        // the import binding resolves to the module's global
        assert!(out.contains("= m1_x;"));
    }

    #[test]
    fn test_builtin_emission_deterministic_across_runs() {
        let build = || {
            Program::new(vec![
                let_stmt("x", call("rand_range", vec![Expr::IntLit(1), Expr::IntLit(6)])),
                stmt(StmtKind::Expr(call("print", vec![ident("x")]))),
            ])
        };
        assert_eq!(generate(build()), generate(build()));
    }

    #[test]
    fn test_failed_compilation_reports_all_diagnostics() {
        let program = Program::new(vec![
            stmt(StmtKind::Let {
                name: "k".to_string(),
                ty: None,
                init: Expr::IntLit(1),
                mutable: false,
            }),
            stmt(StmtKind::Expr(Expr::Assign {
                target: Box::new(ident("k")),
                value: Box::new(Expr::IntLit(2)),
            })),
            stmt(StmtKind::Expr(ident("missing"))),
        ]);
        let cache = ModuleCache::new();
        let mut ctx = CodegenContext::new(CodegenOptions::default(), None);
        let err = ctx.run(&program, &cache, Path::new("/proj")).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("constant 'k'"));
        assert!(text.contains("missing"));
    }

    #[test]
    fn test_stack_check_hooks() {
        let program = Program::new(vec![stmt(StmtKind::Function {
            name: "f".to_string(),
            func: FnLit {
                params: vec![],
                rest: None,
                body: vec![stmt(StmtKind::Return(Some(Expr::IntLit(1))))],
            },
        })]);
        let out = generate_with(
            program,
            CodegenOptions::default().with_stack_check(true),
            None,
        );
        assert!(out.contains("hml_stack_enter();"));
        assert!(out.contains("hml_stack_exit();"));
    }

    #[test]
    fn test_sandbox_init_emitted() {
        let program = Program::new(vec![]);
        let mut options = CodegenOptions::default();
        options.sandbox.enabled = true;
        options.sandbox.allow_net = true;
        options.sandbox.root = Some("/srv/box".into());
        let out = generate_with(program, options, None);
        assert!(out.contains("hml_sandbox_init(1, \"/srv/box\");"));
    }

    #[test]
    fn test_main_body_frame() {
        let out = generate(Program::new(vec![]));
        let init = out.find("hml_runtime_init(argc, argv);").unwrap();
        let args = out.find("_main_args = hml_args_create(argc, argv);").unwrap();
        let cleanup = out.find("hml_runtime_cleanup();").unwrap();
        let ret = out.find("return 0;").unwrap();
        assert!(init < args && args < cleanup && cleanup < ret);
        assert!(out.contains("static HmlValue _main_args;"));
    }

    #[test]
    fn test_param_release_balance_in_function() {
        // fn f(a) { let b = a; return b; } - b released on the return
        // path, a released as a parameter, each exactly once per path.
        let program = Program::new(vec![stmt(StmtKind::Function {
            name: "f".to_string(),
            func: FnLit {
                params: vec![Param::new("a")],
                rest: None,
                body: vec![
                    let_stmt("b", ident("a")),
                    stmt(StmtKind::Return(Some(ident("b")))),
                ],
            },
        })]);
        let out = generate(program);
        let body_start = out.find("static HmlValue hml_fn_f(HmlEnv* _env, HmlValue a) {").unwrap();
        let body_end = body_start + out[body_start..].find("\n}\n").unwrap();
        let body = &out[body_start..body_end];
        assert_eq!(body.matches("hml_release_if_needed(a);").count(), 1);
        assert_eq!(body.matches("hml_release_if_needed(b);").count(), 1);
    }
}
