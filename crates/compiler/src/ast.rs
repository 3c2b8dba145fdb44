//! Abstract Syntax Tree for Hemlock
//!
//! This is the input contract of the code generator: the parser and the
//! name-resolution pass produce this tree, the type checker may annotate it
//! through the side table in `types.rs`, and code generation consumes it
//! read-only. Every statement carries the 1-based source line it started on
//! so generator diagnostics can point back at the source.

/// Binary operators, matching the runtime's `hml_binary_op` opcode set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinOp {
    /// The runtime opcode constant emitted for the generic `hml_binary_op` path.
    pub fn runtime_op(self) -> &'static str {
        match self {
            BinOp::Add => "HML_OP_ADD",
            BinOp::Sub => "HML_OP_SUB",
            BinOp::Mul => "HML_OP_MUL",
            BinOp::Div => "HML_OP_DIV",
            BinOp::Mod => "HML_OP_MOD",
            BinOp::Eq => "HML_OP_EQ",
            BinOp::Ne => "HML_OP_NE",
            BinOp::Lt => "HML_OP_LT",
            BinOp::Le => "HML_OP_LE",
            BinOp::Gt => "HML_OP_GT",
            BinOp::Ge => "HML_OP_GE",
            BinOp::And => "HML_OP_AND",
            BinOp::Or => "HML_OP_OR",
            BinOp::BitAnd => "HML_OP_BITAND",
            BinOp::BitOr => "HML_OP_BITOR",
            BinOp::BitXor => "HML_OP_BITXOR",
            BinOp::Shl => "HML_OP_SHL",
            BinOp::Shr => "HML_OP_SHR",
        }
    }

    /// The C infix operator used when both operands are unboxed natives.
    pub fn c_op(self) -> Option<&'static str> {
        Some(match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Mod => "%",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            _ => return None,
        })
    }

    /// Integer fast-path suffix for the tagged i32/i64 runtime entry points
    /// (`hml_i32_add`, `hml_i64_lshift`, ...). Division is excluded: it always
    /// produces an f64 through the generic path.
    pub fn fast_path_suffix(self) -> Option<&'static str> {
        Some(match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Mod => "mod",
            BinOp::BitAnd => "and",
            BinOp::BitOr => "or",
            BinOp::BitXor => "xor",
            BinOp::Shl => "lshift",
            BinOp::Shr => "rshift",
            _ => return None,
        })
    }
}

/// Unary operators, matching the runtime's `hml_unary_op` opcode set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

impl UnOp {
    pub fn runtime_op(self) -> &'static str {
        match self {
            UnOp::Neg => "HML_OP_NEG",
            UnOp::Not => "HML_OP_NOT",
            UnOp::BitNot => "HML_OP_BITNOT",
        }
    }
}

/// A function parameter. `by_ref` parameters receive the address of the
/// caller's storage; `default_null` marks trailing optional parameters that
/// callers may omit (the call site fills them with null).
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub by_ref: bool,
    pub default_null: bool,
}

impl Param {
    pub fn new(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            by_ref: false,
            default_null: false,
        }
    }

    pub fn by_ref(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            by_ref: true,
            default_null: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            by_ref: false,
            default_null: true,
        }
    }
}

/// A type annotation on a `let`/`const` binding.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeAnn {
    /// Primitive coercion: `let x: i32 = ...`
    Primitive(String),
    /// Typed array: `let xs: [i32] = ...`
    Array(String),
    /// Nominal object type: `let p: Point = ...`
    Object(String),
}

/// Patterns for `match` arms.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// `_` - always matches, binds nothing
    Wildcard,
    /// A literal expression compared for equality
    Literal(Expr),
    /// A bare identifier - always matches, binds one name
    Binding(String),
    /// `[a, b, ...rest]` - tag + length check, element recursion
    Array {
        elements: Vec<Pattern>,
        rest: Option<String>,
    },
    /// `{ x, y: pat }` - tag + per-field existence check and recursion
    Object { fields: Vec<(String, Pattern)> },
    /// `lo..hi` - two comparisons, inclusive on both ends
    Range { lo: Expr, hi: Expr },
    /// A type name: runtime tag test, or nominal name comparison for objects
    Type(String),
    /// `a | b | c` - first matching alternative wins; all alternatives must
    /// bind the same variable set
    Or(Vec<Pattern>),
}

impl Pattern {
    /// Collect the names this pattern binds, in binding order.
    pub fn binding_names(&self, out: &mut Vec<String>) {
        match self {
            Pattern::Wildcard | Pattern::Literal(_) | Pattern::Range { .. } | Pattern::Type(_) => {}
            Pattern::Binding(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Pattern::Array { elements, rest } => {
                for p in elements {
                    p.binding_names(out);
                }
                if let Some(r) = rest
                    && !out.contains(r)
                {
                    out.push(r.clone());
                }
            }
            Pattern::Object { fields } => {
                for (_, p) in fields {
                    p.binding_names(out);
                }
            }
            // OR alternatives are required to bind the same set, so the
            // first alternative is authoritative.
            Pattern::Or(alts) => {
                if let Some(first) = alts.first() {
                    first.binding_names(out);
                }
            }
        }
    }
}

/// One arm of a `match` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub body: Vec<Stmt>,
}

/// An anonymous function literal: the payload of `Expr::Function` and of
/// named `Stmt::Function` definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct FnLit {
    pub params: Vec<Param>,
    pub rest: Option<String>,
    pub body: Vec<Stmt>,
}

/// A segment of an interpolated string: literal text and expressions
/// alternate in source order.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpPart {
    Text(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntLit(i64),
    FloatLit(f64),
    StringLit(String),
    BoolLit(bool),
    RuneLit(char),
    NullLit,
    Ident(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    /// `cond ? a : b`
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// `a ?? b` - evaluates `b` only when `a` is null
    NullCoalesce {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `a?.field` - null when `a` is null, property get otherwise
    OptionalChain {
        object: Box<Expr>,
        name: String,
    },
    /// `target = value` where target is an identifier, index, or property
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    MethodCall {
        object: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Property {
        object: Box<Expr>,
        name: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    ArrayLit(Vec<Expr>),
    ObjectLit(Vec<(String, Expr)>),
    Function(FnLit),
    /// `++x` / `--x`
    PreIncDec {
        target: Box<Expr>,
        increment: bool,
    },
    /// `x++` / `x--`
    PostIncDec {
        target: Box<Expr>,
        increment: bool,
    },
    Interp(Vec<InterpPart>),
    Await(Box<Expr>),
    /// `...xs` - valid only inside call arguments and array literals
    Spread(Box<Expr>),
    /// `a..b` - valid in `for ... in` headers and range patterns
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
    },
}

/// An `extern fn` declaration binding a C symbol through the FFI.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternFn {
    pub name: String,
    /// Shared library the symbol lives in, e.g. `"libm.so.6"`
    pub lib: String,
    /// FFI type names of the parameters (`"i32"`, `"f64"`, `"ptr"`,
    /// `"string"`, or a nominal struct name)
    pub params: Vec<String>,
    /// FFI type name of the return value
    pub ret: String,
}

/// A nominal object type definition, used by typed-let validation and by
/// FFI struct registration.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    pub name: String,
    /// field name -> field type name, in declaration order
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Let {
        name: String,
        ty: Option<TypeAnn>,
        init: Expr,
        /// `false` for `const` bindings
        mutable: bool,
    },
    Expr(Expr),
    Block(Vec<Stmt>),
    If {
        cond: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    /// C-style three-clause loop. Any clause may be absent.
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        update: Option<Expr>,
        body: Vec<Stmt>,
    },
    ForIn {
        var: String,
        index_var: Option<String>,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Match {
        subject: Expr,
        arms: Vec<MatchArm>,
    },
    Try {
        body: Vec<Stmt>,
        catch_var: String,
        catch_body: Vec<Stmt>,
        finally_body: Option<Vec<Stmt>>,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    Defer(Vec<Stmt>),
    /// A named top-level function definition.
    Function {
        name: String,
        func: FnLit,
    },
    ExternFn(ExternFn),
    Import {
        /// `(exported name, local alias)` pairs; empty for namespace imports
        names: Vec<(String, String)>,
        path: String,
        /// `import * as alias` - binds one object holding all exports
        namespace: Option<String>,
    },
    Export(Box<Stmt>),
    Enum {
        name: String,
        members: Vec<String>,
    },
    TypeDef(TypeDef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    /// 1-based source line, for diagnostics
    pub line: usize,
}

impl Stmt {
    pub fn new(kind: StmtKind, line: usize) -> Self {
        Stmt { kind, line }
    }
}

/// A fully parsed and name-resolved main file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn new(statements: Vec<Stmt>) -> Self {
        Program { statements }
    }
}
