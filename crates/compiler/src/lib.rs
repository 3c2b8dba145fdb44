//! Hemlock Compiler Library
//!
//! The code-generation core of the Hemlock compiler: given a parsed,
//! name-resolved, type-checked program and a cache of compiled modules,
//! it produces one self-contained C translation unit that reproduces the
//! program's semantics when linked against the `hml_*` runtime library.
//!
//! The lexer, parser, type checker, module loader, and runtime are
//! external collaborators; their only contracts here are the AST shape in
//! [`ast`], the cache API in [`modules`], the optional unboxing hints in
//! [`types`], and the runtime entry points named in the emitted C.
//!
//! # Example
//!
//! ```rust,ignore
//! use hemlockc::{CodegenOptions, ModuleCache, generate_program};
//!
//! let options = CodegenOptions::load(Path::new("hemlock.toml"))?;
//! let cache = loader.compile_imports(&program)?;
//! let c_source = generate_program(&program, &cache, main_dir, &options, None)?;
//! std::fs::write(out_path, c_source)?;
//! ```

pub mod ast;
pub mod codegen;
pub mod config;
pub mod modules;
pub mod types;

pub use ast::Program;
pub use codegen::{CodeGenError, CodegenContext, Diagnostic};
pub use config::{CodegenOptions, SandboxOptions};
pub use modules::{CompiledModule, ImportBinding, ModuleCache, ModuleExport};
pub use types::{NativeType, TypeTable, ValueTag};

use std::path::Path;

/// Generate the C translation unit for a main-file program.
///
/// `main_dir` is the directory import paths resolve against. The type
/// table is the checker's optional unboxing hints; passing `None` simply
/// disables the native-arithmetic peephole.
pub fn generate_program(
    program: &Program,
    cache: &ModuleCache,
    main_dir: &Path,
    options: &CodegenOptions,
    types: Option<&TypeTable>,
) -> Result<String, CodeGenError> {
    let mut ctx = CodegenContext::new(options.clone(), types.cloned());
    ctx.run(program, cache, main_dir)
}
