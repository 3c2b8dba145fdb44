//! Code generation options
//!
//! Feature flags the driver hands to the generator: the peephole switches,
//! the stack-check hooks, and the sandbox. Options load from the `[codegen]`
//! table of a `hemlock.toml` or are assembled in code through the builder
//! methods.

use serde::Deserialize;
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

/// Sandbox settings for the generated program. When enabled, the emitted
/// main body calls `hml_sandbox_init` before any user code runs.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SandboxOptions {
    pub enabled: bool,
    /// Permit socket/DNS/HTTP builtins at runtime
    pub allow_net: bool,
    /// Permit fork/exec-style builtins at runtime
    pub allow_exec: bool,
    /// Restrict filesystem builtins to this subtree
    pub root: Option<PathBuf>,
}

impl SandboxOptions {
    /// The flag word passed to `hml_sandbox_init`.
    pub fn flag_bits(&self) -> u32 {
        let mut bits = 0;
        if self.allow_net {
            bits |= 1;
        }
        if self.allow_exec {
            bits |= 2;
        }
        bits
    }
}

/// Generator feature flags.
///
/// `optimize` is the master switch; the individual peephole flags only take
/// effect while it is on. Everything defaults to the optimizing
/// configuration except tail calls and stack checking, which are opt-in.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CodegenOptions {
    /// Master optimization switch
    #[serde(default = "default_true")]
    pub optimize: bool,
    /// Fold integer-literal binary/unary operations at generation time
    #[serde(default = "default_true")]
    pub const_fold: bool,
    /// `x * 2^k -> x << k`, `x % 2^k -> x & (2^k - 1)`
    #[serde(default = "default_true")]
    pub strength_reduce: bool,
    /// `x = x + S` -> `hml_string_append_inplace(&x, S)`
    #[serde(default = "default_true")]
    pub inplace_concat: bool,
    /// Raw C arithmetic for variables the checker marked unboxable
    #[serde(default = "default_true")]
    pub native_arith: bool,
    /// Self-tail-recursion to label + goto
    pub tail_calls: bool,
    /// Emit `hml_stack_enter`/`hml_stack_exit` hooks in every function
    pub stack_check: bool,
    pub sandbox: SandboxOptions,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        CodegenOptions {
            optimize: true,
            const_fold: true,
            strength_reduce: true,
            inplace_concat: true,
            native_arith: true,
            tail_calls: false,
            stack_check: false,
            sandbox: SandboxOptions::default(),
        }
    }
}

/// Wrapper for the `[codegen]` table of a hemlock.toml.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    codegen: Option<CodegenOptions>,
}

impl CodegenOptions {
    pub fn new() -> Self {
        CodegenOptions::default()
    }

    /// All peepholes and hooks off. Useful for debugging generated output.
    pub fn unoptimized() -> Self {
        CodegenOptions {
            optimize: false,
            const_fold: false,
            strength_reduce: false,
            inplace_concat: false,
            native_arith: false,
            tail_calls: false,
            stack_check: false,
            sandbox: SandboxOptions::default(),
        }
    }

    pub fn with_optimize(mut self, on: bool) -> Self {
        self.optimize = on;
        self
    }

    pub fn with_tail_calls(mut self, on: bool) -> Self {
        self.tail_calls = on;
        self
    }

    pub fn with_stack_check(mut self, on: bool) -> Self {
        self.stack_check = on;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxOptions) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Parse options from the `[codegen]` table of a hemlock.toml string.
    /// A missing table yields the defaults; unknown keys are an error.
    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| format!("Invalid hemlock.toml: {}", e))?;
        Ok(file.codegen.unwrap_or_default())
    }

    /// Load options from a hemlock.toml on disk.
    pub fn load(path: &std::path::Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&text)
    }

    /// True when this peephole flag combination allows constant folding.
    pub fn fold_enabled(&self) -> bool {
        self.optimize && self.const_fold
    }

    pub fn strength_reduce_enabled(&self) -> bool {
        self.optimize && self.strength_reduce
    }

    pub fn inplace_concat_enabled(&self) -> bool {
        self.optimize && self.inplace_concat
    }

    pub fn native_arith_enabled(&self) -> bool {
        self.optimize && self.native_arith
    }

    pub fn tail_calls_enabled(&self) -> bool {
        self.optimize && self.tail_calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_optimize_on_tco_off() {
        let opts = CodegenOptions::default();
        assert!(opts.optimize);
        assert!(opts.fold_enabled());
        assert!(!opts.tail_calls_enabled());
        assert!(!opts.stack_check);
        assert!(!opts.sandbox.enabled);
    }

    #[test]
    fn test_master_switch_gates_peepholes() {
        let opts = CodegenOptions::default().with_optimize(false);
        assert!(!opts.fold_enabled());
        assert!(!opts.strength_reduce_enabled());
        assert!(!opts.native_arith_enabled());
    }

    #[test]
    fn test_from_toml_str() {
        let opts = CodegenOptions::from_toml_str(
            r#"
            [codegen]
            optimize = true
            tail_calls = true
            stack_check = true

            [codegen.sandbox]
            enabled = true
            allow_net = true
            root = "/srv/app"
            "#,
        )
        .unwrap();
        assert!(opts.tail_calls_enabled());
        assert!(opts.stack_check);
        assert!(opts.sandbox.enabled);
        assert_eq!(opts.sandbox.flag_bits(), 1);
        assert_eq!(opts.sandbox.root, Some(PathBuf::from("/srv/app")));
    }

    #[test]
    fn test_missing_table_yields_defaults() {
        // Unknown top-level tables are fine; only [codegen] keys are strict.
        let opts = CodegenOptions::from_toml_str("[build]\ntarget = \"native\"\n").unwrap();
        assert_eq!(opts, CodegenOptions::default());
    }

    #[test]
    fn test_unknown_codegen_key_rejected() {
        let err = CodegenOptions::from_toml_str("[codegen]\nturbo = true\n").unwrap_err();
        assert!(err.contains("hemlock.toml"));
    }
}
