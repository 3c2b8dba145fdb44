//! Builtin call dispatch
//!
//! For a call `f(args...)` where `f` is an identifier the dispatcher tries,
//! in order: the builtin table below, a direct call to a known main-file or
//! imported function, and finally the generic `hml_call_function` path.
//!
//! Every builtin name also answers to a `__`-prefixed internal alias. The
//! names `now`, `time_ms`, `clock`, and `sleep` may be shadowed by imports
//! or locals; for those four the builtin only wins when the name is free.

use crate::ast::Expr;

use super::error::CodeGenError;
use super::expr::IdentPlace;
use super::state::CodegenContext;

/// One builtin entry: accepted argument count range and the runtime entry
/// point. Missing trailing arguments are filled with null at the call site.
/// The table is scanned in order and the first matching entry wins.
pub(super) struct BuiltinSpec {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub runtime: &'static str,
}

const fn b(
    name: &'static str,
    min_args: usize,
    max_args: usize,
    runtime: &'static str,
) -> BuiltinSpec {
    BuiltinSpec {
        name,
        min_args,
        max_args,
        runtime,
    }
}

/// Names that lose to a local or an import binding of the same name.
const SHADOWABLE: &[&str] = &["now", "time_ms", "clock", "sleep"];

pub(super) static BUILTIN_TABLE: &[BuiltinSpec] = &[
    // I/O
    b("print", 1, 1, "hml_print"),
    b("eprint", 1, 1, "hml_eprint"),
    b("read_line", 0, 0, "hml_read_line"),
    // Type constructors and conversion aliases
    b("i8", 1, 1, "hml_to_i8"),
    b("i16", 1, 1, "hml_to_i16"),
    b("i32", 1, 1, "hml_to_i32"),
    b("i64", 1, 1, "hml_to_i64"),
    b("u8", 1, 1, "hml_to_u8"),
    b("u16", 1, 1, "hml_to_u16"),
    b("u32", 1, 1, "hml_to_u32"),
    b("u64", 1, 1, "hml_to_u64"),
    b("f32", 1, 1, "hml_to_f32"),
    b("f64", 1, 1, "hml_to_f64"),
    b("bool", 1, 1, "hml_to_bool"),
    b("rune", 1, 1, "hml_to_rune"),
    b("integer", 1, 1, "hml_to_i32"),
    b("number", 1, 1, "hml_to_f64"),
    b("byte", 1, 1, "hml_to_u8"),
    // Introspection
    b("typeof", 1, 1, "hml_typeof"),
    b("assert", 1, 2, "hml_assert"),
    b("panic", 0, 1, "hml_panic"),
    // Concurrency
    b("join", 1, 1, "hml_join"),
    b("select", 1, 1, "hml_select"),
    b("poll", 1, 1, "hml_poll"),
    b("signal", 2, 2, "hml_signal"),
    b("raise", 1, 1, "hml_raise"),
    b("sleep", 1, 1, "hml_sleep"),
    b("task_debug_info", 0, 1, "hml_task_debug_info"),
    // Memory
    b("alloc", 1, 1, "hml_alloc"),
    b("free", 1, 1, "hml_free"),
    b("realloc", 2, 2, "hml_realloc"),
    b("buffer", 1, 1, "hml_buffer_new"),
    b("memset", 3, 3, "hml_memset"),
    b("memcpy", 3, 3, "hml_memcpy"),
    b("talloc", 1, 1, "hml_talloc"),
    // Pointers
    b("ptr_null", 0, 0, "hml_ptr_null"),
    b("ptr_offset", 2, 2, "hml_ptr_offset"),
    b("ptr_read_i32", 1, 1, "hml_ptr_deref_i32"),
    b("ptr_deref_i8", 1, 1, "hml_ptr_deref_i8"),
    b("ptr_deref_i16", 1, 1, "hml_ptr_deref_i16"),
    b("ptr_deref_i32", 1, 1, "hml_ptr_deref_i32"),
    b("ptr_deref_i64", 1, 1, "hml_ptr_deref_i64"),
    b("ptr_deref_u8", 1, 1, "hml_ptr_deref_u8"),
    b("ptr_deref_u16", 1, 1, "hml_ptr_deref_u16"),
    b("ptr_deref_u32", 1, 1, "hml_ptr_deref_u32"),
    b("ptr_deref_u64", 1, 1, "hml_ptr_deref_u64"),
    b("ptr_deref_f32", 1, 1, "hml_ptr_deref_f32"),
    b("ptr_deref_f64", 1, 1, "hml_ptr_deref_f64"),
    b("ptr_write_i8", 2, 2, "hml_ptr_write_i8"),
    b("ptr_write_i16", 2, 2, "hml_ptr_write_i16"),
    b("ptr_write_i32", 2, 2, "hml_ptr_write_i32"),
    b("ptr_write_i64", 2, 2, "hml_ptr_write_i64"),
    b("ptr_write_u8", 2, 2, "hml_ptr_write_u8"),
    b("ptr_write_u16", 2, 2, "hml_ptr_write_u16"),
    b("ptr_write_u32", 2, 2, "hml_ptr_write_u32"),
    b("ptr_write_u64", 2, 2, "hml_ptr_write_u64"),
    b("ptr_write_f32", 2, 2, "hml_ptr_write_f32"),
    b("ptr_write_f64", 2, 2, "hml_ptr_write_f64"),
    b("buffer_ptr", 1, 1, "hml_buffer_ptr"),
    b("ptr_to_buffer", 2, 2, "hml_ptr_to_buffer"),
    // Atomics
    b("atomic_load_i32", 1, 1, "hml_atomic_load_i32"),
    b("atomic_load_i64", 1, 1, "hml_atomic_load_i64"),
    b("atomic_store_i32", 2, 2, "hml_atomic_store_i32"),
    b("atomic_store_i64", 2, 2, "hml_atomic_store_i64"),
    b("atomic_add_i32", 2, 2, "hml_atomic_add_i32"),
    b("atomic_add_i64", 2, 2, "hml_atomic_add_i64"),
    b("atomic_sub_i32", 2, 2, "hml_atomic_sub_i32"),
    b("atomic_sub_i64", 2, 2, "hml_atomic_sub_i64"),
    b("atomic_and_i32", 2, 2, "hml_atomic_and_i32"),
    b("atomic_and_i64", 2, 2, "hml_atomic_and_i64"),
    b("atomic_or_i32", 2, 2, "hml_atomic_or_i32"),
    b("atomic_or_i64", 2, 2, "hml_atomic_or_i64"),
    b("atomic_xor_i32", 2, 2, "hml_atomic_xor_i32"),
    b("atomic_xor_i64", 2, 2, "hml_atomic_xor_i64"),
    b("atomic_cas_i32", 3, 3, "hml_atomic_cas_i32"),
    b("atomic_cas_i64", 3, 3, "hml_atomic_cas_i64"),
    b("atomic_exchange_i32", 2, 2, "hml_atomic_exchange_i32"),
    b("atomic_exchange_i64", 2, 2, "hml_atomic_exchange_i64"),
    b("atomic_fence", 0, 0, "hml_atomic_fence"),
    // Math
    b("sqrt", 1, 1, "hml_sqrt"),
    b("sin", 1, 1, "hml_sin"),
    b("cos", 1, 1, "hml_cos"),
    b("tan", 1, 1, "hml_tan"),
    b("asin", 1, 1, "hml_asin"),
    b("acos", 1, 1, "hml_acos"),
    b("atan", 1, 1, "hml_atan"),
    b("atan2", 2, 2, "hml_atan2"),
    b("floor", 1, 1, "hml_floor"),
    b("ceil", 1, 1, "hml_ceil"),
    b("round", 1, 1, "hml_round"),
    b("trunc", 1, 1, "hml_trunc"),
    b("floori", 1, 1, "hml_floori"),
    b("ceili", 1, 1, "hml_ceili"),
    b("roundi", 1, 1, "hml_roundi"),
    b("trunci", 1, 1, "hml_trunci"),
    b("div", 2, 2, "hml_div"),
    b("divi", 2, 2, "hml_divi"),
    b("abs", 1, 1, "hml_abs"),
    b("pow", 2, 2, "hml_pow"),
    b("exp", 1, 1, "hml_exp"),
    b("log", 1, 1, "hml_log"),
    b("log2", 1, 1, "hml_log2"),
    b("log10", 1, 1, "hml_log10"),
    b("min", 2, 2, "hml_min"),
    b("max", 2, 2, "hml_max"),
    b("rand", 0, 0, "hml_rand"),
    b("seed", 1, 1, "hml_rand_seed"),
    b("rand_range", 2, 2, "hml_rand_range"),
    b("clamp", 3, 3, "hml_clamp"),
    // Time
    b("now", 0, 0, "hml_time_now"),
    b("time_ms", 0, 0, "hml_time_ms"),
    b("clock", 0, 0, "hml_clock"),
    // Datetime
    b("localtime", 0, 1, "hml_localtime"),
    b("gmtime", 0, 1, "hml_gmtime"),
    b("mktime", 1, 1, "hml_mktime"),
    b("strftime", 2, 2, "hml_strftime"),
    // Environment and process
    b("getenv", 1, 1, "hml_getenv"),
    b("setenv", 2, 3, "hml_setenv"),
    b("unsetenv", 1, 1, "hml_unsetenv"),
    b("exit", 0, 1, "hml_exit"),
    b("abort", 0, 0, "hml_abort"),
    b("get_pid", 0, 0, "hml_getpid"),
    b("getppid", 0, 0, "hml_getppid"),
    b("getuid", 0, 0, "hml_getuid"),
    b("geteuid", 0, 0, "hml_geteuid"),
    b("getgid", 0, 0, "hml_getgid"),
    b("getegid", 0, 0, "hml_getegid"),
    b("fork", 0, 0, "hml_fork"),
    b("wait", 0, 1, "hml_wait"),
    b("waitpid", 1, 2, "hml_waitpid"),
    b("kill", 1, 2, "hml_kill"),
    // Filesystem. The directory entries (`cwd`, `chdir`, `list_dir`,
    // `make_dir`, `remove_dir`) historically appeared twice with different
    // defaults; the first entry wins, so these are the applying forms.
    b("exists", 1, 1, "hml_fs_exists"),
    b("read_file", 1, 1, "hml_read_file"),
    b("write_file", 2, 2, "hml_write_file"),
    b("append_file", 2, 2, "hml_append_file"),
    b("remove_file", 1, 1, "hml_remove_file"),
    b("rename", 2, 2, "hml_fs_rename"),
    b("copy_file", 2, 2, "hml_copy_file"),
    b("is_file", 1, 1, "hml_is_file"),
    b("is_dir", 1, 1, "hml_is_dir"),
    b("file_stat", 1, 1, "hml_file_stat"),
    b("cwd", 0, 0, "hml_cwd"),
    b("chdir", 1, 1, "hml_chdir"),
    b("list_dir", 1, 1, "hml_list_dir"),
    b("make_dir", 1, 1, "hml_make_dir"),
    b("remove_dir", 1, 1, "hml_remove_dir"),
    b("absolute_path", 1, 1, "hml_absolute_path"),
    // FFI
    b("callback", 1, 2, "hml_ffi_callback"),
    b("callback_free", 1, 1, "hml_ffi_callback_free"),
    b("ffi_sizeof", 1, 1, "hml_ffi_sizeof"),
    // OS info
    b("platform", 0, 0, "hml_platform"),
    b("arch", 0, 0, "hml_arch"),
    b("hostname", 0, 0, "hml_hostname"),
    b("username", 0, 0, "hml_username"),
    b("homedir", 0, 0, "hml_homedir"),
    b("cpu_count", 0, 0, "hml_cpu_count"),
    b("total_memory", 0, 0, "hml_total_memory"),
    b("free_memory", 0, 0, "hml_free_memory"),
    b("os_version", 0, 0, "hml_os_version"),
    b("os_name", 0, 0, "hml_os_name"),
    b("tmpdir", 0, 0, "hml_tmpdir"),
    b("uptime", 0, 0, "hml_uptime"),
    // Sockets
    b("socket_create", 2, 3, "hml_socket_create"),
    b("dns_resolve", 1, 2, "hml_dns_resolve"),
    // Compression
    b("zlib_compress", 1, 2, "hml_zlib_compress"),
    b("zlib_decompress", 1, 1, "hml_zlib_decompress"),
    b("gzip_compress", 1, 2, "hml_gzip_compress"),
    b("gzip_decompress", 1, 1, "hml_gzip_decompress"),
    b("crc32", 1, 2, "hml_crc32"),
    b("adler32", 1, 2, "hml_adler32"),
    // Strings
    b("to_string", 1, 1, "hml_to_string"),
    b("string_byte_length", 1, 1, "hml_string_byte_length"),
    b("string_to_cstr", 1, 1, "hml_string_to_cstr"),
    b("cstr_to_string", 1, 1, "hml_cstr_to_string"),
    b("string_from_bytes", 1, 1, "hml_string_from_bytes"),
    // Crypto
    b("sha256", 1, 1, "hml_sha256"),
    b("sha512", 1, 1, "hml_sha512"),
    b("md5", 1, 1, "hml_md5"),
    b("ecdsa_generate_key", 0, 1, "hml_ecdsa_generate_key"),
    b("ecdsa_free_key", 1, 1, "hml_ecdsa_free_key"),
    b("ecdsa_sign", 2, 2, "hml_ecdsa_sign"),
    b("ecdsa_verify", 3, 3, "hml_ecdsa_verify"),
    // HTTP / WebSocket; source spells these with the __lws_ prefix, which
    // the internal-alias rule strips before lookup
    b("lws_create_context", 0, 1, "hml_lws_create_context"),
    b("lws_destroy_context", 1, 1, "hml_lws_destroy_context"),
    b("lws_http_request", 2, 4, "hml_lws_http_request"),
    b("lws_http_get", 1, 2, "hml_lws_http_get"),
    b("lws_http_post", 2, 3, "hml_lws_http_post"),
    b("lws_ws_connect", 1, 2, "hml_lws_ws_connect"),
    b("lws_ws_send", 2, 2, "hml_lws_ws_send"),
    b("lws_ws_recv", 1, 2, "hml_lws_ws_recv"),
    b("lws_ws_close", 1, 1, "hml_lws_ws_close"),
    b("lws_service", 1, 2, "hml_lws_service"),
];

/// Find the first table entry for a name, after stripping the `__` alias
/// prefix.
pub(super) fn lookup_builtin(name: &str) -> Option<&'static BuiltinSpec> {
    let bare = name.strip_prefix("__").unwrap_or(name);
    BUILTIN_TABLE.iter().find(|spec| spec.name == bare)
}

/// Compile-time sizes for `sizeof` over type-name identifiers.
fn sizeof_type_name(name: &str) -> Option<i64> {
    Some(match name {
        "i8" | "u8" | "bool" => 1,
        "i16" | "u16" => 2,
        "i32" | "u32" | "f32" | "rune" => 4,
        "i64" | "u64" | "f64" => 8,
        _ => return None,
    })
}

impl CodegenContext {
    // =========================================================================
    // Call dispatch
    // =========================================================================

    pub(super) fn lower_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        line: usize,
    ) -> Result<String, CodeGenError> {
        if let Expr::Ident(name) = callee {
            let name = name.clone();
            if let Some(t) = self.try_lower_builtin(&name, args, line)? {
                return Ok(t);
            }
            if let Some(t) = self.try_lower_known_function(&name, args, line)? {
                return Ok(t);
            }
        }
        self.lower_generic_call(callee, args, line)
    }

    fn try_lower_builtin(
        &mut self,
        name: &str,
        args: &[Expr],
        line: usize,
    ) -> Result<Option<String>, CodeGenError> {
        if args.iter().any(|a| matches!(a, Expr::Spread(_))) {
            return Ok(None);
        }
        let bare = name.strip_prefix("__").unwrap_or(name);
        if SHADOWABLE.contains(&bare) && self.name_is_bound(name) {
            return Ok(None);
        }

        // Builtins with irregular lowering come first, like the head of the
        // original dispatch chain.
        match bare {
            "spawn" if !args.is_empty() => return self.lower_spawn(args, line).map(Some),
            "detach" if !args.is_empty() => return self.lower_detach(args, line).map(Some),
            "channel" if args.len() <= 1 => return self.lower_channel(args, line).map(Some),
            "sizeof" if args.len() == 1 => return self.lower_sizeof(&args[0], line).map(Some),
            "string_concat_many" if !args.is_empty() => {
                return self.lower_concat_many(args, line).map(Some);
            }
            _ => {}
        }

        let Some(spec) = lookup_builtin(name) else {
            return Ok(None);
        };
        if args.len() < spec.min_args || args.len() > spec.max_args {
            return Ok(None);
        }

        let mut temps = Vec::with_capacity(spec.max_args);
        for arg in args {
            temps.push(self.lower_expr(arg, line)?);
        }
        // Null fillers for omitted optional arguments.
        for _ in args.len()..spec.max_args {
            let t = self.fresh_temp();
            self.emit(&format!("HmlValue {} = hml_val_null();", t));
            temps.push(t);
        }
        let result = self.fresh_temp();
        self.emit(&format!(
            "HmlValue {} = {}({});",
            result,
            spec.runtime,
            temps.join(", ")
        ));
        for t in &temps {
            self.release_if_needed(t);
        }
        Ok(Some(result))
    }

    /// Is the name bound to something that beats the builtin table: a
    /// local, a capture, or an import binding?
    fn name_is_bound(&self, name: &str) -> bool {
        if self.is_local(name) {
            return true;
        }
        if self.inside_closure && self.current_captures.contains_key(name) {
            return true;
        }
        if let Some(module) = &self.current_module {
            return module.imports.contains_key(name);
        }
        self.main_imports.contains_key(name)
    }

    fn lower_spawn(&mut self, args: &[Expr], line: usize) -> Result<String, CodeGenError> {
        let f = self.lower_expr(&args[0], line)?;
        let result = self.fresh_temp();
        if args.len() == 1 {
            self.emit(&format!("HmlValue {} = hml_spawn({}, NULL, 0);", result, f));
            self.release_if_needed(&f);
            return Ok(result);
        }
        let mut temps = Vec::new();
        for arg in &args[1..] {
            temps.push(self.lower_expr(arg, line)?);
        }
        let arr = self.fresh_temp();
        self.emit(&format!(
            "HmlValue {}[{}] = {{ {} }};",
            arr,
            temps.len(),
            temps.join(", ")
        ));
        self.emit(&format!(
            "HmlValue {} = hml_spawn({}, {}, {});",
            result,
            f,
            arr,
            temps.len()
        ));
        self.release_if_needed(&f);
        for t in &temps {
            self.release_if_needed(t);
        }
        Ok(result)
    }

    /// `detach(task)` detaches an existing task; `detach(fn, args...)`
    /// spawns and detaches. Distinguished by arity exactly.
    fn lower_detach(&mut self, args: &[Expr], line: usize) -> Result<String, CodeGenError> {
        if args.len() == 1 {
            let t = self.lower_expr(&args[0], line)?;
            let result = self.fresh_temp();
            self.emit(&format!("HmlValue {} = hml_detach({});", result, t));
            self.release_if_needed(&t);
            return Ok(result);
        }
        let task = self.lower_spawn(args, line)?;
        self.emit(&format!("hml_detach({});", task));
        Ok(task)
    }

    fn lower_channel(&mut self, args: &[Expr], line: usize) -> Result<String, CodeGenError> {
        let cap = if let Some(arg) = args.first() {
            self.lower_expr(arg, line)?
        } else {
            // Unbuffered by default.
            let t = self.fresh_temp();
            self.emit(&format!("HmlValue {} = hml_val_i32(0);", t));
            t
        };
        let result = self.fresh_temp();
        self.emit(&format!("HmlValue {} = hml_channel({});", result, cap));
        self.release_if_needed(&cap);
        Ok(result)
    }

    /// `sizeof` over a type-name identifier folds at generation time;
    /// anything else asks the runtime.
    fn lower_sizeof(&mut self, arg: &Expr, line: usize) -> Result<String, CodeGenError> {
        if let Expr::Ident(name) = arg
            && !self.name_is_bound(name)
            && let Some(size) = sizeof_type_name(name)
        {
            return Ok(self.emit_int_literal(size));
        }
        let vt = self.lower_expr(arg, line)?;
        let result = self.fresh_temp();
        self.emit(&format!("HmlValue {} = hml_sizeof({});", result, vt));
        self.release_if_needed(&vt);
        Ok(result)
    }

    fn lower_concat_many(&mut self, args: &[Expr], line: usize) -> Result<String, CodeGenError> {
        let mut temps = Vec::with_capacity(args.len());
        for arg in args {
            temps.push(self.lower_expr(arg, line)?);
        }
        let arr = self.fresh_temp();
        self.emit(&format!(
            "HmlValue {}[{}] = {{ {} }};",
            arr,
            temps.len(),
            temps.join(", ")
        ));
        let result = self.fresh_temp();
        self.emit(&format!(
            "HmlValue {} = hml_string_concat_many({}, {});",
            result,
            arr,
            temps.len()
        ));
        for t in &temps {
            self.release_if_needed(t);
        }
        Ok(result)
    }

    // =========================================================================
    // Direct calls to known functions
    // =========================================================================

    fn try_lower_known_function(
        &mut self,
        name: &str,
        args: &[Expr],
        line: usize,
    ) -> Result<Option<String>, CodeGenError> {
        // A local or captured binding holds a runtime value; those calls go
        // through the generic dispatcher.
        if self.is_local(name) || (self.inside_closure && self.current_captures.contains_key(name))
        {
            return Ok(None);
        }
        let IdentPlace::Function {
            c_name,
            arity,
            has_rest,
            ref_mask,
        } = self.resolve_ident(name)
        else {
            return Ok(None);
        };
        if args.iter().any(|a| matches!(a, Expr::Spread(_))) {
            return Ok(None);
        }
        if args.len() > arity && !has_rest {
            return Ok(None);
        }

        // Env sentinel first, then positionals, then the rest array.
        let mut call_args = vec!["NULL".to_string()];
        let mut borrowed: Vec<String> = Vec::new();

        for i in 0..arity {
            let is_ref = ref_mask.get(i).copied().unwrap_or(false);
            if i < args.len() {
                if is_ref {
                    // Identifier arguments pass the address of the source
                    // variable. Anything else evaluates into a fresh temp
                    // whose address is passed; mutations through it do not
                    // propagate back.
                    if let Expr::Ident(arg_name) = &args[i]
                        && let IdentPlace::Storage {
                            c_expr,
                            native: None,
                        } = self.resolve_ident(arg_name)
                    {
                        call_args.push(format!("&{}", c_expr));
                    } else {
                        let t = self.lower_expr(&args[i], line)?;
                        call_args.push(format!("&{}", t));
                        borrowed.push(t);
                    }
                } else {
                    let t = self.lower_expr(&args[i], line)?;
                    call_args.push(t);
                }
            } else {
                // Null filler for an omitted optional parameter; the
                // callee owns it like any positional argument.
                let t = self.fresh_temp();
                self.emit(&format!("HmlValue {} = hml_val_null();", t));
                call_args.push(t);
            }
        }

        if has_rest {
            let rest = self.fresh_temp();
            self.emit(&format!("HmlValue {} = hml_val_array();", rest));
            for arg in args.iter().skip(arity) {
                let t = self.lower_expr(arg, line)?;
                self.emit(&format!("hml_array_push({}, {});", rest, t));
                self.release_if_needed(&t);
            }
            call_args.push(rest.clone());
            borrowed.push(rest);
        }

        let result = self.fresh_temp();
        self.emit(&format!(
            "HmlValue {} = {}({});",
            result,
            c_name,
            call_args.join(", ")
        ));
        // Positional temps transferred to the callee; only by-address and
        // rest temps stay ours.
        for t in &borrowed {
            self.release_if_needed(t);
        }
        Ok(Some(result))
    }

    // =========================================================================
    // Generic call path
    // =========================================================================

    pub(super) fn lower_generic_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        line: usize,
    ) -> Result<String, CodeGenError> {
        let f = self.lower_expr(callee, line)?;

        if args.iter().any(|a| matches!(a, Expr::Spread(_))) {
            let arr = self.fresh_temp();
            self.emit(&format!("HmlValue {} = hml_val_array();", arr));
            for arg in args {
                if let Expr::Spread(inner) = arg {
                    let t = self.lower_expr(inner, line)?;
                    self.emit(&format!("hml_array_extend({}, {});", arr, t));
                    self.release_if_needed(&t);
                } else {
                    let t = self.lower_expr(arg, line)?;
                    self.emit(&format!("hml_array_push({}, {});", arr, t));
                    self.release_if_needed(&t);
                }
            }
            let result = self.fresh_temp();
            self.emit(&format!(
                "HmlValue {} = hml_call_function_array({}, {});",
                result, f, arr
            ));
            self.release_if_needed(&f);
            self.release_if_needed(&arr);
            return Ok(result);
        }

        let result = self.fresh_temp();
        if args.is_empty() {
            self.emit(&format!(
                "HmlValue {} = hml_call_function({}, NULL, 0);",
                result, f
            ));
            self.release_if_needed(&f);
            return Ok(result);
        }

        let mut temps = Vec::with_capacity(args.len());
        for arg in args {
            temps.push(self.lower_expr(arg, line)?);
        }
        let arr = self.fresh_temp();
        self.emit(&format!(
            "HmlValue {}[{}] = {{ {} }};",
            arr,
            temps.len(),
            temps.join(", ")
        ));
        self.emit(&format!(
            "HmlValue {} = hml_call_function({}, {}, {});",
            result,
            f,
            arr,
            temps.len()
        ));
        self.release_if_needed(&f);
        for t in &temps {
            self.release_if_needed(t);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::state::{MainImport, Storage};
    use crate::config::CodegenOptions;

    fn ctx() -> CodegenContext {
        CodegenContext::new(CodegenOptions::default(), None)
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

    #[test]
    fn test_first_match_wins_and_alias_strips() {
        let spec = lookup_builtin("make_dir").unwrap();
        assert_eq!(spec.runtime, "hml_make_dir");
        assert_eq!((spec.min_args, spec.max_args), (1, 1));
        let alias = lookup_builtin("__make_dir").unwrap();
        assert_eq!(alias.name, spec.name);
        assert_eq!(alias.runtime, spec.runtime);
    }

    #[test]
    fn test_print_lowers_to_runtime_call() {
        let mut c = ctx();
        c.lower_expr(&call("print", vec![Expr::IntLit(1)]), 1).unwrap();
        assert!(c.main_out.contains("hml_print(_t0);"));
        assert!(c.main_out.contains("hml_release_if_needed(_t0);"));
    }

    #[test]
    fn test_shadowable_builtin_loses_to_import() {
        let mut c = ctx();
        c.add_main_import(
            "now",
            MainImport {
                original: "now".to_string(),
                prefix: "m1_".to_string(),
                is_function: true,
                arity: 0,
                has_rest: false,
                is_extern: false,
            },
        );
        c.lower_expr(&call("now", vec![]), 1).unwrap();
        assert!(c.main_out.contains("hml_fn_m1_now(NULL)"));
        assert!(!c.main_out.contains("hml_time_now"));
        // non-shadowable builtins still beat imports
        c.lower_expr(&call("rand", vec![]), 1).unwrap();
        assert!(c.main_out.contains("hml_rand()"));
    }

    #[test]
    fn test_detach_dispatches_on_arity() {
        let mut c = ctx();
        c.add_local("t", Storage::Boxed);
        c.lower_expr(&call("detach", vec![ident("t")]), 1).unwrap();
        assert!(c.main_out.contains("hml_detach(_t0);"));
        assert!(!c.main_out.contains("hml_spawn"));

        let mut c2 = ctx();
        c2.add_local("f", Storage::Boxed);
        c2.lower_expr(&call("detach", vec![ident("f"), Expr::IntLit(1)]), 1)
            .unwrap();
        assert!(c2.main_out.contains("hml_spawn("));
        assert!(c2.main_out.contains("hml_detach("));
    }

    #[test]
    fn test_sizeof_folds_type_names() {
        let mut c = ctx();
        c.lower_expr(&call("sizeof", vec![ident("i32")]), 1).unwrap();
        assert!(c.main_out.contains("hml_val_i32(4);"));
        assert!(!c.main_out.contains("hml_sizeof"));

        let mut c2 = ctx();
        c2.add_local("x", Storage::Boxed);
        c2.lower_expr(&call("sizeof", vec![ident("x")]), 1).unwrap();
        assert!(c2.main_out.contains("hml_sizeof("));
    }

    #[test]
    fn test_optional_args_filled_with_null() {
        let mut c = ctx();
        c.lower_expr(&call("localtime", vec![]), 1).unwrap();
        assert!(c.main_out.contains("hml_val_null();"));
        assert!(c.main_out.contains("hml_localtime(_t0);"));
    }

    #[test]
    fn test_known_function_direct_call_with_fillers_and_rest() {
        let mut c = ctx();
        c.add_main_func("f", 2, true, vec![false, false], 0);
        c.lower_expr(
            &call("f", vec![Expr::IntLit(1), Expr::IntLit(2), Expr::IntLit(3)]),
            1,
        )
        .unwrap();
        let out = &c.main_out;
        // env sentinel, two positionals, collected rest
        assert!(out.contains("hml_fn_f(NULL, _t0, _t1, _t2);"));
        assert!(out.contains("hml_array_push(_t2, _t3);"));
        // rest array released by the caller; positionals are not
        assert!(out.contains("hml_release_if_needed(_t2);"));
        assert!(!out.contains("hml_release_if_needed(_t0);"));
    }

    #[test]
    fn test_ref_param_identifier_passes_address_of_storage() {
        let mut c = ctx();
        c.add_main_func("bump", 1, false, vec![true], 0);
        c.add_local("x", Storage::Boxed);
        c.lower_expr(&call("bump", vec![ident("x")]), 1).unwrap();
        assert!(c.main_out.contains("hml_fn_bump(NULL, &x);"));
    }

    #[test]
    fn test_ref_param_expression_passes_address_of_temp() {
        let mut c = ctx();
        c.add_main_func("bump", 1, false, vec![true], 0);
        c.lower_expr(&call("bump", vec![Expr::IntLit(3)]), 1).unwrap();
        assert!(c.main_out.contains("hml_fn_bump(NULL, &_t0);"));
        // the temp stays caller-owned
        assert!(c.main_out.contains("hml_release_if_needed(_t0);"));
    }

    #[test]
    fn test_unknown_callee_uses_generic_dispatch() {
        let mut c = ctx();
        c.add_local("g", Storage::Boxed);
        c.lower_expr(&call("g", vec![Expr::IntLit(1), Expr::IntLit(2)]), 1)
            .unwrap();
        assert!(c.main_out.contains("hml_call_function(_t0, _t3, 2);"));
    }

    #[test]
    fn test_local_function_param_not_direct_called() {
        let mut c = ctx();
        c.add_main_func("f", 1, false, vec![false], 0);
        // a local `f` shadows the top-level function
        c.add_local("f", Storage::Param);
        c.lower_expr(&call("f", vec![Expr::IntLit(1)]), 1).unwrap();
        assert!(c.main_out.contains("hml_call_function("));
        assert!(!c.main_out.contains("hml_fn_f(NULL"));
    }

    #[test]
    fn test_spread_forces_generic_array_call() {
        let mut c = ctx();
        c.add_main_func("f", 2, false, vec![false, false], 0);
        c.add_local("xs", Storage::Boxed);
        c.lower_expr(
            &call("f", vec![Expr::Spread(Box::new(ident("xs")))]),
            1,
        )
        .unwrap();
        assert!(c.main_out.contains("hml_array_extend("));
        assert!(c.main_out.contains("hml_call_function_array("));
    }

    #[test]
    fn test_builtin_emission_is_deterministic() {
        let emit = || {
            let mut c = ctx();
            c.lower_expr(&call("rand_range", vec![Expr::IntLit(1), Expr::IntLit(6)]), 1)
                .unwrap();
            c.main_out
        };
        assert_eq!(emit(), emit());
    }
}
