//! Method call dispatch
//!
//! `obj.method(args)` pattern-matches a smaller table than the builtin one.
//! Monomorphic methods lower straight to their runtime entry; polymorphic
//! names (`slice`, `find`, `contains`, `send`, `close`) discriminate on the
//! receiver's runtime tag. Unknown names fall through to `hml_call_method`.

use crate::ast::Expr;

use super::error::CodeGenError;
use super::runtime::escape_c_string;
use super::state::CodegenContext;

/// A monomorphic method entry: receiver-independent runtime call.
struct MethodSpec {
    name: &'static str,
    min_args: usize,
    max_args: usize,
    runtime: &'static str,
}

const fn m(
    name: &'static str,
    min_args: usize,
    max_args: usize,
    runtime: &'static str,
) -> MethodSpec {
    MethodSpec {
        name,
        min_args,
        max_args,
        runtime,
    }
}

static METHOD_TABLE: &[MethodSpec] = &[
    // Strings
    m("substr", 1, 2, "hml_string_substr"),
    m("indexOf", 1, 1, "hml_string_find"),
    m("split", 1, 1, "hml_string_split"),
    m("trim", 0, 0, "hml_string_trim"),
    m("to_upper", 0, 0, "hml_string_to_upper"),
    m("to_lower", 0, 0, "hml_string_to_lower"),
    m("starts_with", 1, 1, "hml_string_starts_with"),
    m("ends_with", 1, 1, "hml_string_ends_with"),
    m("replace", 2, 2, "hml_string_replace"),
    m("replace_all", 2, 2, "hml_string_replace_all"),
    m("repeat", 1, 1, "hml_string_repeat"),
    m("char_at", 1, 1, "hml_string_char_at"),
    m("byte_at", 1, 1, "hml_string_byte_at"),
    m("to_bytes", 0, 0, "hml_string_to_bytes"),
    // Arrays
    m("push", 1, 1, "hml_array_push_method"),
    m("pop", 0, 0, "hml_array_pop"),
    m("shift", 0, 0, "hml_array_shift"),
    m("unshift", 1, 1, "hml_array_unshift"),
    m("insert", 2, 2, "hml_array_insert"),
    m("remove", 1, 1, "hml_array_remove"),
    m("join", 0, 1, "hml_array_join"),
    m("concat", 1, 1, "hml_array_concat"),
    m("reverse", 0, 0, "hml_array_reverse"),
    m("first", 0, 0, "hml_array_first"),
    m("last", 0, 0, "hml_array_last"),
    m("clear", 0, 0, "hml_array_clear"),
    m("map", 1, 1, "hml_array_map"),
    m("filter", 1, 1, "hml_array_filter"),
    m("reduce", 1, 2, "hml_array_reduce"),
    // Files
    m("read", 0, 1, "hml_file_read"),
    m("write", 1, 1, "hml_file_write"),
    m("seek", 1, 2, "hml_file_seek"),
    m("tell", 0, 0, "hml_file_tell"),
    // Channels
    m("recv", 0, 0, "hml_channel_recv"),
    m("recv_timeout", 1, 1, "hml_channel_recv_timeout"),
    m("send_timeout", 2, 2, "hml_channel_send_timeout"),
    // Sockets
    m("bind", 1, 2, "hml_socket_bind"),
    m("listen", 0, 1, "hml_socket_listen"),
    m("accept", 0, 0, "hml_socket_accept"),
    m("connect", 1, 2, "hml_socket_connect"),
    m("sendto", 2, 3, "hml_socket_sendto"),
    m("recvfrom", 0, 1, "hml_socket_recvfrom"),
    m("setsockopt", 2, 3, "hml_socket_setsockopt"),
    m("set_timeout", 1, 1, "hml_socket_set_timeout"),
    m("set_nonblocking", 1, 1, "hml_socket_set_nonblocking"),
    // Serialization
    m("serialize", 0, 0, "hml_serialize"),
    m("deserialize", 0, 0, "hml_deserialize"),
];

/// Polymorphic methods: per-tag runtime entries tried in order, generic
/// `hml_call_method` as the final arm.
struct PolySpec {
    name: &'static str,
    min_args: usize,
    max_args: usize,
    arms: &'static [(&'static str, &'static str)],
}

static POLY_TABLE: &[PolySpec] = &[
    PolySpec {
        name: "slice",
        min_args: 1,
        max_args: 2,
        arms: &[
            ("HML_STRING", "hml_string_slice"),
            ("HML_ARRAY", "hml_array_slice"),
        ],
    },
    PolySpec {
        name: "find",
        min_args: 1,
        max_args: 1,
        arms: &[
            ("HML_STRING", "hml_string_find"),
            ("HML_ARRAY", "hml_array_find"),
        ],
    },
    PolySpec {
        name: "contains",
        min_args: 1,
        max_args: 1,
        arms: &[
            ("HML_STRING", "hml_string_contains"),
            ("HML_ARRAY", "hml_array_contains"),
        ],
    },
    PolySpec {
        name: "send",
        min_args: 1,
        max_args: 1,
        arms: &[
            ("HML_CHANNEL", "hml_channel_send"),
            ("HML_SOCKET", "hml_socket_send"),
        ],
    },
    PolySpec {
        name: "close",
        min_args: 0,
        max_args: 0,
        arms: &[
            ("HML_CHANNEL", "hml_channel_close"),
            ("HML_FILE", "hml_file_close"),
            ("HML_SOCKET", "hml_socket_close"),
        ],
    },
];

impl CodegenContext {
    pub(super) fn lower_method_call(
        &mut self,
        object: &Expr,
        method: &str,
        args: &[Expr],
        line: usize,
    ) -> Result<String, CodeGenError> {
        let has_spread = args.iter().any(|a| matches!(a, Expr::Spread(_)));

        if !has_spread {
            if let Some(poly) = POLY_TABLE.iter().find(|p| p.name == method)
                && args.len() >= poly.min_args
                && args.len() <= poly.max_args
            {
                return self.lower_poly_method(poly, object, args, line);
            }
            if let Some(spec) = METHOD_TABLE.iter().find(|s| s.name == method)
                && args.len() >= spec.min_args
                && args.len() <= spec.max_args
            {
                let ot = self.lower_expr(object, line)?;
                let mut temps = vec![ot.clone()];
                for arg in args {
                    temps.push(self.lower_expr(arg, line)?);
                }
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
                return Ok(result);
            }
        }

        self.lower_dynamic_method(object, method, args, line)
    }

    fn lower_poly_method(
        &mut self,
        poly: &PolySpec,
        object: &Expr,
        args: &[Expr],
        line: usize,
    ) -> Result<String, CodeGenError> {
        let ot = self.lower_expr(object, line)?;
        let mut temps = Vec::new();
        for arg in args {
            temps.push(self.lower_expr(arg, line)?);
        }
        for _ in args.len()..poly.max_args {
            let t = self.fresh_temp();
            self.emit(&format!("HmlValue {} = hml_val_null();", t));
            temps.push(t);
        }
        let result = self.fresh_temp();
        self.emit(&format!("HmlValue {};", result));

        let all_args = if temps.is_empty() {
            ot.clone()
        } else {
            format!("{}, {}", ot, temps.join(", "))
        };
        for (i, (tag, runtime)) in poly.arms.iter().enumerate() {
            let head = if i == 0 {
                format!("if (hml_tag({}) == {})", ot, tag)
            } else {
                format!("}} else if (hml_tag({}) == {})", ot, tag)
            };
            if i > 0 {
                self.indent -= 1;
            }
            self.open_block(&head);
            self.emit(&format!("{} = {}({});", result, runtime, all_args));
        }
        self.indent -= 1;
        self.open_block("} else");
        self.emit_call_method_into(&result, &ot, poly.name, &temps);
        self.close_block();

        self.release_if_needed(&ot);
        for t in &temps {
            self.release_if_needed(t);
        }
        Ok(result)
    }

    fn lower_dynamic_method(
        &mut self,
        object: &Expr,
        method: &str,
        args: &[Expr],
        line: usize,
    ) -> Result<String, CodeGenError> {
        let ot = self.lower_expr(object, line)?;
        // Spread arguments funnel through a dynamic array.
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
                "HmlValue {} = hml_call_method_array({}, \"{}\", {});",
                result,
                ot,
                escape_c_string(method),
                arr
            ));
            self.release_if_needed(&ot);
            self.release_if_needed(&arr);
            return Ok(result);
        }

        let mut temps = Vec::with_capacity(args.len());
        for arg in args {
            temps.push(self.lower_expr(arg, line)?);
        }
        let result = self.fresh_temp();
        self.emit_call_method_into(&result, &ot, method, &temps);
        // `result` is declared by emit_call_method_into only when it emits
        // into an undeclared name; declare-and-assign happens there.
        self.release_if_needed(&ot);
        for t in &temps {
            self.release_if_needed(t);
        }
        Ok(result)
    }

    /// Emit `result = hml_call_method(obj, "name", argv, argc);`, declaring
    /// the stack argv array as needed. `result` must already be declared
    /// when this is used inside a dispatch cascade.
    fn emit_call_method_into(&mut self, result: &str, obj: &str, method: &str, temps: &[String]) {
        let declared = self
            .out()
            .contains(&format!("HmlValue {};", result));
        let assign = if declared {
            format!("{} = ", result)
        } else {
            format!("HmlValue {} = ", result)
        };
        if temps.is_empty() {
            self.emit(&format!(
                "{}hml_call_method({}, \"{}\", NULL, 0);",
                assign,
                obj,
                escape_c_string(method)
            ));
        } else {
            let arr = self.fresh_temp();
            self.emit(&format!(
                "HmlValue {}[{}] = {{ {} }};",
                arr,
                temps.len(),
                temps.join(", ")
            ));
            self.emit(&format!(
                "{}hml_call_method({}, \"{}\", {}, {});",
                assign,
                obj,
                escape_c_string(method),
                arr,
                temps.len()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodegenOptions;
    use super::super::state::Storage;

    fn ctx() -> CodegenContext {
        let mut c = CodegenContext::new(CodegenOptions::default(), None);
        c.add_local("obj", Storage::Boxed);
        c
    }

    fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    fn mcall(method: &str, args: Vec<Expr>) -> Expr {
        Expr::MethodCall {
            object: Box::new(ident("obj")),
            method: method.to_string(),
            args,
        }
    }

    #[test]
    fn test_monomorphic_method() {
        let mut c = ctx();
        c.lower_expr(&mcall("push", vec![Expr::IntLit(1)]), 1).unwrap();
        assert!(c.main_out.contains("hml_array_push_method(_t0, _t1);"));
    }

    #[test]
    fn test_polymorphic_slice_discriminates_tags() {
        let mut c = ctx();
        c.lower_expr(&mcall("slice", vec![Expr::IntLit(1)]), 1).unwrap();
        let out = &c.main_out;
        assert!(out.contains("== HML_STRING"));
        assert!(out.contains("hml_string_slice"));
        assert!(out.contains("== HML_ARRAY"));
        assert!(out.contains("hml_array_slice"));
        assert!(out.contains("hml_call_method("));
    }

    #[test]
    fn test_close_covers_channel_file_socket() {
        let mut c = ctx();
        c.lower_expr(&mcall("close", vec![]), 1).unwrap();
        let out = &c.main_out;
        assert!(out.contains("hml_channel_close"));
        assert!(out.contains("hml_file_close"));
        assert!(out.contains("hml_socket_close"));
    }

    #[test]
    fn test_unknown_method_falls_through() {
        let mut c = ctx();
        c.lower_expr(&mcall("frobnicate", vec![Expr::IntLit(1), Expr::IntLit(2)]), 1)
            .unwrap();
        assert!(c
            .main_out
            .contains("hml_call_method(_t0, \"frobnicate\", _t4, 2);"));
    }

    #[test]
    fn test_channel_send_uses_tag_dispatch() {
        let mut c = ctx();
        c.lower_expr(&mcall("send", vec![Expr::IntLit(42)]), 1).unwrap();
        assert!(c.main_out.contains("hml_channel_send"));
        assert!(c.main_out.contains("hml_socket_send"));
    }
}
