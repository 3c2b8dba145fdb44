//! Emitted-C prologue and runtime symbol knowledge
//!
//! The generated translation unit links against the fixed `hml_*` runtime
//! library; this module holds the include/macro prologue every unit starts
//! with, the C keyword set the mangler must dodge, and the signal constants
//! the `signal`/`raise`/`kill` builtins rely on.

/// Fixed include prologue. `hemlock_runtime.h` declares the whole `hml_*`
/// surface; the system headers are for the socket/poll builtins and the
/// setjmp-based exception hooks.
pub const HEADER_PROLOGUE: &str = "\
#include \"hemlock_runtime.h\"
#include <setjmp.h>
#include <signal.h>
#include <sys/socket.h>
#include <netinet/in.h>
#include <arpa/inet.h>
#include <poll.h>
";

/// Signal numbers exposed to source programs. Defined unconditionally so
/// generated code is identical across host platforms; the runtime maps
/// them to the host's numbering.
pub const SIGNAL_CONSTANTS: &[(&str, i32)] = &[
    ("HML_SIGINT", 2),
    ("HML_SIGTERM", 15),
    ("HML_SIGHUP", 1),
    ("HML_SIGQUIT", 3),
    ("HML_SIGABRT", 6),
    ("HML_SIGUSR1", 10),
    ("HML_SIGUSR2", 12),
    ("HML_SIGALRM", 14),
    ("HML_SIGCHLD", 17),
    ("HML_SIGPIPE", 13),
    ("HML_SIGCONT", 18),
    ("HML_SIGSTOP", 19),
    ("HML_SIGTSTP", 20),
];

/// C keywords and common standard-library identifiers a sanitized source
/// name must not collide with.
pub const C_RESERVED: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
    "enum", "extern", "float", "for", "goto", "if", "inline", "int", "long", "register",
    "restrict", "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef",
    "union", "unsigned", "void", "volatile", "while", "main", "errno", "stdin", "stdout",
    "stderr", "NULL", "bool", "true", "false",
];

/// Is this name reserved in C, or does it intrude on the runtime's
/// namespace? Either way the mangler appends an underscore.
pub fn is_reserved(name: &str) -> bool {
    C_RESERVED.contains(&name) || name.starts_with("hml_") || name.starts_with("_t")
}

/// Escape a string for a C string literal.
pub fn escape_c_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Escape a rune for a C character context; runes are emitted as their
/// unicode scalar value, so this renders the integer.
pub fn rune_literal(c: char) -> String {
    format!("{}", c as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prologue_starts_with_runtime_header() {
        assert!(HEADER_PROLOGUE.starts_with("#include \"hemlock_runtime.h\""));
        assert!(HEADER_PROLOGUE.contains("<setjmp.h>"));
        assert!(HEADER_PROLOGUE.contains("<poll.h>"));
    }

    #[test]
    fn test_signal_set_complete() {
        let names: Vec<&str> = SIGNAL_CONSTANTS.iter().map(|(n, _)| *n).collect();
        for sig in [
            "HML_SIGINT",
            "HML_SIGTERM",
            "HML_SIGHUP",
            "HML_SIGQUIT",
            "HML_SIGABRT",
            "HML_SIGUSR1",
            "HML_SIGUSR2",
            "HML_SIGALRM",
            "HML_SIGCHLD",
            "HML_SIGPIPE",
            "HML_SIGCONT",
            "HML_SIGSTOP",
            "HML_SIGTSTP",
        ] {
            assert!(names.contains(&sig), "missing {}", sig);
        }
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved("while"));
        assert!(is_reserved("hml_print"));
        assert!(is_reserved("_t3"));
        assert!(!is_reserved("total"));
    }

    #[test]
    fn test_escape_c_string() {
        assert_eq!(escape_c_string("a\"b\\c\n"), "a\\\"b\\\\c\\n");
        assert_eq!(escape_c_string("\x01"), "\\x01");
    }
}
