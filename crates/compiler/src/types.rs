//! Runtime value tags and the type-inference side table
//!
//! The generator never inspects a runtime value's interior; the only type
//! knowledge it has is the tag names it emits into dispatch cascades and the
//! optional unboxing hints the type checker leaves behind.

use std::collections::HashMap;

/// Runtime value discriminators, mirroring the `HML_*` tag constants in
/// `hemlock_runtime.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueTag {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    Rune,
    Null,
    String,
    Array,
    Object,
    Buffer,
    Ptr,
    Function,
    Task,
    Channel,
    File,
    Socket,
}

impl ValueTag {
    /// The C constant the runtime header defines for this tag.
    pub fn c_const(self) -> &'static str {
        match self {
            ValueTag::I8 => "HML_I8",
            ValueTag::I16 => "HML_I16",
            ValueTag::I32 => "HML_I32",
            ValueTag::I64 => "HML_I64",
            ValueTag::U8 => "HML_U8",
            ValueTag::U16 => "HML_U16",
            ValueTag::U32 => "HML_U32",
            ValueTag::U64 => "HML_U64",
            ValueTag::F32 => "HML_F32",
            ValueTag::F64 => "HML_F64",
            ValueTag::Bool => "HML_BOOL",
            ValueTag::Rune => "HML_RUNE",
            ValueTag::Null => "HML_NULL",
            ValueTag::String => "HML_STRING",
            ValueTag::Array => "HML_ARRAY",
            ValueTag::Object => "HML_OBJECT",
            ValueTag::Buffer => "HML_BUFFER",
            ValueTag::Ptr => "HML_PTR",
            ValueTag::Function => "HML_FUNCTION",
            ValueTag::Task => "HML_TASK",
            ValueTag::Channel => "HML_CHANNEL",
            ValueTag::File => "HML_FILE",
            ValueTag::Socket => "HML_SOCKET",
        }
    }

    /// Map a source-level type name (as written in annotations and type
    /// patterns) to its tag. Unknown names are nominal object types.
    pub fn from_type_name(name: &str) -> Option<ValueTag> {
        Some(match name {
            "i8" => ValueTag::I8,
            "i16" => ValueTag::I16,
            "i32" => ValueTag::I32,
            "i64" => ValueTag::I64,
            "u8" => ValueTag::U8,
            "u16" => ValueTag::U16,
            "u32" => ValueTag::U32,
            "u64" => ValueTag::U64,
            "f32" => ValueTag::F32,
            "f64" => ValueTag::F64,
            "bool" => ValueTag::Bool,
            "rune" => ValueTag::Rune,
            "null" => ValueTag::Null,
            "string" => ValueTag::String,
            "array" => ValueTag::Array,
            "object" => ValueTag::Object,
            "buffer" => ValueTag::Buffer,
            "ptr" => ValueTag::Ptr,
            "function" => ValueTag::Function,
            "task" => ValueTag::Task,
            "channel" => ValueTag::Channel,
            "file" => ValueTag::File,
            "socket" => ValueTag::Socket,
            _ => return None,
        })
    }
}

/// Numeric types the checker may mark as unboxable: the variable lives in
/// raw C storage and is boxed only at escape points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl NativeType {
    pub fn from_type_name(name: &str) -> Option<NativeType> {
        Some(match name {
            "i8" => NativeType::I8,
            "i16" => NativeType::I16,
            "i32" => NativeType::I32,
            "i64" => NativeType::I64,
            "u8" => NativeType::U8,
            "u16" => NativeType::U16,
            "u32" => NativeType::U32,
            "u64" => NativeType::U64,
            "f32" => NativeType::F32,
            "f64" => NativeType::F64,
            _ => return None,
        })
    }

    /// The raw C storage type.
    pub fn c_type(self) -> &'static str {
        match self {
            NativeType::I8 => "int8_t",
            NativeType::I16 => "int16_t",
            NativeType::I32 => "int32_t",
            NativeType::I64 => "int64_t",
            NativeType::U8 => "uint8_t",
            NativeType::U16 => "uint16_t",
            NativeType::U32 => "uint32_t",
            NativeType::U64 => "uint64_t",
            NativeType::F32 => "float",
            NativeType::F64 => "double",
        }
    }

    /// The boxing constructor for values of this type (`hml_val_i32`, ...).
    pub fn constructor(self) -> &'static str {
        match self {
            NativeType::I8 => "hml_val_i8",
            NativeType::I16 => "hml_val_i16",
            NativeType::I32 => "hml_val_i32",
            NativeType::I64 => "hml_val_i64",
            NativeType::U8 => "hml_val_u8",
            NativeType::U16 => "hml_val_u16",
            NativeType::U32 => "hml_val_u32",
            NativeType::U64 => "hml_val_u64",
            NativeType::F32 => "hml_val_f32",
            NativeType::F64 => "hml_val_f64",
        }
    }

    /// The unboxing accessor (`hml_get_i32`, ...).
    pub fn accessor(self) -> &'static str {
        match self {
            NativeType::I8 => "hml_get_i8",
            NativeType::I16 => "hml_get_i16",
            NativeType::I32 => "hml_get_i32",
            NativeType::I64 => "hml_get_i64",
            NativeType::U8 => "hml_get_u8",
            NativeType::U16 => "hml_get_u16",
            NativeType::U32 => "hml_get_u32",
            NativeType::U64 => "hml_get_u64",
            NativeType::F32 => "hml_get_f32",
            NativeType::F64 => "hml_get_f64",
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, NativeType::F32 | NativeType::F64)
    }
}

/// The type checker's unboxing hints: `(scope id, variable name)` pairs the
/// checker proved safe to keep in raw C storage. Scope ids are `"main"` for
/// the main file's top level, the mangled C name for named functions and
/// closures, and the module prefix plus function name for module functions.
///
/// The table may be absent entirely; every consumer treats a missing entry
/// as "no information" and takes the boxed path.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    entries: HashMap<(String, String), NativeType>,
}

impl TypeTable {
    pub fn new() -> Self {
        TypeTable::default()
    }

    pub fn mark(&mut self, scope: impl Into<String>, name: impl Into<String>, ty: NativeType) {
        self.entries.insert((scope.into(), name.into()), ty);
    }

    pub fn lookup(&self, scope: &str, name: &str) -> Option<NativeType> {
        self.entries
            .get(&(scope.to_string(), name.to_string()))
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_from_type_name() {
        assert_eq!(ValueTag::from_type_name("i32"), Some(ValueTag::I32));
        assert_eq!(ValueTag::from_type_name("socket"), Some(ValueTag::Socket));
        assert_eq!(ValueTag::from_type_name("Point"), None);
    }

    #[test]
    fn test_native_type_c_storage() {
        assert_eq!(NativeType::I32.c_type(), "int32_t");
        assert_eq!(NativeType::F64.c_type(), "double");
        assert_eq!(NativeType::U8.constructor(), "hml_val_u8");
        assert!(NativeType::I64.is_integer());
        assert!(!NativeType::F32.is_integer());
    }

    #[test]
    fn test_type_table_lookup_scoped() {
        let mut table = TypeTable::new();
        table.mark("main", "x", NativeType::I32);
        assert_eq!(table.lookup("main", "x"), Some(NativeType::I32));
        assert_eq!(table.lookup("hml_fn_f", "x"), None);
    }
}
