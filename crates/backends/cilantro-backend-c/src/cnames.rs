//! Rendering of C type names, signatures and well-known runtime symbols.

use cilantro_core::naming::SymbolTable;
use cilantro_core::{MethodId, Module, PrimKind, TypeId, TypeShape};

use crate::stack::StackValueKind;

/// C spelling of a type when it appears in a signature, local, or field.
/// GC references are untyped pointers; value types are their structs.
pub fn c_type(module: &Module, names: &SymbolTable, ty: TypeId) -> String {
    let def = &module.types[ty];
    match &def.shape {
        TypeShape::Primitive { prim } => prim_c_type(*prim).to_string(),
        TypeShape::Class | TypeShape::Interface | TypeShape::Array { .. } => "void*".to_string(),
        TypeShape::ValueType => format!("struct {}", names.type_symbol(module, ty)),
        TypeShape::ByRef { pointee } | TypeShape::Pointer { pointee } => {
            format!("{}*", c_type(module, names, *pointee))
        }
        // Open parameters only appear behind pointers in shared bodies.
        TypeShape::GenericParam { .. } => "void*".to_string(),
    }
}

pub fn prim_c_type(prim: PrimKind) -> &'static str {
    match prim {
        PrimKind::Void => "void",
        PrimKind::Bool => "uint8_t",
        PrimKind::Char => "uint16_t",
        PrimKind::I8 => "int8_t",
        PrimKind::U8 => "uint8_t",
        PrimKind::I16 => "int16_t",
        PrimKind::U16 => "uint16_t",
        PrimKind::I32 => "int32_t",
        PrimKind::U32 => "uint32_t",
        PrimKind::I64 => "int64_t",
        PrimKind::U64 => "uint64_t",
        PrimKind::F32 => "float",
        PrimKind::F64 => "double",
        PrimKind::IntPtr => "intptr_t",
        PrimKind::UIntPtr => "uintptr_t",
    }
}

/// C type of a temp or spill slot holding a value of this abstract kind.
pub fn kind_c_type(
    module: &Module,
    names: &SymbolTable,
    kind: StackValueKind,
    ty: Option<TypeId>,
) -> String {
    match kind {
        StackValueKind::Int32 => "int32_t".to_string(),
        StackValueKind::Int64 => "int64_t".to_string(),
        StackValueKind::NativeInt => "intptr_t".to_string(),
        StackValueKind::Float => "double".to_string(),
        StackValueKind::ObjRef | StackValueKind::Unknown => "void*".to_string(),
        StackValueKind::ByRef => match ty {
            Some(t) => format!("{}*", c_type(module, names, t)),
            None => "void*".to_string(),
        },
        StackValueKind::ValueType => match ty {
            Some(t) => c_type(module, names, t),
            None => "void*".to_string(),
        },
    }
}

/// Unsigned counterpart used by `.un` arithmetic and comparisons.
pub fn unsigned_kind_c_type(kind: StackValueKind) -> &'static str {
    match kind {
        StackValueKind::Int32 => "uint32_t",
        StackValueKind::Int64 => "uint64_t",
        _ => "uintptr_t",
    }
}

/// Parameter C types of a method as emitted, including `this` and the
/// hidden generic argument.
pub fn param_c_types(module: &Module, names: &SymbolTable, method: MethodId) -> Vec<String> {
    let def = &module.methods[method];
    let mut out = Vec::new();
    if def.signature.is_instance {
        if module.is_value_type(def.owner) {
            out.push(format!("{}*", c_type(module, names, def.owner)));
        } else {
            out.push("void*".to_string());
        }
    }
    if def.has_hidden_arg() {
        out.push("void*".to_string());
    }
    for &p in &def.signature.params {
        out.push(c_type(module, names, p));
    }
    out
}

pub fn return_c_type(module: &Module, names: &SymbolTable, method: MethodId) -> String {
    c_type(module, names, module.methods[method].signature.ret)
}

/// Function-pointer cast text for indirect calls to this method's shape,
/// e.g. `int32_t (*)(void*, int32_t)`.
pub fn fn_ptr_type(module: &Module, names: &SymbolTable, method: MethodId) -> String {
    let params = param_c_types(module, names, method);
    let param_list = if params.is_empty() {
        "void".to_string()
    } else {
        params.join(", ")
    };
    format!(
        "{} (*)({})",
        return_c_type(module, names, method),
        param_list
    )
}

/// Function-pointer cast for a raw `calli` signature (no hidden arg).
pub fn fn_ptr_type_for_sig(
    module: &Module,
    names: &SymbolTable,
    sig: &cilantro_core::Signature,
    with_hidden: bool,
) -> String {
    let mut params = Vec::new();
    if sig.is_instance {
        params.push("void*".to_string());
    }
    if with_hidden {
        params.push("void*".to_string());
    }
    for &p in &sig.params {
        params.push(c_type(module, names, p));
    }
    let param_list = if params.is_empty() {
        "void".to_string()
    } else {
        params.join(", ")
    };
    format!("{} (*)({})", c_type(module, names, sig.ret), param_list)
}

/// Full C declarator for a method definition or prototype.
pub fn method_declaration(
    module: &Module,
    names: &SymbolTable,
    method: MethodId,
    arg_names: &[String],
) -> String {
    let params = param_c_types(module, names, method);
    let list = if params.is_empty() {
        "void".to_string()
    } else {
        params
            .iter()
            .zip(arg_names)
            .map(|(t, n)| format!("{t} {n}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "{} {}({})",
        return_c_type(module, names, method),
        names.method_symbol(module, method),
        list
    )
}

pub fn method_table_expr(sym: &str) -> String {
    format!("__getMethodTable_{sym}()")
}

/// Vtable-slot accessor call for a virtual method. For interface methods
/// the emitted accessor returns the slot within the interface itself.
pub fn slot_accessor_expr(sym: &str) -> String {
    format!("__getslot__{sym}()")
}

/// Accessor returning the function pointer stored in a delegate instance.
pub fn invoke_accessor_name(type_sym: &str) -> String {
    format!("__invoke__{type_sym}")
}

/// Names of the four statics blocks for a type.
pub fn statics_struct_name(sym: &str, bucket: cilantro_core::layout::StaticBucket) -> String {
    use cilantro_core::layout::StaticBucket;
    match bucket {
        StaticBucket::Plain => format!("{sym}__Statics"),
        StaticBucket::Gc => format!("{sym}__GcStatics"),
        StaticBucket::ThreadPlain => format!("{sym}__ThreadStatics"),
        StaticBucket::ThreadGc => format!("{sym}__ThreadGcStatics"),
    }
}

pub fn statics_instance_name(sym: &str, bucket: cilantro_core::layout::StaticBucket) -> String {
    use cilantro_core::layout::StaticBucket;
    match bucket {
        StaticBucket::Plain => format!("{sym}__statics"),
        StaticBucket::Gc => format!("{sym}__gcStatics"),
        StaticBucket::ThreadPlain => format!("{sym}__threadStatics"),
        StaticBucket::ThreadGc => format!("{sym}__threadGcStatics"),
    }
}

/// Runtime helper that materializes a statics base from a type descriptor
/// when the owning type is only known at run time.
pub fn statics_base_helper(bucket: cilantro_core::layout::StaticBucket) -> &'static str {
    use cilantro_core::layout::StaticBucket;
    match bucket {
        StaticBucket::Plain => "__get_nongc_static_base",
        StaticBucket::Gc => "__get_gc_static_base",
        StaticBucket::ThreadPlain | StaticBucket::ThreadGc => "__get_thread_static_base",
    }
}

/// Escape a string literal for a C source file. Non-printable and
/// non-ASCII bytes use three-digit octal escapes; unlike `\x`, those
/// cannot swallow a following hex digit.
pub fn escape_c_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for byte in s.bytes() {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("\\{byte:03o}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_c_string() {
        assert_eq!(escape_c_string("a\"b"), "a\\\"b");
        assert_eq!(escape_c_string("line\r\n"), "line\\r\\n");
        assert_eq!(escape_c_string("tab\there"), "tab\\there");
        assert_eq!(escape_c_string("\u{1}"), "\\001");
        assert_eq!(escape_c_string("é"), "\\303\\251");
    }
}
