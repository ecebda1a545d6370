//! Deterministic C symbol naming.
//!
//! Symbols are derived purely from the resolved model, so two runs over the
//! same module agree byte for byte. Collisions (overloads, case folding,
//! sanitized punctuation) are broken by numeric suffixes handed out by a
//! shared first-winner registry.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::ty::{FieldId, MethodId, Module, PrimKind, TypeId, TypeShape};

/// Reserved words that may not be used as C identifiers.
const C_KEYWORDS: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
    "enum", "extern", "float", "for", "goto", "if", "inline", "int", "long", "register",
    "restrict", "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef",
    "union", "unsigned", "void", "volatile", "while",
];

/// Map an arbitrary string to a valid C identifier fragment.
pub fn sanitize_ident(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() || out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if C_KEYWORDS.contains(&out.as_str()) {
        out.push('_');
    }
    out
}

/// Mangled name of a type, without collision handling.
pub fn mangle_type(module: &Module, ty: TypeId) -> String {
    let def = &module.types[ty];
    match &def.shape {
        TypeShape::Primitive { prim } => prim_mangle(*prim).to_string(),
        TypeShape::Array { element } => format!("{}_Array", mangle_type(module, *element)),
        TypeShape::ByRef { pointee } => format!("{}_Ref", mangle_type(module, *pointee)),
        TypeShape::Pointer { pointee } => format!("{}_Ptr", mangle_type(module, *pointee)),
        TypeShape::GenericParam {
            index,
            method_param,
        } => {
            if *method_param {
                format!("M{index}")
            } else {
                format!("T{index}")
            }
        }
        _ => {
            let mut out = String::new();
            if !def.namespace.is_empty() {
                out.push_str(&sanitize_ident(&def.namespace));
                out.push('_');
            }
            out.push_str(&sanitize_ident(&def.name));
            for arg in &def.instantiation {
                out.push_str("__");
                out.push_str(&mangle_type(module, *arg));
            }
            out
        }
    }
}

fn prim_mangle(prim: PrimKind) -> &'static str {
    match prim {
        PrimKind::Void => "Void",
        PrimKind::Bool => "Boolean",
        PrimKind::Char => "Char",
        PrimKind::I8 => "SByte",
        PrimKind::U8 => "Byte",
        PrimKind::I16 => "Int16",
        PrimKind::U16 => "UInt16",
        PrimKind::I32 => "Int32",
        PrimKind::U32 => "UInt32",
        PrimKind::I64 => "Int64",
        PrimKind::U64 => "UInt64",
        PrimKind::F32 => "Single",
        PrimKind::F64 => "Double",
        PrimKind::IntPtr => "IntPtr",
        PrimKind::UIntPtr => "UIntPtr",
    }
}

#[derive(Default)]
struct SymbolTableInner {
    assigned: HashMap<String, String>,
    taken: HashSet<String>,
}

/// Shared symbol registry. `intern` is insert-or-get: the first caller for
/// a given key fixes the name, later callers for the same key see it.
#[derive(Default)]
pub struct SymbolTable {
    inner: Mutex<SymbolTableInner>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `key` (a stable identity such as `"method:42"`) to a unique
    /// symbol, preferring `base` and suffixing `_1`, `_2`, ... on collision.
    pub fn intern(&self, key: &str, base: &str) -> String {
        let mut inner = self.inner.lock();
        if let Some(name) = inner.assigned.get(key) {
            return name.clone();
        }
        let mut candidate = base.to_string();
        let mut n = 0u32;
        while inner.taken.contains(&candidate) {
            n += 1;
            candidate = format!("{base}_{n}");
        }
        inner.taken.insert(candidate.clone());
        inner.assigned.insert(key.to_string(), candidate.clone());
        candidate
    }

    pub fn type_symbol(&self, module: &Module, ty: TypeId) -> String {
        self.intern(&format!("type:{ty:?}"), &mangle_type(module, ty))
    }

    pub fn method_symbol(&self, module: &Module, method: MethodId) -> String {
        let def = &module.methods[method];
        let base = format!(
            "{}__{}",
            mangle_type(module, def.owner),
            sanitize_ident(&def.name)
        );
        self.intern(&format!("method:{method:?}"), &base)
    }

    pub fn field_symbol(&self, module: &Module, field: FieldId) -> String {
        let def = &module.fields[field];
        let base = if def.is_static {
            format!(
                "{}__{}",
                mangle_type(module, def.owner),
                sanitize_ident(&def.name)
            )
        } else {
            sanitize_ident(&def.name)
        };
        self.intern(&format!("field:{field:?}"), &base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_ident() {
        assert_eq!(sanitize_ident("Foo.Bar"), "Foo_Bar");
        assert_eq!(sanitize_ident("<Main>$"), "_Main__");
        assert_eq!(sanitize_ident("123abc"), "_123abc");
        assert_eq!(sanitize_ident("int"), "int_");
        assert_eq!(sanitize_ident(""), "_");
    }

    #[test]
    fn test_intern_first_winner() {
        let table = SymbolTable::new();
        assert_eq!(table.intern("a", "Foo"), "Foo");
        assert_eq!(table.intern("b", "Foo"), "Foo_1");
        assert_eq!(table.intern("c", "Foo"), "Foo_2");
        // Same key returns the assigned name, not a fresh one.
        assert_eq!(table.intern("b", "Foo"), "Foo_1");
    }
}
