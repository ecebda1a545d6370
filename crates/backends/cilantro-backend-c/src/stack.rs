//! The abstract operand stack.
//!
//! Entries model what the IL stack holds between instructions: rendered C
//! expressions, still-symbolic constants, and the token pseudo-values that
//! `ldtoken`/`ldftn` push. Constants stay symbolic so stores can elide
//! redundant casts and comparisons against null can simplify.

use cilantro_core::{MethodId, Module, PrimKind, TypeId, TypeShape};

/// Categories the abstract interpreter tracks, ordered by merge priority:
/// the result kind of a binary operation is the larger of its operand
/// kinds under this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StackValueKind {
    Unknown,
    Int32,
    Int64,
    NativeInt,
    Float,
    ByRef,
    ObjRef,
    ValueType,
}

impl StackValueKind {
    /// Kinds that binary arithmetic accepts.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            StackValueKind::Int32
                | StackValueKind::Int64
                | StackValueKind::NativeInt
                | StackValueKind::Float
                | StackValueKind::ByRef
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StackEntry {
    Int32Constant(i32),
    Int64Constant(i64),
    FloatConstant(f64),
    /// Null reference literal.
    NullReference,
    /// An already-rendered C expression.
    Expression {
        kind: StackValueKind,
        ty: Option<TypeId>,
        text: String,
    },
    /// Pushed by `ldtoken` on a type.
    TypeToken { ty: TypeId, text: String },
    /// Pushed by `ldftn`/`ldvirtftn`; consumed by `newobj` and `calli`.
    MethodPointer {
        method: MethodId,
        is_virtual: bool,
        text: String,
    },
}

impl StackEntry {
    pub fn expr(kind: StackValueKind, text: String) -> StackEntry {
        StackEntry::Expression {
            kind,
            ty: None,
            text,
        }
    }

    pub fn typed_expr(kind: StackValueKind, ty: TypeId, text: String) -> StackEntry {
        StackEntry::Expression {
            kind,
            ty: Some(ty),
            text,
        }
    }

    pub fn kind(&self) -> StackValueKind {
        match self {
            StackEntry::Int32Constant(_) => StackValueKind::Int32,
            StackEntry::Int64Constant(_) => StackValueKind::Int64,
            StackEntry::FloatConstant(_) => StackValueKind::Float,
            StackEntry::NullReference => StackValueKind::ObjRef,
            StackEntry::Expression { kind, .. } => *kind,
            // Token pseudo-values are handle-sized.
            StackEntry::TypeToken { .. } | StackEntry::MethodPointer { .. } => {
                StackValueKind::NativeInt
            }
        }
    }

    pub fn ty(&self) -> Option<TypeId> {
        match self {
            StackEntry::Expression { ty, .. } => *ty,
            _ => None,
        }
    }

    /// Render as a C expression.
    pub fn render(&self) -> String {
        match self {
            StackEntry::Int32Constant(v) => render_i32(*v),
            StackEntry::Int64Constant(v) => render_i64(*v),
            StackEntry::FloatConstant(v) => render_f64(*v),
            StackEntry::NullReference => "0".to_string(),
            StackEntry::Expression { text, .. }
            | StackEntry::TypeToken { text, .. }
            | StackEntry::MethodPointer { text, .. } => text.clone(),
        }
    }
}

/// `INT32_MIN` has no negative-literal spelling in C; print it through hex.
pub fn render_i32(v: i32) -> String {
    if v == i32::MIN {
        "(int32_t)(0x80000000)".to_string()
    } else {
        v.to_string()
    }
}

pub fn render_i64(v: i64) -> String {
    if v == i64::MIN {
        "(int64_t)(0x8000000000000000LL)".to_string()
    } else {
        format!("{v}LL")
    }
}

/// Floats go through their bit pattern so the value survives the text
/// round trip exactly; the comment carries the human-readable form.
pub fn render_f64(v: f64) -> String {
    format!("__double_from_bits(0x{:016x}ULL) /* {:?} */", v.to_bits(), v)
}

/// Abstract kind a value of this type has when loaded onto the stack.
/// Small integers widen to `Int32`; pointers are native ints.
pub fn kind_of_type(module: &Module, ty: TypeId) -> (StackValueKind, Option<TypeId>) {
    match &module.types[ty].shape {
        TypeShape::Primitive { prim } => match prim {
            PrimKind::Void => (StackValueKind::Unknown, None),
            PrimKind::Bool
            | PrimKind::Char
            | PrimKind::I8
            | PrimKind::U8
            | PrimKind::I16
            | PrimKind::U16
            | PrimKind::I32
            | PrimKind::U32 => (StackValueKind::Int32, Some(ty)),
            PrimKind::I64 | PrimKind::U64 => (StackValueKind::Int64, Some(ty)),
            PrimKind::IntPtr | PrimKind::UIntPtr => (StackValueKind::NativeInt, Some(ty)),
            PrimKind::F32 | PrimKind::F64 => (StackValueKind::Float, Some(ty)),
        },
        TypeShape::Class | TypeShape::Interface | TypeShape::Array { .. } => {
            (StackValueKind::ObjRef, Some(ty))
        }
        TypeShape::ValueType => (StackValueKind::ValueType, Some(ty)),
        TypeShape::ByRef { pointee } => (StackValueKind::ByRef, Some(*pointee)),
        TypeShape::Pointer { .. } => (StackValueKind::NativeInt, Some(ty)),
        // Shared bodies only exist for reference instantiations.
        TypeShape::GenericParam { .. } => (StackValueKind::ObjRef, Some(ty)),
    }
}

/// Whether a constant survives assignment to `dest` unchanged, making the
/// narrowing cast redundant. Unknown destinations always cast.
pub fn const_fits(value: i64, dest: PrimKind) -> bool {
    match dest {
        PrimKind::I8 => i8::try_from(value).is_ok(),
        PrimKind::Bool | PrimKind::U8 => u8::try_from(value).is_ok(),
        PrimKind::I16 => i16::try_from(value).is_ok(),
        PrimKind::Char | PrimKind::U16 => u16::try_from(value).is_ok(),
        PrimKind::I32 => i32::try_from(value).is_ok(),
        PrimKind::U32 => u32::try_from(value).is_ok(),
        PrimKind::I64 | PrimKind::U64 => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ordering() {
        assert!(StackValueKind::Int32 < StackValueKind::Int64);
        assert!(StackValueKind::Int64 < StackValueKind::NativeInt);
        assert!(StackValueKind::NativeInt < StackValueKind::Float);
        assert!(StackValueKind::Float < StackValueKind::ByRef);
        assert!(StackValueKind::ByRef < StackValueKind::ObjRef);
        assert!(StackValueKind::ObjRef < StackValueKind::ValueType);
    }

    #[test]
    fn test_const_fits() {
        assert!(const_fits(5, PrimKind::I32));
        assert!(const_fits(5, PrimKind::I8));
        assert!(!const_fits(300, PrimKind::I8));
        assert!(const_fits(300, PrimKind::U16));
        assert!(!const_fits(-1, PrimKind::U8));
        assert!(const_fits(-1, PrimKind::I64));
        assert!(!const_fits(0, PrimKind::IntPtr));
    }

    #[test]
    fn test_min_literals() {
        assert_eq!(render_i32(i32::MIN), "(int32_t)(0x80000000)");
        assert_eq!(render_i32(-5), "-5");
        assert_eq!(render_i64(7), "7LL");
        assert_eq!(render_i64(i64::MIN), "(int64_t)(0x8000000000000000LL)");
    }
}
