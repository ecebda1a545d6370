//! The resolved type-system model the compiler consumes.
//!
//! Metadata loading happens upstream; a [`Module`] arrives with every type,
//! method and field already resolved into arenas, and with a token table
//! mapping the tokens embedded in IL streams onto those arenas. Nothing in
//! here is mutated during compilation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::define_id;
use crate::entity::IdMap;
use crate::error::{CoreError, Result};

define_id!(TypeId);
define_id!(MethodId);
define_id!(FieldId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimKind {
    Void,
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    IntPtr,
    UIntPtr,
}

impl PrimKind {
    /// Byte size, with pointer-sized primitives resolved against the target.
    pub fn byte_size(self, pointer_size: u32) -> u32 {
        match self {
            PrimKind::Void => 0,
            PrimKind::Bool | PrimKind::I8 | PrimKind::U8 => 1,
            PrimKind::Char | PrimKind::I16 | PrimKind::U16 => 2,
            PrimKind::I32 | PrimKind::U32 | PrimKind::F32 => 4,
            PrimKind::I64 | PrimKind::U64 | PrimKind::F64 => 8,
            PrimKind::IntPtr | PrimKind::UIntPtr => pointer_size,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            PrimKind::Bool
                | PrimKind::Char
                | PrimKind::U8
                | PrimKind::U16
                | PrimKind::U32
                | PrimKind::U64
                | PrimKind::UIntPtr
        )
    }
}

/// Structural shape of a type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum TypeShape {
    Primitive { prim: PrimKind },
    Class,
    ValueType,
    Interface,
    /// Single-dimensional zero-based array.
    Array { element: TypeId },
    ByRef { pointee: TypeId },
    Pointer { pointee: TypeId },
    /// A generic type or method parameter left open in a shared body.
    GenericParam { index: u32, method_param: bool },
}

/// Field placement policy, mirroring metadata layout attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    #[default]
    Auto,
    Sequential,
    Explicit,
}

/// Types the compiler must recognize beyond their structural shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WellKnown {
    Object,
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub shape: TypeShape,
    #[serde(default)]
    pub base: Option<TypeId>,
    /// Declaration order; instance and static fields interleaved.
    #[serde(default)]
    pub fields: Vec<FieldId>,
    /// Virtual method table, one entry per slot.
    #[serde(default)]
    pub vtable: Vec<MethodId>,
    #[serde(default)]
    pub layout: LayoutKind,
    /// Byte size of an instance (unboxed size for value types).
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub alignment: u32,
    #[serde(default)]
    pub well_known: Option<WellKnown>,
    #[serde(default)]
    pub is_delegate: bool,
    #[serde(default)]
    pub has_lazy_cctor: bool,
    /// Contains an open generic parameter; tokens naming it cannot be
    /// resolved to a symbol at compile time.
    #[serde(default)]
    pub runtime_determined: bool,
    #[serde(default)]
    pub generic_def: Option<TypeId>,
    #[serde(default)]
    pub instantiation: Vec<TypeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub owner: TypeId,
    pub ty: TypeId,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_thread_static: bool,
    /// Explicit-layout byte offset within the owner.
    #[serde(default)]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub params: Vec<TypeId>,
    pub ret: TypeId,
    #[serde(default)]
    pub is_instance: bool,
}

/// Where a shared method body finds its generic context at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    #[default]
    None,
    /// Read the descriptor out of the `this` object header.
    ThisObject,
    /// Hidden leading argument carrying the owning type descriptor.
    HiddenTypeArg,
    /// Hidden leading argument carrying the method dictionary.
    HiddenMethodDict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub owner: TypeId,
    pub signature: Signature,
    #[serde(default)]
    pub vtable_slot: Option<u32>,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub context: ContextSource,
    /// Shared body compiled once for several instantiations.
    #[serde(default)]
    pub runtime_determined: bool,
    #[serde(default)]
    pub generic_def: Option<MethodId>,
    #[serde(default)]
    pub instantiation: Vec<TypeId>,
    /// Provided by the runtime under this import name; no body is compiled.
    #[serde(default)]
    pub runtime_import: Option<String>,
    #[serde(default)]
    pub body: Option<cilbc::MethodBody>,
}

impl MethodDef {
    pub fn is_virtual(&self) -> bool {
        self.vtable_slot.is_some()
    }

    /// Generic virtual methods dispatch through the runtime's GVM table
    /// rather than an ordinary vtable slot.
    pub fn is_generic_virtual(&self) -> bool {
        self.is_virtual() && (!self.instantiation.is_empty() || self.generic_def.is_some())
    }

    /// The hidden generic argument occupies a parameter slot in the
    /// emitted signature.
    pub fn has_hidden_arg(&self) -> bool {
        matches!(
            self.context,
            ContextSource::HiddenTypeArg | ContextSource::HiddenMethodDict
        )
    }
}

/// What an IL token resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "snake_case")]
pub enum TokenItem {
    Type { id: TypeId },
    Method { id: MethodId },
    Field { id: FieldId },
    String { value: String },
    Signature { sig: Signature },
}

impl TokenItem {
    fn describe(&self) -> &'static str {
        match self {
            TokenItem::Type { .. } => "type",
            TokenItem::Method { .. } => "method",
            TokenItem::Field { .. } => "field",
            TokenItem::String { .. } => "string",
            TokenItem::Signature { .. } => "signature",
        }
    }
}

/// A fully resolved input module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default = "default_pointer_size")]
    pub pointer_size: u32,
    pub types: IdMap<TypeId, TypeDef>,
    pub methods: IdMap<MethodId, MethodDef>,
    pub fields: IdMap<FieldId, FieldDef>,
    #[serde(default)]
    pub tokens: BTreeMap<u32, TokenItem>,
}

fn default_pointer_size() -> u32 {
    8
}

impl Module {
    pub fn resolve_token(&self, token: u32) -> Result<&TokenItem> {
        self.tokens
            .get(&token)
            .ok_or(CoreError::UnresolvedToken { token })
    }

    pub fn type_token(&self, token: u32) -> Result<TypeId> {
        match self.resolve_token(token)? {
            TokenItem::Type { id } => Ok(*id),
            other => Err(CoreError::TokenKind {
                token,
                expected: "type",
                found: other.describe(),
            }),
        }
    }

    pub fn method_token(&self, token: u32) -> Result<MethodId> {
        match self.resolve_token(token)? {
            TokenItem::Method { id } => Ok(*id),
            other => Err(CoreError::TokenKind {
                token,
                expected: "method",
                found: other.describe(),
            }),
        }
    }

    pub fn field_token(&self, token: u32) -> Result<FieldId> {
        match self.resolve_token(token)? {
            TokenItem::Field { id } => Ok(*id),
            other => Err(CoreError::TokenKind {
                token,
                expected: "field",
                found: other.describe(),
            }),
        }
    }

    pub fn is_value_type(&self, ty: TypeId) -> bool {
        matches!(
            self.types[ty].shape,
            TypeShape::ValueType | TypeShape::Primitive { .. }
        )
    }

    /// Reference tracked by the garbage collector.
    pub fn is_gc_ref(&self, ty: TypeId) -> bool {
        matches!(
            self.types[ty].shape,
            TypeShape::Class | TypeShape::Interface | TypeShape::Array { .. }
        )
    }

    pub fn is_interface(&self, ty: TypeId) -> bool {
        self.types[ty].shape == TypeShape::Interface
    }

    /// Byte size used for array indexing and descriptor emission.
    pub fn byte_size(&self, ty: TypeId) -> Result<u32> {
        let def = &self.types[ty];
        match &def.shape {
            TypeShape::Primitive { prim } => Ok(prim.byte_size(self.pointer_size)),
            TypeShape::ValueType => {
                if def.size == 0 && !def.fields.is_empty() {
                    Err(CoreError::UnsizedType {
                        ty: self.display_name(ty),
                    })
                } else {
                    Ok(def.size)
                }
            }
            TypeShape::Class
            | TypeShape::Interface
            | TypeShape::Array { .. }
            | TypeShape::ByRef { .. }
            | TypeShape::Pointer { .. } => Ok(self.pointer_size),
            TypeShape::GenericParam { .. } => Err(CoreError::UnsizedType {
                ty: self.display_name(ty),
            }),
        }
    }

    /// Human-readable name for diagnostics, `Ns.Name<A, B>` style.
    pub fn display_name(&self, ty: TypeId) -> String {
        let def = &self.types[ty];
        match &def.shape {
            TypeShape::Array { element } => format!("{}[]", self.display_name(*element)),
            TypeShape::ByRef { pointee } => format!("{}&", self.display_name(*pointee)),
            TypeShape::Pointer { pointee } => format!("{}*", self.display_name(*pointee)),
            TypeShape::GenericParam {
                index,
                method_param,
            } => format!("{}{}", if *method_param { "!!" } else { "!" }, index),
            _ => {
                let mut out = String::new();
                if !def.namespace.is_empty() {
                    out.push_str(&def.namespace);
                    out.push('.');
                }
                out.push_str(&def.name);
                if !def.instantiation.is_empty() {
                    out.push('<');
                    for (i, arg) in def.instantiation.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(&self.display_name(*arg));
                    }
                    out.push('>');
                }
                out
            }
        }
    }

    /// Delegate `Invoke` methods get special call lowering.
    pub fn is_delegate_invoke(&self, method: MethodId) -> bool {
        let m = &self.methods[method];
        self.types[m.owner].is_delegate && m.name == "Invoke"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;

    fn tiny_module() -> Module {
        let mut types = IdMap::new();
        let obj = types.push(TypeDef {
            namespace: "System".into(),
            name: "Object".into(),
            shape: TypeShape::Class,
            base: None,
            fields: vec![],
            vtable: vec![],
            layout: LayoutKind::Auto,
            size: 0,
            alignment: 0,
            well_known: Some(WellKnown::Object),
            is_delegate: false,
            has_lazy_cctor: false,
            runtime_determined: false,
            generic_def: None,
            instantiation: vec![],
        });
        let mut m = Module {
            name: "tiny".into(),
            pointer_size: 8,
            types,
            methods: IdMap::new(),
            fields: IdMap::new(),
            tokens: BTreeMap::new(),
        };
        m.tokens.insert(0x0200_0001, TokenItem::Type { id: obj });
        m
    }

    #[test]
    fn test_token_resolution() {
        let m = tiny_module();
        let ty = m.type_token(0x0200_0001).unwrap();
        assert_eq!(m.display_name(ty), "System.Object");
        assert!(matches!(
            m.method_token(0x0200_0001),
            Err(CoreError::TokenKind {
                expected: "method",
                found: "type",
                ..
            })
        ));
        assert!(matches!(
            m.resolve_token(0xdead),
            Err(CoreError::UnresolvedToken { token: 0xdead })
        ));
    }

    #[test]
    fn test_byte_sizes() {
        let m = tiny_module();
        let obj = TypeId::from_index(0);
        assert_eq!(m.byte_size(obj).unwrap(), 8);
    }
}
