//! Generic sharing: context discovery and dictionary lookups.
//!
//! A shared method body serves every reference-type instantiation of its
//! definition, so tokens that name an open type or method cannot become
//! plain symbols. They lower to a lookup helper applied to the generic
//! context, which the method finds in one of three places: the `this`
//! object's descriptor, a hidden type-descriptor argument, or a hidden
//! method-dictionary argument.

use cilantro_core::naming::{mangle_type, sanitize_ident, SymbolTable};
use cilantro_core::{ContextSource, DependencySet, MethodId, Module, TypeId, TypeStrength};

use crate::error::{CompileError, Result};

/// Name of the hidden context parameter in emitted signatures.
pub const HIDDEN_ARG: &str = "_hidden";

/// Rendered C expression producing the generic context inside `method`.
pub fn context_expr(module: &Module, method: MethodId) -> Result<String> {
    let def = &module.methods[method];
    match def.context {
        ContextSource::None => Err(CompileError::InvalidProgram(
            "runtime-determined token in a method without generic context".into(),
        )),
        // The descriptor sits in the object header's first slot.
        ContextSource::ThisObject => Ok("(*(void**)_a0)".to_string()),
        ContextSource::HiddenTypeArg | ContextSource::HiddenMethodDict => {
            Ok(HIDDEN_ARG.to_string())
        }
    }
}

/// Expression yielding a type descriptor. Statically exact types resolve to
/// their descriptor accessor; runtime-determined ones go through a lookup
/// helper keyed by the open type, applied to the context.
pub fn type_descriptor_expr(
    module: &Module,
    names: &SymbolTable,
    deps: &mut DependencySet,
    method: MethodId,
    ty: TypeId,
    strength: TypeStrength,
) -> Result<String> {
    deps.record_type(ty, strength);
    if module.types[ty].runtime_determined {
        let ctx = context_expr(module, method)?;
        Ok(format!(
            "__lookup_type_{}({ctx})",
            mangle_type(module, ty)
        ))
    } else {
        let sym = names.type_symbol(module, ty);
        Ok(format!("__getMethodTable_{sym}()"))
    }
}

/// Expression yielding the entry point of a runtime-determined method.
pub fn method_entry_lookup_expr(
    module: &Module,
    names: &SymbolTable,
    deps: &mut DependencySet,
    caller: MethodId,
    callee: MethodId,
) -> Result<String> {
    deps.record_method(callee);
    let ctx = context_expr(module, caller)?;
    let sym = names.method_symbol(module, callee);
    Ok(format!("__lookup_method_{sym}({ctx})"))
}

/// Statics bases of a runtime-determined owner resolve through the context
/// as well; the helper takes the looked-up descriptor.
pub fn statics_base_lookup_expr(
    module: &Module,
    names: &SymbolTable,
    deps: &mut DependencySet,
    method: MethodId,
    owner: TypeId,
    helper: &str,
) -> Result<String> {
    deps.record_static_base(owner);
    let descriptor =
        type_descriptor_expr(module, names, deps, method, owner, TypeStrength::Necessary)?;
    Ok(format!("{helper}({descriptor})"))
}

/// A function pointer that may carry an instantiation argument.
///
/// Code pointers are at least 4-aligned, so bit 1 doubles as the tag: a
/// tagged pointer addresses a two-slot thunk holding the real entry point
/// and the hidden argument, offset by the tag itself.
pub struct FatPointer;

impl FatPointer {
    pub const TAG: u32 = 2;

    /// C condition testing whether `fp` is fat.
    pub fn test_expr(fp: &str) -> String {
        format!("(((intptr_t)({fp})) & {})", Self::TAG)
    }

    /// Real entry point of a fat `fp`.
    pub fn entry_expr(fp: &str) -> String {
        format!("(*(void**)((char*)({fp}) - {}))", Self::TAG)
    }

    /// Hidden instantiation argument of a fat `fp`.
    pub fn hidden_expr(fp: &str) -> String {
        format!("(*((void**)((char*)({fp}) - {}) + 1))", Self::TAG)
    }

    /// Address-of expression for a statically built fat pointer to a
    /// shared method, pre-tagged.
    pub fn tagged_symbol_expr(method_symbol: &str) -> String {
        format!(
            "((void*)((char*)&__fat__{} + {}))",
            sanitize_ident(method_symbol),
            Self::TAG
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fat_pointer_exprs() {
        assert_eq!(FatPointer::test_expr("fp"), "(((intptr_t)(fp)) & 2)");
        assert_eq!(FatPointer::entry_expr("fp"), "(*(void**)((char*)(fp) - 2))");
        assert_eq!(
            FatPointer::hidden_expr("fp"),
            "(*((void**)((char*)(fp) - 2) + 1))"
        );
    }
}
