//! Shared model for the bytecode-to-C compiler: entity arenas, the resolved
//! type system consumed as input, symbol naming, dependency recording, and
//! field layout.

pub mod deps;
pub mod entity;
pub mod error;
pub mod layout;
pub mod naming;
pub mod ty;

pub use deps::{DependencySet, GlobalDependencies, TypeStrength};
pub use error::{CoreError, Result};
pub use naming::SymbolTable;
pub use ty::{
    ContextSource, FieldDef, FieldId, MethodDef, MethodId, Module, PrimKind, Signature,
    TokenItem, TypeDef, TypeId, TypeShape, WellKnown,
};
