//! C backend: lowers decoded bytecode method bodies to C source text.
//!
//! The pipeline per method is block discovery ([`cfg`]), abstract
//! interpretation of the operand stack with spill-slot merging and
//! per-instruction lowering ([`translate`]), against the naming and
//! dependency registries shared across the module. [`emit`] assembles the
//! translation unit: runtime prelude, forward declarations, descriptors,
//! dispatch accessors, then the method bodies, with failed methods replaced
//! by trap stubs.

pub mod buffer;
pub mod cfg;
pub mod cnames;
pub mod descriptor;
pub mod emit;
pub mod error;
pub mod generics;
pub mod stack;
pub mod translate;

pub use emit::{emit_module, CompiledModule, Diagnostic};
pub use error::{CompileError, Result};
pub use translate::{translate_method, TranslatedMethod};
