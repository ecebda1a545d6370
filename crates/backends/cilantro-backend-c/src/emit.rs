//! Whole-module emission: compiles every method body, collects the merged
//! dependency set, and lays out one C translation unit in a fixed section
//! order so repeated runs produce byte-identical output.
//!
//! A method that fails to lower is replaced by a stub that raises the
//! matching runtime trap; the failure is reported as a diagnostic and the
//! batch continues. Panics inside the lowering of one method are caught at
//! the method boundary and demoted to `Internal`.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use cilantro_core::naming::{mangle_type, SymbolTable};
use cilantro_core::{
    DependencySet, GlobalDependencies, MethodId, Module, TypeShape, TypeStrength,
};

use crate::buffer::CodeBuffer;
use crate::cline;
use crate::cnames;
use crate::descriptor::{DescriptorEmitter, DescriptorRegistry};
use crate::error::{CompileError, Result};
use crate::generics::HIDDEN_ARG;
use crate::translate::translate_method;

/// One failed method, with the tier that decided its stub.
#[derive(Debug)]
pub struct Diagnostic {
    pub method: MethodId,
    pub name: String,
    pub error: CompileError,
}

#[derive(Debug)]
pub struct CompiledModule {
    pub source: String,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn emit_module(module: &Module) -> Result<CompiledModule> {
    let names = SymbolTable::new();
    let global = GlobalDependencies::new();
    let registry = DescriptorRegistry::new();
    let mut diagnostics = Vec::new();

    // Pass 1: lower every method that has a body. Failures become stubs
    // and contribute no dependencies.
    let mut bodies: Vec<(MethodId, String)> = Vec::new();
    let mut compiled: BTreeSet<MethodId> = BTreeSet::new();
    for method in module.methods.keys() {
        let def = &module.methods[method];
        if def.body.is_none() || def.runtime_import.is_some() {
            continue;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| translate_method(module, &names, method)))
            .unwrap_or_else(|_| {
                Err(CompileError::Internal(
                    "panic while lowering method body".into(),
                ))
            });
        match outcome {
            Ok(translated) => {
                global.merge(&translated.deps);
                bodies.push((method, translated.code));
            }
            Err(error) => {
                let code = stub_body(module, &names, method, &error);
                diagnostics.push(Diagnostic {
                    method,
                    name: def.name.clone(),
                    error,
                });
                bodies.push((method, code));
            }
        }
        compiled.insert(method);
    }

    let deps = global.snapshot();
    let mut out = CodeBuffer::new();
    emit_prelude(&mut out);
    emit_forward_decls(module, &names, &deps, &mut out);
    emit_prototypes(module, &names, &deps, &compiled, &mut out)?;
    emit_descriptors(module, &names, &registry, &deps, &mut out)?;
    emit_accessors(module, &names, &registry, &deps, &mut out)?;

    out.line("/* method bodies */");
    for (_, code) in &bodies {
        out.newline();
        out.append_raw(code);
    }

    Ok(CompiledModule {
        source: out.finish(),
        diagnostics,
    })
}

/// Runtime contract: everything the generated code calls into.
fn emit_prelude(out: &mut CodeBuffer) {
    out.line("#include <stdint.h>");
    out.line("#include <stddef.h>");
    out.line("#include <string.h>");
    out.line("#include <math.h>");
    out.line("#include <alloca.h>");
    out.newline();
    for decl in [
        "void* __allocate_object(void* mtable);",
        "void* __allocate_array(void* element_mtable, intptr_t length);",
        "void* __literal_string(const char* utf8);",
        "void* __castclass(void* mtable, void* obj);",
        "void* __isinst(void* mtable, void* obj);",
        "void __throw(void* obj);",
        "void* __current_exception(void);",
        "void __unreachable(void);",
        "void __unsupported_method(const char* name);",
        "void __throw_invalid_program(void);",
        "void __range_check(void* array, intptr_t index);",
        "void __trigger_cctor(void* mtable);",
        "void __init_delegate(void* del, void* target, void* fptr);",
        "void* __resolve_interface_call(void* obj, void* interface_mtable, intptr_t slot);",
        "void* __get_nongc_static_base(void* mtable);",
        "void* __get_gc_static_base(void* mtable);",
        "void* __get_thread_static_base(void* mtable);",
    ] {
        out.line(decl);
    }
    out.newline();
    out.line("static inline double __double_from_bits(uint64_t bits) {");
    out.indent();
    out.line("double value;");
    out.line("memcpy(&value, &bits, sizeof value);");
    out.line("return value;");
    out.exdent();
    out.line("}");
    out.newline();
}

/// `struct X;` for every type with an instance layout, sorted by symbol so
/// the section is reproducible.
fn emit_forward_decls(
    module: &Module,
    names: &SymbolTable,
    deps: &DependencySet,
    out: &mut CodeBuffer,
) {
    let mut syms: Vec<String> = deps
        .types()
        .map(|(ty, _)| ty)
        .chain(deps.static_bases())
        .filter(|&ty| {
            matches!(
                module.types[ty].shape,
                TypeShape::Class | TypeShape::ValueType
            )
        })
        .map(|ty| names.type_symbol(module, ty))
        .collect();
    syms.sort();
    syms.dedup();
    out.line("/* forward declarations */");
    for sym in syms {
        cline!(out, "struct {sym};");
    }
    out.newline();
}

/// All methods whose symbols appear anywhere in the unit: compiled bodies,
/// direct-call dependencies, and the vtable contents of constructed types.
fn prototype_set(
    module: &Module,
    deps: &DependencySet,
    compiled: &BTreeSet<MethodId>,
) -> BTreeSet<MethodId> {
    let mut set: BTreeSet<MethodId> = compiled.clone();
    set.extend(deps.methods());
    for (ty, strength) in deps.types() {
        if strength == TypeStrength::Constructed {
            for &m in &module.types[ty].vtable {
                let def = &module.methods[m];
                if !def.is_abstract && !def.runtime_determined {
                    set.insert(m);
                }
            }
        }
    }
    set
}

fn emit_prototypes(
    module: &Module,
    names: &SymbolTable,
    deps: &DependencySet,
    compiled: &BTreeSet<MethodId>,
    out: &mut CodeBuffer,
) -> Result<()> {
    out.line("/* prototypes */");
    for method in prototype_set(module, deps, compiled) {
        let def = &module.methods[method];
        let params = cnames::param_c_types(module, names, method);
        let list = if params.is_empty() {
            "void".to_string()
        } else {
            params.join(", ")
        };
        let ret = cnames::return_c_type(module, names, method);
        let name = match &def.runtime_import {
            Some(import) => import.clone(),
            None => names.method_symbol(module, method),
        };
        cline!(out, "{ret} {name}({list});");
    }
    // Generic-sharing lookup helpers and the static thunks behind shared
    // function pointers.
    for method in deps.methods() {
        let def = &module.methods[method];
        let sym = names.method_symbol(module, method);
        if def.runtime_determined {
            cline!(out, "void* __lookup_method_{sym}(void* context);");
            cline!(out, "void* __lookup_methoddict_{sym}(void* context);");
        }
        if def.has_hidden_arg() {
            cline!(
                out,
                "extern struct {{ void* __entry; void* __hidden; }} __fat__{sym};"
            );
            cline!(out, "extern void* __dict__{sym};");
        }
    }
    for method in deps.virtual_calls() {
        if module.methods[method].is_generic_virtual() {
            let sym = names.method_symbol(module, method);
            cline!(out, "void* __gvm_lookup_{sym}(void* obj);");
        }
    }
    for (ty, _) in deps.types() {
        if module.types[ty].runtime_determined {
            cline!(
                out,
                "void* __lookup_type_{}(void* context);",
                mangle_type(module, ty)
            );
        }
    }
    out.newline();
    Ok(())
}

fn emit_descriptors(
    module: &Module,
    names: &SymbolTable,
    registry: &DescriptorRegistry,
    deps: &DependencySet,
    out: &mut CodeBuffer,
) -> Result<()> {
    out.line("/* type descriptors and statics */");
    let emitter = DescriptorEmitter::new(module, names, registry);
    for (ty, strength) in deps.types() {
        emitter.emit_type(ty, strength, out)?;
    }
    for ty in deps.static_bases() {
        emitter.emit_type(ty, TypeStrength::Necessary, out)?;
    }
    for ty in deps.cctors() {
        emitter.emit_type(ty, TypeStrength::Necessary, out)?;
    }
    out.newline();
    Ok(())
}

fn emit_accessors(
    module: &Module,
    names: &SymbolTable,
    registry: &DescriptorRegistry,
    deps: &DependencySet,
    out: &mut CodeBuffer,
) -> Result<()> {
    out.line("/* dispatch accessors */");
    let emitter = DescriptorEmitter::new(module, names, registry);
    for method in deps.virtual_calls() {
        if !module.methods[method].is_generic_virtual() {
            emitter.emit_slot_accessor(method, out)?;
        }
    }
    for (ty, _) in deps.types() {
        if module.types[ty].is_delegate {
            emitter.emit_invoke_accessor(ty, out);
        }
    }
    out.newline();
    Ok(())
}

/// Replacement body for a method that failed to lower. `InvalidProgram`
/// raises the verifier trap; the other tiers report the method by name.
fn stub_body(
    module: &Module,
    names: &SymbolTable,
    method: MethodId,
    error: &CompileError,
) -> String {
    let arg_names = emitted_arg_names(module, method);
    let sym = names.method_symbol(module, method);
    let mut out = CodeBuffer::new();
    cline!(
        out,
        "{} {{",
        cnames::method_declaration(module, names, method, &arg_names)
    );
    out.indent();
    match error {
        CompileError::InvalidProgram(_) => out.line("__throw_invalid_program();"),
        _ => cline!(out, "__unsupported_method(\"{sym}\");"),
    }
    out.line("__unreachable();");
    out.exdent();
    out.line("}");
    out.finish()
}

/// Positional argument names as the translator emits them: `_a0` is `this`
/// when present, the hidden context argument keeps its fixed name, and IL
/// argument indices map straight onto `_a{i}`.
fn emitted_arg_names(module: &Module, method: MethodId) -> Vec<String> {
    let def = &module.methods[method];
    let mut arg_names = Vec::new();
    let mut il_index = 0u32;
    if def.signature.is_instance {
        arg_names.push("_a0".to_string());
        il_index = 1;
    }
    if def.has_hidden_arg() {
        arg_names.push(HIDDEN_ARG.to_string());
    }
    for _ in &def.signature.params {
        arg_names.push(format!("_a{il_index}"));
        il_index += 1;
    }
    arg_names
}
