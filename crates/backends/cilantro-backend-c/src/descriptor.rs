//! Type and object descriptor emission.
//!
//! For every referenced type this produces, at most once each: the C struct
//! mirroring the instance layout, the four statics blocks, and the type
//! descriptor blob behind `__getMethodTable_*`. The blob is an ordered run
//! of raw bytes and relocation slots; relocations must land on
//! pointer-aligned offsets because the emitted initializer represents them
//! as pointer members.

use std::collections::HashSet;

use parking_lot::Mutex;

use cilantro_core::layout::{partition_fields, StaticBucket};
use cilantro_core::naming::SymbolTable;
use cilantro_core::ty::LayoutKind;
use cilantro_core::{Module, TypeId, TypeShape, TypeStrength};

use crate::buffer::CodeBuffer;
use crate::cline;
use crate::cnames;
use crate::error::{CompileError, Result};

const MT_FLAG_VALUETYPE: u32 = 0x1;
const MT_FLAG_INTERFACE: u32 = 0x2;
const MT_FLAG_ARRAY: u32 = 0x4;
const MT_FLAG_LAZY_CCTOR: u32 = 0x8;
const MT_FLAG_DELEGATE: u32 = 0x10;

/// Module-wide "already emitted" sets. First claimant emits; everyone else
/// skips, so concurrent method compilation cannot duplicate a definition.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    structs: Mutex<HashSet<TypeId>>,
    tables: Mutex<HashSet<TypeId>>,
    statics: Mutex<HashSet<TypeId>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim_struct(&self, ty: TypeId) -> bool {
        self.structs.lock().insert(ty)
    }

    fn claim_table(&self, ty: TypeId) -> bool {
        self.tables.lock().insert(ty)
    }

    fn claim_statics(&self, ty: TypeId) -> bool {
        self.statics.lock().insert(ty)
    }
}

/// One piece of a descriptor blob.
#[derive(Debug, PartialEq)]
enum BlobPart {
    Bytes(Vec<u8>),
    Reloc(String),
}

/// Descriptor data under construction: little-endian byte runs interleaved
/// with relocation slots.
#[derive(Debug)]
pub struct Blob {
    pointer_size: u32,
    parts: Vec<BlobPart>,
    len: u32,
}

impl Blob {
    pub fn new(pointer_size: u32) -> Self {
        Self {
            pointer_size,
            parts: Vec::new(),
            len: 0,
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.len += bytes.len() as u32;
        if let Some(BlobPart::Bytes(run)) = self.parts.last_mut() {
            run.extend_from_slice(bytes);
        } else {
            self.parts.push(BlobPart::Bytes(bytes.to_vec()));
        }
    }

    pub fn push_u32(&mut self, v: u32) {
        self.push_bytes(&v.to_le_bytes());
    }

    /// A pointer-sized zero: a null relocation slot.
    pub fn push_null_ptr(&mut self) {
        self.push_bytes(&vec![0u8; self.pointer_size as usize]);
    }

    /// A relocation to `target` (an address-of expression). The current
    /// offset must be pointer-aligned; anything else is an emitter bug.
    pub fn push_reloc(&mut self, target: String) -> Result<()> {
        if self.len % self.pointer_size != 0 {
            return Err(CompileError::Internal(format!(
                "relocation at unaligned blob offset {}",
                self.len
            )));
        }
        self.parts.push(BlobPart::Reloc(target));
        self.len += self.pointer_size;
        Ok(())
    }

    /// Emit the blob as a static struct definition named `name`.
    pub fn render(&self, name: &str, out: &mut CodeBuffer) {
        out.line("static const struct {");
        out.indent();
        for (i, part) in self.parts.iter().enumerate() {
            match part {
                BlobPart::Bytes(run) => cline!(out, "uint8_t __d{i}[{}];", run.len()),
                BlobPart::Reloc(_) => cline!(out, "void* __r{i};"),
            }
        }
        out.exdent();
        cline!(out, "}} {name} = {{");
        out.indent();
        for part in &self.parts {
            match part {
                BlobPart::Bytes(run) => {
                    let bytes: Vec<String> =
                        run.iter().map(|b| format!("0x{b:02x}")).collect();
                    cline!(out, "{{ {} }},", bytes.join(", "));
                }
                BlobPart::Reloc(target) => cline!(out, "{target},"),
            }
        }
        out.exdent();
        out.line("};");
    }
}

pub struct DescriptorEmitter<'a> {
    module: &'a Module,
    names: &'a SymbolTable,
    registry: &'a DescriptorRegistry,
}

impl<'a> DescriptorEmitter<'a> {
    pub fn new(
        module: &'a Module,
        names: &'a SymbolTable,
        registry: &'a DescriptorRegistry,
    ) -> Self {
        Self {
            module,
            names,
            registry,
        }
    }

    /// Emit everything a dependency on `ty` requires that has not been
    /// emitted yet.
    pub fn emit_type(&self, ty: TypeId, strength: TypeStrength, out: &mut CodeBuffer) -> Result<()> {
        self.emit_struct(ty, out)?;
        self.emit_statics(ty, out)?;
        if !self.module.types[ty].runtime_determined {
            self.emit_method_table(ty, strength, out)?;
        }
        Ok(())
    }

    /// Instance-layout struct, with embedded value-type fields defined
    /// first so the member declarations are complete types.
    fn emit_struct(&self, ty: TypeId, out: &mut CodeBuffer) -> Result<()> {
        let def = &self.module.types[ty];
        let needs_struct = matches!(def.shape, TypeShape::Class | TypeShape::ValueType);
        if !needs_struct || !self.registry.claim_struct(ty) {
            return Ok(());
        }
        let part = partition_fields(self.module, ty)?;
        for &field in &part.instance {
            let fty = self.module.fields[field].ty;
            if self.module.types[fty].shape == TypeShape::ValueType {
                self.emit_struct(fty, out)?;
            }
        }
        if let Some(base) = def.base {
            self.emit_struct(base, out)?;
        }

        let sym = self.names.type_symbol(self.module, ty);
        cline!(out, "struct {sym} {{");
        out.indent();
        match def.shape {
            TypeShape::Class => {
                match def.base {
                    Some(base) => {
                        let base_sym = self.names.type_symbol(self.module, base);
                        cline!(out, "struct {base_sym} __base;");
                    }
                    // The root object carries the descriptor slot itself.
                    None => out.line("void* __descriptor;"),
                }
                for &field in &part.instance {
                    self.emit_field_member(field, out);
                }
            }
            TypeShape::ValueType if def.layout == LayoutKind::Explicit => {
                out.line("union {");
                out.indent();
                for &field in &part.instance {
                    let fdef = &self.module.fields[field];
                    let offset = fdef.offset.unwrap_or(0);
                    let fname = self.names.field_symbol(self.module, field);
                    let cty = cnames::c_type(self.module, self.names, fdef.ty);
                    if offset == 0 {
                        cline!(out, "struct {{ {cty} {fname}; }};");
                    } else {
                        cline!(
                            out,
                            "struct {{ char __pad_{fname}[{offset}]; {cty} {fname}; }};"
                        );
                    }
                }
                if def.size > 0 {
                    cline!(out, "char __sizePadding[{}];", def.size);
                }
                out.exdent();
                out.line("};");
            }
            TypeShape::ValueType => {
                if part.instance.is_empty() {
                    // C forbids empty structs.
                    cline!(out, "char __sizePadding[{}];", def.size.max(1));
                } else {
                    for &field in &part.instance {
                        self.emit_field_member(field, out);
                    }
                }
            }
            _ => {}
        }
        out.exdent();
        out.line("};");
        Ok(())
    }

    fn emit_field_member(&self, field: cilantro_core::FieldId, out: &mut CodeBuffer) {
        let fdef = &self.module.fields[field];
        let fname = self.names.field_symbol(self.module, field);
        let cty = cnames::c_type(self.module, self.names, fdef.ty);
        cline!(out, "{cty} {fname};");
    }

    /// The four statics blocks. Shared generic types get the struct
    /// definitions (the runtime hands out the storage) but no instances.
    fn emit_statics(&self, ty: TypeId, out: &mut CodeBuffer) -> Result<()> {
        let def = &self.module.types[ty];
        if !matches!(
            def.shape,
            TypeShape::Class | TypeShape::ValueType | TypeShape::Interface
        ) {
            return Ok(());
        }
        let part = partition_fields(self.module, ty)?;
        if !part.has_statics() || !self.registry.claim_statics(ty) {
            return Ok(());
        }
        let sym = self.names.type_symbol(self.module, ty);
        for bucket in StaticBucket::ALL {
            let fields = part.statics(bucket);
            if fields.is_empty() {
                continue;
            }
            let struct_name = cnames::statics_struct_name(&sym, bucket);
            cline!(out, "struct {struct_name} {{");
            out.indent();
            for &field in fields {
                self.emit_field_member(field, out);
            }
            out.exdent();
            out.line("};");
            if !def.runtime_determined {
                let storage = match bucket {
                    StaticBucket::Plain | StaticBucket::Gc => "",
                    StaticBucket::ThreadPlain | StaticBucket::ThreadGc => "__thread ",
                };
                cline!(
                    out,
                    "{storage}struct {struct_name} {};",
                    cnames::statics_instance_name(&sym, bucket)
                );
            }
        }
        Ok(())
    }

    /// Descriptor blob and its accessor. `Necessary` types get the header
    /// only; `Constructed` ones carry the vtable because instances exist.
    fn emit_method_table(
        &self,
        ty: TypeId,
        strength: TypeStrength,
        out: &mut CodeBuffer,
    ) -> Result<()> {
        if !self.registry.claim_table(ty) {
            return Ok(());
        }
        let def = &self.module.types[ty];
        let sym = self.names.type_symbol(self.module, ty);

        let mut flags = 0u32;
        if self.module.is_value_type(ty) {
            flags |= MT_FLAG_VALUETYPE;
        }
        if def.shape == TypeShape::Interface {
            flags |= MT_FLAG_INTERFACE;
        }
        if matches!(def.shape, TypeShape::Array { .. }) {
            flags |= MT_FLAG_ARRAY;
        }
        if def.has_lazy_cctor {
            flags |= MT_FLAG_LAZY_CCTOR;
        }
        if def.is_delegate {
            flags |= MT_FLAG_DELEGATE;
        }

        let size = match &def.shape {
            TypeShape::Array { element } => self.module.byte_size(*element)?,
            _ => self.module.byte_size(ty).unwrap_or(def.size),
        };

        let mut blob = Blob::new(self.module.pointer_size);
        blob.push_u32(flags);
        blob.push_u32(size);
        match def.base {
            Some(base) if !self.module.types[base].runtime_determined => {
                let base_sym = self.names.type_symbol(self.module, base);
                blob.push_reloc(format!("(void*)&__mt_data_{base_sym}"))?;
            }
            _ => blob.push_null_ptr(),
        }
        if strength == TypeStrength::Constructed {
            for &slot_method in &def.vtable {
                let mdef = &self.module.methods[slot_method];
                if mdef.is_abstract || mdef.runtime_determined || mdef.body.is_none() {
                    blob.push_null_ptr();
                } else {
                    let msym = self.names.method_symbol(self.module, slot_method);
                    blob.push_reloc(format!("(void*)&{msym}"))?;
                }
            }
        }

        blob.render(&format!("__mt_data_{sym}"), out);
        cline!(
            out,
            "void* __getMethodTable_{sym}(void) {{ return (void*)&__mt_data_{sym}; }}"
        );
        Ok(())
    }

    /// Constant-slot accessor for a virtual method, used at every dispatch
    /// site instead of a bare integer.
    pub fn emit_slot_accessor(&self, method: cilantro_core::MethodId, out: &mut CodeBuffer) -> Result<()> {
        let mdef = &self.module.methods[method];
        let slot = mdef.vtable_slot.ok_or_else(|| {
            CompileError::Internal(format!(
                "slot accessor requested for non-virtual `{}`",
                mdef.name
            ))
        })?;
        let sym = self.names.method_symbol(self.module, method);
        cline!(
            out,
            "static inline intptr_t __getslot__{sym}(void) {{ return {slot}; }}"
        );
        Ok(())
    }

    /// Accessor reading the function pointer out of a delegate instance.
    /// Delegate layout: descriptor, target object, function pointer.
    pub fn emit_invoke_accessor(&self, ty: TypeId, out: &mut CodeBuffer) {
        let sym = self.names.type_symbol(self.module, ty);
        cline!(
            out,
            "static inline void* {}(void* d) {{ return ((void**)d)[2]; }}",
            cnames::invoke_accessor_name(&sym)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cilantro_core::entity::IdMap;
    use cilantro_core::ty::{FieldDef, LayoutKind, PrimKind, TypeDef};
    use std::collections::BTreeMap;

    fn plain_type(name: &str, shape: TypeShape) -> TypeDef {
        TypeDef {
            namespace: String::new(),
            name: name.into(),
            shape,
            base: None,
            fields: vec![],
            vtable: vec![],
            layout: LayoutKind::Sequential,
            size: 0,
            alignment: 0,
            well_known: None,
            is_delegate: false,
            has_lazy_cctor: false,
            runtime_determined: false,
            generic_def: None,
            instantiation: vec![],
        }
    }

    fn fixture() -> (Module, TypeId) {
        let mut types: IdMap<TypeId, TypeDef> = IdMap::new();
        let int32 = types.push(plain_type(
            "Int32",
            TypeShape::Primitive {
                prim: PrimKind::I32,
            },
        ));
        let mut packet = plain_type("Packet", TypeShape::ValueType);
        packet.layout = LayoutKind::Explicit;
        packet.size = 8;
        let packet = types.push(packet);
        let mut fields: IdMap<cilantro_core::FieldId, FieldDef> = IdMap::new();
        let f0 = fields.push(FieldDef {
            name: "tag".into(),
            owner: packet,
            ty: int32,
            is_static: false,
            is_thread_static: false,
            offset: Some(0),
        });
        let f1 = fields.push(FieldDef {
            name: "value".into(),
            owner: packet,
            ty: int32,
            is_static: false,
            is_thread_static: false,
            offset: Some(4),
        });
        let mut module = Module {
            name: "t".into(),
            pointer_size: 8,
            types,
            methods: IdMap::new(),
            fields,
            tokens: BTreeMap::new(),
        };
        module.types[packet].fields = vec![f0, f1];
        (module, packet)
    }

    #[test]
    fn test_explicit_layout_union() {
        let (module, packet) = fixture();
        let names = SymbolTable::new();
        let registry = DescriptorRegistry::new();
        let emitter = DescriptorEmitter::new(&module, &names, &registry);
        let mut out = CodeBuffer::new();
        emitter.emit_struct(packet, &mut out).unwrap();
        let text = out.finish();
        assert!(text.contains("union {"));
        assert!(text.contains("struct { int32_t tag; };"));
        assert!(text.contains("char __pad_value[4]; int32_t value;"));
        assert!(text.contains("char __sizePadding[8];"));
    }

    #[test]
    fn test_struct_emitted_once() {
        let (module, packet) = fixture();
        let names = SymbolTable::new();
        let registry = DescriptorRegistry::new();
        let emitter = DescriptorEmitter::new(&module, &names, &registry);
        let mut out = CodeBuffer::new();
        emitter.emit_struct(packet, &mut out).unwrap();
        let first = out.finish();
        let mut again = CodeBuffer::new();
        emitter.emit_struct(packet, &mut again).unwrap();
        assert!(!first.is_empty());
        assert!(again.is_empty());
    }

    #[test]
    fn test_blob_alignment() {
        let mut blob = Blob::new(8);
        blob.push_u32(1);
        // Offset 4 on an 8-byte target: not a legal relocation site.
        assert!(matches!(
            blob.push_reloc("(void*)&x".into()),
            Err(CompileError::Internal(_))
        ));
        blob.push_u32(2);
        assert!(blob.push_reloc("(void*)&x".into()).is_ok());
    }

    #[test]
    fn test_blob_render_splits_runs() {
        let mut blob = Blob::new(8);
        blob.push_u32(0x11);
        blob.push_u32(0x22);
        blob.push_reloc("(void*)&sym".into()).unwrap();
        let mut out = CodeBuffer::new();
        blob.render("__mt_data_X", &mut out);
        let text = out.finish();
        assert!(text.contains("uint8_t __d0[8];"));
        assert!(text.contains("void* __r1;"));
        assert!(text.contains("(void*)&sym,"));
    }
}
