//! Field partitioning and placement.
//!
//! Instance fields keep declaration order; statics land in one of four
//! storage blocks depending on thread locality and whether the garbage
//! collector must scan them.

use crate::error::{CoreError, Result};
use crate::ty::{FieldId, LayoutKind, Module, TypeId, TypeShape};

/// Storage block for a static field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaticBucket {
    Plain,
    Gc,
    ThreadPlain,
    ThreadGc,
}

impl StaticBucket {
    pub const ALL: [StaticBucket; 4] = [
        StaticBucket::Plain,
        StaticBucket::Gc,
        StaticBucket::ThreadPlain,
        StaticBucket::ThreadGc,
    ];

    fn index(self) -> usize {
        match self {
            StaticBucket::Plain => 0,
            StaticBucket::Gc => 1,
            StaticBucket::ThreadPlain => 2,
            StaticBucket::ThreadGc => 3,
        }
    }
}

/// A type's fields split into instance storage and the four static blocks.
#[derive(Debug, Default)]
pub struct FieldPartition {
    pub instance: Vec<FieldId>,
    statics: [Vec<FieldId>; 4],
}

impl FieldPartition {
    pub fn statics(&self, bucket: StaticBucket) -> &[FieldId] {
        &self.statics[bucket.index()]
    }

    pub fn has_statics(&self) -> bool {
        self.statics.iter().any(|b| !b.is_empty())
    }
}

/// Whether a static of this type must live in a GC-scanned block.
pub fn needs_gc_static(module: &Module, ty: TypeId) -> bool {
    match &module.types[ty].shape {
        TypeShape::Class | TypeShape::Interface | TypeShape::Array { .. } => true,
        TypeShape::ValueType => contains_gc_refs(module, ty),
        // Open parameters are conservatively GC-scanned.
        TypeShape::GenericParam { .. } => true,
        _ => false,
    }
}

fn contains_gc_refs(module: &Module, ty: TypeId) -> bool {
    module.types[ty].fields.iter().any(|&f| {
        let fd = &module.fields[f];
        !fd.is_static && needs_gc_static(module, fd.ty)
    })
}

pub fn static_bucket(module: &Module, field: FieldId) -> StaticBucket {
    let def = &module.fields[field];
    match (def.is_thread_static, needs_gc_static(module, def.ty)) {
        (false, false) => StaticBucket::Plain,
        (false, true) => StaticBucket::Gc,
        (true, false) => StaticBucket::ThreadPlain,
        (true, true) => StaticBucket::ThreadGc,
    }
}

/// Split a type's fields, validating explicit-layout offsets.
pub fn partition_fields(module: &Module, ty: TypeId) -> Result<FieldPartition> {
    let def = &module.types[ty];
    let mut out = FieldPartition::default();
    for &field in &def.fields {
        let fd = &module.fields[field];
        if fd.is_static {
            out.statics[static_bucket(module, field).index()].push(field);
        } else {
            if def.layout == LayoutKind::Explicit && fd.offset.is_none() {
                return Err(CoreError::MissingFieldOffset {
                    field: format!("{}.{}", module.display_name(ty), fd.name),
                });
            }
            out.instance.push(field);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::IdMap;
    use crate::ty::{FieldDef, PrimKind, TypeDef};
    use std::collections::BTreeMap;

    fn module_with_fields(layout: LayoutKind, offsets: &[Option<u32>]) -> (Module, TypeId) {
        let mut types: IdMap<TypeId, TypeDef> = IdMap::new();
        let int32 = types.push(TypeDef {
            namespace: "System".into(),
            name: "Int32".into(),
            shape: TypeShape::Primitive {
                prim: PrimKind::I32,
            },
            base: None,
            fields: vec![],
            vtable: vec![],
            layout: LayoutKind::Sequential,
            size: 4,
            alignment: 4,
            well_known: None,
            is_delegate: false,
            has_lazy_cctor: false,
            runtime_determined: false,
            generic_def: None,
            instantiation: vec![],
        });
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
            well_known: None,
            is_delegate: false,
            has_lazy_cctor: false,
            runtime_determined: false,
            generic_def: None,
            instantiation: vec![],
        });
        let holder = types.push(TypeDef {
            namespace: String::new(),
            name: "Holder".into(),
            shape: TypeShape::ValueType,
            base: None,
            fields: vec![],
            vtable: vec![],
            layout,
            size: 16,
            alignment: 8,
            well_known: None,
            is_delegate: false,
            has_lazy_cctor: false,
            runtime_determined: false,
            generic_def: None,
            instantiation: vec![],
        });
        let mut fields: IdMap<FieldId, FieldDef> = IdMap::new();
        let mut ids = vec![];
        for (i, &offset) in offsets.iter().enumerate() {
            ids.push(fields.push(FieldDef {
                name: format!("f{i}"),
                owner: holder,
                ty: if i == 0 { int32 } else { obj },
                is_static: i == 2,
                is_thread_static: false,
                offset,
            }));
        }
        let mut module = Module {
            name: "t".into(),
            pointer_size: 8,
            types,
            methods: IdMap::new(),
            fields,
            tokens: BTreeMap::new(),
        };
        module.types[holder].fields = ids;
        (module, holder)
    }

    #[test]
    fn test_explicit_layout_requires_offsets() {
        let (module, holder) = module_with_fields(LayoutKind::Explicit, &[Some(0), None]);
        assert!(matches!(
            partition_fields(&module, holder),
            Err(CoreError::MissingFieldOffset { .. })
        ));
    }

    #[test]
    fn test_static_bucketing() {
        let (module, holder) =
            module_with_fields(LayoutKind::Sequential, &[None, None, None]);
        let part = partition_fields(&module, holder).unwrap();
        assert_eq!(part.instance.len(), 2);
        // The static field has a reference type, so it is GC-scanned.
        assert_eq!(part.statics(StaticBucket::Gc).len(), 1);
        assert!(part.statics(StaticBucket::Plain).is_empty());
        assert!(part.has_statics());
    }
}
