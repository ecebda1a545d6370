//! End-to-end lowering tests over hand-assembled IL bodies.

use std::collections::BTreeMap;

use cilantro_backend_c::{emit_module, translate_method, CompileError};
use cilantro_core::entity::IdMap;
use cilantro_core::naming::SymbolTable;
use cilantro_core::ty::LayoutKind;
use cilantro_core::{
    ContextSource, FieldDef, MethodDef, MethodId, Module, PrimKind, Signature, TokenItem, TypeDef,
    TypeId, TypeShape,
};
use cilbc::{ExceptionRegion, MethodBody, RegionKind};

fn tdef(name: &str, shape: TypeShape) -> TypeDef {
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

fn prim(name: &str, p: PrimKind, size: u32) -> TypeDef {
    let mut def = tdef(name, TypeShape::Primitive { prim: p });
    def.size = size;
    def
}

fn body(il: &[u8], locals: Vec<u32>) -> MethodBody {
    MethodBody {
        il: il.to_vec(),
        locals,
        init_locals: false,
        regions: vec![],
        max_stack: 8,
    }
}

struct Fixture {
    module: Module,
    void_ty: TypeId,
    i32_ty: TypeId,
    i8_ty: TypeId,
    owner: TypeId,
}

fn fixture() -> Fixture {
    let mut types: IdMap<TypeId, TypeDef> = IdMap::new();
    let void_ty = types.push(prim("Void", PrimKind::Void, 0));
    let i32_ty = types.push(prim("Int32", PrimKind::I32, 4));
    let i8_ty = types.push(prim("SByte", PrimKind::I8, 1));
    let owner = types.push(tdef("Test", TypeShape::Class));
    let module = Module {
        name: "fixture".into(),
        pointer_size: 8,
        types,
        methods: IdMap::new(),
        fields: IdMap::new(),
        tokens: BTreeMap::new(),
    };
    Fixture {
        module,
        void_ty,
        i32_ty,
        i8_ty,
        owner,
    }
}

fn static_method(
    fx: &mut Fixture,
    name: &str,
    params: Vec<TypeId>,
    ret: TypeId,
    b: MethodBody,
) -> MethodId {
    fx.module.methods.push(MethodDef {
        name: name.into(),
        owner: fx.owner,
        signature: Signature {
            params,
            ret,
            is_instance: false,
        },
        vtable_slot: None,
        is_final: false,
        is_abstract: false,
        context: ContextSource::None,
        runtime_determined: false,
        generic_def: None,
        instantiation: vec![],
        runtime_import: None,
        body: Some(b),
    })
}

fn compile(fx: &Fixture, method: MethodId) -> Result<String, CompileError> {
    let names = SymbolTable::new();
    translate_method(&fx.module, &names, method).map(|t| t.code)
}

#[test]
fn test_merge_kind_mismatch_is_invalid_program() {
    let mut fx = fixture();
    // One arm pushes an int32, the other an int64; they join at ret.
    //  0: ldarg.0
    //  1: brtrue.s -> 6
    //  3: ldc.i4.1
    //  4: br.s -> 15
    //  6: ldc.i8 1
    // 15: ret
    let il = [
        0x02, 0x2d, 0x03, 0x17, 0x2b, 0x09, 0x21, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x2a,
    ];
    let i32_ty = fx.i32_ty;
    let m = static_method(&mut fx, "mix", vec![i32_ty], i32_ty, body(&il, vec![]));
    assert!(matches!(
        compile(&fx, m),
        Err(CompileError::InvalidProgram(_))
    ));
}

#[test]
fn test_merge_matching_arms_reuse_spill_slot() {
    let mut fx = fixture();
    // Same shape, but both arms push int32; the join reads one slot.
    let il = [
        0x02, 0x2d, 0x03, 0x17, 0x2b, 0x01, 0x18, // 6: ldc.i4.2
        0x2a,
    ];
    let i32_ty = fx.i32_ty;
    let m = static_method(&mut fx, "pick", vec![i32_ty], i32_ty, body(&il, vec![]));
    let code = compile(&fx, m).unwrap();
    assert!(code.contains("_s0 = 1;"));
    assert!(code.contains("_s0 = 2;"));
    assert!(code.contains("return _s0;"));
}

#[test]
fn test_constant_store_cast_elision() {
    let mut fx = fixture();
    // ldc.i4.5; stloc.0; ldc.i4 300; stloc.0; ret  -- local is int8
    let il = [0x1b, 0x0a, 0x20, 0x2c, 0x01, 0x00, 0x00, 0x0a, 0x2a];
    let i8_tok = 0x0100_0001;
    let i8_ty = fx.i8_ty;
    fx.module.tokens.insert(i8_tok, TokenItem::Type { id: i8_ty });
    let void_ty = fx.void_ty;
    let m = static_method(&mut fx, "stores", vec![], void_ty, body(&il, vec![i8_tok]));
    let code = compile(&fx, m).unwrap();
    assert!(code.contains("_l0 = 5;"), "{code}");
    assert!(code.contains("_l0 = (int8_t)(300);"), "{code}");
}

#[test]
fn test_two_leave_exits_mint_two_tickets() {
    let mut fx = fixture();
    //  0: ldarg.0
    //  1: brtrue.s -> 5
    //  3: leave.s -> 8
    //  5: leave.s -> 9
    //  7: endfinally
    //  8: ret
    //  9: ret
    let il = [0x02, 0x2d, 0x02, 0xde, 0x03, 0xde, 0x02, 0xdc, 0x2a, 0x2a];
    let mut b = body(&il, vec![]);
    b.regions.push(ExceptionRegion {
        kind: RegionKind::Finally,
        try_offset: 0,
        try_length: 7,
        handler_offset: 7,
        handler_length: 1,
        class_token_or_filter: 0,
    });
    let i32_ty = fx.i32_ty;
    let void_ty = fx.void_ty;
    let m = static_method(&mut fx, "leaves", vec![i32_ty], void_ty, b);
    let code = compile(&fx, m).unwrap();
    assert!(code.contains("__finallyReturn0 = 1;"), "{code}");
    assert!(code.contains("__finallyReturn0 = 2;"), "{code}");
    assert!(code.contains("goto __endFinally0;"), "{code}");
    assert!(code.contains("case 1: goto _bb8;"), "{code}");
    assert!(code.contains("case 2: goto _bb9;"), "{code}");
    assert!(code.contains("default: __unreachable();"), "{code}");
    assert!(!code.contains("case 3:"), "{code}");
}

#[test]
fn test_endfinally_outside_finally_is_invalid_program() {
    let mut fx = fixture();
    let il = [0xdc, 0x2a];
    let void_ty = fx.void_ty;
    let m = static_method(&mut fx, "loose", vec![], void_ty, body(&il, vec![]));
    assert!(matches!(
        compile(&fx, m),
        Err(CompileError::InvalidProgram(_))
    ));
}

#[test]
fn test_box_unbox_any_copies_payload() {
    let mut fx = fixture();
    let mut pair = tdef("Pair", TypeShape::ValueType);
    pair.size = 8;
    let pair_ty = fx.module.types.push(pair);
    let i32_ty = fx.i32_ty;
    let fa = fx.module.fields.push(FieldDef {
        name: "a".into(),
        owner: pair_ty,
        ty: i32_ty,
        is_static: false,
        is_thread_static: false,
        offset: None,
    });
    let fb = fx.module.fields.push(FieldDef {
        name: "b".into(),
        owner: pair_ty,
        ty: i32_ty,
        is_static: false,
        is_thread_static: false,
        offset: None,
    });
    fx.module.types[pair_ty].fields = vec![fa, fb];
    let pair_tok = 0x0200_0010;
    fx.module
        .tokens
        .insert(pair_tok, TokenItem::Type { id: pair_ty });
    // ldloc.0; box Pair; unbox.any Pair; stloc.0; ret
    let il = [
        0x06, 0x8c, 0x10, 0x00, 0x00, 0x02, 0xa5, 0x10, 0x00, 0x00, 0x02, 0x0a, 0x2a,
    ];
    let void_ty = fx.void_ty;
    let m = static_method(&mut fx, "roundtrip", vec![], void_ty, body(&il, vec![pair_tok]));
    let code = compile(&fx, m).unwrap();
    assert!(code.contains("_t0 = _l0;"), "{code}");
    assert!(code.contains("_t1 = __allocate_object(__getMethodTable_Pair());"), "{code}");
    assert!(
        code.contains("*((struct Pair*)((void**)_t1 + 1)) = _t0;"),
        "{code}"
    );
    assert!(
        code.contains("_t2 = *((struct Pair*)((void**)(_t1) + 1));"),
        "{code}"
    );
    assert!(code.contains("_l0 = _t2;"), "{code}");
}

#[test]
fn test_exact_static_field_uses_direct_symbol() {
    let mut fx = fixture();
    let holder = fx.module.types.push(tdef("E", TypeShape::Class));
    let i32_ty = fx.i32_ty;
    let f = fx.module.fields.push(FieldDef {
        name: "f".into(),
        owner: holder,
        ty: i32_ty,
        is_static: true,
        is_thread_static: false,
        offset: None,
    });
    fx.module.types[holder].fields = vec![f];
    let f_tok = 0x0400_0001;
    fx.module.tokens.insert(f_tok, TokenItem::Field { id: f });
    // ldsfld E::f; pop; ret
    let il = [0x7e, 0x01, 0x00, 0x00, 0x04, 0x26, 0x2a];
    let void_ty = fx.void_ty;
    let m = static_method(&mut fx, "reads", vec![], void_ty, body(&il, vec![]));
    let code = compile(&fx, m).unwrap();
    assert!(code.contains("E__statics.E__f"), "{code}");
    assert!(!code.contains("__get_nongc_static_base"), "{code}");
}

#[test]
fn test_shared_static_field_goes_through_lookup() {
    let mut fx = fixture();
    let mut shared = tdef("G", TypeShape::Class);
    shared.runtime_determined = true;
    let holder = fx.module.types.push(shared);
    let i32_ty = fx.i32_ty;
    let f = fx.module.fields.push(FieldDef {
        name: "g".into(),
        owner: holder,
        ty: i32_ty,
        is_static: true,
        is_thread_static: false,
        offset: None,
    });
    fx.module.types[holder].fields = vec![f];
    let f_tok = 0x0400_0002;
    fx.module.tokens.insert(f_tok, TokenItem::Field { id: f });
    let il = [0x7e, 0x02, 0x00, 0x00, 0x04, 0x26, 0x2a];
    let m = fx.module.methods.push(MethodDef {
        name: "reads_shared".into(),
        owner: holder,
        signature: Signature {
            params: vec![],
            ret: fx.void_ty,
            is_instance: false,
        },
        vtable_slot: None,
        is_final: false,
        is_abstract: false,
        context: ContextSource::HiddenTypeArg,
        runtime_determined: true,
        generic_def: None,
        instantiation: vec![],
        runtime_import: None,
        body: Some(body(&il, vec![])),
    });
    let code = compile(&fx, m).unwrap();
    assert!(
        code.contains("__get_nongc_static_base(__lookup_type_G(_hidden))"),
        "{code}"
    );
    assert!(code.contains("struct G__Statics*"), "{code}");
}

#[test]
fn test_interface_call_takes_dispatch_map() {
    let mut fx = fixture();
    let iface = fx.module.types.push(tdef("I", TypeShape::Interface));
    let callee = fx.module.methods.push(MethodDef {
        name: "M".into(),
        owner: iface,
        signature: Signature {
            params: vec![],
            ret: fx.void_ty,
            is_instance: true,
        },
        vtable_slot: Some(0),
        is_final: false,
        is_abstract: true,
        context: ContextSource::None,
        runtime_determined: false,
        generic_def: None,
        instantiation: vec![],
        runtime_import: None,
        body: None,
    });
    let m_tok = 0x0600_0001;
    fx.module
        .tokens
        .insert(m_tok, TokenItem::Method { id: callee });
    // ldarg.0; callvirt I::M; ret
    let il = [0x02, 0x6f, 0x01, 0x00, 0x00, 0x06, 0x2a];
    let void_ty = fx.void_ty;
    let m = static_method(&mut fx, "dispatch", vec![iface], void_ty, body(&il, vec![]));
    let code = compile(&fx, m).unwrap();
    assert!(
        code.contains("__resolve_interface_call(_t0, __getMethodTable_I(), __getslot__I__M())"),
        "{code}"
    );
}

#[test]
fn test_local_swap_reads_original_values() {
    let mut fx = fixture();
    // ldloc.0; ldloc.1; stloc.0; stloc.1; ret -- both loads must be
    // materialized before either store clobbers a local.
    let il = [0x06, 0x07, 0x0a, 0x0b, 0x2a];
    let i32_tok = 0x0100_0002;
    let i32_ty = fx.i32_ty;
    fx.module
        .tokens
        .insert(i32_tok, TokenItem::Type { id: i32_ty });
    let void_ty = fx.void_ty;
    let m = static_method(
        &mut fx,
        "swap",
        vec![],
        void_ty,
        body(&il, vec![i32_tok, i32_tok]),
    );
    let code = compile(&fx, m).unwrap();
    assert!(code.contains("_t0 = _l0;"), "{code}");
    assert!(code.contains("_t1 = _l1;"), "{code}");
    assert!(code.contains("_l0 = _t1;"), "{code}");
    assert!(code.contains("_l1 = _t0;"), "{code}");
    assert!(!code.contains("_l1 = _l0;"), "{code}");
}

#[test]
fn test_byref_add_is_byte_arithmetic() {
    let mut fx = fixture();
    let i32_ty = fx.i32_ty;
    let byref_i32 = fx.module.types.push(TypeDef {
        size: 8,
        ..tdef("Int32Ref", TypeShape::ByRef { pointee: i32_ty })
    });
    // ldarg.0; ldarg.1; add; ldc.i4.7; stind.i4; ret -- the add must move
    // by _a1 bytes, not _a1 elements.
    let il = [0x02, 0x03, 0x58, 0x1d, 0x54, 0x2a];
    let void_ty = fx.void_ty;
    let m = static_method(
        &mut fx,
        "poke",
        vec![byref_i32, i32_ty],
        void_ty,
        body(&il, vec![]),
    );
    let code = compile(&fx, m).unwrap();
    assert!(code.contains("((intptr_t)(_t0)) + (_t1)"), "{code}");
    assert!(code.contains("((int32_t*)("), "{code}");
    assert!(code.contains("= 7;"), "{code}");
    assert!(!code.contains("((_t0) + (_t1))"), "{code}");
}

#[test]
fn test_gvm_thin_pointer_carries_no_hidden_parameter() {
    let mut fx = fixture();
    let holder = fx.module.types.push(tdef("C", TypeShape::Class));
    let i32_ty = fx.i32_ty;
    let callee = fx.module.methods.push(MethodDef {
        name: "M".into(),
        owner: holder,
        signature: Signature {
            params: vec![],
            ret: fx.void_ty,
            is_instance: true,
        },
        vtable_slot: Some(0),
        is_final: false,
        is_abstract: false,
        context: ContextSource::HiddenMethodDict,
        runtime_determined: false,
        generic_def: None,
        instantiation: vec![i32_ty],
        runtime_import: None,
        body: None,
    });
    let m_tok = 0x0600_0002;
    fx.module
        .tokens
        .insert(m_tok, TokenItem::Method { id: callee });
    // ldarg.0; callvirt C::M<int32>; ret
    let il = [0x02, 0x6f, 0x02, 0x00, 0x00, 0x06, 0x2a];
    let void_ty = fx.void_ty;
    let m = static_method(&mut fx, "call_gvm", vec![holder], void_ty, body(&il, vec![]));
    let code = compile(&fx, m).unwrap();
    assert!(code.contains("__gvm_lookup_C__M(_t0);"), "{code}");
    assert!(code.contains("((void (*)(void*))(_t1))(_t0);"), "{code}");
    assert!(code.contains("(void (*)(void*, void*))"), "{code}");
    assert!(!code.contains("((void (*)(void*, void*))(_t1))"), "{code}");
}

#[test]
fn test_emit_module_is_deterministic() {
    let mut fx = fixture();
    let il = [0x1b, 0x2a]; // ldc.i4.5; ret
    let i32_ty = fx.i32_ty;
    static_method(&mut fx, "five", vec![], i32_ty, body(&il, vec![]));
    let first = emit_module(&fx.module).unwrap();
    let second = emit_module(&fx.module).unwrap();
    assert_eq!(first.source, second.source);
    assert!(first.diagnostics.is_empty());
}

#[test]
fn test_failed_method_is_stubbed_and_batch_continues() {
    let mut fx = fixture();
    let void_ty = fx.void_ty;
    let i32_ty = fx.i32_ty;
    // 0x24 is not an opcode.
    static_method(&mut fx, "broken", vec![], void_ty, body(&[0x24], vec![]));
    static_method(&mut fx, "fine", vec![], i32_ty, body(&[0x1b, 0x2a], vec![]));
    let compiled = emit_module(&fx.module).unwrap();
    assert_eq!(compiled.diagnostics.len(), 1);
    assert_eq!(compiled.diagnostics[0].name, "broken");
    assert!(matches!(
        compiled.diagnostics[0].error,
        CompileError::InvalidProgram(_)
    ));
    assert!(compiled.source.contains("__throw_invalid_program();"));
    assert!(compiled.source.contains("return 5;"));
}
