//! Per-method lowering: abstract interpretation of the operand stack over
//! the basic blocks, emitting C statements as it goes.
//!
//! Blocks are processed worklist-style. The first edge into a block fixes
//! its entry stack by minting spill slots; every later edge must present
//! the same shape or the program is malformed. Protected regions lower to
//! labels, with `leave` threading through enclosing finally handlers via
//! numbered tickets dispatched by a switch at each handler's end.

use std::collections::BTreeMap;

use cilbc::{BinOp, CmpCond, ConvTarget, Instr, InstrReader, MemKind, MethodBody, RegionKind};
use cilantro_core::layout::static_bucket;
use cilantro_core::naming::SymbolTable;
use cilantro_core::{
    ContextSource, DependencySet, MethodId, Module, PrimKind, TypeId, TypeShape, TypeStrength,
    WellKnown,
};

use crate::buffer::CodeBuffer;
use crate::cfg::Cfg;
use crate::cnames;
use crate::error::{CompileError, Result};
use crate::generics::{self, FatPointer};
use crate::stack::{const_fits, kind_of_type, StackEntry, StackValueKind};

/// A slot carrying one stack position across a block boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct SpillSlot {
    pub name: String,
    pub kind: StackValueKind,
    pub ty: Option<TypeId>,
}

#[derive(Debug, Default)]
struct BlockState {
    entry: Option<Vec<SpillSlot>>,
    prologue: Option<String>,
    code: Option<Vec<String>>,
    queued: bool,
}

#[derive(Debug)]
struct FinallyState {
    region: usize,
    /// Leave destinations in ticket order; ticket n goes to `exits[n - 1]`.
    exits: Vec<u32>,
}

/// One argument slot of the method being compiled.
#[derive(Debug, Clone, Copy)]
struct ArgInfo {
    kind: StackValueKind,
    ty: Option<TypeId>,
    prim: Option<PrimKind>,
}

pub struct TranslatedMethod {
    pub code: String,
    pub deps: DependencySet,
}

pub fn translate_method(
    module: &Module,
    names: &SymbolTable,
    method: MethodId,
) -> Result<TranslatedMethod> {
    let mdef = &module.methods[method];
    let body = mdef.body.as_ref().ok_or_else(|| {
        CompileError::Internal(format!("method `{}` has no body", mdef.name))
    })?;
    let cfg = Cfg::build(body)?;
    let mut tr = Translator::new(module, names, method, body, cfg)?;
    tr.run()?;
    Ok(TranslatedMethod {
        code: tr.assemble(),
        deps: tr.deps,
    })
}

struct Translator<'a> {
    module: &'a Module,
    names: &'a SymbolTable,
    method: MethodId,
    body: &'a MethodBody,
    cfg: Cfg,
    deps: DependencySet,

    args: Vec<ArgInfo>,
    locals: Vec<TypeId>,

    states: BTreeMap<u32, BlockState>,
    pending: Vec<u32>,
    finallys: Vec<FinallyState>,

    stack: Vec<StackEntry>,
    cur: Vec<String>,
    current_offset: u32,
    terminated: bool,

    decls: Vec<String>,
    temp_count: u32,
    spill_count: u32,

    constrained: Option<TypeId>,
}

impl<'a> Translator<'a> {
    fn new(
        module: &'a Module,
        names: &'a SymbolTable,
        method: MethodId,
        body: &'a MethodBody,
        cfg: Cfg,
    ) -> Result<Self> {
        let mdef = &module.methods[method];
        let mut args = Vec::new();
        if mdef.signature.is_instance {
            if module.is_value_type(mdef.owner) {
                args.push(ArgInfo {
                    kind: StackValueKind::ByRef,
                    ty: Some(mdef.owner),
                    prim: None,
                });
            } else {
                args.push(ArgInfo {
                    kind: StackValueKind::ObjRef,
                    ty: Some(mdef.owner),
                    prim: None,
                });
            }
        }
        for &p in &mdef.signature.params {
            let (kind, ty) = kind_of_type(module, p);
            args.push(ArgInfo {
                kind,
                ty,
                prim: prim_of(module, p),
            });
        }
        let mut locals = Vec::with_capacity(body.locals.len());
        for &token in &body.locals {
            locals.push(module.type_token(token)?);
        }
        let mut states = BTreeMap::new();
        for start in cfg.starts() {
            states.insert(start, BlockState::default());
        }
        Ok(Self {
            module,
            names,
            method,
            body,
            cfg,
            deps: DependencySet::new(),
            args,
            locals,
            states,
            pending: Vec::new(),
            finallys: Vec::new(),
            stack: Vec::new(),
            cur: Vec::new(),
            current_offset: 0,
            terminated: false,
            decls: Vec::new(),
            temp_count: 0,
            spill_count: 0,
            constrained: None,
        })
    }

    fn run(&mut self) -> Result<()> {
        self.prepare_regions()?;
        // Method entry: empty stack.
        {
            let state = self.states.get_mut(&0).ok_or_else(|| {
                CompileError::Internal("no entry block".into())
            })?;
            state.entry = Some(Vec::new());
            state.queued = true;
        }
        self.pending.push(0);
        while let Some(start) = self.pending.pop() {
            self.process_block(start)?;
        }
        Ok(())
    }

    fn prepare_regions(&mut self) -> Result<()> {
        for (ri, region) in self.body.regions.iter().enumerate() {
            if !self.cfg.contains_start(region.handler_offset) {
                return Err(CompileError::InvalidProgram(format!(
                    "handler offset {:#x} is not a block start",
                    region.handler_offset
                )));
            }
            match region.kind {
                RegionKind::Filter => {
                    return Err(CompileError::Unsupported("filter regions".into()));
                }
                RegionKind::Finally | RegionKind::Fault => {
                    self.finallys.push(FinallyState {
                        region: ri,
                        exits: Vec::new(),
                    });
                    self.queue_with_entry(region.handler_offset, Vec::new(), None)?;
                }
                RegionKind::Typed => {
                    let catch_ty = self.module.type_token(region.class_token_or_filter)?;
                    self.deps.record_type(catch_ty, TypeStrength::Necessary);
                    let slot = self.new_spill(StackValueKind::ObjRef, Some(catch_ty));
                    let prologue = format!("{} = __current_exception();", slot.name);
                    self.queue_with_entry(region.handler_offset, vec![slot], Some(prologue))?;
                }
            }
        }
        Ok(())
    }

    fn queue_with_entry(
        &mut self,
        start: u32,
        entry: Vec<SpillSlot>,
        prologue: Option<String>,
    ) -> Result<()> {
        let state = self
            .states
            .get_mut(&start)
            .ok_or_else(|| CompileError::Internal(format!("unknown block {start:#x}")))?;
        if state.entry.is_some() {
            return Err(CompileError::InvalidProgram(format!(
                "block {start:#x} is both a handler entry and a branch target"
            )));
        }
        state.entry = Some(entry);
        state.prologue = prologue;
        if !state.queued {
            state.queued = true;
            self.pending.push(start);
        }
        Ok(())
    }

    // ---- emission plumbing ----

    fn stmt(&mut self, s: impl Into<String>) {
        self.cur.push(s.into());
    }

    fn new_temp(&mut self, cty: &str) -> String {
        let name = format!("_t{}", self.temp_count);
        self.temp_count += 1;
        self.decls.push(format!("{cty} {name};"));
        name
    }

    fn new_spill(&mut self, kind: StackValueKind, ty: Option<TypeId>) -> SpillSlot {
        let name = format!("_s{}", self.spill_count);
        self.spill_count += 1;
        let cty = cnames::kind_c_type(self.module, self.names, kind, ty);
        self.decls.push(format!("{cty} {name};"));
        SpillSlot { name, kind, ty }
    }

    fn push(&mut self, e: StackEntry) {
        self.stack.push(e);
    }

    fn pop(&mut self) -> Result<StackEntry> {
        self.stack.pop().ok_or_else(|| {
            CompileError::InvalidProgram(format!(
                "stack underflow at offset {:#x}",
                self.current_offset
            ))
        })
    }

    /// Materialize an entry into a temp when duplicating or re-reading its
    /// text could re-evaluate side effects.
    fn ensure_simple(&mut self, e: StackEntry) -> StackEntry {
        match &e {
            StackEntry::Expression { kind, ty, text }
                if !text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
            {
                let cty = cnames::kind_c_type(self.module, self.names, *kind, *ty);
                let t = self.new_temp(&cty);
                self.stmt(format!("{t} = {text};"));
                StackEntry::Expression {
                    kind: *kind,
                    ty: *ty,
                    text: t,
                }
            }
            _ => e,
        }
    }

    /// Reads of mutable storage (arguments, locals, fields, memory) are
    /// materialized into a temp at push time. A later store to the same
    /// location must not change a value already on the stack.
    fn push_load(&mut self, kind: StackValueKind, ty: Option<TypeId>, lvalue: String) {
        let cty = cnames::kind_c_type(self.module, self.names, kind, ty);
        let t = self.new_temp(&cty);
        self.stmt(format!("{t} = {lvalue};"));
        self.push(StackEntry::Expression { kind, ty, text: t });
    }

    // ---- block boundaries ----

    /// Flow the current stack into `target`, fixing or checking its entry
    /// shape. Returns the spill assignments the edge must perform; the
    /// caller decides where they go (straight-line code, an `if` body, or
    /// a `switch` case).
    fn merge_shape(&mut self, target: u32) -> Result<Vec<String>> {
        if !self.cfg.contains_start(target) {
            return Err(CompileError::InvalidProgram(format!(
                "branch to {target:#x} which is not a block start"
            )));
        }
        let values = self.stack.clone();
        if self.states[&target].entry.is_none() {
            let mut slots = Vec::with_capacity(values.len());
            for v in &values {
                slots.push(self.new_spill(v.kind(), v.ty()));
            }
            self.state_mut(target)?.entry = Some(slots);
        } else {
            let slots = self.states[&target].entry.as_deref().unwrap_or_default();
            if slots.len() != values.len() {
                return Err(CompileError::InvalidProgram(format!(
                    "stack depth mismatch entering block {target:#x}: {} vs {}",
                    slots.len(),
                    values.len()
                )));
            }
            for (slot, v) in slots.iter().zip(&values) {
                if slot.kind != v.kind()
                    || (slot.kind == StackValueKind::ValueType && slot.ty != v.ty())
                {
                    return Err(CompileError::InvalidProgram(format!(
                        "stack shape mismatch entering block {target:#x}"
                    )));
                }
            }
        }
        let assignments = self.states[&target]
            .entry
            .as_deref()
            .unwrap_or_default()
            .iter()
            .zip(&values)
            .filter(|(slot, v)| v.render() != slot.name)
            .map(|(slot, v)| format!("{} = {};", slot.name, v.render()))
            .collect();
        let state = self.state_mut(target)?;
        if !state.queued {
            state.queued = true;
            self.pending.push(target);
        }
        Ok(assignments)
    }

    fn merge_into(&mut self, target: u32) -> Result<()> {
        for a in self.merge_shape(target)? {
            self.stmt(a);
        }
        Ok(())
    }

    fn state_mut(&mut self, start: u32) -> Result<&mut BlockState> {
        self.states
            .get_mut(&start)
            .ok_or_else(|| CompileError::Internal(format!("unknown block {start:#x}")))
    }

    fn process_block(&mut self, start: u32) -> Result<()> {
        let block = self.cfg.at(start)?;
        let (entry, prologue) = {
            let state = &self.states[&start];
            (
                state.entry.clone().ok_or_else(|| {
                    CompileError::Internal(format!("block {start:#x} queued without entry"))
                })?,
                state.prologue.clone(),
            )
        };
        self.stack = entry
            .iter()
            .map(|s| StackEntry::Expression {
                kind: s.kind,
                ty: s.ty,
                text: s.name.clone(),
            })
            .collect();
        self.cur = Vec::new();
        self.terminated = false;
        self.constrained = None;
        if let Some(p) = prologue {
            self.stmt(p);
        }

        let mut reader = InstrReader::new(&self.body.il);
        reader.seek(start);
        while reader.offset() < block.end && !self.terminated {
            self.current_offset = reader.offset();
            let instr = reader.read()?;
            self.lower(instr)?;
        }
        if !self.terminated {
            if block.end >= self.cfg.il_len() {
                return Err(CompileError::InvalidProgram(
                    "control flows off the end of the method".into(),
                ));
            }
            self.merge_into(block.end)?;
        }
        let code = std::mem::take(&mut self.cur);
        self.state_mut(start)?.code = Some(code);
        Ok(())
    }

    // ---- instruction lowering ----

    fn lower(&mut self, instr: Instr) -> Result<()> {
        let is_prefix = matches!(
            instr,
            Instr::Constrained(_)
                | Instr::Volatile
                | Instr::Unaligned(_)
                | Instr::Readonly
        );
        match instr {
            Instr::Nop | Instr::Break => {}
            Instr::Volatile | Instr::Readonly | Instr::Unaligned(_) => {
                // Memory-order and aliasing hints carry no lowering.
            }
            Instr::Constrained(token) => {
                self.constrained = Some(self.module.type_token(token)?);
            }
            Instr::Tail => {
                return Err(CompileError::Unsupported("tail. prefix".into()));
            }
            Instr::NoCheck(_) => {
                return Err(CompileError::Unsupported("no. prefix".into()));
            }

            Instr::LoadArg(i) => {
                let arg = self.arg(i)?;
                self.push_load(arg.kind, arg.ty, format!("_a{i}"));
            }
            Instr::LoadArgAddr(i) => {
                let arg = self.arg(i)?;
                self.push(StackEntry::Expression {
                    kind: StackValueKind::ByRef,
                    ty: arg.ty,
                    text: format!("(&_a{i})"),
                });
            }
            Instr::StoreArg(i) => {
                let arg = self.arg(i)?;
                let v = self.pop()?;
                let text = self.coerced(&v, arg.prim);
                self.stmt(format!("_a{i} = {text};"));
            }
            Instr::LoadLocal(i) => {
                let ty = self.local(i)?;
                let (kind, kty) = kind_of_type(self.module, ty);
                self.push_load(kind, kty, format!("_l{i}"));
            }
            Instr::LoadLocalAddr(i) => {
                let ty = self.local(i)?;
                self.push(StackEntry::Expression {
                    kind: StackValueKind::ByRef,
                    ty: Some(ty),
                    text: format!("(&_l{i})"),
                });
            }
            Instr::StoreLocal(i) => {
                let ty = self.local(i)?;
                let v = self.pop()?;
                let text = self.coerced(&v, prim_of(self.module, ty));
                self.stmt(format!("_l{i} = {text};"));
            }

            Instr::LoadNull => self.push(StackEntry::NullReference),
            Instr::LoadI4(v) => self.push(StackEntry::Int32Constant(v)),
            Instr::LoadI8(v) => self.push(StackEntry::Int64Constant(v)),
            Instr::LoadR4(v) => self.push(StackEntry::FloatConstant(v as f64)),
            Instr::LoadR8(v) => self.push(StackEntry::FloatConstant(v)),

            Instr::Dup => {
                let v = self.pop()?;
                let v = self.ensure_simple(v);
                self.push(v.clone());
                self.push(v);
            }
            Instr::Pop => {
                self.pop()?;
            }

            Instr::Ret => self.lower_ret()?,
            Instr::Jmp(_) => {
                return Err(CompileError::Unsupported("jmp".into()));
            }

            Instr::Branch(target) => {
                self.merge_into(target)?;
                self.stmt(format!("goto _bb{target};"));
                self.terminated = true;
            }
            Instr::BranchTrue(target) => {
                let v = self.pop()?;
                self.cond_branch(format!("({})", v.render()), target)?;
            }
            Instr::BranchFalse(target) => {
                let v = self.pop()?;
                self.cond_branch(format!("(!({}))", v.render()), target)?;
            }
            Instr::BranchCmp {
                cond,
                unsigned,
                target,
            } => {
                let b = self.pop()?;
                let a = self.pop()?;
                let c = self.comparison(&a, &b, cond, unsigned)?;
                self.cond_branch(c, target)?;
            }
            Instr::Switch(targets) => {
                let v = self.pop()?;
                let v = self.ensure_simple(v);
                self.stmt(format!("switch ({}) {{", v.render()));
                for (i, t) in targets.iter().enumerate() {
                    let assigns = self.merge_shape(*t)?;
                    if assigns.is_empty() {
                        self.stmt(format!("case {i}: goto _bb{t};"));
                    } else {
                        self.stmt(format!("case {i}: {{"));
                        for a in assigns {
                            self.stmt(a);
                        }
                        self.stmt(format!("goto _bb{t};"));
                        self.stmt("}".to_string());
                    }
                }
                self.stmt("}".to_string());
                // Falls through on out-of-range values.
            }
            Instr::Compare { cond, unsigned } => {
                let b = self.pop()?;
                let a = self.pop()?;
                let c = self.comparison(&a, &b, cond, unsigned)?;
                self.push(StackEntry::expr(StackValueKind::Int32, c));
            }

            Instr::LoadIndirect(mk) => {
                let addr = self.pop()?;
                let (kind, cty) = mem_kind_info(mk);
                self.push_load(kind, None, format!("(*({cty}*)({}))", addr.render()));
            }
            Instr::StoreIndirect(mk) => {
                let v = self.pop()?;
                let addr = self.pop()?;
                let (_, cty) = mem_kind_info(mk);
                let text = self.coerced(&v, mem_kind_prim(mk));
                self.stmt(format!("*({cty}*)({}) = {text};", addr.render()));
            }

            Instr::Binary {
                op,
                overflow: _,
                unsigned,
            } => self.lower_binary(op, unsigned)?,
            Instr::Neg => {
                let v = self.pop()?;
                if !v.kind().is_numeric() {
                    return Err(self.bad_operand("neg"));
                }
                self.push(StackEntry::expr(v.kind(), format!("(-({}))", v.render())));
            }
            Instr::Not => {
                let v = self.pop()?;
                if !v.kind().is_numeric() {
                    return Err(self.bad_operand("not"));
                }
                self.push(StackEntry::expr(v.kind(), format!("(~({}))", v.render())));
            }
            Instr::Convert {
                to,
                overflow: _,
                unsigned,
            } => self.lower_convert(to, unsigned)?,

            Instr::LoadString(token) => {
                let value = match self.module.resolve_token(token)? {
                    cilantro_core::TokenItem::String { value } => value.clone(),
                    _ => {
                        return Err(CompileError::InvalidProgram(format!(
                            "ldstr token {token:#x} is not a string"
                        )))
                    }
                };
                let t = self.new_temp("void*");
                self.stmt(format!(
                    "{t} = __literal_string(\"{}\");",
                    cnames::escape_c_string(&value)
                ));
                self.push(StackEntry::expr(StackValueKind::ObjRef, t));
            }

            Instr::NewObj(token) => self.lower_newobj(token)?,
            Instr::Call(token) => {
                let callee = self.module.method_token(token)?;
                self.lower_call(callee, false)?;
            }
            Instr::CallVirt(token) => {
                let callee = self.module.method_token(token)?;
                self.lower_call(callee, true)?;
            }
            Instr::CallIndirect(token) => self.lower_calli(token)?,

            Instr::CastClass(token) => {
                let ty = self.module.type_token(token)?;
                let mt = self.type_descriptor(ty, TypeStrength::Necessary)?;
                let obj = self.pop()?;
                let t = self.new_temp("void*");
                self.stmt(format!("{t} = __castclass({mt}, {});", obj.render()));
                self.push(StackEntry::typed_expr(StackValueKind::ObjRef, ty, t));
            }
            Instr::IsInst(token) => {
                let ty = self.module.type_token(token)?;
                let mt = self.type_descriptor(ty, TypeStrength::Necessary)?;
                let obj = self.pop()?;
                let t = self.new_temp("void*");
                self.stmt(format!("{t} = __isinst({mt}, {});", obj.render()));
                self.push(StackEntry::typed_expr(StackValueKind::ObjRef, ty, t));
            }

            Instr::Box(token) => self.lower_box(token)?,
            Instr::Unbox(token) => {
                let ty = self.module.type_token(token)?;
                let obj = self.pop()?;
                let cty = cnames::c_type(self.module, self.names, ty);
                self.push(StackEntry::Expression {
                    kind: StackValueKind::ByRef,
                    ty: Some(ty),
                    text: format!("(({cty}*)((void**)({}) + 1))", obj.render()),
                });
            }
            Instr::UnboxAny(token) => {
                let ty = self.module.type_token(token)?;
                if self.module.is_value_type(ty) {
                    let obj = self.pop()?;
                    let cty = cnames::c_type(self.module, self.names, ty);
                    let t = self.new_temp(&cty);
                    self.stmt(format!(
                        "{t} = *(({cty}*)((void**)({}) + 1));",
                        obj.render()
                    ));
                    let (kind, _) = kind_of_type(self.module, ty);
                    self.push(StackEntry::Expression {
                        kind,
                        ty: Some(ty),
                        text: t,
                    });
                } else {
                    let mt = self.type_descriptor(ty, TypeStrength::Necessary)?;
                    let obj = self.pop()?;
                    let t = self.new_temp("void*");
                    self.stmt(format!("{t} = __castclass({mt}, {});", obj.render()));
                    self.push(StackEntry::typed_expr(StackValueKind::ObjRef, ty, t));
                }
            }

            Instr::Throw => {
                let obj = self.pop()?;
                self.stmt(format!("__throw({});", obj.render()));
                self.terminated = true;
            }
            Instr::Rethrow => {
                return Err(CompileError::Unsupported("rethrow".into()));
            }

            Instr::LoadField(token) => {
                let field = self.module.field_token(token)?;
                let obj = self.pop()?;
                let lvalue = self.instance_field_lvalue(field, &obj)?;
                let fty = self.module.fields[field].ty;
                let (kind, ty) = kind_of_type(self.module, fty);
                self.push_load(kind, ty, lvalue);
            }
            Instr::LoadFieldAddr(token) => {
                let field = self.module.field_token(token)?;
                let obj = self.pop()?;
                let lvalue = self.instance_field_lvalue(field, &obj)?;
                let fty = self.module.fields[field].ty;
                self.push(StackEntry::Expression {
                    kind: StackValueKind::ByRef,
                    ty: Some(fty),
                    text: format!("(&{lvalue})"),
                });
            }
            Instr::StoreField(token) => {
                let field = self.module.field_token(token)?;
                let v = self.pop()?;
                let obj = self.pop()?;
                let lvalue = self.instance_field_lvalue(field, &obj)?;
                let text = self.coerced(&v, prim_of(self.module, self.module.fields[field].ty));
                self.stmt(format!("{lvalue} = {text};"));
            }
            Instr::LoadStaticField(token) => {
                let field = self.module.field_token(token)?;
                let lvalue = self.static_field_lvalue(field)?;
                let fty = self.module.fields[field].ty;
                let (kind, ty) = kind_of_type(self.module, fty);
                self.push_load(kind, ty, lvalue);
            }
            Instr::LoadStaticFieldAddr(token) => {
                let field = self.module.field_token(token)?;
                let lvalue = self.static_field_lvalue(field)?;
                let fty = self.module.fields[field].ty;
                self.push(StackEntry::Expression {
                    kind: StackValueKind::ByRef,
                    ty: Some(fty),
                    text: format!("(&{lvalue})"),
                });
            }
            Instr::StoreStaticField(token) => {
                let field = self.module.field_token(token)?;
                let v = self.pop()?;
                let lvalue = self.static_field_lvalue(field)?;
                let text = self.coerced(&v, prim_of(self.module, self.module.fields[field].ty));
                self.stmt(format!("{lvalue} = {text};"));
            }

            Instr::LoadObj(token) => {
                let ty = self.module.type_token(token)?;
                let addr = self.pop()?;
                let cty = cnames::c_type(self.module, self.names, ty);
                let (kind, kty) = kind_of_type(self.module, ty);
                self.push_load(kind, kty, format!("(*({cty}*)({}))", addr.render()));
            }
            Instr::StoreObj(token) => {
                let ty = self.module.type_token(token)?;
                let v = self.pop()?;
                let addr = self.pop()?;
                let cty = cnames::c_type(self.module, self.names, ty);
                self.stmt(format!(
                    "*({cty}*)({}) = {};",
                    addr.render(),
                    v.render()
                ));
            }
            Instr::InitObj(token) => {
                let ty = self.module.type_token(token)?;
                let addr = self.pop()?;
                let cty = cnames::c_type(self.module, self.names, ty);
                self.stmt(format!(
                    "memset((void*)({}), 0, sizeof({cty}));",
                    addr.render()
                ));
            }
            Instr::CopyObj(_) => {
                return Err(CompileError::Unsupported("cpobj".into()));
            }

            Instr::NewArray(token) => {
                let elem = self.module.type_token(token)?;
                let mt = self.type_descriptor(elem, TypeStrength::Constructed)?;
                let n = self.pop()?;
                let t = self.new_temp("void*");
                self.stmt(format!("{t} = __allocate_array({mt}, (intptr_t)({}));", n.render()));
                self.push(StackEntry::expr(StackValueKind::ObjRef, t));
            }
            Instr::LoadLength => {
                let arr = self.pop()?;
                let ps = self.module.pointer_size;
                self.push_load(
                    StackValueKind::NativeInt,
                    None,
                    format!("(*(intptr_t*)((char*)({}) + {ps}))", arr.render()),
                );
            }
            Instr::LoadElemAddr(token) => {
                let ty = self.module.type_token(token)?;
                let addr = self.element_address(ty)?;
                self.push(StackEntry::Expression {
                    kind: StackValueKind::ByRef,
                    ty: Some(ty),
                    text: addr,
                });
            }
            Instr::LoadElem(mk) => {
                let (kind, cty) = mem_kind_info(mk);
                let addr = self.element_address_sized(mem_kind_size(mk, self.module.pointer_size), &cty)?;
                self.push_load(kind, None, format!("(*{addr})"));
            }
            Instr::LoadElemTyped(token) => {
                let ty = self.module.type_token(token)?;
                let addr = self.element_address(ty)?;
                let (kind, kty) = kind_of_type(self.module, ty);
                self.push_load(kind, kty, format!("(*{addr})"));
            }
            Instr::StoreElem(mk) => {
                let (_, cty) = mem_kind_info(mk);
                let v = self.pop()?;
                let addr = self.element_address_sized(mem_kind_size(mk, self.module.pointer_size), &cty)?;
                let text = self.coerced(&v, mem_kind_prim(mk));
                self.stmt(format!("*{addr} = {text};"));
            }
            Instr::StoreElemTyped(token) => {
                let ty = self.module.type_token(token)?;
                let v = self.pop()?;
                let addr = self.element_address(ty)?;
                let text = self.coerced(&v, prim_of(self.module, ty));
                self.stmt(format!("*{addr} = {text};"));
            }

            Instr::LoadToken(token) => match self.module.resolve_token(token)? {
                cilantro_core::TokenItem::Type { id } => {
                    let ty = *id;
                    let text = self.type_descriptor(ty, TypeStrength::Necessary)?;
                    self.push(StackEntry::TypeToken { ty, text });
                }
                _ => {
                    return Err(CompileError::Unsupported(
                        "ldtoken on a field or method".into(),
                    ));
                }
            },
            Instr::Sizeof(token) => {
                let ty = self.module.type_token(token)?;
                if self.module.types[ty].runtime_determined {
                    return Err(CompileError::Unsupported(
                        "sizeof on a runtime-determined type".into(),
                    ));
                }
                let cty = cnames::c_type(self.module, self.names, ty);
                self.push(StackEntry::expr(
                    StackValueKind::Int32,
                    format!("((int32_t)sizeof({cty}))"),
                ));
            }

            Instr::LoadFtn(token) => {
                let callee = self.module.method_token(token)?;
                self.deps.record_method(callee);
                let sym = self.names.method_symbol(self.module, callee);
                let text = if self.module.methods[callee].has_hidden_arg() {
                    FatPointer::tagged_symbol_expr(&sym)
                } else {
                    format!("((void*)&{sym})")
                };
                self.push(StackEntry::MethodPointer {
                    method: callee,
                    is_virtual: false,
                    text,
                });
            }
            Instr::LoadVirtFtn(token) => self.lower_ldvirtftn(token)?,

            Instr::Leave(target) => self.lower_leave(target)?,
            Instr::EndFinally => self.lower_endfinally()?,
            Instr::EndFilter => {
                return Err(CompileError::Unsupported("endfilter".into()));
            }

            Instr::LocAlloc => {
                let n = self.pop()?;
                let t = self.new_temp("intptr_t");
                self.stmt(format!("{t} = (intptr_t)alloca((size_t)({}));", n.render()));
                self.push(StackEntry::expr(StackValueKind::NativeInt, t));
            }
            Instr::InitBlk => {
                let size = self.pop()?;
                let value = self.pop()?;
                let addr = self.pop()?;
                self.stmt(format!(
                    "memset((void*)({}), (int)({}), (size_t)({}));",
                    addr.render(),
                    value.render(),
                    size.render()
                ));
            }
            Instr::CpBlk => {
                let size = self.pop()?;
                let src = self.pop()?;
                let dst = self.pop()?;
                self.stmt(format!(
                    "memcpy((void*)({}), (void*)({}), (size_t)({}));",
                    dst.render(),
                    src.render(),
                    size.render()
                ));
            }

            Instr::CkFinite => return Err(CompileError::Unsupported("ckfinite".into())),
            Instr::ArgList => return Err(CompileError::Unsupported("arglist".into())),
            Instr::MkRefAny(_) => return Err(CompileError::Unsupported("mkrefany".into())),
            Instr::RefAnyVal(_) => return Err(CompileError::Unsupported("refanyval".into())),
            Instr::RefAnyType => return Err(CompileError::Unsupported("refanytype".into())),
        }
        if !is_prefix {
            self.constrained = None;
        }
        Ok(())
    }

    // ---- helpers for individual instruction families ----

    fn arg(&self, i: u16) -> Result<ArgInfo> {
        self.args.get(i as usize).copied().ok_or_else(|| {
            CompileError::InvalidProgram(format!("argument index {i} out of range"))
        })
    }

    fn local(&self, i: u16) -> Result<TypeId> {
        self.locals.get(i as usize).copied().ok_or_else(|| {
            CompileError::InvalidProgram(format!("local index {i} out of range"))
        })
    }

    fn bad_operand(&self, op: &str) -> CompileError {
        CompileError::InvalidProgram(format!(
            "invalid operand kind for `{op}` at offset {:#x}",
            self.current_offset
        ))
    }

    /// Cast a value for a store, eliding the cast when a constant already
    /// fits the destination.
    fn coerced(&self, v: &StackEntry, dest: Option<PrimKind>) -> String {
        let Some(prim) = dest else {
            return v.render();
        };
        match v {
            StackEntry::Int32Constant(c) if const_fits(*c as i64, prim) => v.render(),
            StackEntry::Int64Constant(c) if const_fits(*c, prim) => v.render(),
            StackEntry::Int32Constant(_) | StackEntry::Int64Constant(_) => {
                format!("({})({})", cnames::prim_c_type(prim), v.render())
            }
            _ => {
                if needs_store_cast(prim) {
                    format!("({})({})", cnames::prim_c_type(prim), v.render())
                } else {
                    v.render()
                }
            }
        }
    }

    fn type_descriptor(&mut self, ty: TypeId, strength: TypeStrength) -> Result<String> {
        generics::type_descriptor_expr(self.module, self.names, &mut self.deps, self.method, ty, strength)
    }

    fn cond_branch(&mut self, cond: String, target: u32) -> Result<()> {
        self.stmt(format!("if {cond} {{"));
        self.merge_into(target)?;
        self.stmt(format!("goto _bb{target};"));
        self.stmt("}".to_string());
        Ok(())
    }

    fn comparison(
        &mut self,
        a: &StackEntry,
        b: &StackEntry,
        cond: CmpCond,
        unsigned: bool,
    ) -> Result<String> {
        let ka = a.kind();
        let kb = b.kind();
        let kind = ka.max(kb);
        // cgt.un against null is the canonical "is not null" idiom.
        if kind == StackValueKind::ObjRef && unsigned && cond == CmpCond::Gt {
            return Ok(format!("(({}) != ({}))", a.render(), b.render()));
        }
        let op = cmp_op(cond);
        if kind == StackValueKind::Float && unsigned {
            // Unordered comparisons: true when either operand is NaN.
            let complement = match cond {
                CmpCond::Eq => "!=",
                CmpCond::Ne => "==",
                CmpCond::Lt => ">=",
                CmpCond::Le => ">",
                CmpCond::Gt => "<=",
                CmpCond::Ge => "<",
            };
            return Ok(format!(
                "(!(({}) {complement} ({})))",
                a.render(),
                b.render()
            ));
        }
        if unsigned
            && matches!(
                kind,
                StackValueKind::Int32 | StackValueKind::Int64 | StackValueKind::NativeInt
            )
            && !matches!(cond, CmpCond::Eq | CmpCond::Ne)
        {
            let ucty = cnames::unsigned_kind_c_type(kind);
            return Ok(format!(
                "((({ucty})({})) {op} (({ucty})({})))",
                a.render(),
                b.render()
            ));
        }
        Ok(format!("(({}) {op} ({}))", a.render(), b.render()))
    }

    fn lower_binary(&mut self, op: BinOp, unsigned: bool) -> Result<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (ka, kb) = (a.kind(), b.kind());
        if !ka.is_numeric() || !kb.is_numeric() {
            return Err(self.bad_operand("binary arithmetic"));
        }
        // Shifts keep the kind of the value being shifted.
        let kind = if matches!(op, BinOp::Shl | BinOp::Shr) {
            ka
        } else if op == BinOp::Sub && ka == StackValueKind::ByRef && kb == StackValueKind::ByRef {
            // Pointer difference is a native int, not a pointer.
            StackValueKind::NativeInt
        } else {
            ka.max(kb)
        };
        // Managed-pointer arithmetic is byte arithmetic. Compute on native
        // ints so C pointer scaling never applies, then cast back.
        let ra = if ka == StackValueKind::ByRef {
            format!("(intptr_t)({})", a.render())
        } else {
            a.render()
        };
        let rb = if kb == StackValueKind::ByRef {
            format!("(intptr_t)({})", b.render())
        } else {
            b.render()
        };
        let mut text = if kind == StackValueKind::Float && op == BinOp::Rem {
            format!("fmod({ra}, {rb})")
        } else if unsigned {
            let base = if kind == StackValueKind::ByRef {
                StackValueKind::NativeInt
            } else {
                kind
            };
            let ucty = cnames::unsigned_kind_c_type(base);
            let scty = cnames::kind_c_type(self.module, self.names, base, None);
            format!(
                "(({scty})((({ucty})({ra})) {} (({ucty})({rb}))))",
                c_bin_op(op)
            )
        } else {
            format!("(({ra}) {} ({rb}))", c_bin_op(op))
        };
        let ty = if kind == StackValueKind::ByRef {
            a.ty().or_else(|| b.ty())
        } else {
            None
        };
        if kind == StackValueKind::ByRef {
            let cty = cnames::kind_c_type(self.module, self.names, kind, ty);
            text = format!("(({cty})({text}))");
        }
        self.push(StackEntry::Expression { kind, ty, text });
        Ok(())
    }

    fn lower_convert(&mut self, to: ConvTarget, unsigned_src: bool) -> Result<()> {
        let v = self.pop()?;
        let (kind, cty) = match to {
            ConvTarget::I1 => (StackValueKind::Int32, "int8_t"),
            ConvTarget::U1 => (StackValueKind::Int32, "uint8_t"),
            ConvTarget::I2 => (StackValueKind::Int32, "int16_t"),
            ConvTarget::U2 => (StackValueKind::Int32, "uint16_t"),
            ConvTarget::I4 => (StackValueKind::Int32, "int32_t"),
            ConvTarget::U4 => (StackValueKind::Int32, "uint32_t"),
            ConvTarget::I8 => (StackValueKind::Int64, "int64_t"),
            ConvTarget::U8 => (StackValueKind::Int64, "uint64_t"),
            ConvTarget::I => (StackValueKind::NativeInt, "intptr_t"),
            ConvTarget::U => (StackValueKind::NativeInt, "uintptr_t"),
            ConvTarget::R4 => (StackValueKind::Float, "float"),
            ConvTarget::R8 | ConvTarget::R => (StackValueKind::Float, "double"),
        };
        let src = if unsigned_src && v.kind() != StackValueKind::Float {
            let ucty = cnames::unsigned_kind_c_type(v.kind());
            format!("(({ucty})({}))", v.render())
        } else {
            v.render()
        };
        self.push(StackEntry::expr(kind, format!("(({cty})({src}))")));
        Ok(())
    }

    fn lower_ret(&mut self) -> Result<()> {
        let ret = self.module.methods[self.method].signature.ret;
        if prim_of(self.module, ret) == Some(PrimKind::Void) {
            self.stmt("return;".to_string());
        } else {
            let v = self.pop()?;
            let text = self.coerced(&v, prim_of(self.module, ret));
            self.stmt(format!("return {text};"));
        }
        self.terminated = true;
        Ok(())
    }

    /// `__range_check` plus the typed element pointer for an array access.
    fn element_address(&mut self, elem: TypeId) -> Result<String> {
        if self.module.types[elem].runtime_determined {
            return Err(CompileError::Unsupported(
                "array access with runtime-determined element type".into(),
            ));
        }
        let size = self.module.byte_size(elem)?;
        let cty = cnames::c_type(self.module, self.names, elem);
        self.element_address_sized(size, &cty)
    }

    fn element_address_sized(&mut self, size: u32, cty: &str) -> Result<String> {
        let idx = self.pop()?;
        let arr = self.pop()?;
        let arr = self.ensure_simple(arr);
        let idx = self.ensure_simple(idx);
        self.stmt(format!(
            "__range_check({}, (intptr_t)({}));",
            arr.render(),
            idx.render()
        ));
        let base = self.module.pointer_size * 2;
        Ok(format!(
            "(({cty}*)((char*)({}) + {base} + {size} * (intptr_t)({})))",
            arr.render(),
            idx.render()
        ))
    }

    fn instance_field_lvalue(&mut self, field: cilantro_core::FieldId, obj: &StackEntry) -> Result<String> {
        let fdef = &self.module.fields[field];
        if fdef.is_static {
            return Err(CompileError::InvalidProgram(format!(
                "instance access to static field `{}`",
                fdef.name
            )));
        }
        let owner_sym = self.names.type_symbol(self.module, fdef.owner);
        let fname = self.names.field_symbol(self.module, field);
        self.deps.record_type(fdef.owner, TypeStrength::Necessary);
        match obj.kind() {
            StackValueKind::ValueType => Ok(format!("({}).{fname}", obj.render())),
            StackValueKind::ObjRef
            | StackValueKind::ByRef
            | StackValueKind::NativeInt => Ok(format!(
                "(((struct {owner_sym}*)({}))->{fname})",
                obj.render()
            )),
            _ => Err(self.bad_operand("field access")),
        }
    }

    fn static_field_lvalue(&mut self, field: cilantro_core::FieldId) -> Result<String> {
        let fdef = &self.module.fields[field];
        if !fdef.is_static {
            return Err(CompileError::InvalidProgram(format!(
                "static access to instance field `{}`",
                fdef.name
            )));
        }
        let owner = fdef.owner;
        let odef = &self.module.types[owner];
        let bucket = static_bucket(self.module, field);
        let fname = self.names.field_symbol(self.module, field);
        self.deps.record_static_base(owner);
        if odef.has_lazy_cctor {
            let mt = self.type_descriptor(owner, TypeStrength::Necessary)?;
            self.stmt(format!("__trigger_cctor({mt});"));
            self.deps.record_cctor(owner);
        }
        let sym = self.names.type_symbol(self.module, owner);
        if odef.runtime_determined {
            let base = generics::statics_base_lookup_expr(
                self.module,
                self.names,
                &mut self.deps,
                self.method,
                owner,
                cnames::statics_base_helper(bucket),
            )?;
            Ok(format!(
                "(((struct {}*)({base}))->{fname})",
                cnames::statics_struct_name(&sym, bucket)
            ))
        } else {
            Ok(format!(
                "({}.{fname})",
                cnames::statics_instance_name(&sym, bucket)
            ))
        }
    }

    fn lower_box(&mut self, token: u32) -> Result<()> {
        let ty = self.module.type_token(token)?;
        if !self.module.is_value_type(ty) {
            // Boxing a reference type is the identity.
            return Ok(());
        }
        let mt = self.type_descriptor(ty, TypeStrength::Constructed)?;
        let v = self.pop()?;
        let cty = cnames::c_type(self.module, self.names, ty);
        let t = self.new_temp("void*");
        self.stmt(format!("{t} = __allocate_object({mt});"));
        // Payload starts one pointer past the descriptor slot.
        self.stmt(format!("*(({cty}*)((void**){t} + 1)) = {};", v.render()));
        self.push(StackEntry::typed_expr(StackValueKind::ObjRef, ty, t));
        Ok(())
    }

    fn lower_newobj(&mut self, token: u32) -> Result<()> {
        let ctor = self.module.method_token(token)?;
        let cdef = &self.module.methods[ctor];
        let owner = cdef.owner;
        let nargs = cdef.signature.params.len();
        let mut args = Vec::with_capacity(nargs);
        for _ in 0..nargs {
            args.push(self.pop()?);
        }
        args.reverse();
        let arg_texts: Vec<String> = args.iter().map(|a| a.render()).collect();
        self.deps.record_method(ctor);
        self.deps.record_type(owner, TypeStrength::Constructed);

        let odef = &self.module.types[owner];
        if matches!(odef.shape, TypeShape::Array { .. }) {
            return Err(CompileError::Unsupported(
                "newobj on an array type".into(),
            ));
        }
        if odef.well_known == Some(WellKnown::String) {
            // String constructors are compiled as allocating statics.
            let sym = self.names.method_symbol(self.module, ctor);
            let t = self.new_temp("void*");
            self.stmt(format!("{t} = {sym}({});", arg_texts.join(", ")));
            self.push(StackEntry::typed_expr(StackValueKind::ObjRef, owner, t));
            return Ok(());
        }
        if self.module.is_value_type(owner) {
            let cty = cnames::c_type(self.module, self.names, owner);
            let t = self.new_temp(&cty);
            self.stmt(format!("memset((void*)&{t}, 0, sizeof({cty}));"));
            let sym = self.names.method_symbol(self.module, ctor);
            let mut all = vec![format!("&{t}")];
            all.extend(arg_texts);
            self.stmt(format!("{sym}({});", all.join(", ")));
            self.push(StackEntry::Expression {
                kind: StackValueKind::ValueType,
                ty: Some(owner),
                text: t,
            });
            return Ok(());
        }
        let mt = self.type_descriptor(owner, TypeStrength::Constructed)?;
        let t = self.new_temp("void*");
        self.stmt(format!("{t} = __allocate_object({mt});"));
        if odef.is_delegate && args.len() == 2 {
            // Closed delegate: target object plus the function pointer the
            // preceding ldftn/ldvirtftn pushed.
            self.stmt(format!(
                "__init_delegate({t}, {}, {});",
                arg_texts[0], arg_texts[1]
            ));
        } else {
            let sym = self.names.method_symbol(self.module, ctor);
            let mut all = vec![t.clone()];
            all.extend(arg_texts);
            self.stmt(format!("{sym}({});", all.join(", ")));
        }
        self.push(StackEntry::typed_expr(StackValueKind::ObjRef, owner, t));
        Ok(())
    }

    fn lower_ldvirtftn(&mut self, token: u32) -> Result<()> {
        let callee = self.module.method_token(token)?;
        let cdef = &self.module.methods[callee];
        let obj = self.pop()?;
        let obj = self.ensure_simple(obj);
        self.deps.record_virtual_call(callee);
        let sym = self.names.method_symbol(self.module, callee);
        let t = self.new_temp("void*");
        if cdef.is_generic_virtual() {
            self.stmt(format!("{t} = __gvm_lookup_{sym}({});", obj.render()));
        } else if self.module.is_interface(cdef.owner) {
            if cdef.vtable_slot.is_none() {
                return Err(CompileError::InvalidProgram(format!(
                    "interface method `{}` has no slot",
                    cdef.name
                )));
            }
            let mt = self.type_descriptor(cdef.owner, TypeStrength::Necessary)?;
            self.stmt(format!(
                "{t} = __resolve_interface_call({}, {mt}, {});",
                obj.render(),
                cnames::slot_accessor_expr(&sym)
            ));
        } else {
            if cdef.vtable_slot.is_none() {
                return Err(CompileError::InvalidProgram(format!(
                    "ldvirtftn on non-virtual method `{}`",
                    cdef.name
                )));
            }
            self.stmt(format!(
                "{t} = ((void**)(*(void**)({})))[{}];",
                obj.render(),
                cnames::slot_accessor_expr(&sym)
            ));
        }
        self.push(StackEntry::MethodPointer {
            method: callee,
            is_virtual: true,
            text: t,
        });
        Ok(())
    }

    /// Value for the hidden generic argument when calling `callee`.
    fn hidden_arg_value(&mut self, callee: MethodId) -> Result<Option<String>> {
        let cdef = &self.module.methods[callee];
        match cdef.context {
            ContextSource::None | ContextSource::ThisObject => Ok(None),
            ContextSource::HiddenTypeArg => {
                let owner = cdef.owner;
                Ok(Some(self.type_descriptor(owner, TypeStrength::Necessary)?))
            }
            ContextSource::HiddenMethodDict => {
                let sym = self.names.method_symbol(self.module, callee);
                if cdef.runtime_determined {
                    let ctx = generics::context_expr(self.module, self.method)?;
                    Ok(Some(format!("__lookup_methoddict_{sym}({ctx})")))
                } else {
                    Ok(Some(format!("((void*)&__dict__{sym})")))
                }
            }
        }
    }

    fn lower_call(&mut self, mut callee: MethodId, virtual_op: bool) -> Result<()> {
        let constrained = self.constrained.take();
        let mut cdef = self.module.methods[callee].clone();
        let nargs = cdef.signature.params.len();
        let mut args = Vec::with_capacity(nargs);
        for _ in 0..nargs {
            args.push(self.pop()?);
        }
        args.reverse();
        let mut this_entry = if cdef.signature.is_instance {
            Some(self.pop()?)
        } else {
            None
        };

        // constrained. only makes sense before callvirt on a byref receiver.
        if let Some(cty) = constrained {
            if !virtual_op {
                return Err(CompileError::InvalidProgram(
                    "constrained. prefix on a non-virtual call".into(),
                ));
            }
            let (receiver, devirt) =
                self.resolve_constrained_receiver(cty, callee, this_entry)?;
            this_entry = Some(receiver);
            if let Some(m) = devirt {
                callee = m;
                cdef = self.module.methods[m].clone();
            }
        }

        let dispatch_virtually = virtual_op
            && cdef.is_virtual()
            && !cdef.is_final
            && !matches!(
                this_entry,
                Some(StackEntry::Expression {
                    kind: StackValueKind::ByRef,
                    ..
                })
            );

        if cdef.is_abstract && !dispatch_virtually {
            return Err(CompileError::InvalidProgram(format!(
                "direct call to abstract method `{}`",
                cdef.name
            )));
        }

        let this_text = this_entry.as_ref().map(|e| self.ensure_simple(e.clone()).render());
        let mut arg_texts = Vec::with_capacity(nargs + 2);
        if let Some(t) = &this_text {
            arg_texts.push(t.clone());
        }

        let fnptr = cnames::fn_ptr_type(self.module, self.names, callee);
        let call_target: String;

        if self.module.is_delegate_invoke(callee) {
            let this = this_text.clone().ok_or_else(|| {
                CompileError::InvalidProgram("delegate invoke without receiver".into())
            })?;
            self.deps.record_method(callee);
            self.deps.record_type(cdef.owner, TypeStrength::Necessary);
            let owner_sym = self.names.type_symbol(self.module, cdef.owner);
            call_target = format!(
                "(({fnptr}){}({this}))",
                cnames::invoke_accessor_name(&owner_sym)
            );
        } else if dispatch_virtually {
            let this = this_text.clone().ok_or_else(|| {
                CompileError::InvalidProgram("virtual call without receiver".into())
            })?;
            self.deps.record_virtual_call(callee);
            if cdef.is_generic_virtual() {
                let sym = self.names.method_symbol(self.module, callee);
                let fp = self.new_temp("void*");
                self.stmt(format!("{fp} = __gvm_lookup_{sym}({this});"));
                // GVM entries may be fat pointers; route through calli.
                for a in &args {
                    arg_texts.push(a.render());
                }
                return self.emit_indirect_call(&cdef.signature, fp, arg_texts);
            } else if self.module.is_interface(cdef.owner) {
                if cdef.vtable_slot.is_none() {
                    return Err(CompileError::InvalidProgram(format!(
                        "interface method `{}` has no slot",
                        cdef.name
                    )));
                }
                let sym = self.names.method_symbol(self.module, callee);
                let mt = self.type_descriptor(cdef.owner, TypeStrength::Necessary)?;
                call_target = format!(
                    "(({fnptr})__resolve_interface_call({this}, {mt}, {}))",
                    cnames::slot_accessor_expr(&sym)
                );
            } else {
                if cdef.vtable_slot.is_none() {
                    return Err(CompileError::Internal("virtual method without slot".into()));
                }
                let sym = self.names.method_symbol(self.module, callee);
                call_target = format!(
                    "(({fnptr})(((void**)(*(void**)({this})))[{}]))",
                    cnames::slot_accessor_expr(&sym)
                );
            }
        } else if let Some(import) = &cdef.runtime_import {
            call_target = import.clone();
        } else if cdef.runtime_determined {
            // The exact entry point depends on the caller's instantiation.
            let entry = generics::method_entry_lookup_expr(
                self.module,
                self.names,
                &mut self.deps,
                self.method,
                callee,
            )?;
            call_target = format!("(({fnptr}){entry})");
        } else {
            self.deps.record_method(callee);
            call_target = self.names.method_symbol(self.module, callee);
        }

        if let Some(h) = self.hidden_arg_value(callee)? {
            arg_texts.push(h);
        }
        for a in &args {
            arg_texts.push(a.render());
        }

        let call = format!("{call_target}({})", arg_texts.join(", "));
        self.finish_call(&cdef.signature, call)
    }

    /// Store the call result into a temp (or emit it as a statement for
    /// void) and push it.
    fn finish_call(&mut self, sig: &cilantro_core::Signature, call: String) -> Result<()> {
        if prim_of(self.module, sig.ret) == Some(PrimKind::Void) {
            self.stmt(format!("{call};"));
        } else {
            let cty = cnames::c_type(self.module, self.names, sig.ret);
            let t = self.new_temp(&cty);
            self.stmt(format!("{t} = {call};"));
            let (kind, ty) = kind_of_type(self.module, sig.ret);
            self.push(StackEntry::Expression { kind, ty, text: t });
        }
        Ok(())
    }

    /// Indirect call through a possibly fat function pointer: test the tag
    /// bit, and on the fat path load the real entry and pass the hidden
    /// argument from the thunk. The thin cast carries no hidden parameter;
    /// only the fat thunk supplies one.
    fn emit_indirect_call(
        &mut self,
        sig: &cilantro_core::Signature,
        fp: String,
        arg_texts: Vec<String>,
    ) -> Result<()> {
        let thin_ptr = cnames::fn_ptr_type_for_sig(self.module, self.names, sig, false);
        let fat_ptr = cnames::fn_ptr_type_for_sig(self.module, self.names, sig, true);
        let ret_void = prim_of(self.module, sig.ret) == Some(PrimKind::Void);
        let ret_temp = if ret_void {
            None
        } else {
            let cty = cnames::c_type(self.module, self.names, sig.ret);
            Some(self.new_temp(&cty))
        };

        let hidden_at = usize::from(sig.is_instance);
        let mut fat_args = arg_texts.clone();
        fat_args.insert(hidden_at, FatPointer::hidden_expr(&fp));
        let fat_call = format!(
            "(({fat_ptr}){})({})",
            FatPointer::entry_expr(&fp),
            fat_args.join(", ")
        );
        let thin_call = format!("(({thin_ptr})({fp}))({})", arg_texts.join(", "));

        let assign = |c: String| match &ret_temp {
            Some(t) => format!("{t} = {c};"),
            None => format!("{c};"),
        };
        self.stmt(format!("if {} {{", FatPointer::test_expr(&fp)));
        self.stmt(assign(fat_call));
        self.stmt("} else {".to_string());
        self.stmt(assign(thin_call));
        self.stmt("}".to_string());

        if let Some(t) = ret_temp {
            let (kind, ty) = kind_of_type(self.module, sig.ret);
            self.push(StackEntry::Expression { kind, ty, text: t });
        }
        Ok(())
    }

    fn lower_calli(&mut self, token: u32) -> Result<()> {
        let sig = match self.module.resolve_token(token)? {
            cilantro_core::TokenItem::Signature { sig } => sig.clone(),
            _ => {
                return Err(CompileError::InvalidProgram(format!(
                    "calli token {token:#x} is not a signature"
                )))
            }
        };
        let fp_entry = self.pop()?;
        let fp_entry = self.ensure_simple(fp_entry);
        let fp = fp_entry.render();
        let nargs = sig.params.len() + usize::from(sig.is_instance);
        let mut args = Vec::with_capacity(nargs);
        for _ in 0..nargs {
            args.push(self.pop()?);
        }
        args.reverse();
        let arg_texts: Vec<String> = args.iter().map(|a| a.render()).collect();

        let thin_ptr = cnames::fn_ptr_type_for_sig(self.module, self.names, &sig, false);
        let fat_ptr = cnames::fn_ptr_type_for_sig(self.module, self.names, &sig, true);
        let ret_void = prim_of(self.module, sig.ret) == Some(PrimKind::Void);
        let ret_temp = if ret_void {
            None
        } else {
            let cty = cnames::c_type(self.module, self.names, sig.ret);
            Some(self.new_temp(&cty))
        };
        let hidden_at = usize::from(sig.is_instance);
        let mut fat_args = arg_texts.clone();
        fat_args.insert(hidden_at, FatPointer::hidden_expr(&fp));
        let fat_call = format!(
            "(({fat_ptr}){})({})",
            FatPointer::entry_expr(&fp),
            fat_args.join(", ")
        );
        let thin_call = format!("(({thin_ptr})({fp}))({})", arg_texts.join(", "));
        let assign = |c: String| match &ret_temp {
            Some(t) => format!("{t} = {c};"),
            None => format!("{c};"),
        };
        self.stmt(format!("if {} {{", FatPointer::test_expr(&fp)));
        self.stmt(assign(fat_call));
        self.stmt("} else {".to_string());
        self.stmt(assign(thin_call));
        self.stmt("}".to_string());
        if let Some(t) = ret_temp {
            let (kind, ty) = kind_of_type(self.module, sig.ret);
            self.push(StackEntry::Expression { kind, ty, text: t });
        }
        Ok(())
    }

    /// `constrained.` resolution: a value-type receiver whose own vtable
    /// provides the slot devirtualizes to that implementation; one that
    /// does not gets boxed and dispatched normally. Reference receivers
    /// would need a dereference-and-dispatch path this backend rejects.
    fn resolve_constrained_receiver(
        &mut self,
        cty: TypeId,
        callee: MethodId,
        this_entry: Option<StackEntry>,
    ) -> Result<(StackEntry, Option<MethodId>)> {
        let this = this_entry.ok_or_else(|| {
            CompileError::InvalidProgram("constrained. call without receiver".into())
        })?;
        if !self.module.is_value_type(cty) {
            return Err(CompileError::Unsupported(
                "constrained. on a reference-type receiver".into(),
            ));
        }
        let cdef = &self.module.methods[callee];
        if let Some(slot) = cdef.vtable_slot {
            if !self.module.is_interface(cdef.owner) {
                if let Some(&impl_method) = self.module.types[cty].vtable.get(slot as usize) {
                    // Direct call on the byref receiver; lower_call sees a
                    // ByRef this and skips virtual dispatch.
                    return Ok((this, Some(impl_method)));
                }
            }
        }
        // Box the receiver and dispatch on the boxed object.
        let ctext = this.render();
        let mt = self.type_descriptor(cty, TypeStrength::Constructed)?;
        let ccty = cnames::c_type(self.module, self.names, cty);
        let t = self.new_temp("void*");
        self.stmt(format!("{t} = __allocate_object({mt});"));
        self.stmt(format!("*(({ccty}*)((void**){t} + 1)) = *({ccty}*)({ctext});"));
        Ok((StackEntry::typed_expr(StackValueKind::ObjRef, cty, t), None))
    }

    // ---- protected regions ----

    fn lower_leave(&mut self, target: u32) -> Result<()> {
        // leave empties the evaluation stack.
        self.stack.clear();
        let at = self.current_offset;

        let mut chain: Vec<usize> = self
            .finallys
            .iter()
            .enumerate()
            .filter(|(_, f)| {
                let r = &self.body.regions[f.region];
                r.kind == RegionKind::Finally && r.protects(at) && !r.protects(target)
            })
            .map(|(i, _)| i)
            .collect();
        chain.sort_by_key(|&i| self.body.regions[self.finallys[i].region].try_length);

        if chain.is_empty() {
            self.merge_into(target)?;
            self.stmt(format!("goto _bb{target};"));
            self.terminated = true;
            return Ok(());
        }

        // Each finally forwards to the next handler in the chain; the last
        // one forwards to the leave target.
        for (pos, &fi) in chain.iter().enumerate() {
            let dest = match chain.get(pos + 1) {
                Some(&next) => self.body.regions[self.finallys[next].region].handler_offset,
                None => target,
            };
            let ticket = self.finally_ticket(fi, dest);
            self.stmt(format!("__finallyReturn{fi} = {ticket};"));
        }
        self.ensure_queued_empty(target)?;
        let first_handler = self.body.regions[self.finallys[chain[0]].region].handler_offset;
        self.stmt(format!("goto _bb{first_handler};"));
        self.terminated = true;
        Ok(())
    }

    fn finally_ticket(&mut self, fi: usize, dest: u32) -> u32 {
        let exits = &mut self.finallys[fi].exits;
        if let Some(pos) = exits.iter().position(|&d| d == dest) {
            pos as u32 + 1
        } else {
            exits.push(dest);
            exits.len() as u32
        }
    }

    /// Queue a leave destination, which always starts with an empty stack.
    fn ensure_queued_empty(&mut self, target: u32) -> Result<()> {
        if !self.cfg.contains_start(target) {
            return Err(CompileError::InvalidProgram(format!(
                "leave target {target:#x} is not a block start"
            )));
        }
        let state = self.state_mut(target)?;
        match &state.entry {
            None => state.entry = Some(Vec::new()),
            Some(slots) if slots.is_empty() => {}
            Some(_) => {
                return Err(CompileError::InvalidProgram(format!(
                    "leave target {target:#x} expects a non-empty stack"
                )))
            }
        }
        if !state.queued {
            state.queued = true;
            self.pending.push(target);
        }
        Ok(())
    }

    fn lower_endfinally(&mut self) -> Result<()> {
        let at = self.current_offset;
        let mut owner: Option<usize> = None;
        let mut best_len = u32::MAX;
        for (i, f) in self.finallys.iter().enumerate() {
            let r = &self.body.regions[f.region];
            if at >= r.handler_offset && at < r.handler_end() && r.handler_length < best_len {
                owner = Some(i);
                best_len = r.handler_length;
            }
        }
        let Some(fi) = owner else {
            return Err(CompileError::InvalidProgram(
                "endfinally outside any finally handler".into(),
            ));
        };
        self.stack.clear();
        self.stmt(format!("goto __endFinally{fi};"));
        self.terminated = true;
        Ok(())
    }

    // ---- final assembly ----

    fn assemble(&mut self) -> String {
        let mdef = &self.module.methods[self.method];
        let mut arg_names = Vec::new();
        let mut il_index = 0u32;
        if mdef.signature.is_instance {
            arg_names.push("_a0".to_string());
            il_index = 1;
        }
        if mdef.has_hidden_arg() {
            arg_names.push(generics::HIDDEN_ARG.to_string());
        }
        for _ in &mdef.signature.params {
            arg_names.push(format!("_a{il_index}"));
            il_index += 1;
        }

        let mut out = CodeBuffer::new();
        out.line(&format!(
            "{} {{",
            cnames::method_declaration(self.module, self.names, self.method, &arg_names)
        ));
        out.indent();
        for (i, &ty) in self.locals.iter().enumerate() {
            let cty = cnames::c_type(self.module, self.names, ty);
            if self.body.init_locals {
                out.line(&format!("{cty} _l{i} = {{0}};"));
            } else {
                out.line(&format!("{cty} _l{i};"));
            }
        }
        for d in &self.decls {
            out.line(d);
        }
        for (fi, f) in self.finallys.iter().enumerate() {
            if !f.exits.is_empty() {
                out.line(&format!("intptr_t __finallyReturn{fi} = 0;"));
            }
        }
        for (start, state) in &self.states {
            let Some(code) = &state.code else { continue };
            out.line(&format!("_bb{start}: {{"));
            out.indent();
            for line in code {
                out.line(line);
            }
            out.exdent();
            out.line("}");
        }
        for (fi, f) in self.finallys.iter().enumerate() {
            out.line(&format!("__endFinally{fi}: ;"));
            if f.exits.is_empty() {
                out.line("__unreachable();");
                continue;
            }
            out.line(&format!("switch (__finallyReturn{fi}) {{"));
            out.indent();
            for (pos, dest) in f.exits.iter().enumerate() {
                out.line(&format!("case {}: goto _bb{dest};", pos + 1));
            }
            out.line("default: __unreachable();");
            out.exdent();
            out.line("}");
        }
        out.exdent();
        out.line("}");
        out.finish()
    }
}

// ---- free helpers ----

fn prim_of(module: &Module, ty: TypeId) -> Option<PrimKind> {
    match module.types[ty].shape {
        TypeShape::Primitive { prim } => Some(prim),
        _ => None,
    }
}

fn needs_store_cast(prim: PrimKind) -> bool {
    matches!(
        prim,
        PrimKind::Bool
            | PrimKind::Char
            | PrimKind::I8
            | PrimKind::U8
            | PrimKind::I16
            | PrimKind::U16
            | PrimKind::U32
            | PrimKind::F32
    )
}

fn cmp_op(cond: CmpCond) -> &'static str {
    match cond {
        CmpCond::Eq => "==",
        CmpCond::Ne => "!=",
        CmpCond::Lt => "<",
        CmpCond::Le => "<=",
        CmpCond::Gt => ">",
        CmpCond::Ge => ">=",
    }
}

fn c_bin_op(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Rem => "%",
        BinOp::And => "&",
        BinOp::Or => "|",
        BinOp::Xor => "^",
        BinOp::Shl => "<<",
        BinOp::Shr => ">>",
    }
}

fn mem_kind_info(mk: MemKind) -> (StackValueKind, String) {
    let (kind, cty) = match mk {
        MemKind::I1 => (StackValueKind::Int32, "int8_t"),
        MemKind::U1 => (StackValueKind::Int32, "uint8_t"),
        MemKind::I2 => (StackValueKind::Int32, "int16_t"),
        MemKind::U2 => (StackValueKind::Int32, "uint16_t"),
        MemKind::I4 => (StackValueKind::Int32, "int32_t"),
        MemKind::U4 => (StackValueKind::Int32, "uint32_t"),
        MemKind::I8 => (StackValueKind::Int64, "int64_t"),
        MemKind::I => (StackValueKind::NativeInt, "intptr_t"),
        MemKind::R4 => (StackValueKind::Float, "float"),
        MemKind::R8 => (StackValueKind::Float, "double"),
        MemKind::Ref => (StackValueKind::ObjRef, "void*"),
    };
    (kind, cty.to_string())
}

fn mem_kind_prim(mk: MemKind) -> Option<PrimKind> {
    match mk {
        MemKind::I1 => Some(PrimKind::I8),
        MemKind::U1 => Some(PrimKind::U8),
        MemKind::I2 => Some(PrimKind::I16),
        MemKind::U2 => Some(PrimKind::U16),
        MemKind::I4 => Some(PrimKind::I32),
        MemKind::U4 => Some(PrimKind::U32),
        MemKind::I8 => Some(PrimKind::I64),
        MemKind::I => Some(PrimKind::IntPtr),
        MemKind::R4 => Some(PrimKind::F32),
        MemKind::R8 => Some(PrimKind::F64),
        MemKind::Ref => None,
    }
}

fn mem_kind_size(mk: MemKind, pointer_size: u32) -> u32 {
    match mk {
        MemKind::I1 | MemKind::U1 => 1,
        MemKind::I2 | MemKind::U2 => 2,
        MemKind::I4 | MemKind::U4 | MemKind::R4 => 4,
        MemKind::I8 | MemKind::R8 => 8,
        MemKind::I | MemKind::Ref => pointer_size,
    }
}
