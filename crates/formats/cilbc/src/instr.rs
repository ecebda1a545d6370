use crate::error::{Error, Result};
use crate::opcode::Opcode;

/// Width/kind selector for indirect and element accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    I,
    R4,
    R8,
    Ref,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

/// Comparison conditions shared by conditional branches and `ceq`/`cgt`/`clt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpCond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Destination of a `conv.*` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvTarget {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    I,
    U,
    R4,
    R8,
    /// `conv.r.un` — unsigned integer to floating point.
    R,
}

/// A decoded instruction with short forms and macro encodings normalized away.
///
/// Branch targets are absolute byte offsets into the method body.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Nop,
    Break,
    LoadArg(u16),
    LoadArgAddr(u16),
    StoreArg(u16),
    LoadLocal(u16),
    LoadLocalAddr(u16),
    StoreLocal(u16),
    LoadNull,
    LoadI4(i32),
    LoadI8(i64),
    LoadR4(f32),
    LoadR8(f64),
    Dup,
    Pop,
    Jmp(u32),
    Call(u32),
    CallVirt(u32),
    CallIndirect(u32),
    Ret,
    Branch(u32),
    BranchTrue(u32),
    BranchFalse(u32),
    BranchCmp {
        cond: CmpCond,
        unsigned: bool,
        target: u32,
    },
    Switch(Vec<u32>),
    Compare {
        cond: CmpCond,
        unsigned: bool,
    },
    LoadIndirect(MemKind),
    StoreIndirect(MemKind),
    Binary {
        op: BinOp,
        overflow: bool,
        unsigned: bool,
    },
    Neg,
    Not,
    Convert {
        to: ConvTarget,
        overflow: bool,
        unsigned: bool,
    },
    LoadString(u32),
    NewObj(u32),
    CastClass(u32),
    IsInst(u32),
    Box(u32),
    Unbox(u32),
    UnboxAny(u32),
    Throw,
    Rethrow,
    LoadField(u32),
    LoadFieldAddr(u32),
    StoreField(u32),
    LoadStaticField(u32),
    LoadStaticFieldAddr(u32),
    StoreStaticField(u32),
    LoadObj(u32),
    StoreObj(u32),
    CopyObj(u32),
    InitObj(u32),
    NewArray(u32),
    LoadLength,
    LoadElemAddr(u32),
    LoadElem(MemKind),
    LoadElemTyped(u32),
    StoreElem(MemKind),
    StoreElemTyped(u32),
    LoadToken(u32),
    Sizeof(u32),
    LoadFtn(u32),
    LoadVirtFtn(u32),
    Leave(u32),
    EndFinally,
    EndFilter,
    LocAlloc,
    InitBlk,
    CpBlk,
    CkFinite,
    ArgList,
    MkRefAny(u32),
    RefAnyVal(u32),
    RefAnyType,
    // Prefixes; they apply to the next decoded instruction.
    Unaligned(u8),
    Volatile,
    Tail,
    Constrained(u32),
    NoCheck(u8),
    Readonly,
}

/// Cursor over a raw IL byte stream.
pub struct InstrReader<'a> {
    il: &'a [u8],
    pos: usize,
}

impl<'a> InstrReader<'a> {
    pub fn new(il: &'a [u8]) -> Self {
        Self { il, pos: 0 }
    }

    /// Byte offset of the next instruction to decode.
    pub fn offset(&self) -> u32 {
        self.pos as u32
    }

    pub fn done(&self) -> bool {
        self.pos >= self.il.len()
    }

    /// Reposition the cursor. Used when re-decoding from a block start.
    pub fn seek(&mut self, offset: u32) {
        self.pos = offset as usize;
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.il.len() {
            return Err(Error::UnexpectedEof {
                offset: self.pos,
                need: n,
                have: self.il.len() - self.pos,
            });
        }
        let bytes = &self.il[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.i64()? as u64))
    }

    /// Absolute target from a relative displacement measured at the
    /// instruction following the operand.
    fn target(&self, rel: i32) -> u32 {
        (self.pos as i64 + rel as i64) as u32
    }

    fn short_target(&mut self) -> Result<u32> {
        let rel = self.i8()? as i32;
        Ok(self.target(rel))
    }

    fn long_target(&mut self) -> Result<u32> {
        let rel = self.i32()?;
        Ok(self.target(rel))
    }

    /// Decode one instruction, advancing past it.
    pub fn read(&mut self) -> Result<Instr> {
        use Opcode::*;

        let at = self.pos;
        let byte = self.u8()?;
        let op = if byte == 0xfe {
            Opcode::from_prefixed(self.u8()?, at)?
        } else {
            Opcode::from_byte(byte, at)?
        };

        Ok(match op {
            Nop => Instr::Nop,
            Break => Instr::Break,
            Ldarg0 | Ldarg1 | Ldarg2 | Ldarg3 => Instr::LoadArg(byte as u16 - 0x02),
            Ldloc0 | Ldloc1 | Ldloc2 | Ldloc3 => Instr::LoadLocal(byte as u16 - 0x06),
            Stloc0 | Stloc1 | Stloc2 | Stloc3 => Instr::StoreLocal(byte as u16 - 0x0a),
            LdargS => Instr::LoadArg(self.u8()? as u16),
            LdargaS => Instr::LoadArgAddr(self.u8()? as u16),
            StargS => Instr::StoreArg(self.u8()? as u16),
            LdlocS => Instr::LoadLocal(self.u8()? as u16),
            LdlocaS => Instr::LoadLocalAddr(self.u8()? as u16),
            StlocS => Instr::StoreLocal(self.u8()? as u16),
            Ldarg => Instr::LoadArg(self.u16()?),
            Ldarga => Instr::LoadArgAddr(self.u16()?),
            Starg => Instr::StoreArg(self.u16()?),
            Ldloc => Instr::LoadLocal(self.u16()?),
            Ldloca => Instr::LoadLocalAddr(self.u16()?),
            Stloc => Instr::StoreLocal(self.u16()?),
            Ldnull => Instr::LoadNull,
            LdcI4M1 => Instr::LoadI4(-1),
            LdcI40 | LdcI41 | LdcI42 | LdcI43 | LdcI44 | LdcI45 | LdcI46 | LdcI47 | LdcI48 => {
                Instr::LoadI4(byte as i32 - 0x16)
            }
            LdcI4S => Instr::LoadI4(self.i8()? as i32),
            LdcI4 => Instr::LoadI4(self.i32()?),
            LdcI8 => Instr::LoadI8(self.i64()?),
            LdcR4 => Instr::LoadR4(self.f32()?),
            LdcR8 => Instr::LoadR8(self.f64()?),
            Dup => Instr::Dup,
            Pop => Instr::Pop,
            Jmp => Instr::Jmp(self.u32()?),
            Call => Instr::Call(self.u32()?),
            Callvirt => Instr::CallVirt(self.u32()?),
            Calli => Instr::CallIndirect(self.u32()?),
            Ret => Instr::Ret,
            BrS => Instr::Branch(self.short_target()?),
            Br => Instr::Branch(self.long_target()?),
            BrtrueS => Instr::BranchTrue(self.short_target()?),
            Brtrue => Instr::BranchTrue(self.long_target()?),
            BrfalseS => Instr::BranchFalse(self.short_target()?),
            Brfalse => Instr::BranchFalse(self.long_target()?),
            BeqS | BgeS | BgtS | BleS | BltS | BneUnS | BgeUnS | BgtUnS | BleUnS | BltUnS => {
                let (cond, unsigned) = cmp_of(op);
                let target = self.short_target()?;
                Instr::BranchCmp {
                    cond,
                    unsigned,
                    target,
                }
            }
            Beq | Bge | Bgt | Ble | Blt | BneUn | BgeUn | BgtUn | BleUn | BltUn => {
                let (cond, unsigned) = cmp_of(op);
                let target = self.long_target()?;
                Instr::BranchCmp {
                    cond,
                    unsigned,
                    target,
                }
            }
            Switch => {
                let count = self.u32()?;
                if count as usize > self.il.len() {
                    return Err(Error::OversizedSwitch { offset: at, count });
                }
                let mut rels = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    rels.push(self.i32()?);
                }
                let base = self.pos;
                Instr::Switch(
                    rels.into_iter()
                        .map(|rel| (base as i64 + rel as i64) as u32)
                        .collect(),
                )
            }
            Ceq => Instr::Compare {
                cond: CmpCond::Eq,
                unsigned: false,
            },
            Cgt => Instr::Compare {
                cond: CmpCond::Gt,
                unsigned: false,
            },
            CgtUn => Instr::Compare {
                cond: CmpCond::Gt,
                unsigned: true,
            },
            Clt => Instr::Compare {
                cond: CmpCond::Lt,
                unsigned: false,
            },
            CltUn => Instr::Compare {
                cond: CmpCond::Lt,
                unsigned: true,
            },
            LdindI1 => Instr::LoadIndirect(MemKind::I1),
            LdindU1 => Instr::LoadIndirect(MemKind::U1),
            LdindI2 => Instr::LoadIndirect(MemKind::I2),
            LdindU2 => Instr::LoadIndirect(MemKind::U2),
            LdindI4 => Instr::LoadIndirect(MemKind::I4),
            LdindU4 => Instr::LoadIndirect(MemKind::U4),
            LdindI8 => Instr::LoadIndirect(MemKind::I8),
            LdindI => Instr::LoadIndirect(MemKind::I),
            LdindR4 => Instr::LoadIndirect(MemKind::R4),
            LdindR8 => Instr::LoadIndirect(MemKind::R8),
            LdindRef => Instr::LoadIndirect(MemKind::Ref),
            StindI1 => Instr::StoreIndirect(MemKind::I1),
            StindI2 => Instr::StoreIndirect(MemKind::I2),
            StindI4 => Instr::StoreIndirect(MemKind::I4),
            StindI8 => Instr::StoreIndirect(MemKind::I8),
            StindR4 => Instr::StoreIndirect(MemKind::R4),
            StindR8 => Instr::StoreIndirect(MemKind::R8),
            StindI => Instr::StoreIndirect(MemKind::I),
            StindRef => Instr::StoreIndirect(MemKind::Ref),
            Add => bin(BinOp::Add, false, false),
            Sub => bin(BinOp::Sub, false, false),
            Mul => bin(BinOp::Mul, false, false),
            Div => bin(BinOp::Div, false, false),
            DivUn => bin(BinOp::Div, false, true),
            Rem => bin(BinOp::Rem, false, false),
            RemUn => bin(BinOp::Rem, false, true),
            And => bin(BinOp::And, false, false),
            Or => bin(BinOp::Or, false, false),
            Xor => bin(BinOp::Xor, false, false),
            Shl => bin(BinOp::Shl, false, false),
            Shr => bin(BinOp::Shr, false, false),
            ShrUn => bin(BinOp::Shr, false, true),
            AddOvf => bin(BinOp::Add, true, false),
            AddOvfUn => bin(BinOp::Add, true, true),
            SubOvf => bin(BinOp::Sub, true, false),
            SubOvfUn => bin(BinOp::Sub, true, true),
            MulOvf => bin(BinOp::Mul, true, false),
            MulOvfUn => bin(BinOp::Mul, true, true),
            Neg => Instr::Neg,
            Not => Instr::Not,
            ConvI1 => conv(ConvTarget::I1, false, false),
            ConvI2 => conv(ConvTarget::I2, false, false),
            ConvI4 => conv(ConvTarget::I4, false, false),
            ConvI8 => conv(ConvTarget::I8, false, false),
            ConvU1 => conv(ConvTarget::U1, false, false),
            ConvU2 => conv(ConvTarget::U2, false, false),
            ConvU4 => conv(ConvTarget::U4, false, false),
            ConvU8 => conv(ConvTarget::U8, false, false),
            ConvI => conv(ConvTarget::I, false, false),
            ConvU => conv(ConvTarget::U, false, false),
            ConvR4 => conv(ConvTarget::R4, false, false),
            ConvR8 => conv(ConvTarget::R8, false, false),
            ConvRUn => conv(ConvTarget::R, false, true),
            ConvOvfI1 => conv(ConvTarget::I1, true, false),
            ConvOvfI2 => conv(ConvTarget::I2, true, false),
            ConvOvfI4 => conv(ConvTarget::I4, true, false),
            ConvOvfI8 => conv(ConvTarget::I8, true, false),
            ConvOvfU1 => conv(ConvTarget::U1, true, false),
            ConvOvfU2 => conv(ConvTarget::U2, true, false),
            ConvOvfU4 => conv(ConvTarget::U4, true, false),
            ConvOvfU8 => conv(ConvTarget::U8, true, false),
            ConvOvfI => conv(ConvTarget::I, true, false),
            ConvOvfU => conv(ConvTarget::U, true, false),
            ConvOvfI1Un => conv(ConvTarget::I1, true, true),
            ConvOvfI2Un => conv(ConvTarget::I2, true, true),
            ConvOvfI4Un => conv(ConvTarget::I4, true, true),
            ConvOvfI8Un => conv(ConvTarget::I8, true, true),
            ConvOvfU1Un => conv(ConvTarget::U1, true, true),
            ConvOvfU2Un => conv(ConvTarget::U2, true, true),
            ConvOvfU4Un => conv(ConvTarget::U4, true, true),
            ConvOvfU8Un => conv(ConvTarget::U8, true, true),
            ConvOvfIUn => conv(ConvTarget::I, true, true),
            ConvOvfUUn => conv(ConvTarget::U, true, true),
            Ldstr => Instr::LoadString(self.u32()?),
            Newobj => Instr::NewObj(self.u32()?),
            Castclass => Instr::CastClass(self.u32()?),
            Isinst => Instr::IsInst(self.u32()?),
            Opcode::Box => Instr::Box(self.u32()?),
            Unbox => Instr::Unbox(self.u32()?),
            UnboxAny => Instr::UnboxAny(self.u32()?),
            Throw => Instr::Throw,
            Rethrow => Instr::Rethrow,
            Ldfld => Instr::LoadField(self.u32()?),
            Ldflda => Instr::LoadFieldAddr(self.u32()?),
            Stfld => Instr::StoreField(self.u32()?),
            Ldsfld => Instr::LoadStaticField(self.u32()?),
            Ldsflda => Instr::LoadStaticFieldAddr(self.u32()?),
            Stsfld => Instr::StoreStaticField(self.u32()?),
            Ldobj => Instr::LoadObj(self.u32()?),
            Stobj => Instr::StoreObj(self.u32()?),
            Cpobj => Instr::CopyObj(self.u32()?),
            Initobj => Instr::InitObj(self.u32()?),
            Newarr => Instr::NewArray(self.u32()?),
            Ldlen => Instr::LoadLength,
            Ldelema => Instr::LoadElemAddr(self.u32()?),
            LdelemI1 => Instr::LoadElem(MemKind::I1),
            LdelemU1 => Instr::LoadElem(MemKind::U1),
            LdelemI2 => Instr::LoadElem(MemKind::I2),
            LdelemU2 => Instr::LoadElem(MemKind::U2),
            LdelemI4 => Instr::LoadElem(MemKind::I4),
            LdelemU4 => Instr::LoadElem(MemKind::U4),
            LdelemI8 => Instr::LoadElem(MemKind::I8),
            LdelemI => Instr::LoadElem(MemKind::I),
            LdelemR4 => Instr::LoadElem(MemKind::R4),
            LdelemR8 => Instr::LoadElem(MemKind::R8),
            LdelemRef => Instr::LoadElem(MemKind::Ref),
            Ldelem => Instr::LoadElemTyped(self.u32()?),
            StelemI => Instr::StoreElem(MemKind::I),
            StelemI1 => Instr::StoreElem(MemKind::I1),
            StelemI2 => Instr::StoreElem(MemKind::I2),
            StelemI4 => Instr::StoreElem(MemKind::I4),
            StelemI8 => Instr::StoreElem(MemKind::I8),
            StelemR4 => Instr::StoreElem(MemKind::R4),
            StelemR8 => Instr::StoreElem(MemKind::R8),
            StelemRef => Instr::StoreElem(MemKind::Ref),
            Stelem => Instr::StoreElemTyped(self.u32()?),
            Ldtoken => Instr::LoadToken(self.u32()?),
            Opcode::Sizeof => Instr::Sizeof(self.u32()?),
            Ldftn => Instr::LoadFtn(self.u32()?),
            Ldvirtftn => Instr::LoadVirtFtn(self.u32()?),
            LeaveS => Instr::Leave(self.short_target()?),
            Opcode::Leave => Instr::Leave(self.long_target()?),
            Endfinally => Instr::EndFinally,
            Endfilter => Instr::EndFilter,
            Localloc => Instr::LocAlloc,
            Initblk => Instr::InitBlk,
            Cpblk => Instr::CpBlk,
            Ckfinite => Instr::CkFinite,
            Arglist => Instr::ArgList,
            Mkrefany => Instr::MkRefAny(self.u32()?),
            Refanyval => Instr::RefAnyVal(self.u32()?),
            Refanytype => Instr::RefAnyType,
            Unaligned => Instr::Unaligned(self.u8()?),
            Volatile => Instr::Volatile,
            Tail => Instr::Tail,
            Constrained => Instr::Constrained(self.u32()?),
            No => Instr::NoCheck(self.u8()?),
            Readonly => Instr::Readonly,
        })
    }
}

fn bin(op: BinOp, overflow: bool, unsigned: bool) -> Instr {
    Instr::Binary {
        op,
        overflow,
        unsigned,
    }
}

fn conv(to: ConvTarget, overflow: bool, unsigned: bool) -> Instr {
    Instr::Convert {
        to,
        overflow,
        unsigned,
    }
}

fn cmp_of(op: Opcode) -> (CmpCond, bool) {
    use Opcode::*;
    match op {
        BeqS | Beq => (CmpCond::Eq, false),
        BgeS | Bge => (CmpCond::Ge, false),
        BgtS | Bgt => (CmpCond::Gt, false),
        BleS | Ble => (CmpCond::Le, false),
        BltS | Blt => (CmpCond::Lt, false),
        BneUnS | BneUn => (CmpCond::Ne, true),
        BgeUnS | BgeUn => (CmpCond::Ge, true),
        BgtUnS | BgtUn => (CmpCond::Gt, true),
        BleUnS | BleUn => (CmpCond::Le, true),
        BltUnS | BltUn => (CmpCond::Lt, true),
        _ => unreachable!("not a comparison branch: {op:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macro_forms_normalize() {
        // ldarg.1; ldc.i4.5; ldc.i4.s -3; stloc.0
        let il = [0x03, 0x1b, 0x1f, 0xfd, 0x0a];
        let mut r = InstrReader::new(&il);
        assert_eq!(r.read().unwrap(), Instr::LoadArg(1));
        assert_eq!(r.read().unwrap(), Instr::LoadI4(5));
        assert_eq!(r.read().unwrap(), Instr::LoadI4(-3));
        assert_eq!(r.read().unwrap(), Instr::StoreLocal(0));
        assert!(r.done());
    }

    #[test]
    fn test_short_branch_targets_are_absolute() {
        // 0: br.s +2 (-> 4); 2: nop; 3: nop; 4: ret
        let il = [0x2b, 0x02, 0x00, 0x00, 0x2a];
        let mut r = InstrReader::new(&il);
        assert_eq!(r.read().unwrap(), Instr::Branch(4));
    }

    #[test]
    fn test_backward_branch() {
        // 0: nop; 1: br.s -3 (-> 0)
        let il = [0x00, 0x2b, 0xfd];
        let mut r = InstrReader::new(&il);
        r.read().unwrap();
        assert_eq!(r.read().unwrap(), Instr::Branch(0));
    }

    #[test]
    fn test_switch_targets() {
        // 0: switch [2 targets], rel 0 and 1; base = 13
        let il = [
            0x45, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
            0x00,
        ];
        let mut r = InstrReader::new(&il);
        assert_eq!(r.read().unwrap(), Instr::Switch(vec![13, 14]));
    }

    #[test]
    fn test_prefixed_opcodes() {
        // ceq; ldftn <token 0x06000001>
        let il = [0xfe, 0x01, 0xfe, 0x06, 0x01, 0x00, 0x00, 0x06];
        let mut r = InstrReader::new(&il);
        assert_eq!(
            r.read().unwrap(),
            Instr::Compare {
                cond: CmpCond::Eq,
                unsigned: false
            }
        );
        assert_eq!(r.read().unwrap(), Instr::LoadFtn(0x0600_0001));
    }

    #[test]
    fn test_truncated_operand() {
        let il = [0x20, 0x01, 0x02];
        let mut r = InstrReader::new(&il);
        assert!(matches!(
            r.read(),
            Err(Error::UnexpectedEof { offset: 1, .. })
        ));
    }

    #[test]
    fn test_unknown_opcode() {
        let il = [0x24];
        let mut r = InstrReader::new(&il);
        assert!(matches!(
            r.read(),
            Err(Error::UnknownOpcode {
                byte: 0x24,
                offset: 0
            })
        ));
    }
}
