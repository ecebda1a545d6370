use crate::error::{Error, Result};

/// Raw opcodes, one variant per encoding (short forms are distinct variants).
///
/// Two-byte opcodes (the `0xfe` page) are listed after `ConvU`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    Break,
    Ldarg0,
    Ldarg1,
    Ldarg2,
    Ldarg3,
    Ldloc0,
    Ldloc1,
    Ldloc2,
    Ldloc3,
    Stloc0,
    Stloc1,
    Stloc2,
    Stloc3,
    LdargS,
    LdargaS,
    StargS,
    LdlocS,
    LdlocaS,
    StlocS,
    Ldnull,
    LdcI4M1,
    LdcI40,
    LdcI41,
    LdcI42,
    LdcI43,
    LdcI44,
    LdcI45,
    LdcI46,
    LdcI47,
    LdcI48,
    LdcI4S,
    LdcI4,
    LdcI8,
    LdcR4,
    LdcR8,
    Dup,
    Pop,
    Jmp,
    Call,
    Calli,
    Ret,
    BrS,
    BrfalseS,
    BrtrueS,
    BeqS,
    BgeS,
    BgtS,
    BleS,
    BltS,
    BneUnS,
    BgeUnS,
    BgtUnS,
    BleUnS,
    BltUnS,
    Br,
    Brfalse,
    Brtrue,
    Beq,
    Bge,
    Bgt,
    Ble,
    Blt,
    BneUn,
    BgeUn,
    BgtUn,
    BleUn,
    BltUn,
    Switch,
    LdindI1,
    LdindU1,
    LdindI2,
    LdindU2,
    LdindI4,
    LdindU4,
    LdindI8,
    LdindI,
    LdindR4,
    LdindR8,
    LdindRef,
    StindRef,
    StindI1,
    StindI2,
    StindI4,
    StindI8,
    StindR4,
    StindR8,
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    Neg,
    Not,
    ConvI1,
    ConvI2,
    ConvI4,
    ConvI8,
    ConvR4,
    ConvR8,
    ConvU4,
    ConvU8,
    Callvirt,
    Cpobj,
    Ldobj,
    Ldstr,
    Newobj,
    Castclass,
    Isinst,
    ConvRUn,
    Unbox,
    Throw,
    Ldfld,
    Ldflda,
    Stfld,
    Ldsfld,
    Ldsflda,
    Stsfld,
    Stobj,
    ConvOvfI1Un,
    ConvOvfI2Un,
    ConvOvfI4Un,
    ConvOvfI8Un,
    ConvOvfU1Un,
    ConvOvfU2Un,
    ConvOvfU4Un,
    ConvOvfU8Un,
    ConvOvfIUn,
    ConvOvfUUn,
    Box,
    Newarr,
    Ldlen,
    Ldelema,
    LdelemI1,
    LdelemU1,
    LdelemI2,
    LdelemU2,
    LdelemI4,
    LdelemU4,
    LdelemI8,
    LdelemI,
    LdelemR4,
    LdelemR8,
    LdelemRef,
    StelemI,
    StelemI1,
    StelemI2,
    StelemI4,
    StelemI8,
    StelemR4,
    StelemR8,
    StelemRef,
    Ldelem,
    Stelem,
    UnboxAny,
    ConvOvfI1,
    ConvOvfU1,
    ConvOvfI2,
    ConvOvfU2,
    ConvOvfI4,
    ConvOvfU4,
    ConvOvfI8,
    ConvOvfU8,
    Refanyval,
    Ckfinite,
    Mkrefany,
    Ldtoken,
    ConvU2,
    ConvU1,
    ConvI,
    ConvOvfI,
    ConvOvfU,
    AddOvf,
    AddOvfUn,
    MulOvf,
    MulOvfUn,
    SubOvf,
    SubOvfUn,
    Endfinally,
    Leave,
    LeaveS,
    StindI,
    ConvU,
    // 0xfe page
    Arglist,
    Ceq,
    Cgt,
    CgtUn,
    Clt,
    CltUn,
    Ldftn,
    Ldvirtftn,
    Ldarg,
    Ldarga,
    Starg,
    Ldloc,
    Ldloca,
    Stloc,
    Localloc,
    Endfilter,
    Unaligned,
    Volatile,
    Tail,
    Initobj,
    Constrained,
    Cpblk,
    Initblk,
    No,
    Rethrow,
    Sizeof,
    Refanytype,
    Readonly,
}

impl Opcode {
    /// Decode a one-byte opcode. `0xfe` is not valid here; callers must
    /// route the second byte through [`Opcode::from_prefixed`].
    pub fn from_byte(byte: u8, offset: usize) -> Result<Opcode> {
        use Opcode::*;
        Ok(match byte {
            0x00 => Nop,
            0x01 => Break,
            0x02 => Ldarg0,
            0x03 => Ldarg1,
            0x04 => Ldarg2,
            0x05 => Ldarg3,
            0x06 => Ldloc0,
            0x07 => Ldloc1,
            0x08 => Ldloc2,
            0x09 => Ldloc3,
            0x0a => Stloc0,
            0x0b => Stloc1,
            0x0c => Stloc2,
            0x0d => Stloc3,
            0x0e => LdargS,
            0x0f => LdargaS,
            0x10 => StargS,
            0x11 => LdlocS,
            0x12 => LdlocaS,
            0x13 => StlocS,
            0x14 => Ldnull,
            0x15 => LdcI4M1,
            0x16 => LdcI40,
            0x17 => LdcI41,
            0x18 => LdcI42,
            0x19 => LdcI43,
            0x1a => LdcI44,
            0x1b => LdcI45,
            0x1c => LdcI46,
            0x1d => LdcI47,
            0x1e => LdcI48,
            0x1f => LdcI4S,
            0x20 => LdcI4,
            0x21 => LdcI8,
            0x22 => LdcR4,
            0x23 => LdcR8,
            0x25 => Dup,
            0x26 => Pop,
            0x27 => Jmp,
            0x28 => Call,
            0x29 => Calli,
            0x2a => Ret,
            0x2b => BrS,
            0x2c => BrfalseS,
            0x2d => BrtrueS,
            0x2e => BeqS,
            0x2f => BgeS,
            0x30 => BgtS,
            0x31 => BleS,
            0x32 => BltS,
            0x33 => BneUnS,
            0x34 => BgeUnS,
            0x35 => BgtUnS,
            0x36 => BleUnS,
            0x37 => BltUnS,
            0x38 => Br,
            0x39 => Brfalse,
            0x3a => Brtrue,
            0x3b => Beq,
            0x3c => Bge,
            0x3d => Bgt,
            0x3e => Ble,
            0x3f => Blt,
            0x40 => BneUn,
            0x41 => BgeUn,
            0x42 => BgtUn,
            0x43 => BleUn,
            0x44 => BltUn,
            0x45 => Switch,
            0x46 => LdindI1,
            0x47 => LdindU1,
            0x48 => LdindI2,
            0x49 => LdindU2,
            0x4a => LdindI4,
            0x4b => LdindU4,
            0x4c => LdindI8,
            0x4d => LdindI,
            0x4e => LdindR4,
            0x4f => LdindR8,
            0x50 => LdindRef,
            0x51 => StindRef,
            0x52 => StindI1,
            0x53 => StindI2,
            0x54 => StindI4,
            0x55 => StindI8,
            0x56 => StindR4,
            0x57 => StindR8,
            0x58 => Add,
            0x59 => Sub,
            0x5a => Mul,
            0x5b => Div,
            0x5c => DivUn,
            0x5d => Rem,
            0x5e => RemUn,
            0x5f => And,
            0x60 => Or,
            0x61 => Xor,
            0x62 => Shl,
            0x63 => Shr,
            0x64 => ShrUn,
            0x65 => Neg,
            0x66 => Not,
            0x67 => ConvI1,
            0x68 => ConvI2,
            0x69 => ConvI4,
            0x6a => ConvI8,
            0x6b => ConvR4,
            0x6c => ConvR8,
            0x6d => ConvU4,
            0x6e => ConvU8,
            0x6f => Callvirt,
            0x70 => Cpobj,
            0x71 => Ldobj,
            0x72 => Ldstr,
            0x73 => Newobj,
            0x74 => Castclass,
            0x75 => Isinst,
            0x76 => ConvRUn,
            0x79 => Unbox,
            0x7a => Throw,
            0x7b => Ldfld,
            0x7c => Ldflda,
            0x7d => Stfld,
            0x7e => Ldsfld,
            0x7f => Ldsflda,
            0x80 => Stsfld,
            0x81 => Stobj,
            0x82 => ConvOvfI1Un,
            0x83 => ConvOvfI2Un,
            0x84 => ConvOvfI4Un,
            0x85 => ConvOvfI8Un,
            0x86 => ConvOvfU1Un,
            0x87 => ConvOvfU2Un,
            0x88 => ConvOvfU4Un,
            0x89 => ConvOvfU8Un,
            0x8a => ConvOvfIUn,
            0x8b => ConvOvfUUn,
            0x8c => Box,
            0x8d => Newarr,
            0x8e => Ldlen,
            0x8f => Ldelema,
            0x90 => LdelemI1,
            0x91 => LdelemU1,
            0x92 => LdelemI2,
            0x93 => LdelemU2,
            0x94 => LdelemI4,
            0x95 => LdelemU4,
            0x96 => LdelemI8,
            0x97 => LdelemI,
            0x98 => LdelemR4,
            0x99 => LdelemR8,
            0x9a => LdelemRef,
            0x9b => StelemI,
            0x9c => StelemI1,
            0x9d => StelemI2,
            0x9e => StelemI4,
            0x9f => StelemI8,
            0xa0 => StelemR4,
            0xa1 => StelemR8,
            0xa2 => StelemRef,
            0xa3 => Ldelem,
            0xa4 => Stelem,
            0xa5 => UnboxAny,
            0xb3 => ConvOvfI1,
            0xb4 => ConvOvfU1,
            0xb5 => ConvOvfI2,
            0xb6 => ConvOvfU2,
            0xb7 => ConvOvfI4,
            0xb8 => ConvOvfU4,
            0xb9 => ConvOvfI8,
            0xba => ConvOvfU8,
            0xc2 => Refanyval,
            0xc3 => Ckfinite,
            0xc6 => Mkrefany,
            0xd0 => Ldtoken,
            0xd1 => ConvU2,
            0xd2 => ConvU1,
            0xd3 => ConvI,
            0xd4 => ConvOvfI,
            0xd5 => ConvOvfU,
            0xd6 => AddOvf,
            0xd7 => AddOvfUn,
            0xd8 => MulOvf,
            0xd9 => MulOvfUn,
            0xda => SubOvf,
            0xdb => SubOvfUn,
            0xdc => Endfinally,
            0xdd => Leave,
            0xde => LeaveS,
            0xdf => StindI,
            0xe0 => ConvU,
            _ => return Err(Error::UnknownOpcode { byte, offset }),
        })
    }

    /// Decode the second byte of a `0xfe`-prefixed opcode.
    pub fn from_prefixed(byte: u8, offset: usize) -> Result<Opcode> {
        use Opcode::*;
        Ok(match byte {
            0x00 => Arglist,
            0x01 => Ceq,
            0x02 => Cgt,
            0x03 => CgtUn,
            0x04 => Clt,
            0x05 => CltUn,
            0x06 => Ldftn,
            0x07 => Ldvirtftn,
            0x09 => Ldarg,
            0x0a => Ldarga,
            0x0b => Starg,
            0x0c => Ldloc,
            0x0d => Ldloca,
            0x0e => Stloc,
            0x0f => Localloc,
            0x11 => Endfilter,
            0x12 => Unaligned,
            0x13 => Volatile,
            0x14 => Tail,
            0x15 => Initobj,
            0x16 => Constrained,
            0x17 => Cpblk,
            0x18 => Initblk,
            0x19 => No,
            0x1a => Rethrow,
            0x1c => Sizeof,
            0x1d => Refanytype,
            0x1e => Readonly,
            _ => return Err(Error::UnknownPrefixedOpcode { byte, offset }),
        })
    }
}
