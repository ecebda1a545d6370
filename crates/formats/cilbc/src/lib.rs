//! Decoder for stack-machine bytecode method bodies.
//!
//! The byte stream uses the ECMA-335 instruction encoding: one-byte opcodes
//! with a `0xfe` page for the extended set, little-endian operands, and
//! branch displacements relative to the following instruction. The reader
//! normalizes macro encodings (`ldloc.0`, `ldc.i4.s`, short branches) into
//! a single data-carrying [`Instr`] form, which is what the backend lowers.

pub mod body;
pub mod error;
pub mod instr;
pub mod opcode;

pub use body::{ExceptionRegion, MethodBody, RegionKind};
pub use error::{Error, Result};
pub use instr::{BinOp, CmpCond, ConvTarget, Instr, InstrReader, MemKind};
pub use opcode::Opcode;
