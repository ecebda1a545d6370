//! Basic-block discovery.
//!
//! One linear decode collects instruction boundaries and the offsets that
//! must start a block: the method entry, every branch and switch target,
//! the instruction after every terminator, and the boundaries of each
//! protected region. Targets that miss an instruction boundary are
//! malformed input, not a crash.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use cilbc::{Instr, InstrReader, MethodBody};

use crate::error::{CompileError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicBlock {
    pub start: u32,
    /// Exclusive end: the next block start or the end of the stream.
    pub end: u32,
}

#[derive(Debug)]
pub struct Cfg {
    blocks: BTreeMap<u32, BasicBlock>,
    il_len: u32,
}

impl Cfg {
    pub fn build(body: &MethodBody) -> Result<Cfg> {
        let il_len = body.il.len() as u32;
        if il_len == 0 {
            return Err(CompileError::InvalidProgram("empty method body".into()));
        }

        let mut boundaries = BTreeSet::new();
        let mut starts = BTreeSet::new();
        let mut targets: Vec<u32> = Vec::new();
        starts.insert(0);

        let mut reader = InstrReader::new(&body.il);
        while !reader.done() {
            boundaries.insert(reader.offset());
            let instr = reader.read()?;
            match &instr {
                Instr::Branch(t) | Instr::Leave(t) => {
                    targets.push(*t);
                    starts.insert(reader.offset());
                }
                Instr::BranchTrue(t)
                | Instr::BranchFalse(t)
                | Instr::BranchCmp { target: t, .. } => {
                    targets.push(*t);
                    starts.insert(reader.offset());
                }
                Instr::Switch(ts) => {
                    targets.extend(ts.iter().copied());
                    starts.insert(reader.offset());
                }
                Instr::Ret
                | Instr::Throw
                | Instr::Rethrow
                | Instr::EndFinally
                | Instr::EndFilter
                | Instr::Jmp(_) => {
                    starts.insert(reader.offset());
                }
                _ => {}
            }
        }

        for region in &body.regions {
            targets.push(region.try_offset);
            targets.push(region.handler_offset);
            if region.kind == cilbc::RegionKind::Filter {
                targets.push(region.class_token_or_filter);
            }
        }

        for t in targets {
            if t >= il_len || !boundaries.contains(&t) {
                return Err(CompileError::InvalidProgram(format!(
                    "branch target {t:#x} is not an instruction boundary"
                )));
            }
            starts.insert(t);
        }

        // A start recorded at il_len means the stream falls through the end.
        starts.remove(&il_len);

        let mut blocks = BTreeMap::new();
        let ordered: Vec<u32> = starts.iter().copied().collect();
        for (i, &start) in ordered.iter().enumerate() {
            let end = ordered.get(i + 1).copied().unwrap_or(il_len);
            blocks.insert(start, BasicBlock { start, end });
        }
        Ok(Cfg { blocks, il_len })
    }

    pub fn il_len(&self) -> u32 {
        self.il_len
    }

    /// The block starting exactly at `offset`.
    pub fn at(&self, offset: u32) -> Result<BasicBlock> {
        self.blocks.get(&offset).copied().ok_or_else(|| {
            CompileError::InvalidProgram(format!("no block starts at offset {offset:#x}"))
        })
    }

    pub fn contains_start(&self, offset: u32) -> bool {
        self.blocks.contains_key(&offset)
    }

    pub fn starts(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cilbc::MethodBody;

    fn body(il: &[u8]) -> MethodBody {
        MethodBody {
            il: il.to_vec(),
            locals: vec![],
            init_locals: false,
            regions: vec![],
            max_stack: 8,
        }
    }

    #[test]
    fn test_splits_at_branch_and_target() {
        // 0: br.s -> 4; 2: nop; 3: nop; 4: ret
        let cfg = Cfg::build(&body(&[0x2b, 0x02, 0x00, 0x00, 0x2a])).unwrap();
        let starts: Vec<u32> = cfg.starts().collect();
        assert_eq!(starts, vec![0, 2, 4]);
        assert_eq!(cfg.at(2).unwrap().end, 4);
        assert_eq!(cfg.at(4).unwrap().end, 5);
    }

    #[test]
    fn test_rejects_misaligned_target() {
        // 0: br.s -> 1 (into the middle of the operand of ldc.i4)
        // 2: ldc.i4 <imm>; 7: ret -- target 1 is not a boundary
        let r = Cfg::build(&body(&[0x2b, 0xff, 0x00, 0x2a]));
        assert!(matches!(r, Err(CompileError::InvalidProgram(_))));
    }

    #[test]
    fn test_rejects_out_of_range_target() {
        let r = Cfg::build(&body(&[0x2b, 0x7f, 0x2a]));
        assert!(matches!(r, Err(CompileError::InvalidProgram(_))));
    }

    #[test]
    fn test_region_boundaries_start_blocks() {
        // 0: nop; 1: nop; 2: ret
        let mut b = body(&[0x00, 0x00, 0x2a]);
        b.regions.push(cilbc::ExceptionRegion {
            kind: cilbc::RegionKind::Finally,
            try_offset: 0,
            try_length: 1,
            handler_offset: 1,
            handler_length: 1,
            class_token_or_filter: 0,
        });
        let cfg = Cfg::build(&b).unwrap();
        assert!(cfg.contains_start(1));
    }
}
