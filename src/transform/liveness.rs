//! Register liveness
//!
//! Standard backward dataflow: a register is live at a point if some path from that point reads
//! it before writing it. Blocks are solved to a fixed point in postorder (successors before
//! predecessors), then each block is walked backwards once more to record the live-out set of
//! every instruction.
//!
//! Exception edges need care: a throwing instruction does not write its destination, so the
//! live-in of its handlers is live right *before* it, not just after.

use super::{ends_with_may_throw, Block, EntryId, FatMethod, PostOrderSort};
use crate::dex::DexInstruction;
use crate::util::BitSet;
use std::collections::HashMap;

/// Set of live registers
pub type Liveness = BitSet;

/// Live-out set of every instruction of a method (as of the time it was computed)
#[derive(Debug)]
pub struct LivenessMap {
    live_out: HashMap<EntryId, Liveness>,
}

fn uses(insn: &DexInstruction) -> impl Iterator<Item = usize> + '_ {
    insn.srcs().iter().map(|reg| *reg as usize)
}

/// Live set right before `insn`, given the live set right after it
fn transfer(insn: &DexInstruction, live: &mut Liveness, handlers_live_in: Option<&Liveness>) {
    if let Some(dest) = insn.dest() {
        live.remove(dest as usize);
    }
    for reg in uses(insn) {
        live.insert(reg);
    }
    if let Some(handlers) = handlers_live_in {
        live.union_with(handlers);
    }
}

impl LivenessMap {
    pub fn compute(method: &FatMethod, blocks: &[Block]) -> LivenessMap {
        let block_entries: Vec<Vec<EntryId>> =
            blocks.iter().map(|block| block.entries(method)).collect();

        let mut order = PostOrderSort::new(blocks).get();
        let mut reached = vec![false; blocks.len()];
        for block in &order {
            reached[*block] = true;
        }
        order.extend((0..blocks.len()).filter(|block| !reached[*block]));

        let mut live_in: Vec<Liveness> = vec![Liveness::new(); blocks.len()];
        let mut changed = true;
        let mut rounds = 0;
        while changed {
            changed = false;
            rounds += 1;
            for block in &order {
                let (out, handlers) = Self::block_out(blocks, &live_in, *block, method);
                let live = Self::walk_block(
                    method,
                    &block_entries[*block],
                    out,
                    handlers.as_ref(),
                    |_, _| (),
                );
                if live_in[*block].union_with(&live) {
                    changed = true;
                }
            }
        }
        log::trace!("Liveness converged after {} round(s)", rounds);

        let mut live_out = HashMap::new();
        for block in &order {
            let (out, handlers) = Self::block_out(blocks, &live_in, *block, method);
            Self::walk_block(
                method,
                &block_entries[*block],
                out,
                handlers.as_ref(),
                |id, live| {
                    live_out.insert(id, live.clone());
                },
            );
        }
        LivenessMap { live_out }
    }

    /// Live-out of a block, and the handler live-in if the block ends with an exception edge
    fn block_out(
        blocks: &[Block],
        live_in: &[Liveness],
        block: usize,
        method: &FatMethod,
    ) -> (Liveness, Option<Liveness>) {
        let mut out = Liveness::new();
        let mut handlers: Option<Liveness> = None;
        for succ in &blocks[block].succs {
            out.union_with(&live_in[*succ]);
            if blocks[*succ].is_catch() {
                handlers
                    .get_or_insert_with(Liveness::new)
                    .union_with(&live_in[*succ]);
            }
        }
        if !ends_with_may_throw(method, &blocks[block]) {
            handlers = None;
        }
        (out, handlers)
    }

    /// Walk a block backwards from its live-out, reporting the live-out of every instruction
    fn walk_block(
        method: &FatMethod,
        entries: &[EntryId],
        mut live: Liveness,
        handlers: Option<&Liveness>,
        mut record: impl FnMut(EntryId, &Liveness),
    ) -> Liveness {
        let mut last_insn = true;
        for id in entries.iter().rev() {
            if let Some(insn) = method[*id].insn() {
                record(*id, &live);
                let handlers = if last_insn { handlers } else { None };
                transfer(insn, &mut live, handlers);
                last_insn = false;
            }
        }
        live
    }

    /// Live registers right after `insn` (`None` if the instruction was not in the method when
    /// the map was computed)
    pub fn live_out(&self, insn: EntryId) -> Option<&Liveness> {
        self.live_out.get(&insn)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dex::{DexCatch, DexCode, DexOpcode, DexTryItem, Reg};
    use crate::transform::{balloon, build_cfg};

    fn encode(insns: &[DexInstruction]) -> Vec<u16> {
        let mut out = vec![];
        for insn in insns {
            insn.encode(&mut out);
        }
        out
    }

    fn regs(live: &Liveness) -> Vec<Reg> {
        live.iter().map(|r| r as Reg).collect()
    }

    fn insn_ids(method: &FatMethod) -> Vec<EntryId> {
        method
            .iter()
            .filter(|(_, entry)| entry.is_opcode())
            .map(|(id, _)| id)
            .collect()
    }

    #[test]
    fn straight_line() {
        // 0: const/4 v0, 1 / 1: add-int v1, v0, v2 / 3: return v1
        let code = DexCode::new(
            3,
            1,
            encode(&[
                DexInstruction::new(DexOpcode::Const4).with_dest(0).with_literal(1),
                DexInstruction::new(DexOpcode::AddInt)
                    .with_dest(1)
                    .with_srcs(vec![0, 2]),
                DexInstruction::new(DexOpcode::Return).with_srcs(vec![1]),
            ]),
        );
        let method = balloon(&code).unwrap();
        let blocks = build_cfg(&method);
        let liveness = LivenessMap::compute(&method, &blocks);
        let ids = insn_ids(&method);
        assert_eq!(regs(liveness.live_out(ids[0]).unwrap()), vec![0, 2]);
        assert_eq!(regs(liveness.live_out(ids[1]).unwrap()), vec![1]);
        assert!(liveness.live_out(ids[2]).unwrap().is_empty());
    }

    #[test]
    fn loop_keeps_counter_live() {
        // 0: add-int/lit8 v0, v0, -1 / 2: if-nez v0, -2 / 4: return v1
        let mut branch = DexInstruction::new(DexOpcode::IfNez).with_srcs(vec![0]);
        branch.set_offset(-2);
        let code = DexCode::new(
            2,
            2,
            encode(&[
                DexInstruction::new(DexOpcode::AddIntLit8)
                    .with_dest(0)
                    .with_srcs(vec![0])
                    .with_literal(-1),
                branch,
                DexInstruction::new(DexOpcode::Return).with_srcs(vec![1]),
            ]),
        );
        let method = balloon(&code).unwrap();
        let blocks = build_cfg(&method);
        let liveness = LivenessMap::compute(&method, &blocks);
        let ids = insn_ids(&method);
        assert_eq!(regs(liveness.live_out(ids[0]).unwrap()), vec![0, 1]);
        assert_eq!(regs(liveness.live_out(ids[1]).unwrap()), vec![0, 1]);
    }

    #[test]
    fn handler_reads_are_live_across_throwing_writes() {
        // 0: const/4 v1, 1 / try { 1: sget v0 } / 3: return v1 / catch-all { 4: return v0 }
        let code = DexCode {
            tries: vec![DexTryItem {
                start_addr: 1,
                insn_count: 2,
                catches: vec![DexCatch {
                    catch_type: None,
                    handler_addr: 4,
                }],
            }],
            ..DexCode::new(
                2,
                0,
                encode(&[
                    DexInstruction::new(DexOpcode::Const4).with_dest(1).with_literal(1),
                    DexInstruction::new(DexOpcode::Sget).with_dest(0).with_index(0),
                    DexInstruction::new(DexOpcode::Return).with_srcs(vec![1]),
                    DexInstruction::new(DexOpcode::Return).with_srcs(vec![0]),
                ]),
            )
        };
        let method = balloon(&code).unwrap();
        let blocks = build_cfg(&method);
        let liveness = LivenessMap::compute(&method, &blocks);
        let ids = insn_ids(&method);

        // If the sget throws, v0 still holds whatever it held before
        assert_eq!(regs(liveness.live_out(ids[0]).unwrap()), vec![0, 1]);
        assert_eq!(regs(liveness.live_out(ids[1]).unwrap()), vec![0, 1]);
        assert_eq!(regs(liveness.live_out(ids[2]).unwrap()), Vec::<Reg>::new());
    }

    #[test]
    fn unknown_instructions_are_not_answered() {
        let code = DexCode::new(1, 0, vec![0x000e]);
        let mut method = balloon(&code).unwrap();
        let blocks = build_cfg(&method);
        let liveness = LivenessMap::compute(&method, &blocks);
        let added = method.push_back(crate::transform::MethodItemEntry::opcode(
            DexInstruction::new(DexOpcode::Nop),
        ));
        assert!(liveness.live_out(added).is_none());
    }
}
