//! Re-encode a [`FatMethod`]
//!
//! Encoding is a fixed point: addresses depend on instruction sizes, while the size an instruction
//! needs depends on the distances to its targets. [`try_sync`] makes one pass, growing whatever
//! does not fit, and [`sync`] repeats it until nothing changes.
//!
//! ### Termination
//!
//! Growth is monotonic. An instruction only ever moves to a wider opcode in its family, and a
//! conditional branch that cannot reach its target is rewritten exactly once:
//!
//! ```text,ignore,no_run
//!     if-eqz v0, L1             if-nez v0, L2
//!     ...               =>      goto/32 L1
//!                           L2: ...
//! ```
//!
//! after which the (tiny, fixed) offset of the inverted branch always fits and the new `goto/32`
//! never needs to grow. So the number of passes is bounded by the number of instructions that can
//! still grow.

use super::{
    catch_chain, BranchTargetType, EntryId, FatMethod, MethodItem, MethodItemEntry, TryEntryType,
};
use crate::dex::{
    DebugEntryKind, DexCatch, DexCode, DexDebugEntry, DexDebugItem, DexInstruction, DexOpcode,
    DexTryItem,
};
use std::collections::HashMap;

/// Register frame and debug header of a method, carried next to its IR
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,

    /// Initial line of the debug program (`None` if the method has none)
    pub line_start: Option<u32>,
}

impl Frame {
    pub fn empty() -> Frame {
        Frame {
            registers_size: 0,
            ins_size: 0,
            outs_size: 0,
            line_start: None,
        }
    }

    pub fn of_code(code: &DexCode) -> Frame {
        Frame {
            registers_size: code.registers_size,
            ins_size: code.ins_size,
            outs_size: code.outs_size,
            line_start: code.debug_item.as_ref().map(|debug| debug.line_start),
        }
    }
}

/// Assign addresses to every node, returning the size of the code in code units
fn assign_addresses(method: &mut FatMethod) -> u32 {
    let mut addr = 0;
    let mut cursor = method.first();
    while let Some(id) = cursor {
        let entry = &mut method[id];
        entry.addr = addr;
        addr += entry.size();
        cursor = method.next(id);
    }
    addr
}

/// One relaxation pass
///
/// Returns `true` if the current encoding choices are all valid (the method can be encoded as is)
/// and `false` if something had to grow, in which case addresses are stale and another pass is
/// needed.
pub fn try_sync(method: &mut FatMethod) -> bool {
    let mut converged = true;

    // Register and literal operands
    for id in method.ids() {
        if let Some(insn) = method[id].insn_mut() {
            while !insn.fits_operands() {
                assert!(insn.widen(), "operands of {:?} cannot be encoded", insn);
                converged = false;
            }
        }
    }

    assign_addresses(method);

    // Branch offsets
    let mut widen_goto: Vec<EntryId> = vec![];
    let mut rewrite_branch: Vec<(EntryId, EntryId)> = vec![];
    for (target_id, entry) in method.iter() {
        let target = match &entry.item {
            MethodItem::Target(target) if target.kind == BranchTargetType::Simple => target,
            _ => continue,
        };
        let src = &method[target.src];
        let insn = match src.insn() {
            Some(insn) => insn,
            None => panic!("branch target {:?} sourced from non-instruction", target_id),
        };
        let offset = entry.addr as i64 - src.addr as i64;
        if insn.branch_offset_fits(offset) {
            continue;
        }
        if insn.opcode().is_goto() {
            widen_goto.push(target.src);
        } else if insn.opcode().is_conditional() {
            rewrite_branch.push((target.src, target_id));
        } else {
            panic!("simple target for {}", insn.opcode());
        }
    }

    for goto in widen_goto {
        converged = false;
        if let Some(insn) = method[goto].insn_mut() {
            let widened = insn.widen();
            debug_assert!(widened, "goto/32 reaches everything");
        }
    }

    for (branch, target) in rewrite_branch {
        converged = false;
        let branch_insn = match method[branch].insn_mut() {
            Some(insn) => insn,
            None => unreachable!("checked above"),
        };
        let inverted = match branch_insn.opcode().inverted() {
            Some(inverted) => inverted,
            None => unreachable!("conditional branches invert"),
        };
        branch_insn.set_opcode(inverted);
        log::trace!("Rewriting oversized {:?} into {} over goto/32", branch, inverted);

        let goto = method.insert_after(
            Some(branch),
            MethodItemEntry::opcode(DexInstruction::new(DexOpcode::Goto32)),
        );
        method.insert_after(
            Some(goto),
            MethodItemEntry::target(BranchTargetType::Simple, branch),
        );
        if let MethodItem::Target(old_target) = &mut method[target].item {
            old_target.src = goto;
        }
    }

    converged
}

/// Relax and encode
///
/// `frame.outs_size` is recomputed from the invokes in the method.
pub fn sync(method: &mut FatMethod, frame: &mut Frame) -> DexCode {
    let mut passes = 1;
    while !try_sync(method) {
        passes += 1;
    }
    log::debug!("Encoding converged after {} pass(es)", passes);
    let code_size = assign_addresses(method);

    // Targets of every branch, by source
    let mut simple_targets: HashMap<EntryId, u32> = HashMap::new();
    let mut case_targets: HashMap<EntryId, Vec<(u32, u32)>> = HashMap::new();
    for (_, entry) in method.iter() {
        if let MethodItem::Target(target) = &entry.item {
            match target.kind {
                BranchTargetType::Simple => {
                    simple_targets.insert(target.src, entry.addr);
                }
                BranchTargetType::Multi(case) => {
                    case_targets
                        .entry(target.src)
                        .or_default()
                        .push((case, entry.addr));
                }
            }
        }
    }

    // Instructions
    let mut insns: Vec<u16> = Vec::with_capacity(code_size as usize);
    let mut switches = vec![];
    let mut outs_size = 0;
    for (id, entry) in method.iter() {
        let insn = match entry.insn() {
            Some(insn) => insn,
            None => continue,
        };
        let opcode = insn.opcode();
        if opcode.is_invoke() {
            outs_size = outs_size.max(insn.srcs().len() as u16);
        }
        if opcode.is_goto() || opcode.is_conditional() {
            let target = match simple_targets.get(&id) {
                Some(target) => *target,
                None => panic!("{} at {:#x} has no target", opcode, entry.addr),
            };
            let mut insn = insn.clone();
            insn.set_offset((target as i64 - entry.addr as i64) as i32);
            insn.encode(&mut insns);
        } else if opcode.is_switch() {
            let keys = match insn.switch_keys() {
                Some(keys) => keys,
                None => panic!("{} at {:#x} has no keys", opcode, entry.addr),
            };
            let mut cases = vec![None; keys.len()];
            for (case, addr) in case_targets.get(&id).into_iter().flatten() {
                cases[*case as usize] = Some(*addr as i64 - entry.addr as i64);
            }
            let relative: Vec<i32> = cases
                .into_iter()
                .enumerate()
                .map(|(case, target)| match target {
                    Some(target) => target as i32,
                    None => panic!("case {} of switch at {:#x} has no target", case, entry.addr),
                })
                .collect();
            switches.push((entry.addr, keys.clone(), relative));
            insn.encode(&mut insns);
        } else {
            insn.encode(&mut insns);
        }
    }
    assert_eq!(insns.len() as u32, code_size, "encoded size disagrees with addresses");

    // Payloads, 4-byte aligned after the code
    for (switch_addr, keys, relative) in switches {
        if insns.len() % 2 == 1 {
            insns.push(DexOpcode::Nop.value() as u16);
        }
        let payload_offset = insns.len() as u32 - switch_addr;
        insns[switch_addr as usize + 1] = payload_offset as u16;
        insns[switch_addr as usize + 2] = (payload_offset >> 16) as u16;
        keys.encode_payload(&relative, &mut insns);
    }

    // Try items
    let mut tries = vec![];
    let mut open: Option<(u32, EntryId)> = None;
    for (_, entry) in method.iter() {
        let try_entry = match &entry.item {
            MethodItem::Try(try_entry) => try_entry,
            _ => continue,
        };
        match try_entry.kind {
            TryEntryType::Start => {
                assert!(open.is_none(), "nested try region at {:#x}", entry.addr);
                open = Some((entry.addr, try_entry.catch_start));
            }
            TryEntryType::End => {
                let (start, catch_start) = match open.take() {
                    Some(open) => open,
                    None => panic!("try region end at {:#x} without start", entry.addr),
                };
                let catches: Vec<DexCatch> = catch_chain(method, catch_start)
                    .into_iter()
                    .map(|catch| match &method[catch].item {
                        MethodItem::Catch(catch_entry) => DexCatch {
                            catch_type: catch_entry.catch_type,
                            handler_addr: method[catch].addr,
                        },
                        _ => unreachable!("catch_chain only yields catch entries"),
                    })
                    .collect();

                let mut start_addr = start;
                while start_addr < entry.addr {
                    let insn_count = (entry.addr - start_addr).min(u16::MAX as u32) as u16;
                    tries.push(DexTryItem {
                        start_addr,
                        insn_count,
                        catches: catches.clone(),
                    });
                    start_addr += insn_count as u32;
                }
            }
        }
    }
    assert!(open.is_none(), "unterminated try region");

    // Debug program
    let debug_entries: Vec<DexDebugEntry> = method
        .iter()
        .filter_map(|(_, entry)| {
            let kind = match &entry.item {
                MethodItem::Debug(insn) => DebugEntryKind::Instruction(insn.clone()),
                MethodItem::Position(pos) => DebugEntryKind::Position(pos.clone()),
                _ => return None,
            };
            Some(DexDebugEntry {
                addr: entry.addr,
                kind,
            })
        })
        .collect();
    let debug_item = match frame.line_start {
        Some(line_start) => Some(DexDebugItem {
            line_start,
            entries: debug_entries,
        }),
        None if !debug_entries.is_empty() => Some(DexDebugItem {
            line_start: 0,
            entries: debug_entries,
        }),
        None => None,
    };

    frame.outs_size = outs_size;
    DexCode {
        registers_size: frame.registers_size,
        ins_size: frame.ins_size,
        outs_size,
        insns,
        tries,
        debug_item,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dex::{DexPosition, SwitchKeys, TypeId};
    use crate::transform::balloon;

    fn encode(insns: &[DexInstruction]) -> Vec<u16> {
        let mut out = vec![];
        for insn in insns {
            insn.encode(&mut out);
        }
        out
    }

    fn opcodes(method: &FatMethod) -> Vec<DexOpcode> {
        method
            .iter()
            .filter_map(|(_, entry)| entry.insn())
            .map(|insn| insn.opcode())
            .collect()
    }

    /// ```text
    /// 0: const/4 v0, 0
    /// 1: packed-switch v0, +7
    /// 4: return-void
    /// 5: return-void        (case 0)
    /// 6: return-void        (case 1, catch-all)
    /// 7: nop
    /// 8: packed-switch-payload
    /// ```
    /// with a try region over `[0, 4)`.
    fn canonical_code() -> DexCode {
        let mut switch = DexInstruction::new(DexOpcode::PackedSwitch).with_srcs(vec![0]);
        switch.set_offset(7);
        let mut insns = encode(&[
            DexInstruction::new(DexOpcode::Const4).with_dest(0),
            switch,
            DexInstruction::new(DexOpcode::ReturnVoid),
            DexInstruction::new(DexOpcode::ReturnVoid),
            DexInstruction::new(DexOpcode::ReturnVoid),
        ]);
        insns.push(0);
        SwitchKeys::Packed {
            first_key: 0,
            size: 2,
        }
        .encode_payload(&[4, 5], &mut insns);

        let mut code = DexCode::new(1, 0, insns);
        code.tries.push(DexTryItem {
            start_addr: 0,
            insn_count: 4,
            catches: vec![
                DexCatch {
                    catch_type: Some(TypeId(2)),
                    handler_addr: 5,
                },
                DexCatch {
                    catch_type: None,
                    handler_addr: 6,
                },
            ],
        });
        code.debug_item = Some(DexDebugItem {
            line_start: 10,
            entries: vec![
                DexDebugEntry {
                    addr: 0,
                    kind: DebugEntryKind::Position(DexPosition {
                        line: 10,
                        source_file: None,
                    }),
                },
                DexDebugEntry {
                    addr: 4,
                    kind: DebugEntryKind::Position(DexPosition {
                        line: 11,
                        source_file: None,
                    }),
                },
            ],
        });
        code
    }

    #[test]
    fn round_trip_is_exact_for_canonical_layout() {
        let code = canonical_code();
        let mut method = balloon(&code).unwrap();
        let mut frame = Frame::of_code(&code);
        assert_eq!(sync(&mut method, &mut frame), code);

        // And stays put on a second round
        let mut again = balloon(&code).unwrap();
        assert!(try_sync(&mut again));
        assert_eq!(sync(&mut again, &mut frame), code);
    }

    /// `goto` followed by `count` nops and the goto's target
    fn forward_goto(goto: DexOpcode, count: usize) -> (FatMethod, EntryId) {
        let mut method = FatMethod::new();
        let goto = method.push_back(MethodItemEntry::opcode(DexInstruction::new(goto)));
        for _ in 0..count {
            method.push_back(MethodItemEntry::opcode(DexInstruction::new(DexOpcode::Nop)));
        }
        method.push_back(MethodItemEntry::target(BranchTargetType::Simple, goto));
        method.push_back(MethodItemEntry::opcode(DexInstruction::new(
            DexOpcode::ReturnVoid,
        )));
        (method, goto)
    }

    #[test]
    fn goto_widens_monotonically() {
        let (mut method, goto) = forward_goto(DexOpcode::Goto, 40_000);
        let mut seen = vec![];
        let mut passes = 0;
        loop {
            passes += 1;
            seen.push(method[goto].insn().unwrap().opcode());
            if try_sync(&mut method) {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![DexOpcode::Goto, DexOpcode::Goto16, DexOpcode::Goto32]
        );
        assert!(passes <= 3);
        assert_eq!(method.len(), 40_003);
    }

    #[test]
    fn self_loop_needs_goto32() {
        let mut method = FatMethod::new();
        let goto = method.push_back(MethodItemEntry::opcode(DexInstruction::new(DexOpcode::Goto)));
        method.insert_before(Some(goto), MethodItemEntry::target(BranchTargetType::Simple, goto));

        let mut frame = Frame {
            registers_size: 0,
            ins_size: 0,
            outs_size: 0,
            line_start: None,
        };
        let code = sync(&mut method, &mut frame);
        assert_eq!(opcodes(&method), vec![DexOpcode::Goto32]);
        assert_eq!(code.insns, vec![0x002a, 0x0000, 0x0000]);
    }

    #[test]
    fn oversized_conditional_is_rewritten() {
        let mut method = FatMethod::new();
        let branch = method.push_back(MethodItemEntry::opcode(
            DexInstruction::new(DexOpcode::IfEqz).with_srcs(vec![0]),
        ));
        method.push_back(MethodItemEntry::opcode(DexInstruction::new(
            DexOpcode::ReturnVoid,
        )));
        for _ in 0..40_000 {
            method.push_back(MethodItemEntry::opcode(DexInstruction::new(DexOpcode::Nop)));
        }
        method.push_back(MethodItemEntry::target(BranchTargetType::Simple, branch));
        method.push_back(MethodItemEntry::opcode(DexInstruction::new(
            DexOpcode::ReturnVoid,
        )));

        let mut frame = Frame {
            registers_size: 1,
            ins_size: 1,
            outs_size: 0,
            line_start: None,
        };
        let code = sync(&mut method, &mut frame);
        assert_eq!(
            opcodes(&method)[..3],
            [DexOpcode::IfNez, DexOpcode::Goto32, DexOpcode::ReturnVoid]
        );

        // if-nez skips the goto/32, which lands on the final return-void
        assert_eq!(code.insns[0], 0x0039);
        assert_eq!(code.insns[1], 5);
        assert_eq!(code.insns[2], 0x002a);
        let far = code.insns[3] as u32 | (code.insns[4] as u32) << 16;
        assert_eq!(2 + far as usize, code.insns.len() - 1);

        // A second sync does nothing
        assert!(try_sync(&mut method));
    }

    #[test]
    fn wide_registers_widen_moves() {
        let mut method = FatMethod::new();
        method.push_back(MethodItemEntry::opcode(
            DexInstruction::new(DexOpcode::Move)
                .with_dest(300)
                .with_srcs(vec![2]),
        ));
        method.push_back(MethodItemEntry::opcode(
            DexInstruction::new(DexOpcode::InvokeStatic)
                .with_srcs(vec![1, 2, 3])
                .with_index(4),
        ));
        method.push_back(MethodItemEntry::opcode(DexInstruction::new(
            DexOpcode::ReturnVoid,
        )));
        let mut frame = Frame {
            registers_size: 301,
            ins_size: 0,
            outs_size: 0,
            line_start: None,
        };
        let code = sync(&mut method, &mut frame);
        assert_eq!(
            opcodes(&method),
            vec![DexOpcode::Move16, DexOpcode::InvokeStatic, DexOpcode::ReturnVoid]
        );
        assert_eq!(code.outs_size, 3);
        assert_eq!(frame.outs_size, 3);
        assert_eq!(code.insns.len(), 7);
    }

    #[test]
    fn long_try_regions_are_split() {
        let mut method = FatMethod::new();
        let catch = method.push_back(MethodItemEntry::catch_entry(None, None));
        method.push_back(MethodItemEntry::opcode(DexInstruction::new(
            DexOpcode::ReturnVoid,
        )));
        let first = method.first();
        method.insert_after(None, MethodItemEntry::try_entry(TryEntryType::End, catch));
        for _ in 0..70_000 {
            method.insert_after(None, MethodItemEntry::opcode(DexInstruction::new(DexOpcode::Nop)));
        }
        method.insert_after(None, MethodItemEntry::try_entry(TryEntryType::Start, catch));
        assert_eq!(method.last(), first.and_then(|f| method.next(f)));

        let mut frame = Frame {
            registers_size: 0,
            ins_size: 0,
            outs_size: 0,
            line_start: None,
        };
        let code = sync(&mut method, &mut frame);
        let ranges: Vec<(u32, u16)> = code
            .tries
            .iter()
            .map(|t| (t.start_addr, t.insn_count))
            .collect();
        assert_eq!(ranges, vec![(0, 0xffff), (0xffff, (70_000u32 - 0xffff) as u16)]);
        assert!(code.tries.iter().all(|t| t.catches[0].handler_addr == 70_000));
    }
}
