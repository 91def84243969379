//! Decode an encoded method into a [`FatMethod`]
//!
//! Instructions become opcode nodes. Everything that refers to an address (try items, handlers,
//! branch destinations, debug entries) becomes a marker node placed in front of the instruction at
//! that address. Markers sharing an address are ordered:
//!
//!   1. try region end
//!   2. catch entries
//!   3. try region start
//!   4. branch targets (by address of the branch, then by case index)
//!   5. debug entries (in program order)
//!
//! so that a region ending and another starting at the same instruction never overlap, and
//! handler code starts in a fresh block.

use super::{BranchTargetType, EntryId, FatMethod, MethodItem, MethodItemEntry, TryEntryType};
use crate::dex::{
    DebugEntryKind, DexCatch, DexCode, DexInstruction, DexOpcode, Error, SwitchKeys,
    PACKED_SWITCH_IDENT, SPARSE_SWITCH_IDENT,
};
use std::collections::{BTreeMap, HashMap};

fn is_payload(unit: u16) -> bool {
    unit == PACKED_SWITCH_IDENT || unit == SPARSE_SWITCH_IDENT
}

/// Instruction nodes by address, plus the address just past the last instruction
struct Layout {
    by_addr: BTreeMap<u32, EntryId>,
    code_end: u32,
}

impl Layout {
    /// Node that markers for `addr` go in front of (`None` means the end of the method)
    fn position(&self, addr: u32) -> Option<EntryId> {
        if addr >= self.code_end {
            return None;
        }
        match self.by_addr.get(&addr) {
            Some(id) => Some(*id),
            None => panic!("address {:#x} is not at an instruction boundary", addr),
        }
    }
}

fn insert_marker(method: &mut FatMethod, layout: &Layout, addr: u32, item: MethodItem) -> EntryId {
    let pos = layout.position(addr);
    let id = method.insert_before(pos, MethodItemEntry::new(item));
    method[id].addr = addr;
    id
}

/// Decode the instruction stream, skipping payloads (and the nop aligning them)
///
/// Returns the instructions by address and the targets of every branch.
#[allow(clippy::type_complexity)]
fn decode_instructions(
    insns: &[u16],
) -> Result<(Vec<(u32, DexInstruction)>, Vec<(u32, BranchTargetType, u32)>), Error> {
    let mut decoded = vec![];
    let mut addr: u32 = 0;
    while (addr as usize) < insns.len() {
        let unit = insns[addr as usize];
        if is_payload(unit) {
            let (_, _, size) = SwitchKeys::decode_payload(insns, addr)?;
            addr += size;
            continue;
        }
        let (insn, size) = DexInstruction::decode(insns, addr)?;
        let next = insns.get((addr + size) as usize).copied();
        let is_padding = insn.opcode() == DexOpcode::Nop && next.map_or(false, is_payload);
        if !is_padding {
            decoded.push((addr, insn));
        }
        addr += size;
    }

    let mut targets = vec![];
    for (addr, insn) in decoded.iter_mut() {
        let opcode = insn.opcode();
        let destination = (*addr as i64 + insn.offset() as i64) as u32;
        if opcode.is_goto() || opcode.is_conditional() {
            targets.push((*addr, BranchTargetType::Simple, destination));
        } else if opcode.is_switch() {
            let (keys, case_targets, _) = SwitchKeys::decode_payload(insns, destination)?;
            for (case, relative) in case_targets.into_iter().enumerate() {
                let case_addr = (*addr as i64 + relative as i64) as u32;
                targets.push((*addr, BranchTargetType::Multi(case as u32), case_addr));
            }
            insn.set_switch_keys(keys);
        }
        // Offsets are recomputed from target nodes on sync
        insn.set_offset(0);
    }
    Ok((decoded, targets))
}

/// Build the IR for an encoded method
///
/// Instruction decoding failures are reported as errors. Tables that do not line up with the
/// instruction stream (a try boundary or a branch destination in the middle of an instruction)
/// are corrupt input and panic.
pub fn balloon(code: &DexCode) -> Result<FatMethod, Error> {
    let (decoded, mut targets) = decode_instructions(&code.insns)?;

    let mut method = FatMethod::new();
    let mut by_addr = BTreeMap::new();
    let mut code_end = 0;
    for (addr, insn) in decoded {
        code_end = addr + insn.size();
        let id = method.push_back(MethodItemEntry::opcode(insn));
        method[id].addr = addr;
        by_addr.insert(addr, id);
    }
    let layout = Layout { by_addr, code_end };

    // Handler chains (try items with identical handler lists share one chain)
    let mut chains: HashMap<&[DexCatch], EntryId> = HashMap::new();
    let mut try_chains = vec![];
    for try_item in &code.tries {
        if let Some(chain) = chains.get(&try_item.catches[..]) {
            try_chains.push(*chain);
            continue;
        }
        assert!(
            !try_item.catches.is_empty(),
            "try item at {:#x} has no handlers",
            try_item.start_addr
        );
        let mut next: Option<EntryId> = None;
        for catch in try_item.catches.iter().rev() {
            let entry = MethodItemEntry::catch_entry(catch.catch_type, next);
            let id = insert_marker(&mut method, &layout, catch.handler_addr, entry.item);
            next = Some(id);
        }
        let chain = next.unwrap_or_else(|| unreachable!("non-empty handler list"));
        chains.insert(&try_item.catches, chain);
        try_chains.push(chain);
    }

    // Region starts, then region ends in front of anything already at that address
    for (try_item, chain) in code.tries.iter().zip(&try_chains) {
        if try_item.insn_count == 0 {
            continue;
        }
        let start = MethodItemEntry::try_entry(TryEntryType::Start, *chain);
        insert_marker(&mut method, &layout, try_item.start_addr, start.item);
    }
    for (try_item, chain) in code.tries.iter().zip(&try_chains) {
        if try_item.insn_count == 0 {
            continue;
        }
        let end_addr = try_item.end_addr();
        let mut pos = layout.position(end_addr);
        loop {
            let prev = match pos {
                Some(pos) => method.prev(pos),
                None => method.last(),
            };
            match prev.map(|prev| &method[prev]) {
                Some(entry) if entry.addr == end_addr && leads_region_end(&entry.item) => {
                    pos = prev
                }
                _ => break,
            }
        }
        let end = MethodItemEntry::try_entry(TryEntryType::End, *chain);
        let id = method.insert_before(pos, end);
        method[id].addr = end_addr;
    }

    // Branch targets
    targets.sort_by_key(|(src, kind, _)| {
        let case = match kind {
            BranchTargetType::Simple => 0,
            BranchTargetType::Multi(case) => *case,
        };
        (*src, case)
    });
    for (src_addr, kind, target_addr) in targets {
        assert!(
            target_addr < layout.code_end,
            "branch at {:#x} leaves the method",
            src_addr
        );
        let src = layout.by_addr[&src_addr];
        let target = MethodItemEntry::target(kind, src);
        insert_marker(&mut method, &layout, target_addr, target.item);
    }

    // Debug program
    if let Some(debug_item) = &code.debug_item {
        for entry in &debug_item.entries {
            let item = match &entry.kind {
                DebugEntryKind::Instruction(insn) => MethodItem::Debug(insn.clone()),
                DebugEntryKind::Position(pos) => MethodItem::Position(pos.clone()),
            };
            insert_marker(&mut method, &layout, entry.addr, item);
        }
    }

    log::trace!(
        "Ballooned {} code units into {} nodes",
        code.insns.len(),
        method.len()
    );
    Ok(method)
}

/// Markers a try region end is placed in front of
fn leads_region_end(item: &MethodItem) -> bool {
    match item {
        MethodItem::Catch(_) => true,
        MethodItem::Try(try_entry) => try_entry.kind == TryEntryType::Start,
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dex::{DexDebugEntry, DexDebugItem, DexPosition, DexTryItem, TypeId};
    use crate::transform::CatchEntry;

    fn kinds(method: &FatMethod) -> Vec<&'static str> {
        method
            .iter()
            .map(|(_, entry)| match &entry.item {
                MethodItem::Try(t) if t.kind == TryEntryType::Start => "try-start",
                MethodItem::Try(_) => "try-end",
                MethodItem::Catch(_) => "catch",
                MethodItem::Opcode(_) => "op",
                MethodItem::Target(_) => "target",
                MethodItem::Debug(_) => "debug",
                MethodItem::Position(_) => "position",
                MethodItem::Fallthrough => "fallthrough",
            })
            .collect()
    }

    fn encode(insns: &[DexInstruction]) -> Vec<u16> {
        let mut out = vec![];
        for insn in insns {
            insn.encode(&mut out);
        }
        out
    }

    #[test]
    fn marker_order_at_shared_address() {
        // 0: nop / 1: goto -1 / 2: return-void (try 0..1, handler and new try at 1)
        let mut goto = DexInstruction::new(DexOpcode::Goto);
        goto.set_offset(-1);
        let insns = encode(&[
            DexInstruction::new(DexOpcode::Nop),
            goto,
            DexInstruction::new(DexOpcode::ReturnVoid),
        ]);
        let mut code = DexCode::new(1, 0, insns);
        let catch_all = vec![DexCatch {
            catch_type: None,
            handler_addr: 1,
        }];
        let typed = vec![DexCatch {
            catch_type: Some(TypeId(1)),
            handler_addr: 2,
        }];
        code.tries = vec![
            DexTryItem {
                start_addr: 0,
                insn_count: 1,
                catches: catch_all,
            },
            DexTryItem {
                start_addr: 1,
                insn_count: 1,
                catches: typed,
            },
        ];
        code.debug_item = Some(DexDebugItem {
            line_start: 1,
            entries: vec![DexDebugEntry {
                addr: 0,
                kind: DebugEntryKind::Position(DexPosition {
                    line: 1,
                    source_file: None,
                }),
            }],
        });

        let method = balloon(&code).unwrap();
        assert_eq!(
            kinds(&method),
            vec![
                "try-start", "target", "position", "op", // 0
                "try-end", "catch", "try-start", "op", // 1
                "try-end", "catch", "op", // 2
            ]
        );
    }

    #[test]
    fn catch_chain_in_priority_order() {
        let insns = encode(&[
            DexInstruction::new(DexOpcode::Sget).with_dest(0).with_index(0),
            DexInstruction::new(DexOpcode::ReturnVoid),
            DexInstruction::new(DexOpcode::ReturnVoid),
            DexInstruction::new(DexOpcode::ReturnVoid),
        ]);
        let catches = vec![
            DexCatch {
                catch_type: Some(TypeId(7)),
                handler_addr: 4,
            },
            DexCatch {
                catch_type: Some(TypeId(8)),
                handler_addr: 3,
            },
            DexCatch {
                catch_type: None,
                handler_addr: 4,
            },
        ];
        let mut code = DexCode::new(1, 0, insns);
        for start_addr in [0, 2] {
            code.tries.push(DexTryItem {
                start_addr,
                insn_count: if start_addr == 0 { 2 } else { 1 },
                catches: catches.clone(),
            });
        }
        let method = balloon(&code).unwrap();

        // Identical handler lists share a chain
        let starts: Vec<EntryId> = method
            .iter()
            .filter_map(|(_, entry)| match &entry.item {
                MethodItem::Try(t) => Some(t.catch_start),
                _ => None,
            })
            .collect();
        assert_eq!(starts.len(), 4);
        assert!(starts.iter().all(|s| *s == starts[0]));

        let mut types = vec![];
        let mut addrs = vec![];
        let mut cursor = Some(starts[0]);
        while let Some(id) = cursor {
            match &method[id].item {
                MethodItem::Catch(CatchEntry { catch_type, next }) => {
                    types.push(*catch_type);
                    addrs.push(method[id].addr);
                    cursor = *next;
                }
                _ => panic!("chain leaves catch entries"),
            }
        }
        assert_eq!(types, vec![Some(TypeId(7)), Some(TypeId(8)), None]);
        assert_eq!(addrs, vec![4, 3, 4]);
    }

    #[test]
    fn payload_and_alignment_nop_are_dropped() {
        // 0: const/4 v0 / 1: packed-switch v0 (payload at 6) / 4: return-void / 5: nop / 6: payload
        let mut switch = DexInstruction::new(DexOpcode::PackedSwitch).with_srcs(vec![0]);
        switch.set_offset(5);
        let mut insns = encode(&[
            DexInstruction::new(DexOpcode::Const4).with_dest(0),
            switch,
            DexInstruction::new(DexOpcode::ReturnVoid),
        ]);
        insns.push(0x0000);
        SwitchKeys::Packed {
            first_key: 5,
            size: 1,
        }
        .encode_payload(&[3], &mut insns);
        let method = balloon(&DexCode::new(1, 0, insns)).unwrap();

        assert_eq!(kinds(&method), vec!["op", "op", "target", "op"]);
        let switch_id = method.next(method.first().unwrap()).unwrap();
        let switch = method[switch_id].insn().unwrap();
        assert_eq!(
            switch.switch_keys(),
            Some(&SwitchKeys::Packed {
                first_key: 5,
                size: 1
            })
        );
        assert_eq!(switch.offset(), 0);
    }

    #[test]
    #[should_panic(expected = "not at an instruction boundary")]
    fn misaligned_try_is_fatal() {
        let insns = encode(&[
            DexInstruction::new(DexOpcode::Const16).with_dest(0).with_literal(300),
            DexInstruction::new(DexOpcode::ReturnVoid),
        ]);
        let mut code = DexCode::new(1, 0, insns);
        code.tries.push(DexTryItem {
            start_addr: 1,
            insn_count: 1,
            catches: vec![DexCatch {
                catch_type: None,
                handler_addr: 2,
            }],
        });
        let _ = balloon(&code);
    }
}
