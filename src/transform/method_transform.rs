use super::{
    balloon, build_cfg, sync, try_sync, Block, BranchTargetType, EntryId, FatMethod, Frame,
    MethodItem, MethodItemEntry,
};
use crate::dex::{DexInstruction, DexMethod, DexOpcode, Error, Reg};
use std::sync::Arc;

/// Editable form of one method
///
/// The transform owns the IR of its method and, optionally, a control-flow graph over it. Edits
/// that change the block structure drop the graph: [`MethodTransform::cfg`] then returns `None`
/// until [`MethodTransform::build_cfg`] is called again.
pub struct MethodTransform {
    method: Arc<DexMethod>,
    fmethod: FatMethod,
    cfg: Option<Vec<Block>>,
    frame: Frame,
}

impl MethodTransform {
    /// Balloon the current code of a method
    pub(crate) fn from_method(method: Arc<DexMethod>) -> Result<MethodTransform, Error> {
        let (fmethod, frame) = match method.code() {
            Some(code) => (balloon(&code)?, Frame::of_code(&code)),
            None => (FatMethod::new(), Frame::empty()),
        };
        Ok(MethodTransform {
            method,
            fmethod,
            cfg: None,
            frame,
        })
    }

    /// Transform with no code at all (for synthesized methods)
    pub(crate) fn empty(method: Arc<DexMethod>) -> MethodTransform {
        MethodTransform {
            method,
            fmethod: FatMethod::new(),
            cfg: None,
            frame: Frame::empty(),
        }
    }

    pub fn method(&self) -> &Arc<DexMethod> {
        &self.method
    }

    pub fn fat_method(&self) -> &FatMethod {
        &self.fmethod
    }

    /// Raw access to the IR. The CFG is dropped since nothing stops the caller from changing the
    /// block structure.
    pub fn fat_method_mut(&mut self) -> &mut FatMethod {
        self.cfg = None;
        &mut self.fmethod
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn registers_size(&self) -> u16 {
        self.frame.registers_size
    }

    pub fn ins_size(&self) -> u16 {
        self.frame.ins_size
    }

    /// Set the register frame of a method under construction
    pub fn set_frame(&mut self, registers_size: u16, ins_size: u16) {
        assert!(ins_size <= registers_size, "more ins than registers");
        self.frame.registers_size = registers_size;
        self.frame.ins_size = ins_size;
    }

    pub fn len(&self) -> usize {
        self.fmethod.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fmethod.is_empty()
    }

    pub fn iter(&self) -> super::fat_method::Iter<'_> {
        self.fmethod.iter()
    }

    pub fn cfg(&self) -> Option<&[Block]> {
        self.cfg.as_deref()
    }

    pub fn build_cfg(&mut self) {
        self.cfg = Some(build_cfg(&self.fmethod));
    }

    pub fn push_back(&mut self, insn: DexInstruction) -> EntryId {
        self.cfg = None;
        self.fmethod.push_back(MethodItemEntry::opcode(insn))
    }

    /// Insert instructions (in order) after `pos`, or at the head of the method when `pos` is
    /// `None`
    pub fn insert_after(
        &mut self,
        pos: Option<EntryId>,
        insns: Vec<DexInstruction>,
    ) -> Vec<EntryId> {
        self.cfg = None;
        let mut ids = Vec::with_capacity(insns.len());
        let mut cursor = pos;
        for insn in insns {
            let id = self.fmethod.insert_after(cursor, MethodItemEntry::opcode(insn));
            ids.push(id);
            cursor = Some(id);
        }
        ids
    }

    /// Swap the instruction of a node, keeping the node (and everything referring to it)
    ///
    /// Branch targets of the old instruction stay attached when the new one branches the same
    /// way and are removed when it does not branch at all.
    pub fn replace_opcode(&mut self, at: EntryId, insn: DexInstruction) {
        let old = match self.fmethod[at].insn() {
            Some(old) => old.opcode(),
            None => panic!("cannot replace non-instruction {:?}", self.fmethod[at].item),
        };
        let new = insn.opcode();
        match (target_kind(old), target_kind(new)) {
            (before, after) if before == after => (),
            (_, None) => self.remove_targets_of(at),
            _ => panic!("cannot replace {} with {}: branch targets differ", old, new),
        }
        if old.flags() != new.flags() {
            self.cfg = None;
        }
        if let Some(slot) = self.fmethod[at].insn_mut() {
            *slot = insn;
        }
    }

    /// Remove an instruction along with the branch targets it owns
    pub fn remove_opcode(&mut self, at: EntryId) {
        assert!(
            self.fmethod[at].is_opcode(),
            "cannot remove non-instruction {:?} as an instruction",
            self.fmethod[at].item
        );
        self.remove_targets_of(at);
        self.fmethod.remove(at);
    }

    fn remove_targets_of(&mut self, src: EntryId) {
        self.cfg = None;
        let owned_targets: Vec<EntryId> = self
            .fmethod
            .iter()
            .filter(|(_, entry)| matches!(&entry.item, MethodItem::Target(t) if t.src == src))
            .map(|(id, _)| id)
            .collect();
        for target in owned_targets {
            self.fmethod.remove(target);
        }
    }

    /// Remove any node, without fixing up references to it
    pub fn erase(&mut self, at: EntryId) -> MethodItemEntry {
        self.cfg = None;
        self.fmethod.remove(at)
    }

    /// Make room for `count` more registers
    ///
    /// Parameters always occupy the last `ins_size` registers of the frame, so the new registers
    /// are inserted just below them and every reference to a parameter moves up by `count`.
    pub fn enlarge_registers(&mut self, count: u16) {
        if count == 0 {
            return;
        }
        let first_param = self.frame.registers_size - self.frame.ins_size;
        self.frame.registers_size = self
            .frame
            .registers_size
            .checked_add(count)
            .unwrap_or_else(|| panic!("register frame of {:?} overflows", self.method));
        for id in self.fmethod.ids() {
            if let Some(insn) = self.fmethod[id].insn_mut() {
                insn.map_registers(|reg: Reg| if reg >= first_param { reg + count } else { reg });
            }
        }
        log::debug!(
            "Enlarged frame of {:?} by {} to {} registers",
            self.method,
            count,
            self.frame.registers_size
        );
    }

    /// One relaxation pass (see [`super::try_sync`])
    pub fn try_sync(&mut self) -> bool {
        let before = self.fmethod.len();
        let converged = try_sync(&mut self.fmethod);
        if self.fmethod.len() != before {
            self.cfg = None;
        }
        converged
    }

    /// Encode the IR and store the result as the method's code
    pub fn sync(&mut self) {
        let before = self.fmethod.len();
        let code = sync(&mut self.fmethod, &mut self.frame);
        if self.fmethod.len() != before {
            self.cfg = None;
        }
        log::trace!(
            "Synced {:?} into {} code units",
            self.method,
            code.insns.len()
        );
        self.method.set_code(code);
    }

    /// Anchor at the start of the method, to build a method body after
    pub fn main_block(&mut self) -> EntryId {
        if let Some(first) = self.fmethod.first() {
            if let MethodItem::Fallthrough = self.fmethod[first].item {
                return first;
            }
        }
        self.cfg = None;
        self.fmethod.push_front(MethodItemEntry::fallthrough())
    }

    /// Insert an instruction after `cur`, returning the new position to insert after
    pub fn insert(&mut self, cur: EntryId, insn: DexInstruction) -> EntryId {
        self.cfg = None;
        self.fmethod.insert_after(Some(cur), MethodItemEntry::opcode(insn))
    }

    fn fallthrough_after(&mut self, cur: EntryId) -> EntryId {
        self.fmethod.insert_after(Some(cur), MethodItemEntry::fallthrough())
    }

    /// Out-of-line block at the end of the method, entered through `entry_target` and jumping
    /// back to `join`. Returns the anchor to insert the block's code after.
    fn out_of_line_block(&mut self, entry_target: MethodItemEntry, join: EntryId) -> EntryId {
        self.fmethod.push_back(entry_target);
        let anchor = self.fmethod.push_back(MethodItemEntry::fallthrough());
        let goto = self
            .fmethod
            .push_back(MethodItemEntry::opcode(DexInstruction::new(DexOpcode::Goto)));
        self.fmethod.insert_after(
            Some(join),
            MethodItemEntry::target(BranchTargetType::Simple, goto),
        );
        anchor
    }

    /// Insert a conditional branch after `cur` whose taken side is a new block
    ///
    /// Returns `(continuation, if_block)`: code inserted after `if_block` runs when the branch is
    /// taken, then control rejoins at `continuation`, where the fall-through side continues.
    pub fn make_if_block(&mut self, cur: EntryId, insn: DexInstruction) -> (EntryId, EntryId) {
        assert!(insn.opcode().is_conditional(), "{} is not a conditional", insn.opcode());
        self.cfg = None;
        let branch = self.insert(cur, insn);
        let join = self.fallthrough_after(branch);
        let if_block =
            self.out_of_line_block(MethodItemEntry::target(BranchTargetType::Simple, branch), join);
        let continuation = self.fallthrough_after(join_after_targets(&self.fmethod, join));
        self.fmethod.remove(join);
        (continuation, if_block)
    }

    /// Insert a conditional branch after `cur` with code on both sides
    ///
    /// Returns `(continuation, if_block, else_block)`. The else block is the fall-through side and
    /// runs straight into the continuation.
    pub fn make_if_else_block(
        &mut self,
        cur: EntryId,
        insn: DexInstruction,
    ) -> (EntryId, EntryId, EntryId) {
        let (continuation, if_block) = self.make_if_block(cur, insn);
        let branch = match self.fmethod.prev(self.first_join_target(continuation)) {
            Some(branch) => branch,
            None => unreachable!("branch precedes its join"),
        };
        let else_block = self.fallthrough_after(branch);
        (continuation, if_block, else_block)
    }

    /// Insert a switch after `cur` with one new block per case
    ///
    /// Returns `(continuation, default_block, case_blocks)`, with the case blocks in key order.
    /// The default block is the fall-through side and runs straight into the continuation; case
    /// blocks jump back to it.
    pub fn make_switch_block(
        &mut self,
        cur: EntryId,
        insn: DexInstruction,
    ) -> (EntryId, EntryId, Vec<EntryId>) {
        assert!(insn.opcode().is_switch(), "{} is not a switch", insn.opcode());
        let case_count = match insn.switch_keys() {
            Some(keys) => keys.len(),
            None => panic!("switch without keys"),
        };
        self.cfg = None;
        let switch = self.insert(cur, insn);
        let default_block = self.fallthrough_after(switch);
        let join = self.fallthrough_after(default_block);
        let case_blocks = (0..case_count)
            .map(|case| {
                let target = MethodItemEntry::target(BranchTargetType::Multi(case as u32), switch);
                self.out_of_line_block(target, join)
            })
            .collect();
        let continuation = self.fallthrough_after(join_after_targets(&self.fmethod, join));
        self.fmethod.remove(join);
        (continuation, default_block, case_blocks)
    }

    /// First of the join targets sitting right before a continuation anchor
    fn first_join_target(&self, continuation: EntryId) -> EntryId {
        let mut first = continuation;
        while let Some(prev) = self.fmethod.prev(first) {
            match self.fmethod[prev].item {
                MethodItem::Target(_) => first = prev,
                _ => break,
            }
        }
        first
    }
}

/// Kind of branch target an opcode owns: `Some(false)` for simple targets, `Some(true)` for
/// switch cases
fn target_kind(opcode: DexOpcode) -> Option<bool> {
    if opcode.is_switch() {
        Some(true)
    } else if opcode.is_goto() || opcode.is_conditional() {
        Some(false)
    } else {
        None
    }
}

/// Last of the join targets inserted after `join` (or `join` itself if there are none)
fn join_after_targets(fmethod: &FatMethod, join: EntryId) -> EntryId {
    let mut last = join;
    while let Some(next) = fmethod.next(last) {
        match fmethod[next].item {
            MethodItem::Target(_) => last = next,
            _ => break,
        }
    }
    last
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dex::{DexCode, MethodId, SwitchKeys};

    fn new_transform(code: Option<DexCode>) -> MethodTransform {
        MethodTransform::from_method(DexMethod::new(MethodId(0), "test", code)).unwrap()
    }

    fn ret() -> DexInstruction {
        DexInstruction::new(DexOpcode::ReturnVoid)
    }

    fn konst(reg: Reg, value: i64) -> DexInstruction {
        DexInstruction::new(DexOpcode::Const4)
            .with_dest(reg)
            .with_literal(value)
    }

    #[test]
    fn editing_operations() {
        let mut mt = new_transform(None);
        mt.set_frame(2, 0);
        let last = mt.push_back(ret());
        let inserted = mt.insert_after(None, vec![konst(0, 1), konst(1, 2)]);
        assert_eq!(mt.fat_method().first(), Some(inserted[0]));
        assert_eq!(mt.fat_method().next(inserted[1]), Some(last));

        mt.replace_opcode(inserted[0], konst(0, 3));
        assert_eq!(mt.fat_method()[inserted[0]].insn().unwrap().literal(), 3);

        mt.remove_opcode(inserted[1]);
        assert_eq!(mt.len(), 2);
        mt.sync();
        assert_eq!(mt.method().code().unwrap().insns, vec![0x3012, 0x000e]);
    }

    #[test]
    fn removing_a_branch_removes_its_targets() {
        let mut mt = new_transform(None);
        let anchor = mt.main_block();
        let (continuation, if_block) =
            mt.make_if_block(anchor, DexInstruction::new(DexOpcode::IfEqz).with_srcs(vec![0]));
        mt.insert(if_block, konst(0, 1));
        mt.insert(continuation, ret());
        let branch = mt.fat_method().next(anchor).unwrap();
        let targets_before = mt
            .iter()
            .filter(|(_, e)| matches!(e.item, MethodItem::Target(_)))
            .count();
        assert_eq!(targets_before, 2);

        mt.remove_opcode(branch);
        let targets_after = mt
            .iter()
            .filter(|(_, e)| matches!(e.item, MethodItem::Target(_)))
            .count();
        assert_eq!(targets_after, 1);
    }

    #[test]
    fn replacing_a_branch_keeps_or_drops_its_targets() {
        let mut mt = new_transform(None);
        let anchor = mt.main_block();
        let (continuation, if_block) =
            mt.make_if_block(anchor, DexInstruction::new(DexOpcode::IfEqz).with_srcs(vec![0]));
        mt.insert(if_block, konst(0, 1));
        mt.insert(continuation, ret());
        let branch = mt.fat_method().next(anchor).unwrap();
        let targets = |mt: &MethodTransform| {
            mt.iter()
                .filter(|(_, e)| matches!(&e.item, MethodItem::Target(t) if t.src == branch))
                .count()
        };

        mt.replace_opcode(branch, DexInstruction::new(DexOpcode::IfNez).with_srcs(vec![0]));
        assert_eq!(targets(&mt), 1);

        mt.replace_opcode(branch, DexInstruction::new(DexOpcode::Nop));
        assert_eq!(targets(&mt), 0);
        mt.sync();
        // nop / return-void / const/4 v0, 1 / goto -2
        assert_eq!(mt.method().code().unwrap().insns, vec![0x0000, 0x000e, 0x1012, 0xfe28]);
    }

    #[test]
    fn replacing_a_goto_with_nop_syncs() {
        let mut goto = DexInstruction::new(DexOpcode::Goto);
        goto.set_offset(1);
        let mut insns = vec![];
        goto.encode(&mut insns);
        ret().encode(&mut insns);
        let mut mt = new_transform(Some(DexCode::new(1, 0, insns)));
        let goto = mt.fat_method().first().unwrap();
        mt.replace_opcode(goto, DexInstruction::new(DexOpcode::Nop));
        mt.sync();
        assert_eq!(mt.method().code().unwrap().insns, vec![0x0000, 0x000e]);
    }

    #[test]
    #[should_panic(expected = "branch targets differ")]
    fn replacing_a_goto_with_a_switch_is_fatal() {
        let mut mt = new_transform(None);
        let goto = mt.push_back(DexInstruction::new(DexOpcode::Goto));
        mt.replace_opcode(
            goto,
            DexInstruction::new(DexOpcode::SparseSwitch)
                .with_srcs(vec![0])
                .with_switch_keys(SwitchKeys::Sparse(vec![1])),
        );
    }

    #[test]
    #[should_panic(expected = "as an instruction")]
    fn removing_a_marker_as_instruction_is_fatal() {
        let mut mt = new_transform(None);
        let anchor = mt.main_block();
        mt.remove_opcode(anchor);
    }

    #[test]
    fn cfg_is_dropped_by_structural_edits() {
        let mut mt = new_transform(Some(DexCode::new(1, 0, vec![0x000e])));
        mt.build_cfg();
        assert_eq!(mt.cfg().map(|cfg| cfg.len()), Some(1));
        let first = mt.fat_method().first();
        mt.insert_after(first, vec![ret()]);
        assert!(mt.cfg().is_none());
    }

    #[test]
    fn enlarging_shifts_parameters() {
        // v0 local, v1 v2 parameters
        let mut mt = new_transform(None);
        mt.set_frame(3, 2);
        mt.push_back(
            DexInstruction::new(DexOpcode::AddInt)
                .with_dest(0)
                .with_srcs(vec![1, 2]),
        );
        mt.push_back(DexInstruction::new(DexOpcode::Return).with_srcs(vec![0]));
        mt.enlarge_registers(20);
        assert_eq!(mt.registers_size(), 23);
        let add = mt.fat_method()[mt.fat_method().first().unwrap()].insn().unwrap();
        assert_eq!(add.dest(), Some(0));
        assert_eq!(add.srcs(), &[21, 22]);
    }

    /// ```text
    ///     if-eqz v0, L_if
    ///     const/4 v1, 2       (else)
    /// L_join:
    ///     return v1
    /// L_if:
    ///     const/4 v1, 1
    ///     goto L_join
    /// ```
    #[test]
    fn if_else_block_layout() {
        let mut mt = new_transform(None);
        mt.set_frame(2, 1);
        let anchor = mt.main_block();
        let (continuation, if_block, else_block) =
            mt.make_if_else_block(anchor, DexInstruction::new(DexOpcode::IfEqz).with_srcs(vec![1]));
        mt.insert(if_block, konst(0, 1));
        mt.insert(else_block, konst(0, 2));
        mt.insert(continuation, DexInstruction::new(DexOpcode::Return).with_srcs(vec![0]));
        mt.sync();

        let code = mt.method().code().unwrap();
        assert_eq!(
            code.insns,
            vec![
                0x0138, 0x0004, // if-eqz v1, +4
                0x2012, // const/4 v0, 2
                0x000f, // return v0
                0x1012, // const/4 v0, 1
                0xfe28, // goto -2
            ]
        );
    }

    #[test]
    fn switch_block_layout() {
        let mut mt = new_transform(None);
        mt.set_frame(1, 1);
        let anchor = mt.main_block();
        let switch = DexInstruction::new(DexOpcode::SparseSwitch)
            .with_srcs(vec![0])
            .with_switch_keys(SwitchKeys::Sparse(vec![3, 9]));
        let (continuation, default_block, cases) = mt.make_switch_block(anchor, switch);
        assert_eq!(cases.len(), 2);
        mt.insert(default_block, konst(0, 0));
        mt.insert(cases[0], konst(0, 1));
        mt.insert(cases[1], konst(0, 2));
        mt.insert(continuation, ret());
        mt.build_cfg();
        let cfg = mt.cfg().unwrap();
        assert_eq!(cfg[0].succs.len(), 3);
        mt.sync();

        let code = mt.method().code().unwrap();
        // switch(3) const ret const goto const goto, pad, payload(2 + 4 * 2)
        assert_eq!(code.insns.len(), 3 + 1 + 1 + 2 + 2 + 1 + 10);
        assert_eq!(code.insns[10], 0x0200);
    }
}
