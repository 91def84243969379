//! Basic blocks over a [`FatMethod`]
//!
//! Blocks are contiguous runs of the sequence, described by their first node and the node that
//! starts the following block. Edges are kept in the blocks themselves as parallel
//! predecessor/successor lists rather than in the nodes.
//!
//! A block ends:
//!
//!   - before a try, catch or branch target marker
//!   - after a branch, switch, return or throw
//!   - after an instruction that may throw while inside a try region
//!   - at the end of the method
//!
//! Fallthrough anchors following a block-ending instruction stay in that block, so only the entry
//! block can begin with one.
//!
//! Any structural edit to the method invalidates its blocks.

use super::{EntryId, FatMethod, MethodItem, TryEntryType};
use crate::dex::DexInstruction;
use std::collections::HashMap;

pub type BlockId = usize;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub id: BlockId,

    /// First node of the block
    pub begin: EntryId,

    /// First node of the next block (`None` if the block runs to the end of the method)
    pub end: Option<EntryId>,

    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,

    catch: bool,
}

impl Block {
    /// Does the block start with a catch entry?
    pub fn is_catch(&self) -> bool {
        self.catch
    }

    /// Nodes of the block, in order
    pub fn entries(&self, method: &FatMethod) -> Vec<EntryId> {
        let mut entries = vec![];
        let mut cursor = Some(self.begin);
        while let Some(id) = cursor {
            if Some(id) == self.end {
                break;
            }
            entries.push(id);
            cursor = method.next(id);
        }
        entries
    }

    /// Final node of the block, not counting trailing fallthrough anchors
    pub fn last(&self, method: &FatMethod) -> EntryId {
        let mut last = match self.end {
            Some(end) => method.prev(end).unwrap_or(self.begin),
            None => method.last().unwrap_or(self.begin),
        };
        while last != self.begin && matches!(method[last].item, MethodItem::Fallthrough) {
            match method.prev(last) {
                Some(prev) => last = prev,
                None => break,
            }
        }
        last
    }

    /// Instruction the block ends with (if the final node is an instruction)
    pub fn last_insn<'a>(&self, method: &'a FatMethod) -> Option<&'a DexInstruction> {
        method[self.last(method)].insn()
    }
}

/// Does the block's final instruction have exception edges when inside a try region?
///
/// This uses the same opcode classification that ends blocks during construction, so a block
/// for which this holds (and which sits in a try region) always ends at that instruction.
pub fn ends_with_may_throw(method: &FatMethod, block: &Block) -> bool {
    block
        .last_insn(method)
        .map_or(false, |insn| insn.opcode().may_throw())
}

/// Handler chain enclosing every instruction that sits inside a try region
pub fn enclosing_catches(method: &FatMethod) -> HashMap<EntryId, EntryId> {
    let mut enclosing = HashMap::new();
    let mut current: Option<EntryId> = None;
    for (id, entry) in method.iter() {
        match &entry.item {
            MethodItem::Try(try_entry) => {
                current = match try_entry.kind {
                    TryEntryType::Start => Some(try_entry.catch_start),
                    TryEntryType::End => None,
                };
            }
            MethodItem::Opcode(_) => {
                if let Some(catch_start) = current {
                    enclosing.insert(id, catch_start);
                }
            }
            _ => (),
        }
    }
    enclosing
}

/// Catch entries of the chain starting at `catch_start`, in priority order
pub fn catch_chain(method: &FatMethod, catch_start: EntryId) -> Vec<EntryId> {
    let mut chain = vec![];
    let mut cursor = Some(catch_start);
    while let Some(id) = cursor {
        match &method[id].item {
            MethodItem::Catch(catch) => {
                chain.push(id);
                cursor = catch.next;
            }
            other => panic!("handler chain points at non-catch item {:?}", other),
        }
    }
    chain
}

/// Partition the method into blocks and compute edges
pub fn build_cfg(method: &FatMethod) -> Vec<Block> {
    let enclosing = enclosing_catches(method);

    // Branch instruction -> its targets
    let mut targets_of: HashMap<EntryId, Vec<EntryId>> = HashMap::new();
    for (id, entry) in method.iter() {
        if let MethodItem::Target(target) = &entry.item {
            targets_of.entry(target.src).or_default().push(id);
        }
    }

    // Partition
    let mut blocks: Vec<Block> = vec![];
    let mut block_of: HashMap<EntryId, BlockId> = HashMap::new();
    let mut open = true;
    for (id, entry) in method.iter() {
        // An anchor right after a block-ending instruction stays with that block
        let anchor = matches!(entry.item, MethodItem::Fallthrough) && !blocks.is_empty();
        if (open && !anchor) || entry.starts_block() {
            if let Some(last) = blocks.last_mut() {
                last.end = Some(id);
            }
            blocks.push(Block {
                id: blocks.len(),
                begin: id,
                end: None,
                preds: vec![],
                succs: vec![],
                catch: matches!(entry.item, MethodItem::Catch(_)),
            });
            open = false;
        }
        block_of.insert(id, blocks.len() - 1);
        if let Some(insn) = entry.insn() {
            let opcode = insn.opcode();
            open = opcode.is_branch()
                || opcode.is_return()
                || opcode.is_throw()
                || (opcode.may_throw() && enclosing.contains_key(&id));
        }
    }

    // Successors
    let block_count = blocks.len();
    for block in blocks.iter_mut() {
        let physical_next = Some(block.id + 1).filter(|next| *next < block_count);
        let last = block.last(method);
        let mut succs: Vec<BlockId> = vec![];
        let branch_succs = |succs: &mut Vec<BlockId>| {
            for target in targets_of.get(&last).into_iter().flatten() {
                succs.push(block_of[target]);
            }
        };
        match method[last].insn().map(|insn| insn.opcode()) {
            Some(opcode) if opcode.is_goto() => branch_succs(&mut succs),
            Some(opcode) if opcode.is_conditional() || opcode.is_switch() => {
                branch_succs(&mut succs);
                succs.extend(physical_next);
            }
            Some(opcode) if opcode.is_return() || opcode.is_throw() => (),
            _ => succs.extend(physical_next),
        }
        if let Some(catch_start) = enclosing.get(&last) {
            if method[last].insn().map_or(false, |insn| insn.opcode().may_throw()) {
                for catch in catch_chain(method, *catch_start) {
                    succs.push(block_of[&catch]);
                }
            }
        }

        let mut deduped = Vec::with_capacity(succs.len());
        for succ in succs {
            if !deduped.contains(&succ) {
                deduped.push(succ);
            }
        }
        block.succs = deduped;
    }

    // Predecessors
    for idx in 0..block_count {
        for succ_idx in 0..blocks[idx].succs.len() {
            let succ = blocks[idx].succs[succ_idx];
            blocks[succ].preds.push(idx);
        }
    }

    log::trace!("Built CFG with {} blocks over {} nodes", blocks.len(), method.len());
    blocks
}

/// Postorder over the blocks reachable from the entry block and every catch block
///
/// A block is emitted only once all of its successors have been emitted or are already on the
/// traversal stack, so reversing the result gives an order suitable for forward dataflow (and the
/// result itself suits backward dataflow).
pub struct PostOrderSort<'a> {
    blocks: &'a [Block],
}

impl<'a> PostOrderSort<'a> {
    pub fn new(blocks: &'a [Block]) -> PostOrderSort<'a> {
        PostOrderSort { blocks }
    }

    pub fn get(&self) -> Vec<BlockId> {
        #[derive(Clone, Copy)]
        enum State {
            Enter,
            Exit,
        }

        let mut visited = vec![false; self.blocks.len()];
        let mut result = Vec::with_capacity(self.blocks.len());
        let roots = self
            .blocks
            .iter()
            .filter(|block| block.id == 0 || block.is_catch())
            .map(|block| block.id);

        for root in roots {
            let mut stack = vec![(root, State::Enter)];
            while let Some((block, state)) = stack.pop() {
                match state {
                    State::Enter => {
                        if visited[block] {
                            continue;
                        }
                        visited[block] = true;
                        stack.push((block, State::Exit));
                        for succ in self.blocks[block].succs.iter().rev() {
                            if !visited[*succ] {
                                stack.push((*succ, State::Enter));
                            }
                        }
                    }
                    State::Exit => result.push(block),
                }
            }
        }
        result
    }
}
