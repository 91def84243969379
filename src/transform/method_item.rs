use super::EntryId;
use crate::dex::{DexDebugInstruction, DexInstruction, DexPosition, TypeId};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TryEntryType {
    Start,
    End,
}

/// Boundary of a try region
///
/// Both the start and the end marker of a region refer to the first entry of the region's
/// handler chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TryEntry {
    pub kind: TryEntryType,
    pub catch_start: EntryId,
}

/// One handler of a handler chain, placed at the start of the handler code
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CatchEntry {
    /// Caught type, or `None` for a catch-all
    pub catch_type: Option<TypeId>,

    /// Next (lower priority) handler of the chain. Always `None` after a catch-all.
    pub next: Option<EntryId>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BranchTargetType {
    /// Target of a `goto` or `if-*`
    Simple,

    /// Target of one case of a switch (index of the case in payload order)
    Multi(u32),
}

/// Marks the location a branch instruction jumps to
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BranchTarget {
    pub kind: BranchTargetType,

    /// The branching instruction
    pub src: EntryId,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MethodItem {
    Try(TryEntry),
    Catch(CatchEntry),
    Opcode(DexInstruction),
    Target(BranchTarget),
    Debug(DexDebugInstruction),
    Position(DexPosition),

    /// Placeholder marking a location code can be inserted at. It has no encoding.
    Fallthrough,
}

/// Node of a [`super::FatMethod`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MethodItemEntry {
    /// Address in code units (only meaningful right after balloon or sync)
    pub addr: u32,
    pub item: MethodItem,
}

impl MethodItemEntry {
    pub fn new(item: MethodItem) -> MethodItemEntry {
        MethodItemEntry { addr: 0, item }
    }

    pub fn opcode(insn: DexInstruction) -> MethodItemEntry {
        MethodItemEntry::new(MethodItem::Opcode(insn))
    }

    pub fn try_entry(kind: TryEntryType, catch_start: EntryId) -> MethodItemEntry {
        MethodItemEntry::new(MethodItem::Try(TryEntry { kind, catch_start }))
    }

    pub fn catch_entry(catch_type: Option<TypeId>, next: Option<EntryId>) -> MethodItemEntry {
        debug_assert!(catch_type.is_some() || next.is_none(), "catch-all must end its chain");
        MethodItemEntry::new(MethodItem::Catch(CatchEntry { catch_type, next }))
    }

    pub fn target(kind: BranchTargetType, src: EntryId) -> MethodItemEntry {
        MethodItemEntry::new(MethodItem::Target(BranchTarget { kind, src }))
    }

    pub fn fallthrough() -> MethodItemEntry {
        MethodItemEntry::new(MethodItem::Fallthrough)
    }

    pub fn insn(&self) -> Option<&DexInstruction> {
        match &self.item {
            MethodItem::Opcode(insn) => Some(insn),
            _ => None,
        }
    }

    pub fn insn_mut(&mut self) -> Option<&mut DexInstruction> {
        match &mut self.item {
            MethodItem::Opcode(insn) => Some(insn),
            _ => None,
        }
    }

    pub fn is_opcode(&self) -> bool {
        matches!(self.item, MethodItem::Opcode(_))
    }

    /// Try, catch and branch target markers start a new basic block
    pub fn starts_block(&self) -> bool {
        matches!(
            self.item,
            MethodItem::Try(_) | MethodItem::Catch(_) | MethodItem::Target(_)
        )
    }

    /// Size of the encoding in code units (payloads are not counted)
    pub fn size(&self) -> u32 {
        match &self.item {
            MethodItem::Opcode(insn) => insn.size(),
            _ => 0,
        }
    }
}
