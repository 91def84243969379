//! Debug program entries
//!
//! The debug program is opaque to the transformation engine: entries are carried through the IR
//! unmodified and only get re-addressed when the method is synced.

/// Debug-program instruction (other than a position advance)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DexDebugInstruction {
    pub opcode: u8,
    pub operands: Vec<u32>,
}

/// Source position in effect from an address onwards
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DexPosition {
    pub line: u32,

    /// String index of the source file, if it differs from the class source file
    pub source_file: Option<u32>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DebugEntryKind {
    Instruction(DexDebugInstruction),
    Position(DexPosition),
}

/// Debug entry anchored at an instruction address
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DexDebugEntry {
    pub addr: u32,
    pub kind: DebugEntryKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DexDebugItem {
    pub line_start: u32,

    /// Entries in program order (addresses never decrease)
    pub entries: Vec<DexDebugEntry>,
}
