use super::DexDebugItem;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Index of a type in the type pool
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TypeId(pub u32);

/// Identity of a method (index in the method pool)
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MethodId(pub u32);

impl fmt::Debug for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// One handler of a try item
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DexCatch {
    /// Caught exception type (`None` catches everything)
    pub catch_type: Option<TypeId>,

    /// Address of the first handler instruction
    pub handler_addr: u32,
}

/// Exception-protected address range
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DexTryItem {
    pub start_addr: u32,

    /// Number of code units covered
    pub insn_count: u16,

    /// Handlers in priority order (a catch-all, if any, is last)
    pub catches: Vec<DexCatch>,
}

impl DexTryItem {
    /// Address just past the protected range
    pub fn end_addr(&self) -> u32 {
        self.start_addr + self.insn_count as u32
    }
}

/// Encoded method body
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DexCode {
    pub registers_size: u16,

    /// Incoming argument registers (the last `ins_size` registers of the frame)
    pub ins_size: u16,

    /// Outgoing argument words needed by invokes
    pub outs_size: u16,

    /// Instructions and payloads, in code units
    pub insns: Vec<u16>,

    /// Try items, sorted by address and not overlapping
    pub tries: Vec<DexTryItem>,

    pub debug_item: Option<DexDebugItem>,
}

impl DexCode {
    pub fn new(registers_size: u16, ins_size: u16, insns: Vec<u16>) -> DexCode {
        DexCode {
            registers_size,
            ins_size,
            outs_size: 0,
            insns,
            tries: vec![],
            debug_item: None,
        }
    }
}

/// A method, shared between the transform cache and whoever else holds it
///
/// The encoded code is the method's externally visible state: it is read when the method is
/// ballooned and replaced every time its transform is synced.
pub struct DexMethod {
    id: MethodId,
    name: String,
    code: Mutex<Option<DexCode>>,
}

impl DexMethod {
    pub fn new(id: MethodId, name: impl Into<String>, code: Option<DexCode>) -> Arc<DexMethod> {
        Arc::new(DexMethod {
            id,
            name: name.into(),
            code: Mutex::new(code),
        })
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current encoded code
    pub fn code(&self) -> Option<DexCode> {
        self.code
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_code(&self, code: DexCode) {
        *self.code.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
    }
}

impl fmt::Debug for DexMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.id, self.name)
    }
}
