//! Splicing one method's body into another
//!
//! Two entry points:
//!
//!   - [`inline_tail_call`] assumes the caller does nothing after the call, so the callee's
//!     returns can stay returns and every caller register other than the arguments is free.
//!
//!   - [`inline_16regs`] works anywhere, using liveness at the call site to find registers the
//!     callee's locals can use. It declines (returning `false`) rather than producing code that
//!     does not fit the register budget or that would need nested exception regions.
//!
//! In both cases the callee's parameters are mapped positionally onto the registers passed at the
//! call site and the callee body is cloned node for node, with branch targets, try markers and
//! catch chains re-linked to the clones.

use super::{
    enclosing_catches, EntryId, FatMethod, LivenessMap, MethodItem, MethodItemEntry,
    MethodTransform, MethodTransformer, TransformRegistry,
};
use super::{BranchTargetType, Liveness};
use crate::dex::{DexInstruction, DexMethod, DexOpcode, Reg};
use crate::util::BitSet;
use std::collections::HashMap;
use std::sync::Arc;

/// Tunables of [`inline_16regs`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InlinePolicy {
    /// Largest register frame the caller may be widened to
    pub max_registers: u16,
}

impl Default for InlinePolicy {
    fn default() -> InlinePolicy {
        InlinePolicy { max_registers: 16 }
    }
}

/// State shared by a series of inlines into the same caller
///
/// Liveness of the caller is computed on first use and then reused for every later inline. Since
/// inlining may widen the caller's frame (moving its parameter registers up), cached answers are
/// translated through the accumulated shift.
pub struct InlineContext<'r> {
    registry: &'r TransformRegistry,
    pub mtcaller: MethodTransformer<'r>,

    /// Caller frame size when the context was created
    pub original_regs: u16,
    original_ins: u16,
    register_shift: u16,
    use_liveness: bool,

    /// Cached map, along with the register shift at the time it was computed
    liveness: Option<(LivenessMap, u16)>,
    pub policy: InlinePolicy,
}

impl<'r> InlineContext<'r> {
    pub fn new(
        registry: &'r TransformRegistry,
        caller: &Arc<DexMethod>,
        use_liveness: bool,
    ) -> InlineContext<'r> {
        let mtcaller = MethodTransformer::new(registry, caller, use_liveness);
        let (original_regs, original_ins) = {
            let caller = mtcaller.lock();
            (caller.registers_size(), caller.ins_size())
        };
        InlineContext {
            registry,
            mtcaller,
            original_regs,
            original_ins,
            register_shift: 0,
            use_liveness,
            liveness: None,
            policy: InlinePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: InlinePolicy) -> InlineContext<'r> {
        self.policy = policy;
        self
    }

    /// Registers the caller's frame has grown by since the context was created
    pub fn register_shift(&self) -> u16 {
        self.register_shift
    }

    /// Registers that may be live right after `insn` in the caller
    ///
    /// Without liveness, or for an instruction the analysis has not seen (because it was added
    /// after the analysis ran), every register of the frame is reported live.
    pub fn live_out(&mut self, insn: EntryId) -> Liveness {
        let registers_size = self.mtcaller.lock().registers_size() as usize;
        if !self.use_liveness {
            return BitSet::full(registers_size);
        }

        if self.liveness.is_none() {
            let mut caller = self.mtcaller.lock();
            if caller.cfg().is_none() {
                caller.build_cfg();
            }
            let map = match caller.cfg() {
                Some(cfg) => LivenessMap::compute(caller.fat_method(), cfg),
                None => unreachable!("CFG was just built"),
            };
            log::debug!("Computed liveness of {:?}", caller.method());
            self.liveness = Some((map, self.register_shift));
        }

        let (map, shift_then) = match &self.liveness {
            Some((map, shift_then)) => (map, *shift_then),
            None => unreachable!("liveness was just computed"),
        };
        let live = match map.live_out(insn) {
            Some(live) => live,
            None => return BitSet::full(registers_size),
        };
        let first_param_then = (self.original_regs + shift_then - self.original_ins) as usize;
        let shift = (self.register_shift - shift_then) as usize;
        live.iter()
            .map(|reg| if reg >= first_param_then { reg + shift } else { reg })
            .collect()
    }
}

/// Copy of a callee's body and frame
struct CalleeSnapshot {
    entries: Vec<(EntryId, MethodItemEntry)>,
    registers_size: u16,
    ins_size: u16,
}

impl CalleeSnapshot {
    fn take(registry: &TransformRegistry, callee: &Arc<DexMethod>) -> CalleeSnapshot {
        let transform = registry.get_method_transform(callee, false);
        let callee = transform.lock();
        CalleeSnapshot {
            entries: callee
                .iter()
                .map(|(id, entry)| (id, entry.clone()))
                .collect(),
            registers_size: callee.registers_size(),
            ins_size: callee.ins_size(),
        }
    }

    fn first_param(&self) -> Reg {
        self.registers_size - self.ins_size
    }

    fn has_tries(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, entry)| matches!(entry.item, MethodItem::Try(_)))
    }

    /// Registers the callee writes
    fn written(&self) -> BitSet {
        self.entries
            .iter()
            .filter_map(|(_, entry)| entry.insn())
            .filter_map(|insn| insn.dest())
            .map(|reg| reg as usize)
            .collect()
    }

    /// Can every callee instruction be encoded after remapping its registers?
    fn fits(&self, reg_map: &[Reg]) -> bool {
        self.entries
            .iter()
            .filter_map(|(_, entry)| entry.insn())
            .all(|insn| {
                let mut insn = insn.clone();
                insn.map_registers(|reg| reg_map[reg as usize]);
                insn.max_register()
                    .map_or(true, |reg| reg as u32 <= insn.widest_register_limit())
            })
    }

    /// Callee register mapping: locals onto `locals`, parameters onto `args`
    fn register_map(&self, locals: &[Reg], args: &[Reg]) -> Vec<Reg> {
        let first_param = self.first_param() as usize;
        (0..self.registers_size as usize)
            .map(|reg| {
                if reg < first_param {
                    locals[reg]
                } else {
                    args[reg - first_param]
                }
            })
            .collect()
    }
}

/// Can every caller instruction still be encoded with its registers moved by `shifted`?
fn caller_fits(caller: &MethodTransform, shifted: impl Fn(Reg) -> Reg) -> bool {
    caller.iter().filter_map(|(_, entry)| entry.insn()).all(|insn| {
        insn.max_register()
            .map_or(true, |reg| shifted(reg) as u32 <= insn.widest_register_limit())
    })
}

/// Instruction at `invoke`, checked to be an invoke
fn invoke_args(caller: &MethodTransform, invoke: EntryId) -> Vec<Reg> {
    match caller.fat_method()[invoke].insn() {
        Some(insn) if insn.opcode().is_invoke() => insn.srcs().to_vec(),
        _ => panic!("{:?} is not an invoke", invoke),
    }
}

/// `move-result*` belonging to the invoke, if any
fn move_result_of(fmethod: &FatMethod, invoke: EntryId) -> Option<(EntryId, Reg)> {
    let mut cursor = fmethod.next(invoke);
    while let Some(id) = cursor {
        match &fmethod[id].item {
            MethodItem::Opcode(insn) if insn.opcode().is_move_result() => {
                return insn.dest().map(|dest| (id, dest))
            }
            MethodItem::Opcode(_) => return None,
            _ => cursor = fmethod.next(id),
        }
    }
    None
}

/// Clone the callee nodes in front of `invoke` with registers remapped and internal references
/// re-linked. `rewrite_return` gets to replace each return (returning the nodes it emitted).
fn splice(
    fmethod: &mut FatMethod,
    invoke: EntryId,
    callee: &CalleeSnapshot,
    reg_map: &[Reg],
    mut rewrite_return: impl FnMut(&mut FatMethod, &DexInstruction, bool) -> Vec<EntryId>,
) -> usize {
    let last_insn = callee
        .entries
        .iter()
        .rev()
        .find(|(_, entry)| entry.is_opcode())
        .map(|(id, _)| *id);

    let mut id_map: HashMap<EntryId, EntryId> = HashMap::new();
    let mut inserted = 0;
    for (old_id, entry) in &callee.entries {
        let mut entry = entry.clone();
        if let Some(insn) = entry.insn_mut() {
            insn.map_registers(|reg| reg_map[reg as usize]);
            if insn.opcode().is_return() {
                let is_last = Some(*old_id) == last_insn;
                let emitted = rewrite_return(fmethod, insn, is_last);
                if let Some(first) = emitted.first() {
                    id_map.insert(*old_id, *first);
                }
                inserted += emitted.len();
                continue;
            }
        }
        let new_id = fmethod.insert_before(Some(invoke), entry);
        id_map.insert(*old_id, new_id);
        inserted += 1;
    }

    let relink = |id: EntryId| match id_map.get(&id) {
        Some(new_id) => *new_id,
        None => panic!("callee node {:?} refers outside the callee", id),
    };
    for new_id in id_map.values() {
        match &mut fmethod[*new_id].item {
            MethodItem::Try(try_entry) => try_entry.catch_start = relink(try_entry.catch_start),
            MethodItem::Catch(catch) => catch.next = catch.next.map(relink),
            MethodItem::Target(target) => target.src = relink(target.src),
            _ => (),
        }
    }
    inserted
}

/// Replace a tail call with the body of the callee
///
/// The caller must not do any work after the call, so the callee's returns are kept as they are
/// and only the argument registers are live at the call. Callee parameters map onto the argument
/// registers in order (which must therefore be distinct) and callee locals onto the lowest other
/// caller registers, widening the caller's frame if there are not enough of them.
pub fn inline_tail_call(
    registry: &TransformRegistry,
    caller: &Arc<DexMethod>,
    callee: &Arc<DexMethod>,
    invoke: EntryId,
) {
    assert_ne!(caller.id(), callee.id(), "cannot tail-inline {:?} into itself", caller);
    let callee = CalleeSnapshot::take(registry, callee);
    let transform = registry.get_method_transform(caller, false);
    let mut caller_mt = transform.lock();

    let args = invoke_args(&caller_mt, invoke);
    assert_eq!(
        args.len(),
        callee.ins_size as usize,
        "invoke arity does not match callee parameters"
    );
    let distinct: BitSet = args.iter().map(|reg| *reg as usize).collect();
    assert_eq!(distinct.len(), args.len(), "tail call passes a register twice");

    // Locals go to the lowest registers not holding arguments
    let locals_needed = callee.first_param() as usize;
    let registers_size = caller_mt.registers_size();
    let available = registers_size as usize - args.len();
    let shortfall = locals_needed.saturating_sub(available) as u16;
    let first_param = registers_size - caller_mt.ins_size();
    let shifted = |reg: Reg| if reg >= first_param { reg + shortfall } else { reg };
    let args: Vec<Reg> = args.into_iter().map(shifted).collect();
    let locals: Vec<Reg> = (0..registers_size + shortfall)
        .filter(|reg| !args.contains(reg))
        .take(locals_needed)
        .collect();
    let reg_map = callee.register_map(&locals, &args);

    assert!(
        shortfall == 0 || caller_fits(&caller_mt, shifted),
        "tail call needs {} more registers, which caller {:?} cannot address",
        shortfall,
        caller_mt.method()
    );
    assert!(
        callee.fits(&reg_map),
        "callee registers of tail call in {:?} cannot be encoded after remapping",
        caller_mt.method()
    );
    if shortfall > 0 {
        caller_mt.enlarge_registers(shortfall);
    }

    let before = caller_mt.len();
    let fmethod = caller_mt.fat_method_mut();
    let inserted = splice(fmethod, invoke, &callee, &reg_map, |fmethod, ret, _| {
        vec![fmethod.insert_before(Some(invoke), MethodItemEntry::opcode(ret.clone()))]
    });
    caller_mt.remove_opcode(invoke);
    debug_assert_eq!(caller_mt.len(), before + inserted - 1);
    log::debug!(
        "Tail-inlined {} nodes into {:?}",
        inserted,
        caller_mt.method()
    );
}

/// Inline `callee` at `invoke`, reusing dead caller registers for the callee's locals
///
/// Returns `false` (leaving the caller untouched) when inlining is not possible:
///
///   - the callee is the caller
///   - the invoke does not pass exactly one register per callee parameter
///   - the callee writes to a parameter whose argument register is still needed afterwards (or
///     is passed for another parameter too)
///   - both the call site and the callee are inside try regions
///   - the callee's locals cannot be placed within the register budget
///
/// Locals take the lowest registers that are dead after the call and are neither arguments nor
/// the destination of the call's `move-result`. If there are not enough, the caller's frame grows
/// by the shortfall (up to `policy.max_registers`).
pub fn inline_16regs(context: &mut InlineContext<'_>, callee: &Arc<DexMethod>, invoke: EntryId) -> bool {
    let caller_id = context.mtcaller.lock().method().id();
    if caller_id == callee.id() {
        return false;
    }
    let callee = CalleeSnapshot::take(context.registry, callee);

    let (args, move_result, invoke_in_try, registers_size, ins_size) = {
        let caller = context.mtcaller.lock();
        let args = invoke_args(&caller, invoke);
        let move_result = move_result_of(caller.fat_method(), invoke);
        let in_try = enclosing_catches(caller.fat_method()).contains_key(&invoke);
        (args, move_result, in_try, caller.registers_size(), caller.ins_size())
    };
    if args.len() != callee.ins_size as usize {
        log::debug!("Not inlining: {} args for {} params", args.len(), callee.ins_size);
        return false;
    }
    if invoke_in_try && callee.has_tries() {
        log::debug!("Not inlining: callee has try regions and call site is in one");
        return false;
    }

    let live = context.live_out(invoke);
    let written = callee.written();
    for (idx, arg) in args.iter().enumerate() {
        let param = (callee.first_param() as usize) + idx;
        if !written.contains(param) {
            continue;
        }
        let shared = args.iter().filter(|other| *other == arg).count() > 1;
        if live.contains(*arg as usize) || shared {
            log::debug!("Not inlining: callee clobbers live argument v{}", arg);
            return false;
        }
    }

    // Registers for the callee's locals
    let dest = move_result.map(|(_, dest)| dest);
    let mut free: Vec<Reg> = (0..registers_size)
        .filter(|reg| {
            !live.contains(*reg as usize) && !args.contains(reg) && Some(*reg) != dest
        })
        .collect();
    let locals_needed = callee.first_param() as usize;
    let shortfall = locals_needed.saturating_sub(free.len()) as u16;
    let first_param = registers_size - ins_size;
    let shifted = |reg: Reg| if reg >= first_param { reg + shortfall } else { reg };
    if shortfall > 0 {
        if registers_size as u32 + shortfall as u32 > context.policy.max_registers as u32 {
            log::debug!("Not inlining: needs {} more registers than the budget", shortfall);
            return false;
        }
        if !caller_fits(&context.mtcaller.lock(), shifted) {
            log::debug!("Not inlining: widening the frame breaks caller instructions");
            return false;
        }
        free = free.into_iter().map(shifted).collect();
        free.extend(first_param..first_param + shortfall);
        free.sort_unstable();
    }
    let locals: Vec<Reg> = free.into_iter().take(locals_needed).collect();
    let args: Vec<Reg> = args.into_iter().map(shifted).collect();
    let dest = dest.map(shifted);
    let reg_map = callee.register_map(&locals, &args);

    if !callee.fits(&reg_map) {
        log::debug!("Not inlining: callee registers do not fit after remapping");
        return false;
    }

    // Point of no return
    let mut caller = context.mtcaller.lock();
    if shortfall > 0 {
        caller.enlarge_registers(shortfall);
        context.register_shift += shortfall;
    }
    let fmethod = caller.fat_method_mut();
    let after_call = move_result.map_or(invoke, |(id, _)| id);
    let continuation = fmethod.insert_after(Some(after_call), MethodItemEntry::fallthrough());
    let mut join_gotos = vec![];
    splice(fmethod, invoke, &callee, &reg_map, |fmethod, ret, is_last| {
        let mut emitted = vec![];
        if let (Some(dest), Some(src)) = (dest, ret.srcs().first().copied()) {
            let mov = if ret.opcode() == DexOpcode::ReturnObject {
                DexOpcode::MoveObject
            } else {
                DexOpcode::Move
            };
            let mov = DexInstruction::new(mov).with_dest(dest).with_srcs(vec![src]);
            emitted.push(fmethod.insert_before(Some(invoke), MethodItemEntry::opcode(mov)));
        }
        if !is_last {
            let goto = MethodItemEntry::opcode(DexInstruction::new(DexOpcode::Goto));
            let goto = fmethod.insert_before(Some(invoke), goto);
            join_gotos.push(goto);
            emitted.push(goto);
        }
        emitted
    });
    for goto in join_gotos {
        fmethod.insert_before(
            Some(continuation),
            MethodItemEntry::target(BranchTargetType::Simple, goto),
        );
    }
    if let Some((move_result, _)) = move_result {
        caller.remove_opcode(move_result);
    }
    caller.remove_opcode(invoke);
    log::debug!(
        "Inlined {} nodes into {:?} ({} new registers)",
        callee.entries.len(),
        caller.method(),
        shortfall
    );
    true
}
