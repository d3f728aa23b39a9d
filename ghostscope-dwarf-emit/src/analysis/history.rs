//! Per-variable value history of one machine function
//!
//! Walks the instructions in layout order and records, for every
//! (variable, inlined-at) pair, when a debug value starts and which later
//! entry ends it: either an overlapping debug value or a clobbering
//! instruction that redefines a register the value lives in.

use crate::core::{
    DebugLabelId, DebugModule, InlinedAtId, InstrId, InstrKind, Label, MachineFunction,
    MachineInstr, Register, Result, TargetInfo, VariableId,
};
use crate::data::LabelRegistry;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// A variable as seen through one inlining chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InlinedVariable {
    pub variable: VariableId,
    pub inlined_at: Option<InlinedAtId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InlinedLabel {
    pub label: DebugLabelId,
    pub inlined_at: Option<InlinedAtId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    DbgValue,
    Clobber,
}

/// One event of a variable's history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub instr: InstrId,
    pub kind: HistoryKind,
    /// Index of the entry that ends this debug value; `None` while open
    pub end_index: Option<usize>,
}

impl HistoryEntry {
    pub fn is_dbg_value(&self) -> bool {
        self.kind == HistoryKind::DbgValue
    }

    pub fn is_clobber(&self) -> bool {
        self.kind == HistoryKind::Clobber
    }

    pub fn is_closed(&self) -> bool {
        self.end_index.is_some()
    }
}

/// Histories in first-seen order
#[derive(Debug, Default)]
pub struct DbgValueHistory {
    order: Vec<InlinedVariable>,
    entries: HashMap<InlinedVariable, Vec<HistoryEntry>>,
    labels: Vec<(InlinedLabel, InstrId)>,
}

impl DbgValueHistory {
    pub fn iter(&self) -> impl Iterator<Item = (InlinedVariable, &[HistoryEntry])> {
        self.order
            .iter()
            .map(move |var| (*var, self.entries.get(var).map(Vec::as_slice).unwrap_or(&[])))
    }

    pub fn entries(&self, var: InlinedVariable) -> &[HistoryEntry] {
        self.entries.get(&var).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn labels(&self) -> &[(InlinedLabel, InstrId)] {
        &self.labels
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty() && self.labels.is_empty()
    }

    /// At least one debug value that is not undefined
    pub fn has_non_empty_location(func: &MachineFunction, entries: &[HistoryEntry]) -> bool {
        entries.iter().any(|entry| {
            entry.is_dbg_value()
                && func
                    .instr(entry.instr)
                    .debug_value_ref()
                    .is_some_and(|value| !value.is_undef())
        })
    }

    fn list_mut(&mut self, var: InlinedVariable) -> &mut Vec<HistoryEntry> {
        if !self.entries.contains_key(&var) {
            self.order.push(var);
        }
        self.entries.entry(var).or_default()
    }

    /// Returns the new entry index, or `None` when the value repeats the
    /// still-open previous one
    fn start_dbg_value(&mut self, func: &MachineFunction, var: InlinedVariable, instr: InstrId) -> Option<usize> {
        let list = self.list_mut(var);
        if let Some(last) = list.last() {
            if last.is_dbg_value()
                && !last.is_closed()
                && func.instr(last.instr).debug_value_ref() == func.instr(instr).debug_value_ref()
            {
                trace!("Coalescing identical debug value at instruction {}", instr.0);
                return None;
            }
        }
        list.push(HistoryEntry {
            instr,
            kind: HistoryKind::DbgValue,
            end_index: None,
        });
        Some(list.len() - 1)
    }

    fn start_clobber(&mut self, var: InlinedVariable, instr: InstrId) -> usize {
        let list = self.list_mut(var);
        if let Some(last) = list.last() {
            if last.is_clobber() && last.instr == instr {
                return list.len() - 1;
            }
        }
        list.push(HistoryEntry {
            instr,
            kind: HistoryKind::Clobber,
            end_index: None,
        });
        list.len() - 1
    }

    fn end_entry(&mut self, var: InlinedVariable, index: usize, end: usize) {
        if let Some(entry) = self.entries.get_mut(&var).and_then(|l| l.get_mut(index)) {
            entry.end_index = Some(end);
        }
    }

    /// Requests the labels the location lists will reference. The first
    /// value of a parameter of this very function is pinned to the
    /// function-begin label unless a register describes it.
    pub fn request_labels(
        &self,
        module: &DebugModule,
        func: &MachineFunction,
        registry: &mut LabelRegistry,
        function_begin: Label,
    ) -> Result<()> {
        for (var, entries) in self.iter() {
            let Some(first) = entries.first() else {
                continue;
            };
            let variable = module.variable(var.variable)?;
            let own_parameter = variable.is_parameter()
                && var.inlined_at.is_none()
                && module.enclosing_subprogram(variable.scope)? == func.subprogram;
            if own_parameter {
                if let Some(value) = func.instr(first.instr).debug_value_ref() {
                    if !value.is_register_described() {
                        registry.force_before(first.instr, function_begin);
                    }
                    if value.expr.is_fragment() {
                        for (idx, entry) in entries.iter().enumerate() {
                            if !entry.is_dbg_value() {
                                continue;
                            }
                            let Some(current) = func.instr(entry.instr).debug_value_ref() else {
                                continue;
                            };
                            let overlaps_earlier = entries[..idx].iter().any(|pred| {
                                pred.is_dbg_value()
                                    && func
                                        .instr(pred.instr)
                                        .debug_value_ref()
                                        .is_some_and(|p| current.expr.fragments_overlap(&p.expr))
                            });
                            if overlaps_earlier || current.is_register_described() {
                                break;
                            }
                            registry.force_before(entry.instr, function_begin);
                        }
                    }
                }
            }
            for entry in entries {
                match entry.kind {
                    HistoryKind::DbgValue => registry.request_before(entry.instr),
                    HistoryKind::Clobber => registry.request_after(entry.instr),
                }
            }
        }
        for (_, instr) in &self.labels {
            registry.request_before(*instr);
        }
        Ok(())
    }
}

/// Register -> variables currently described by it
type RegDescribedVars = HashMap<Register, Vec<InlinedVariable>>;
/// Variable -> indices of its open debug values
type LiveEntries = HashMap<InlinedVariable, BTreeSet<usize>>;

struct HistoryBuilder<'a> {
    func: &'a MachineFunction,
    target: &'a dyn TargetInfo,
    history: DbgValueHistory,
    reg_vars: RegDescribedVars,
    live: LiveEntries,
    /// First-seen order of live variables, for deterministic block ends
    live_order: Vec<InlinedVariable>,
}

/// Computes the value history and debug-label positions of `func`
pub fn calculate_history(func: &MachineFunction, target: &dyn TargetInfo) -> DbgValueHistory {
    let mut builder = HistoryBuilder {
        func,
        target,
        history: DbgValueHistory::default(),
        reg_vars: HashMap::new(),
        live: HashMap::new(),
        live_order: Vec::new(),
    };
    let sp = target.stack_pointer();
    let frame_reg = target.frame_register(func);
    let block_count = func.blocks.len();

    for (block_idx, block) in func.blocks.iter().enumerate() {
        for id in block.instrs() {
            let instr = func.instr(id);
            if let Some(value) = instr.debug_value_ref() {
                let var = InlinedVariable {
                    variable: value.variable,
                    inlined_at: value.inlined_at,
                };
                builder.handle_new_debug_value(var, id);
            } else if let InstrKind::DebugLabel(label) = instr.kind {
                let key = InlinedLabel {
                    label,
                    inlined_at: instr.loc.and_then(|loc| loc.inlined_at),
                };
                if !builder.history.labels.iter().any(|(l, _)| *l == key) {
                    builder.history.labels.push((key, id));
                }
            }
            if instr.is_meta() {
                continue;
            }
            builder.handle_clobbers(id, instr, sp, frame_reg);
        }

        if !block.is_empty() && block_idx + 1 != block_count {
            if let Some(last) = block.last() {
                builder.end_block(last);
            }
        }
    }

    let history = builder.history;
    debug!(
        "Value history of {}: {} variables, {} labels",
        func.name,
        history.order.len(),
        history.labels.len()
    );
    history
}

impl HistoryBuilder<'_> {
    fn mark_live(&mut self, var: InlinedVariable, index: usize) {
        if !self.live_order.contains(&var) {
            self.live_order.push(var);
        }
        self.live.entry(var).or_default().insert(index);
    }

    fn add_reg_var(&mut self, reg: Register, var: InlinedVariable) {
        let vars = self.reg_vars.entry(reg).or_default();
        if !vars.contains(&var) {
            vars.push(var);
        }
    }

    fn drop_reg_var(&mut self, reg: Register, var: InlinedVariable) {
        if let Some(vars) = self.reg_vars.get_mut(&reg) {
            vars.retain(|v| *v != var);
            if vars.is_empty() {
                self.reg_vars.remove(&reg);
            }
        }
    }

    fn handle_new_debug_value(&mut self, var: InlinedVariable, id: InstrId) {
        let func = self.func;
        let Some(new_index) = self.history.start_dbg_value(func, var, id) else {
            return;
        };
        let Some(value) = func.instr(id).debug_value_ref() else {
            return;
        };

        let mut tracked: Vec<(Register, bool)> = Vec::new();
        let mut to_erase = Vec::new();
        let live_indices: Vec<usize> = self
            .live
            .get(&var)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for index in live_indices {
            let instr = self.history.entries(var)[index].instr;
            let Some(old) = func.instr(instr).debug_value_ref() else {
                continue;
            };
            let overlaps = value.expr.fragments_overlap(&old.expr);
            if overlaps {
                to_erase.push(index);
                self.history.end_entry(var, index, new_index);
            }
            if !old.expr.is_entry_value() {
                for reg in old.registers() {
                    match tracked.iter_mut().find(|(r, _)| *r == reg) {
                        Some(slot) => slot.1 |= !overlaps,
                        None => tracked.push((reg, !overlaps)),
                    }
                }
            }
        }

        if !value.expr.is_entry_value() {
            for reg in value.registers() {
                match tracked.iter_mut().find(|(r, _)| *r == reg) {
                    Some(slot) => slot.1 = true,
                    None => {
                        tracked.push((reg, true));
                        self.add_reg_var(reg, var);
                    }
                }
            }
        }

        for (reg, still_used) in tracked {
            if !still_used {
                self.drop_reg_var(reg, var);
            }
        }
        if let Some(set) = self.live.get_mut(&var) {
            for index in to_erase {
                set.remove(&index);
            }
        }
        self.mark_live(var, new_index);
    }

    fn handle_clobbers(&mut self, id: InstrId, instr: &MachineInstr, sp: Register, frame_reg: Register) {
        for def in &instr.defs {
            if instr.is_call() && *def == sp {
                continue;
            }
            // Frame register writes in prologue and epilogue do not end
            // stack locations.
            if *def == frame_reg && (instr.flags.frame_setup || instr.flags.frame_destroy) {
                continue;
            }
            let mut clobbered: Vec<Register> = self
                .reg_vars
                .keys()
                .copied()
                .filter(|reg| self.target.regs_overlap(*def, *reg))
                .collect();
            clobbered.sort();
            for reg in clobbered {
                self.clobber_register_uses(reg, id);
            }
        }
        if instr.is_call() {
            let mut clobbered: Vec<Register> = self
                .reg_vars
                .keys()
                .copied()
                .filter(|reg| *reg != sp && self.target.is_call_clobbered(*reg))
                .collect();
            clobbered.sort();
            for reg in clobbered {
                self.clobber_register_uses(reg, id);
            }
        }
    }

    fn clobber_register_uses(&mut self, reg: Register, clobbering: InstrId) {
        let func = self.func;
        let Some(vars) = self.reg_vars.remove(&reg) else {
            return;
        };
        for var in vars {
            let clobber_index = self.history.start_clobber(var, clobbering);
            let live_indices: Vec<usize> = self
                .live
                .get(&var)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            let mut to_erase = Vec::new();
            let mut maybe_removed = Vec::new();
            for index in live_indices {
                let instr = self.history.entries(var)[index].instr;
                let Some(value) = func.instr(instr).debug_value_ref() else {
                    continue;
                };
                if value.expr.is_entry_value() {
                    continue;
                }
                if value.registers().any(|r| r == reg) {
                    to_erase.push(index);
                    self.history.end_entry(var, index, clobber_index);
                    maybe_removed.extend(value.registers().filter(|r| *r != reg));
                }
            }
            if let Some(set) = self.live.get_mut(&var) {
                for index in &to_erase {
                    set.remove(index);
                }
            }
            // Stop tracking registers no remaining open value uses.
            for other in maybe_removed {
                let still_used = self.live.get(&var).is_some_and(|set| {
                    set.iter().any(|index| {
                        let instr = self.history.entries(var)[*index].instr;
                        func.instr(instr)
                            .debug_value_ref()
                            .is_some_and(|v| v.registers().any(|r| r == other))
                    })
                });
                if !still_used {
                    self.drop_reg_var(other, var);
                }
            }
            trace!(
                "Instruction {} clobbers {:?} for variable {}",
                clobbering.0,
                reg,
                var.variable.0
            );
        }
    }

    /// Values do not flow across block boundaries
    fn end_block(&mut self, last: InstrId) {
        let order = std::mem::take(&mut self.live_order);
        for var in order {
            let Some(indices) = self.live.remove(&var) else {
                continue;
            };
            if indices.is_empty() {
                continue;
            }
            let clobber_index = self.history.start_clobber(var, last);
            for index in indices {
                self.history.end_entry(var, index, clobber_index);
            }
        }
        self.live.clear();
        self.reg_vars.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DbgOperand, DbgValue, GenericTarget};

    fn value(var: u32, operand: DbgOperand) -> MachineInstr {
        MachineInstr::debug_value(DbgValue::new(VariableId(var), operand), None)
    }

    fn def(reg: u16) -> MachineInstr {
        let mut instr = MachineInstr::regular(2, None);
        instr.defs.push(Register(reg));
        instr
    }

    fn var(id: u32) -> InlinedVariable {
        InlinedVariable {
            variable: VariableId(id),
            inlined_at: None,
        }
    }

    #[test]
    fn test_register_def_clobbers_value() {
        let target = GenericTarget::x86_64();
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        func.push(value(0, DbgOperand::Register(Register(5)))).unwrap();
        func.push(MachineInstr::regular(1, None)).unwrap();
        func.push(def(5)).unwrap();
        func.push(MachineInstr::regular(1, None)).unwrap();

        let history = calculate_history(&func, &target);
        let entries = history.entries(var(0));
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dbg_value());
        assert_eq!(entries[0].end_index, Some(1));
        assert!(entries[1].is_clobber());
        assert_eq!(entries[1].instr, InstrId(2));
    }

    #[test]
    fn test_new_value_ends_overlapping_one() {
        let target = GenericTarget::x86_64();
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        func.push(value(0, DbgOperand::Immediate(1))).unwrap();
        func.push(MachineInstr::regular(1, None)).unwrap();
        func.push(value(0, DbgOperand::Immediate(2))).unwrap();
        // identical value is coalesced
        func.push(value(0, DbgOperand::Immediate(2))).unwrap();

        let history = calculate_history(&func, &target);
        let entries = history.entries(var(0));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].end_index, Some(1));
        assert_eq!(entries[1].end_index, None);
    }

    #[test]
    fn test_calls_clobber_caller_saved_only() {
        let target = GenericTarget::x86_64();
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        func.push(value(0, DbgOperand::Register(Register(5)))).unwrap();
        func.push(value(1, DbgOperand::Register(Register(3)))).unwrap();
        func.push(MachineInstr::call(5, None, crate::core::Callee::Register(Register(0))))
            .unwrap();

        let history = calculate_history(&func, &target);
        assert_eq!(history.entries(var(0)).len(), 2);
        assert_eq!(history.entries(var(1)).len(), 1);
    }

    #[test]
    fn test_block_end_closes_everything() {
        let target = GenericTarget::x86_64();
        let mut func = MachineFunction::new("f", None);
        let b0 = func.add_block(0);
        func.push(value(0, DbgOperand::Immediate(7))).unwrap();
        func.push(MachineInstr::regular(1, None)).unwrap();
        let b1 = func.add_block(0);
        func.push(MachineInstr::regular(1, None)).unwrap();
        func.add_edge(b0, b1);

        let history = calculate_history(&func, &target);
        let entries = history.entries(var(0));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].instr, InstrId(1));
        assert!(entries[1].is_clobber());
    }
}
