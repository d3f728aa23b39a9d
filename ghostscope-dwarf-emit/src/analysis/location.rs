//! Reduces value histories to location descriptions
//!
//! Every variable of a function ends up with exactly one `VariableLocation`:
//! a single value valid throughout its scope, a set of frame slots, a set of
//! entry-value registers, or a list of address ranges with the values live
//! in each of them.

use crate::analysis::history::{DbgValueHistory, HistoryEntry, InlinedLabel, InlinedVariable};
use crate::analysis::scopes::{LexicalScopeRef, LexicalScopes};
use crate::core::{
    DbgOperand, DbgValue, DbgValueLoc, DbgValueLocEntry, DebugModule, EmitError, Expression,
    InstrId, Label, MachineFunction, MachineLocation, Register, Result, ScopeId,
};
use crate::data::{FunctionLabels, LabelRegistry};
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// A variable stored in a frame slot for its whole lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSlot {
    pub location: MachineLocation,
    pub expr: Expression,
}

/// Location description of one concrete variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableLocation {
    /// One value valid throughout the variable's scope
    Single(DbgValueLoc),
    /// Frame slots, one per fragment, sorted by fragment offset
    StackSlots(Vec<FrameSlot>),
    /// Value of each register at function entry, one per fragment
    EntryValue(Vec<(Register, Expression)>),
    /// Address ranges with the values live in each
    List(Vec<DebugLocEntry>),
}

/// One range of a location list. `values` holds either a single
/// unfragmented value or fragments sorted by bit offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugLocEntry {
    pub begin: Label,
    pub end: Label,
    pub values: Vec<DbgValueLoc>,
}

impl DebugLocEntry {
    pub fn new(begin: Label, end: Label, values: Vec<DbgValueLoc>) -> Self {
        let mut entry = Self {
            begin,
            end,
            values,
        };
        entry.sort_unique_values();
        entry
    }

    fn sort_unique_values(&mut self) {
        self.values.sort_by(|a, b| a.fragment_order(b));
        self.values.dedup_by(|a, b| a.expr == b.expr);
    }

    /// Extends `self` over `next` when they are adjacent and describe the
    /// same values
    pub fn merge_ranges(&mut self, next: &DebugLocEntry) -> bool {
        if self.end != next.begin || self.values != next.values {
            return false;
        }
        self.end = next.end;
        true
    }
}

/// Converts a debug-value instruction into its resolved value
pub fn debug_loc_value(value: &DbgValue) -> DbgValueLoc {
    let values = value
        .operands
        .iter()
        .filter_map(|op| match *op {
            DbgOperand::Register(reg) => Some(DbgValueLocEntry::Location(MachineLocation {
                reg,
                indirect: value.indirect,
                offset: 0,
            })),
            DbgOperand::Immediate(v) => Some(DbgValueLocEntry::Int(v)),
            DbgOperand::FloatImm { bits, bytes } => Some(DbgValueLocEntry::ConstantFp { bits, bytes }),
            DbgOperand::ConstantInt(v) => Some(DbgValueLocEntry::ConstantInt(v)),
            DbgOperand::TargetIndex { index, offset } => {
                Some(DbgValueLocEntry::TargetIndex { index, offset })
            }
            DbgOperand::Undef => None,
        })
        .collect();
    DbgValueLoc {
        expr: value.expr.clone(),
        values,
        variadic: value.variadic,
    }
}

/// Concrete variable of a function, attached to a lexical scope
#[derive(Debug, Clone)]
pub struct ConcreteVariable {
    pub var: InlinedVariable,
    pub scope: LexicalScopeRef,
    /// `None` for retained variables without any location
    pub location: Option<VariableLocation>,
}

#[derive(Debug, Clone)]
pub struct ConcreteLabel {
    pub label: InlinedLabel,
    pub scope: LexicalScopeRef,
    pub symbol: Label,
}

#[derive(Debug, Default)]
pub struct FunctionEntities {
    pub variables: Vec<ConcreteVariable>,
    pub labels: Vec<ConcreteLabel>,
}

/// Everything the reducer reads about the function being finished
pub struct LocationContext<'a> {
    pub module: &'a DebugModule,
    pub func: &'a MachineFunction,
    pub scopes: &'a LexicalScopes,
    pub registry: &'a LabelRegistry,
    pub labels: &'a FunctionLabels,
    pub legacy_constant_promotion: bool,
}

impl LocationContext<'_> {
    fn value(&self, instr: InstrId) -> Result<&DbgValue> {
        self.func.instr(instr).debug_value_ref().ok_or_else(|| {
            EmitError::Invariant(format!("instruction {} is not a debug value", instr.0)).into()
        })
    }

    /// Scope the value's location refers to
    fn value_scope(&self, instr: InstrId) -> Result<(ScopeId, Option<LexicalScopeRef>)> {
        let value = self.value(instr)?;
        let (scope, inlined_at) = match self.func.instr(instr).loc {
            Some(loc) => (loc.scope, loc.inlined_at),
            None => (self.module.variable(value.variable)?.scope, value.inlined_at),
        };
        Ok((scope, self.scopes.find_scope(self.module, scope, inlined_at)))
    }

    fn label_before(&self, instr: InstrId) -> Result<Label> {
        self.registry.label_before(instr).ok_or_else(|| {
            EmitError::Invariant(format!("no label before instruction {}", instr.0)).into()
        })
    }

    fn label_after(&self, instr: InstrId) -> Result<Label> {
        self.registry.label_after(instr).ok_or_else(|| {
            EmitError::Invariant(format!("no label after instruction {}", instr.0)).into()
        })
    }

    fn section_range(&self, section: u32) -> Result<(Label, Label)> {
        self.labels.section_range(section).ok_or_else(|| {
            EmitError::Invariant(format!(
                "function {} has no labels for section {}",
                self.func.name, section
            ))
            .into()
        })
    }

    /// Whether a value defined at `dbg_value` and ended at `range_end`
    /// (open-ended when `None`) covers the whole of its scope
    pub fn valid_throughout(&self, dbg_value: InstrId, range_end: Option<InstrId>) -> Result<bool> {
        let (scope_desc, scope) = self.value_scope(dbg_value)?;
        let Some(scope) = scope else {
            return Ok(false);
        };
        let ranges = &self.scopes.scope(scope).ranges;
        let (Some(first_range), Some(last_range)) = (ranges.first(), ranges.last()) else {
            return Ok(false);
        };
        let block_id = self.func.block_of(dbg_value);
        let scope_begin = first_range.first;
        if dbg_value >= scope_begin {
            if self.func.block_of(scope_begin) != block_id {
                return Ok(false);
            }
            let block = self.func.block(block_id);
            for pred in (block.first..dbg_value.0).rev().map(InstrId) {
                let instr = self.func.instr(pred);
                if instr.flags.frame_setup {
                    break;
                }
                let Some(loc) = instr.loc else {
                    continue;
                };
                if instr.is_meta() {
                    continue;
                }
                if loc.scope == scope_desc {
                    return Ok(false);
                }
                match self.scopes.find_scope(self.module, loc.scope, loc.inlined_at) {
                    Some(pred_scope) if !self.scopes.dominates(scope, pred_scope) => {}
                    _ => return Ok(false),
                }
            }
        }

        let Some(range_end) = range_end else {
            return Ok(true);
        };

        if self.legacy_constant_promotion
            && self.func.block(block_id).preds.is_empty()
            && self
                .value(dbg_value)?
                .operands
                .iter()
                .all(|op| matches!(op, DbgOperand::Immediate(_)))
        {
            return Ok(true);
        }

        Ok(range_end >= last_range.last)
    }

    /// Builds the list for one history. Returns the entries and whether they
    /// collapse to a single location valid throughout the scope.
    pub fn build_location_list(&self, entries: &[HistoryEntry]) -> Result<(Vec<DebugLocEntry>, bool)> {
        let mut list: Vec<DebugLocEntry> = Vec::new();
        let mut open: Vec<(usize, DbgValueLoc)> = Vec::new();
        let mut safe_for_single = true;
        let mut start_debug_instr: Option<InstrId> = None;
        let mut end_instr: Option<InstrId> = None;
        let primary = self.func.primary_section();

        for (index, entry) in entries.iter().enumerate() {
            open.retain(|(end, _)| *end > index);

            let start = if entry.is_clobber() {
                self.label_after(entry.instr)?
            } else {
                self.label_before(entry.instr)?
            };

            let end = match entries.get(index + 1) {
                None => {
                    let last_block = self.func.blocks.len().saturating_sub(1);
                    let section = self.func.blocks.get(last_block).map(|b| b.section).unwrap_or(primary);
                    if entry.is_clobber() {
                        end_instr = Some(entry.instr);
                    }
                    self.section_range(section)?.1
                }
                Some(next) if next.is_clobber() => self.label_after(next.instr)?,
                Some(next) => self.label_before(next.instr)?,
            };

            if entry.is_dbg_value() {
                let value = self.value(entry.instr)?;
                if !value.is_undef() {
                    open.push((entry.end_index.unwrap_or(usize::MAX), debug_loc_value(value)));
                    if value.expr.is_fragment() {
                        safe_for_single = false;
                    }
                    if start_debug_instr.is_none() {
                        start_debug_instr = Some(entry.instr);
                    }
                } else {
                    safe_for_single = false;
                }
            }

            if open.is_empty() {
                continue;
            }
            if start == end {
                trace!("Omitting location list entry with empty range");
                continue;
            }

            let values: Vec<DbgValueLoc> = open.iter().map(|(_, v)| v.clone()).collect();
            let instr_section = self.func.block(self.func.block_of(entry.instr)).section;
            if start == self.labels.begin && instr_section != primary {
                // Split across every section up to the one holding the value.
                for (section, _) in self.func.section_last_blocks() {
                    let (section_begin, section_end) = self.section_range(section)?;
                    if section == instr_section {
                        list.push(DebugLocEntry::new(section_begin, end, values.clone()));
                        break;
                    }
                    list.push(DebugLocEntry::new(section_begin, section_end, values.clone()));
                }
            } else {
                list.push(DebugLocEntry::new(start, end, values));
            }

            if list.len() >= 2 {
                let current = list[list.len() - 1].clone();
                let prev_idx = list.len() - 2;
                if list[prev_idx].merge_ranges(&current) {
                    list.pop();
                }
            }
        }

        let Some(start_debug_instr) = start_debug_instr else {
            return Ok((list, false));
        };
        if !safe_for_single || !self.valid_throughout(start_debug_instr, end_instr)? {
            return Ok((list, false));
        }
        if list.len() == 1 {
            return Ok((list, true));
        }
        let sections = self.func.section_last_blocks();
        if sections.len() < 2 {
            return Ok((list, false));
        }
        let collapses = self.collapses_across_sections(&list, entries, &sections)?;
        Ok((list, collapses))
    }

    /// Entries that split only at section boundaries with identical values
    /// still describe one location
    fn collapses_across_sections(
        &self,
        list: &[DebugLocEntry],
        entries: &[HistoryEntry],
        sections: &[(u32, crate::core::BlockId)],
    ) -> Result<bool> {
        let Some(first) = list.first() else {
            return Ok(false);
        };
        let range_section = if first.begin == self.labels.begin {
            self.func.primary_section()
        } else {
            match entries.first() {
                Some(entry) => self.func.block(self.func.block_of(entry.instr)).section,
                None => return Ok(false),
            }
        };
        let Some(mut pos) = sections.iter().position(|(s, _)| *s == range_section) else {
            return Ok(false);
        };
        for pair in list.windows(2) {
            let (current, next) = (&pair[0], &pair[1]);
            let Some((next_section, _)) = sections.get(pos + 1) else {
                return Ok(false);
            };
            let (_, section_end) = self.section_range(sections[pos].0)?;
            let (next_begin, _) = self.section_range(*next_section)?;
            if (section_end != self.labels.end && current.end != section_end)
                || next.begin != next_begin
                || current.values != next.values
            {
                return Ok(false);
            }
            pos += 1;
        }
        Ok(true)
    }

    /// Collects concrete variables and labels of the function, in the order
    /// frame-slot table, value histories, debug labels, retained nodes
    pub fn collect_entities(&self, history: &DbgValueHistory) -> Result<FunctionEntities> {
        let mut out = FunctionEntities::default();
        let mut processed: HashSet<InlinedVariable> = HashSet::new();

        self.collect_frame_variables(&mut out, &mut processed)?;

        for (var, entries) in history.iter() {
            if processed.contains(&var) {
                continue;
            }
            if !DbgValueHistory::has_non_empty_location(self.func, entries) {
                continue;
            }
            let variable = self.module.variable(var.variable)?;
            let scope = match var.inlined_at {
                Some(ia) => self.scopes.find_inlined_scope(self.module, variable.scope, ia),
                None => self.scopes.find_lexical_scope(self.module, variable.scope),
            };
            let Some(scope) = scope else {
                debug!("Dropping variable '{}': scope not found", variable.name);
                continue;
            };
            processed.insert(var);

            let Some(first) = entries.first() else {
                continue;
            };
            let single_with_clobber = entries.len() == 2 && entries[1].is_clobber();
            if entries.len() == 1 || single_with_clobber {
                let end = if single_with_clobber {
                    Some(entries[1].instr)
                } else {
                    None
                };
                if self.valid_throughout(first.instr, end)? {
                    let value = debug_loc_value(self.value(first.instr)?);
                    out.variables.push(ConcreteVariable {
                        var,
                        scope,
                        location: Some(VariableLocation::Single(value)),
                    });
                    continue;
                }
            }

            let (list, single) = self.build_location_list(entries)?;
            let location = if single {
                list.first()
                    .and_then(|entry| entry.values.first().cloned())
                    .map(VariableLocation::Single)
            } else if list.is_empty() {
                None
            } else {
                Some(VariableLocation::List(list))
            };
            trace!(
                "Variable '{}' reduced to {:?}",
                variable.name,
                location.as_ref().map(location_kind)
            );
            out.variables.push(ConcreteVariable {
                var,
                scope,
                location,
            });
        }

        for (label, instr) in history.labels() {
            let meta = self.module.label(label.label)?;
            let local = self.module.non_file_scope(meta.scope)?;
            let scope = match label.inlined_at {
                Some(ia) => self.scopes.find_inlined_scope(self.module, local, ia),
                None => self.scopes.find_lexical_scope(self.module, local),
            };
            let Some(scope) = scope else {
                continue;
            };
            out.labels.push(ConcreteLabel {
                label: *label,
                scope,
                symbol: self.label_before(*instr)?,
            });
        }

        if let Some(sp) = self.func.subprogram {
            for variable_id in &self.module.subprogram(sp)?.retained_nodes {
                let var = InlinedVariable {
                    variable: *variable_id,
                    inlined_at: None,
                };
                if !processed.insert(var) {
                    continue;
                }
                let variable = self.module.variable(*variable_id)?;
                if let Some(scope) = self.scopes.find_lexical_scope(self.module, variable.scope) {
                    out.variables.push(ConcreteVariable {
                        var,
                        scope,
                        location: None,
                    });
                }
            }
        }

        debug!(
            "Collected {} variables and {} labels for {}",
            out.variables.len(),
            out.labels.len(),
            self.func.name
        );
        Ok(out)
    }

    fn collect_frame_variables(
        &self,
        out: &mut FunctionEntities,
        processed: &mut HashSet<InlinedVariable>,
    ) -> Result<()> {
        enum Record<'r> {
            Slot(&'r crate::core::StackSlotVar),
            Entry(&'r crate::core::EntryValueVar),
        }
        let records = self
            .func
            .stack_slot_vars
            .iter()
            .map(Record::Slot)
            .chain(self.func.entry_value_vars.iter().map(Record::Entry));

        for record in records {
            let (variable_id, inlined_at) = match record {
                Record::Slot(slot) => (slot.variable, slot.inlined_at),
                Record::Entry(entry) => (entry.variable, entry.inlined_at),
            };
            let var = InlinedVariable {
                variable: variable_id,
                inlined_at,
            };
            let variable = self.module.variable(variable_id)?;
            let Some(scope) = self.scopes.find_scope(self.module, variable.scope, inlined_at) else {
                debug!("Dropping frame variable '{}': scope not found", variable.name);
                continue;
            };
            processed.insert(var);

            let existing = out.variables.iter_mut().find(|v| v.var == var);
            let Some(existing) = existing else {
                let location = match record {
                    Record::Slot(slot) => VariableLocation::StackSlots(vec![FrameSlot {
                        location: MachineLocation::memory(slot.frame_reg, slot.offset),
                        expr: slot.expr.clone(),
                    }]),
                    Record::Entry(entry) => {
                        VariableLocation::EntryValue(vec![(entry.register, entry.expr.clone())])
                    }
                };
                out.variables.push(ConcreteVariable {
                    var,
                    scope,
                    location: Some(location),
                });
                continue;
            };

            match (&mut existing.location, record) {
                (Some(VariableLocation::StackSlots(slots)), Record::Slot(slot)) => {
                    let new = FrameSlot {
                        location: MachineLocation::memory(slot.frame_reg, slot.offset),
                        expr: slot.expr.clone(),
                    };
                    if slots.contains(&new) {
                        continue;
                    }
                    if !new.expr.is_fragment() || slots.iter().any(|s| !s.expr.is_fragment()) {
                        return Err(EmitError::Invariant(format!(
                            "conflicting frame locations for variable '{}'",
                            variable.name
                        ))
                        .into());
                    }
                    slots.push(new);
                    slots.sort_by_key(|s| s.expr.fragment().map(|f| f.offset_bits));
                }
                (Some(VariableLocation::EntryValue(values)), Record::Entry(entry)) => {
                    let new = (entry.register, entry.expr.clone());
                    if !values.contains(&new) {
                        values.push(new);
                        values.sort_by_key(|(_, e)| e.fragment().map(|f| f.offset_bits));
                    }
                }
                (location @ Some(VariableLocation::StackSlots(_)), Record::Entry(entry)) => {
                    debug!(
                        "Variable '{}' has both a frame slot and an entry value, keeping the entry value",
                        variable.name
                    );
                    *location = Some(VariableLocation::EntryValue(vec![(
                        entry.register,
                        entry.expr.clone(),
                    )]));
                }
                _ => {
                    warn!(
                        "Ignoring frame slot of '{}', an entry value is already recorded",
                        variable.name
                    );
                }
            }
        }
        Ok(())
    }
}

fn location_kind(location: &VariableLocation) -> &'static str {
    match location {
        VariableLocation::Single(_) => "single",
        VariableLocation::StackSlots(_) => "stack slots",
        VariableLocation::EntryValue(_) => "entry value",
        VariableLocation::List(_) => "list",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::history::calculate_history;
    use crate::core::{
        CompileUnitId, CompileUnitMeta, DebugLoc, ExprOp, FileEntry, FileId, FragmentInfo,
        GenericTarget, LocalVariable, MachineInstr, SubprogramFlags, SubprogramId, SubprogramMeta,
        VariableId,
    };
    use crate::core::SectionId;
    use crate::data::LabelAllocator;
    use crate::emit::{DebugSink, MemorySink, SinkOutput};
    use gimli::constants::DW_LANG_C99;
    use gimli::RunTimeEndian;
    use std::collections::BTreeMap;

    /// Re-applies adjacent-range merging to a finished list
    fn coalesce_entries(entries: &[DebugLocEntry]) -> Vec<DebugLocEntry> {
        let mut out: Vec<DebugLocEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(prev) = out.last_mut() {
                if prev.merge_ranges(entry) {
                    continue;
                }
            }
            out.push(entry.clone());
        }
        out
    }

    struct Fixture {
        module: DebugModule,
        func: MachineFunction,
        sp_scope: ScopeId,
    }

    fn fixture() -> Fixture {
        let mut module = DebugModule::new();
        let file = module.add_file(FileEntry::new("a.c", "/src"));
        let (_, cu_scope) = module.add_compile_unit(CompileUnitMeta::new(file, DW_LANG_C99, "t"));
        let sp = module.add_subprogram(SubprogramMeta {
            name: "f".to_string(),
            linkage_name: None,
            unit: CompileUnitId(0),
            scope: ScopeId(0),
            parent: cu_scope,
            file: Some(FileId(0)),
            line: 1,
            scope_line: 1,
            ty: None,
            is_definition: true,
            declaration: None,
            flags: SubprogramFlags::default(),
            retained_nodes: Vec::new(),
        });
        let sp_scope = module.subprogram(sp).unwrap().scope;
        module.add_variable(LocalVariable {
            name: "x".to_string(),
            scope: sp_scope,
            file: Some(file),
            line: 2,
            ty: None,
            arg: None,
            artificial: false,
        });
        let mut func = MachineFunction::new("f", Some(SubprogramId(0)));
        func.add_block(0);
        Fixture {
            module,
            func,
            sp_scope,
        }
    }

    fn code(f: &mut Fixture, line: u32) -> InstrId {
        f.func
            .push(MachineInstr::regular(2, Some(DebugLoc::new(line, 0, f.sp_scope))))
            .unwrap()
    }

    fn dbg(f: &mut Fixture, operand: DbgOperand, expr: Expression) -> InstrId {
        let mut value = DbgValue::new(VariableId(0), operand);
        value.expr = expr;
        f.func
            .push(MachineInstr::debug_value(value, Some(DebugLoc::new(2, 0, f.sp_scope))))
            .unwrap()
    }

    /// Simulates emission: resolves every requested label
    fn resolve(f: &Fixture, history: &DbgValueHistory) -> (LabelRegistry, FunctionLabels) {
        let mut alloc = LabelAllocator::new();
        let begin = alloc.create();
        let end = alloc.create();
        let mut registry = LabelRegistry::new();
        history
            .request_labels(&f.module, &f.func, &mut registry, begin)
            .unwrap();
        for id in f.func.instr_ids() {
            registry.begin_instruction(id, &mut alloc);
            registry.end_instruction(id, f.func.instr(id).is_meta(), &mut alloc);
        }
        let mut sections = BTreeMap::new();
        sections.insert(0, (begin, end));
        (registry, FunctionLabels { begin, end, sections })
    }

    /// Lays the function out in a sink the way the driver does, binding
    /// every label the registry hands out
    fn resolve_in_sink(
        f: &Fixture,
        history: &DbgValueHistory,
    ) -> (LabelRegistry, FunctionLabels, SinkOutput) {
        let mut alloc = LabelAllocator::new();
        let begin = alloc.create();
        let end = alloc.create();
        let mut registry = LabelRegistry::new();
        history
            .request_labels(&f.module, &f.func, &mut registry, begin)
            .unwrap();

        let mut sink = MemorySink::new(RunTimeEndian::Little);
        sink.switch_section(SectionId::Text(0));
        sink.bind_label(begin).unwrap();
        registry.set_prev_label(begin);
        for id in f.func.instr_ids() {
            let mi = f.func.instr(id);
            if let Some(label) = registry.begin_instruction(id, &mut alloc) {
                sink.bind_label(label).unwrap();
            }
            sink.emit_fill(mi.size as u64, 0).unwrap();
            if let Some(label) = registry.end_instruction(id, mi.is_meta(), &mut alloc) {
                sink.bind_label(label).unwrap();
            }
        }
        sink.bind_label(end).unwrap();

        let mut sections = BTreeMap::new();
        sections.insert(0, (begin, end));
        let labels = FunctionLabels { begin, end, sections };
        (registry, labels, sink.finish().unwrap())
    }

    fn reduce(f: &Fixture) -> (FunctionEntities, FunctionLabels) {
        let target = GenericTarget::x86_64();
        let scopes = LexicalScopes::initialize(&f.module, &f.func).unwrap();
        let history = calculate_history(&f.func, &target);
        let (registry, labels) = resolve(f, &history);
        let ctx = LocationContext {
            module: &f.module,
            func: &f.func,
            scopes: &scopes,
            registry: &registry,
            labels: &labels,
            legacy_constant_promotion: true,
        };
        (ctx.collect_entities(&history).unwrap(), labels)
    }

    #[test]
    fn test_single_value_spanning_scope_is_single() {
        let mut f = fixture();
        dbg(&mut f, DbgOperand::Register(Register(3)), Expression::new());
        code(&mut f, 1);
        code(&mut f, 2);
        let (entities, _) = reduce(&f);
        assert_eq!(entities.variables.len(), 1);
        assert!(matches!(
            entities.variables[0].location,
            Some(VariableLocation::Single(_))
        ));
    }

    #[test]
    fn test_two_disjoint_values_stay_separate() {
        let mut f = fixture();
        code(&mut f, 1);
        let a = dbg(&mut f, DbgOperand::Immediate(1), Expression::new());
        code(&mut f, 2);
        let b = dbg(&mut f, DbgOperand::Immediate(2), Expression::new());
        code(&mut f, 3);
        let (entities, labels) = reduce(&f);
        let Some(VariableLocation::List(list)) = &entities.variables[0].location else {
            panic!("expected a location list");
        };
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].end, list[1].begin);
        assert_eq!(list[1].end, labels.end);
        assert_ne!(list[0].begin, list[0].end);
        assert!(a < b);
        assert_eq!(coalesce_entries(list), *list);
    }

    #[test]
    fn test_clobbered_register_ends_range() {
        let mut f = fixture();
        code(&mut f, 1);
        dbg(&mut f, DbgOperand::Register(Register(5)), Expression::new());
        code(&mut f, 2);
        let mut def = MachineInstr::regular(2, Some(DebugLoc::new(3, 0, f.sp_scope)));
        def.defs.push(Register(5));
        f.func.push(def).unwrap();
        code(&mut f, 4);
        let (entities, labels) = reduce(&f);
        let Some(VariableLocation::List(list)) = &entities.variables[0].location else {
            panic!("expected a location list");
        };
        assert_eq!(list.len(), 1);
        assert_ne!(list[0].end, labels.end);
    }

    #[test]
    fn test_fragments_sorted_and_never_single() {
        let mut f = fixture();
        let hi = Expression::from_ops(vec![ExprOp::Fragment(FragmentInfo {
            offset_bits: 32,
            size_bits: 32,
        })]);
        let lo = Expression::from_ops(vec![ExprOp::Fragment(FragmentInfo {
            offset_bits: 0,
            size_bits: 32,
        })]);
        dbg(&mut f, DbgOperand::Immediate(1), hi);
        code(&mut f, 1);
        dbg(&mut f, DbgOperand::Immediate(2), lo);
        code(&mut f, 2);
        let (entities, _) = reduce(&f);
        let Some(VariableLocation::List(list)) = &entities.variables[0].location else {
            panic!("expected a location list");
        };
        let last = list.last().unwrap();
        assert_eq!(last.values.len(), 2);
        assert_eq!(last.values[0].fragment().unwrap().offset_bits, 0);
        for pair in list.windows(2) {
            assert_eq!(pair[0].end, pair[1].begin);
        }
    }

    #[test]
    fn test_mixed_history_reduces_to_ordered_list() {
        let mut f = fixture();
        let fragment = |offset_bits, size_bits| {
            Expression::from_ops(vec![ExprOp::Fragment(FragmentInfo {
                offset_bits,
                size_bits,
            })])
        };
        // two fragments, then one overlapping both
        dbg(&mut f, DbgOperand::Register(Register(5)), fragment(0, 32));
        code(&mut f, 1);
        dbg(&mut f, DbgOperand::Immediate(1), fragment(32, 32));
        code(&mut f, 2);
        dbg(&mut f, DbgOperand::Immediate(2), fragment(16, 32));
        code(&mut f, 3);
        // whole value in rdi, clobbered, then redefined in rbx
        dbg(&mut f, DbgOperand::Register(Register(5)), Expression::new());
        code(&mut f, 4);
        let mut def = MachineInstr::regular(2, Some(DebugLoc::new(5, 0, f.sp_scope)));
        def.defs.push(Register(5));
        f.func.push(def).unwrap();
        code(&mut f, 6);
        dbg(&mut f, DbgOperand::Register(Register(3)), Expression::new());
        code(&mut f, 7);
        dbg(&mut f, DbgOperand::Undef, Expression::new());
        code(&mut f, 8);
        dbg(&mut f, DbgOperand::Immediate(9), Expression::new());
        dbg(&mut f, DbgOperand::Immediate(9), Expression::new());
        code(&mut f, 9);
        code(&mut f, 10);

        let target = GenericTarget::x86_64();
        let scopes = LexicalScopes::initialize(&f.module, &f.func).unwrap();
        let history = calculate_history(&f.func, &target);
        let (registry, labels, output) = resolve_in_sink(&f, &history);
        let ctx = LocationContext {
            module: &f.module,
            func: &f.func,
            scopes: &scopes,
            registry: &registry,
            labels: &labels,
            legacy_constant_promotion: true,
        };
        let entities = ctx.collect_entities(&history).unwrap();
        let Some(VariableLocation::List(list)) = &entities.variables[0].location else {
            panic!("expected a location list");
        };

        let address = |label: Label| output.label_address(label).unwrap();
        let ranges: Vec<(u64, u64)> = list
            .iter()
            .map(|e| (address(e.begin), address(e.end)))
            .collect();
        assert!(ranges.len() >= 5, "ranges: {:?}", ranges);
        for (begin, end) in &ranges {
            assert!(begin < end, "empty range in {:?}", ranges);
        }
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap in {:?}", ranges);
        }
        // the undefined value leaves a hole
        assert!(ranges.windows(2).any(|p| p[0].1 < p[1].0));
        for pair in list.windows(2) {
            assert!(!(pair[0].end == pair[1].begin && pair[0].values == pair[1].values));
        }
        assert_eq!(coalesce_entries(list), *list);
    }

    #[test]
    fn test_undef_disqualifies_single() {
        let mut f = fixture();
        dbg(&mut f, DbgOperand::Immediate(1), Expression::new());
        code(&mut f, 1);
        dbg(&mut f, DbgOperand::Undef, Expression::new());
        code(&mut f, 2);
        let (entities, _) = reduce(&f);
        let Some(VariableLocation::List(list)) = &entities.variables[0].location else {
            panic!("expected a location list");
        };
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_conflicting_stack_slots_are_an_error() {
        let mut f = fixture();
        code(&mut f, 1);
        for offset in [-8, -16] {
            f.func.stack_slot_vars.push(crate::core::StackSlotVar {
                variable: VariableId(0),
                inlined_at: None,
                expr: Expression::new(),
                frame_reg: Register(6),
                offset,
            });
        }
        let target = GenericTarget::x86_64();
        let scopes = LexicalScopes::initialize(&f.module, &f.func).unwrap();
        let history = calculate_history(&f.func, &target);
        let (registry, labels) = resolve(&f, &history);
        let ctx = LocationContext {
            module: &f.module,
            func: &f.func,
            scopes: &scopes,
            registry: &registry,
            labels: &labels,
            legacy_constant_promotion: true,
        };
        assert!(ctx.collect_entities(&history).is_err());
    }

    #[test]
    fn test_entry_value_wins_over_stack_slot() {
        let mut f = fixture();
        code(&mut f, 1);
        f.func.stack_slot_vars.push(crate::core::StackSlotVar {
            variable: VariableId(0),
            inlined_at: None,
            expr: Expression::new(),
            frame_reg: Register(6),
            offset: -8,
        });
        f.func.entry_value_vars.push(crate::core::EntryValueVar {
            variable: VariableId(0),
            inlined_at: None,
            expr: Expression::new(),
            register: Register(5),
        });
        let (entities, _) = reduce(&f);
        assert!(matches!(
            entities.variables[0].location,
            Some(VariableLocation::EntryValue(_))
        ));
    }
}
