//! Statement-boundary decisions for the line-number program
//!
//! The controller sees every instruction of a function as it is emitted and
//! decides which source position, if any, a line row records for it. A
//! recorded position stays pending until the next code-producing instruction
//! materializes it, mirroring how an assembler attaches `.loc` directives.

use crate::core::{
    BlockId, DebugLoc, DebugModule, EmitOptions, InlinedAtId, InstrId, MachineFunction, Result,
    ScopeId, Toggle,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineFlags {
    pub is_stmt: bool,
    pub prologue_end: bool,
    pub epilogue_begin: bool,
}

impl LineFlags {
    fn any(&self) -> bool {
        self.is_stmt || self.prologue_end || self.epilogue_begin
    }
}

/// Source position a line row will carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocDirective {
    /// `None` for line-0 records that had no previous position to borrow
    pub scope: Option<ScopeId>,
    pub line: u32,
    pub column: u32,
    pub flags: LineFlags,
}

/// Same line, column, scope and inlining context
fn same_source_location(a: Option<&DebugLoc>, b: Option<&DebugLoc>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            a.line == b.line
                && a.column == b.column
                && a.scope == b.scope
                && a.inlined_at == b.inlined_at
        }
        _ => false,
    }
}

/// Per-module line-table state machine. Per-function state is reset by
/// `begin_function`; the current directive persists across functions.
#[derive(Debug)]
pub struct LineTableController {
    key_instructions_are_stmts: bool,
    unknown_locations: Toggle,

    key_instrs: HashSet<InstrId>,
    force_is_stmt: HashSet<InstrId>,
    prolog_end: Option<InstrId>,
    /// Last location with a non-zero line
    prev_loc: Option<DebugLoc>,
    prev_block: Option<BlockId>,
    epilog_begin_block: Option<BlockId>,
    function_scope: Option<ScopeId>,
    scope_line: u32,

    current: LocDirective,
    /// `current` has not been attached to an instruction yet
    pending: bool,
}

impl LineTableController {
    pub fn new(options: &EmitOptions) -> Self {
        Self {
            key_instructions_are_stmts: options.key_instructions,
            unknown_locations: options.unknown_locations,
            key_instrs: HashSet::new(),
            force_is_stmt: HashSet::new(),
            prolog_end: None,
            prev_loc: None,
            prev_block: None,
            epilog_begin_block: None,
            function_scope: None,
            scope_line: 0,
            current: LocDirective {
                scope: None,
                line: 0,
                column: 0,
                flags: LineFlags {
                    is_stmt: true,
                    ..LineFlags::default()
                },
            },
            pending: false,
        }
    }

    fn record(&mut self, directive: LocDirective) {
        trace!(
            "Line directive {}:{} stmt={} prologue_end={}",
            directive.line,
            directive.column,
            directive.flags.is_stmt,
            directive.flags.prologue_end
        );
        self.current = directive;
        self.pending = true;
    }

    /// Directive to attach to the code-producing instruction being emitted
    pub fn take_pending(&mut self) -> Option<LocDirective> {
        if !self.pending {
            return None;
        }
        self.pending = false;
        Some(self.current)
    }

    pub fn last_line(&self) -> u32 {
        self.current.line
    }

    pub fn is_key_instruction(&self, instr: InstrId) -> bool {
        self.key_instrs.contains(&instr)
    }

    pub fn forces_is_stmt(&self, instr: InstrId) -> bool {
        self.force_is_stmt.contains(&instr)
    }

    pub fn prologue_end(&self) -> Option<InstrId> {
        self.prolog_end
    }

    /// Resets per-function state, records the initial scope-line directive
    /// and runs the statement-marking analysis selected for the module
    pub fn begin_function(&mut self, module: &DebugModule, func: &MachineFunction) -> Result<()> {
        self.key_instrs.clear();
        self.force_is_stmt.clear();
        self.prolog_end = None;
        self.prev_loc = None;
        self.prev_block = None;
        self.epilog_begin_block = None;
        self.function_scope = None;
        self.scope_line = 0;

        if let Some(sp) = func.subprogram {
            let subprogram = module.subprogram(sp)?;
            self.function_scope = Some(subprogram.scope);
            self.scope_line = subprogram.scope_line;
        }

        self.prolog_end = self.emit_initial_directive(func);

        if self.key_instructions_are_stmts {
            self.compute_key_instructions(func);
        } else {
            self.find_force_is_stmt_instrs(func);
        }
        debug!(
            "Line table for {}: prologue end {:?}, {} key, {} forced",
            func.name,
            self.prolog_end.map(|i| i.0),
            self.key_instrs.len(),
            self.force_is_stmt.len()
        );
        Ok(())
    }

    fn emit_initial_directive(&mut self, func: &MachineFunction) -> Option<InstrId> {
        if func.blocks.iter().all(|b| b.is_empty()) {
            return None;
        }
        let (mut prolog_end, empty_prologue) = find_prologue_end(func);
        if empty_prologue {
            if let Some(instr) = prolog_end {
                match func.instr(instr).loc {
                    Some(loc) if loc.line == 0 => prolog_end = None,
                    _ => return Some(instr),
                }
            }
        }
        self.record(LocDirective {
            scope: self.function_scope,
            line: self.scope_line,
            column: 0,
            flags: LineFlags {
                is_stmt: true,
                ..LineFlags::default()
            },
        });
        prolog_end
    }

    /// Marks the lowest-rank candidates of every atom group as key, floating
    /// each onto the first instruction of its same-line run
    fn compute_key_instructions(&mut self, func: &MachineFunction) {
        let mut candidates: HashMap<(Option<InlinedAtId>, u64), (u8, Vec<InstrId>)> = HashMap::new();

        for (block_idx, block) in func.blocks.iter().enumerate() {
            let block_id = BlockId(block_idx as u32);
            let mut buoy: Option<InstrId> = None;
            let mut buoy_atom: u64 = 0;

            for id in block.instrs() {
                let mi = func.instr(id);
                if mi.is_meta() {
                    continue;
                }
                let Some(loc) = mi.loc.filter(|l| l.line != 0) else {
                    continue;
                };

                let buoy_line = buoy.and_then(|b| func.instr(b).loc).map(|l| l.line);
                if buoy_line != Some(loc.line) {
                    buoy = Some(id);
                    buoy_atom = 0;
                }

                let is_call = mi.is_call();
                if is_call {
                    if let Some(b) = buoy {
                        self.key_instrs.insert(b);
                    }
                    buoy = None;
                    buoy_atom = 0;
                    if loc.atom_group == 0 || loc.atom_rank == 0 {
                        continue;
                    }
                }

                let group = loc.atom_group;
                let rank = loc.atom_rank;
                if group == 0 || rank == 0 {
                    continue;
                }

                if buoy_atom != 0 && buoy_atom != group {
                    buoy = Some(id);
                    buoy_atom = group;
                }

                let (candidate_rank, insts) = candidates.entry((loc.inlined_at, group)).or_default();
                if *candidate_rank != 0 && *candidate_rank < rank {
                    continue;
                }
                if *candidate_rank == rank {
                    insts.retain(|c| func.block_of(*c) != block_id);
                } else if *candidate_rank > rank {
                    insts.clear();
                }

                match buoy {
                    Some(b) => {
                        insts.push(b);
                        *candidate_rank = rank;
                        buoy_atom = group;
                    }
                    None => {
                        if insts.is_empty() {
                            *candidate_rank = 0;
                        }
                    }
                }
            }
        }

        for (_, insts) in candidates.into_values() {
            self.key_instrs.extend(insts);
        }
    }

    /// Finds block-leading instructions whose line differs from the last
    /// line of at least one predecessor edge
    fn find_force_is_stmt_instrs(&mut self, func: &MachineFunction) {
        let mut preds_to_examine: Vec<BlockId> = Vec::new();
        let mut potential: HashMap<BlockId, InstrId> = HashMap::new();

        for (block_idx, block) in func.blocks.iter().enumerate() {
            if block.is_empty() || block.preds.is_empty() {
                continue;
            }
            let first_with_line = block
                .instrs()
                .find(|id| func.instr(*id).loc.is_some_and(|l| l.line != 0));
            if let Some(id) = first_with_line {
                for pred in &block.preds {
                    if !preds_to_examine.contains(pred) {
                        preds_to_examine.push(*pred);
                    }
                }
                potential.insert(BlockId(block_idx as u32), id);
            }
        }

        let line_of = |id: InstrId| func.instr(id).loc.map(|l| l.line).unwrap_or(0);

        for pred_id in preds_to_examine {
            let pred = func.block(pred_id);
            let mut check_edge = |potential: &mut HashMap<BlockId, InstrId>, succ: BlockId, line: u32| {
                let Some(&instr) = potential.get(&succ) else {
                    return;
                };
                if line_of(instr) == line {
                    return;
                }
                potential.remove(&succ);
                self.force_is_stmt.insert(instr);
            };

            if pred.is_empty() {
                for succ in &pred.succs {
                    check_edge(&mut potential, *succ, 0);
                }
                continue;
            }
            if !pred.succs.iter().any(|s| potential.contains_key(s)) {
                continue;
            }

            let mut scan_end = pred.end;
            let mut successors: Vec<BlockId> = pred.succs.clone();
            let back_line = pred.last().map(line_of).unwrap_or(0);
            if let Some(branch) = pred.branch.filter(|_| pred.analyzable) {
                if let (true, Some(otherwise)) = (branch.conditional, branch.otherwise) {
                    if back_line != 0 {
                        check_edge(&mut potential, otherwise, back_line);
                        scan_end -= 1;
                        successors = vec![branch.taken];
                    }
                }
            }

            let last_line = (pred.first..scan_end)
                .rev()
                .map(InstrId)
                .map(line_of)
                .find(|line| *line != 0)
                .unwrap_or(0);
            for succ in successors {
                check_edge(&mut potential, succ, last_line);
            }
        }
    }

    /// Line-0 record placed before the padding of an aligned block, so the
    /// padding does not inherit the previous position
    pub fn begin_code_alignment(&mut self, alignment: u32) -> Option<LocDirective> {
        if alignment <= 1 || self.current.line == 0 {
            return None;
        }
        self.record(LocDirective {
            scope: self.current.scope,
            line: 0,
            column: self.current.column,
            flags: LineFlags::default(),
        });
        self.take_pending()
    }

    /// Decides the line directive for `instr`. `has_label` tells whether a
    /// label is bound at the current position.
    pub fn begin_instruction(&mut self, func: &MachineFunction, instr: InstrId, has_label: bool) {
        let mi = func.instr(instr);
        if mi.is_meta() || mi.flags.frame_setup {
            return;
        }
        let block = func.block_of(instr);
        let dl = mi.loc;
        let mut flags = LineFlags::default();

        if mi.flags.frame_destroy && dl.is_some() && self.epilog_begin_block != Some(block) {
            self.epilog_begin_block = Some(block);
            flags.epilogue_begin = true;
        }

        let last_line = self.current.line;
        let is_key = self.key_instructions_are_stmts
            && dl.is_some_and(|l| l.line != 0)
            && self.key_instrs.contains(&instr);

        if dl.is_none() && Some(instr) == self.prolog_end {
            self.record(LocDirective {
                scope: self.function_scope,
                line: self.scope_line,
                column: 0,
                flags: LineFlags {
                    is_stmt: true,
                    prologue_end: true,
                    epilogue_begin: false,
                },
            });
            return;
        }

        let same_section = self
            .prev_block
            .is_none_or(|prev| func.block(prev).section == func.block(block).section);
        let force = self.force_is_stmt.contains(&instr);
        if same_section && !force && same_source_location(dl.as_ref(), self.prev_loc.as_ref()) {
            let Some(loc) = dl else {
                return;
            };
            if !is_key {
                if (last_line == 0 && loc.line != 0) || flags.any() {
                    self.record(LocDirective {
                        scope: Some(loc.scope),
                        line: loc.line,
                        column: loc.column,
                        flags,
                    });
                }
                return;
            }
        }

        let Some(loc) = dl else {
            if last_line == 0 || self.unknown_locations == Toggle::Disable {
                return;
            }
            let block_top = self.prev_block.is_some_and(|prev| prev != block);
            if self.unknown_locations == Toggle::Enable || has_label || block_top {
                let (scope, column) = match self.prev_loc {
                    Some(prev) => (Some(prev.scope), prev.column),
                    None => (None, 0),
                };
                self.record(LocDirective {
                    scope,
                    line: 0,
                    column,
                    flags: LineFlags::default(),
                });
            }
            return;
        };

        if loc.line == 0 && last_line == 0 {
            return;
        }
        if Some(instr) == self.prolog_end {
            flags.prologue_end = true;
            flags.is_stmt = true;
            self.prolog_end = None;
        }

        if self.key_instructions_are_stmts {
            if is_key {
                flags.is_stmt = true;
            }
        } else {
            let old_line = self.prev_loc.map(|l| l.line).unwrap_or(last_line);
            if loc.line != 0 && (loc.line != old_line || force) {
                flags.is_stmt = true;
            }
        }

        self.record(LocDirective {
            scope: Some(loc.scope),
            line: loc.line,
            column: loc.column,
            flags,
        });

        if loc.line != 0 {
            self.prev_loc = Some(loc);
        }
    }

    pub fn end_instruction(&mut self, func: &MachineFunction, instr: InstrId) {
        let mi = func.instr(instr);
        if !mi.is_meta() {
            self.prev_block = Some(mi.block);
        }
    }
}

/// First instruction after the frame setup with a real line. The flag tells
/// whether nothing but trivial code precedes it.
fn find_prologue_end(func: &MachineFunction) -> (Option<InstrId>, bool) {
    let mut empty_prologue = true;
    let mut non_trivial: Option<InstrId> = None;

    let Some(mut block_idx) = func.blocks.iter().position(|b| !b.is_empty()) else {
        return (None, empty_prologue);
    };
    let mut current = InstrId(func.blocks[block_idx].first);

    loop {
        let mi = func.instr(current);
        if !mi.is_meta() {
            let setup = mi.flags.frame_setup;
            if !setup && mi.loc.is_some_and(|l| l.line != 0) {
                return (Some(current), empty_prologue);
            }
            if !mi.flags.copy && !mi.flags.rematerializable && !setup && non_trivial.is_none() {
                non_trivial = Some(current);
            }
            empty_prologue = false;
        }

        let block = &func.blocks[block_idx];
        if current.0 + 1 < block.end {
            current = InstrId(current.0 + 1);
            continue;
        }

        // Fall through only along an unconditional, single-predecessor path.
        if mi.flags.terminator || block.preds.len() > 1 {
            break;
        }
        let next = func.blocks[block_idx + 1..].iter().position(|b| !b.is_empty());
        let Some(offset) = next else {
            break;
        };
        block_idx += 1 + offset;
        current = InstrId(func.blocks[block_idx].first);
    }

    match non_trivial {
        Some(instr) if func.block_of(instr) == BlockId(0) => {
            let first = func.blocks[0].first;
            (Some(instr), instr.0 == first)
        }
        _ => (None, empty_prologue),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EmitterConfig, MachineInstr};

    fn controller(key_instructions: bool) -> LineTableController {
        let config = EmitterConfig {
            key_instructions,
            ..EmitterConfig::default()
        };
        LineTableController::new(&config.resolve().unwrap())
    }

    fn at(line: u32) -> Option<DebugLoc> {
        Some(DebugLoc::new(line, 1, ScopeId(1)))
    }

    /// Runs every instruction and collects the materialized directives
    fn run(ctl: &mut LineTableController, func: &MachineFunction) -> Vec<(InstrId, LocDirective)> {
        let module = DebugModule::new();
        ctl.begin_function(&module, func).unwrap();
        let mut rows = Vec::new();
        for id in func.instr_ids() {
            ctl.begin_instruction(func, id, false);
            if !func.instr(id).is_meta() {
                if let Some(d) = ctl.take_pending() {
                    rows.push((id, d));
                }
            }
            ctl.end_instruction(func, id);
        }
        rows
    }

    #[test]
    fn test_duplicate_position_not_restated() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        func.push(MachineInstr::regular(1, at(3))).unwrap();
        func.push(MachineInstr::regular(1, at(3))).unwrap();
        func.push(MachineInstr::regular(1, at(4))).unwrap();
        let rows = run(&mut controller(false), &func);
        let stmts: Vec<u32> = rows
            .iter()
            .filter(|(_, d)| d.flags.is_stmt)
            .map(|(_, d)| d.line)
            .collect();
        assert_eq!(stmts, vec![3, 4]);
        assert!(rows[0].1.flags.prologue_end);
    }

    #[test]
    fn test_prologue_end_after_frame_setup() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        let mut push = MachineInstr::regular(1, at(1));
        push.flags.frame_setup = true;
        func.push(push).unwrap();
        let body = func.push(MachineInstr::regular(1, at(2))).unwrap();
        let mut ctl = controller(false);
        let rows = run(&mut ctl, &func);
        // scope line directive lands on the frame setup, prologue_end on body
        let (id, directive) = rows.last().unwrap();
        assert_eq!(*id, body);
        assert!(directive.flags.prologue_end && directive.flags.is_stmt);
    }

    #[test]
    fn test_line_zero_not_repeated() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        func.push(MachineInstr::regular(1, at(5))).unwrap();
        func.add_block(0);
        func.add_edge(BlockId(0), BlockId(1));
        func.push(MachineInstr::regular(1, None)).unwrap();
        func.push(MachineInstr::regular(1, None)).unwrap();
        let rows = run(&mut controller(false), &func);
        let zeros = rows.iter().filter(|(_, d)| d.line == 0).count();
        assert_eq!(zeros, 1);
    }

    #[test]
    fn test_epilogue_begin_once_per_block() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        func.push(MachineInstr::regular(1, at(2))).unwrap();
        for line in [3, 4] {
            let mut pop = MachineInstr::regular(1, at(line));
            pop.flags.frame_destroy = true;
            func.push(pop).unwrap();
        }
        let rows = run(&mut controller(false), &func);
        let epilogues = rows.iter().filter(|(_, d)| d.flags.epilogue_begin).count();
        assert_eq!(epilogues, 1);
    }

    #[test]
    fn test_forward_dataflow_suppresses_same_line_entry() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        func.push(MachineInstr::regular(1, at(5))).unwrap();
        func.add_block(0);
        func.push(MachineInstr::regular(1, at(5))).unwrap();
        func.add_block(0);
        let third = func.push(MachineInstr::regular(1, at(6))).unwrap();
        let second_first = InstrId(1);
        func.add_edge(BlockId(0), BlockId(1));
        func.add_edge(BlockId(1), BlockId(2));
        let mut ctl = controller(false);
        let module = DebugModule::new();
        ctl.begin_function(&module, &func).unwrap();
        assert!(!ctl.forces_is_stmt(second_first));
        assert!(ctl.forces_is_stmt(third));
    }

    #[test]
    fn test_key_instructions_lowest_rank_wins() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        let mut loc_a = DebugLoc::new(7, 1, ScopeId(1));
        loc_a.atom_group = 1;
        loc_a.atom_rank = 2;
        let mut loc_b = DebugLoc::new(8, 1, ScopeId(1));
        loc_b.atom_group = 1;
        loc_b.atom_rank = 1;
        let a = func.push(MachineInstr::regular(1, Some(loc_a))).unwrap();
        let b = func.push(MachineInstr::regular(1, Some(loc_b))).unwrap();
        let mut ctl = controller(true);
        let module = DebugModule::new();
        ctl.begin_function(&module, &func).unwrap();
        assert!(!ctl.is_key_instruction(a));
        assert!(ctl.is_key_instruction(b));
    }

    #[test]
    fn test_call_is_always_key() {
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        let first = func.push(MachineInstr::regular(1, at(9))).unwrap();
        func.push(MachineInstr::call(5, at(9), crate::core::Callee::Register(crate::core::Register(0))))
            .unwrap();
        let mut ctl = controller(true);
        let module = DebugModule::new();
        ctl.begin_function(&module, &func).unwrap();
        assert!(ctl.is_key_instruction(first));
    }
}
