//! Module-level driver
//!
//! `DwarfDebug` owns the entity tree and the line-table state machine for one
//! module. Functions are fed in compilation order through `emit_function`,
//! which writes their code into the sink while binding the labels the
//! analyses asked for. `end_module` runs the finalize and layout passes and
//! serializes every section.

use crate::analysis::{
    calculate_history, collect_call_sites, request_call_labels, CallSite, LexicalScopes,
    LineTableController, LocDirective, LocationContext,
};
use crate::core::{
    CompileUnitId, DebugModule, EmissionKind, EmitOptions, EmitterConfig, FileId, Label,
    MachineFunction, RangeSpan, Result, ScopeKind, SectionId, TargetInfo, UnitId,
};
use crate::data::{FunctionLabels, LabelRegistry};
use crate::dwarf::function::FunctionInfo;
use crate::dwarf::tree::EntityTree;
use crate::emit::line::LineRow;
use crate::emit::sink::DebugSink;
use crate::emit::unit_length::UnitLength;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Code ranges of the last function that received debug info
struct PrevFunction {
    unit: UnitId,
    ends: Vec<(u32, Label)>,
}

pub struct DwarfDebug {
    tree: EntityTree,
    lines: LineTableController,
    /// Code sections that received at least one function
    text_sections: BTreeSet<u32>,
    prev: Option<PrevFunction>,
    functions: usize,
    skipped: usize,
}

impl DwarfDebug {
    pub fn new(config: &EmitterConfig, target: Arc<dyn TargetInfo>) -> Result<Self> {
        Ok(Self::with_options(config.resolve()?, target))
    }

    pub fn with_options(options: EmitOptions, target: Arc<dyn TargetInfo>) -> Self {
        let lines = LineTableController::new(&options);
        Self {
            tree: EntityTree::new(options, target),
            lines,
            text_sections: BTreeSet::new(),
            prev: None,
            functions: 0,
            skipped: 0,
        }
    }

    pub fn options(&self) -> &EmitOptions {
        &self.tree.options
    }

    pub fn tree(&self) -> &EntityTree {
        &self.tree
    }

    /// Creates the units that carry module-level entities: globals,
    /// enumerations, retained types and macros. Other units are created
    /// when their first function is emitted.
    pub fn begin_module(&mut self, module: &DebugModule) -> Result<()> {
        for (idx, meta) in module.compile_units.iter().enumerate() {
            if meta.emission_kind == EmissionKind::NoDebug {
                continue;
            }
            if meta.enums.is_empty()
                && meta.retained_types.is_empty()
                && meta.globals.is_empty()
                && meta.macros.is_empty()
            {
                continue;
            }
            let unit = self
                .tree
                .get_or_create_compile_unit(module, CompileUnitId(idx as u32))?;
            for global in &meta.globals {
                self.tree.get_or_create_global_die(module, unit, *global)?;
            }
            for ty in meta.enums.iter().chain(&meta.retained_types) {
                self.tree.get_or_create_type_die(module, unit, *ty)?;
            }
        }
        info!(
            "Began module with {} compile units ({} units created)",
            module.compile_units.len(),
            self.tree.units.len()
        );
        Ok(())
    }

    /// Unit the function's debug info goes into, `None` when the function is
    /// emitted without any
    fn function_unit(&mut self, module: &DebugModule, func: &MachineFunction) -> Result<Option<UnitId>> {
        let Some(sp) = func.subprogram else {
            return Ok(None);
        };
        let cu = module.subprogram(sp)?.unit;
        if module.compile_unit(cu)?.emission_kind == EmissionKind::NoDebug {
            return Ok(None);
        }
        Ok(Some(self.tree.get_or_create_compile_unit(module, cu)?))
    }

    /// Emits the code of `func` into `sink` and builds its debug entries
    pub fn emit_function(
        &mut self,
        module: &DebugModule,
        func: &MachineFunction,
        sink: &mut dyn DebugSink,
    ) -> Result<()> {
        func.verify()?;
        let Some(unit) = self.function_unit(module, func)? else {
            self.skip_function(func, sink)?;
            return Ok(());
        };
        let options = self.tree.options.clone();
        let target = self.tree.target.clone();
        let begin = self.tree.labels.create();
        let end = self.tree.labels.create();

        let scopes = LexicalScopes::initialize(module, func)?;
        let history = calculate_history(func, target.as_ref());
        let mut registry = LabelRegistry::new();
        history.request_labels(module, func, &mut registry, begin)?;
        for scope in scopes.concrete_scopes() {
            for range in &scopes.scope(scope).ranges {
                registry.request_before(range.first);
                registry.request_after(range.last);
            }
        }
        let describe_calls = options.version() >= 5 || options.use_gnu_analog_for_dwarf5();
        if describe_calls {
            request_call_labels(module, func, &mut registry)?;
        }

        self.lines.begin_function(module, func)?;
        let labels = self.emit_code(module, func, unit, begin, end, &mut registry, sink)?;

        for (section, (section_begin, section_end)) in &labels.sections {
            self.tree.section_labels.entry(*section).or_insert(*section_begin);
            self.tree.arange_labels.push((unit, *section_begin));
            self.tree.add_unit_range(
                unit,
                RangeSpan {
                    begin: *section_begin,
                    end: *section_end,
                },
            );
        }

        let ctx = LocationContext {
            module,
            func,
            scopes: &scopes,
            registry: &registry,
            labels: &labels,
            legacy_constant_promotion: options.legacy_constant_promotion,
        };
        let entities = ctx.collect_entities(&history)?;
        let call_sites: Vec<CallSite> = if describe_calls {
            collect_call_sites(module, func, target.as_ref(), options.emit_entry_values)?
        } else {
            Vec::new()
        };
        let info = FunctionInfo {
            module,
            func,
            scopes: &scopes,
            registry: &registry,
            labels: &labels,
            entities: &entities,
            call_sites: &call_sites,
        };
        self.tree.construct_function(&info, unit)?;

        self.prev = Some(PrevFunction {
            unit,
            ends: labels.sections.iter().map(|(s, (_, e))| (*s, *e)).collect(),
        });
        self.functions += 1;
        debug!(
            "Emitted function {} ({} variables, {} call sites)",
            func.name,
            entities.variables.len(),
            call_sites.len()
        );
        Ok(())
    }

    /// Writes the function's code without debug info. The open line
    /// sequence of the previous function ends where that function ended.
    fn skip_function(&mut self, func: &MachineFunction, sink: &mut dyn DebugSink) -> Result<()> {
        self.terminate_line_table();
        let mut opened = BTreeSet::new();
        for block in &func.blocks {
            sink.switch_section(SectionId::Text(block.section));
            if opened.insert(block.section) {
                sink.align_to(block.alignment as u64, 0)?;
            }
            self.text_sections.insert(block.section);
            let size: u64 = block.instrs().map(|id| func.instr(id).size as u64).sum();
            sink.emit_fill(size, 0)?;
        }
        self.skipped += 1;
        debug!("Skipped function {} without debug info", func.name);
        Ok(())
    }

    fn terminate_line_table(&mut self) {
        let Some(prev) = self.prev.take() else {
            return;
        };
        let Some(table) = self.tree.unit(prev.unit).line_table else {
            return;
        };
        for (section, label) in prev.ends {
            self.tree.line_tables[table].add_end_entry(section, label);
        }
    }

    fn line_row(
        &mut self,
        module: &DebugModule,
        unit: UnitId,
        label: Label,
        directive: LocDirective,
        fallback: FileId,
    ) -> Result<LineRow> {
        let (file, discriminator) = match directive.scope {
            Some(scope) => {
                let discriminator = match module.scope(scope)?.kind {
                    ScopeKind::LexicalBlockFile { discriminator } => discriminator,
                    _ => 0,
                };
                (module.scope_file(scope)?.unwrap_or(fallback), discriminator)
            }
            None => (fallback, 0),
        };
        let file = self.tree.file_number(module, unit, file)?.unwrap_or_default();
        Ok(LineRow {
            label,
            file,
            line: directive.line,
            column: directive.column,
            discriminator,
            flags: directive.flags,
        })
    }

    fn add_line_row(
        &mut self,
        module: &DebugModule,
        unit: UnitId,
        section: u32,
        label: Label,
        directive: LocDirective,
        fallback: FileId,
    ) -> Result<()> {
        let Some(table) = self.tree.unit(unit).line_table else {
            return Ok(());
        };
        let row = self.line_row(module, unit, label, directive, fallback)?;
        self.tree.line_tables[table].add_row(section, row);
        Ok(())
    }

    /// Label bound at the current position, reusing the registry's
    fn position_label(&mut self, registry: &mut LabelRegistry, sink: &mut dyn DebugSink) -> Result<Label> {
        if let Some(label) = registry.prev_label() {
            return Ok(label);
        }
        let label = self.tree.labels.create();
        sink.bind_label(label)?;
        registry.set_prev_label(label);
        Ok(label)
    }

    /// Writes the instructions block by block, binding requested labels and
    /// recording line rows
    #[allow(clippy::too_many_arguments)]
    fn emit_code(
        &mut self,
        module: &DebugModule,
        func: &MachineFunction,
        unit: UnitId,
        begin: Label,
        end: Label,
        registry: &mut LabelRegistry,
        sink: &mut dyn DebugSink,
    ) -> Result<FunctionLabels> {
        let sp = func
            .subprogram
            .map(|sp| module.subprogram(sp))
            .transpose()?;
        let fallback = match sp.and_then(|sp| sp.file) {
            Some(file) => file,
            None => {
                let cu = self.tree.unit(unit).source;
                match cu {
                    Some(cu) => module.compile_unit(cu)?.file,
                    None => FileId(0),
                }
            }
        };
        let primary = func.primary_section();
        let last_blocks: BTreeMap<usize, u32> = func
            .section_last_blocks()
            .into_iter()
            .map(|(section, block)| (block.index(), section))
            .collect();
        let mut sections: BTreeMap<u32, (Label, Label)> = BTreeMap::new();
        let mut current: Option<u32> = None;

        for (idx, block) in func.blocks.iter().enumerate() {
            if current != Some(block.section) {
                sink.switch_section(SectionId::Text(block.section));
                registry.reset_prev_label();
                current = Some(block.section);
                self.text_sections.insert(block.section);
                if !sections.contains_key(&block.section) {
                    let (section_begin, section_end) = if block.section == primary {
                        (begin, end)
                    } else {
                        (self.tree.labels.create(), self.tree.labels.create())
                    };
                    sink.align_to(block.alignment as u64, 0)?;
                    sink.bind_label(section_begin)?;
                    registry.set_prev_label(section_begin);
                    sections.insert(block.section, (section_begin, section_end));
                    trace!("Function {} enters section {}", func.name, block.section);
                }
            } else if block.alignment > 1 {
                if let Some(directive) = self.lines.begin_code_alignment(block.alignment) {
                    let label = self.position_label(registry, sink)?;
                    self.add_line_row(module, unit, block.section, label, directive, fallback)?;
                }
                let before = sink.offset();
                sink.align_to(block.alignment as u64, 0)?;
                if sink.offset() != before {
                    registry.reset_prev_label();
                }
            }

            for id in block.instrs() {
                let mi = func.instr(id);
                if let Some(label) = registry.begin_instruction(id, &mut self.tree.labels) {
                    sink.bind_label(label)?;
                }
                let has_label = registry.prev_label().is_some();
                self.lines.begin_instruction(func, id, has_label);
                if !mi.is_meta() {
                    if let Some(directive) = self.lines.take_pending() {
                        let label = self.position_label(registry, sink)?;
                        self.add_line_row(module, unit, block.section, label, directive, fallback)?;
                    }
                    sink.emit_fill(mi.size as u64, 0)?;
                }
                if let Some(label) = registry.end_instruction(id, mi.is_meta(), &mut self.tree.labels) {
                    sink.bind_label(label)?;
                }
                self.lines.end_instruction(func, id);
            }

            if let Some(section) = last_blocks.get(&idx) {
                if let Some((_, section_end)) = sections.get(section) {
                    sink.bind_label(*section_end)?;
                }
            }
        }

        Ok(FunctionLabels {
            begin,
            end,
            sections,
        })
    }

    /// Finalizes the module and writes every debug section
    pub fn end_module(&mut self, module: &DebugModule, sink: &mut dyn DebugSink) -> Result<()> {
        self.terminate_line_table();
        for section in &self.text_sections {
            let label = self.tree.labels.create();
            sink.switch_section(SectionId::Text(*section));
            sink.bind_label(label)?;
            self.tree.section_ends.insert(*section, label);
        }
        for (label, name) in &self.tree.externals {
            sink.declare_external(*label, name);
        }

        let tree = &mut self.tree;
        tree.finalize(module)?;
        tree.compute_layout()?;

        for table in &tree.line_tables {
            table.emit(sink, &tree.options, &mut tree.labels, &tree.section_ends)?;
        }
        tree.emit_abbrevs(sink)?;
        tree.emit_units(sink)?;
        // Range and location lists add to the address pool.
        tree.emit_range_lists(module, sink)?;
        tree.emit_loc_lists(sink)?;
        // v5 macros intern indexed strings.
        tree.emit_macros(module, sink)?;
        tree.emit_pub_sections(module, sink)?;
        if tree.options.use_aranges {
            tree.emit_aranges(sink)?;
        }
        tree.emit_accel_tables(sink)?;

        let split = tree.options.use_split_dwarf();
        if tree.options.segmented_str_offsets {
            tree.info.strings.emit_offsets_header(sink, &tree.options)?;
            if split {
                tree.skeletons.strings.emit_offsets_header(sink, &tree.options)?;
            }
        }
        let length = UnitLength::new(&mut tree.labels);
        tree.addr_pool.emit(sink, &tree.options, Some(length))?;

        let with_offsets = tree.options.version() >= 5 || split;
        tree.info.strings.emit(sink, &tree.options, with_offsets, !split)?;
        if split {
            tree.skeletons.strings.emit(sink, &tree.options, with_offsets, true)?;
        }

        info!(
            "Finished module: {} functions emitted, {} skipped, {} units",
            self.functions,
            self.skipped,
            self.tree.units.len()
        );
        Ok(())
    }
}
