//! Subprogram entries and the per-function scope tree

use crate::analysis::{
    CallSite, ConcreteLabel, ConcreteVariable, FunctionEntities, LexicalScope, LexicalScopeRef,
    LexicalScopes, VariableLocation,
};
use crate::core::{
    BlockId, Callee, DbgValueLoc, DbgValueLocEntry, DebugLabelId, DebugModule, DieRef,
    EmissionKind, EmitError, Label, LocalVariable, MachineFunction, RangeSpan, Result,
    ScopeKind, SubprogramId, TypeKind, UnitId, VariableId,
};
use crate::data::{FunctionLabels, LabelRegistry, LocEntry};
use crate::dwarf::die::{AttrValue, LocBlock};
use crate::dwarf::expr_writer::ExprWriter;
use crate::dwarf::tree::EntityTree;
use crate::dwarf::types::is_signed_type;
use gimli::constants::*;
use gimli::{DwAt, DwLang, DwTag, RunTimeEndian};
use tracing::{debug, trace, warn};

/// Everything known about a finished function
pub struct FunctionInfo<'a> {
    pub module: &'a DebugModule,
    pub func: &'a MachineFunction,
    pub scopes: &'a LexicalScopes,
    pub registry: &'a LabelRegistry,
    pub labels: &'a FunctionLabels,
    pub entities: &'a FunctionEntities,
    pub call_sites: &'a [CallSite],
}

impl FunctionInfo<'_> {
    fn label_before(&self, instr: crate::core::InstrId) -> Result<Label> {
        self.registry.label_before(instr).ok_or_else(|| {
            EmitError::Invariant(format!("no label before instruction {}", instr.0)).into()
        })
    }

    fn label_after(&self, instr: crate::core::InstrId) -> Result<Label> {
        self.registry.label_after(instr).ok_or_else(|| {
            EmitError::Invariant(format!("no label after instruction {}", instr.0)).into()
        })
    }

    fn has_own_entities(&self, scope: LexicalScopeRef) -> bool {
        self.entities.variables.iter().any(|v| v.scope == scope)
            || self.entities.labels.iter().any(|l| l.scope == scope)
    }
}

fn is_c_like(language: DwLang) -> bool {
    matches!(
        language,
        DW_LANG_C89
            | DW_LANG_C
            | DW_LANG_C99
            | DW_LANG_C11
            | DW_LANG_C17
            | DW_LANG_C_plus_plus
            | DW_LANG_C_plus_plus_03
            | DW_LANG_C_plus_plus_11
            | DW_LANG_C_plus_plus_14
            | DW_LANG_C_plus_plus_17
            | DW_LANG_C_plus_plus_20
            | DW_LANG_ObjC
            | DW_LANG_ObjC_plus_plus
    )
}

impl EntityTree {
    fn call_site_tag(&self, tag: DwTag) -> DwTag {
        if !self.options.use_gnu_analog_for_dwarf5() {
            return tag;
        }
        match tag {
            DW_TAG_call_site => DW_TAG_GNU_call_site,
            DW_TAG_call_site_parameter => DW_TAG_GNU_call_site_parameter,
            other => other,
        }
    }

    fn call_site_attr(&self, attr: DwAt) -> DwAt {
        if !self.options.use_gnu_analog_for_dwarf5() {
            return attr;
        }
        match attr {
            DW_AT_call_all_calls => DW_AT_GNU_all_call_sites,
            DW_AT_call_target => DW_AT_GNU_call_site_target,
            DW_AT_call_origin => DW_AT_abstract_origin,
            DW_AT_call_return_pc => DW_AT_low_pc,
            DW_AT_call_value => DW_AT_GNU_call_site_value,
            DW_AT_call_tail_call => DW_AT_GNU_tail_call,
            other => other,
        }
    }

    /// Line-tables-only units keep just enough to symbolize inlined frames
    fn minimal_inline_scopes(&self, module: &DebugModule, unit: UnitId) -> Result<bool> {
        match self.unit(unit).source {
            Some(cu) => Ok(module.compile_unit(cu)?.emission_kind == EmissionKind::LineTablesOnly),
            None => Ok(false),
        }
    }

    pub(crate) fn add_linkage_name(&mut self, die: DieRef, name: &str) -> Result<()> {
        if name.is_empty() || !self.options.use_all_linkage_names {
            return Ok(());
        }
        let attr = if self.options.version() >= 4 {
            DW_AT_linkage_name
        } else {
            DW_AT_MIPS_linkage_name
        };
        self.add_string(die, attr, name)
    }

    /// Subprogram entry used for declarations, definitions and call origins
    pub fn get_or_create_subprogram_die(
        &mut self,
        module: &DebugModule,
        unit: UnitId,
        sp: SubprogramId,
    ) -> Result<DieRef> {
        if let Some(die) = self.subprogram_dies.get(&(unit, sp)) {
            return Ok(*die);
        }
        let meta = module.subprogram(sp)?;
        let minimal = self.minimal_inline_scopes(module, unit)?;
        let context = if minimal {
            self.unit(unit).root
        } else if let Some(decl) = meta.declaration {
            self.get_or_create_subprogram_die(module, unit, decl)?;
            self.unit(unit).root
        } else {
            self.context_die(module, unit, Some(meta.parent))?
        };
        if let Some(die) = self.subprogram_dies.get(&(unit, sp)) {
            return Ok(*die);
        }
        let die = self.arena.add_child(context, DW_TAG_subprogram);
        self.subprogram_dies.insert((unit, sp), die);
        self.apply_subprogram_attributes(module, unit, sp, die, minimal)?;
        Ok(die)
    }

    fn apply_subprogram_attributes(
        &mut self,
        module: &DebugModule,
        unit: UnitId,
        sp: SubprogramId,
        die: DieRef,
        minimal: bool,
    ) -> Result<()> {
        let meta = module.subprogram(sp)?;
        let mut decl_die = None;
        let mut decl_linkage = None;
        if let Some(decl) = meta.declaration.filter(|_| !minimal) {
            let decl_meta = module.subprogram(decl)?;
            decl_die = self.subprogram_dies.get(&(unit, decl)).copied();
            decl_linkage = decl_meta.linkage_name.as_deref();
            if decl_meta.file != meta.file {
                if let Some(file) = meta.file {
                    if let Some(number) = self.file_number(module, unit, file)? {
                        self.arena.add_udata(die, DW_AT_decl_file, number);
                    }
                }
            }
            if decl_meta.line != meta.line {
                self.arena.add_udata(die, DW_AT_decl_line, meta.line as u64);
            }
        }
        if let Some(linkage) = meta.linkage_name.as_deref() {
            if decl_linkage != Some(linkage) {
                self.add_linkage_name(die, linkage)?;
            }
        }
        if let Some(decl_die) = decl_die {
            self.arena.add_entry(die, DW_AT_specification, decl_die);
            return Ok(());
        }
        if !meta.name.is_empty() {
            self.add_string(die, DW_AT_name, &meta.name)?;
        }
        if minimal {
            return Ok(());
        }
        self.add_source_line(module, die, meta.file, meta.line)?;

        let language = module.compile_unit(meta.unit)?.language;
        if meta.flags.prototyped && is_c_like(language) {
            self.arena.add_flag(die, DW_AT_prototyped);
        }
        let signature = match meta.ty {
            Some(ty) => match &module.ty(ty)?.kind {
                TypeKind::Subroutine { types } => types.clone(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        };
        if let Some(Some(ret)) = signature.first() {
            self.add_type_attr(module, die, *ret)?;
        }
        if !meta.is_definition {
            self.arena.add_flag(die, DW_AT_declaration);
            for arg in signature.iter().skip(1) {
                match arg {
                    Some(ty) => {
                        let param = self.arena.add_child(die, DW_TAG_formal_parameter);
                        self.add_type_attr(module, param, *ty)?;
                        self.arena.add_flag(param, DW_AT_artificial);
                    }
                    None => {
                        self.arena.add_child(die, DW_TAG_unspecified_parameters);
                    }
                }
            }
        }
        if meta.flags.artificial {
            self.arena.add_flag(die, DW_AT_artificial);
        }
        if meta.flags.external {
            self.arena.add_flag(die, DW_AT_external);
        }
        if self.options.apple_extension_attributes && meta.flags.optimized {
            self.arena.add_flag(die, DW_AT_APPLE_optimized);
        }
        if meta.flags.noreturn {
            self.arena.add_flag(die, DW_AT_noreturn);
        }
        Ok(())
    }

    /// Out-of-line description shared by every inlined copy of `sp`
    pub fn abstract_subprogram_die(
        &mut self,
        module: &DebugModule,
        unit: UnitId,
        sp: SubprogramId,
    ) -> Result<DieRef> {
        if let Some(die) = self.abstract_subprograms.get(&(unit, sp)) {
            return Ok(*die);
        }
        let meta = module.subprogram(sp)?;
        let minimal = self.minimal_inline_scopes(module, unit)?;
        let context = if minimal {
            self.unit(unit).root
        } else if let Some(decl) = meta.declaration {
            self.get_or_create_subprogram_die(module, unit, decl)?;
            self.unit(unit).root
        } else {
            self.context_die(module, unit, Some(meta.parent))?
        };
        let die = self.arena.add_child(context, DW_TAG_subprogram);
        self.abstract_subprograms.insert((unit, sp), die);
        self.apply_subprogram_attributes(module, unit, sp, die, minimal)?;
        if !minimal {
            self.arena.add(
                die,
                DW_AT_inline,
                DW_FORM_data1,
                AttrValue::Udata(DW_INL_inlined.0 as u64),
            );
        }
        trace!("Abstract subprogram '{}' in unit {}", meta.name, unit.0);
        Ok(die)
    }

    fn abstract_scope_die(
        &mut self,
        info: &FunctionInfo,
        unit: UnitId,
        scope: LexicalScopeRef,
    ) -> Result<DieRef> {
        let lexical = info.scopes.scope(scope);
        if let ScopeKind::Subprogram(sp) = info.module.scope(lexical.desc)?.kind {
            return self.abstract_subprogram_die(info.module, unit, sp);
        }
        if let Some(die) = self.abstract_scopes.get(&(unit, lexical.desc)) {
            return Ok(*die);
        }
        let parent = lexical.parent.ok_or_else(|| {
            EmitError::Invariant(format!(
                "abstract lexical block {} has no enclosing scope",
                lexical.desc.0
            ))
        })?;
        let parent_die = self.abstract_scope_die(info, unit, parent)?;
        let die = self.arena.add_child(parent_die, DW_TAG_lexical_block);
        self.abstract_scopes.insert((unit, lexical.desc), die);
        Ok(die)
    }

    fn apply_variable_attributes(
        &mut self,
        module: &DebugModule,
        die: DieRef,
        var: &LocalVariable,
    ) -> Result<()> {
        if !var.name.is_empty() {
            self.add_string(die, DW_AT_name, &var.name)?;
        }
        self.add_source_line(module, die, var.file, var.line)?;
        if let Some(ty) = var.ty {
            self.add_type_attr(module, die, ty)?;
        }
        if var.artificial {
            self.arena.add_flag(die, DW_AT_artificial);
        }
        Ok(())
    }

    fn ensure_abstract_variable(
        &mut self,
        info: &FunctionInfo,
        unit: UnitId,
        id: VariableId,
    ) -> Result<()> {
        if self.abstract_variables.contains_key(&(unit, id)) {
            return Ok(());
        }
        let var = info.module.variable(id)?;
        let Some(scope) = info.scopes.find_abstract_scope(info.module, var.scope) else {
            return Ok(());
        };
        let parent = self.abstract_scope_die(info, unit, scope)?;
        let tag = if var.is_parameter() {
            DW_TAG_formal_parameter
        } else {
            DW_TAG_variable
        };
        let die = self.arena.add_child(parent, tag);
        self.abstract_variables.insert((unit, id), die);
        self.apply_variable_attributes(info.module, die, var)
    }

    fn ensure_abstract_label(
        &mut self,
        info: &FunctionInfo,
        unit: UnitId,
        id: DebugLabelId,
    ) -> Result<()> {
        if self.abstract_labels.contains_key(&(unit, id)) {
            return Ok(());
        }
        let label = info.module.label(id)?;
        let Some(scope) = info.scopes.find_abstract_scope(info.module, label.scope) else {
            return Ok(());
        };
        let parent = self.abstract_scope_die(info, unit, scope)?;
        let die = self.arena.add_child(parent, DW_TAG_label);
        self.abstract_labels.insert((unit, id), die);
        if !label.name.is_empty() {
            self.add_string(die, DW_AT_name, &label.name)?;
        }
        self.add_source_line(info.module, die, label.file, label.line)
    }

    /// Code ranges of a scope, split where the scope spans several
    /// basic-block sections
    fn scope_ranges(&self, info: &FunctionInfo, scope: &LexicalScope) -> Result<Vec<RangeSpan>> {
        let mut spans = Vec::new();
        for range in &scope.ranges {
            let begin = info.label_before(range.first)?;
            let end = info.label_after(range.last)?;
            let first_block = info.func.block_of(range.first);
            let last_block = info.func.block_of(range.last);
            let first_section = info.func.block(first_block).section;
            let last_section = info.func.block(last_block).section;
            if first_section == last_section {
                spans.push(RangeSpan { begin, end });
                continue;
            }
            let mut sections = Vec::new();
            for idx in first_block.index()..=last_block.index() {
                let section = info.func.block(BlockId(idx as u32)).section;
                if !sections.contains(&section) {
                    sections.push(section);
                }
            }
            for section in sections {
                let (section_begin, section_end) =
                    info.labels.section_range(section).ok_or_else(|| {
                        EmitError::Invariant(format!(
                            "function {} has no labels for section {}",
                            info.func.name, section
                        ))
                    })?;
                spans.push(RangeSpan {
                    begin: if section == first_section {
                        begin
                    } else {
                        section_begin
                    },
                    end: if section == last_section {
                        end
                    } else {
                        section_end
                    },
                });
            }
        }
        Ok(spans)
    }

    /// Builds the subprogram entry and everything below it for a finished
    /// function
    pub fn construct_function(&mut self, info: &FunctionInfo, unit: UnitId) -> Result<DieRef> {
        let module = info.module;
        let sp = info.func.subprogram.ok_or_else(|| {
            EmitError::InvalidInput(format!("function {} has no subprogram", info.func.name))
        })?;
        let meta = module.subprogram(sp)?;

        for scope in info.scopes.abstract_subprograms() {
            let desc = info.scopes.scope(*scope).desc;
            if let ScopeKind::Subprogram(inlined) = module.scope(desc)?.kind {
                self.abstract_subprogram_die(module, unit, inlined)?;
            }
        }

        let sp_die = match (
            self.subprogram_dies.get(&(unit, sp)).copied(),
            self.abstract_subprograms.get(&(unit, sp)).copied(),
        ) {
            (None, Some(abstract_die)) => {
                let parent = self
                    .arena
                    .get(abstract_die)
                    .parent
                    .unwrap_or(self.unit(unit).root);
                let die = self.arena.add_child(parent, DW_TAG_subprogram);
                self.arena.add_entry(die, DW_AT_abstract_origin, abstract_die);
                self.subprogram_dies.insert((unit, sp), die);
                die
            }
            _ => self.get_or_create_subprogram_die(module, unit, sp)?,
        };

        let mut ranges: Vec<RangeSpan> = info
            .labels
            .sections
            .values()
            .map(|(begin, end)| RangeSpan {
                begin: *begin,
                end: *end,
            })
            .collect();
        if ranges.is_empty() {
            ranges.push(RangeSpan {
                begin: info.labels.begin,
                end: info.labels.end,
            });
        }
        self.attach_ranges(sp_die, ranges)?;

        let minimal = self.minimal_inline_scopes(module, unit)?;
        if !minimal {
            let target = self.target.clone();
            let frame = target.frame_register(info.func);
            let mut writer = ExprWriter::new(&self.options, target.as_ref());
            if writer.add_register(frame)? {
                let block = writer.finish();
                self.add_block(sp_die, DW_AT_frame_base, block);
            }
        }

        self.add_accel_name(module, &meta.name, sp_die)?;
        if let Some(linkage) = meta.linkage_name.as_deref() {
            if linkage != meta.name {
                self.add_accel_name(module, linkage, sp_die)?;
            }
        }
        if meta.flags.external {
            let parent_kind = &module.scope(meta.parent)?.kind;
            if matches!(
                parent_kind,
                ScopeKind::CompileUnit(_) | ScopeKind::Namespace { .. }
            ) {
                self.add_global_name(module, unit, &meta.name, sp_die, Some(meta.parent))?;
            }
        }

        if let Some(root) = info.scopes.root() {
            self.construct_scope_children(info, unit, root, sp_die)?;
        }
        self.construct_call_sites(info, unit, sp, sp_die)?;
        debug!(
            "Built subprogram entry for {} ({} variables, {} call sites)",
            info.func.name,
            info.entities.variables.len(),
            info.call_sites.len()
        );
        Ok(sp_die)
    }

    fn construct_scope_children(
        &mut self,
        info: &FunctionInfo,
        unit: UnitId,
        scope: LexicalScopeRef,
        parent: DieRef,
    ) -> Result<()> {
        let mut variables: Vec<&ConcreteVariable> = info
            .entities
            .variables
            .iter()
            .filter(|v| v.scope == scope)
            .collect();
        let mut keyed = Vec::with_capacity(variables.len());
        for var in variables.drain(..) {
            let arg = info.module.variable(var.var.variable)?.arg;
            keyed.push((arg.is_none(), arg.unwrap_or(0), var));
        }
        keyed.sort_by_key(|(is_local, arg, _)| (*is_local, *arg));
        for (_, _, var) in keyed {
            self.construct_variable(info, unit, var, parent)?;
        }
        for label in info.entities.labels.iter().filter(|l| l.scope == scope) {
            self.construct_label(info, unit, label, parent)?;
        }
        for child in &info.scopes.scope(scope).children {
            self.construct_scope(info, unit, *child, parent)?;
        }
        Ok(())
    }

    fn construct_scope(
        &mut self,
        info: &FunctionInfo,
        unit: UnitId,
        scope: LexicalScopeRef,
        parent: DieRef,
    ) -> Result<()> {
        let lexical = info.scopes.scope(scope);
        if lexical.is_abstract || lexical.ranges.is_empty() {
            return Ok(());
        }
        let kind = info.module.scope(lexical.desc)?.kind.clone();
        if let (Some(inlined_at), ScopeKind::Subprogram(sp)) = (lexical.inlined_at, &kind) {
            let origin = self.abstract_subprogram_die(info.module, unit, *sp)?;
            let die = self.arena.add_child(parent, DW_TAG_inlined_subroutine);
            self.arena.add_entry(die, DW_AT_abstract_origin, origin);
            let ranges = self.scope_ranges(info, lexical)?;
            self.attach_ranges(die, ranges)?;

            let call = info.module.inlined(inlined_at)?;
            if let Some(file) = info.module.scope_file(call.scope)? {
                if let Some(number) = self.file_number(info.module, unit, file)? {
                    self.arena.add_udata(die, DW_AT_call_file, number);
                }
            }
            self.arena.add_udata(die, DW_AT_call_line, call.line as u64);
            if call.column != 0 {
                self.arena.add_udata(die, DW_AT_call_column, call.column as u64);
            }
            return self.construct_scope_children(info, unit, scope, die);
        }

        if !info.has_own_entities(scope) {
            for child in &lexical.children {
                self.construct_scope(info, unit, *child, parent)?;
            }
            return Ok(());
        }
        let die = self.arena.add_child(parent, DW_TAG_lexical_block);
        if lexical.inlined_at.is_some() {
            if let Some(origin) = self.abstract_scopes.get(&(unit, lexical.desc)).copied() {
                self.arena.add_entry(die, DW_AT_abstract_origin, origin);
            }
        }
        let ranges = self.scope_ranges(info, lexical)?;
        self.attach_ranges(die, ranges)?;
        self.construct_scope_children(info, unit, scope, die)
    }

    fn construct_variable(
        &mut self,
        info: &FunctionInfo,
        unit: UnitId,
        concrete: &ConcreteVariable,
        parent: DieRef,
    ) -> Result<()> {
        let id = concrete.var.variable;
        let var = info.module.variable(id)?;
        let tag = if var.is_parameter() {
            DW_TAG_formal_parameter
        } else {
            DW_TAG_variable
        };
        let die = self.arena.add_child(parent, tag);
        if concrete.var.inlined_at.is_some() {
            self.ensure_abstract_variable(info, unit, id)?;
        }
        match self.abstract_variables.get(&(unit, id)).copied() {
            Some(origin) => self.arena.add_entry(die, DW_AT_abstract_origin, origin),
            None => self.apply_variable_attributes(info.module, die, var)?,
        }

        let Some(location) = &concrete.location else {
            return Ok(());
        };
        let signed = is_signed_type(info.module, var.ty)?;
        let target = self.target.clone();
        match location {
            VariableLocation::Single(value) => {
                if self.add_constant_value(die, value, signed) {
                    return Ok(());
                }
                let mut writer = ExprWriter::new(&self.options, target.as_ref());
                if writer.add_value(value, signed)? {
                    let block = writer.finish();
                    self.add_block(die, DW_AT_location, block);
                }
            }
            VariableLocation::StackSlots(slots) => {
                let mut writer = ExprWriter::new(&self.options, target.as_ref());
                if writer.add_frame_slots(slots)? {
                    let block = writer.finish();
                    self.add_block(die, DW_AT_location, block);
                }
            }
            VariableLocation::EntryValue(regs) => {
                let mut writer = ExprWriter::new(&self.options, target.as_ref());
                if writer.add_entry_values(regs)? {
                    let block = writer.finish();
                    self.add_block(die, DW_AT_location, block);
                }
            }
            VariableLocation::List(entries) => {
                let mut list = Vec::with_capacity(entries.len());
                for entry in entries {
                    let mut writer = ExprWriter::new(&self.options, target.as_ref());
                    if !writer.add_values(&entry.values, signed)? {
                        trace!("Dropping undescribable location entry of '{}'", var.name);
                        continue;
                    }
                    list.push(LocEntry {
                        begin: entry.begin,
                        end: entry.end,
                        expr: writer.finish().bytes,
                    });
                }
                if !list.is_empty() {
                    self.add_loc_list(die, list)?;
                }
            }
        }
        Ok(())
    }

    /// `DW_AT_const_value` for a plain constant; false when the value needs
    /// a location expression
    fn add_constant_value(&mut self, die: DieRef, value: &DbgValueLoc, signed: bool) -> bool {
        if value.variadic || value.values.len() != 1 || !value.expr.is_empty() {
            return false;
        }
        match value.values[0] {
            DbgValueLocEntry::Int(v) | DbgValueLocEntry::ConstantInt(v) => {
                if signed {
                    self.arena.add_sdata(die, DW_AT_const_value, v);
                } else {
                    self.arena.add(
                        die,
                        DW_AT_const_value,
                        DW_FORM_udata,
                        AttrValue::Udata(v as u64),
                    );
                }
                true
            }
            DbgValueLocEntry::ConstantFp { bits, bytes } => {
                let width = (bytes as usize).min(8);
                let mut raw = match self.options.endian {
                    RunTimeEndian::Little => bits.to_le_bytes()[..width].to_vec(),
                    RunTimeEndian::Big => bits.to_be_bytes()[8 - width..].to_vec(),
                };
                raw.truncate(width);
                self.arena.add(
                    die,
                    DW_AT_const_value,
                    DW_FORM_block1,
                    AttrValue::Block(LocBlock::from_bytes(raw)),
                );
                true
            }
            _ => false,
        }
    }

    fn construct_label(
        &mut self,
        info: &FunctionInfo,
        unit: UnitId,
        concrete: &ConcreteLabel,
        parent: DieRef,
    ) -> Result<()> {
        let id = concrete.label.label;
        let die = self.arena.add_child(parent, DW_TAG_label);
        if concrete.label.inlined_at.is_some() {
            self.ensure_abstract_label(info, unit, id)?;
        }
        match self.abstract_labels.get(&(unit, id)).copied() {
            Some(origin) => self.arena.add_entry(die, DW_AT_abstract_origin, origin),
            None => {
                let label = info.module.label(id)?;
                if !label.name.is_empty() {
                    self.add_string(die, DW_AT_name, &label.name)?;
                }
                self.add_source_line(info.module, die, label.file, label.line)?;
            }
        }
        self.add_label_address(die, DW_AT_low_pc, concrete.symbol)
    }

    fn construct_call_sites(
        &mut self,
        info: &FunctionInfo,
        unit: UnitId,
        sp: SubprogramId,
        sp_die: DieRef,
    ) -> Result<()> {
        let meta = info.module.subprogram(sp)?;
        if !meta.flags.all_calls_described || !meta.is_definition {
            return Ok(());
        }
        let version = self.options.version();
        let gnu = version == 4 && self.options.tune_for_gdb();
        if !gnu && version < 5 {
            return Ok(());
        }
        let attr = self.call_site_attr(DW_AT_call_all_calls);
        self.arena.add_flag(sp_die, attr);

        for site in info.call_sites {
            self.construct_call_site(info, unit, site, sp_die)?;
        }
        Ok(())
    }

    fn construct_call_site(
        &mut self,
        info: &FunctionInfo,
        unit: UnitId,
        site: &CallSite,
        sp_die: DieRef,
    ) -> Result<()> {
        let tag = self.call_site_tag(DW_TAG_call_site);
        let die = self.arena.add_child(sp_die, tag);
        let target = self.target.clone();

        match site.callee {
            Callee::Function(callee) => {
                let origin = self.get_or_create_subprogram_die(info.module, unit, callee)?;
                let attr = self.call_site_attr(DW_AT_call_origin);
                self.arena.add_entry(die, attr, origin);
            }
            Callee::Register(reg) => {
                let mut writer = ExprWriter::new(&self.options, target.as_ref());
                if writer.add_register(reg)? {
                    let block = writer.finish();
                    let attr = self.call_site_attr(DW_AT_call_target);
                    self.add_block(die, attr, block);
                } else {
                    warn!("Call target register {} has no DWARF number", reg.0);
                }
            }
        }

        let gnu = self.options.use_gnu_analog_for_dwarf5();
        if site.tail_call {
            let attr = self.call_site_attr(DW_AT_call_tail_call);
            self.arena.add_flag(die, attr);
            if !gnu {
                let call_pc = info.label_before(site.instr)?;
                self.add_label_address(die, DW_AT_call_pc, call_pc)?;
            }
        }
        if gnu {
            let return_pc = info.label_after(site.instr)?;
            self.add_label_address(die, DW_AT_low_pc, return_pc)?;
        } else if !site.tail_call {
            let return_pc = info.label_after(site.instr)?;
            self.add_label_address(die, DW_AT_call_return_pc, return_pc)?;
        }

        if !self.options.emit_entry_values {
            return Ok(());
        }
        let param_tag = self.call_site_tag(DW_TAG_call_site_parameter);
        let value_attr = self.call_site_attr(DW_AT_call_value);
        for param in &site.params {
            let mut location = ExprWriter::new(&self.options, target.as_ref());
            if !location.add_register(param.register)? {
                continue;
            }
            let mut value = ExprWriter::for_call_site_value(&self.options, target.as_ref());
            if !value.add_value(&param.value, false)? {
                continue;
            }
            let location = location.finish();
            let value = value.finish();
            let child = self.arena.add_child(die, param_tag);
            self.add_block(child, DW_AT_location, location);
            self.add_block(child, value_attr, value);
        }
        Ok(())
    }
}
