//! Module-wide entity tree
//!
//! `EntityTree` owns every unit, the entry arena and the side tables shared
//! by all units: the address pool, location lists, line tables, accelerator
//! entries and arange labels. Construction happens in phase 1 while
//! functions are emitted; `finalize` adds the unit-level linkage attributes
//! before layout fixes offsets in phase 2.

use crate::core::{
    AccelTableKind, CompileUnitId, DebugLabelId, DebugModule, DebugSection, DieRef, EmissionKind, EmitError,
    EmitOptions, FileId, GlobalVariableId, Label, NameTableKind, RangeSpan, Result, ScopeId,
    SubprogramId, TargetInfo, TypeId, UnitId, VariableId,
};
use crate::data::{AddressPool, DebugLocStream, LabelAllocator, LineFileTable, LocEntry};
use crate::dwarf::die::{AttrValue, DieArena, LocBlock, StrRepr};
use crate::dwarf::hash::unit_signature;
use crate::dwarf::unit::{Unit, UnitFile, UnitKind};
use crate::emit::accel::AccelTables;
use crate::emit::line::LineTable;
use gimli::constants::*;
use gimli::{DwAt, DwTag};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, trace};

pub(crate) const DW_AT_LLVM_SYSROOT: DwAt = DwAt(0x3e02);
pub(crate) const DW_AT_APPLE_SDK: DwAt = DwAt(0x3fef);

pub struct EntityTree {
    pub options: EmitOptions,
    pub target: Arc<dyn TargetInfo>,
    pub arena: DieArena,
    pub units: Vec<Unit>,
    /// Primary file, or the companion file when split debug is on
    pub info: UnitFile,
    /// Skeleton units in the primary file; empty unless split
    pub skeletons: UnitFile,
    pub addr_pool: AddressPool,
    pub loc_stream: DebugLocStream,
    pub labels: LabelAllocator,
    pub accel: AccelTables,
    pub line_tables: Vec<LineTable>,
    /// Addresses the aranges table must cover, with the unit referencing them
    pub arange_labels: Vec<(UnitId, Label)>,
    /// Begin label of the first function placed in each code section
    pub section_labels: BTreeMap<u32, Label>,
    /// Bound after the last byte of each code section
    pub section_ends: BTreeMap<u32, Label>,
    /// Labels naming symbols outside the debug output
    pub externals: Vec<(Label, String)>,
    pub macro_labels: HashMap<UnitId, Label>,
    /// Units left out of the output (empty split units, directive-only units)
    pub suppressed: Vec<UnitId>,

    cu_map: HashMap<CompileUnitId, UnitId>,
    first_cu: Option<UnitId>,
    pub(crate) type_dies: HashMap<(UnitId, TypeId), DieRef>,
    pub(crate) type_signatures: HashMap<TypeId, u64>,
    pub(crate) signature_units: HashMap<u64, UnitId>,
    /// Type units of the top-level type currently being built
    pub(crate) type_batch: Vec<(UnitId, TypeId)>,
    pub(crate) context_dies: HashMap<(UnitId, ScopeId), DieRef>,
    pub(crate) subprogram_dies: HashMap<(UnitId, SubprogramId), DieRef>,
    pub(crate) abstract_subprograms: HashMap<(UnitId, SubprogramId), DieRef>,
    pub(crate) abstract_scopes: HashMap<(UnitId, ScopeId), DieRef>,
    pub(crate) abstract_variables: HashMap<(UnitId, VariableId), DieRef>,
    pub(crate) abstract_labels: HashMap<(UnitId, DebugLabelId), DieRef>,
    pub(crate) global_dies: HashMap<GlobalVariableId, DieRef>,
}

impl EntityTree {
    pub fn new(options: EmitOptions, target: Arc<dyn TargetInfo>) -> Self {
        let mut labels = LabelAllocator::new();
        let split = options.use_split_dwarf();
        let info = UnitFile::new(split, labels.create(), labels.create(), labels.create());
        let skeletons = UnitFile::new(false, labels.create(), labels.create(), labels.create());
        let addr_pool = AddressPool::new(labels.create());
        let loc_stream = DebugLocStream::new(labels.create());
        Self {
            options,
            target,
            arena: DieArena::new(),
            units: Vec::new(),
            info,
            skeletons,
            addr_pool,
            loc_stream,
            labels,
            accel: AccelTables::default(),
            line_tables: Vec::new(),
            arange_labels: Vec::new(),
            section_labels: BTreeMap::new(),
            section_ends: BTreeMap::new(),
            externals: Vec::new(),
            macro_labels: HashMap::new(),
            suppressed: Vec::new(),
            cu_map: HashMap::new(),
            first_cu: None,
            type_dies: HashMap::new(),
            type_signatures: HashMap::new(),
            signature_units: HashMap::new(),
            type_batch: Vec::new(),
            context_dies: HashMap::new(),
            subprogram_dies: HashMap::new(),
            abstract_subprograms: HashMap::new(),
            abstract_scopes: HashMap::new(),
            abstract_variables: HashMap::new(),
            abstract_labels: HashMap::new(),
            global_dies: HashMap::new(),
        }
    }

    pub fn unit(&self, id: UnitId) -> &Unit {
        &self.units[id.index()]
    }

    pub fn unit_mut(&mut self, id: UnitId) -> &mut Unit {
        &mut self.units[id.index()]
    }

    /// Owning unit of a live entry
    pub fn die_unit(&self, die: DieRef) -> Result<UnitId> {
        self.arena.get(die).unit.ok_or_else(|| {
            EmitError::Invariant(format!("entry {} has no owning unit", die.0)).into()
        })
    }

    pub fn file_of(&self, unit: UnitId) -> &UnitFile {
        match self.unit(unit).kind {
            UnitKind::Skeleton => &self.skeletons,
            _ => &self.info,
        }
    }

    pub fn file_of_mut(&mut self, unit: UnitId) -> &mut UnitFile {
        match self.unit(unit).kind {
            UnitKind::Skeleton => &mut self.skeletons,
            _ => &mut self.info,
        }
    }

    /// Unit carrying the primary-file attributes of `unit`
    pub fn skeleton_or_self(&self, unit: UnitId) -> UnitId {
        self.unit(unit).skeleton.unwrap_or(unit)
    }

    pub fn is_suppressed(&self, unit: UnitId) -> bool {
        self.suppressed.contains(&unit)
    }

    /// Compile units in creation order
    pub fn compile_units(&self) -> impl Iterator<Item = &Unit> {
        self.units
            .iter()
            .filter(|u| matches!(u.kind, UnitKind::Compile | UnitKind::SplitCompile))
    }

    pub fn compile_unit_for(&self, cu: CompileUnitId) -> Option<UnitId> {
        self.cu_map.get(&cu).copied()
    }

    /// Unit for a source compile unit, created on first reference
    pub fn get_or_create_compile_unit(
        &mut self,
        module: &DebugModule,
        cu: CompileUnitId,
    ) -> Result<UnitId> {
        if let Some(unit) = self.cu_map.get(&cu) {
            return Ok(*unit);
        }
        let meta = module.compile_unit(cu)?;
        let split = self.options.use_split_dwarf();
        if split && !self.options.share_across_dwo_cus {
            if let Some(first) = self.first_cu {
                if !meta.split_debug_inlining || meta.emission_kind == EmissionKind::FullDebug {
                    debug!("Redirecting compile unit {} to the first split unit", cu.0);
                    self.cu_map.insert(cu, first);
                    return Ok(first);
                }
            }
        }

        let root_file = module.file(meta.file)?.clone();
        let id = UnitId(self.units.len() as u32);
        let kind = if split {
            UnitKind::SplitCompile
        } else {
            UnitKind::Compile
        };
        let root = self.arena.create(DW_TAG_compile_unit, Some(id));
        let label = self.labels.create();
        let mut unit = Unit::new(id, kind, root, label);
        unit.source = Some(cu);

        let line_label = self.labels.create();
        self.line_tables.push(LineTable::new(
            LineFileTable::new(&root_file.directory, &root_file, self.options.version()),
            line_label,
            id,
        ));
        unit.line_table = Some(self.line_tables.len() - 1);
        self.units.push(unit);
        self.info.units.push(id);
        self.cu_map.insert(cu, id);
        if self.first_cu.is_none() {
            self.first_cu = Some(id);
        }
        if meta.emission_kind == EmissionKind::DebugDirectivesOnly {
            self.suppressed.push(id);
        }

        self.finish_unit_attributes(module, cu, id)?;
        if split {
            let skeleton = self.construct_skeleton(module, cu, id)?;
            self.unit_mut(id).skeleton = Some(skeleton);
        }
        if !meta.macros.is_empty() {
            let label = self.labels.create();
            self.macro_labels.insert(id, label);
        }
        info!(
            "Created {:?} unit {} for '{}'",
            kind, id.0, root_file.name
        );
        Ok(id)
    }

    fn finish_unit_attributes(
        &mut self,
        module: &DebugModule,
        cu: CompileUnitId,
        unit: UnitId,
    ) -> Result<()> {
        let meta = module.compile_unit(cu)?;
        let file = module.file(meta.file)?;
        let root = self.unit(unit).root;
        let split = self.options.use_split_dwarf();

        if !meta.producer.is_empty() {
            self.add_string(root, DW_AT_producer, &meta.producer)?;
        }
        self.arena.add(
            root,
            DW_AT_language,
            DW_FORM_data2,
            AttrValue::Udata(meta.language.0 as u64),
        );
        self.add_string(root, DW_AT_name, &file.name)?;
        if let Some(sysroot) = meta.sysroot.as_deref().filter(|s| !s.is_empty()) {
            self.add_string(root, DW_AT_LLVM_SYSROOT, sysroot)?;
        }
        if let Some(sdk) = meta.sdk.as_deref().filter(|s| !s.is_empty()) {
            self.add_string(root, DW_AT_APPLE_SDK, sdk)?;
        }
        if self.options.segmented_str_offsets && !split {
            self.add_str_offsets_base(unit);
        }
        if !split {
            self.add_stmt_list(unit);
            if !file.directory.is_empty() {
                self.add_string(root, DW_AT_comp_dir, &file.directory)?;
            }
            self.add_gnu_pub_attributes(module, unit)?;
        }
        if self.options.apple_extension_attributes {
            if meta.optimized {
                self.arena.add_flag(root, DW_AT_APPLE_optimized);
            }
            if !meta.flags.is_empty() {
                self.add_string(root, DW_AT_APPLE_flags, &meta.flags)?;
            }
            if meta.runtime_version != 0 {
                self.arena.add(
                    root,
                    DW_AT_APPLE_major_runtime_vers,
                    DW_FORM_data1,
                    AttrValue::Udata(meta.runtime_version as u64),
                );
            }
        }
        Ok(())
    }

    fn construct_skeleton(
        &mut self,
        module: &DebugModule,
        cu: CompileUnitId,
        unit: UnitId,
    ) -> Result<UnitId> {
        let meta = module.compile_unit(cu)?;
        let file = module.file(meta.file)?;
        let id = UnitId(self.units.len() as u32);
        let tag = if self.options.version() >= 5 {
            DW_TAG_skeleton_unit
        } else {
            DW_TAG_compile_unit
        };
        let root = self.arena.create(tag, Some(id));
        let label = self.labels.create();
        let mut skeleton = Unit::new(id, UnitKind::Skeleton, root, label);
        skeleton.source = Some(cu);
        skeleton.line_table = self.unit(unit).line_table;
        self.units.push(skeleton);
        self.skeletons.units.push(id);

        self.add_stmt_list(id);
        if !file.directory.is_empty() {
            self.add_string(root, DW_AT_comp_dir, &file.directory)?;
        }
        self.add_gnu_pub_attributes(module, id)?;
        if self.options.segmented_str_offsets {
            self.add_str_offsets_base(id);
        }
        trace!("Skeleton unit {} for split unit {}", id.0, unit.0);
        Ok(id)
    }

    fn add_stmt_list(&mut self, unit: UnitId) {
        let Some(table) = self.unit(unit).line_table else {
            return;
        };
        let label = self.line_tables[table].label;
        let root = self.unit(unit).root;
        let form = self.options.section_offset_form();
        self.arena
            .add(root, DW_AT_stmt_list, form, AttrValue::SecOffset(label));
    }

    pub(crate) fn add_str_offsets_base(&mut self, unit: UnitId) {
        let base = self.file_of(unit).strings.offsets_base();
        let root = self.unit(unit).root;
        self.arena.add(
            root,
            DW_AT_str_offsets_base,
            DW_FORM_sec_offset,
            AttrValue::SecOffset(base),
        );
    }

    /// Whether the unit gets `.debug_pubnames`-style tables
    pub fn has_dwarf_pub_sections(&self, module: &DebugModule, unit: UnitId) -> Result<bool> {
        let Some(cu) = self.unit(unit).source else {
            return Ok(false);
        };
        let meta = module.compile_unit(cu)?;
        Ok(match meta.name_table_kind {
            NameTableKind::None | NameTableKind::Apple => false,
            NameTableKind::Gnu => true,
            NameTableKind::Default => {
                self.options.tune_for_gdb()
                    && meta.emission_kind == EmissionKind::FullDebug
                    && self.options.accel_kind != AccelTableKind::Apple
                    && self.options.version() < 5
            }
        })
    }

    pub fn uses_gnu_pub_sections(&self, module: &DebugModule, unit: UnitId) -> Result<bool> {
        let Some(cu) = self.unit(unit).source else {
            return Ok(false);
        };
        Ok(module.compile_unit(cu)?.name_table_kind == NameTableKind::Gnu)
    }

    fn add_gnu_pub_attributes(&mut self, module: &DebugModule, unit: UnitId) -> Result<()> {
        if self.has_dwarf_pub_sections(module, unit)? && self.uses_gnu_pub_sections(module, unit)? {
            let root = self.unit(unit).root;
            self.arena.add_flag(root, DW_AT_GNU_pubnames);
        }
        Ok(())
    }

    /// String attribute in the form the unit's file uses
    pub fn add_string(&mut self, die: DieRef, name: DwAt, text: &str) -> Result<()> {
        let unit = self.die_unit(die)?;
        let dwo = self.unit(unit).kind.is_dwo();
        let inline = self.options.use_inline_strings;
        let segmented = self.options.segmented_str_offsets;
        let (form, repr) = if inline {
            (DW_FORM_string, StrRepr::Inline)
        } else if segmented || dwo {
            let entry = self.file_of_mut(unit).strings.indexed_entry(text);
            let index = entry.index.unwrap_or(0);
            let form = if !segmented {
                DW_FORM_GNU_str_index
            } else if index <= 0xff {
                DW_FORM_strx1
            } else if index <= 0xffff {
                DW_FORM_strx2
            } else if index <= 0xff_ffff {
                DW_FORM_strx3
            } else {
                DW_FORM_strx4
            };
            (form, StrRepr::Index(index))
        } else {
            let entry = self.file_of_mut(unit).strings.entry(text);
            (DW_FORM_strp, StrRepr::Offset(entry.offset))
        };
        self.arena.add(
            die,
            name,
            form,
            AttrValue::Str {
                text: text.to_string(),
                repr,
            },
        );
        Ok(())
    }

    /// Relocatable address attribute; uses the address pool wherever the
    /// unit may not carry relocations itself
    pub fn add_label_address(&mut self, die: DieRef, name: DwAt, label: Label) -> Result<()> {
        let unit = self.die_unit(die)?;
        let kind = self.unit(unit).kind;
        let split = self.options.use_split_dwarf();
        let version = self.options.version();

        if version < 5 && (!split || kind == UnitKind::Skeleton) {
            self.arange_labels.push((unit, label));
            self.arena
                .add(die, name, DW_FORM_addr, AttrValue::Address(label));
            return Ok(());
        }
        if self.unit(unit).skeleton.is_some() || !split {
            self.arange_labels.push((unit, label));
        }
        let index = self.addr_pool.index(label, false);
        let form = if version >= 5 {
            DW_FORM_addrx
        } else {
            DW_FORM_GNU_addr_index
        };
        self.arena.add(die, name, form, AttrValue::AddrIndex(index));
        Ok(())
    }

    pub fn attach_low_high_pc(&mut self, die: DieRef, begin: Label, end: Label) -> Result<()> {
        self.add_label_address(die, DW_AT_low_pc, begin)?;
        if self.options.version() < 4 {
            self.add_label_address(die, DW_AT_high_pc, end)
        } else {
            self.arena.add(
                die,
                DW_AT_high_pc,
                DW_FORM_data4,
                AttrValue::LabelDelta { hi: end, lo: begin },
            );
            Ok(())
        }
    }

    /// `low_pc`/`high_pc` for one range, a range list otherwise
    pub fn attach_ranges(&mut self, die: DieRef, ranges: Vec<RangeSpan>) -> Result<()> {
        let Some(first) = ranges.first().copied() else {
            return Ok(());
        };
        let single = ranges.len() == 1
            && (!self.options.always_use_ranges()
                || self.section_labels.values().any(|l| *l == first.begin));
        if single {
            return self.attach_low_high_pc(die, first.begin, first.end);
        }
        self.add_scope_range_list(die, ranges)
    }

    fn add_scope_range_list(&mut self, die: DieRef, ranges: Vec<RangeSpan>) -> Result<()> {
        let unit = self.die_unit(die)?;
        let skeleton = self.unit(unit).skeleton;
        let list_unit = skeleton.unwrap_or(unit);
        let label = self.labels.create();
        let holder = match skeleton {
            Some(skeleton) if self.options.version() < 5 => skeleton,
            _ => unit,
        };
        let index = self
            .file_of_mut(holder)
            .add_range_list(label, list_unit, ranges);
        if self.options.version() >= 5 {
            self.arena.add(
                die,
                DW_AT_ranges,
                DW_FORM_rnglistx,
                AttrValue::ListIndex(index as u32),
            );
        } else {
            let form = self.options.section_offset_form();
            self.arena
                .add(die, DW_AT_ranges, form, AttrValue::SecOffset(label));
        }
        Ok(())
    }

    /// Location list attribute for `die`
    pub fn add_loc_list(&mut self, die: DieRef, entries: Vec<LocEntry>) -> Result<()> {
        let unit = self.die_unit(die)?;
        let list_unit = self.skeleton_or_self(unit);
        let label = self.labels.create();
        let index = self.loc_stream.add_list(label, list_unit, entries);
        if self.options.version() >= 5 {
            self.arena.add(
                die,
                DW_AT_location,
                DW_FORM_loclistx,
                AttrValue::ListIndex(index as u32),
            );
        } else {
            let form = self.options.section_offset_form();
            self.arena
                .add(die, DW_AT_location, form, AttrValue::SecOffset(label));
        }
        Ok(())
    }

    pub fn add_block(&mut self, die: DieRef, name: DwAt, block: LocBlock) {
        self.arena.add_block(die, name, block);
    }

    /// Line-table file number of `file` as seen from `unit`
    pub fn file_number(&mut self, module: &DebugModule, unit: UnitId, file: FileId) -> Result<Option<u64>> {
        let kind = self.unit(unit).kind;
        if kind == UnitKind::SplitType {
            return Ok(None);
        }
        let Some(table) = self.unit(unit).line_table else {
            return Ok(None);
        };
        let entry = module.file(file)?;
        Ok(Some(self.line_tables[table].files.file_index(entry)))
    }

    /// `decl_file`/`decl_line` pair
    pub fn add_source_line(
        &mut self,
        module: &DebugModule,
        die: DieRef,
        file: Option<FileId>,
        line: u32,
    ) -> Result<()> {
        if line == 0 {
            return Ok(());
        }
        let Some(file) = file else {
            return Ok(());
        };
        let unit = self.die_unit(die)?;
        if let Some(number) = self.file_number(module, unit, file)? {
            self.arena.add_udata(die, DW_AT_decl_file, number);
        }
        self.arena.add_udata(die, DW_AT_decl_line, line as u64);
        Ok(())
    }

    fn accel_allowed(&self, module: &DebugModule, unit: UnitId) -> Result<bool> {
        let kind = self.unit(unit).kind;
        if kind.is_type() || self.options.accel_kind == AccelTableKind::None {
            return Ok(false);
        }
        let Some(cu) = self.unit(unit).source else {
            return Ok(false);
        };
        let table_kind = module.compile_unit(cu)?.name_table_kind;
        Ok(match self.options.accel_kind {
            AccelTableKind::Apple => {
                matches!(table_kind, NameTableKind::Default | NameTableKind::Apple)
            }
            _ => table_kind == NameTableKind::Default,
        })
    }

    pub fn add_accel_name(&mut self, module: &DebugModule, name: &str, die: DieRef) -> Result<()> {
        if name.is_empty() || !self.accel_allowed(module, self.die_unit(die)?)? {
            return Ok(());
        }
        self.accel.names.add(name, die);
        Ok(())
    }

    pub fn add_accel_type(&mut self, module: &DebugModule, name: &str, die: DieRef) -> Result<()> {
        if name.is_empty() || !self.accel_allowed(module, self.die_unit(die)?)? {
            return Ok(());
        }
        self.accel.types.add(name, die);
        Ok(())
    }

    pub fn add_accel_namespace(&mut self, module: &DebugModule, name: &str, die: DieRef) -> Result<()> {
        if name.is_empty() || !self.accel_allowed(module, self.die_unit(die)?)? {
            return Ok(());
        }
        self.accel.namespaces.add(name, die);
        Ok(())
    }

    /// Qualified name prefix of the namespaces enclosing `scope`
    pub fn parent_context_string(&self, module: &DebugModule, scope: Option<ScopeId>) -> Result<String> {
        let mut parts = Vec::new();
        let mut current = scope;
        while let Some(id) = current {
            let meta = module.scope(id)?;
            if let crate::core::ScopeKind::Namespace { name } = &meta.kind {
                parts.push(if name.is_empty() {
                    "(anonymous namespace)".to_string()
                } else {
                    name.clone()
                });
            }
            current = meta.parent;
        }
        let mut out = String::new();
        for part in parts.iter().rev() {
            out.push_str(part);
            out.push_str("::");
        }
        Ok(out)
    }

    pub fn add_global_name(
        &mut self,
        module: &DebugModule,
        unit: UnitId,
        name: &str,
        die: DieRef,
        context: Option<ScopeId>,
    ) -> Result<()> {
        if !self.has_dwarf_pub_sections(module, unit)? {
            return Ok(());
        }
        let full = format!("{}{}", self.parent_context_string(module, context)?, name);
        self.unit_mut(unit).global_names.insert(full, die);
        Ok(())
    }

    pub fn add_global_type(
        &mut self,
        module: &DebugModule,
        unit: UnitId,
        name: &str,
        die: DieRef,
        context: Option<ScopeId>,
    ) -> Result<()> {
        if !self.has_dwarf_pub_sections(module, unit)? {
            return Ok(());
        }
        let full = format!("{}{}", self.parent_context_string(module, context)?, name);
        self.unit_mut(unit).global_types.insert(full, die);
        Ok(())
    }

    /// Records a code range of a compile unit
    pub fn add_unit_range(&mut self, unit: UnitId, span: RangeSpan) {
        let ranges = &mut self.unit_mut(unit).ranges;
        if let Some(last) = ranges.last_mut() {
            if last.end == span.begin {
                last.end = span.end;
                return;
            }
        }
        ranges.push(span);
    }

    /// Adds the attributes that depend on the whole module: dwo ids, table
    /// bases, unit ranges and macro references
    pub fn finalize(&mut self, module: &DebugModule) -> Result<()> {
        let split = self.options.use_split_dwarf();
        let version = self.options.version();
        let compile_units: Vec<UnitId> = self.compile_units().map(|u| u.id).collect();

        for unit in compile_units {
            if self.is_suppressed(unit) {
                continue;
            }
            let skeleton = self.unit(unit).skeleton;
            let root = self.unit(unit).root;
            let has_split_unit = skeleton.is_some() && self.arena.get(root).has_children();
            let target = skeleton.unwrap_or(unit);
            let target_root = self.unit(target).root;

            if let Some(skeleton) = skeleton {
                if has_split_unit {
                    let dwo_name = self.options.split_dwarf_file.clone().unwrap_or_default();
                    let attr = if version >= 5 {
                        DW_AT_dwo_name
                    } else {
                        DW_AT_GNU_dwo_name
                    };
                    self.add_string(root, attr, &dwo_name)?;
                    let skeleton_root = self.unit(skeleton).root;
                    self.add_string(skeleton_root, attr, &dwo_name)?;

                    let id = unit_signature(&self.arena, root, &dwo_name);
                    if version >= 5 {
                        self.unit_mut(unit).signature = Some(id);
                        self.unit_mut(skeleton).signature = Some(id);
                    } else {
                        for die in [root, skeleton_root] {
                            self.arena.add(
                                die,
                                DW_AT_GNU_dwo_id,
                                DW_FORM_data8,
                                AttrValue::Udata(id),
                            );
                        }
                    }
                    debug!("Split unit {} has dwo id {:#018x}", unit.0, id);
                } else {
                    debug!("Split unit {} is empty, emitting the skeleton only", unit.0);
                    self.suppressed.push(unit);
                }
            }

            if !self.addr_pool.is_empty() && (version >= 5 || has_split_unit) {
                let attr = if version >= 5 {
                    DW_AT_addr_base
                } else {
                    DW_AT_GNU_addr_base
                };
                let form = self.options.section_offset_form();
                let base = self.addr_pool.base_label();
                self.arena
                    .add(target_root, attr, form, AttrValue::SecOffset(base));
            }

            let ranges = std::mem::take(&mut self.unit_mut(unit).ranges);
            if !ranges.is_empty() {
                if ranges.len() > 1 {
                    self.arena
                        .add(target_root, DW_AT_low_pc, DW_FORM_addr, AttrValue::Udata(0));
                } else {
                    let base = ranges[0].begin;
                    self.unit_mut(unit).base_address = Some(base);
                    self.unit_mut(target).base_address = Some(base);
                }
                self.unit_mut(unit).ranges = ranges.clone();
                if target != unit {
                    self.unit_mut(target).ranges = ranges.clone();
                }
                self.attach_ranges(target_root, ranges)?;
            }

            if version < 5 && has_split_unit && !self.skeletons.range_lists.is_empty() {
                let form = self.options.section_offset_form();
                let base = self.skeletons.rnglists_base;
                self.arena.add(
                    target_root,
                    DW_AT_GNU_ranges_base,
                    form,
                    AttrValue::SecOffset(base),
                );
            }

            if version >= 5 {
                if self.file_of(target).has_range_lists_of(target) {
                    let base = self.file_of(target).rnglists_base;
                    self.arena.add(
                        target_root,
                        DW_AT_rnglists_base,
                        DW_FORM_sec_offset,
                        AttrValue::SecOffset(base),
                    );
                }
                if !self.loc_stream.is_empty() && !split {
                    let base = self.loc_stream.base_label();
                    self.arena.add(
                        target_root,
                        DW_AT_loclists_base,
                        DW_FORM_sec_offset,
                        AttrValue::SecOffset(base),
                    );
                }
            }

            if let Some(label) = self.macro_labels.get(&unit).copied() {
                let attr = if self.options.use_debug_macro_section {
                    if version >= 5 {
                        DW_AT_macros
                    } else {
                        DW_AT_GNU_macros
                    }
                } else {
                    DW_AT_macro_info
                };
                let die = if split { root } else { target_root };
                let form = self.options.section_offset_form();
                self.arena.add(die, attr, form, AttrValue::SecOffset(label));
            }
        }
        info!(
            "Finalized {} units ({} entries, {} pooled addresses)",
            self.units.len(),
            self.arena.len(),
            self.addr_pool.len()
        );
        Ok(())
    }

    /// Entry tag helper used by serializers
    pub fn tag(&self, die: DieRef) -> DwTag {
        self.arena.get(die).tag
    }

    /// Absolute offset of an entry within its unit's section
    pub fn die_offset(&self, die: DieRef) -> Result<u64> {
        let unit = self.die_unit(die)?;
        Ok(self.unit(unit).offset + self.arena.get(die).offset)
    }

    /// Section the given unit's entries live in
    pub fn unit_section(&self, unit: UnitId) -> DebugSection {
        self.unit(unit).section(&self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CompileUnitMeta, EmitterConfig, FileEntry, GenericTarget};

    fn new_tree(options: EmitOptions) -> EntityTree {
        EntityTree::new(options, Arc::new(GenericTarget::x86_64()))
    }

    fn module() -> (DebugModule, CompileUnitId) {
        let mut module = DebugModule::new();
        let file = module.add_file(FileEntry::new("main.c", "/work"));
        let (cu, _) = module.add_compile_unit(CompileUnitMeta::new(file, DW_LANG_C99, "cc"));
        (module, cu)
    }

    #[test]
    fn test_compile_unit_is_memoized() {
        let (module, cu) = module();
        let options = EmitterConfig::default().resolve().unwrap();
        let mut tree = new_tree(options);
        let a = tree.get_or_create_compile_unit(&module, cu).unwrap();
        let b = tree.get_or_create_compile_unit(&module, cu).unwrap();
        assert_eq!(a, b);
        let root = tree.unit(a).root;
        assert!(tree.arena.has_attr(root, DW_AT_stmt_list));
        assert!(tree.arena.has_attr(root, DW_AT_comp_dir));
        assert_eq!(tree.arena.get(root).name(), Some("main.c"));
    }

    #[test]
    fn test_split_units_share_the_first_unit() {
        let (mut module, cu) = module();
        let file = module.add_file(FileEntry::new("other.c", "/work"));
        let (cu2, _) = module.add_compile_unit(CompileUnitMeta::new(file, DW_LANG_C99, "cc"));
        let config = EmitterConfig {
            split_dwarf_file: Some("out.dwo".to_string()),
            ..EmitterConfig::default()
        };
        let mut tree = new_tree(config.resolve().unwrap());
        let a = tree.get_or_create_compile_unit(&module, cu).unwrap();
        let b = tree.get_or_create_compile_unit(&module, cu2).unwrap();
        assert_eq!(a, b);
        let skeleton = tree.unit(a).skeleton.unwrap();
        assert_eq!(tree.unit(skeleton).kind, UnitKind::Skeleton);
        // Split units keep the line table reference on the skeleton only.
        assert!(!tree.arena.has_attr(tree.unit(a).root, DW_AT_stmt_list));
        assert!(tree.arena.has_attr(tree.unit(skeleton).root, DW_AT_stmt_list));
    }

    #[test]
    fn test_string_forms_follow_version() {
        let (module, cu) = module();
        let mut tree = new_tree(EmitterConfig::with_version(5).resolve().unwrap());
        let unit = tree.get_or_create_compile_unit(&module, cu).unwrap();
        let root = tree.unit(unit).root;
        assert_eq!(tree.arena.attr(root, DW_AT_name).unwrap().form, DW_FORM_strx1);

        let mut tree = new_tree(EmitterConfig::with_version(4).resolve().unwrap());
        let unit = tree.get_or_create_compile_unit(&module, cu).unwrap();
        let root = tree.unit(unit).root;
        assert_eq!(tree.arena.attr(root, DW_AT_name).unwrap().form, DW_FORM_strp);
    }

    #[test]
    fn test_single_range_uses_low_high_pc() {
        let (module, cu) = module();
        let mut tree = new_tree(EmitterConfig::with_version(4).resolve().unwrap());
        let unit = tree.get_or_create_compile_unit(&module, cu).unwrap();
        let root = tree.unit(unit).root;
        let sp = tree.arena.add_child(root, DW_TAG_subprogram);
        let (a, b, c, d) = (Label(900), Label(901), Label(902), Label(903));
        tree.attach_ranges(sp, vec![RangeSpan { begin: a, end: b }]).unwrap();
        assert_eq!(tree.arena.attr(sp, DW_AT_low_pc).unwrap().form, DW_FORM_addr);
        assert_eq!(tree.arena.attr(sp, DW_AT_high_pc).unwrap().form, DW_FORM_data4);

        let block = tree.arena.add_child(sp, DW_TAG_lexical_block);
        tree.attach_ranges(
            block,
            vec![RangeSpan { begin: a, end: b }, RangeSpan { begin: c, end: d }],
        )
        .unwrap();
        assert_eq!(
            tree.arena.attr(block, DW_AT_ranges).unwrap().form,
            DW_FORM_sec_offset
        );
        assert_eq!(tree.info.range_lists.len(), 1);
    }
}
