//! Upstream model: source-level debug metadata and machine functions
//!
//! The compiler pipeline hands the emitter a `DebugModule` describing every
//! source entity plus one `MachineFunction` per emitted function. All
//! cross-links are handles into the owning `DebugModule` vectors.

use crate::core::{
    BlockId, CompileUnitId, DebugLabelId, EmitError, Expression, FileId, GlobalVariableId,
    InlinedAtId, InstrId, Register, Result, ScopeId, SubprogramId, TypeId, VariableId,
};
use gimli::{DwAte, DwLang, DwTag};
use std::collections::HashMap;

/// Source file descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub directory: String,
    /// MD5 digest of the file contents
    pub checksum: Option<[u8; 16]>,
    /// Embedded source text
    pub source: Option<String>,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            checksum: None,
            source: None,
        }
    }
}

/// How much debug information a compile unit asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmissionKind {
    NoDebug,
    #[default]
    FullDebug,
    LineTablesOnly,
    /// Only line directives, no unit or entries
    DebugDirectivesOnly,
}

/// Public-name table request of a compile unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameTableKind {
    #[default]
    Default,
    Gnu,
    None,
    Apple,
}

/// Macro tree node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroNode {
    Define {
        line: u32,
        name: String,
        value: String,
    },
    Undef {
        line: u32,
        name: String,
    },
    File {
        line: u32,
        file: FileId,
        children: Vec<MacroNode>,
    },
}

/// Source-level compile unit
#[derive(Debug, Clone)]
pub struct CompileUnitMeta {
    pub file: FileId,
    pub language: DwLang,
    pub producer: String,
    pub optimized: bool,
    pub flags: String,
    pub runtime_version: u32,
    pub emission_kind: EmissionKind,
    /// Allow inlined subprograms to stay in the skeleton when split
    pub split_debug_inlining: bool,
    pub debug_info_for_profiling: bool,
    pub name_table_kind: NameTableKind,
    /// Use base address selection entries in pre-v5 range lists
    pub ranges_base_address: bool,
    pub sysroot: Option<String>,
    pub sdk: Option<String>,
    pub enums: Vec<TypeId>,
    pub retained_types: Vec<TypeId>,
    pub globals: Vec<GlobalVariableId>,
    pub macros: Vec<MacroNode>,
}

impl CompileUnitMeta {
    pub fn new(file: FileId, language: DwLang, producer: impl Into<String>) -> Self {
        Self {
            file,
            language,
            producer: producer.into(),
            optimized: false,
            flags: String::new(),
            runtime_version: 0,
            emission_kind: EmissionKind::FullDebug,
            split_debug_inlining: true,
            debug_info_for_profiling: false,
            name_table_kind: NameTableKind::Default,
            ranges_base_address: false,
            sysroot: None,
            sdk: None,
            enums: Vec::new(),
            retained_types: Vec::new(),
            globals: Vec::new(),
            macros: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeKind {
    CompileUnit(CompileUnitId),
    Subprogram(SubprogramId),
    LexicalBlock { line: u32, column: u32 },
    /// Same lexical block viewed through a different file or discriminator
    LexicalBlockFile { discriminator: u32 },
    Namespace { name: String },
}

#[derive(Debug, Clone)]
pub struct ScopeMeta {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    pub file: Option<FileId>,
}

#[derive(Debug, Clone, Default)]
pub struct SubprogramFlags {
    pub artificial: bool,
    pub prototyped: bool,
    pub noreturn: bool,
    /// Every call in the body is described by call-site entries
    pub all_calls_described: bool,
    pub external: bool,
    pub optimized: bool,
}

#[derive(Debug, Clone)]
pub struct SubprogramMeta {
    pub name: String,
    pub linkage_name: Option<String>,
    pub unit: CompileUnitId,
    /// The subprogram's own scope
    pub scope: ScopeId,
    /// Enclosing scope (compile unit, namespace)
    pub parent: ScopeId,
    pub file: Option<FileId>,
    pub line: u32,
    pub scope_line: u32,
    /// Subroutine type
    pub ty: Option<TypeId>,
    pub is_definition: bool,
    pub declaration: Option<SubprogramId>,
    pub flags: SubprogramFlags,
    /// Variables kept even if optimized away
    pub retained_nodes: Vec<VariableId>,
}

#[derive(Debug, Clone)]
pub struct LocalVariable {
    pub name: String,
    pub scope: ScopeId,
    pub file: Option<FileId>,
    pub line: u32,
    pub ty: Option<TypeId>,
    /// 1-based argument number for parameters
    pub arg: Option<u16>,
    pub artificial: bool,
}

impl LocalVariable {
    pub fn is_parameter(&self) -> bool {
        self.arg.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct DebugLabelMeta {
    pub name: String,
    pub scope: ScopeId,
    pub file: Option<FileId>,
    pub line: u32,
}

/// Call location an inlined instance was expanded at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinedAtLoc {
    pub line: u32,
    pub column: u32,
    pub scope: ScopeId,
    pub inlined_at: Option<InlinedAtId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateValue {
    Type,
    Int(i64),
    /// Address of a global symbol; needs the address pool
    Address(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateParam {
    pub name: String,
    pub ty: Option<TypeId>,
    pub value: TemplateValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Basic {
        encoding: DwAte,
    },
    /// Pointer, const, typedef, member and friends
    Derived {
        tag: DwTag,
        base: Option<TypeId>,
        offset_bits: u64,
    },
    Composite {
        tag: DwTag,
        /// Stable identity string (ODR name) used for type-unit dedup
        identifier: Option<String>,
        /// Element type of arrays, underlying type of enumerations
        base: Option<TypeId>,
        elements: Vec<TypeId>,
        template_params: Vec<TemplateParam>,
        declaration: bool,
    },
    /// First element is the return type
    Subroutine {
        types: Vec<Option<TypeId>>,
    },
    Enumerator {
        value: i64,
    },
    Subrange {
        count: Option<i64>,
    },
}

#[derive(Debug, Clone)]
pub struct TypeMeta {
    pub name: Option<String>,
    pub kind: TypeKind,
    pub scope: Option<ScopeId>,
    pub file: Option<FileId>,
    pub line: u32,
    pub size_bits: u64,
    pub align_bits: u32,
}

impl TypeMeta {
    pub fn basic(name: impl Into<String>, encoding: DwAte, size_bits: u64) -> Self {
        Self {
            name: Some(name.into()),
            kind: TypeKind::Basic { encoding },
            scope: None,
            file: None,
            line: 0,
            size_bits,
            align_bits: 0,
        }
    }

    pub fn identifier(&self) -> Option<&str> {
        match &self.kind {
            TypeKind::Composite { identifier, .. } => identifier.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GlobalVariableMeta {
    pub name: String,
    pub linkage_name: Option<String>,
    pub unit: CompileUnitId,
    pub scope: Option<ScopeId>,
    pub file: Option<FileId>,
    pub line: u32,
    pub ty: Option<TypeId>,
    pub is_local: bool,
    /// Object symbol holding the variable
    pub symbol: Option<String>,
    pub expr: Expression,
    pub tls: bool,
}

/// Whole-module source metadata
#[derive(Debug, Clone, Default)]
pub struct DebugModule {
    pub files: Vec<FileEntry>,
    pub compile_units: Vec<CompileUnitMeta>,
    pub scopes: Vec<ScopeMeta>,
    pub subprograms: Vec<SubprogramMeta>,
    pub variables: Vec<LocalVariable>,
    pub labels: Vec<DebugLabelMeta>,
    pub types: Vec<TypeMeta>,
    pub globals: Vec<GlobalVariableMeta>,
    pub inlined_at: Vec<InlinedAtLoc>,
}

macro_rules! module_accessor {
    ($get:ident, $field:ident, $id:ty, $out:ty, $what:literal) => {
        pub fn $get(&self, id: $id) -> Result<&$out> {
            self.$field.get(id.index()).ok_or_else(|| {
                EmitError::InvalidInput(format!("unknown {} handle {}", $what, id.0)).into()
            })
        }
    };
}

impl DebugModule {
    pub fn new() -> Self {
        Self::default()
    }

    module_accessor!(file, files, FileId, FileEntry, "file");
    module_accessor!(compile_unit, compile_units, CompileUnitId, CompileUnitMeta, "compile unit");
    module_accessor!(scope, scopes, ScopeId, ScopeMeta, "scope");
    module_accessor!(subprogram, subprograms, SubprogramId, SubprogramMeta, "subprogram");
    module_accessor!(variable, variables, VariableId, LocalVariable, "variable");
    module_accessor!(label, labels, DebugLabelId, DebugLabelMeta, "label");
    module_accessor!(ty, types, TypeId, TypeMeta, "type");
    module_accessor!(global, globals, GlobalVariableId, GlobalVariableMeta, "global variable");
    module_accessor!(inlined, inlined_at, InlinedAtId, InlinedAtLoc, "inlined-at location");

    pub fn add_file(&mut self, file: FileEntry) -> FileId {
        self.files.push(file);
        FileId(self.files.len() as u32 - 1)
    }

    /// Adds a compile unit and its root scope
    pub fn add_compile_unit(&mut self, unit: CompileUnitMeta) -> (CompileUnitId, ScopeId) {
        let file = unit.file;
        self.compile_units.push(unit);
        let id = CompileUnitId(self.compile_units.len() as u32 - 1);
        let scope = self.add_scope(ScopeMeta {
            kind: ScopeKind::CompileUnit(id),
            parent: None,
            file: Some(file),
        });
        (id, scope)
    }

    pub fn add_scope(&mut self, scope: ScopeMeta) -> ScopeId {
        self.scopes.push(scope);
        ScopeId(self.scopes.len() as u32 - 1)
    }

    /// Adds a subprogram together with its own scope; `scope` of the input
    /// is overwritten.
    pub fn add_subprogram(&mut self, mut subprogram: SubprogramMeta) -> SubprogramId {
        let id = SubprogramId(self.subprograms.len() as u32);
        subprogram.scope = self.add_scope(ScopeMeta {
            kind: ScopeKind::Subprogram(id),
            parent: Some(subprogram.parent),
            file: subprogram.file,
        });
        self.subprograms.push(subprogram);
        id
    }

    pub fn add_lexical_block(&mut self, parent: ScopeId, line: u32, column: u32) -> ScopeId {
        let file = self.scopes.get(parent.index()).and_then(|s| s.file);
        self.add_scope(ScopeMeta {
            kind: ScopeKind::LexicalBlock { line, column },
            parent: Some(parent),
            file,
        })
    }

    pub fn add_variable(&mut self, variable: LocalVariable) -> VariableId {
        self.variables.push(variable);
        VariableId(self.variables.len() as u32 - 1)
    }

    pub fn add_label(&mut self, label: DebugLabelMeta) -> DebugLabelId {
        self.labels.push(label);
        DebugLabelId(self.labels.len() as u32 - 1)
    }

    pub fn add_type(&mut self, ty: TypeMeta) -> TypeId {
        self.types.push(ty);
        TypeId(self.types.len() as u32 - 1)
    }

    pub fn add_global(&mut self, global: GlobalVariableMeta) -> GlobalVariableId {
        self.globals.push(global);
        GlobalVariableId(self.globals.len() as u32 - 1)
    }

    pub fn add_inlined_at(&mut self, loc: InlinedAtLoc) -> InlinedAtId {
        self.inlined_at.push(loc);
        InlinedAtId(self.inlined_at.len() as u32 - 1)
    }

    /// Skips lexical-block-file wrappers, which never get their own scope
    pub fn non_file_scope(&self, mut scope: ScopeId) -> Result<ScopeId> {
        loop {
            let meta = self.scope(scope)?;
            match (&meta.kind, meta.parent) {
                (ScopeKind::LexicalBlockFile { .. }, Some(parent)) => scope = parent,
                _ => return Ok(scope),
            }
        }
    }

    /// Subprogram enclosing a local scope
    pub fn enclosing_subprogram(&self, mut scope: ScopeId) -> Result<Option<SubprogramId>> {
        loop {
            let meta = self.scope(scope)?;
            match meta.kind {
                ScopeKind::Subprogram(sp) => return Ok(Some(sp)),
                ScopeKind::CompileUnit(_) => return Ok(None),
                _ => match meta.parent {
                    Some(parent) => scope = parent,
                    None => return Ok(None),
                },
            }
        }
    }

    /// File a scope belongs to, walking outwards if needed
    pub fn scope_file(&self, mut scope: ScopeId) -> Result<Option<FileId>> {
        loop {
            let meta = self.scope(scope)?;
            if meta.file.is_some() {
                return Ok(meta.file);
            }
            match meta.parent {
                Some(parent) => scope = parent,
                None => return Ok(None),
            }
        }
    }
}

/// Operand of a debug-value instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DbgOperand {
    Register(Register),
    Immediate(i64),
    /// Raw bits and byte width of a floating-point constant
    FloatImm { bits: u64, bytes: u8 },
    TargetIndex { index: i32, offset: i64 },
    ConstantInt(i64),
    Undef,
}

/// "Variable now has this value" marker
#[derive(Debug, Clone, PartialEq)]
pub struct DbgValue {
    pub variable: VariableId,
    pub inlined_at: Option<InlinedAtId>,
    pub expr: Expression,
    pub operands: Vec<DbgOperand>,
    /// Location is the memory the first register points at
    pub indirect: bool,
    /// Operands are referenced through `DW_OP_LLVM_arg`
    pub variadic: bool,
}

impl DbgValue {
    pub fn new(variable: VariableId, operand: DbgOperand) -> Self {
        Self {
            variable,
            inlined_at: None,
            expr: Expression::new(),
            operands: vec![operand],
            indirect: false,
            variadic: false,
        }
    }

    pub fn is_undef(&self) -> bool {
        self.operands.is_empty() || self.operands.iter().any(|op| *op == DbgOperand::Undef)
    }

    pub fn registers(&self) -> impl Iterator<Item = Register> + '_ {
        self.operands.iter().filter_map(|op| match op {
            DbgOperand::Register(reg) => Some(*reg),
            _ => None,
        })
    }

    pub fn is_register_described(&self) -> bool {
        self.registers().next().is_some()
    }

    /// Only immediates, no registers
    pub fn is_constant(&self) -> bool {
        !self.operands.is_empty()
            && self.operands.iter().all(|op| {
                matches!(
                    op,
                    DbgOperand::Immediate(_)
                        | DbgOperand::FloatImm { .. }
                        | DbgOperand::ConstantInt(_)
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstrKind {
    Regular,
    DebugValue(DbgValue),
    DebugLabel(DebugLabelId),
    /// Emits no code (CFI, kill markers)
    Meta,
}

/// Source position attached to an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugLoc {
    pub line: u32,
    pub column: u32,
    pub scope: ScopeId,
    pub inlined_at: Option<InlinedAtId>,
    /// Key-instruction group; 0 means ungrouped
    pub atom_group: u64,
    pub atom_rank: u8,
}

impl DebugLoc {
    pub fn new(line: u32, column: u32, scope: ScopeId) -> Self {
        Self {
            line,
            column,
            scope,
            inlined_at: None,
            atom_group: 0,
            atom_rank: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstrFlags {
    pub frame_setup: bool,
    pub frame_destroy: bool,
    pub call: bool,
    pub tail_call: bool,
    pub has_delay_slot: bool,
    pub terminator: bool,
    pub branch: bool,
    pub copy: bool,
    /// Cheap to recompute, e.g. constant materialization
    pub rematerializable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    Function(SubprogramId),
    /// Indirect call through a register
    Register(Register),
}

/// Value an instruction places into a register, as reported to the
/// call-site analysis oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedValue {
    Immediate(i64),
    Register(Register),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamLoadedValue {
    pub value: LoadedValue,
    pub expr: Expression,
}

/// Data-driven description of what a simple move-like instruction loads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueDescription {
    pub dest: Register,
    pub value: LoadedValue,
    /// Added to the source register value
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineInstr {
    pub kind: InstrKind,
    pub loc: Option<DebugLoc>,
    pub flags: InstrFlags,
    /// Encoded size in bytes
    pub size: u32,
    pub defs: Vec<Register>,
    pub callee: Option<Callee>,
    pub describes: Option<ValueDescription>,
    pub block: BlockId,
}

impl MachineInstr {
    pub fn regular(size: u32, loc: Option<DebugLoc>) -> Self {
        Self {
            kind: InstrKind::Regular,
            loc,
            flags: InstrFlags::default(),
            size,
            defs: Vec::new(),
            callee: None,
            describes: None,
            block: BlockId(0),
        }
    }

    pub fn debug_value(value: DbgValue, loc: Option<DebugLoc>) -> Self {
        Self {
            kind: InstrKind::DebugValue(value),
            size: 0,
            ..Self::regular(0, loc)
        }
    }

    pub fn debug_label(label: DebugLabelId, loc: Option<DebugLoc>) -> Self {
        Self {
            kind: InstrKind::DebugLabel(label),
            ..Self::regular(0, loc)
        }
    }

    pub fn call(size: u32, loc: Option<DebugLoc>, callee: Callee) -> Self {
        Self {
            flags: InstrFlags {
                call: true,
                ..InstrFlags::default()
            },
            callee: Some(callee),
            ..Self::regular(size, loc)
        }
    }

    /// Produces no bytes in the output
    pub fn is_meta(&self) -> bool {
        !matches!(self.kind, InstrKind::Regular)
    }

    pub fn is_call(&self) -> bool {
        self.flags.call || self.flags.tail_call
    }

    pub fn debug_value_ref(&self) -> Option<&DbgValue> {
        match &self.kind {
            InstrKind::DebugValue(value) => Some(value),
            _ => None,
        }
    }

    pub fn defines(&self, reg: Register) -> bool {
        self.defs.contains(&reg)
    }
}

/// Outcome of branch analysis on a block terminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchInfo {
    /// Target when the (conditional) branch is taken
    pub taken: BlockId,
    /// Explicit second target of a two-way branch; `None` falls through
    pub otherwise: Option<BlockId>,
    pub conditional: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineBlock {
    pub first: u32,
    pub end: u32,
    pub succs: Vec<BlockId>,
    pub preds: Vec<BlockId>,
    /// Basic-block section the block is placed in; 0 is the function's
    /// primary section
    pub section: u32,
    /// Required alignment in bytes, 0 or 1 for none
    pub alignment: u32,
    /// `None` when the terminator could not be analyzed
    pub branch: Option<BranchInfo>,
    pub analyzable: bool,
}

impl MachineBlock {
    pub fn instrs(&self) -> impl DoubleEndedIterator<Item = InstrId> {
        (self.first..self.end).map(InstrId)
    }

    pub fn is_empty(&self) -> bool {
        self.first == self.end
    }

    pub fn last(&self) -> Option<InstrId> {
        if self.is_empty() {
            None
        } else {
            Some(InstrId(self.end - 1))
        }
    }
}

/// Forwarding register for one call argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardedArg {
    pub register: Register,
    pub arg_no: u16,
}

/// Variable living in a frame slot for the whole function
#[derive(Debug, Clone, PartialEq)]
pub struct StackSlotVar {
    pub variable: VariableId,
    pub inlined_at: Option<InlinedAtId>,
    pub expr: Expression,
    pub frame_reg: Register,
    pub offset: i64,
}

/// Variable whose value is its register's value at function entry
#[derive(Debug, Clone, PartialEq)]
pub struct EntryValueVar {
    pub variable: VariableId,
    pub inlined_at: Option<InlinedAtId>,
    pub expr: Expression,
    pub register: Register,
}

/// One function's machine code in layout order
#[derive(Debug, Clone, Default)]
pub struct MachineFunction {
    pub name: String,
    pub subprogram: Option<SubprogramId>,
    pub blocks: Vec<MachineBlock>,
    pub instrs: Vec<MachineInstr>,
    pub call_site_args: HashMap<InstrId, Vec<ForwardedArg>>,
    pub stack_slot_vars: Vec<StackSlotVar>,
    pub entry_value_vars: Vec<EntryValueVar>,
    /// Function symbol, if different from `name`
    pub symbol: Option<String>,
}

impl MachineFunction {
    pub fn new(name: impl Into<String>, subprogram: Option<SubprogramId>) -> Self {
        Self {
            name: name.into(),
            subprogram,
            ..Self::default()
        }
    }

    /// Appends a block in layout order
    pub fn add_block(&mut self, section: u32) -> BlockId {
        let start = self.instrs.len() as u32;
        self.blocks.push(MachineBlock {
            first: start,
            end: start,
            succs: Vec::new(),
            preds: Vec::new(),
            section,
            alignment: 0,
            branch: None,
            analyzable: true,
        });
        BlockId(self.blocks.len() as u32 - 1)
    }

    /// Appends an instruction to the last block
    pub fn push(&mut self, mut instr: MachineInstr) -> Result<InstrId> {
        let block_idx = self.blocks.len().checked_sub(1).ok_or_else(|| {
            EmitError::InvalidInput(format!("function {} has no block to append to", self.name))
        })?;
        let id = InstrId(self.instrs.len() as u32);
        instr.block = BlockId(block_idx as u32);
        self.instrs.push(instr);
        self.blocks[block_idx].end = id.0 + 1;
        Ok(id)
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        if let Some(block) = self.blocks.get_mut(from.index()) {
            if !block.succs.contains(&to) {
                block.succs.push(to);
            }
        }
        if let Some(block) = self.blocks.get_mut(to.index()) {
            if !block.preds.contains(&from) {
                block.preds.push(from);
            }
        }
    }

    pub fn instr(&self, id: InstrId) -> &MachineInstr {
        &self.instrs[id.index()]
    }

    pub fn block(&self, id: BlockId) -> &MachineBlock {
        &self.blocks[id.index()]
    }

    pub fn block_of(&self, id: InstrId) -> BlockId {
        self.instrs[id.index()].block
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        if self.blocks.is_empty() {
            None
        } else {
            Some(BlockId(0))
        }
    }

    /// Basic-block section of the first block
    pub fn primary_section(&self) -> u32 {
        self.blocks.first().map(|b| b.section).unwrap_or(0)
    }

    /// Last block (in layout order) of every section the function uses
    pub fn section_last_blocks(&self) -> Vec<(u32, BlockId)> {
        let mut out: Vec<(u32, BlockId)> = Vec::new();
        for (idx, block) in self.blocks.iter().enumerate() {
            match out.iter_mut().find(|(section, _)| *section == block.section) {
                Some(entry) => entry.1 = BlockId(idx as u32),
                None => out.push((block.section, BlockId(idx as u32))),
            }
        }
        out
    }

    pub fn instr_ids(&self) -> impl DoubleEndedIterator<Item = InstrId> {
        (0..self.instrs.len() as u32).map(InstrId)
    }

    /// Instructions of a block that produce code
    pub fn real_instrs(&self, block: BlockId) -> impl DoubleEndedIterator<Item = InstrId> + '_ {
        self.block(block)
            .instrs()
            .filter(move |id| !self.instr(*id).is_meta())
    }

    /// Validates block ranges and edge symmetry
    pub fn verify(&self) -> Result<()> {
        let mut expected = 0u32;
        for (idx, block) in self.blocks.iter().enumerate() {
            if block.first != expected || block.end < block.first {
                return Err(EmitError::InvalidInput(format!(
                    "block {} of {} is not contiguous in layout order",
                    idx, self.name
                ))
                .into());
            }
            expected = block.end;
            for succ in &block.succs {
                let ok = self
                    .blocks
                    .get(succ.index())
                    .map(|b| b.preds.contains(&BlockId(idx as u32)))
                    .unwrap_or(false);
                if !ok {
                    return Err(EmitError::InvalidInput(format!(
                        "edge {} -> {} of {} has no matching predecessor",
                        idx, succ.0, self.name
                    ))
                    .into());
                }
            }
        }
        if expected as usize != self.instrs.len() {
            return Err(EmitError::InvalidInput(format!(
                "{} instructions of {} are outside any block",
                self.instrs.len() - expected as usize,
                self.name
            ))
            .into());
        }
        Ok(())
    }
}

/// Target oracle the emitter consults for register semantics
pub trait TargetInfo {
    /// What `instr` loads into `reg`, if describable
    fn describe_loaded_value(
        &self,
        func: &MachineFunction,
        instr: InstrId,
        reg: Register,
    ) -> Option<ParamLoadedValue>;

    fn regs_overlap(&self, a: Register, b: Register) -> bool {
        a == b
    }

    fn is_callee_saved(&self, reg: Register) -> bool;

    fn stack_pointer(&self) -> Register;

    fn frame_register(&self, func: &MachineFunction) -> Register;

    /// DWARF register number
    fn dwarf_register(&self, reg: Register) -> Option<u16>;

    fn is_call_clobbered(&self, reg: Register) -> bool {
        !self.is_callee_saved(reg)
    }
}

/// Table-driven target: identity DWARF numbering, a callee-saved set and
/// loaded values taken from `MachineInstr::describes`
#[derive(Debug, Clone)]
pub struct GenericTarget {
    pub callee_saved: Vec<Register>,
    pub stack_pointer: Register,
    pub frame_pointer: Register,
    pub has_frame_pointer: bool,
}

impl GenericTarget {
    /// x86-64 SysV numbering (DWARF numbers used as register ids)
    pub fn x86_64() -> Self {
        Self {
            // rbx, rbp, r12-r15
            callee_saved: [3, 6, 12, 13, 14, 15].into_iter().map(Register).collect(),
            stack_pointer: Register(7),
            frame_pointer: Register(6),
            has_frame_pointer: true,
        }
    }
}

impl TargetInfo for GenericTarget {
    fn describe_loaded_value(
        &self,
        func: &MachineFunction,
        instr: InstrId,
        reg: Register,
    ) -> Option<ParamLoadedValue> {
        let desc = func.instrs.get(instr.index())?.describes?;
        if desc.dest != reg {
            return None;
        }
        let mut expr = Expression::new();
        if desc.offset != 0 {
            if let LoadedValue::Register(_) = desc.value {
                expr = expr.with_offset(desc.offset);
            }
        }
        Some(ParamLoadedValue {
            value: desc.value,
            expr,
        })
    }

    fn is_callee_saved(&self, reg: Register) -> bool {
        self.callee_saved.contains(&reg)
    }

    fn stack_pointer(&self) -> Register {
        self.stack_pointer
    }

    fn frame_register(&self, _func: &MachineFunction) -> Register {
        if self.has_frame_pointer {
            self.frame_pointer
        } else {
            self.stack_pointer
        }
    }

    fn dwarf_register(&self, reg: Register) -> Option<u16> {
        Some(reg.0)
    }

    fn is_call_clobbered(&self, reg: Register) -> bool {
        !self.is_callee_saved(reg) && reg != self.stack_pointer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gimli::constants::*;

    #[test]
    fn test_scope_walks() {
        let mut module = DebugModule::new();
        let file = module.add_file(FileEntry::new("a.c", "/src"));
        let (cu, cu_scope) =
            module.add_compile_unit(CompileUnitMeta::new(file, DW_LANG_C99, "test"));
        let sp = module.add_subprogram(SubprogramMeta {
            name: "main".to_string(),
            linkage_name: None,
            unit: cu,
            scope: ScopeId(0),
            parent: cu_scope,
            file: Some(file),
            line: 1,
            scope_line: 1,
            ty: None,
            is_definition: true,
            declaration: None,
            flags: SubprogramFlags::default(),
            retained_nodes: Vec::new(),
        });
        let sp_scope = module.subprogram(sp).unwrap().scope;
        let block = module.add_lexical_block(sp_scope, 3, 1);
        let file_block = module.add_scope(ScopeMeta {
            kind: ScopeKind::LexicalBlockFile { discriminator: 2 },
            parent: Some(block),
            file: None,
        });

        assert_eq!(module.non_file_scope(file_block).unwrap(), block);
        assert_eq!(module.enclosing_subprogram(file_block).unwrap(), Some(sp));
        assert_eq!(module.enclosing_subprogram(cu_scope).unwrap(), None);
        assert_eq!(module.scope_file(file_block).unwrap(), Some(file));
        assert!(module.variable(VariableId(9)).is_err());
    }

    #[test]
    fn test_function_layout_helpers() {
        let mut func = MachineFunction::new("f", None);
        let b0 = func.add_block(0);
        func.push(MachineInstr::regular(4, None)).unwrap();
        let b1 = func.add_block(1);
        func.push(MachineInstr::regular(2, None)).unwrap();
        let b2 = func.add_block(0);
        func.push(MachineInstr::regular(2, None)).unwrap();
        func.add_edge(b0, b1);
        func.add_edge(b1, b2);
        func.verify().unwrap();

        assert_eq!(func.block_of(InstrId(1)), b1);
        assert_eq!(func.section_last_blocks(), vec![(0, b2), (1, b1)]);
    }

    #[test]
    fn test_generic_target_describes_moves() {
        let target = GenericTarget::x86_64();
        let mut func = MachineFunction::new("f", None);
        func.add_block(0);
        let mut mov = MachineInstr::regular(3, None);
        mov.defs.push(Register(5));
        mov.describes = Some(ValueDescription {
            dest: Register(5),
            value: LoadedValue::Immediate(42),
            offset: 0,
        });
        let id = func.push(mov).unwrap();

        let value = target.describe_loaded_value(&func, id, Register(5)).unwrap();
        assert_eq!(value.value, LoadedValue::Immediate(42));
        assert!(target.describe_loaded_value(&func, id, Register(4)).is_none());
        assert!(target.is_callee_saved(Register(3)));
        assert!(!target.is_call_clobbered(Register(7)));
    }
}
