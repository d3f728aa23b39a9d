//! `.debug_macro` (v5 and the GNU v4 extension) and `.debug_macinfo`
//!
//! Must run before the string offsets header is written: v5 macro strings
//! are interned as indexed entries of the unit file's pool.

use crate::core::{DebugModule, DebugSection, MacroNode, Result, SectionId, UnitId};
use crate::dwarf::tree::EntityTree;
use crate::emit::sink::DebugSink;
use tracing::debug;

const MACRO_FLAG_OFFSET_SIZE: u8 = 1;
const MACRO_FLAG_DEBUG_LINE_OFFSET: u8 = 2;

const DW_MACRO_START_FILE: u8 = 0x03;
const DW_MACRO_END_FILE: u8 = 0x04;
/// GNU `define_indirect`/`undef_indirect` share the v5 strp codes
const DW_MACRO_DEFINE_STRP: u8 = 0x05;
const DW_MACRO_UNDEF_STRP: u8 = 0x06;
const DW_MACRO_DEFINE_STRX: u8 = 0x0b;
const DW_MACRO_UNDEF_STRX: u8 = 0x0c;

const DW_MACINFO_DEFINE: u8 = 0x01;
const DW_MACINFO_UNDEF: u8 = 0x02;
const DW_MACINFO_START_FILE: u8 = 0x03;
const DW_MACINFO_END_FILE: u8 = 0x04;

/// Text of a define or undef entry: name, then a space and the value if any
pub fn macro_string(name: &str, value: &str) -> String {
    if value.is_empty() {
        name.to_string()
    } else {
        format!("{} {}", name, value)
    }
}

impl EntityTree {
    fn macro_section(&self) -> DebugSection {
        match (self.options.use_debug_macro_section, self.options.use_split_dwarf()) {
            (true, true) => DebugSection::MacroDwo,
            (true, false) => DebugSection::Macro,
            (false, true) => DebugSection::MacinfoDwo,
            (false, false) => DebugSection::Macinfo,
        }
    }

    /// Macro contributions of every compile unit with a macro tree
    pub fn emit_macros(&mut self, module: &DebugModule, sink: &mut dyn DebugSink) -> Result<()> {
        let mut units: Vec<(UnitId, _)> = self
            .macro_labels
            .iter()
            .map(|(unit, label)| (*unit, *label))
            .collect();
        units.sort_by_key(|(unit, _)| *unit);
        let section = self.macro_section();

        for (unit, label) in units {
            let Some(cu) = self.unit(unit).source else {
                continue;
            };
            let macros = &module.compile_unit(cu)?.macros;
            if macros.is_empty() {
                continue;
            }
            sink.switch_section(SectionId::Debug(section));
            sink.bind_label(label)?;
            if self.options.use_debug_macro_section {
                self.emit_macro_header(sink, unit)?;
            }
            self.emit_macro_nodes(module, sink, unit, macros)?;
            sink.emit_u8(0)?;
            debug!("Emitted macros of unit {} into {}", unit.0, section.name());
        }
        Ok(())
    }

    fn emit_macro_header(&self, sink: &mut dyn DebugSink, unit: UnitId) -> Result<()> {
        let version = if self.options.version() >= 5 { 5 } else { 4 };
        sink.emit_u16(version)?;
        let mut flags = MACRO_FLAG_DEBUG_LINE_OFFSET;
        if self.options.is_dwarf64() {
            flags |= MACRO_FLAG_OFFSET_SIZE;
        }
        sink.emit_u8(flags)?;
        let offset_size = self.options.offset_size();
        let line_label = self
            .unit(self.skeleton_or_self(unit))
            .line_table
            .map(|idx| self.line_tables[idx].label);
        match line_label {
            Some(label) if !self.options.use_split_dwarf() => {
                sink.emit_section_offset(label, offset_size)
            }
            _ => sink.emit_int(0, offset_size),
        }
    }

    fn emit_macro_nodes(
        &mut self,
        module: &DebugModule,
        sink: &mut dyn DebugSink,
        unit: UnitId,
        nodes: &[MacroNode],
    ) -> Result<()> {
        let macro_section = self.options.use_debug_macro_section;
        for node in nodes {
            match node {
                MacroNode::Define { line, name, value } => {
                    let text = macro_string(name, value);
                    self.emit_macro_entry(sink, unit, true, *line, &text)?;
                }
                MacroNode::Undef { line, name } => {
                    self.emit_macro_entry(sink, unit, false, *line, name)?;
                }
                MacroNode::File {
                    line,
                    file,
                    children,
                } => {
                    let (start, end) = if macro_section {
                        (DW_MACRO_START_FILE, DW_MACRO_END_FILE)
                    } else {
                        (DW_MACINFO_START_FILE, DW_MACINFO_END_FILE)
                    };
                    let number = self
                        .file_number(module, self.skeleton_or_self(unit), *file)?
                        .unwrap_or(0);
                    sink.emit_uleb128(start as u64)?;
                    sink.emit_uleb128(*line as u64)?;
                    sink.emit_uleb128(number)?;
                    self.emit_macro_nodes(module, sink, unit, children)?;
                    sink.emit_uleb128(end as u64)?;
                }
            }
        }
        Ok(())
    }

    fn emit_macro_entry(
        &mut self,
        sink: &mut dyn DebugSink,
        unit: UnitId,
        define: bool,
        line: u32,
        text: &str,
    ) -> Result<()> {
        if !self.options.use_debug_macro_section {
            let kind = if define { DW_MACINFO_DEFINE } else { DW_MACINFO_UNDEF };
            sink.emit_uleb128(kind as u64)?;
            sink.emit_uleb128(line as u64)?;
            return sink.emit_cstr(text);
        }
        if self.options.version() >= 5 {
            let kind = if define { DW_MACRO_DEFINE_STRX } else { DW_MACRO_UNDEF_STRX };
            let index = self.file_of_mut(unit).strings.indexed_entry(text).index.unwrap_or(0);
            sink.emit_uleb128(kind as u64)?;
            sink.emit_uleb128(line as u64)?;
            return sink.emit_uleb128(index as u64);
        }
        let kind = if define { DW_MACRO_DEFINE_STRP } else { DW_MACRO_UNDEF_STRP };
        sink.emit_uleb128(kind as u64)?;
        sink.emit_uleb128(line as u64)?;
        let offset_size = self.options.offset_size();
        let dwo = self.unit(unit).kind.is_dwo();
        let strings = &mut self.file_of_mut(unit).strings;
        let offset = strings.entry(text).offset;
        let section = strings.str_section();
        if dwo {
            sink.emit_int(offset, offset_size)
        } else {
            sink.emit_section_relative(SectionId::Debug(section), offset, offset_size)
        }
    }
}
