//! `.debug_line`: per-unit file tables and the line-number program

use crate::analysis::LineFlags;
use crate::core::{DebugSection, EmitOptions, Label, Result, SectionId, UnitId};
use crate::data::{LabelAllocator, LineFileTable};
use crate::emit::sink::DebugSink;
use crate::emit::unit_length::UnitLength;
use gimli::constants::*;
use gimli::DwLnct;
use std::collections::BTreeMap;
use tracing::{debug, trace};

const MIN_INST_LENGTH: u8 = 1;
const DEFAULT_IS_STMT: bool = true;
const LINE_BASE: i8 = -5;
const LINE_RANGE: u8 = 14;
const OPCODE_BASE: u8 = 13;
const STANDARD_OPCODE_LENGTHS: [u8; 12] = [0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1];
const DW_LNCT_LLVM_SOURCE: DwLnct = DwLnct(0x2001);

/// One row of the line matrix, positioned at `label`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRow {
    pub label: Label,
    pub file: u64,
    pub line: u32,
    pub column: u32,
    pub discriminator: u32,
    pub flags: LineFlags,
}

/// Line table of one compile unit; one sequence per code section
#[derive(Debug)]
pub struct LineTable {
    pub files: LineFileTable,
    /// Bound at the start of the table's contribution
    pub label: Label,
    pub unit: UnitId,
    sequences: BTreeMap<u32, Vec<Sequence>>,
}

/// Rows of one sequence; `end` is set when the sequence was terminated
/// before the end of its section
#[derive(Debug, Default)]
struct Sequence {
    rows: Vec<LineRow>,
    end: Option<Label>,
}

struct Registers {
    file: u64,
    line: i64,
    column: u32,
    is_stmt: bool,
    address: Label,
}

impl LineTable {
    pub fn new(files: LineFileTable, label: Label, unit: UnitId) -> Self {
        Self {
            files,
            label,
            unit,
            sequences: BTreeMap::new(),
        }
    }

    pub fn add_row(&mut self, section: u32, row: LineRow) {
        trace!(
            "Line row {}:{}:{} at {} in section {}",
            row.file,
            row.line,
            row.column,
            row.label,
            section
        );
        let sequences = self.sequences.entry(section).or_default();
        if sequences.last().is_none_or(|seq| seq.end.is_some()) {
            sequences.push(Sequence::default());
        }
        if let Some(seq) = sequences.last_mut() {
            seq.rows.push(row);
        }
    }

    /// Ends the open sequence of `section` at `label`; the next row starts
    /// a new one
    pub fn add_end_entry(&mut self, section: u32, label: Label) {
        let Some(seq) = self.sequences.get_mut(&section).and_then(|s| s.last_mut()) else {
            return;
        };
        if seq.end.is_none() && !seq.rows.is_empty() {
            trace!("Line sequence of section {} ends at {}", section, label);
            seq.end = Some(label);
        }
    }

    pub fn rows(&self, section: u32) -> impl Iterator<Item = &LineRow> {
        self.sequences
            .get(&section)
            .into_iter()
            .flatten()
            .flat_map(|seq| seq.rows.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.sequences
            .values()
            .flatten()
            .all(|seq| seq.rows.is_empty())
    }

    /// Writes the table. Each sequence ends at the end label of its section.
    pub fn emit(
        &self,
        sink: &mut dyn DebugSink,
        options: &EmitOptions,
        alloc: &mut LabelAllocator,
        section_ends: &BTreeMap<u32, Label>,
    ) -> Result<()> {
        sink.switch_section(SectionId::Debug(DebugSection::Line));
        sink.bind_label(self.label)?;
        let length = UnitLength::new(alloc);
        length.emit_start(sink, options)?;
        let version = options.version();
        sink.emit_u16(version)?;
        if version >= 5 {
            sink.emit_u8(options.address_size())?;
            // segment selector size
            sink.emit_u8(0)?;
        }
        let header = UnitLength::new(alloc);
        sink.emit_label_difference(header.end, header.start, options.offset_size())?;
        sink.bind_label(header.start)?;
        sink.emit_u8(MIN_INST_LENGTH)?;
        if version >= 4 {
            // maximum operations per instruction
            sink.emit_u8(1)?;
        }
        sink.emit_u8(DEFAULT_IS_STMT as u8)?;
        sink.emit_u8(LINE_BASE as u8)?;
        sink.emit_u8(LINE_RANGE)?;
        sink.emit_u8(OPCODE_BASE)?;
        sink.emit_bytes(&STANDARD_OPCODE_LENGTHS)?;
        if version >= 5 {
            self.emit_v5_file_tables(sink)?;
        } else {
            self.emit_legacy_file_tables(sink)?;
        }
        header.emit_end(sink)?;

        for (section, sequences) in &self.sequences {
            for seq in sequences.iter().filter(|seq| !seq.rows.is_empty()) {
                let end = seq.end.or_else(|| section_ends.get(section).copied());
                self.emit_sequence(sink, options, &seq.rows, end)?;
            }
        }
        length.emit_end(sink)?;
        debug!(
            "Emitted line table for unit {} ({} files, {} sequences)",
            self.unit.0,
            self.files.files().len(),
            self.sequences.len()
        );
        Ok(())
    }

    fn emit_v5_file_tables(&self, sink: &mut dyn DebugSink) -> Result<()> {
        sink.emit_u8(1)?;
        sink.emit_uleb128(DW_LNCT_path.0 as u64)?;
        sink.emit_uleb128(DW_FORM_string.0 as u64)?;
        let directories = self.files.directories();
        sink.emit_uleb128(directories.len() as u64)?;
        for dir in directories {
            sink.emit_cstr(dir)?;
        }

        let md5 = self.files.has_all_md5();
        let source = self.files.has_source();
        let format_count = 2 + md5 as u8 + source as u8;
        sink.emit_u8(format_count)?;
        sink.emit_uleb128(DW_LNCT_path.0 as u64)?;
        sink.emit_uleb128(DW_FORM_string.0 as u64)?;
        sink.emit_uleb128(DW_LNCT_directory_index.0 as u64)?;
        sink.emit_uleb128(DW_FORM_udata.0 as u64)?;
        if md5 {
            sink.emit_uleb128(DW_LNCT_MD5.0 as u64)?;
            sink.emit_uleb128(DW_FORM_data16.0 as u64)?;
        }
        if source {
            sink.emit_uleb128(DW_LNCT_LLVM_SOURCE.0 as u64)?;
            sink.emit_uleb128(DW_FORM_string.0 as u64)?;
        }
        let files = self.files.files();
        sink.emit_uleb128(files.len() as u64)?;
        for file in files {
            sink.emit_cstr(&file.filename)?;
            sink.emit_uleb128(file.directory_index)?;
            if md5 {
                sink.emit_bytes(&file.checksum.unwrap_or_default())?;
            }
            if source {
                sink.emit_cstr(file.source.as_deref().unwrap_or(""))?;
            }
        }
        Ok(())
    }

    fn emit_legacy_file_tables(&self, sink: &mut dyn DebugSink) -> Result<()> {
        for dir in self.files.directories() {
            sink.emit_cstr(dir)?;
        }
        sink.emit_u8(0)?;
        for file in self.files.files() {
            sink.emit_cstr(&file.filename)?;
            sink.emit_uleb128(file.directory_index)?;
            // modification time and length
            sink.emit_uleb128(0)?;
            sink.emit_uleb128(0)?;
        }
        sink.emit_u8(0)
    }

    fn emit_set_address(sink: &mut dyn DebugSink, options: &EmitOptions, label: Label) -> Result<()> {
        sink.emit_u8(0)?;
        sink.emit_uleb128(1 + options.address_size() as u64)?;
        sink.emit_u8(DW_LNE_set_address.0)?;
        sink.emit_label_address(label, options.address_size())
    }

    /// Moves the address register to `to`, returning the advance when it is
    /// known now so the caller can fold it into a special opcode
    fn advance_address(sink: &mut dyn DebugSink, from: Label, to: Label) -> Result<Option<u64>> {
        if let Some(delta) = sink.resolved_difference(to, from) {
            return Ok(Some(delta));
        }
        sink.emit_u8(DW_LNS_advance_pc.0)?;
        sink.emit_label_difference_uleb(to, from)?;
        Ok(None)
    }

    fn emit_sequence(
        &self,
        sink: &mut dyn DebugSink,
        options: &EmitOptions,
        rows: &[LineRow],
        end: Option<Label>,
    ) -> Result<()> {
        let mut regs = Registers {
            file: 1,
            line: 1,
            column: 0,
            is_stmt: DEFAULT_IS_STMT,
            address: rows[0].label,
        };
        Self::emit_set_address(sink, options, rows[0].label)?;

        for (idx, row) in rows.iter().enumerate() {
            if row.file != regs.file {
                sink.emit_u8(DW_LNS_set_file.0)?;
                sink.emit_uleb128(row.file)?;
                regs.file = row.file;
            }
            if row.column != regs.column {
                sink.emit_u8(DW_LNS_set_column.0)?;
                sink.emit_uleb128(row.column as u64)?;
                regs.column = row.column;
            }
            if row.discriminator != 0 && options.version() >= 4 {
                let size = 1 + uleb_len(row.discriminator as u64);
                sink.emit_u8(0)?;
                sink.emit_uleb128(size)?;
                sink.emit_u8(DW_LNE_set_discriminator.0)?;
                sink.emit_uleb128(row.discriminator as u64)?;
            }
            if row.flags.is_stmt != regs.is_stmt {
                sink.emit_u8(DW_LNS_negate_stmt.0)?;
                regs.is_stmt = row.flags.is_stmt;
            }
            if row.flags.prologue_end {
                sink.emit_u8(DW_LNS_set_prologue_end.0)?;
            }
            if row.flags.epilogue_begin {
                sink.emit_u8(DW_LNS_set_epilogue_begin.0)?;
            }

            let address_delta = if idx == 0 {
                Some(0)
            } else {
                Self::advance_address(sink, regs.address, row.label)?
            };
            regs.address = row.label;
            let line_delta = row.line as i64 - regs.line;
            regs.line = row.line as i64;
            emit_row(sink, line_delta, address_delta.unwrap_or(0))?;
        }

        if let Some(end) = end {
            if let Some(delta) = Self::advance_address(sink, regs.address, end)? {
                if delta > 0 {
                    sink.emit_u8(DW_LNS_advance_pc.0)?;
                    sink.emit_uleb128(delta)?;
                }
            }
        }
        sink.emit_u8(0)?;
        sink.emit_uleb128(1)?;
        sink.emit_u8(DW_LNE_end_sequence.0)
    }
}

fn uleb_len(mut value: u64) -> u64 {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Appends a row: a special opcode when the deltas fit, otherwise explicit
/// advances followed by `DW_LNS_copy`
fn emit_row(sink: &mut dyn DebugSink, line_delta: i64, address_delta: u64) -> Result<()> {
    let line_in_range =
        line_delta >= LINE_BASE as i64 && line_delta < LINE_BASE as i64 + LINE_RANGE as i64;
    if !line_in_range {
        sink.emit_u8(DW_LNS_advance_line.0)?;
        sink.emit_sleb128(line_delta)?;
    }
    let adjusted_line = if line_in_range { line_delta } else { 0 };
    let opcode = (adjusted_line - LINE_BASE as i64) as u64
        + LINE_RANGE as u64 * address_delta
        + OPCODE_BASE as u64;
    if opcode <= u8::MAX as u64 {
        return sink.emit_u8(opcode as u8);
    }
    sink.emit_u8(DW_LNS_advance_pc.0)?;
    sink.emit_uleb128(address_delta)?;
    if adjusted_line == 0 {
        return sink.emit_u8(DW_LNS_copy.0);
    }
    let opcode = (adjusted_line - LINE_BASE as i64) as u8 + OPCODE_BASE;
    sink.emit_u8(opcode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EmitterConfig, FileEntry};
    use crate::emit::sink::MemorySink;

    #[test]
    fn test_line_program_reads_back() {
        let options = EmitterConfig::with_version(4).resolve().unwrap();
        let mut alloc = LabelAllocator::new();
        let root = FileEntry::new("main.c", "/src");
        let mut table = LineTable::new(LineFileTable::new("/src", &root, 4), alloc.create(), UnitId(0));
        let file = table.files.file_index(&root);
        let a = alloc.create();
        let b = alloc.create();
        let end = alloc.create();
        let stmt = LineFlags {
            is_stmt: true,
            ..LineFlags::default()
        };
        for (label, line) in [(a, 3), (b, 40)] {
            table.add_row(
                0,
                LineRow {
                    label,
                    file,
                    line,
                    column: 2,
                    discriminator: 0,
                    flags: stmt,
                },
            );
        }

        let mut sink = MemorySink::new(options.endian);
        sink.switch_section(SectionId::Text(0));
        sink.bind_label(a).unwrap();
        sink.emit_fill(4, 0x90).unwrap();
        sink.bind_label(b).unwrap();
        sink.emit_fill(300, 0x90).unwrap();
        sink.bind_label(end).unwrap();
        let ends = BTreeMap::from([(0, end)]);
        table.emit(&mut sink, &options, &mut alloc, &ends).unwrap();
        let output = sink.finish().unwrap();

        let data = output.section_data(SectionId::Debug(DebugSection::Line));
        let program = gimli::DebugLine::new(data, gimli::LittleEndian)
            .program(gimli::DebugLineOffset(0), 8, None, None)
            .unwrap();
        let mut rows = program.rows();
        let mut seen = Vec::new();
        while let Some((_, row)) = rows.next_row().unwrap() {
            seen.push((row.address(), row.line().map(|l| l.get()), row.end_sequence()));
        }
        assert_eq!(
            seen,
            vec![(0, Some(3), false), (4, Some(40), false), (304, Some(40), true)]
        );
    }

    #[test]
    fn test_end_entry_splits_sequence() {
        let options = EmitterConfig::with_version(4).resolve().unwrap();
        let mut alloc = LabelAllocator::new();
        let root = FileEntry::new("main.c", "/src");
        let mut table = LineTable::new(LineFileTable::new("/src", &root, 4), alloc.create(), UnitId(0));
        let file = table.files.file_index(&root);
        let labels: Vec<Label> = (0..4).map(|_| alloc.create()).collect();
        let row = |label, line| LineRow {
            label,
            file,
            line,
            column: 0,
            discriminator: 0,
            flags: LineFlags {
                is_stmt: true,
                ..LineFlags::default()
            },
        };
        table.add_row(0, row(labels[0], 3));
        table.add_end_entry(0, labels[1]);
        table.add_row(0, row(labels[2], 7));
        assert_eq!(table.rows(0).count(), 2);

        let mut sink = MemorySink::new(options.endian);
        sink.switch_section(SectionId::Text(0));
        for label in &labels[..3] {
            sink.bind_label(*label).unwrap();
            sink.emit_fill(4, 0).unwrap();
        }
        sink.bind_label(labels[3]).unwrap();
        let ends = BTreeMap::from([(0, labels[3])]);
        table.emit(&mut sink, &options, &mut alloc, &ends).unwrap();
        let output = sink.finish().unwrap();

        let data = output.section_data(SectionId::Debug(DebugSection::Line));
        let program = gimli::DebugLine::new(data, gimli::LittleEndian)
            .program(gimli::DebugLineOffset(0), 8, None, None)
            .unwrap();
        let mut rows = program.rows();
        let mut seen = Vec::new();
        while let Some((_, row)) = rows.next_row().unwrap() {
            seen.push((row.address(), row.end_sequence()));
        }
        assert_eq!(seen, vec![(0, false), (4, true), (8, false), (12, true)]);
    }

    #[test]
    fn test_large_line_delta_uses_advance_line() {
        let mut sink = MemorySink::new(gimli::RunTimeEndian::Little);
        sink.switch_section(SectionId::Debug(DebugSection::Line));
        emit_row(&mut sink, 100, 0).unwrap();
        emit_row(&mut sink, 1, 2).unwrap();
        let output = sink.finish().unwrap();
        let data = output.section_data(SectionId::Debug(DebugSection::Line));
        assert_eq!(data[0], DW_LNS_advance_line.0);
        assert_eq!(data[3], (0 - LINE_BASE) as u8 + OPCODE_BASE);
        assert_eq!(data[4], (1 - LINE_BASE) as u8 + LINE_RANGE * 2 + OPCODE_BASE);
    }
}
