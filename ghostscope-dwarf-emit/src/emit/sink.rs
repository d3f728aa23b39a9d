//! Output sink: append-only section writer with write-once labels
//!
//! `DebugSink` is the downstream interface every serializer writes through.
//! `MemorySink` keeps sections in memory, resolves label fixups at `finish`
//! and records the relocations an object writer needs.

use crate::core::{EmitError, Label, Result, SectionId};
use gimli::write::{EndianVec, Writer};
use gimli::RunTimeEndian;
use std::collections::HashMap;
use tracing::{debug, trace};

pub trait DebugSink {
    fn switch_section(&mut self, section: SectionId);

    fn current_section(&self) -> SectionId;

    /// Offset of the next byte in the current section
    fn offset(&self) -> u64;

    /// Positions `label` at the current offset. Labels are write-once.
    fn bind_label(&mut self, label: Label) -> Result<()>;

    /// Marks `label` as naming a symbol defined outside the debug output
    fn declare_external(&mut self, label: Label, name: &str);

    fn emit_int(&mut self, value: u64, size: u8) -> Result<()>;

    fn emit_uleb128(&mut self, value: u64) -> Result<()>;

    fn emit_sleb128(&mut self, value: i64) -> Result<()>;

    fn emit_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// Absolute address of `label`
    fn emit_label_address(&mut self, label: Label, size: u8) -> Result<()>;

    /// `hi - lo`; both labels must end up in the same section
    fn emit_label_difference(&mut self, hi: Label, lo: Label, size: u8) -> Result<()>;

    fn emit_label_difference_uleb(&mut self, hi: Label, lo: Label) -> Result<()>;

    /// Offset of `label` within its own section
    fn emit_section_offset(&mut self, label: Label, size: u8) -> Result<()>;

    /// Known offset into a debug section, relocated against that section
    fn emit_section_relative(&mut self, section: SectionId, offset: u64, size: u8) -> Result<()>;

    fn emit_fill(&mut self, len: u64, byte: u8) -> Result<()>;

    /// Section and offset of an already bound label
    fn bound_position(&self, label: Label) -> Option<(SectionId, u64)>;

    /// `hi - lo` when both labels are bound in the same section
    fn resolved_difference(&self, hi: Label, lo: Label) -> Option<u64> {
        let (hi_section, hi_offset) = self.bound_position(hi)?;
        let (lo_section, lo_offset) = self.bound_position(lo)?;
        (hi_section == lo_section && hi_offset >= lo_offset).then(|| hi_offset - lo_offset)
    }

    fn emit_u8(&mut self, value: u8) -> Result<()> {
        self.emit_int(value as u64, 1)
    }

    fn emit_u16(&mut self, value: u16) -> Result<()> {
        self.emit_int(value as u64, 2)
    }

    fn emit_u32(&mut self, value: u32) -> Result<()> {
        self.emit_int(value as u64, 4)
    }

    fn emit_u64(&mut self, value: u64) -> Result<()> {
        self.emit_int(value, 8)
    }

    /// NUL-terminated string
    fn emit_cstr(&mut self, text: &str) -> Result<()> {
        self.emit_bytes(text.as_bytes())?;
        self.emit_u8(0)
    }

    fn align_to(&mut self, alignment: u64, fill: u8) -> Result<()> {
        if alignment > 1 {
            let rem = self.offset() % alignment;
            if rem != 0 {
                self.emit_fill(alignment - rem, fill)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixupKind {
    Address,
    Difference { lo: Label },
    DifferenceUleb { lo: Label },
    SectionOffset,
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    offset: usize,
    size: u8,
    label: Label,
    kind: FixupKind,
}

#[derive(Debug)]
struct SectionBuffer {
    data: EndianVec<RunTimeEndian>,
    fixups: Vec<Fixup>,
    relocations: Vec<Relocation>,
}

impl SectionBuffer {
    fn new(endian: RunTimeEndian) -> Self {
        Self {
            data: EndianVec::new(endian),
            fixups: Vec::new(),
            relocations: Vec::new(),
        }
    }
}

/// What a relocation points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocTarget {
    Section(SectionId),
    Symbol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub offset: u64,
    pub size: u8,
    pub target: RelocTarget,
    pub addend: i64,
}

#[derive(Debug, Clone)]
pub struct OutputSection {
    pub id: SectionId,
    pub data: Vec<u8>,
    /// Load address; only meaningful for code sections
    pub address: u64,
    pub relocations: Vec<Relocation>,
}

/// Resolved contents of a `MemorySink`
#[derive(Debug, Clone, Default)]
pub struct SinkOutput {
    pub sections: Vec<OutputSection>,
    pub labels: HashMap<Label, (SectionId, u64)>,
}

impl SinkOutput {
    pub fn section(&self, id: SectionId) -> Option<&OutputSection> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn section_data(&self, id: SectionId) -> &[u8] {
        self.section(id).map(|s| s.data.as_slice()).unwrap_or(&[])
    }

    /// Resolved address of a label bound in a code section
    pub fn label_address(&self, label: Label) -> Option<u64> {
        let (section, offset) = *self.labels.get(&label)?;
        Some(self.section(section)?.address + offset)
    }
}

/// In-memory sink; code sections are laid out consecutively from
/// `text_base`, debug sections all start at address 0
#[derive(Debug)]
pub struct MemorySink {
    endian: RunTimeEndian,
    sections: HashMap<SectionId, SectionBuffer>,
    order: Vec<SectionId>,
    current: SectionId,
    labels: HashMap<Label, (SectionId, u64)>,
    externals: HashMap<Label, String>,
    text_base: u64,
}

const TEXT_ALIGNMENT: u64 = 16;

impl MemorySink {
    pub fn new(endian: RunTimeEndian) -> Self {
        Self::with_text_base(endian, 0)
    }

    pub fn with_text_base(endian: RunTimeEndian, text_base: u64) -> Self {
        Self {
            endian,
            sections: HashMap::new(),
            order: Vec::new(),
            current: SectionId::Text(0),
            labels: HashMap::new(),
            externals: HashMap::new(),
            text_base,
        }
    }

    pub fn section_len(&self, section: SectionId) -> u64 {
        self.sections
            .get(&section)
            .map(|s| s.data.len() as u64)
            .unwrap_or(0)
    }

    fn buffer(&mut self) -> &mut SectionBuffer {
        let endian = self.endian;
        let current = self.current;
        if !self.sections.contains_key(&current) {
            self.order.push(current);
        }
        self.sections
            .entry(current)
            .or_insert_with(|| SectionBuffer::new(endian))
    }

    fn push_fixup(&mut self, label: Label, size: u8, kind: FixupKind) -> Result<()> {
        let buffer = self.buffer();
        let offset = buffer.data.len();
        buffer.data.write_udata(0, size)?;
        buffer.fixups.push(Fixup {
            offset,
            size,
            label,
            kind,
        });
        Ok(())
    }

    fn same_section_delta(&self, hi: Label, lo: Label) -> Option<Result<u64>> {
        let (hi_section, hi_offset) = self.labels.get(&hi)?;
        let (lo_section, lo_offset) = self.labels.get(&lo)?;
        if hi_section != lo_section {
            return Some(Err(EmitError::CrossSectionDifference(hi.0, lo.0).into()));
        }
        Some(Ok(hi_offset.wrapping_sub(*lo_offset)))
    }

    /// Resolves every fixup and returns the finished sections
    pub fn finish(mut self) -> Result<SinkOutput> {
        let mut addresses: HashMap<SectionId, u64> = HashMap::new();
        let mut next = self.text_base;
        for id in &self.order {
            if let SectionId::Text(_) = id {
                next = next.div_ceil(TEXT_ALIGNMENT) * TEXT_ALIGNMENT;
                addresses.insert(*id, next);
                next += self.sections.get(id).map(|s| s.data.len() as u64).unwrap_or(0);
            }
        }

        let mut output = SinkOutput {
            sections: Vec::with_capacity(self.order.len()),
            labels: self.labels.clone(),
        };
        for id in self.order.clone() {
            let Some(mut buffer) = self.sections.remove(&id) else {
                continue;
            };
            let own_is_dwo = matches!(id, SectionId::Debug(s) if s.is_dwo());
            let mut relocations = std::mem::take(&mut buffer.relocations);
            for fixup in &buffer.fixups {
                let target = self.labels.get(&fixup.label).copied();
                match fixup.kind {
                    FixupKind::Address => {
                        let (value, reloc) = match (target, self.externals.get(&fixup.label)) {
                            (Some((section, offset)), _) => {
                                let base = addresses.get(&section).copied().unwrap_or(0);
                                (
                                    base + offset,
                                    Relocation {
                                        offset: fixup.offset as u64,
                                        size: fixup.size,
                                        target: RelocTarget::Section(section),
                                        addend: offset as i64,
                                    },
                                )
                            }
                            (None, Some(name)) => (
                                0,
                                Relocation {
                                    offset: fixup.offset as u64,
                                    size: fixup.size,
                                    target: RelocTarget::Symbol(name.clone()),
                                    addend: 0,
                                },
                            ),
                            (None, None) => {
                                return Err(EmitError::UnboundLabel(fixup.label.0).into())
                            }
                        };
                        buffer
                            .data
                            .write_udata_at(fixup.offset, value, fixup.size)?;
                        if !own_is_dwo {
                            relocations.push(reloc);
                        }
                    }
                    FixupKind::SectionOffset => {
                        let (section, offset) =
                            target.ok_or(EmitError::UnboundLabel(fixup.label.0))?;
                        buffer
                            .data
                            .write_udata_at(fixup.offset, offset, fixup.size)?;
                        let target_is_dwo = matches!(section, SectionId::Debug(s) if s.is_dwo());
                        if !own_is_dwo && !target_is_dwo {
                            relocations.push(Relocation {
                                offset: fixup.offset as u64,
                                size: fixup.size,
                                target: RelocTarget::Section(section),
                                addend: offset as i64,
                            });
                        }
                    }
                    FixupKind::Difference { lo } | FixupKind::DifferenceUleb { lo } => {
                        let delta = match self.same_section_delta(fixup.label, lo) {
                            Some(delta) => delta?,
                            None => {
                                let missing = if self.labels.contains_key(&fixup.label) {
                                    lo
                                } else {
                                    fixup.label
                                };
                                return Err(EmitError::UnboundLabel(missing.0).into());
                            }
                        };
                        if let FixupKind::DifferenceUleb { .. } = fixup.kind {
                            let bytes = padded_uleb128(delta, fixup.size as usize);
                            buffer.data.write_at(fixup.offset, &bytes)?;
                        } else {
                            buffer
                                .data
                                .write_udata_at(fixup.offset, delta, fixup.size)?;
                        }
                    }
                }
            }
            trace!(
                "Finished section {}: {} bytes, {} relocations",
                id,
                buffer.data.len(),
                relocations.len()
            );
            output.sections.push(OutputSection {
                id,
                data: buffer.data.into_vec(),
                address: addresses.get(&id).copied().unwrap_or(0),
                relocations,
            });
        }
        debug!("Sink finished with {} sections", output.sections.len());
        Ok(output)
    }
}

const PADDED_ULEB_WIDTH: u8 = 4;

fn padded_uleb128(mut value: u64, width: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(width);
    for i in 0..width {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if i + 1 < width {
            byte |= 0x80;
        }
        out.push(byte);
    }
    out
}

impl DebugSink for MemorySink {
    fn switch_section(&mut self, section: SectionId) {
        self.current = section;
    }

    fn current_section(&self) -> SectionId {
        self.current
    }

    fn offset(&self) -> u64 {
        self.section_len(self.current)
    }

    fn bind_label(&mut self, label: Label) -> Result<()> {
        let position = (self.current, self.offset());
        if self.labels.insert(label, position).is_some() {
            return Err(EmitError::Invariant(format!("label {} bound twice", label)).into());
        }
        // Materialize the section so empty sections still get an address.
        self.buffer();
        Ok(())
    }

    fn declare_external(&mut self, label: Label, name: &str) {
        self.externals.insert(label, name.to_string());
    }

    fn emit_int(&mut self, value: u64, size: u8) -> Result<()> {
        self.buffer().data.write_udata(value, size)?;
        Ok(())
    }

    fn emit_uleb128(&mut self, value: u64) -> Result<()> {
        self.buffer().data.write_uleb128(value)?;
        Ok(())
    }

    fn emit_sleb128(&mut self, value: i64) -> Result<()> {
        self.buffer().data.write_sleb128(value)?;
        Ok(())
    }

    fn emit_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer().data.write(bytes)?;
        Ok(())
    }

    fn emit_label_address(&mut self, label: Label, size: u8) -> Result<()> {
        self.push_fixup(label, size, FixupKind::Address)
    }

    fn emit_label_difference(&mut self, hi: Label, lo: Label, size: u8) -> Result<()> {
        if let Some(delta) = self.same_section_delta(hi, lo) {
            let delta = delta?;
            return self.emit_int(delta, size);
        }
        self.push_fixup(hi, size, FixupKind::Difference { lo })
    }

    fn emit_label_difference_uleb(&mut self, hi: Label, lo: Label) -> Result<()> {
        if let Some(delta) = self.same_section_delta(hi, lo) {
            let delta = delta?;
            return self.emit_uleb128(delta);
        }
        // Unknown yet: reserve a fixed-width padded encoding.
        self.push_fixup(
            hi,
            PADDED_ULEB_WIDTH,
            FixupKind::DifferenceUleb { lo },
        )
    }

    fn emit_section_offset(&mut self, label: Label, size: u8) -> Result<()> {
        self.push_fixup(label, size, FixupKind::SectionOffset)
    }

    fn emit_section_relative(&mut self, section: SectionId, offset: u64, size: u8) -> Result<()> {
        let own_is_dwo = matches!(self.current, SectionId::Debug(s) if s.is_dwo());
        let buffer = self.buffer();
        let at = buffer.data.len() as u64;
        buffer.data.write_udata(offset, size)?;
        if !own_is_dwo {
            buffer.relocations.push(Relocation {
                offset: at,
                size,
                target: RelocTarget::Section(section),
                addend: offset as i64,
            });
        }
        Ok(())
    }

    fn emit_fill(&mut self, len: u64, byte: u8) -> Result<()> {
        let fill = vec![byte; len as usize];
        self.emit_bytes(&fill)
    }

    fn bound_position(&self, label: Label) -> Option<(SectionId, u64)> {
        self.labels.get(&label).copied()
    }
}
