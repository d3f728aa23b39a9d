//! `.debug_info`, `.debug_types` and abbreviation serialization
//!
//! Runs after layout. Every entry is written with the form and abbreviation
//! code layout assigned; the bytes written per unit are checked against the
//! size layout computed so that offsets handed out earlier stay valid.

use crate::core::{DebugSection, EmitError, Label, Result, SectionId, UnitId};
use crate::dwarf::die::{AttrValue, Attribute, LocBlock, StrRepr};
use crate::dwarf::layout::attribute_size;
use crate::dwarf::tree::EntityTree;
use crate::dwarf::unit::UnitKind;
use crate::emit::sink::DebugSink;
use crate::emit::unit_length::{emit_fixed_length, initial_length_size};
use gimli::constants::*;
use gimli::RunTimeEndian;
use tracing::{debug, trace};

impl EntityTree {
    /// Writes both abbreviation tables, binding each file's abbrev label
    pub fn emit_abbrevs(&self, sink: &mut dyn DebugSink) -> Result<()> {
        for file in [&self.info, &self.skeletons] {
            if file.abbrev.is_empty() {
                continue;
            }
            let section = SectionId::Debug(file.abbrev_section());
            sink.switch_section(section);
            sink.bind_label(file.abbrev_label)?;
            file.abbrev.emit(sink, section)?;
            trace!("Emitted {} abbreviations into {}", file.abbrev.len(), section);
        }
        Ok(())
    }

    /// Writes every non-suppressed unit in layout order
    pub fn emit_units(&self, sink: &mut dyn DebugSink) -> Result<()> {
        for (section, units) in self.section_units() {
            sink.switch_section(SectionId::Debug(section));
            for unit in units {
                self.emit_unit(sink, section, unit)?;
            }
        }
        Ok(())
    }

    fn emit_unit(&self, sink: &mut dyn DebugSink, section: DebugSection, id: UnitId) -> Result<()> {
        let options = &self.options;
        let unit = self.unit(id);
        let file = self.file_of(id);
        let start = sink.offset();
        sink.bind_label(unit.label)?;

        emit_fixed_length(sink, options, unit.length - initial_length_size(options))?;
        sink.emit_u16(options.version())?;
        if options.version() >= 5 {
            sink.emit_u8(unit.kind.unit_type().0)?;
            sink.emit_u8(options.address_size())?;
            sink.emit_section_offset(file.abbrev_label, options.offset_size())?;
            match unit.kind {
                UnitKind::Compile => {}
                UnitKind::Skeleton | UnitKind::SplitCompile => {
                    sink.emit_u64(unit.signature.unwrap_or(0))?;
                }
                UnitKind::Type | UnitKind::SplitType => {
                    self.emit_type_unit_tail(sink, id)?;
                }
            }
        } else {
            sink.emit_section_offset(file.abbrev_label, options.offset_size())?;
            sink.emit_u8(options.address_size())?;
            if unit.kind.is_type() {
                self.emit_type_unit_tail(sink, id)?;
            }
        }

        for die in self.arena.subtree_with_ends(unit.root) {
            match die {
                Some(die) => {
                    let entry = self.arena.get(die);
                    sink.emit_uleb128(entry.abbrev)?;
                    for attr in &entry.attrs {
                        self.emit_attribute(sink, id, attr)?;
                    }
                }
                None => sink.emit_u8(0)?,
            }
        }

        let written = sink.offset() - start;
        if written != unit.length {
            return Err(EmitError::Invariant(format!(
                "unit {} in {} wrote {} bytes, layout expected {}",
                id.0,
                section.name(),
                written,
                unit.length
            ))
            .into());
        }
        debug!("Emitted {:?} unit {} ({} bytes)", unit.kind, id.0, written);
        Ok(())
    }

    fn emit_type_unit_tail(&self, sink: &mut dyn DebugSink, id: UnitId) -> Result<()> {
        let unit = self.unit(id);
        sink.emit_u64(unit.signature.unwrap_or(0))?;
        let type_offset = unit
            .type_die
            .map(|die| self.arena.get(die).offset)
            .unwrap_or(0);
        sink.emit_int(type_offset, self.options.offset_size())
    }

    fn emit_attribute(&self, sink: &mut dyn DebugSink, unit: UnitId, attr: &Attribute) -> Result<()> {
        let options = &self.options;
        let dwo = self.unit(unit).kind.is_dwo();
        let size = || attribute_size(attr, options).map(|s| s as u8);
        match (&attr.value, attr.form) {
            (_, DW_FORM_flag_present) => {}
            (AttrValue::Flag(value), DW_FORM_flag) => sink.emit_u8(*value as u8)?,
            (AttrValue::Udata(value), DW_FORM_udata) => sink.emit_uleb128(*value)?,
            (AttrValue::Sdata(value), DW_FORM_sdata) => sink.emit_sleb128(*value)?,
            (AttrValue::Udata(value), DW_FORM_addr) => {
                sink.emit_int(*value, options.address_size())?
            }
            (AttrValue::Udata(value), DW_FORM_data1 | DW_FORM_data2 | DW_FORM_data4 | DW_FORM_data8) => {
                sink.emit_int(*value, size()?)?
            }
            (AttrValue::Sdata(value), DW_FORM_data1 | DW_FORM_data2 | DW_FORM_data4 | DW_FORM_data8) => {
                sink.emit_int(*value as u64, size()?)?
            }
            (AttrValue::Str { text, repr }, form) => {
                self.emit_string(sink, unit, dwo, text, *repr, form)?
            }
            (AttrValue::Entry(target), DW_FORM_ref4) => {
                sink.emit_u32(self.arena.get(*target).offset as u32)?
            }
            (AttrValue::Entry(target), DW_FORM_ref_addr) => {
                let target_unit = self.die_unit(*target)?;
                let offset = self.unit(target_unit).offset + self.arena.get(*target).offset;
                if dwo {
                    sink.emit_int(offset, size()?)?;
                } else {
                    let section = SectionId::Debug(self.unit_section(target_unit));
                    sink.emit_section_relative(section, offset, size()?)?;
                }
            }
            (AttrValue::Signature(signature), DW_FORM_ref_sig8) => sink.emit_u64(*signature)?,
            (AttrValue::Address(label), DW_FORM_addr) => {
                sink.emit_label_address(*label, options.address_size())?
            }
            (AttrValue::AddrIndex(index), _) => sink.emit_uleb128(*index as u64)?,
            (AttrValue::ListIndex(index), _) => sink.emit_uleb128(*index as u64)?,
            (AttrValue::LabelDelta { hi, lo }, _) => {
                sink.emit_label_difference(*hi, *lo, size()?)?
            }
            (AttrValue::SecOffset(label), _) => sink.emit_section_offset(*label, size()?)?,
            (AttrValue::Block(block), form) => self.emit_block(sink, block, form)?,
            (_, form) => {
                return Err(EmitError::Invariant(format!(
                    "attribute {} has no encoding for {}",
                    attr.name, form
                ))
                .into())
            }
        }
        Ok(())
    }

    fn emit_string(
        &self,
        sink: &mut dyn DebugSink,
        unit: UnitId,
        dwo: bool,
        text: &str,
        repr: StrRepr,
        form: gimli::DwForm,
    ) -> Result<()> {
        match (repr, form) {
            (_, DW_FORM_string) => sink.emit_cstr(text),
            (StrRepr::Offset(offset), DW_FORM_strp) => {
                let size = self.options.offset_size();
                if dwo {
                    sink.emit_int(offset, size)
                } else {
                    let section = self.file_of(unit).strings.str_section();
                    sink.emit_section_relative(SectionId::Debug(section), offset, size)
                }
            }
            (StrRepr::Index(index), DW_FORM_strx1) => sink.emit_u8(index as u8),
            (StrRepr::Index(index), DW_FORM_strx2) => sink.emit_u16(index as u16),
            (StrRepr::Index(index), DW_FORM_strx3) => {
                let bytes = match self.options.endian {
                    RunTimeEndian::Little => [index as u8, (index >> 8) as u8, (index >> 16) as u8],
                    RunTimeEndian::Big => [(index >> 16) as u8, (index >> 8) as u8, index as u8],
                };
                sink.emit_bytes(&bytes)
            }
            (StrRepr::Index(index), DW_FORM_strx4) => sink.emit_u32(index),
            (StrRepr::Index(index), DW_FORM_strx | DW_FORM_GNU_str_index) => {
                sink.emit_uleb128(index as u64)
            }
            (_, form) => Err(EmitError::Invariant(format!(
                "string '{}' cannot be written as {}",
                text, form
            ))
            .into()),
        }
    }

    /// Length prefix followed by the bytes, with address placeholders
    /// replaced by relocated label addresses
    fn emit_block(&self, sink: &mut dyn DebugSink, block: &LocBlock, form: gimli::DwForm) -> Result<()> {
        let len = block.len() as u64;
        match form {
            DW_FORM_exprloc | DW_FORM_block => sink.emit_uleb128(len)?,
            DW_FORM_block1 => sink.emit_u8(len as u8)?,
            DW_FORM_block2 => sink.emit_u16(len as u16)?,
            DW_FORM_block4 => sink.emit_u32(len as u32)?,
            form => {
                return Err(EmitError::Invariant(format!("{} is not a block form", form)).into())
            }
        }
        emit_block_bytes(sink, block, self.options.address_size())
    }
}

/// Writes `block` with each placeholder replaced by its label's address
pub(crate) fn emit_block_bytes(sink: &mut dyn DebugSink, block: &LocBlock, address_size: u8) -> Result<()> {
    let mut cursor = 0;
    let mut addresses: Vec<(usize, Label)> = block.addresses.clone();
    addresses.sort_by_key(|(pos, _)| *pos);
    for (pos, label) in addresses {
        sink.emit_bytes(&block.bytes[cursor..pos])?;
        sink.emit_label_address(label, address_size)?;
        cursor = pos + address_size as usize;
    }
    sink.emit_bytes(&block.bytes[cursor.min(block.bytes.len())..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CompileUnitMeta, DebugModule, EmitterConfig, FileEntry, GenericTarget, TypeMeta};
    use crate::emit::sink::MemorySink;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn build(version: u16) -> (EntityTree, UnitId) {
        let mut module = DebugModule::new();
        let file = module.add_file(FileEntry::new("unit.c", "/src"));
        let (cu, _) = module.add_compile_unit(CompileUnitMeta::new(file, DW_LANG_C99, "cc"));
        let int = module.add_type(TypeMeta::basic("int", DW_ATE_signed, 32));
        let options = EmitterConfig::with_version(version).resolve().unwrap();
        let mut tree = EntityTree::new(options, Arc::new(GenericTarget::x86_64()));
        let unit = tree.get_or_create_compile_unit(&module, cu).unwrap();
        let ty = tree.get_or_create_type_die(&module, unit, int).unwrap();
        let var = tree.arena.add_child(tree.unit(unit).root, DW_TAG_variable);
        tree.add_string(var, DW_AT_name, "answer").unwrap();
        tree.arena.add_entry(var, DW_AT_type, ty);
        tree.arena.add_sdata(var, DW_AT_const_value, -42);
        tree.finalize(&module).unwrap();
        tree.compute_layout().unwrap();
        (tree, unit)
    }

    fn read_back(version: u16) -> Vec<(gimli::DwTag, Option<String>)> {
        let (mut tree, _) = build(version);
        let mut sink = MemorySink::new(RunTimeEndian::Little);
        for table in &tree.line_tables {
            table
                .emit(&mut sink, &tree.options, &mut tree.labels, &tree.section_ends)
                .unwrap();
        }
        tree.emit_abbrevs(&mut sink).unwrap();
        tree.emit_units(&mut sink).unwrap();
        tree.info.strings.emit_offsets_header(&mut sink, &tree.options).unwrap();
        tree.info
            .strings
            .emit(&mut sink, &tree.options, version >= 5, true)
            .unwrap();
        let output = sink.finish().unwrap();

        let section = |id: DebugSection| {
            gimli::EndianSlice::new(output.section_data(SectionId::Debug(id)), RunTimeEndian::Little)
        };
        let dwarf = gimli::Dwarf {
            debug_info: section(DebugSection::Info).into(),
            debug_abbrev: section(DebugSection::Abbrev).into(),
            debug_str: section(DebugSection::Str).into(),
            debug_str_offsets: section(DebugSection::StrOffsets).into(),
            ..Default::default()
        };
        let header = dwarf.units().next().unwrap().unwrap();
        let unit = dwarf.unit(header).unwrap();
        let mut out = Vec::new();
        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs().unwrap() {
            let name = entry
                .attr_value(DW_AT_name)
                .unwrap()
                .map(|v| dwarf.attr_string(&unit, v).unwrap().to_string_lossy().into_owned());
            out.push((entry.tag(), name));
        }
        out
    }

    #[test]
    fn test_units_read_back_v4() {
        assert_eq!(
            read_back(4),
            vec![
                (DW_TAG_compile_unit, Some("unit.c".to_string())),
                (DW_TAG_base_type, Some("int".to_string())),
                (DW_TAG_variable, Some("answer".to_string())),
            ]
        );
    }

    #[test]
    fn test_units_read_back_v5_with_string_index() {
        let entries = read_back(5);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2], (DW_TAG_variable, Some("answer".to_string())));
    }

    #[test]
    fn test_block_placeholders_are_relocated() {
        let mut sink = MemorySink::new(RunTimeEndian::Little);
        sink.switch_section(SectionId::Text(0));
        sink.emit_fill(0x10, 0).unwrap();
        sink.bind_label(Label(7)).unwrap();
        sink.switch_section(SectionId::Debug(DebugSection::Info));
        let block = LocBlock {
            bytes: vec![0x03, 0, 0, 0, 0, 0, 0, 0, 0, 0x9f],
            addresses: vec![(1, Label(7))],
        };
        emit_block_bytes(&mut sink, &block, 8).unwrap();
        let output = sink.finish().unwrap();
        let data = output.section_data(SectionId::Debug(DebugSection::Info));
        assert_eq!(data.len(), 10);
        assert_eq!(data[0], 0x03);
        assert_eq!(u64::from_le_bytes(data[1..9].try_into().unwrap()), 0x10);
        assert_eq!(data[9], 0x9f);
    }
}
