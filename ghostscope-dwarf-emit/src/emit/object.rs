//! Relocatable object output for finished sinks
//!
//! The primary object gets the code sections and every non-split debug
//! section; the companion `.dwo` object gets the split sections.

use crate::core::{EmitError, EmitOptions, ObjectFormat, Result, SectionId};
use crate::emit::sink::{OutputSection, RelocTarget, SinkOutput};
use gimli::RunTimeEndian;
use object::write::{Object, Relocation, StandardSegment, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};
use std::collections::HashMap;
use tracing::{debug, info};

fn architecture(options: &EmitOptions) -> Architecture {
    match (options.address_size(), options.endian) {
        (8, RunTimeEndian::Little) => Architecture::X86_64,
        (8, RunTimeEndian::Big) => Architecture::PowerPc64,
        (_, RunTimeEndian::Little) => Architecture::I386,
        (_, RunTimeEndian::Big) => Architecture::PowerPc,
    }
}

fn section_name(id: SectionId, format: BinaryFormat) -> Vec<u8> {
    let name = match id {
        SectionId::Text(0) => ".text".to_string(),
        SectionId::Text(idx) => format!(".text.{}", idx),
        SectionId::Debug(section) => section.name().to_string(),
    };
    if format == BinaryFormat::MachO {
        name.replacen('.', "__", 1).into_bytes()
    } else {
        name.into_bytes()
    }
}

fn wants_section(section: &OutputSection, dwo: bool) -> bool {
    match section.id {
        SectionId::Text(_) => !dwo,
        SectionId::Debug(debug) => debug.is_dwo() == dwo,
    }
}

fn build_object(output: &SinkOutput, options: &EmitOptions, dwo: bool) -> Result<Vec<u8>> {
    let format = match options.object_format {
        ObjectFormat::Elf => BinaryFormat::Elf,
        ObjectFormat::MachO => BinaryFormat::MachO,
        ObjectFormat::Coff => BinaryFormat::Coff,
        ObjectFormat::Xcoff => BinaryFormat::Xcoff,
        ObjectFormat::Wasm => {
            return Err(EmitError::UnsupportedConfig(
                "wasm objects cannot be written, take the sections from the sink".to_string(),
            )
            .into())
        }
    };
    let endian = match options.endian {
        RunTimeEndian::Little => Endianness::Little,
        RunTimeEndian::Big => Endianness::Big,
    };
    let mut obj = Object::new(format, architecture(options), endian);

    let mut sections = HashMap::new();
    for section in output.sections.iter().filter(|s| wants_section(s, dwo)) {
        let (segment, kind, align) = match section.id {
            SectionId::Text(_) => (StandardSegment::Text, SectionKind::Text, 16),
            SectionId::Debug(_) => (StandardSegment::Debug, SectionKind::Debug, 1),
        };
        let segment = obj.segment_name(segment).to_vec();
        let id = obj.add_section(segment, section_name(section.id, format), kind);
        obj.section_mut(id).set_data(section.data.clone(), align);
        sections.insert(section.id, id);
    }

    let mut externals: HashMap<String, SymbolId> = HashMap::new();
    for section in output.sections.iter().filter(|s| wants_section(s, dwo)) {
        let Some(from) = sections.get(&section.id).copied() else {
            continue;
        };
        for reloc in &section.relocations {
            let symbol = match &reloc.target {
                RelocTarget::Section(target) => {
                    let target = sections.get(target).copied().ok_or_else(|| {
                        EmitError::Invariant(format!(
                            "relocation in {} targets {} outside this object",
                            section.id, target
                        ))
                    })?;
                    obj.section_symbol(target)
                }
                RelocTarget::Symbol(name) => *externals.entry(name.clone()).or_insert_with(|| {
                    obj.add_symbol(Symbol {
                        name: name.as_bytes().to_vec(),
                        value: 0,
                        size: 0,
                        kind: SymbolKind::Unknown,
                        scope: SymbolScope::Unknown,
                        weak: false,
                        section: SymbolSection::Undefined,
                        flags: SymbolFlags::None,
                    })
                }),
            };
            obj.add_relocation(
                from,
                Relocation {
                    offset: reloc.offset,
                    symbol,
                    addend: reloc.addend,
                    flags: RelocationFlags::Generic {
                        kind: RelocationKind::Absolute,
                        encoding: RelocationEncoding::Generic,
                        size: reloc.size * 8,
                    },
                },
            )
            .map_err(EmitError::Object)?;
        }
    }
    debug!(
        "Built {:?} object with {} sections ({})",
        format,
        sections.len(),
        if dwo { "companion" } else { "primary" }
    );
    Ok(obj.write().map_err(EmitError::Object)?)
}

/// Primary object: code plus every non-split debug section
pub fn write_object(output: &SinkOutput, options: &EmitOptions) -> Result<Vec<u8>> {
    let bytes = build_object(output, options, false)?;
    info!("Wrote primary object ({} bytes)", bytes.len());
    Ok(bytes)
}

/// Companion object holding the split sections, if split debug is on
pub fn write_dwo_object(output: &SinkOutput, options: &EmitOptions) -> Result<Option<Vec<u8>>> {
    if !options.use_split_dwarf() {
        return Ok(None);
    }
    let bytes = build_object(output, options, true)?;
    info!("Wrote companion object ({} bytes)", bytes.len());
    Ok(Some(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DebugSection, EmitterConfig, Label};
    use crate::emit::sink::{DebugSink, MemorySink};
    use object::{Object as _, ObjectSection as _};

    #[test]
    fn test_object_has_debug_sections_and_relocations() {
        let options = EmitterConfig::default().resolve().unwrap();
        let mut sink = MemorySink::new(RunTimeEndian::Little);
        sink.switch_section(SectionId::Text(0));
        sink.bind_label(Label(1)).unwrap();
        sink.emit_fill(4, 0x90).unwrap();
        sink.switch_section(SectionId::Debug(DebugSection::Aranges));
        sink.emit_label_address(Label(1), 8).unwrap();
        let output = sink.finish().unwrap();

        let bytes = write_object(&output, &options).unwrap();
        let file = object::File::parse(bytes.as_slice()).unwrap();
        let aranges = file.section_by_name(".debug_aranges").unwrap();
        assert_eq!(aranges.relocations().count(), 1);
        assert!(file.section_by_name(".text").is_some());
        assert!(write_dwo_object(&output, &options).unwrap().is_none());
    }
}
