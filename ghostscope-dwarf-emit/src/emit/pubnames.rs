//! `.debug_pubnames`/`.debug_pubtypes` and their GNU variants

use crate::core::{DebugModule, DebugSection, DieRef, Result, SectionId, UnitId};
use crate::dwarf::tree::EntityTree;
use crate::emit::sink::DebugSink;
use crate::emit::unit_length::UnitLength;
use gimli::constants::*;
use gimli::DwLang;
use tracing::trace;

const PUBNAMES_VERSION: u16 = 2;

/// GDB index entry kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    None = 0,
    Type = 1,
    Variable = 2,
    Function = 3,
}

/// Kind and linkage of a GNU-style entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub kind: IndexKind,
    pub is_static: bool,
}

impl IndexDescriptor {
    fn new(kind: IndexKind, is_static: bool) -> Self {
        Self { kind, is_static }
    }

    pub fn to_bits(self) -> u8 {
        ((self.kind as u8) << 4) | ((self.is_static as u8) << 7)
    }
}

fn is_cplusplus(language: DwLang) -> bool {
    matches!(
        language,
        DW_LANG_C_plus_plus
            | DW_LANG_C_plus_plus_03
            | DW_LANG_C_plus_plus_11
            | DW_LANG_C_plus_plus_14
    )
}

impl EntityTree {
    fn index_descriptor(&self, die: DieRef, language: DwLang) -> IndexDescriptor {
        let entry = self.arena.get(die);
        let external = entry.attr(DW_AT_external).is_some();
        match entry.tag {
            DW_TAG_compile_unit => IndexDescriptor::new(IndexKind::Type, false),
            DW_TAG_class_type
            | DW_TAG_structure_type
            | DW_TAG_union_type
            | DW_TAG_enumeration_type => {
                IndexDescriptor::new(IndexKind::Type, !is_cplusplus(language))
            }
            DW_TAG_typedef | DW_TAG_base_type | DW_TAG_subrange_type | DW_TAG_template_alias => {
                IndexDescriptor::new(IndexKind::Type, true)
            }
            DW_TAG_namespace => IndexDescriptor::new(IndexKind::Type, false),
            DW_TAG_subprogram => IndexDescriptor::new(IndexKind::Function, !external),
            DW_TAG_variable => IndexDescriptor::new(IndexKind::Variable, !external),
            DW_TAG_enumerator => IndexDescriptor::new(IndexKind::Variable, true),
            _ => IndexDescriptor::new(IndexKind::None, false),
        }
    }

    /// Name and type tables of every unit that wants them
    pub fn emit_pub_sections(&mut self, module: &DebugModule, sink: &mut dyn DebugSink) -> Result<()> {
        let units: Vec<UnitId> = self.compile_units().map(|u| u.id).collect();
        for unit in units {
            if !self.has_dwarf_pub_sections(module, unit)? {
                continue;
            }
            let gnu = self.uses_gnu_pub_sections(module, unit)?;
            let language = match self.unit(unit).source {
                Some(cu) => module.compile_unit(cu)?.language,
                None => DW_LANG_C99,
            };
            let (names, types) = if gnu {
                (DebugSection::GnuPubnames, DebugSection::GnuPubtypes)
            } else {
                (DebugSection::Pubnames, DebugSection::Pubtypes)
            };
            let globals: Vec<(String, DieRef)> = self
                .unit(unit)
                .global_names
                .iter()
                .map(|(name, die)| (name.clone(), *die))
                .collect();
            self.emit_pub_section(sink, names, unit, &globals, gnu, language)?;
            let globals: Vec<(String, DieRef)> = self
                .unit(unit)
                .global_types
                .iter()
                .map(|(name, die)| (name.clone(), *die))
                .collect();
            self.emit_pub_section(sink, types, unit, &globals, gnu, language)?;
        }
        Ok(())
    }

    fn emit_pub_section(
        &mut self,
        sink: &mut dyn DebugSink,
        section: DebugSection,
        unit: UnitId,
        globals: &[(String, DieRef)],
        gnu: bool,
        language: DwLang,
    ) -> Result<()> {
        let target = self.skeleton_or_self(unit);
        let offset_size = self.options.offset_size();
        sink.switch_section(SectionId::Debug(section));
        let length = UnitLength::new(&mut self.labels);
        length.emit_start(sink, &self.options)?;
        sink.emit_u16(PUBNAMES_VERSION)?;
        sink.emit_section_offset(self.unit(target).label, offset_size)?;
        sink.emit_int(self.unit(target).length, offset_size)?;

        let mut entries: Vec<&(String, DieRef)> = globals
            .iter()
            .filter(|(_, die)| self.arena.get(*die).unit.is_some())
            .collect();
        entries.sort_by_key(|(_, die)| self.arena.get(*die).offset);
        for (name, die) in entries {
            sink.emit_int(self.arena.get(*die).offset, offset_size)?;
            if gnu {
                sink.emit_u8(self.index_descriptor(*die, language).to_bits())?;
            }
            sink.emit_cstr(name)?;
        }
        sink.emit_int(0, offset_size)?;
        length.emit_end(sink)?;
        trace!("Emitted {} entries into {}", globals.len(), section.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_bits() {
        assert_eq!(IndexDescriptor::new(IndexKind::Function, false).to_bits(), 0x30);
        assert_eq!(IndexDescriptor::new(IndexKind::Variable, true).to_bits(), 0xa0);
        assert_eq!(IndexDescriptor::new(IndexKind::Type, true).to_bits(), 0x90);
        assert_eq!(IndexDescriptor::new(IndexKind::None, false).to_bits(), 0);
    }

    #[test]
    fn test_record_linkage_depends_on_language() {
        use crate::core::EmitterConfig;
        use crate::core::GenericTarget;
        use std::sync::Arc;

        let options = EmitterConfig::with_version(4).resolve().unwrap();
        let mut tree = EntityTree::new(options, Arc::new(GenericTarget::x86_64()));
        let die = tree.arena.create(DW_TAG_structure_type, None);
        assert!(tree.index_descriptor(die, DW_LANG_C99).is_static);
        assert!(!tree.index_descriptor(die, DW_LANG_C_plus_plus).is_static);
        let var = tree.arena.create(DW_TAG_variable, None);
        tree.arena.add_flag(var, DW_AT_external);
        assert_eq!(
            tree.index_descriptor(var, DW_LANG_C99),
            IndexDescriptor::new(IndexKind::Variable, false)
        );
    }
}
