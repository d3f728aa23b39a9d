//! Layout pass: final forms, abbreviation codes, entry offsets and unit
//! offsets within their sections

use crate::core::{DebugSection, DieRef, EmitError, EmitOptions, Result, UnitId};
use crate::dwarf::die::{AttrValue, Attribute, StrRepr};
use crate::dwarf::tree::EntityTree;
use crate::dwarf::unit::UnitKind;
use gimli::constants::*;
use std::collections::BTreeMap;
use tracing::debug;

fn uleb_size(mut value: u64) -> u64 {
    let mut size = 1;
    while value >= 0x80 {
        value >>= 7;
        size += 1;
    }
    size
}

fn sleb_size(mut value: i64) -> u64 {
    let mut size = 1;
    loop {
        let byte = value & 0x7f;
        value >>= 7;
        if (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0) {
            return size;
        }
        size += 1;
    }
}

/// Byte size of a fixed data, flag or reference form
fn fixed_form_size(form: gimli::DwForm, options: &EmitOptions) -> Option<u64> {
    let size = match form {
        DW_FORM_data1 | DW_FORM_flag | DW_FORM_ref1 | DW_FORM_strx1 | DW_FORM_addrx1 => 1,
        DW_FORM_data2 | DW_FORM_ref2 | DW_FORM_strx2 | DW_FORM_addrx2 => 2,
        DW_FORM_strx3 | DW_FORM_addrx3 => 3,
        DW_FORM_data4 | DW_FORM_ref4 | DW_FORM_strx4 | DW_FORM_addrx4 => 4,
        DW_FORM_data8 | DW_FORM_ref8 | DW_FORM_ref_sig8 => 8,
        DW_FORM_data16 => 16,
        DW_FORM_flag_present => 0,
        DW_FORM_addr => options.address_size() as u64,
        DW_FORM_strp | DW_FORM_sec_offset | DW_FORM_line_strp => options.offset_size() as u64,
        DW_FORM_ref_addr => {
            if options.version() <= 2 {
                options.address_size() as u64
            } else {
                options.offset_size() as u64
            }
        }
        _ => return None,
    };
    Some(size)
}

/// Encoded size of one attribute value
pub fn attribute_size(attr: &Attribute, options: &EmitOptions) -> Result<u64> {
    let unsupported = || -> anyhow::Error {
        EmitError::Invariant(format!(
            "attribute {} cannot be encoded as {}",
            attr.name, attr.form
        ))
        .into()
    };
    let size = match (&attr.value, attr.form) {
        (AttrValue::Udata(v), DW_FORM_udata) => uleb_size(*v),
        (AttrValue::Sdata(v), DW_FORM_sdata) => sleb_size(*v),
        (AttrValue::Str { text, .. }, DW_FORM_string) => text.len() as u64 + 1,
        (AttrValue::Str { repr: StrRepr::Index(i), .. }, DW_FORM_strx | DW_FORM_GNU_str_index) => {
            uleb_size(*i as u64)
        }
        (AttrValue::AddrIndex(i), DW_FORM_addrx | DW_FORM_GNU_addr_index) => uleb_size(*i as u64),
        (AttrValue::ListIndex(i), _) => uleb_size(*i as u64),
        (AttrValue::Block(block), DW_FORM_exprloc) => {
            uleb_size(block.len() as u64) + block.len() as u64
        }
        (AttrValue::Block(block), DW_FORM_block1) => 1 + block.len() as u64,
        (AttrValue::Block(block), DW_FORM_block2) => 2 + block.len() as u64,
        (AttrValue::Block(block), DW_FORM_block4) => 4 + block.len() as u64,
        (AttrValue::Block(block), DW_FORM_block) => {
            uleb_size(block.len() as u64) + block.len() as u64
        }
        (_, form) => fixed_form_size(form, options).ok_or_else(unsupported)?,
    };
    Ok(size)
}

impl EntityTree {
    fn same_file(&self, a: UnitId, b: UnitId) -> bool {
        let a = self.unit(a).kind;
        let b = self.unit(b).kind;
        a.is_dwo() == b.is_dwo() && (a == UnitKind::Skeleton) == (b == UnitKind::Skeleton)
    }

    /// Rewrites forms that depend on the version or on where a referenced
    /// entry ended up
    fn fix_forms(&mut self, unit: UnitId) -> Result<()> {
        let version = self.options.version();
        let root = self.unit(unit).root;
        for die in self.arena.subtree(root) {
            let count = self.arena.get(die).attrs.len();
            for idx in 0..count {
                let attr = &self.arena.get(die).attrs[idx];
                let form = match (&attr.value, attr.form) {
                    (AttrValue::Entry(target), _) => {
                        let target_unit = self.arena.get(*target).unit.ok_or_else(|| {
                            EmitError::Invariant(format!(
                                "entry {} references discarded entry {}",
                                die.0, target.0
                            ))
                        })?;
                        if target_unit == unit {
                            DW_FORM_ref4
                        } else if self.same_file(unit, target_unit) {
                            DW_FORM_ref_addr
                        } else {
                            return Err(EmitError::Invariant(format!(
                                "entry {} references entry {} in another output file",
                                die.0, target.0
                            ))
                            .into());
                        }
                    }
                    (_, DW_FORM_flag_present) if version < 4 => DW_FORM_flag,
                    (AttrValue::Block(block), DW_FORM_exprloc) if version < 4 => {
                        if block.len() <= u8::MAX as usize {
                            DW_FORM_block1
                        } else if block.len() <= u16::MAX as usize {
                            DW_FORM_block2
                        } else {
                            DW_FORM_block4
                        }
                    }
                    (_, form) => form,
                };
                self.arena.get_mut(die).attrs[idx].form = form;
            }
        }
        Ok(())
    }

    /// Assigns abbreviation codes and offsets to every entry of `unit` and
    /// returns the unit's total size
    fn layout_unit(&mut self, unit: UnitId) -> Result<u64> {
        let header = self.unit(unit).header_size(&self.options);
        let root = self.unit(unit).root;
        let end = self.layout_die(unit, root, header)?;
        Ok(end)
    }

    fn layout_die(&mut self, unit: UnitId, die: DieRef, offset: u64) -> Result<u64> {
        let kind = self.unit(unit).kind;
        let table = match kind {
            UnitKind::Skeleton => &mut self.skeletons.abbrev,
            _ => &mut self.info.abbrev,
        };
        let code = table.code_for(self.arena.get(die));
        let mut size = uleb_size(code);
        for attr in &self.arena.get(die).attrs {
            size += attribute_size(attr, &self.options)?;
        }
        let entry = self.arena.get_mut(die);
        entry.abbrev = code;
        entry.offset = offset;
        entry.size = size;

        let children = entry.children.clone();
        let mut next = offset + size;
        for child in &children {
            next = self.layout_die(unit, *child, next)?;
        }
        if !children.is_empty() {
            next += 1;
        }
        Ok(next)
    }

    /// Units of each section in output order: type units first
    pub fn section_units(&self) -> BTreeMap<DebugSection, Vec<UnitId>> {
        let mut sections: BTreeMap<DebugSection, Vec<UnitId>> = BTreeMap::new();
        for pass_types in [true, false] {
            for unit in &self.units {
                if self.is_suppressed(unit.id) || unit.kind.is_type() != pass_types {
                    continue;
                }
                sections
                    .entry(unit.section(&self.options))
                    .or_default()
                    .push(unit.id);
            }
        }
        sections
    }

    /// Fixes forms, abbreviations and offsets of every emitted unit
    pub fn compute_layout(&mut self) -> Result<()> {
        let sections = self.section_units();
        for units in sections.values() {
            for unit in units {
                self.fix_forms(*unit)?;
            }
        }
        for (section, units) in &sections {
            let mut offset = 0;
            for unit in units {
                let length = self.layout_unit(*unit)?;
                let entry = self.unit_mut(*unit);
                entry.offset = offset;
                entry.length = length;
                offset += length;
            }
            debug!("Laid out {} unit(s) in {}, {} bytes", units.len(), section.name(), offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        CompileUnitMeta, DebugModule, EmitterConfig, FileEntry, GenericTarget, TypeMeta,
    };
    use std::sync::Arc;

    #[test]
    fn test_leb_sizes() {
        assert_eq!(uleb_size(0), 1);
        assert_eq!(uleb_size(127), 1);
        assert_eq!(uleb_size(128), 2);
        assert_eq!(sleb_size(-64), 1);
        assert_eq!(sleb_size(-65), 2);
        assert_eq!(sleb_size(63), 1);
        assert_eq!(sleb_size(64), 2);
    }

    #[test]
    fn test_flags_and_blocks_downgrade_before_v4() {
        let mut module = DebugModule::new();
        let file = module.add_file(FileEntry::new("a.c", "/src"));
        let (cu, _) = module.add_compile_unit(CompileUnitMeta::new(file, DW_LANG_C99, "cc"));
        let options = EmitterConfig::with_version(3).resolve().unwrap();
        let mut tree = EntityTree::new(options, Arc::new(GenericTarget::x86_64()));
        let unit = tree.get_or_create_compile_unit(&module, cu).unwrap();
        let root = tree.unit(unit).root;
        let var = tree.arena.add_child(root, DW_TAG_variable);
        tree.arena.add_flag(var, DW_AT_external);
        tree.arena.add_block(
            var,
            DW_AT_location,
            crate::dwarf::die::LocBlock::from_bytes(vec![0x50]),
        );

        tree.compute_layout().unwrap();
        assert_eq!(tree.arena.attr(var, DW_AT_external).unwrap().form, DW_FORM_flag);
        assert_eq!(tree.arena.attr(var, DW_AT_location).unwrap().form, DW_FORM_block1);
        assert!(tree.arena.get(var).offset > 0);
        assert!(tree.unit(unit).length > tree.arena.get(var).offset);
    }

    #[test]
    fn test_cross_unit_reference_uses_ref_addr() {
        let mut module = DebugModule::new();
        let file = module.add_file(FileEntry::new("a.c", "/src"));
        let (a, _) = module.add_compile_unit(CompileUnitMeta::new(file, DW_LANG_C99, "cc"));
        let (b, _) = module.add_compile_unit(CompileUnitMeta::new(file, DW_LANG_C99, "cc"));
        let int = module.add_type(TypeMeta::basic("int", DW_ATE_signed, 32));
        let options = EmitterConfig::with_version(4).resolve().unwrap();
        let mut tree = EntityTree::new(options, Arc::new(GenericTarget::x86_64()));
        let ua = tree.get_or_create_compile_unit(&module, a).unwrap();
        let ub = tree.get_or_create_compile_unit(&module, b).unwrap();
        let ty = tree.get_or_create_type_die(&module, ua, int).unwrap();
        let var = tree.arena.add_child(tree.unit(ub).root, DW_TAG_variable);
        tree.arena.add_entry(var, DW_AT_type, ty);

        tree.compute_layout().unwrap();
        assert_eq!(tree.arena.attr(var, DW_AT_type).unwrap().form, DW_FORM_ref_addr);
        assert_eq!(tree.unit(ub).offset, tree.unit(ua).length);
    }
}
