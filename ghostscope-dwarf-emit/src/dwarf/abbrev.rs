//! Abbreviation tables

use crate::core::{Result, SectionId};
use crate::dwarf::die::Die;
use crate::emit::sink::DebugSink;
use gimli::{DwAt, DwForm, DwTag};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AbbrevKey {
    tag: DwTag,
    has_children: bool,
    specs: Vec<(DwAt, DwForm)>,
}

/// Abbreviations of one unit file; structurally identical entries share a
/// code
#[derive(Debug, Default)]
pub struct AbbrevTable {
    codes: HashMap<AbbrevKey, u64>,
    list: Vec<AbbrevKey>,
}

impl AbbrevTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Code for the shape of `die`, adding it on first use
    pub fn code_for(&mut self, die: &Die) -> u64 {
        let key = AbbrevKey {
            tag: die.tag,
            has_children: die.has_children(),
            specs: die.attrs.iter().map(|a| (a.name, a.form)).collect(),
        };
        if let Some(code) = self.codes.get(&key) {
            return *code;
        }
        self.list.push(key.clone());
        let code = self.list.len() as u64;
        self.codes.insert(key, code);
        code
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn emit(&self, sink: &mut dyn DebugSink, section: SectionId) -> Result<()> {
        if self.list.is_empty() {
            return Ok(());
        }
        sink.switch_section(section);
        for (idx, key) in self.list.iter().enumerate() {
            sink.emit_uleb128(idx as u64 + 1)?;
            sink.emit_uleb128(key.tag.0 as u64)?;
            sink.emit_u8(key.has_children as u8)?;
            for (name, form) in &key.specs {
                sink.emit_uleb128(name.0 as u64)?;
                sink.emit_uleb128(form.0 as u64)?;
            }
            sink.emit_uleb128(0)?;
            sink.emit_uleb128(0)?;
        }
        sink.emit_u8(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwarf::die::DieArena;
    use gimli::constants::*;

    #[test]
    fn test_identical_shapes_share_codes() {
        let mut arena = DieArena::new();
        let a = arena.create(DW_TAG_base_type, None);
        arena.add_udata(a, DW_AT_byte_size, 4);
        let b = arena.create(DW_TAG_base_type, None);
        arena.add_udata(b, DW_AT_byte_size, 8);
        let c = arena.create(DW_TAG_base_type, None);
        arena.add_udata(c, DW_AT_byte_size, 300);

        let mut table = AbbrevTable::new();
        let code_a = table.code_for(arena.get(a));
        assert_eq!(table.code_for(arena.get(b)), code_a);
        assert_ne!(table.code_for(arena.get(c)), code_a);
        assert_eq!(table.len(), 2);
    }
}
