//! String pool of one output file (`.debug_str` and `.debug_str_offsets`)

use crate::core::{DebugSection, EmitOptions, Label, Result, SectionId};
use crate::emit::sink::DebugSink;
use crate::emit::unit_length::emit_fixed_length;
use std::collections::HashMap;
use tracing::debug;

/// Position of a pooled string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringRef {
    pub offset: u64,
    /// Slot in the offsets table, assigned on first indexed request
    pub index: Option<u32>,
}

#[derive(Debug, Clone)]
struct PooledString {
    text: String,
    offset: u64,
    index: Option<u32>,
}

#[derive(Debug)]
pub struct StringPool {
    map: HashMap<String, usize>,
    strings: Vec<PooledString>,
    size: u64,
    indexed: u32,
    str_section: DebugSection,
    offsets_section: DebugSection,
    /// Label `DW_AT_str_offsets_base` refers to
    offsets_base: Label,
}

impl StringPool {
    pub fn new(str_section: DebugSection, offsets_section: DebugSection, offsets_base: Label) -> Self {
        Self {
            map: HashMap::new(),
            strings: Vec::new(),
            size: 0,
            indexed: 0,
            str_section,
            offsets_section,
            offsets_base,
        }
    }

    fn insert(&mut self, text: &str) -> usize {
        if let Some(idx) = self.map.get(text) {
            return *idx;
        }
        let idx = self.strings.len();
        self.strings.push(PooledString {
            text: text.to_string(),
            offset: self.size,
            index: None,
        });
        self.size += text.len() as u64 + 1;
        self.map.insert(text.to_string(), idx);
        idx
    }

    pub fn entry(&mut self, text: &str) -> StringRef {
        let idx = self.insert(text);
        let entry = &self.strings[idx];
        StringRef {
            offset: entry.offset,
            index: entry.index,
        }
    }

    pub fn indexed_entry(&mut self, text: &str) -> StringRef {
        let idx = self.insert(text);
        if self.strings[idx].index.is_none() {
            self.strings[idx].index = Some(self.indexed);
            self.indexed += 1;
        }
        let entry = &self.strings[idx];
        StringRef {
            offset: entry.offset,
            index: entry.index,
        }
    }

    pub fn lookup(&self, text: &str) -> Option<StringRef> {
        self.map.get(text).map(|idx| StringRef {
            offset: self.strings[*idx].offset,
            index: self.strings[*idx].index,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn indexed_count(&self) -> u32 {
        self.indexed
    }

    pub fn str_section(&self) -> DebugSection {
        self.str_section
    }

    pub fn offsets_base(&self) -> Label {
        self.offsets_base
    }

    /// v5 contribution header of the offsets table
    pub fn emit_offsets_header(&self, sink: &mut dyn DebugSink, options: &EmitOptions) -> Result<()> {
        if self.indexed == 0 {
            return Ok(());
        }
        sink.switch_section(SectionId::Debug(self.offsets_section));
        let length = self.indexed as u64 * options.offset_size() as u64 + 4;
        emit_fixed_length(sink, options, length)?;
        sink.emit_u16(5)?;
        // padding
        sink.emit_u16(0)?;
        Ok(())
    }

    /// Writes the strings, and the offsets table when `with_offsets` is set.
    /// `relocate` makes offsets relocatable against the string section.
    pub fn emit(
        &self,
        sink: &mut dyn DebugSink,
        options: &EmitOptions,
        with_offsets: bool,
        relocate: bool,
    ) -> Result<()> {
        if self.strings.is_empty() {
            return Ok(());
        }
        sink.switch_section(SectionId::Debug(self.str_section));
        for entry in &self.strings {
            sink.emit_cstr(&entry.text)?;
        }

        if with_offsets && self.indexed > 0 {
            sink.switch_section(SectionId::Debug(self.offsets_section));
            sink.bind_label(self.offsets_base)?;
            let mut indexed: Vec<&PooledString> =
                self.strings.iter().filter(|s| s.index.is_some()).collect();
            indexed.sort_by_key(|s| s.index);
            for entry in indexed {
                if relocate {
                    sink.emit_section_relative(
                        SectionId::Debug(self.str_section),
                        entry.offset,
                        options.offset_size(),
                    )?;
                } else {
                    sink.emit_int(entry.offset, options.offset_size())?;
                }
            }
        }
        debug!(
            "Emitted {} strings ({} indexed) into {}",
            self.strings.len(),
            self.indexed,
            self.str_section.name()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> StringPool {
        StringPool::new(DebugSection::Str, DebugSection::StrOffsets, Label(0))
    }

    #[test]
    fn test_offsets_are_assigned_in_insertion_order() {
        let mut pool = pool();
        assert_eq!(pool.entry("int").offset, 0);
        assert_eq!(pool.entry("main").offset, 4);
        assert_eq!(pool.entry("int").offset, 0);
        assert_eq!(pool.entry("x").offset, 9);
    }

    #[test]
    fn test_indices_are_lazy() {
        let mut pool = pool();
        pool.entry("a");
        let b = pool.indexed_entry("b");
        let a = pool.indexed_entry("a");
        assert_eq!(b.index, Some(0));
        assert_eq!(a.index, Some(1));
        assert_eq!(a.offset, 0);
        assert_eq!(pool.indexed_count(), 2);
        assert_eq!(pool.lookup("b").unwrap().index, Some(0));
    }
}
