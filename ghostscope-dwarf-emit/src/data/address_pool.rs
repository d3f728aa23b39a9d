//! Shared address pool (`.debug_addr`)

use crate::core::{DebugSection, EmitOptions, Label, Result, SectionId};
use crate::emit::sink::DebugSink;
use crate::emit::unit_length::UnitLength;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct PoolEntry {
    index: u32,
    tls: bool,
}

/// Module-wide pool of relocatable addresses referenced by index.
/// Each label occupies exactly one slot.
#[derive(Debug)]
pub struct AddressPool {
    pool: HashMap<Label, PoolEntry>,
    /// Set whenever an index is handed out; type-unit construction watches
    /// it to detect address use
    has_been_used: bool,
    base_label: Label,
}

impl AddressPool {
    pub fn new(base_label: Label) -> Self {
        Self {
            pool: HashMap::new(),
            has_been_used: false,
            base_label,
        }
    }

    pub fn index(&mut self, label: Label, tls: bool) -> u32 {
        self.has_been_used = true;
        let next = self.pool.len() as u32;
        self.pool
            .entry(label)
            .or_insert(PoolEntry { index: next, tls })
            .index
    }

    pub fn has_been_used(&self) -> bool {
        self.has_been_used
    }

    pub fn reset_used_flag(&mut self) {
        self.has_been_used = false;
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// Label `DW_AT_addr_base` points at (after the v5 header)
    pub fn base_label(&self) -> Label {
        self.base_label
    }

    /// Labels in index order
    pub fn entries(&self) -> Vec<(Label, bool)> {
        let mut entries: Vec<(u32, Label, bool)> = self
            .pool
            .iter()
            .map(|(label, entry)| (entry.index, *label, entry.tls))
            .collect();
        entries.sort_by_key(|(index, _, _)| *index);
        entries
            .into_iter()
            .map(|(_, label, tls)| (label, tls))
            .collect()
    }

    pub fn emit(
        &self,
        sink: &mut dyn DebugSink,
        options: &EmitOptions,
        length: Option<UnitLength>,
    ) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        sink.switch_section(SectionId::Debug(DebugSection::Addr));
        let header = match length {
            Some(length) if options.version() >= 5 => {
                length.emit_start(sink, options)?;
                sink.emit_u16(options.version())?;
                sink.emit_u8(options.address_size())?;
                // segment selector size
                sink.emit_u8(0)?;
                Some(length)
            }
            _ => None,
        };
        sink.bind_label(self.base_label)?;
        for (label, _tls) in self.entries() {
            sink.emit_label_address(label, options.address_size())?;
        }
        if let Some(length) = header {
            length.emit_end(sink)?;
        }
        debug!("Emitted address pool with {} entries", self.pool.len());
        Ok(())
    }
}
