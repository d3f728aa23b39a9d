//! Range and location list serialization
//!
//! `.debug_ranges`/`.debug_rnglists` and `.debug_loc`/`.debug_loclists`
//! share one encoder: entries are grouped by code section so each group can
//! be written relative to one base address. Lists must be written before
//! `.debug_addr`, since v5 encodings add base and start labels to the
//! address pool.

use crate::core::{DebugModule, DebugSection, EmitOptions, Label, Result, SectionId, UnitId};
use crate::data::AddressPool;
use crate::dwarf::tree::EntityTree;
use crate::dwarf::unit::RangeList;
use crate::emit::sink::DebugSink;
use crate::emit::unit_length::UnitLength;
use gimli::constants::*;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One list entry; location entries carry their expression
struct ListItem<'a> {
    begin: Label,
    end: Label,
    payload: Option<&'a [u8]>,
}

/// Encoding opcodes of one list flavour
struct ListOpcodes {
    base_addressx: u8,
    offset_pair: u8,
    startx_length: u8,
    end_of_list: u8,
}

const RANGE_OPCODES: ListOpcodes = ListOpcodes {
    base_addressx: DW_RLE_base_addressx.0,
    offset_pair: DW_RLE_offset_pair.0,
    startx_length: DW_RLE_startx_length.0,
    end_of_list: DW_RLE_end_of_list.0,
};

const LOC_OPCODES: ListOpcodes = ListOpcodes {
    base_addressx: DW_LLE_base_addressx.0,
    offset_pair: DW_LLE_offset_pair.0,
    startx_length: DW_LLE_startx_length.0,
    end_of_list: DW_LLE_end_of_list.0,
};

/// State shared by every list of one table
struct ListWriter<'a> {
    options: &'a EmitOptions,
    addr_pool: &'a mut AddressPool,
    section_labels: &'a BTreeMap<u32, Label>,
}

impl ListWriter<'_> {
    fn emit_payload(&self, sink: &mut dyn DebugSink, payload: &[u8]) -> Result<()> {
        if self.options.version() >= 5 {
            sink.emit_uleb128(payload.len() as u64)?;
            return sink.emit_bytes(payload);
        }
        if payload.len() > u16::MAX as usize {
            warn!(
                "Location expression of {} bytes does not fit a pre-v5 entry, dropping it",
                payload.len()
            );
            return sink.emit_u16(0);
        }
        sink.emit_u16(payload.len() as u16)?;
        sink.emit_bytes(payload)
    }

    /// Writes one list. `cu_base` is the unit's base address, if it has a
    /// single contiguous range.
    fn emit_list(
        &mut self,
        sink: &mut dyn DebugSink,
        items: &[ListItem],
        cu_base: Option<Label>,
        use_base: bool,
        opcodes: &ListOpcodes,
    ) -> Result<()> {
        let v5 = self.options.version() >= 5;
        let size = self.options.address_size();

        // Group by code section, keeping first-seen order
        let mut groups: Vec<(Option<SectionId>, Vec<&ListItem>)> = Vec::new();
        for item in items {
            let section = sink.bound_position(item.begin).map(|(section, _)| section);
            match groups.iter_mut().find(|(s, _)| *s == section) {
                Some((_, members)) => members.push(item),
                None => groups.push((section, vec![item])),
            }
        }

        let mut base_is_set = false;
        for (section, members) in groups {
            let mut base = cu_base;
            if base.is_none() && use_base {
                let new_base = match section {
                    Some(SectionId::Text(idx)) => self.section_labels.get(&idx).copied(),
                    _ => None,
                };
                if let Some(new_base) = new_base {
                    if !v5 {
                        base = Some(new_base);
                        base_is_set = true;
                        sink.emit_int(u64::MAX, size)?;
                        sink.emit_label_address(new_base, size)?;
                    } else if new_base != members[0].begin || members.len() > 1 {
                        base = Some(new_base);
                        base_is_set = true;
                        sink.emit_u8(opcodes.base_addressx)?;
                        let index = self.addr_pool.index(new_base, false);
                        sink.emit_uleb128(index as u64)?;
                    }
                }
            } else if base.is_none() && base_is_set && !v5 {
                // Back to absolute addresses
                base_is_set = false;
                sink.emit_int(u64::MAX, size)?;
                sink.emit_int(0, size)?;
            }

            for item in members {
                match base {
                    Some(base) if v5 => {
                        sink.emit_u8(opcodes.offset_pair)?;
                        sink.emit_label_difference_uleb(item.begin, base)?;
                        sink.emit_label_difference_uleb(item.end, base)?;
                    }
                    Some(base) => {
                        sink.emit_label_difference(item.begin, base, size)?;
                        sink.emit_label_difference(item.end, base, size)?;
                    }
                    None if v5 => {
                        sink.emit_u8(opcodes.startx_length)?;
                        let index = self.addr_pool.index(item.begin, false);
                        sink.emit_uleb128(index as u64)?;
                        sink.emit_label_difference_uleb(item.end, item.begin)?;
                    }
                    None => {
                        sink.emit_label_address(item.begin, size)?;
                        sink.emit_label_address(item.end, size)?;
                    }
                }
                if let Some(payload) = item.payload {
                    self.emit_payload(sink, payload)?;
                }
            }
        }

        if v5 {
            sink.emit_u8(opcodes.end_of_list)
        } else {
            sink.emit_int(0, size)?;
            sink.emit_int(0, size)
        }
    }
}

/// v5 list table header followed by the offsets of each list from `base`
fn emit_table_header(
    sink: &mut dyn DebugSink,
    options: &EmitOptions,
    length: &UnitLength,
    base: Label,
    lists: &[Label],
) -> Result<()> {
    length.emit_start(sink, options)?;
    sink.emit_u16(options.version())?;
    sink.emit_u8(options.address_size())?;
    // segment selector size
    sink.emit_u8(0)?;
    sink.emit_u32(lists.len() as u32)?;
    sink.bind_label(base)?;
    for label in lists {
        sink.emit_label_difference(*label, base, options.offset_size())?;
    }
    Ok(())
}

impl EntityTree {
    /// Base address a list of `unit` is written relative to
    fn list_base(&self, unit: UnitId) -> Option<Label> {
        self.unit(unit).base_address
    }

    /// Range lists of both unit files
    pub fn emit_range_lists(&mut self, module: &DebugModule, sink: &mut dyn DebugSink) -> Result<()> {
        for skeletons in [false, true] {
            let file = if skeletons { &self.skeletons } else { &self.info };
            if file.range_lists.is_empty() {
                continue;
            }
            let lists: Vec<RangeList> = file.range_lists.clone();
            let section = file.rnglists_section(&self.options);
            let base_label = file.rnglists_base;
            self.emit_range_table(module, sink, section, base_label, &lists)?;
        }
        Ok(())
    }

    fn emit_range_table(
        &mut self,
        module: &DebugModule,
        sink: &mut dyn DebugSink,
        section: DebugSection,
        base_label: Label,
        lists: &[RangeList],
    ) -> Result<()> {
        let v5 = self.options.version() >= 5;
        sink.switch_section(SectionId::Debug(section));
        let length = UnitLength::new(&mut self.labels);
        if v5 {
            let labels: Vec<Label> = lists.iter().map(|l| l.label).collect();
            emit_table_header(sink, &self.options, &length, base_label, &labels)?;
        } else {
            sink.bind_label(base_label)?;
        }

        let mut bases = Vec::with_capacity(lists.len());
        for list in lists {
            let ranges_base = match self.unit(list.unit).source {
                Some(cu) => module.compile_unit(cu)?.ranges_base_address,
                None => false,
            };
            bases.push((self.list_base(list.unit), ranges_base || v5));
        }
        let mut writer = ListWriter {
            options: &self.options,
            addr_pool: &mut self.addr_pool,
            section_labels: &self.section_labels,
        };
        for (list, (cu_base, use_base)) in lists.iter().zip(bases) {
            sink.bind_label(list.label)?;
            let items: Vec<ListItem> = list
                .ranges
                .iter()
                .map(|r| ListItem {
                    begin: r.begin,
                    end: r.end,
                    payload: None,
                })
                .collect();
            writer.emit_list(sink, &items, cu_base, use_base, &RANGE_OPCODES)?;
        }
        if v5 {
            length.emit_end(sink)?;
        }
        debug!("Emitted {} range lists into {}", lists.len(), section.name());
        Ok(())
    }

    /// Location lists of the whole module
    pub fn emit_loc_lists(&mut self, sink: &mut dyn DebugSink) -> Result<()> {
        if self.loc_stream.is_empty() {
            return Ok(());
        }
        let v5 = self.options.version() >= 5;
        let split = self.options.use_split_dwarf();
        if split && !v5 {
            return self.emit_loc_dwo(sink);
        }
        let section = match (v5, split) {
            (true, true) => DebugSection::LoclistsDwo,
            (true, false) => DebugSection::Loclists,
            _ => DebugSection::Loc,
        };
        sink.switch_section(SectionId::Debug(section));
        let lists = self.loc_stream.lists().to_vec();
        let length = UnitLength::new(&mut self.labels);
        if v5 {
            let labels: Vec<Label> = lists.iter().map(|l| l.label).collect();
            let base = self.loc_stream.base_label();
            emit_table_header(sink, &self.options, &length, base, &labels)?;
        }

        let bases: Vec<Option<Label>> = lists.iter().map(|l| self.list_base(l.unit)).collect();
        let mut writer = ListWriter {
            options: &self.options,
            addr_pool: &mut self.addr_pool,
            section_labels: &self.section_labels,
        };
        for (list, cu_base) in lists.iter().zip(bases) {
            sink.bind_label(list.label)?;
            let items: Vec<ListItem> = list
                .entries
                .iter()
                .map(|e| ListItem {
                    begin: e.begin,
                    end: e.end,
                    payload: Some(e.expr.as_slice()),
                })
                .collect();
            writer.emit_list(sink, &items, cu_base, true, &LOC_OPCODES)?;
        }
        if v5 {
            length.emit_end(sink)?;
        }
        debug!("Emitted {} location lists into {}", lists.len(), section.name());
        Ok(())
    }

    /// Pre-standard split lists: only `startx_length` entries with a fixed
    /// 4-byte length
    fn emit_loc_dwo(&mut self, sink: &mut dyn DebugSink) -> Result<()> {
        sink.switch_section(SectionId::Debug(DebugSection::LocDwo));
        let lists = self.loc_stream.lists().to_vec();
        for list in &lists {
            sink.bind_label(list.label)?;
            for entry in &list.entries {
                sink.emit_u8(DW_LLE_startx_length.0)?;
                let index = self.addr_pool.index(entry.begin, false);
                sink.emit_uleb128(index as u64)?;
                sink.emit_label_difference(entry.end, entry.begin, 4)?;
                if entry.expr.len() > u16::MAX as usize {
                    warn!("Dropping oversized location expression in split list");
                    sink.emit_u16(0)?;
                } else {
                    sink.emit_u16(entry.expr.len() as u16)?;
                    sink.emit_bytes(&entry.expr)?;
                }
            }
            sink.emit_u8(DW_LLE_end_of_list.0)?;
        }
        debug!("Emitted {} split location lists", lists.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EmitterConfig, RangeSpan};
    use crate::emit::sink::MemorySink;
    use gimli::RunTimeEndian;
    use pretty_assertions::assert_eq;

    /// Two functions in one text section: [0x0, 0x10) and [0x20, 0x30)
    fn text(sink: &mut MemorySink) -> [Label; 4] {
        let labels = [Label(1000), Label(1001), Label(1002), Label(1003)];
        sink.switch_section(SectionId::Text(0));
        sink.bind_label(labels[0]).unwrap();
        sink.emit_fill(0x10, 0).unwrap();
        sink.bind_label(labels[1]).unwrap();
        sink.emit_fill(0x10, 0).unwrap();
        sink.bind_label(labels[2]).unwrap();
        sink.emit_fill(0x10, 0).unwrap();
        sink.bind_label(labels[3]).unwrap();
        labels
    }

    fn write(version: u16, cu_base: Option<Label>) -> Vec<u8> {
        let options = EmitterConfig::with_version(version).resolve().unwrap();
        let mut sink = MemorySink::new(RunTimeEndian::Little);
        let [a, b, c, d] = text(&mut sink);
        let mut pool = AddressPool::new(Label(2000));
        let mut section_labels = BTreeMap::new();
        section_labels.insert(0, a);
        let mut writer = ListWriter {
            options: &options,
            addr_pool: &mut pool,
            section_labels: &section_labels,
        };
        let ranges = [RangeSpan { begin: a, end: b }, RangeSpan { begin: c, end: d }];
        let items: Vec<ListItem> = ranges
            .iter()
            .map(|r| ListItem {
                begin: r.begin,
                end: r.end,
                payload: None,
            })
            .collect();
        sink.switch_section(SectionId::Debug(DebugSection::Ranges));
        writer
            .emit_list(&mut sink, &items, cu_base, version >= 5, &RANGE_OPCODES)
            .unwrap();
        let output = sink.finish().unwrap();
        output
            .section_data(SectionId::Debug(DebugSection::Ranges))
            .to_vec()
    }

    #[test]
    fn test_v4_ranges_are_absolute_without_base() {
        let data = write(4, None);
        let words: Vec<u64> = data
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words, vec![0x0, 0x10, 0x20, 0x30, 0, 0]);
    }

    #[test]
    fn test_v4_ranges_relative_to_unit_base() {
        let data = write(4, Some(Label(1000)));
        let words: Vec<u64> = data
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words, vec![0x0, 0x10, 0x20, 0x30, 0, 0]);
    }

    #[test]
    fn test_v5_ranges_use_section_base() {
        let data = write(5, None);
        // base_addressx 0, then two offset pairs with padded ULEB deltas
        assert_eq!(data[0], DW_RLE_base_addressx.0);
        assert_eq!(data[1], 0);
        assert_eq!(data[2], DW_RLE_offset_pair.0);
        assert_eq!(*data.last().unwrap(), DW_RLE_end_of_list.0);
        assert_eq!(data.len(), 2 + 2 * (1 + 4 + 4) + 1);
    }
}
