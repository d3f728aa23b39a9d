//! `.debug_aranges`: per compile unit, the address spans it covers

use crate::core::{DebugSection, Label, Result, SectionId, UnitId};
use crate::dwarf::tree::EntityTree;
use crate::emit::sink::DebugSink;
use crate::emit::unit_length::{emit_fixed_length, initial_length_size};
use std::collections::BTreeMap;
use tracing::debug;

const ARANGES_VERSION: u16 = 2;

/// `end` is `None` for a symbol outside any emitted section; such spans
/// cover one byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArangeSpan {
    start: Label,
    end: Option<Label>,
}

impl EntityTree {
    /// Builds the longest same-unit spans out of the recorded labels
    fn arange_spans(&self, sink: &dyn DebugSink) -> BTreeMap<UnitId, Vec<ArangeSpan>> {
        let mut by_section: BTreeMap<u32, Vec<(u64, UnitId, Label)>> = BTreeMap::new();
        let mut spans: BTreeMap<UnitId, Vec<ArangeSpan>> = BTreeMap::new();
        for (unit, label) in &self.arange_labels {
            match sink.bound_position(*label) {
                Some((SectionId::Text(idx), offset)) => {
                    let list = by_section.entry(idx).or_default();
                    if !list.iter().any(|(_, u, l)| u == unit && l == label) {
                        list.push((offset, *unit, *label));
                    }
                }
                _ => {
                    let list = spans.entry(*unit).or_default();
                    let span = ArangeSpan {
                        start: *label,
                        end: None,
                    };
                    if !list.contains(&span) {
                        list.push(span);
                    }
                }
            }
        }

        for (idx, mut list) in by_section {
            list.sort_by_key(|(offset, _, _)| *offset);
            let Some(end) = self.section_ends.get(&idx).copied() else {
                continue;
            };
            let mut start = list[0].2;
            for n in 1..=list.len() {
                let prev_unit = list[n - 1].1;
                let (cur_unit, cur_label) = match list.get(n) {
                    Some((_, unit, label)) => (Some(*unit), *label),
                    None => (None, end),
                };
                if cur_unit != Some(prev_unit) {
                    spans.entry(prev_unit).or_default().push(ArangeSpan {
                        start,
                        end: Some(cur_label),
                    });
                    start = cur_label;
                }
            }
        }
        spans
    }

    /// Writes one address range table per unit that has code or data
    pub fn emit_aranges(&self, sink: &mut dyn DebugSink) -> Result<()> {
        let spans = self.arange_spans(sink);
        if spans.is_empty() {
            return Ok(());
        }
        let options = &self.options;
        let address_size = options.address_size();
        let tuple = 2 * address_size as u64;
        sink.switch_section(SectionId::Debug(DebugSection::Aranges));

        for (unit, list) in &spans {
            let target = self.skeleton_or_self(*unit);
            if self.is_suppressed(target) {
                continue;
            }
            let mut content = 2 + options.offset_size() as u64 + 2;
            let padding = (tuple - (initial_length_size(options) + content) % tuple) % tuple;
            content += padding + (list.len() as u64 + 1) * tuple;

            emit_fixed_length(sink, options, content)?;
            sink.emit_u16(ARANGES_VERSION)?;
            sink.emit_section_offset(self.unit(target).label, options.offset_size())?;
            sink.emit_u8(address_size)?;
            // segment selector size
            sink.emit_u8(0)?;
            sink.emit_fill(padding, 0xff)?;
            for span in list {
                sink.emit_label_address(span.start, address_size)?;
                match span.end {
                    Some(end) => sink.emit_label_difference(end, span.start, address_size)?,
                    None => sink.emit_int(1, address_size)?,
                }
            }
            sink.emit_int(0, address_size)?;
            sink.emit_int(0, address_size)?;
            debug!("Emitted {} address ranges for unit {}", list.len(), target.0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CompileUnitMeta, DebugModule, EmitterConfig, FileEntry, GenericTarget};
    use crate::emit::sink::MemorySink;
    use gimli::constants::DW_LANG_C99;
    use gimli::RunTimeEndian;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_spans_merge_within_a_unit() {
        let mut module = DebugModule::new();
        let file = module.add_file(FileEntry::new("a.c", "/src"));
        let (a, _) = module.add_compile_unit(CompileUnitMeta::new(file, DW_LANG_C99, "cc"));
        let (b, _) = module.add_compile_unit(CompileUnitMeta::new(file, DW_LANG_C99, "cc"));
        let options = EmitterConfig::with_version(4).resolve().unwrap();
        let mut tree = EntityTree::new(options, Arc::new(GenericTarget::x86_64()));
        let ua = tree.get_or_create_compile_unit(&module, a).unwrap();
        let ub = tree.get_or_create_compile_unit(&module, b).unwrap();

        let mut sink = MemorySink::new(RunTimeEndian::Little);
        sink.switch_section(SectionId::Text(0));
        let labels: Vec<Label> = (0..4).map(|_| tree.labels.create()).collect();
        for label in &labels[..3] {
            sink.bind_label(*label).unwrap();
            sink.emit_fill(8, 0).unwrap();
        }
        sink.bind_label(labels[3]).unwrap();
        tree.section_ends.insert(0, labels[3]);
        tree.arange_labels = vec![(ua, labels[0]), (ua, labels[1]), (ub, labels[2])];

        let spans = tree.arange_spans(&sink);
        assert_eq!(
            spans[&ua],
            vec![ArangeSpan {
                start: labels[0],
                end: Some(labels[2])
            }]
        );
        assert_eq!(
            spans[&ub],
            vec![ArangeSpan {
                start: labels[2],
                end: Some(labels[3])
            }]
        );
    }
}
