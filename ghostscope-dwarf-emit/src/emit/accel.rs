//! Accelerator tables: `.debug_names` and the Apple hashed tables
//!
//! Names are collected while the entity tree is built and only turned into
//! bytes after layout, when every entry has its final offset.

use crate::core::{AccelTableKind, DebugSection, DieRef, Label, Result, SectionId, UnitId};
use crate::dwarf::tree::EntityTree;
use crate::dwarf::unit::UnitKind;
use crate::emit::sink::DebugSink;
use crate::emit::unit_length::UnitLength;
use gimli::constants::*;
use gimli::{DwForm, DwTag};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

const APPLE_HASH_MAGIC: u32 = 0x4841_5348;
const APPLE_HASH_DJB: u16 = 0;
const APPLE_EMPTY_BUCKET: u32 = u32::MAX;
const AUGMENTATION: &[u8; 8] = b"LLVM0700";

// Apple table atoms
const ATOM_DIE_OFFSET: u16 = 1;
const ATOM_DIE_TAG: u16 = 3;
const ATOM_TYPE_FLAGS: u16 = 5;

/// Names mapped to the entries they label, deduplicated by name
#[derive(Debug, Default)]
pub struct AccelTable {
    entries: BTreeMap<String, Vec<DieRef>>,
}

impl AccelTable {
    pub fn add(&mut self, name: &str, die: DieRef) {
        let dies = self.entries.entry(name.to_string()).or_default();
        if !dies.contains(&die) {
            dies.push(die);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, name: &str) -> Option<&[DieRef]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[DieRef])> {
        self.entries
            .iter()
            .map(|(name, dies)| (name.as_str(), dies.as_slice()))
    }
}

#[derive(Debug, Default)]
pub struct AccelTables {
    pub names: AccelTable,
    pub types: AccelTable,
    pub namespaces: AccelTable,
}

/// Bernstein hash used by both table kinds
pub fn djb_hash(name: &str) -> u32 {
    name.bytes()
        .fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(b as u32))
}

fn bucket_count(unique_hashes: usize) -> u32 {
    let n = unique_hashes as u32;
    if n > 1024 {
        n / 4
    } else if n > 16 {
        n / 2
    } else {
        n.max(1)
    }
}

/// One name ready for emission: hash, string offset and live entries
struct HashedName {
    hash: u32,
    name: String,
    str_offset: u64,
    dies: Vec<DieRef>,
}

/// Orders names by bucket then hash and returns the bucket start indices
fn bucketize(names: &mut [HashedName]) -> (u32, Vec<Option<usize>>) {
    let mut unique: Vec<u32> = names.iter().map(|n| n.hash).collect();
    unique.sort_unstable();
    unique.dedup();
    let count = bucket_count(unique.len());
    names.sort_by(|a, b| {
        (a.hash % count, a.hash, &a.name).cmp(&(b.hash % count, b.hash, &b.name))
    });
    let mut buckets = vec![None; count as usize];
    for (idx, name) in names.iter().enumerate() {
        let slot = &mut buckets[(name.hash % count) as usize];
        if slot.is_none() {
            *slot = Some(idx);
        }
    }
    (count, buckets)
}

impl EntityTree {
    /// Live unit of an indexed entry, `None` if the entry was dropped
    fn accel_unit(&self, die: DieRef) -> Option<UnitId> {
        let unit = self.arena.get(die).unit?;
        (!self.is_suppressed(unit)).then_some(unit)
    }

    fn hashed_names<'a>(
        &mut self,
        tables: impl Iterator<Item = (&'a str, &'a [DieRef])>,
    ) -> Vec<HashedName> {
        let mut out = Vec::new();
        for (name, dies) in tables {
            let live: Vec<DieRef> = dies
                .iter()
                .copied()
                .filter(|d| self.accel_unit(*d).is_some())
                .collect();
            if live.is_empty() {
                continue;
            }
            let str_offset = self.primary_strings_mut().entry(name).offset;
            out.push(HashedName {
                hash: djb_hash(name),
                name: name.to_string(),
                str_offset,
                dies: live,
            });
        }
        out
    }

    /// String pool of the primary output file
    pub(crate) fn primary_strings_mut(&mut self) -> &mut crate::data::StringPool {
        if self.options.use_split_dwarf() {
            &mut self.skeletons.strings
        } else {
            &mut self.info.strings
        }
    }

    fn primary_str_section(&self) -> SectionId {
        let pool = if self.options.use_split_dwarf() {
            &self.skeletons.strings
        } else {
            &self.info.strings
        };
        SectionId::Debug(pool.str_section())
    }

    /// Writes the accelerator tables selected by the configuration
    pub fn emit_accel_tables(&mut self, sink: &mut dyn DebugSink) -> Result<()> {
        match self.options.accel_kind {
            AccelTableKind::Dwarf => self.emit_debug_names(sink),
            AccelTableKind::Apple => {
                let tables = std::mem::take(&mut self.accel);
                self.emit_apple_table(sink, DebugSection::AppleNames, &tables.names, false)?;
                self.emit_apple_table(sink, DebugSection::AppleTypes, &tables.types, true)?;
                self.emit_apple_table(
                    sink,
                    DebugSection::AppleNamespaces,
                    &tables.namespaces,
                    false,
                )?;
                self.accel = tables;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn emit_debug_names(&mut self, sink: &mut dyn DebugSink) -> Result<()> {
        let tables = std::mem::take(&mut self.accel);
        let merged = {
            let mut merged: BTreeMap<&str, Vec<DieRef>> = BTreeMap::new();
            for table in [&tables.names, &tables.types, &tables.namespaces] {
                for (name, dies) in table.iter() {
                    let entry = merged.entry(name).or_default();
                    for die in dies {
                        if !entry.contains(die) {
                            entry.push(*die);
                        }
                    }
                }
            }
            merged
        };
        let mut names = self.hashed_names(merged.iter().map(|(n, d)| (*n, d.as_slice())));
        drop(merged);
        self.accel = tables;
        if names.is_empty() {
            return Ok(());
        }
        let (count, buckets) = bucketize(&mut names);

        let compile_units: Vec<UnitId> = self
            .compile_units()
            .map(|u| u.id)
            .filter(|u| !self.is_suppressed(*u))
            .collect();
        let cu_index: HashMap<UnitId, usize> = compile_units
            .iter()
            .enumerate()
            .map(|(idx, unit)| (*unit, idx))
            .collect();
        let mut local_tus = Vec::new();
        let mut foreign_tus = Vec::new();
        for unit in &self.units {
            if self.is_suppressed(unit.id) {
                continue;
            }
            match unit.kind {
                UnitKind::Type => local_tus.push(unit.id),
                UnitKind::SplitType => foreign_tus.push(unit.signature.unwrap_or(0)),
                _ => {}
            }
        }

        // Abbreviations keyed by (tag, indexed by compile unit)
        let with_cu = compile_units.len() > 1;
        let mut abbrevs: Vec<DwTag> = Vec::new();
        for name in &names {
            for die in &name.dies {
                let tag = self.arena.get(*die).tag;
                if !abbrevs.contains(&tag) {
                    abbrevs.push(tag);
                }
            }
        }

        let options = self.options.clone();
        let offset_size = options.offset_size();
        sink.switch_section(SectionId::Debug(DebugSection::Names));
        let length = UnitLength::new(&mut self.labels);
        length.emit_start(sink, &options)?;
        sink.emit_u16(5)?;
        // padding
        sink.emit_u16(0)?;
        sink.emit_u32(compile_units.len() as u32)?;
        sink.emit_u32(local_tus.len() as u32)?;
        sink.emit_u32(foreign_tus.len() as u32)?;
        sink.emit_u32(count)?;
        sink.emit_u32(names.len() as u32)?;
        let abbrev_bounds = UnitLength::new(&mut self.labels);
        sink.emit_label_difference(abbrev_bounds.end, abbrev_bounds.start, 4)?;
        sink.emit_u32(AUGMENTATION.len() as u32)?;
        sink.emit_bytes(AUGMENTATION)?;

        for unit in &compile_units {
            let label = self.unit(self.skeleton_or_self(*unit)).label;
            sink.emit_section_offset(label, offset_size)?;
        }
        for unit in &local_tus {
            sink.emit_section_offset(self.unit(*unit).label, offset_size)?;
        }
        for signature in &foreign_tus {
            sink.emit_u64(*signature)?;
        }
        for bucket in &buckets {
            sink.emit_u32(bucket.map(|idx| idx as u32 + 1).unwrap_or(0))?;
        }
        for name in &names {
            sink.emit_u32(name.hash)?;
        }
        let str_section = self.primary_str_section();
        for name in &names {
            sink.emit_section_relative(str_section, name.str_offset, offset_size)?;
        }
        let pool_start = self.labels.create();
        let name_labels: Vec<Label> = names.iter().map(|_| self.labels.create()).collect();
        for label in &name_labels {
            sink.emit_label_difference(*label, pool_start, offset_size)?;
        }

        sink.bind_label(abbrev_bounds.start)?;
        for (idx, tag) in abbrevs.iter().enumerate() {
            sink.emit_uleb128(idx as u64 + 1)?;
            sink.emit_uleb128(tag.0 as u64)?;
            if with_cu {
                sink.emit_uleb128(DW_IDX_compile_unit.0 as u64)?;
                sink.emit_uleb128(DW_FORM_udata.0 as u64)?;
            }
            sink.emit_uleb128(DW_IDX_die_offset.0 as u64)?;
            sink.emit_uleb128(DW_FORM_ref4.0 as u64)?;
            sink.emit_uleb128(0)?;
            sink.emit_uleb128(0)?;
        }
        sink.emit_uleb128(0)?;
        abbrev_bounds.emit_end(sink)?;

        sink.bind_label(pool_start)?;
        for (name, label) in names.iter().zip(&name_labels) {
            sink.bind_label(*label)?;
            for die in &name.dies {
                let entry = self.arena.get(*die);
                let code = abbrevs.iter().position(|t| *t == entry.tag).unwrap_or(0) + 1;
                sink.emit_uleb128(code as u64)?;
                if with_cu {
                    let unit = entry.unit.unwrap_or(UnitId(0));
                    sink.emit_uleb128(cu_index.get(&unit).copied().unwrap_or(0) as u64)?;
                }
                sink.emit_u32(entry.offset as u32)?;
            }
            sink.emit_uleb128(0)?;
        }
        length.emit_end(sink)?;
        debug!(
            "Emitted .debug_names: {} names, {} buckets, {} compile units",
            names.len(),
            count,
            compile_units.len()
        );
        Ok(())
    }

    fn emit_apple_table(
        &mut self,
        sink: &mut dyn DebugSink,
        section: DebugSection,
        table: &AccelTable,
        with_type_atoms: bool,
    ) -> Result<()> {
        let mut names = self.hashed_names(table.iter());
        let (count, _) = bucketize(&mut names);

        let mut atoms: Vec<(u16, DwForm)> = vec![(ATOM_DIE_OFFSET, DW_FORM_data4)];
        if with_type_atoms {
            atoms.push((ATOM_DIE_TAG, DW_FORM_data2));
            atoms.push((ATOM_TYPE_FLAGS, DW_FORM_data1));
        }

        // Distinct hashes in bucket order, each with its names
        let mut groups: Vec<(u32, Vec<usize>)> = Vec::new();
        for (idx, name) in names.iter().enumerate() {
            match groups.last_mut() {
                Some((hash, members)) if *hash == name.hash => members.push(idx),
                _ => groups.push((name.hash, vec![idx])),
            }
        }
        let mut bucket_starts = vec![APPLE_EMPTY_BUCKET; count as usize];
        for (group_idx, (hash, _)) in groups.iter().enumerate() {
            let slot = &mut bucket_starts[(hash % count) as usize];
            if *slot == APPLE_EMPTY_BUCKET {
                *slot = group_idx as u32;
            }
        }

        sink.switch_section(SectionId::Debug(section));
        let start = self.labels.create();
        sink.bind_label(start)?;
        sink.emit_u32(APPLE_HASH_MAGIC)?;
        sink.emit_u16(1)?;
        sink.emit_u16(APPLE_HASH_DJB)?;
        sink.emit_u32(count)?;
        sink.emit_u32(groups.len() as u32)?;
        // header data: die offset base, atom count, atoms
        sink.emit_u32(8 + 4 * atoms.len() as u32)?;
        sink.emit_u32(0)?;
        sink.emit_u32(atoms.len() as u32)?;
        for (atom, form) in &atoms {
            sink.emit_u16(*atom)?;
            sink.emit_u16(form.0)?;
        }
        for start in &bucket_starts {
            sink.emit_u32(*start)?;
        }
        for (hash, _) in &groups {
            sink.emit_u32(*hash)?;
        }
        let data_labels: Vec<Label> = groups.iter().map(|_| self.labels.create()).collect();
        for label in &data_labels {
            sink.emit_label_difference(*label, start, 4)?;
        }

        for ((_, members), label) in groups.iter().zip(&data_labels) {
            sink.bind_label(*label)?;
            for idx in members {
                let name = &names[*idx];
                sink.emit_u32(name.str_offset as u32)?;
                sink.emit_u32(name.dies.len() as u32)?;
                for die in &name.dies {
                    let entry = self.arena.get(*die);
                    let unit_offset = entry.unit.map(|u| self.unit(u).offset).unwrap_or(0);
                    sink.emit_u32((unit_offset + entry.offset) as u32)?;
                    if with_type_atoms {
                        sink.emit_u16(entry.tag.0)?;
                        sink.emit_u8(0)?;
                    }
                }
            }
            sink.emit_u32(0)?;
        }
        trace!("Emitted {} with {} names", section.name(), names.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_djb_hash() {
        assert_eq!(djb_hash(""), 5381);
        assert_eq!(djb_hash("a"), 5381 * 33 + 97);
        assert_eq!(djb_hash("main"), 0x7c9a_7f6a);
    }

    #[test]
    fn test_bucket_counts() {
        assert_eq!(bucket_count(0), 1);
        assert_eq!(bucket_count(16), 16);
        assert_eq!(bucket_count(17), 8);
        assert_eq!(bucket_count(2048), 512);
    }

    #[test]
    fn test_table_dedups_names_and_entries() {
        let mut table = AccelTable::default();
        table.add("main", DieRef(1));
        table.add("main", DieRef(1));
        table.add("main", DieRef(2));
        table.add("argc", DieRef(3));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("main"), Some(&[DieRef(1), DieRef(2)][..]));
    }
}
