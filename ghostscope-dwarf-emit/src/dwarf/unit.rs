//! Output units and the files holding them

use crate::core::{
    CompileUnitId, DebugSection, DieRef, EmitOptions, Label, RangeSpan, UnitId,
};
use crate::data::StringPool;
use crate::dwarf::abbrev::AbbrevTable;
use crate::emit::unit_length::initial_length_size;
use gimli::constants::*;
use gimli::DwUt;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Compile,
    /// Primary-file stub of a split compile unit
    Skeleton,
    /// Companion-file body of a split compile unit
    SplitCompile,
    Type,
    SplitType,
}

impl UnitKind {
    pub fn unit_type(self) -> DwUt {
        match self {
            UnitKind::Compile => DW_UT_compile,
            UnitKind::Skeleton => DW_UT_skeleton,
            UnitKind::SplitCompile => DW_UT_split_compile,
            UnitKind::Type => DW_UT_type,
            UnitKind::SplitType => DW_UT_split_type,
        }
    }

    pub fn is_type(self) -> bool {
        matches!(self, UnitKind::Type | UnitKind::SplitType)
    }

    pub fn is_dwo(self) -> bool {
        matches!(self, UnitKind::SplitCompile | UnitKind::SplitType)
    }
}

/// Range or location list owned by a unit file
#[derive(Debug, Clone)]
pub struct RangeList {
    pub label: Label,
    /// Unit whose base address the list is relative to
    pub unit: UnitId,
    pub ranges: Vec<RangeSpan>,
}

#[derive(Debug)]
pub struct Unit {
    pub id: UnitId,
    pub kind: UnitKind,
    pub root: DieRef,
    pub source: Option<CompileUnitId>,
    /// Skeleton companion of a split compile unit
    pub skeleton: Option<UnitId>,
    /// Type signature, or the dwo id of split and skeleton units
    pub signature: Option<u64>,
    /// The described type inside a type unit
    pub type_die: Option<DieRef>,
    /// Code ranges of a compile unit
    pub ranges: Vec<RangeSpan>,
    pub base_address: Option<Label>,
    /// Index of the unit's line table in the entity tree
    pub line_table: Option<usize>,
    pub global_names: BTreeMap<String, DieRef>,
    pub global_types: BTreeMap<String, DieRef>,
    /// Bound at the start of the unit's contribution
    pub label: Label,
    /// Offset within the unit's section, set by layout
    pub offset: u64,
    /// Total size including the header, set by layout
    pub length: u64,
}

impl Unit {
    pub fn new(id: UnitId, kind: UnitKind, root: DieRef, label: Label) -> Self {
        Self {
            id,
            kind,
            root,
            source: None,
            skeleton: None,
            signature: None,
            type_die: None,
            ranges: Vec::new(),
            base_address: None,
            line_table: None,
            global_names: BTreeMap::new(),
            global_types: BTreeMap::new(),
            label,
            offset: 0,
            length: 0,
        }
    }

    /// Section the unit is written to
    pub fn section(&self, options: &EmitOptions) -> DebugSection {
        match (self.kind.is_type() && options.version() < 5, self.kind.is_dwo()) {
            (true, true) => DebugSection::TypesDwo,
            (true, false) => DebugSection::Types,
            (false, true) => DebugSection::InfoDwo,
            (false, false) => DebugSection::Info,
        }
    }

    pub fn header_size(&self, options: &EmitOptions) -> u64 {
        let offset_size = options.offset_size() as u64;
        let base = initial_length_size(options) + 2 + offset_size + 1;
        if options.version() >= 5 {
            // unit_type byte
            let base = base + 1;
            match self.kind {
                UnitKind::Compile => base,
                UnitKind::Skeleton | UnitKind::SplitCompile => base + 8,
                UnitKind::Type | UnitKind::SplitType => base + 8 + offset_size,
            }
        } else if self.kind.is_type() {
            base + 8 + offset_size
        } else {
            base
        }
    }
}

/// Units sharing one abbreviation table, string pool and range-list table:
/// the primary file or the split-debug companion
#[derive(Debug)]
pub struct UnitFile {
    pub units: Vec<UnitId>,
    pub abbrev: AbbrevTable,
    pub abbrev_label: Label,
    pub strings: StringPool,
    pub range_lists: Vec<RangeList>,
    /// Base of the v5 range-list offsets table
    pub rnglists_base: Label,
    pub dwo: bool,
}

impl UnitFile {
    pub fn new(dwo: bool, abbrev_label: Label, str_offsets_base: Label, rnglists_base: Label) -> Self {
        let strings = if dwo {
            StringPool::new(
                DebugSection::StrDwo,
                DebugSection::StrOffsetsDwo,
                str_offsets_base,
            )
        } else {
            StringPool::new(DebugSection::Str, DebugSection::StrOffsets, str_offsets_base)
        };
        Self {
            units: Vec::new(),
            abbrev: AbbrevTable::new(),
            abbrev_label,
            strings,
            range_lists: Vec::new(),
            rnglists_base,
            dwo,
        }
    }

    pub fn abbrev_section(&self) -> DebugSection {
        if self.dwo {
            DebugSection::AbbrevDwo
        } else {
            DebugSection::Abbrev
        }
    }

    /// `.debug_rnglists` flavour of this file; pre-v5 lists only exist in
    /// the primary file
    pub fn rnglists_section(&self, options: &EmitOptions) -> DebugSection {
        match (options.version() >= 5, self.dwo) {
            (true, true) => DebugSection::RnglistsDwo,
            (true, false) => DebugSection::Rnglists,
            _ => DebugSection::Ranges,
        }
    }

    /// Adds a range list and returns its index in the file's table
    pub fn add_range_list(&mut self, label: Label, unit: UnitId, ranges: Vec<RangeSpan>) -> usize {
        self.range_lists.push(RangeList {
            label,
            unit,
            ranges,
        });
        self.range_lists.len() - 1
    }

    pub fn has_range_lists_of(&self, unit: UnitId) -> bool {
        self.range_lists.iter().any(|list| list.unit == unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EmitterConfig;

    #[test]
    fn test_header_sizes() {
        let v4 = EmitterConfig::with_version(4).resolve().unwrap();
        let v5 = EmitterConfig::with_version(5).resolve().unwrap();
        let cu = Unit::new(UnitId(0), UnitKind::Compile, DieRef(0), Label(0));
        let tu = Unit::new(UnitId(1), UnitKind::Type, DieRef(1), Label(1));
        let skel = Unit::new(UnitId(2), UnitKind::Skeleton, DieRef(2), Label(2));

        assert_eq!(cu.header_size(&v4), 11);
        assert_eq!(tu.header_size(&v4), 23);
        assert_eq!(cu.header_size(&v5), 12);
        assert_eq!(skel.header_size(&v5), 20);
        assert_eq!(tu.header_size(&v5), 24);
        assert_eq!(tu.section(&v4), DebugSection::Types);
        assert_eq!(tu.section(&v5), DebugSection::Info);
    }
}
