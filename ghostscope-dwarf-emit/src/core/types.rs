//! Handle types shared across the emitter
//!
//! Every metadata node, machine-level entity and output label is addressed by a
//! small copyable index rather than a reference, so the entity graph can be
//! arena-owned and cross-linked without lifetimes.

use std::fmt;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

define_handle!(
    /// Source file descriptor
    FileId
);
define_handle!(
    /// Source-level compile unit
    CompileUnitId
);
define_handle!(
    /// Any debug scope: subprogram, lexical block, namespace
    ScopeId
);
define_handle!(SubprogramId);
define_handle!(
    /// Local variable or parameter declaration
    VariableId
);
define_handle!(DebugLabelId);
define_handle!(TypeId);
define_handle!(GlobalVariableId);
define_handle!(
    /// Inlined-at call location
    InlinedAtId
);
define_handle!(
    /// Machine basic block, indexed in layout order
    BlockId
);
define_handle!(
    /// Machine instruction, indexed in layout order across the whole function
    InstrId
);

define_handle!(
    /// Output unit (compile, skeleton or type unit)
    UnitId
);
define_handle!(
    /// Debug entry in the module-wide entry arena
    DieRef
);

/// Physical machine register number (target numbering, not DWARF numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(pub u16);

/// Output symbol. Labels are write-once: the sink binds each one to a
/// position exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".Ltmp{}", self.0)
    }
}

/// Output section identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionId {
    /// Code section, indexed by the sink in creation order
    Text(u32),
    Debug(DebugSection),
}

/// Every debug section the emitter can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DebugSection {
    Info,
    Abbrev,
    Str,
    StrOffsets,
    Line,
    Loc,
    Loclists,
    Ranges,
    Rnglists,
    Addr,
    Aranges,
    Types,
    Pubnames,
    Pubtypes,
    GnuPubnames,
    GnuPubtypes,
    Macinfo,
    Macro,
    Names,
    AppleNames,
    AppleTypes,
    AppleNamespaces,
    InfoDwo,
    AbbrevDwo,
    StrDwo,
    StrOffsetsDwo,
    LineDwo,
    LocDwo,
    LoclistsDwo,
    RnglistsDwo,
    TypesDwo,
    MacinfoDwo,
    MacroDwo,
}

impl DebugSection {
    pub fn name(self) -> &'static str {
        match self {
            DebugSection::Info => ".debug_info",
            DebugSection::Abbrev => ".debug_abbrev",
            DebugSection::Str => ".debug_str",
            DebugSection::StrOffsets => ".debug_str_offsets",
            DebugSection::Line => ".debug_line",
            DebugSection::Loc => ".debug_loc",
            DebugSection::Loclists => ".debug_loclists",
            DebugSection::Ranges => ".debug_ranges",
            DebugSection::Rnglists => ".debug_rnglists",
            DebugSection::Addr => ".debug_addr",
            DebugSection::Aranges => ".debug_aranges",
            DebugSection::Types => ".debug_types",
            DebugSection::Pubnames => ".debug_pubnames",
            DebugSection::Pubtypes => ".debug_pubtypes",
            DebugSection::GnuPubnames => ".debug_gnu_pubnames",
            DebugSection::GnuPubtypes => ".debug_gnu_pubtypes",
            DebugSection::Macinfo => ".debug_macinfo",
            DebugSection::Macro => ".debug_macro",
            DebugSection::Names => ".debug_names",
            DebugSection::AppleNames => ".apple_names",
            DebugSection::AppleTypes => ".apple_types",
            DebugSection::AppleNamespaces => ".apple_namespac",
            DebugSection::InfoDwo => ".debug_info.dwo",
            DebugSection::AbbrevDwo => ".debug_abbrev.dwo",
            DebugSection::StrDwo => ".debug_str.dwo",
            DebugSection::StrOffsetsDwo => ".debug_str_offsets.dwo",
            DebugSection::LineDwo => ".debug_line.dwo",
            DebugSection::LocDwo => ".debug_loc.dwo",
            DebugSection::LoclistsDwo => ".debug_loclists.dwo",
            DebugSection::RnglistsDwo => ".debug_rnglists.dwo",
            DebugSection::TypesDwo => ".debug_types.dwo",
            DebugSection::MacinfoDwo => ".debug_macinfo.dwo",
            DebugSection::MacroDwo => ".debug_macro.dwo",
        }
    }

    /// Sections that belong in the split-debug companion file
    pub fn is_dwo(self) -> bool {
        matches!(
            self,
            DebugSection::InfoDwo
                | DebugSection::AbbrevDwo
                | DebugSection::StrDwo
                | DebugSection::StrOffsetsDwo
                | DebugSection::LineDwo
                | DebugSection::LocDwo
                | DebugSection::LoclistsDwo
                | DebugSection::RnglistsDwo
                | DebugSection::TypesDwo
                | DebugSection::MacinfoDwo
                | DebugSection::MacroDwo
        )
    }

    /// Sections holding NUL-terminated strings (mergeable in the object file)
    pub fn is_strings(self) -> bool {
        matches!(self, DebugSection::Str | DebugSection::StrDwo)
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionId::Text(idx) => write!(f, ".text#{}", idx),
            SectionId::Debug(section) => f.write_str(section.name()),
        }
    }
}

/// A half-open address range expressed with labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpan {
    pub begin: Label,
    pub end: Label,
}
