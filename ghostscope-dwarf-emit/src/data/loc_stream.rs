//! Finalized location lists awaiting serialization

use crate::core::{Label, UnitId};

/// One `[begin, end)` range with its lowered expression bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocEntry {
    pub begin: Label,
    pub end: Label,
    pub expr: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct LocList {
    /// Bound at the start of the list's contribution
    pub label: Label,
    pub unit: UnitId,
    pub entries: Vec<LocEntry>,
}

/// All location lists of a module in creation order. Lists are referenced
/// from entries by position (`DW_FORM_loclistx`) or by label.
#[derive(Debug)]
pub struct DebugLocStream {
    lists: Vec<LocList>,
    /// Base of the v5 offsets table
    base_label: Label,
}

impl DebugLocStream {
    pub fn new(base_label: Label) -> Self {
        Self {
            lists: Vec::new(),
            base_label,
        }
    }

    /// Starts a list; returns its index
    pub fn add_list(&mut self, label: Label, unit: UnitId, entries: Vec<LocEntry>) -> usize {
        self.lists.push(LocList {
            label,
            unit,
            entries,
        });
        self.lists.len() - 1
    }

    pub fn lists(&self) -> &[LocList] {
        &self.lists
    }

    pub fn list(&self, index: usize) -> Option<&LocList> {
        self.lists.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn base_label(&self) -> Label {
        self.base_label
    }

    /// Lists owned by `unit`, with their module-wide index
    pub fn lists_of(&self, unit: UnitId) -> impl Iterator<Item = (usize, &LocList)> {
        self.lists
            .iter()
            .enumerate()
            .filter(move |(_, list)| list.unit == unit)
    }
}
