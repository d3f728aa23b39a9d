//! Label allocation and per-instruction label requests
//!
//! Analyses ask for "a label before/after instruction I"; the driver asks the
//! registry which labels to bind as it emits each instruction.

use crate::core::{InstrId, Label};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Module-wide label allocator. Named symbols are memoized so every
/// reference to one symbol shares a label.
#[derive(Debug, Default)]
pub struct LabelAllocator {
    next: u32,
    symbols: HashMap<String, Label>,
}

impl LabelAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self) -> Label {
        let label = Label(self.next);
        self.next += 1;
        label
    }

    /// Returns the label for a named symbol and whether it was just created
    pub fn symbol(&mut self, name: &str) -> (Label, bool) {
        if let Some(label) = self.symbols.get(name) {
            return (*label, false);
        }
        let label = self.create();
        self.symbols.insert(name.to_string(), label);
        (label, true)
    }

    pub fn allocated(&self) -> u32 {
        self.next
    }
}

/// Labels of one function's code
#[derive(Debug, Clone)]
pub struct FunctionLabels {
    pub begin: Label,
    pub end: Label,
    /// Begin/end of each basic-block section the function occupies
    pub sections: BTreeMap<u32, (Label, Label)>,
}

impl FunctionLabels {
    pub fn section_range(&self, section: u32) -> Option<(Label, Label)> {
        self.sections.get(&section).copied()
    }
}

/// Per-function label requests and their resolution
#[derive(Debug, Default)]
pub struct LabelRegistry {
    before: HashMap<InstrId, Option<Label>>,
    after: HashMap<InstrId, Option<Label>>,
    /// Label bound since the last real instruction, reusable by the next
    /// request
    prev_label: Option<Label>,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_before(&mut self, instr: InstrId) {
        self.before.entry(instr).or_insert(None);
    }

    pub fn request_after(&mut self, instr: InstrId) {
        self.after.entry(instr).or_insert(None);
    }

    /// Pins the before-label of `instr` to an existing label
    pub fn force_before(&mut self, instr: InstrId, label: Label) {
        self.before.insert(instr, Some(label));
    }

    pub fn label_before(&self, instr: InstrId) -> Option<Label> {
        self.before.get(&instr).copied().flatten()
    }

    pub fn label_after(&self, instr: InstrId) -> Option<Label> {
        self.after.get(&instr).copied().flatten()
    }

    /// Resolves the before-label of `instr` as it is emitted. Returns a label
    /// the caller must bind at the current position, if a new one is needed.
    pub fn begin_instruction(&mut self, instr: InstrId, alloc: &mut LabelAllocator) -> Option<Label> {
        let slot = self.before.get_mut(&instr)?;
        if slot.is_some() {
            return None;
        }
        if let Some(prev) = self.prev_label {
            *slot = Some(prev);
            trace!("Reusing label {} before instruction {}", prev, instr.0);
            return None;
        }
        let label = alloc.create();
        *slot = Some(label);
        self.prev_label = Some(label);
        Some(label)
    }

    /// Resolves the after-label of `instr`; code-producing instructions
    /// invalidate the reusable previous label
    pub fn end_instruction(
        &mut self,
        instr: InstrId,
        is_meta: bool,
        alloc: &mut LabelAllocator,
    ) -> Option<Label> {
        if !is_meta {
            self.prev_label = None;
        }
        let slot = self.after.get_mut(&instr)?;
        if slot.is_some() {
            return None;
        }
        if let Some(prev) = self.prev_label {
            *slot = Some(prev);
            return None;
        }
        let label = alloc.create();
        *slot = Some(label);
        self.prev_label = Some(label);
        Some(label)
    }

    /// Forget the reusable label, e.g. after switching sections
    pub fn reset_prev_label(&mut self) {
        self.prev_label = None;
    }

    /// Makes an already bound label reusable, e.g. the function-begin label
    pub fn set_prev_label(&mut self, label: Label) {
        self.prev_label = Some(label);
    }

    /// Label bound at the current position since the last real instruction
    pub fn prev_label(&self) -> Option<Label> {
        self.prev_label
    }

    pub fn clear(&mut self) {
        self.before.clear();
        self.after.clear();
        self.prev_label = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consecutive_meta_instructions_share_label() {
        let mut alloc = LabelAllocator::new();
        let mut registry = LabelRegistry::new();
        registry.request_before(InstrId(0));
        registry.request_before(InstrId(1));
        registry.request_before(InstrId(2));

        let first = registry.begin_instruction(InstrId(0), &mut alloc);
        assert!(first.is_some());
        registry.end_instruction(InstrId(0), true, &mut alloc);
        assert_eq!(registry.begin_instruction(InstrId(1), &mut alloc), None);
        registry.end_instruction(InstrId(1), false, &mut alloc);
        let third = registry.begin_instruction(InstrId(2), &mut alloc);

        assert_eq!(registry.label_before(InstrId(0)), first);
        assert_eq!(registry.label_before(InstrId(1)), first);
        assert!(third.is_some());
        assert_ne!(third, first);
    }

    #[test]
    fn test_forced_label_is_kept() {
        let mut alloc = LabelAllocator::new();
        let begin = alloc.create();
        let mut registry = LabelRegistry::new();
        registry.request_before(InstrId(4));
        registry.force_before(InstrId(4), begin);
        assert_eq!(registry.begin_instruction(InstrId(4), &mut alloc), None);
        assert_eq!(registry.label_before(InstrId(4)), Some(begin));
    }

    #[test]
    fn test_symbols_are_memoized() {
        let mut alloc = LabelAllocator::new();
        let (a, created) = alloc.symbol("g");
        assert!(created);
        let (b, created) = alloc.symbol("g");
        assert!(!created);
        assert_eq!(a, b);
        assert_eq!(alloc.allocated(), 1);
    }
}
