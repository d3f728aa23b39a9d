//! Debug entry arena
//!
//! Every entry of every unit lives in one module-wide arena and is addressed
//! by `DieRef`. References between entries stay handles until the layout
//! pass assigns offsets, so entries may point forward, backward and across
//! units while the tree is still being built.

use crate::core::{DieRef, Label, UnitId};
use gimli::constants::*;
use gimli::{DwAt, DwForm, DwTag};

/// Location expression bytes. `addresses` lists positions of
/// address-sized placeholders that are written as label addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LocBlock {
    pub bytes: Vec<u8>,
    pub addresses: Vec<(usize, Label)>,
}

impl LocBlock {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            addresses: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_relocatable(&self) -> bool {
        !self.addresses.is_empty()
    }
}

/// How a string attribute is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrRepr {
    Inline,
    /// Offset into the unit file's string section
    Offset(u64),
    /// Slot of the unit file's string offsets table
    Index(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Udata(u64),
    Sdata(i64),
    Flag(bool),
    Str { text: String, repr: StrRepr },
    /// Reference to another entry; the form is fixed during layout
    Entry(DieRef),
    /// Type unit signature
    Signature(u64),
    Address(Label),
    AddrIndex(u32),
    LabelDelta { hi: Label, lo: Label },
    SecOffset(Label),
    Block(LocBlock),
    /// Index into a range or location list offsets table
    ListIndex(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: DwAt,
    pub form: DwForm,
    pub value: AttrValue,
}

#[derive(Debug, Clone)]
pub struct Die {
    pub tag: DwTag,
    pub attrs: Vec<Attribute>,
    pub children: Vec<DieRef>,
    pub parent: Option<DieRef>,
    /// Owning unit; `None` once a discarded speculative entry is dropped
    pub unit: Option<UnitId>,
    /// Offset from the start of the owning unit, set by layout
    pub offset: u64,
    pub size: u64,
    pub abbrev: u64,
}

impl Die {
    fn new(tag: DwTag, unit: Option<UnitId>) -> Self {
        Self {
            tag,
            attrs: Vec::new(),
            children: Vec::new(),
            parent: None,
            unit,
            offset: 0,
            size: 0,
            abbrev: 0,
        }
    }

    pub fn attr(&self, name: DwAt) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.name == name)
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn name(&self) -> Option<&str> {
        match self.attr(DW_AT_name).map(|a| &a.value) {
            Some(AttrValue::Str { text, .. }) => Some(text),
            _ => None,
        }
    }
}

/// Smallest fixed data form holding `value`
pub fn best_data_form(value: u64) -> DwForm {
    if value <= u8::MAX as u64 {
        DW_FORM_data1
    } else if value <= u16::MAX as u64 {
        DW_FORM_data2
    } else if value <= u32::MAX as u64 {
        DW_FORM_data4
    } else {
        DW_FORM_data8
    }
}

#[derive(Debug, Default)]
pub struct DieArena {
    dies: Vec<Die>,
}

impl DieArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.dies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dies.is_empty()
    }

    /// Detached entry owned by `unit`
    pub fn create(&mut self, tag: DwTag, unit: Option<UnitId>) -> DieRef {
        self.dies.push(Die::new(tag, unit));
        DieRef(self.dies.len() as u32 - 1)
    }

    /// New child of `parent`, owned by the parent's unit
    pub fn add_child(&mut self, parent: DieRef, tag: DwTag) -> DieRef {
        let unit = self.get(parent).unit;
        let child = self.create(tag, unit);
        self.adopt(parent, child);
        child
    }

    pub fn adopt(&mut self, parent: DieRef, child: DieRef) {
        if let Some(old) = self.get(child).parent {
            self.get_mut(old).children.retain(|c| *c != child);
        }
        self.get_mut(child).parent = Some(parent);
        self.get_mut(parent).children.push(child);
    }

    pub fn get(&self, die: DieRef) -> &Die {
        &self.dies[die.index()]
    }

    pub fn get_mut(&mut self, die: DieRef) -> &mut Die {
        &mut self.dies[die.index()]
    }

    pub fn add(&mut self, die: DieRef, name: DwAt, form: DwForm, value: AttrValue) {
        self.get_mut(die).attrs.push(Attribute { name, form, value });
    }

    pub fn add_udata(&mut self, die: DieRef, name: DwAt, value: u64) {
        self.add(die, name, best_data_form(value), AttrValue::Udata(value));
    }

    pub fn add_sdata(&mut self, die: DieRef, name: DwAt, value: i64) {
        self.add(die, name, DW_FORM_sdata, AttrValue::Sdata(value));
    }

    /// Stored as `flag_present`; layout downgrades it before DWARF v4
    pub fn add_flag(&mut self, die: DieRef, name: DwAt) {
        self.add(die, name, DW_FORM_flag_present, AttrValue::Flag(true));
    }

    pub fn add_entry(&mut self, die: DieRef, name: DwAt, target: DieRef) {
        self.add(die, name, DW_FORM_ref4, AttrValue::Entry(target));
    }

    pub fn add_block(&mut self, die: DieRef, name: DwAt, block: LocBlock) {
        self.add(die, name, DW_FORM_exprloc, AttrValue::Block(block));
    }

    pub fn attr(&self, die: DieRef, name: DwAt) -> Option<&Attribute> {
        self.get(die).attr(name)
    }

    pub fn has_attr(&self, die: DieRef, name: DwAt) -> bool {
        self.attr(die, name).is_some()
    }

    pub fn remove_attr(&mut self, die: DieRef, name: DwAt) {
        self.get_mut(die).attrs.retain(|a| a.name != name);
    }

    /// Entry and all its descendants in pre-order
    pub fn subtree(&self, root: DieRef) -> Vec<DieRef> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(die) = stack.pop() {
            out.push(die);
            stack.extend(self.get(die).children.iter().rev().copied());
        }
        out
    }

    /// Pre-order walk where `None` marks the null entry closing each
    /// non-empty child list
    pub fn subtree_with_ends(&self, root: DieRef) -> Vec<Option<DieRef>> {
        let mut out = Vec::new();
        let mut stack = vec![Some(root)];
        while let Some(item) = stack.pop() {
            out.push(item);
            let Some(die) = item else {
                continue;
            };
            let children = &self.get(die).children;
            if !children.is_empty() {
                stack.push(None);
                stack.extend(children.iter().rev().map(|c| Some(*c)));
            }
        }
        out
    }

    /// Drops a subtree from its unit; the entries stay allocated but are
    /// unreachable and fail any later reference check
    pub fn discard(&mut self, root: DieRef) {
        if let Some(parent) = self.get(root).parent {
            self.get_mut(parent).children.retain(|c| *c != root);
        }
        for die in self.subtree(root) {
            self.get_mut(die).unit = None;
        }
    }

    /// Nearest ancestor (or self) with the given tag
    pub fn enclosing(&self, mut die: DieRef, tag: DwTag) -> Option<DieRef> {
        loop {
            let entry = self.get(die);
            if entry.tag == tag {
                return Some(die);
            }
            die = entry.parent?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_inherit_unit() {
        let mut arena = DieArena::new();
        let root = arena.create(DW_TAG_compile_unit, Some(UnitId(3)));
        let sp = arena.add_child(root, DW_TAG_subprogram);
        let var = arena.add_child(sp, DW_TAG_variable);
        assert_eq!(arena.get(var).unit, Some(UnitId(3)));
        assert_eq!(arena.subtree(root), vec![root, sp, var]);
        assert_eq!(
            arena.subtree_with_ends(root),
            vec![Some(root), Some(sp), Some(var), None, None]
        );
        assert_eq!(arena.enclosing(var, DW_TAG_subprogram), Some(sp));
    }

    #[test]
    fn test_discard_detaches_subtree() {
        let mut arena = DieArena::new();
        let root = arena.create(DW_TAG_type_unit, Some(UnitId(0)));
        let ty = arena.add_child(root, DW_TAG_structure_type);
        let member = arena.add_child(ty, DW_TAG_member);
        arena.discard(root);
        assert_eq!(arena.get(member).unit, None);
        assert_eq!(arena.get(ty).unit, None);
    }

    #[test]
    fn test_data_forms() {
        let mut arena = DieArena::new();
        let die = arena.create(DW_TAG_base_type, None);
        arena.add_udata(die, DW_AT_byte_size, 4);
        arena.add_udata(die, DW_AT_decl_line, 70000);
        assert_eq!(arena.attr(die, DW_AT_byte_size).unwrap().form, DW_FORM_data1);
        assert_eq!(arena.attr(die, DW_AT_decl_line).unwrap().form, DW_FORM_data4);
        arena.remove_attr(die, DW_AT_byte_size);
        assert!(!arena.has_attr(die, DW_AT_byte_size));
    }
}
