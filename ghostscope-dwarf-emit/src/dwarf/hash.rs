//! 64-bit signatures for type units and split compile units

use crate::core::DieRef;
use crate::dwarf::die::{AttrValue, DieArena};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

fn fold(digest: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Signature of a type unit, derived from the type's identity string
pub fn type_signature(identifier: &str) -> u64 {
    fold(&Sha256::digest(identifier.as_bytes()))
}

/// Content signature of a unit tree plus the companion file name.
///
/// Attributes are hashed sorted by name and values that depend on final
/// addresses or offsets are left out, so the result only changes when the
/// described entities do. References inside the tree hash as the pre-order
/// position of their target; references leaving it hash as the target's tag
/// and name.
pub fn unit_signature(arena: &DieArena, root: DieRef, dwo_name: &str) -> u64 {
    let order = arena.subtree(root);
    let positions: HashMap<DieRef, u32> = order
        .iter()
        .enumerate()
        .map(|(idx, die)| (*die, idx as u32))
        .collect();

    let mut hasher = Sha256::new();
    hash_die(arena, root, &positions, &mut hasher);
    hasher.update(dwo_name.as_bytes());
    fold(&hasher.finalize())
}

fn hash_die(arena: &DieArena, die: DieRef, positions: &HashMap<DieRef, u32>, hasher: &mut Sha256) {
    let entry = arena.get(die);
    hasher.update(entry.tag.0.to_le_bytes());

    let mut attrs: Vec<_> = entry.attrs.iter().collect();
    attrs.sort_by_key(|a| a.name.0);
    for attr in attrs {
        let before = hasher.clone();
        hasher.update(attr.name.0.to_le_bytes());
        match &attr.value {
            AttrValue::Udata(v) => {
                hasher.update(b"u");
                hasher.update(v.to_le_bytes());
            }
            AttrValue::Sdata(v) => {
                hasher.update(b"s");
                hasher.update(v.to_le_bytes());
            }
            AttrValue::Flag(v) => hasher.update([b'f', *v as u8]),
            AttrValue::Str { text, .. } => {
                hasher.update(b"S");
                hasher.update(text.as_bytes());
                hasher.update([0]);
            }
            AttrValue::Entry(target) => match positions.get(target) {
                Some(pos) => {
                    hasher.update(b"R");
                    hasher.update(pos.to_le_bytes());
                }
                None => {
                    let target = arena.get(*target);
                    hasher.update(b"E");
                    hasher.update(target.tag.0.to_le_bytes());
                    hasher.update(target.name().unwrap_or("").as_bytes());
                    hasher.update([0]);
                }
            },
            AttrValue::Signature(sig) => {
                hasher.update(b"T");
                hasher.update(sig.to_le_bytes());
            }
            AttrValue::Block(block) => {
                hasher.update(b"B");
                hasher.update((block.bytes.len() as u64).to_le_bytes());
                hasher.update(&block.bytes);
            }
            AttrValue::Address(_)
            | AttrValue::AddrIndex(_)
            | AttrValue::LabelDelta { .. }
            | AttrValue::SecOffset(_)
            | AttrValue::ListIndex(_) => {
                *hasher = before;
            }
        }
    }

    hasher.update((entry.children.len() as u64).to_le_bytes());
    for child in &entry.children {
        hash_die(arena, *child, positions, hasher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Label, UnitId};
    use crate::dwarf::die::{Attribute, StrRepr};
    use gimli::constants::*;

    fn build(arena: &mut DieArena, swap: bool, low_pc: u32) -> DieRef {
        let root = arena.create(DW_TAG_compile_unit, Some(UnitId(0)));
        let ty = arena.add_child(root, DW_TAG_base_type);
        let name = Attribute {
            name: DW_AT_name,
            form: DW_FORM_strp,
            value: AttrValue::Str {
                text: "int".to_string(),
                repr: StrRepr::Offset(0),
            },
        };
        let size = Attribute {
            name: DW_AT_byte_size,
            form: DW_FORM_data1,
            value: AttrValue::Udata(4),
        };
        let attrs = if swap {
            vec![size, name]
        } else {
            vec![name, size]
        };
        arena.get_mut(ty).attrs = attrs;
        let var = arena.add_child(root, DW_TAG_variable);
        arena.add_entry(var, DW_AT_type, ty);
        arena.add(
            root,
            DW_AT_low_pc,
            DW_FORM_addr,
            AttrValue::Address(Label(low_pc)),
        );
        root
    }

    #[test]
    fn test_unit_signature_ignores_attribute_order_and_addresses() {
        let mut arena = DieArena::new();
        let a = build(&mut arena, false, 1);
        let b = build(&mut arena, true, 2);
        assert_eq!(
            unit_signature(&arena, a, "a.dwo"),
            unit_signature(&arena, b, "a.dwo")
        );
        assert_ne!(
            unit_signature(&arena, a, "a.dwo"),
            unit_signature(&arena, a, "b.dwo")
        );
    }

    #[test]
    fn test_type_signature_is_stable() {
        assert_eq!(type_signature("_ZTS3Foo"), type_signature("_ZTS3Foo"));
        assert_ne!(type_signature("_ZTS3Foo"), type_signature("_ZTS3Bar"));
    }
}
