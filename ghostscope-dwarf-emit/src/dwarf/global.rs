//! Global variable entries

use crate::core::{DebugModule, DieRef, ExprOp, GlobalVariableId, Result, UnitId};
use crate::dwarf::die::AttrValue;
use crate::dwarf::tree::EntityTree;
use crate::dwarf::types::is_signed_type;
use gimli::constants::*;
use tracing::trace;

impl EntityTree {
    /// Entry of a global variable, with its location when it is backed by a
    /// symbol or its value when it was folded to a constant
    pub fn get_or_create_global_die(
        &mut self,
        module: &DebugModule,
        unit: UnitId,
        global: GlobalVariableId,
    ) -> Result<DieRef> {
        if let Some(die) = self.global_dies.get(&global) {
            return Ok(*die);
        }
        let meta = module.global(global)?;
        let context = self.context_die(module, unit, meta.scope)?;
        let die = self.arena.add_child(context, DW_TAG_variable);
        self.global_dies.insert(global, die);

        self.add_string(die, DW_AT_name, &meta.name)?;
        if let Some(ty) = meta.ty {
            self.add_type_attr(module, die, ty)?;
        }
        self.add_source_line(module, die, meta.file, meta.line)?;
        if !meta.is_local {
            self.arena.add_flag(die, DW_AT_external);
        }
        if let Some(linkage) = meta.linkage_name.as_deref() {
            self.add_linkage_name(die, linkage)?;
        }

        match meta.symbol.as_deref() {
            Some(symbol) => {
                let block = self.symbol_address_block(symbol, meta.tls, &meta.expr)?;
                self.add_block(die, DW_AT_location, block);
                if !meta.tls {
                    let label = self.symbol_label(symbol);
                    self.arange_labels.push((unit, label));
                }
            }
            None => match meta.expr.ops() {
                [ExprOp::Constu(value)] => {
                    if is_signed_type(module, meta.ty)? {
                        self.arena.add_sdata(die, DW_AT_const_value, *value as i64);
                    } else {
                        self.arena.add(
                            die,
                            DW_AT_const_value,
                            DW_FORM_udata,
                            AttrValue::Udata(*value),
                        );
                    }
                }
                [ExprOp::Consts(value)] => {
                    self.arena.add_sdata(die, DW_AT_const_value, *value);
                }
                _ => trace!("Global '{}' has no location", meta.name),
            },
        }

        self.add_accel_name(module, &meta.name, die)?;
        if let Some(linkage) = meta.linkage_name.as_deref() {
            if linkage != meta.name {
                self.add_accel_name(module, linkage, die)?;
            }
        }
        self.add_global_name(module, unit, &meta.name, die, meta.scope)?;
        Ok(die)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        CompileUnitMeta, EmitterConfig, Expression, FileEntry, GenericTarget, GlobalVariableMeta,
        TypeMeta,
    };
    use std::sync::Arc;

    fn global(module: &mut DebugModule, symbol: Option<&str>, expr: Expression) -> GlobalVariableId {
        let file = module.add_file(FileEntry::new("g.c", "/src"));
        let (cu, scope) = module.add_compile_unit(CompileUnitMeta::new(file, DW_LANG_C99, "cc"));
        let int = module.add_type(TypeMeta::basic("int", DW_ATE_signed, 32));
        module.add_global(GlobalVariableMeta {
            name: "counter".to_string(),
            linkage_name: None,
            unit: cu,
            scope: Some(scope),
            file: Some(file),
            line: 7,
            ty: Some(int),
            is_local: false,
            symbol: symbol.map(str::to_string),
            expr,
            tls: false,
        })
    }

    #[test]
    fn test_global_with_symbol_has_location() {
        let mut module = DebugModule::new();
        let id = global(&mut module, Some("counter"), Expression::new());
        let options = EmitterConfig::with_version(5).resolve().unwrap();
        let mut tree = EntityTree::new(options, Arc::new(GenericTarget::x86_64()));
        let cu = module.global(id).unwrap().unit;
        let unit = tree.get_or_create_compile_unit(&module, cu).unwrap();

        let die = tree.get_or_create_global_die(&module, unit, id).unwrap();
        assert_eq!(die, tree.get_or_create_global_die(&module, unit, id).unwrap());
        assert!(tree.arena.has_attr(die, DW_AT_location));
        assert!(tree.arena.has_attr(die, DW_AT_external));
        assert_eq!(tree.arange_labels.len(), 1);
        assert_eq!(tree.externals[0].1, "counter");
    }

    #[test]
    fn test_folded_global_has_const_value() {
        let mut module = DebugModule::new();
        let id = global(&mut module, None, Expression::from_ops(vec![ExprOp::Consts(-3)]));
        let options = EmitterConfig::with_version(4).resolve().unwrap();
        let mut tree = EntityTree::new(options, Arc::new(GenericTarget::x86_64()));
        let cu = module.global(id).unwrap().unit;
        let unit = tree.get_or_create_compile_unit(&module, cu).unwrap();

        let die = tree.get_or_create_global_die(&module, unit, id).unwrap();
        let attr = tree.arena.attr(die, DW_AT_const_value).unwrap();
        assert!(matches!(attr.value, AttrValue::Sdata(-3)));
        assert!(!tree.arena.has_attr(die, DW_AT_location));
    }
}
