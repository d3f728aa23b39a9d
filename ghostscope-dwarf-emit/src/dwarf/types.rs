//! Type entries, namespaces and type units

use crate::core::{
    DebugModule, DieRef, EmitError, Expression, Result, ScopeId, ScopeKind, TemplateValue,
    TypeId, TypeKind, TypeMeta, UnitId,
};
use crate::dwarf::die::{AttrValue, LocBlock};
use crate::dwarf::expr_writer::{AddressOperand, ExprWriter};
use crate::dwarf::hash::type_signature;
use crate::dwarf::tree::EntityTree;
use crate::dwarf::unit::{Unit, UnitKind};
use gimli::constants::*;
use gimli::DwTag;
use tracing::{debug, trace};

fn type_tag(kind: &TypeKind) -> DwTag {
    match kind {
        TypeKind::Basic { .. } => DW_TAG_base_type,
        TypeKind::Derived { tag, .. } | TypeKind::Composite { tag, .. } => *tag,
        TypeKind::Subroutine { .. } => DW_TAG_subroutine_type,
        TypeKind::Enumerator { .. } => DW_TAG_enumerator,
        TypeKind::Subrange { .. } => DW_TAG_subrange_type,
    }
}

/// Whether values of `ty` are signed, looking through typedefs and
/// qualifiers
pub fn is_signed_type(module: &DebugModule, ty: Option<TypeId>) -> Result<bool> {
    let mut current = ty;
    while let Some(id) = current {
        let meta = module.ty(id)?;
        match &meta.kind {
            TypeKind::Basic { encoding } => {
                return Ok(matches!(*encoding, DW_ATE_signed | DW_ATE_signed_char));
            }
            TypeKind::Derived { tag, base, .. } => {
                if matches!(*tag, DW_TAG_pointer_type | DW_TAG_reference_type) {
                    return Ok(false);
                }
                current = *base;
            }
            TypeKind::Composite { tag, base, .. } if *tag == DW_TAG_enumeration_type => {
                current = *base;
            }
            _ => return Ok(false),
        }
    }
    Ok(false)
}

impl EntityTree {
    /// Entry a declaration in `scope` is placed under
    pub(crate) fn context_die(
        &mut self,
        module: &DebugModule,
        unit: UnitId,
        scope: Option<ScopeId>,
    ) -> Result<DieRef> {
        let root = self.unit(unit).root;
        let Some(scope) = scope else {
            return Ok(root);
        };
        let meta = module.scope(scope)?;
        match &meta.kind {
            ScopeKind::CompileUnit(_) => Ok(root),
            ScopeKind::Namespace { name } => {
                if let Some(die) = self.context_dies.get(&(unit, scope)) {
                    return Ok(*die);
                }
                let parent = self.context_die(module, unit, meta.parent)?;
                let die = self.arena.add_child(parent, DW_TAG_namespace);
                self.context_dies.insert((unit, scope), die);
                if !name.is_empty() {
                    self.add_string(die, DW_AT_name, name)?;
                }
                self.add_accel_namespace(module, name, die)?;
                if !self.unit(unit).kind.is_type() {
                    self.add_global_name(module, unit, name, die, meta.parent)?;
                }
                Ok(die)
            }
            ScopeKind::Subprogram(sp) if !self.unit(unit).kind.is_type() => {
                self.get_or_create_subprogram_die(module, unit, *sp)
            }
            _ => self.context_die(module, unit, meta.parent),
        }
    }

    /// Type entry for `ty` as referenced from `unit`, built on first use
    pub fn get_or_create_type_die(
        &mut self,
        module: &DebugModule,
        unit: UnitId,
        ty: TypeId,
    ) -> Result<DieRef> {
        if let Some(die) = self.type_dies.get(&(unit, ty)) {
            return Ok(*die);
        }
        self.create_type_die(module, unit, ty, true)
    }

    fn create_type_die(
        &mut self,
        module: &DebugModule,
        unit: UnitId,
        ty: TypeId,
        allow_type_unit: bool,
    ) -> Result<DieRef> {
        let meta = module.ty(ty)?;
        let context = self.context_die(module, unit, meta.scope)?;
        let die = self.arena.add_child(context, type_tag(&meta.kind));
        self.type_dies.insert((unit, ty), die);

        if let TypeKind::Composite {
            identifier: Some(identifier),
            declaration: false,
            ..
        } = &meta.kind
        {
            if allow_type_unit && self.options.generate_type_units {
                if let Some(name) = meta.name.as_deref() {
                    if !self.unit(unit).kind.is_type() {
                        self.add_global_type(module, unit, name, die, meta.scope)?;
                    }
                }
                self.add_type_unit_type(module, unit, ty, die, identifier)?;
                return Ok(die);
            }
        }

        self.construct_type_die(module, ty, die)?;
        self.update_type_accel(module, unit, meta, die)?;
        Ok(die)
    }

    fn update_type_accel(
        &mut self,
        module: &DebugModule,
        unit: UnitId,
        meta: &TypeMeta,
        die: DieRef,
    ) -> Result<()> {
        let Some(name) = meta.name.as_deref().filter(|n| !n.is_empty()) else {
            return Ok(());
        };
        if matches!(meta.kind, TypeKind::Composite { declaration: true, .. })
            || self.unit(unit).kind.is_type()
        {
            return Ok(());
        }
        let global_context = match meta.scope {
            None => true,
            Some(scope) => matches!(
                module.scope(scope)?.kind,
                ScopeKind::CompileUnit(_) | ScopeKind::Namespace { .. }
            ),
        };
        self.add_accel_type(module, name, die)?;
        if global_context {
            self.add_global_type(module, unit, name, die, meta.scope)?;
        }
        Ok(())
    }

    /// `DW_AT_type` reference to `ty`
    pub fn add_type_attr(&mut self, module: &DebugModule, die: DieRef, ty: TypeId) -> Result<()> {
        let unit = self.die_unit(die)?;
        let target = self.get_or_create_type_die(module, unit, ty)?;
        self.arena.add_entry(die, DW_AT_type, target);
        Ok(())
    }

    fn add_type_signature(&mut self, die: DieRef, signature: u64) {
        self.arena.add_flag(die, DW_AT_declaration);
        self.arena.add(
            die,
            DW_AT_signature,
            DW_FORM_ref_sig8,
            AttrValue::Signature(signature),
        );
    }

    /// Moves a composite type into its own type unit and turns `placeholder`
    /// into a signature reference. Types whose entries end up needing the
    /// address pool are rebuilt inline instead, since a type unit shared
    /// across objects cannot reference a per-object address table.
    fn add_type_unit_type(
        &mut self,
        module: &DebugModule,
        context_unit: UnitId,
        ty: TypeId,
        placeholder: DieRef,
        identifier: &str,
    ) -> Result<()> {
        if !self.type_batch.is_empty() && self.addr_pool.has_been_used() {
            return Ok(());
        }
        if let Some(signature) = self.type_signatures.get(&ty).copied() {
            self.add_type_signature(placeholder, signature);
            return Ok(());
        }
        let signature = type_signature(identifier);
        if self.signature_units.contains_key(&signature) {
            trace!("Reusing type unit for '{}' ({:#018x})", identifier, signature);
            self.type_signatures.insert(ty, signature);
            self.add_type_signature(placeholder, signature);
            return Ok(());
        }
        let top_level = self.type_batch.is_empty();
        if top_level {
            self.addr_pool.reset_used_flag();
        }

        self.type_signatures.insert(ty, signature);
        let split = self.options.use_split_dwarf();
        let id = UnitId(self.units.len() as u32);
        let kind = if split {
            UnitKind::SplitType
        } else {
            UnitKind::Type
        };
        let root = self.arena.create(DW_TAG_type_unit, Some(id));
        let label = self.labels.create();
        let source = self.unit(context_unit).source;
        let mut unit = Unit::new(id, kind, root, label);
        unit.signature = Some(signature);
        unit.source = source;
        if !split {
            unit.line_table = self.unit(context_unit).line_table;
        }
        self.units.push(unit);
        self.info.units.push(id);
        self.signature_units.insert(signature, id);
        self.type_batch.push((id, ty));
        trace!("Type unit {} for '{}' ({:#018x})", id.0, identifier, signature);

        if let Some(cu) = source {
            let language = module.compile_unit(cu)?.language;
            self.arena.add(
                root,
                DW_AT_language,
                DW_FORM_data2,
                AttrValue::Udata(language.0 as u64),
            );
        }
        if !split {
            if let Some(table) = self.unit(id).line_table {
                let label = self.line_tables[table].label;
                let form = self.options.section_offset_form();
                self.arena
                    .add(root, DW_AT_stmt_list, form, AttrValue::SecOffset(label));
            }
            if self.options.segmented_str_offsets {
                self.add_str_offsets_base(id);
            }
        }

        let type_die = self.create_type_die(module, id, ty, false)?;
        self.unit_mut(id).type_die = Some(type_die);

        if top_level {
            let batch = std::mem::take(&mut self.type_batch);
            if self.addr_pool.has_been_used() {
                debug!(
                    "Type '{}' references the address pool, building {} type unit(s) inline",
                    identifier,
                    batch.len()
                );
                for (tu, batch_ty) in &batch {
                    if let Some(sig) = self.type_signatures.remove(batch_ty) {
                        self.signature_units.remove(&sig);
                        self.type_signatures.retain(|_, s| *s != sig);
                    }
                    let tu_root = self.unit(*tu).root;
                    self.arena.discard(tu_root);
                    self.suppressed.push(*tu);
                }
                self.info
                    .units
                    .retain(|u| !batch.iter().any(|(tu, _)| tu == u));
                self.arena.remove_attr(placeholder, DW_AT_declaration);
                self.arena.remove_attr(placeholder, DW_AT_signature);
                self.construct_type_die(module, ty, placeholder)?;
                let meta = module.ty(ty)?;
                self.update_type_accel(module, context_unit, meta, placeholder)?;
                return Ok(());
            }
        }
        self.add_type_signature(placeholder, signature);
        Ok(())
    }

    /// Fills `die` with the description of `ty`
    pub(crate) fn construct_type_die(
        &mut self,
        module: &DebugModule,
        ty: TypeId,
        die: DieRef,
    ) -> Result<()> {
        let meta = module.ty(ty)?;
        if let Some(name) = meta.name.as_deref().filter(|n| !n.is_empty()) {
            self.add_string(die, DW_AT_name, name)?;
        }
        let byte_size = meta.size_bits / 8;

        match &meta.kind {
            TypeKind::Basic { encoding } => {
                self.arena.add(
                    die,
                    DW_AT_encoding,
                    DW_FORM_data1,
                    AttrValue::Udata(encoding.0 as u64),
                );
                self.arena.add_udata(die, DW_AT_byte_size, byte_size);
            }
            TypeKind::Derived {
                tag,
                base,
                offset_bits,
            } => {
                if let Some(base) = base {
                    self.add_type_attr(module, die, *base)?;
                }
                let sized = matches!(
                    *tag,
                    DW_TAG_pointer_type
                        | DW_TAG_reference_type
                        | DW_TAG_rvalue_reference_type
                        | DW_TAG_ptr_to_member_type
                );
                if sized && byte_size > 0 {
                    self.arena.add_udata(die, DW_AT_byte_size, byte_size);
                }
                if *tag == DW_TAG_member || *tag == DW_TAG_inheritance {
                    self.arena
                        .add_udata(die, DW_AT_data_member_location, offset_bits / 8);
                }
            }
            TypeKind::Composite {
                tag,
                base,
                elements,
                template_params,
                declaration,
                ..
            } => {
                if let Some(base) = base {
                    self.add_type_attr(module, die, *base)?;
                }
                if *declaration {
                    self.arena.add_flag(die, DW_AT_declaration);
                } else if *tag != DW_TAG_array_type || byte_size > 0 {
                    self.arena.add_udata(die, DW_AT_byte_size, byte_size);
                }
                for element in elements {
                    let element_meta = module.ty(*element)?;
                    let child = self.arena.add_child(die, type_tag(&element_meta.kind));
                    let unit = self.die_unit(die)?;
                    self.type_dies.insert((unit, *element), child);
                    self.construct_type_die(module, *element, child)?;
                }
                for param in template_params {
                    let tag = match param.value {
                        TemplateValue::Type => DW_TAG_template_type_parameter,
                        _ => DW_TAG_template_value_parameter,
                    };
                    let child = self.arena.add_child(die, tag);
                    if !param.name.is_empty() {
                        self.add_string(child, DW_AT_name, &param.name)?;
                    }
                    if let Some(ty) = param.ty {
                        self.add_type_attr(module, child, ty)?;
                    }
                    match &param.value {
                        TemplateValue::Type => {}
                        TemplateValue::Int(value) => {
                            self.arena.add_sdata(child, DW_AT_const_value, *value);
                        }
                        TemplateValue::Address(symbol) => {
                            let block = self.symbol_address_block(symbol, false, &Expression::new())?;
                            self.add_block(child, DW_AT_location, block);
                        }
                    }
                }
            }
            TypeKind::Subroutine { types } => {
                if let Some(Some(ret)) = types.first() {
                    self.add_type_attr(module, die, *ret)?;
                }
                self.arena.add_flag(die, DW_AT_prototyped);
                for param in types.iter().skip(1) {
                    match param {
                        Some(ty) => {
                            let child = self.arena.add_child(die, DW_TAG_formal_parameter);
                            self.add_type_attr(module, child, *ty)?;
                        }
                        None => {
                            self.arena.add_child(die, DW_TAG_unspecified_parameters);
                        }
                    }
                }
            }
            TypeKind::Enumerator { value } => {
                if *value < 0 {
                    self.arena.add_sdata(die, DW_AT_const_value, *value);
                } else {
                    self.arena.add_udata(die, DW_AT_const_value, *value as u64);
                }
            }
            TypeKind::Subrange { count } => {
                if let Some(count) = count {
                    if *count >= 0 {
                        self.arena.add_udata(die, DW_AT_count, *count as u64);
                    } else {
                        self.arena.add_sdata(die, DW_AT_count, *count);
                    }
                }
            }
        }

        if meta.align_bits > 0 && self.options.version() >= 5 {
            self.arena
                .add_udata(die, DW_AT_alignment, meta.align_bits as u64 / 8);
        }
        self.add_source_line(module, die, meta.file, meta.line)
    }

    /// Label standing for an object symbol, declared external on first use
    pub(crate) fn symbol_label(&mut self, symbol: &str) -> crate::core::Label {
        let (label, created) = self.labels.symbol(symbol);
        if created {
            self.externals.push((label, symbol.to_string()));
        }
        label
    }

    /// Location expression computing the address of `symbol`. Split output
    /// goes through the address pool.
    pub(crate) fn symbol_address_block(
        &mut self,
        symbol: &str,
        tls: bool,
        expr: &Expression,
    ) -> Result<LocBlock> {
        let label = self.symbol_label(symbol);
        let operand = if self.options.use_split_dwarf() {
            AddressOperand::Index(self.addr_pool.index(label, tls))
        } else {
            AddressOperand::Direct(label)
        };
        let target = self.target.clone();
        let mut writer = ExprWriter::new(&self.options, target.as_ref());
        if !writer.add_address(operand, tls, expr)? {
            return Err(EmitError::InvalidInput(format!(
                "cannot describe the address of '{}'",
                symbol
            ))
            .into());
        }
        Ok(writer.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        CompileUnitId, CompileUnitMeta, EmitterConfig, FileEntry, GenericTarget, TemplateParam,
    };
    use std::sync::Arc;

    fn setup(config: EmitterConfig) -> (DebugModule, CompileUnitId, EntityTree) {
        let mut module = DebugModule::new();
        let file = module.add_file(FileEntry::new("t.cpp", "/src"));
        let (cu, _) =
            module.add_compile_unit(CompileUnitMeta::new(file, DW_LANG_C_plus_plus_14, "c++"));
        let tree = EntityTree::new(config.resolve().unwrap(), Arc::new(GenericTarget::x86_64()));
        (module, cu, tree)
    }

    fn structure(module: &mut DebugModule, name: &str, params: Vec<TemplateParam>) -> TypeId {
        let int = module.add_type(TypeMeta::basic("int", DW_ATE_signed, 32));
        let member = module.add_type(TypeMeta {
            name: Some("x".to_string()),
            kind: TypeKind::Derived {
                tag: DW_TAG_member,
                base: Some(int),
                offset_bits: 0,
            },
            scope: None,
            file: None,
            line: 0,
            size_bits: 32,
            align_bits: 0,
        });
        module.add_type(TypeMeta {
            name: Some(name.to_string()),
            kind: TypeKind::Composite {
                tag: DW_TAG_structure_type,
                identifier: Some(format!("_ZTS{}", name)),
                base: None,
                elements: vec![member],
                template_params: params,
                declaration: false,
            },
            scope: None,
            file: None,
            line: 0,
            size_bits: 32,
            align_bits: 0,
        })
    }

    #[test]
    fn test_signed_type_through_typedef() {
        let mut module = DebugModule::new();
        let int = module.add_type(TypeMeta::basic("int", DW_ATE_signed, 32));
        let typedef = module.add_type(TypeMeta {
            name: Some("i32".to_string()),
            kind: TypeKind::Derived {
                tag: DW_TAG_typedef,
                base: Some(int),
                offset_bits: 0,
            },
            scope: None,
            file: None,
            line: 0,
            size_bits: 0,
            align_bits: 0,
        });
        let unsigned = module.add_type(TypeMeta::basic("unsigned", DW_ATE_unsigned, 32));
        assert!(is_signed_type(&module, Some(typedef)).unwrap());
        assert!(!is_signed_type(&module, Some(unsigned)).unwrap());
        assert!(!is_signed_type(&module, None).unwrap());
    }

    #[test]
    fn test_struct_members_are_children() {
        let (mut module, cu, mut tree) = setup(EmitterConfig::default());
        let ty = structure(&mut module, "S", Vec::new());
        let unit = tree.get_or_create_compile_unit(&module, cu).unwrap();
        let die = tree.get_or_create_type_die(&module, unit, ty).unwrap();
        assert_eq!(tree.get_or_create_type_die(&module, unit, ty).unwrap(), die);
        let entry = tree.arena.get(die);
        assert_eq!(entry.tag, DW_TAG_structure_type);
        assert_eq!(entry.children.len(), 1);
        assert_eq!(tree.arena.get(entry.children[0]).name(), Some("x"));
    }

    #[test]
    fn test_type_unit_placeholder() {
        let config = EmitterConfig {
            generate_type_units: true,
            ..EmitterConfig::default()
        };
        let (mut module, cu, mut tree) = setup(config);
        let ty = structure(&mut module, "S", Vec::new());
        let unit = tree.get_or_create_compile_unit(&module, cu).unwrap();
        let die = tree.get_or_create_type_die(&module, unit, ty).unwrap();
        assert!(tree.arena.has_attr(die, DW_AT_declaration));
        assert_eq!(
            tree.arena.attr(die, DW_AT_signature).unwrap().value,
            AttrValue::Signature(type_signature("_ZTSS"))
        );
        let tu = tree.units.iter().find(|u| u.kind == UnitKind::Type).unwrap();
        assert_eq!(tu.signature, Some(type_signature("_ZTSS")));
        let type_die = tu.type_die.unwrap();
        assert_eq!(tree.arena.get(type_die).children.len(), 1);
    }

    #[test]
    fn test_same_identifier_shares_one_type_unit() {
        let config = EmitterConfig {
            generate_type_units: true,
            ..EmitterConfig::default()
        };
        let (mut module, cu, mut tree) = setup(config);
        let first = structure(&mut module, "S", Vec::new());
        let second = structure(&mut module, "S", Vec::new());
        assert_ne!(first, second);
        let unit = tree.get_or_create_compile_unit(&module, cu).unwrap();
        let first_die = tree.get_or_create_type_die(&module, unit, first).unwrap();
        let second_die = tree.get_or_create_type_die(&module, unit, second).unwrap();

        let signature = AttrValue::Signature(type_signature("_ZTSS"));
        assert_eq!(tree.arena.attr(first_die, DW_AT_signature).unwrap().value, signature);
        assert_eq!(tree.arena.attr(second_die, DW_AT_signature).unwrap().value, signature);
        let type_units: Vec<_> = tree
            .info
            .units
            .iter()
            .filter(|u| tree.unit(**u).kind.is_type())
            .collect();
        assert_eq!(type_units.len(), 1);
        assert_eq!(
            tree.signature_units.get(&type_signature("_ZTSS")),
            Some(type_units[0])
        );
    }

    #[test]
    fn test_type_using_address_pool_stays_inline() {
        let config = EmitterConfig {
            generate_type_units: true,
            split_dwarf_file: Some("t.dwo".to_string()),
            ..EmitterConfig::default()
        };
        let (mut module, cu, mut tree) = setup(config);
        let param = TemplateParam {
            name: "P".to_string(),
            ty: None,
            value: TemplateValue::Address("global".to_string()),
        };
        let ty = structure(&mut module, "T", vec![param]);
        let unit = tree.get_or_create_compile_unit(&module, cu).unwrap();
        let die = tree.get_or_create_type_die(&module, unit, ty).unwrap();
        assert!(!tree.arena.has_attr(die, DW_AT_signature));
        assert_eq!(tree.arena.get(die).children.len(), 2);
        assert!(tree.info.units.iter().all(|u| !tree.unit(*u).kind.is_type()));
        assert_eq!(tree.externals.len(), 1);
    }
}
