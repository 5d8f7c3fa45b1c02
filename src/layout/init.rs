//! Default value constants.
//!
//! Field defaults are resolved lazily into the descriptors of the offset
//! map, and once every representative has one the aggregate constant is
//! assembled from the same representatives the struct body was built from.

use crate::{
    decl::{DefaultValue, SemType},
    errors::LayoutError,
    helper::interner::{IStr, Internable},
    llvm::{LLVMConst, LLVMType, LoweredTypeID},
};

use super::{offsets::representatives, DeclID, FieldOrigin, LayoutRegistry, LayoutResult};

/// Arrays of aggregates, at any depth, are zeroed element by element
fn holds_aggregate(sem: &SemType) -> bool {
    match sem {
        SemType::Aggregate(_) => true,
        SemType::Array(inner, _) => holds_aggregate(inner),
        _ => false,
    }
}

impl<'d> LayoutRegistry<'d> {
    /// Fills in every declared field default that can be computed right now.
    /// Defaults of embedded aggregates pull in that aggregate's constant.
    /// `Deferred` fields stay empty until `set_field_default` supplies them
    pub fn resolve_field_defaults(&mut self, id: DeclID) -> LayoutResult<()> {
        let rec = self.defined(id)?;
        let aggregate = rec.name;

        let mut pending = Vec::new();
        for (offset, group) in rec.offsets.iter() {
            for (slot, f) in group.iter().enumerate() {
                if let (FieldOrigin::Declared(fref), None) = (f.origin, &f.init) {
                    pending.push((*offset, slot, fref, f.ty));
                }
            }
        }

        for (offset, slot, fref, ty) in pending {
            let owner = self.decl(fref.owner)?;
            let fields = owner.fields();
            let fdecl = match fields.get(fref.index) {
                Some(f) => *f,
                None => return Err(LayoutError::UnknownDeclaration(fref.owner)),
            };

            let value = self.default_constant(aggregate, fdecl.name, &fdecl.ty, &fdecl.default, ty)?;

            if let Some(v) = value {
                let rec = self.record_mut(id)?;
                if let Some(f) = rec.offsets.get_mut(&offset).and_then(|g| g.get_mut(slot)) {
                    f.init = Some(v);
                }
            }
        }

        Ok(())
    }

    fn default_constant(
        &mut self,
        aggregate: IStr,
        field: IStr,
        sem: &SemType,
        default: &DefaultValue,
        ty: LoweredTypeID,
    ) -> LayoutResult<Option<LLVMConst>> {
        let invalid = || LayoutError::InvalidDefault { aggregate, field };

        let lowered = self.module.ty(ty).clone();

        let value = match (default, &lowered) {
            (DefaultValue::Deferred, _) => None,

            (DefaultValue::Zero, _) => Some(self.zero_constant(sem, ty)?),

            (DefaultValue::Int(v), LLVMType::Primitive(p)) if p.is_float() => {
                Some(LLVMConst::Float { ty, value: *v as f64 })
            }
            (DefaultValue::Int(v), LLVMType::Primitive(p)) if p.holds(*v) => {
                Some(LLVMConst::Int { ty, value: *v })
            }
            (DefaultValue::Int(0), LLVMType::Pointer(_)) => Some(LLVMConst::Null),

            (DefaultValue::Float(v), LLVMType::Primitive(p)) if p.is_float() => {
                Some(LLVMConst::Float { ty, value: *v })
            }

            (DefaultValue::Bool(b), LLVMType::Primitive(p)) if !p.is_float() => Some(LLVMConst::Int {
                ty,
                value: *b as i64,
            }),

            (DefaultValue::Null, LLVMType::Pointer(_)) => Some(LLVMConst::Null),

            _ => return Err(invalid()),
        };

        Ok(value)
    }

    /// The natural zero of a type. For embedded aggregates that is their
    /// default instance, which is built here if it has not been yet
    fn zero_constant(&mut self, sem: &SemType, ty: LoweredTypeID) -> LayoutResult<LLVMConst> {
        match sem {
            SemType::Aggregate(d) => {
                // an embedded class needs its tables for the hidden pointers
                if self.decl(*d)?.is_class() {
                    self.finalize(*d)?;
                } else {
                    self.resolve_field_defaults(*d)?;
                }
                self.build_initializer(*d)
            }
            SemType::Array(inner, count) if holds_aggregate(inner) => {
                let elem = match self.module.ty(ty) {
                    LLVMType::Array { elem, .. } => *elem,
                    _ => return Ok(self.module.zero_of(ty)),
                };

                let item = self.zero_constant(inner, elem)?;
                Ok(LLVMConst::Array {
                    elem,
                    items: vec![item; *count as usize],
                })
            }
            _ => Ok(self.module.zero_of(ty)),
        }
    }

    /// Supplies the value of a field whose default was `Deferred`, or
    /// overrides one that was computed. Applies to every record that
    /// placed the field, so does not reach derived classes defined earlier
    pub fn set_field_default(&mut self, id: DeclID, field: &str, value: LLVMConst) -> LayoutResult<()> {
        let name = field.intern();
        let rec = self.record_mut(id)?;
        let aggregate = rec.name;

        if rec.flags.const_inited() {
            tracing::warn!("default of {aggregate}.{field} changed after the initializer was built");
        }

        let mut found = false;
        for group in rec.offsets.values_mut() {
            for f in group.iter_mut() {
                if f.name == name && matches!(f.origin, FieldOrigin::Declared(_)) {
                    f.init = Some(value.clone());
                    found = true;
                }
            }
        }

        if found {
            Ok(())
        } else {
            Err(LayoutError::UnknownField {
                aggregate,
                field: name,
            })
        }
    }

    /// Builds the default instance constant of a defined aggregate. Every
    /// representative field must already have its value. The first result
    /// is cached and handed back unchanged on later calls
    pub fn build_initializer(&mut self, id: DeclID) -> LayoutResult<LLVMConst> {
        let rec = self.defined(id)?;

        if rec.flags.const_inited() {
            if let Some(c) = &rec.default_init_const {
                tracing::trace!("initializer of {} served from cache", rec.name);
                return Ok(c.clone());
            }
        }

        let handle = rec.handle;
        let size = rec.size;
        let name = rec.name;

        let mut parts: Vec<(u64, LLVMConst, u64)> = Vec::new();
        for (offset, f) in representatives(&rec.offsets, &rec.default_fields) {
            match &f.init {
                Some(c) => parts.push((offset, c.clone(), f.size)),
                None => {
                    return Err(LayoutError::IncompleteInitializer {
                        aggregate: name,
                        field: f.name,
                    })
                }
            }
        }

        let mut fields = Vec::new();
        let mut cursor = 0;

        for (offset, value, fsize) in parts {
            if offset > cursor {
                let pad = self.module.byte_array(offset - cursor);
                fields.push(LLVMConst::Zero(pad));
            }
            fields.push(value);
            cursor = offset + fsize;
        }

        if size > cursor {
            let pad = self.module.byte_array(size - cursor);
            fields.push(LLVMConst::Zero(pad));
        }

        let constant = LLVMConst::Struct { ty: handle, fields };

        let rec = self.record_mut(id)?;
        rec.default_init_const = Some(constant.clone());
        rec.flags.set_const_inited(true);
        let slot = rec.default_init;

        if let Some(g) = slot {
            self.module.set_initializer(g, constant.clone());
        }

        tracing::debug!("built default initializer of {name}");

        Ok(constant)
    }
}

#[cfg(test)]
mod tests {
    use crate::decl::{fixtures, AggregateDecl, AggregateKind, DeclTable, DefaultValue, FieldDecl, Member, SemType};
    use crate::errors::LayoutError;
    use crate::helper::interner::Internable;
    use crate::layout::LayoutRegistry;
    use crate::llvm::{LLVMConst, LLVMType};

    #[test]
    fn initializer_places_values_and_zero_padding() {
        let mut decls = DeclTable::new();
        let s = decls.add(
            AggregateDecl::new("Padded", AggregateKind::Struct)
                .with_field("tag", SemType::I8, DefaultValue::Int(3))
                .with_field("value", SemType::I64, DefaultValue::Int(-1)),
        );

        let mut reg = LayoutRegistry::new(&decls);
        reg.define(s).unwrap();
        reg.resolve_field_defaults(s).unwrap();
        let c = reg.build_initializer(s).unwrap();

        match c {
            LLVMConst::Struct { ty, fields } => {
                assert_eq!(ty, reg.handle(s).unwrap());
                assert_eq!(fields.len(), 3);
                assert!(matches!(fields[0], LLVMConst::Int { value: 3, .. }));
                match &fields[1] {
                    LLVMConst::Zero(pad) => assert_eq!(reg.module().size_of(*pad), Some(7)),
                    other => panic!("expected padding, got {other:?}"),
                }
                assert!(matches!(fields[2], LLVMConst::Int { value: -1, .. }));
            }
            other => panic!("expected a struct constant, got {other:?}"),
        }
    }

    #[test]
    fn initializer_is_cached() {
        let mut decls = DeclTable::new();
        let p = fixtures::point(&mut decls);

        let mut reg = LayoutRegistry::new(&decls);
        reg.define(p).unwrap();
        reg.resolve_field_defaults(p).unwrap();

        let first = reg.build_initializer(p).unwrap();
        let second = reg.build_initializer(p).unwrap();
        assert_eq!(first, second);
        assert!(reg.record(p).unwrap().flags.const_inited());

        let slot = reg.record(p).unwrap().default_init.unwrap();
        assert_eq!(reg.module().global(slot).init.as_ref(), Some(&first));
    }

    #[test]
    fn unresolved_default_is_an_ordering_fault() {
        let mut decls = DeclTable::new();
        let s = decls.add(
            AggregateDecl::new("Late", AggregateKind::Struct)
                .with_field("a", SemType::I32, DefaultValue::Int(1))
                .with_field("b", SemType::I32, DefaultValue::Deferred),
        );

        let mut reg = LayoutRegistry::new(&decls);
        reg.define(s).unwrap();
        reg.resolve_field_defaults(s).unwrap();

        assert_eq!(
            reg.build_initializer(s),
            Err(LayoutError::IncompleteInitializer {
                aggregate: "Late".intern(),
                field: "b".intern(),
            })
        );
        assert!(!reg.record(s).unwrap().flags.const_inited());

        let i32_t = reg.record(s).unwrap().fields_at(4)[0].ty;
        reg.set_field_default(s, "b", LLVMConst::Int { ty: i32_t, value: 9 }).unwrap();
        assert!(reg.build_initializer(s).is_ok());
    }

    #[test]
    fn building_before_defining_fails() {
        let mut decls = DeclTable::new();
        let p = fixtures::point(&mut decls);

        let mut reg = LayoutRegistry::new(&decls);
        reg.declare(p).unwrap();
        assert!(matches!(reg.build_initializer(p), Err(LayoutError::NotDefined { .. })));
    }

    #[test]
    fn union_initializer_uses_first_declared_member() {
        let mut decls = DeclTable::new();
        let u = decls.add(
            AggregateDecl::new("Word", AggregateKind::Union)
                .with_field("byte", SemType::I8, DefaultValue::Int(0x7f))
                .with_field("full", SemType::I64, DefaultValue::Int(0)),
        );

        let mut reg = LayoutRegistry::new(&decls);
        reg.define(u).unwrap();
        reg.resolve_field_defaults(u).unwrap();

        match reg.build_initializer(u).unwrap() {
            LLVMConst::Struct { fields, .. } => {
                assert_eq!(fields.len(), 2);
                assert!(matches!(fields[0], LLVMConst::Int { value: 0x7f, .. }));
                assert!(matches!(fields[1], LLVMConst::Zero(_)));
            }
            other => panic!("expected a struct constant, got {other:?}"),
        }
    }

    #[test]
    fn embedded_aggregate_default_is_its_initializer() {
        let mut decls = DeclTable::new();
        let p = fixtures::point(&mut decls);
        let line = decls.add(
            AggregateDecl::new("Line", AggregateKind::Struct)
                .with_field("from", SemType::Aggregate(p), DefaultValue::Zero)
                .with_member(Member::Field(FieldDecl {
                    name: "to".intern(),
                    ty: SemType::Aggregate(p),
                    default: DefaultValue::Zero,
                })),
        );

        let mut reg = LayoutRegistry::new(&decls);
        reg.define(line).unwrap();
        reg.resolve_field_defaults(line).unwrap();
        let c = reg.build_initializer(line).unwrap();

        let point_init = reg.record(p).unwrap().default_init_const.clone().unwrap();
        match c {
            LLVMConst::Struct { fields, .. } => {
                assert_eq!(fields, vec![point_init.clone(), point_init]);
            }
            other => panic!("expected a struct constant, got {other:?}"),
        }
    }

    #[test]
    fn embedded_class_is_finalized_for_its_default() {
        let mut decls = DeclTable::new();
        let base = fixtures::base_class(&mut decls);
        let holder = decls.add(
            AggregateDecl::new("Holder", AggregateKind::Struct)
                .with_field("b", SemType::Aggregate(base), DefaultValue::Zero),
        );

        let mut reg = LayoutRegistry::new(&decls);
        reg.finalize(holder).unwrap();

        let vtbl = reg.record(base).unwrap().vtable.unwrap();
        assert_eq!(reg.fields_at(base, 0)[0].init, Some(LLVMConst::GlobalRef(vtbl)));
        assert!(reg.record(base).unwrap().flags.vtable_defined());
        assert!(reg.record(holder).unwrap().flags.const_inited());
    }

    #[test]
    fn nested_arrays_of_classes_get_their_table_pointers() {
        let mut decls = DeclTable::new();
        let base = fixtures::base_class(&mut decls);
        let grid = decls.add(
            AggregateDecl::new("Grid", AggregateKind::Struct)
                .with_field("flat", SemType::array_of(SemType::Aggregate(base), 1), DefaultValue::Zero)
                .with_field(
                    "rows",
                    SemType::array_of(SemType::array_of(SemType::Aggregate(base), 1), 1),
                    DefaultValue::Zero,
                ),
        );

        let mut reg = LayoutRegistry::new(&decls);
        reg.finalize(grid).unwrap();

        let base_init = reg.record(base).unwrap().default_init_const.clone().unwrap();
        let vtbl = reg.record(base).unwrap().vtable.unwrap();
        match &base_init {
            LLVMConst::Struct { fields, .. } => assert_eq!(fields[0], LLVMConst::GlobalRef(vtbl)),
            other => panic!("expected a struct constant, got {other:?}"),
        }

        let fields = match reg.build_initializer(grid).unwrap() {
            LLVMConst::Struct { fields, .. } => fields,
            other => panic!("expected a struct constant, got {other:?}"),
        };
        assert_eq!(fields.len(), 2);

        match &fields[0] {
            LLVMConst::Array { items, .. } => assert_eq!(items, &vec![base_init.clone()]),
            other => panic!("expected an array, got {other:?}"),
        }
        match &fields[1] {
            LLVMConst::Array { items, .. } => match &items[..] {
                [LLVMConst::Array { items: row, .. }] => assert_eq!(row, &vec![base_init.clone()]),
                other => panic!("expected one row, got {other:?}"),
            },
            other => panic!("expected an array, got {other:?}"),
        }
    }

    #[test]
    fn zero_sized_fields_do_not_hide_the_next_field() {
        let mut decls = DeclTable::new();
        let empty = decls.add(AggregateDecl::new("Empty", AggregateKind::Struct));
        let after_empty = decls.add(
            AggregateDecl::new("AfterEmpty", AggregateKind::Struct)
                .with_field("e", SemType::Aggregate(empty), DefaultValue::Zero)
                .with_field("x", SemType::I32, DefaultValue::Int(5)),
        );
        let after_tail = decls.add(
            AggregateDecl::new("AfterTail", AggregateKind::Struct)
                .with_field("tail", SemType::array_of(SemType::I32, 0), DefaultValue::Zero)
                .with_field("x", SemType::I32, DefaultValue::Int(5)),
        );

        let mut reg = LayoutRegistry::new(&decls);
        for id in [after_empty, after_tail] {
            reg.finalize(id).unwrap();

            let rec = reg.record(id).unwrap();
            assert_eq!(rec.size, 4);
            let x = rec.field_named("x").unwrap().1.ty;

            match reg.module().ty(rec.handle) {
                LLVMType::Struct { body: Some(b), .. } => assert_eq!(b.elements.as_slice(), &[x]),
                other => panic!("expected a filled struct, got {other:?}"),
            }

            match reg.build_initializer(id).unwrap() {
                LLVMConst::Struct { fields, .. } => {
                    assert_eq!(fields, vec![LLVMConst::Int { ty: x, value: 5 }]);
                }
                other => panic!("expected a struct constant, got {other:?}"),
            }
        }
    }

    #[test]
    fn bool_default_on_a_float_is_rejected() {
        let mut decls = DeclTable::new();
        let s = decls.add(
            AggregateDecl::new("F", AggregateKind::Struct)
                .with_field("d", SemType::F64, DefaultValue::Bool(true)),
        );

        let mut reg = LayoutRegistry::new(&decls);
        assert_eq!(
            reg.finalize(s),
            Err(LayoutError::InvalidDefault {
                aggregate: "F".intern(),
                field: "d".intern(),
            })
        );
    }

    #[test]
    fn integer_default_must_fit_the_field() {
        let mut decls = DeclTable::new();
        let wide = decls.add(
            AggregateDecl::new("Wide", AggregateKind::Struct).with_field("b", SemType::I8, DefaultValue::Int(300)),
        );
        let edge = decls.add(
            AggregateDecl::new("Edge", AggregateKind::Struct)
                .with_field("lo", SemType::I8, DefaultValue::Int(-128))
                .with_field("hi", SemType::I8, DefaultValue::Int(255)),
        );

        let mut reg = LayoutRegistry::new(&decls);
        reg.define(wide).unwrap();
        assert!(matches!(
            reg.resolve_field_defaults(wide),
            Err(LayoutError::InvalidDefault { .. })
        ));
        assert!(reg.finalize(edge).is_ok());
    }

    #[test]
    fn mismatched_default_is_rejected() {
        let mut decls = DeclTable::new();
        let s = decls.add(
            AggregateDecl::new("Odd", AggregateKind::Struct)
                .with_field("p", SemType::pointer_to(SemType::I8), DefaultValue::Float(1.5)),
        );

        let mut reg = LayoutRegistry::new(&decls);
        reg.define(s).unwrap();
        assert!(matches!(
            reg.resolve_field_defaults(s),
            Err(LayoutError::InvalidDefault { .. })
        ));
    }
}
