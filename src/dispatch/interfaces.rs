//! Interface subobjects and their tables.
//!
//! Each interface a class realizes gets a hidden pointer inside the class
//! layout, an index into the class's interface list, and a table holding
//! the implementation chosen for every interface method. A primary base
//! interface shares the subobject of the interface that extends it, so its
//! table is a prefix of the derived one. Secondary bases get a subobject
//! of their own.

use itertools::Itertools;

use crate::{
    decl::{DeclID, DeclTable, MethodSig},
    errors::{Diagnostic, LayoutError},
    helper::interner::{IStr, Internable},
    layout::{offsets::OffsetAllocator, FieldOrigin, LayoutRegistry, LayoutResult},
    llvm::{GlobalID, LLVMConst, LLVMPrimitive, LoweredTypeID},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Realization {
    /// listed by the class itself
    Direct,

    /// realized by an ancestor class, rebuilt with this class's methods
    Inherited { from: DeclID },

    /// first base of another realized interface, shares its subobject
    PrimaryBase { of: DeclID },

    /// any later base of another realized interface
    SecondaryBase { of: DeclID },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ISlot {
    pub sig: MethodSig,

    /// symbol of the chosen implementation, `None` leaves a null entry
    /// and only happens for abstract classes
    pub target: Option<IStr>,
}

#[derive(Clone, Debug)]
pub struct InterfaceImpl {
    pub iface: DeclID,
    pub relation: Realization,

    /// where the subobject pointer sits inside the class
    pub offset: u64,

    /// position in the class's interface list and descriptor array
    pub index: usize,

    pub slots: Vec<ISlot>,
    pub table_ty: Option<LoweredTypeID>,
    pub table: Option<GlobalID>,
    pub table_const: Option<LLVMConst>,

    /// the descriptor array entry for this interface
    pub info_const: Option<LLVMConst>,
    pub info_slot: Option<(GlobalID, usize)>,
    pub defined: bool,
}

impl InterfaceImpl {
    fn new(iface: DeclID, relation: Realization, offset: u64, index: usize) -> InterfaceImpl {
        InterfaceImpl {
            iface,
            relation,
            offset,
            index,
            slots: Vec::new(),
            table_ty: None,
            table: None,
            table_const: None,
            info_const: None,
            info_slot: None,
            defined: false,
        }
    }

    /// Address of this interface's entry in the class's descriptor array
    pub fn info_ref(&self) -> Option<LLVMConst> {
        self.info_slot
            .map(|(global, index)| LLVMConst::ElementRef { global, index })
    }
}

/// The method signatures of an interface table in slot order. The primary
/// base comes first so its table is a prefix, then the interface's own
/// methods, then the secondary bases. Each signature appears once
pub fn interface_slots(decls: &DeclTable, iface: DeclID) -> Vec<MethodSig> {
    fn walk(decls: &DeclTable, iface: DeclID, out: &mut Vec<MethodSig>, seen: &mut Vec<DeclID>) {
        if seen.contains(&iface) {
            return;
        }
        seen.push(iface);

        let decl = match decls.get(iface) {
            Some(d) => d,
            None => return,
        };

        if let Some(primary) = decl.interfaces.first() {
            walk(decls, *primary, out, seen);
        }

        for m in decl.methods.iter() {
            if !out.contains(&m.sig) {
                out.push(m.sig);
            }
        }

        for secondary in decl.interfaces.iter().skip(1) {
            walk(decls, *secondary, out, seen);
        }
    }

    let mut out = Vec::new();
    walk(decls, iface, &mut out, &mut Vec::new());
    out
}

/// Default bodies for `sig` in an interface hierarchy, depth first in
/// declaration order starting with the interface itself
fn default_candidates(decls: &DeclTable, iface: DeclID, sig: MethodSig) -> Vec<(DeclID, IStr)> {
    let mut found = Vec::new();
    let mut stack = vec![iface];
    let mut seen = Vec::new();

    while let Some(i) = stack.pop() {
        if seen.contains(&i) {
            continue;
        }
        seen.push(i);

        if let Some(decl) = decls.get(i) {
            if let Some(m) = decl.methods.iter().find(|m| m.sig == sig && !m.is_abstract) {
                found.push((i, m.symbol));
            }
            stack.extend(decl.interfaces.iter().rev().copied());
        }
    }

    found
}

impl<'d> LayoutRegistry<'d> {
    /// Places a subobject pointer for every interface the class realizes
    /// that its base did not already. Inherited entries keep their index
    /// and offset
    pub(crate) fn realize_interfaces(
        &mut self,
        class: DeclID,
        inherited: &[InterfaceImpl],
        alloc: &mut OffsetAllocator,
        ptr: LoweredTypeID,
    ) -> LayoutResult<Vec<InterfaceImpl>> {
        let decl = self.decl(class)?;

        let mut list: Vec<InterfaceImpl> = match decl.base {
            Some(base) => inherited
                .iter()
                .map(|i| {
                    InterfaceImpl::new(i.iface, Realization::Inherited { from: base }, i.offset, i.index)
                })
                .collect(),
            None => Vec::new(),
        };

        for iface in decl.interfaces.iter() {
            self.realize_one(*iface, Realization::Direct, None, &mut list, alloc, ptr)?;
        }

        Ok(list)
    }

    fn realize_one(
        &mut self,
        iface: DeclID,
        relation: Realization,
        shared_offset: Option<u64>,
        list: &mut Vec<InterfaceImpl>,
        alloc: &mut OffsetAllocator,
        ptr: LoweredTypeID,
    ) -> LayoutResult<()> {
        let decl = self.decl(iface)?;
        if !decl.is_interface() {
            return Err(LayoutError::WrongKind {
                decl: decl.name,
                expected: "interface",
                found: decl.kind,
            });
        }

        if list.iter().any(|i| i.iface == iface) {
            tracing::trace!("{} is already realized", decl.name);
            return Ok(());
        }

        self.declare(iface)?;

        let offset = match shared_offset {
            Some(o) => o,
            None => {
                let name = format!("__{}_vptr", decl.name).intern();
                alloc.place_hidden(FieldOrigin::InterfacePointer(iface), name, ptr, 8, 8)
            }
        };

        let index = list.len();
        list.push(InterfaceImpl::new(iface, relation, offset, index));

        for (n, base) in decl.interfaces.iter().enumerate() {
            if n == 0 {
                self.realize_one(*base, Realization::PrimaryBase { of: iface }, Some(offset), list, alloc, ptr)?;
            } else {
                self.realize_one(*base, Realization::SecondaryBase { of: iface }, None, list, alloc, ptr)?;
            }
        }

        Ok(())
    }

    /// Picks the code entity an interface slot dispatches to for `class`.
    ///
    /// A concrete method anywhere in the class chain wins, nearest class
    /// first. Otherwise an interface default is used, the interface's own
    /// default before any base's. When several bases offer different
    /// defaults the first in declaration order is taken and the ambiguity is
    /// recorded as a diagnostic
    pub fn resolve_interface_method(
        &mut self,
        class: DeclID,
        iface: DeclID,
        sig: MethodSig,
    ) -> LayoutResult<Option<IStr>> {
        let decls = self.decls();

        for c in decls.class_chain(class) {
            let decl = self.decl(c)?;
            if let Some(m) = decl.methods.iter().find(|m| m.sig == sig && !m.is_abstract) {
                return Ok(Some(m.symbol));
            }
        }

        let class_decl = self.decl(class)?;
        let iface_name = self.decl(iface)?.name;
        let candidates = default_candidates(decls, iface, sig);

        if let Some((owner, chosen)) = candidates.first().copied() {
            let distinct = candidates.iter().map(|(_, s)| *s).unique().collect_vec();

            if owner != iface && distinct.len() > 1 {
                tracing::warn!(
                    "{} has {} defaults for {sig} through {iface_name}, using {chosen}",
                    class_decl.name,
                    distinct.len()
                );

                self.diagnostics.push(Diagnostic::AmbiguousInterfaceMethod {
                    class: class_decl.name,
                    iface: iface_name,
                    method: sig,
                    chosen,
                    candidates: distinct,
                });
            }

            return Ok(Some(chosen));
        }

        if class_decl.is_abstract {
            Ok(None)
        } else {
            Err(LayoutError::UnimplementedInterfaceMethod {
                class: class_decl.name,
                iface: iface_name,
                method: sig,
            })
        }
    }

    /// Resolves every slot of every realized interface, then emits the
    /// tables and the descriptor array. If any slot fails nothing is
    /// emitted for the class
    pub fn build_interface_tables(&mut self, class: DeclID) -> LayoutResult<()> {
        let rec = self.defined(class)?;
        if rec.flags.interfaces_defined() {
            return Ok(());
        }

        let class_name = rec.name;
        let entries = rec
            .interface_list
            .iter()
            .map(|i| (i.iface, i.offset))
            .collect_vec();

        let mut resolved = Vec::with_capacity(entries.len());
        for (iface, _) in entries.iter() {
            self.finalize(*iface)?;

            let mut slots = Vec::new();
            for sig in interface_slots(self.decls(), *iface) {
                let target = self.resolve_interface_method(class, *iface, sig)?;
                slots.push(ISlot { sig, target });
            }
            resolved.push(slots);
        }

        let ptr = self.module.opaque_pointer();
        let i64_t = self.module.primitive(LLVMPrimitive::i64_t);
        let info_ty = self.interface_info_type();

        let mut infos = Vec::with_capacity(entries.len());
        for (idx, ((iface, offset), slots)) in entries.into_iter().zip(resolved).enumerate() {
            let iface_name = self.decl(iface)?.name;

            let table_ty = self.module.array_of(ptr, slots.len() as u64);
            let table = self.module.add_global(
                format!("{class_name}.__{iface_name}.__vtbl").intern(),
                table_ty,
                true,
            );

            let items = slots
                .iter()
                .map(|s| s.target.map(LLVMConst::FunctionRef).unwrap_or(LLVMConst::Null))
                .collect();
            let table_const = LLVMConst::Array { elem: ptr, items };
            self.module.set_initializer(table, table_const.clone());

            let iface_info = self.type_info_slot(iface)?;
            let info_const = LLVMConst::Struct {
                ty: info_ty,
                fields: vec![
                    LLVMConst::GlobalRef(iface_info),
                    LLVMConst::GlobalRef(table),
                    LLVMConst::Int {
                        ty: i64_t,
                        value: offset as i64,
                    },
                ],
            };
            infos.push(info_const.clone());

            let entry = &mut self.record_mut(class)?.interface_list[idx];
            entry.slots = slots;
            entry.table_ty = Some(table_ty);
            entry.table = Some(table);
            entry.table_const = Some(table_const);
            entry.info_const = Some(info_const);
            entry.defined = true;
        }

        if !infos.is_empty() {
            let count = infos.len();
            let array_ty = self.module.array_of(info_ty, count as u64);
            let array = self
                .module
                .add_global(format!("{class_name}.__interfaces").intern(), array_ty, true);
            self.module.set_initializer(
                array,
                LLVMConst::Array {
                    elem: info_ty,
                    items: infos,
                },
            );

            let rec = self.record_mut(class)?;
            rec.interface_info_array_ty = Some(array_ty);
            rec.interface_info_array = Some(array);
            for (idx, entry) in rec.interface_list.iter_mut().enumerate() {
                entry.info_slot = Some((array, idx));
            }
        }

        self.record_mut(class)?.flags.set_interfaces_defined(true);

        tracing::info!("built {} interface tables for {class_name}", self.existing(class)?.interface_list.len());

        self.sync_hidden_inits(class)
    }

    /// The realization of `iface` by `class`, only once its table exists
    pub fn interface_table(&self, class: DeclID, iface: DeclID) -> LayoutResult<&InterfaceImpl> {
        let rec = self.existing(class)?;
        let entry = rec.interface(iface).ok_or(LayoutError::InterfaceNotRealized {
            class: rec.name,
            iface: self.decl(iface)?.name,
        })?;

        if entry.defined {
            Ok(entry)
        } else {
            Err(LayoutError::DispatchNotDefined {
                aggregate: rec.name,
                table: "interface table",
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::{fixtures, AggregateDecl, AggregateKind, DefaultValue, SemType, Virtuality};

    fn targets(entry: &InterfaceImpl) -> Vec<Option<String>> {
        entry
            .slots
            .iter()
            .map(|s| s.target.map(|t| t.to_string()))
            .collect()
    }

    #[test]
    fn each_interface_gets_an_index_and_a_subobject() {
        let mut decls = DeclTable::new();
        let shape = fixtures::shape(&mut decls);
        let named = fixtures::named(&mut decls);
        let c = decls.add(
            AggregateDecl::new("Circle", AggregateKind::Class)
                .with_field("r", SemType::F64, DefaultValue::Float(1.0))
                .with_interface(shape)
                .with_interface(named)
                .with_method("area", "fn() -> f64", "Circle.area", Virtuality::Final)
                .with_method("name", "fn() -> ptr", "Circle.name", Virtuality::Final),
        );

        let mut reg = LayoutRegistry::new(&decls);
        reg.finalize(c).unwrap();

        let rec = reg.record(c).unwrap();
        assert_eq!(rec.interface_map[&shape], 0);
        assert_eq!(rec.interface_map[&named], 1);
        assert_eq!(rec.size, 24);

        let s = reg.interface_table(c, shape).unwrap();
        let n = reg.interface_table(c, named).unwrap();
        assert_eq!(s.offset, 8);
        assert_eq!(n.offset, 16);
        assert_eq!(targets(s), vec![Some("Circle.area".to_owned())]);
        assert_eq!(s.info_slot, Some((rec.interface_info_array.unwrap(), 0)));
        assert_eq!(
            n.info_ref(),
            Some(LLVMConst::ElementRef {
                global: rec.interface_info_array.unwrap(),
                index: 1,
            })
        );

        let hidden = &reg.fields_at(c, 8)[0];
        assert_eq!(hidden.origin, FieldOrigin::InterfacePointer(shape));
        assert_eq!(hidden.init, Some(LLVMConst::GlobalRef(s.table.unwrap())));

        let array = reg.module().global_named("Circle.__interfaces").unwrap();
        let items = match &reg.module().global(array).init {
            Some(LLVMConst::Array { items, .. }) => items.clone(),
            other => panic!("expected the descriptor array, got {other:?}"),
        };
        assert_eq!(items.len(), 2);

        // entry i describes the table whose index is i
        for (item, (iface, table)) in items.iter().zip([("Shape", s), ("Named", n)]) {
            let info = reg.module().global_named(&format!("{iface}.__typeinfo")).unwrap();
            match item {
                LLVMConst::Struct { fields, .. } => {
                    assert_eq!(fields[0], LLVMConst::GlobalRef(info));
                    assert_eq!(fields[1], LLVMConst::GlobalRef(table.table.unwrap()));
                    assert!(matches!(fields[2], LLVMConst::Int { value, .. } if value == table.offset as i64));
                }
                other => panic!("expected an interface descriptor, got {other:?}"),
            }
        }
    }

    #[test]
    fn missing_implementation_is_an_error() {
        let mut decls = DeclTable::new();
        let shape = fixtures::shape(&mut decls);
        let c = decls.add(AggregateDecl::new("Blob", AggregateKind::Class).with_interface(shape));

        let mut reg = LayoutRegistry::new(&decls);
        reg.define(c).unwrap();

        match reg.build_interface_tables(c) {
            Err(LayoutError::UnimplementedInterfaceMethod { class, iface, .. }) => {
                assert_eq!(class, "Blob".intern());
                assert_eq!(iface, "Shape".intern());
            }
            other => panic!("expected an unimplemented method, got {other:?}"),
        }

        assert!(reg.module().global_named("Blob.__Shape.__vtbl").is_none());
        assert!(matches!(
            reg.interface_table(c, shape),
            Err(LayoutError::DispatchNotDefined { .. })
        ));
    }

    #[test]
    fn abstract_classes_leave_null_entries() {
        let mut decls = DeclTable::new();
        let shape = fixtures::shape(&mut decls);
        let c = decls.add(
            AggregateDecl::new("Blob", AggregateKind::Class)
                .with_interface(shape)
                .abstract_class(),
        );

        let mut reg = LayoutRegistry::new(&decls);
        reg.finalize(c).unwrap();

        assert_eq!(targets(reg.interface_table(c, shape).unwrap()), vec![None]);
    }

    #[test]
    fn ancestor_methods_implement_interfaces() {
        let mut decls = DeclTable::new();
        let shape = fixtures::shape(&mut decls);
        let base = decls.add(
            AggregateDecl::new("Base", AggregateKind::Class)
                .with_method("area", "fn() -> f64", "Base.area", Virtuality::Introduces),
        );
        let c = decls.add(
            AggregateDecl::new("Square", AggregateKind::Class)
                .with_base(base)
                .with_interface(shape),
        );

        let mut reg = LayoutRegistry::new(&decls);
        reg.finalize(c).unwrap();

        let t = reg.interface_table(c, shape).unwrap();
        assert_eq!(targets(t), vec![Some("Base.area".to_owned())]);
        assert_eq!(t.relation, Realization::Direct);
    }

    #[test]
    fn inherited_interfaces_keep_their_slot_and_are_rebuilt() {
        let mut decls = DeclTable::new();
        let shape = fixtures::shape(&mut decls);
        let base = decls.add(
            AggregateDecl::new("Base", AggregateKind::Class)
                .with_interface(shape)
                .with_method("area", "fn() -> f64", "Base.area", Virtuality::Introduces),
        );
        let derived = decls.add(
            AggregateDecl::new("Derived", AggregateKind::Class)
                .with_base(base)
                .with_interface(shape)
                .with_method("area", "fn() -> f64", "Derived.area", Virtuality::Overrides),
        );

        let mut reg = LayoutRegistry::new(&decls);
        reg.finalize(base).unwrap();
        reg.finalize(derived).unwrap();

        let b = reg.interface_table(base, shape).unwrap();
        let d = reg.interface_table(derived, shape).unwrap();

        assert_eq!(reg.record(derived).unwrap().interface_list.len(), 1);
        assert_eq!(d.offset, b.offset);
        assert_eq!(d.index, b.index);
        assert_eq!(d.relation, Realization::Inherited { from: base });
        assert_ne!(d.table, b.table);
        assert_eq!(targets(d), vec![Some("Derived.area".to_owned())]);
        assert_eq!(reg.record(derived).unwrap().size, reg.record(base).unwrap().size);
    }

    #[test]
    fn primary_base_shares_the_subobject() {
        let mut decls = DeclTable::new();
        let shape = fixtures::shape(&mut decls);
        let named = fixtures::named(&mut decls);
        let solid = decls.add(
            AggregateDecl::new("Solid", AggregateKind::Interface)
                .with_interface(shape)
                .with_interface(named)
                .with_abstract_method("volume", "fn() -> f64", "Solid.volume"),
        );
        let c = decls.add(
            AggregateDecl::new("Cube", AggregateKind::Class)
                .with_interface(solid)
                .with_method("area", "fn() -> f64", "Cube.area", Virtuality::Final)
                .with_method("name", "fn() -> ptr", "Cube.name", Virtuality::Final)
                .with_method("volume", "fn() -> f64", "Cube.volume", Virtuality::Final),
        );

        let mut reg = LayoutRegistry::new(&decls);
        reg.finalize(c).unwrap();

        let s = reg.interface_table(c, solid).unwrap();
        let p = reg.interface_table(c, shape).unwrap();
        let n = reg.interface_table(c, named).unwrap();

        assert_eq!(p.offset, s.offset);
        assert_ne!(n.offset, s.offset);
        assert_eq!(p.relation, Realization::PrimaryBase { of: solid });
        assert_eq!(n.relation, Realization::SecondaryBase { of: solid });
        assert_eq!(
            targets(s),
            vec![
                Some("Cube.area".to_owned()),
                Some("Cube.volume".to_owned()),
                Some("Cube.name".to_owned()),
            ]
        );
        assert_eq!(reg.record(c).unwrap().interface_list.len(), 3);
    }

    #[test]
    fn conflicting_defaults_are_reported() {
        let mut decls = DeclTable::new();
        let left = decls.add(
            AggregateDecl::new("Left", AggregateKind::Interface)
                .with_method("hello", "fn()", "Left.hello", Virtuality::Introduces),
        );
        let right = decls.add(
            AggregateDecl::new("Right", AggregateKind::Interface)
                .with_method("hello", "fn()", "Right.hello", Virtuality::Introduces),
        );
        let both = decls.add(
            AggregateDecl::new("Both", AggregateKind::Interface)
                .with_interface(left)
                .with_interface(right),
        );
        let c = decls.add(AggregateDecl::new("Greeter", AggregateKind::Class).with_interface(both));

        let mut reg = LayoutRegistry::new(&decls);
        reg.finalize(c).unwrap();

        assert_eq!(
            targets(reg.interface_table(c, both).unwrap()),
            vec![Some("Left.hello".to_owned())]
        );
        assert!(reg.diagnostics().iter().any(|d| matches!(
            d,
            Diagnostic::AmbiguousInterfaceMethod { chosen, .. } if *chosen == "Left.hello".intern()
        )));
    }

    #[test]
    fn own_default_beats_base_defaults() {
        let mut decls = DeclTable::new();
        let left = decls.add(
            AggregateDecl::new("Left", AggregateKind::Interface)
                .with_method("hello", "fn()", "Left.hello", Virtuality::Introduces),
        );
        let refined = decls.add(
            AggregateDecl::new("Refined", AggregateKind::Interface)
                .with_interface(left)
                .with_method("hello", "fn()", "Refined.hello", Virtuality::Introduces),
        );
        let c = decls.add(AggregateDecl::new("Greeter", AggregateKind::Class).with_interface(refined));

        let mut reg = LayoutRegistry::new(&decls);
        reg.finalize(c).unwrap();

        assert_eq!(
            targets(reg.interface_table(c, refined).unwrap()),
            vec![Some("Refined.hello".to_owned())]
        );
        assert!(reg.diagnostics().is_empty());
    }

    #[test]
    fn slot_order_puts_the_primary_base_first() {
        let mut decls = DeclTable::new();
        let shape = fixtures::shape(&mut decls);
        let named = fixtures::named(&mut decls);
        let solid = decls.add(
            AggregateDecl::new("Solid", AggregateKind::Interface)
                .with_interface(shape)
                .with_interface(named)
                .with_abstract_method("volume", "fn() -> f64", "Solid.volume"),
        );

        let names = interface_slots(&decls, solid)
            .into_iter()
            .map(|s| s.name.to_string())
            .collect_vec();
        assert_eq!(names, vec!["area", "volume", "name"]);
    }

    #[test]
    fn only_interfaces_can_be_realized() {
        let mut decls = DeclTable::new();
        let p = fixtures::point(&mut decls);
        let c = decls.add(AggregateDecl::new("Odd", AggregateKind::Class).with_interface(p));

        let mut reg = LayoutRegistry::new(&decls);
        assert!(matches!(reg.define(c), Err(LayoutError::WrongKind { .. })));
    }
}
