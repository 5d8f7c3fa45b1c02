//! The class dispatch table.
//!
//! Slots are inherited from the base in order, an override takes over the
//! slot it matches and new virtual methods append. The table is declared
//! first so that the hidden pointer can refer to it, and filled later.

use itertools::Itertools;

use crate::{
    decl::{DeclID, DeclTable, MethodRef, MethodSig, Virtuality},
    errors::LayoutError,
    helper::interner::Internable,
    layout::{LayoutRegistry, LayoutResult},
    llvm::{GlobalID, LLVMConst},
};

#[derive(Clone, Debug, PartialEq)]
pub struct VSlot {
    pub sig: MethodSig,

    /// the method currently associated with the slot
    pub method: MethodRef,
}

/// Computes the slots of a class from the root of its chain down
pub fn dispatch_slots(decls: &DeclTable, class: DeclID) -> LayoutResult<Vec<VSlot>> {
    let mut slots: Vec<VSlot> = Vec::new();

    for c in decls.class_chain(class).into_iter().rev() {
        let decl = decls.get(c).ok_or(LayoutError::UnknownDeclaration(c))?;
        let inherited = slots.len();

        for (index, m) in decl.methods.iter().enumerate() {
            let method = MethodRef { owner: c, index };

            match m.virtuality {
                Virtuality::Final => {}
                Virtuality::Introduces => slots.push(VSlot { sig: m.sig, method }),
                Virtuality::Overrides => {
                    let hits = slots[..inherited]
                        .iter()
                        .positions(|s| s.sig == m.sig)
                        .collect_vec();

                    match hits.as_slice() {
                        [at] => slots[*at].method = method,
                        _ => {
                            return Err(LayoutError::DanglingOverride {
                                class: decl.name,
                                method: m.sig,
                                candidates: hits.len(),
                            })
                        }
                    }
                }
            }
        }
    }

    Ok(slots)
}

impl<'d> LayoutRegistry<'d> {
    fn expect_class(&self, id: DeclID) -> LayoutResult<()> {
        let decl = self.decl(id)?;
        if decl.is_class() {
            Ok(())
        } else {
            Err(LayoutError::WrongKind {
                decl: decl.name,
                expected: "class",
                found: decl.kind,
            })
        }
    }

    /// Computes the slots and creates the table global without a value.
    /// Classes with no dispatched method anywhere in their chain have no
    /// table and get `None`
    pub fn declare_vtable(&mut self, class: DeclID) -> LayoutResult<Option<GlobalID>> {
        self.expect_class(class)?;
        self.declare(class)?;

        let rec = self.existing(class)?;
        if rec.flags.vtable_declared() {
            return Ok(rec.vtable);
        }

        if !self.decls().has_virtual_behavior(class) {
            return Ok(None);
        }

        let name = rec.name;
        let slots = dispatch_slots(self.decls(), class)?;

        let ptr = self.module.opaque_pointer();
        let ty = self.module.array_of(ptr, slots.len() as u64);
        let g = self
            .module
            .add_global(format!("{name}.__vtbl").intern(), ty, true);

        tracing::debug!("declared vtable of {name} with {} slots", slots.len());

        let rec = self.record_mut(class)?;
        rec.vtable_slots = slots;
        rec.vtable = Some(g);
        rec.flags.set_vtable_declared(true);

        self.sync_hidden_inits(class)?;

        Ok(Some(g))
    }

    /// Gives the declared table its value. Abstract slots hold null
    pub fn define_vtable(&mut self, class: DeclID) -> LayoutResult<Option<GlobalID>> {
        let g = match self.declare_vtable(class)? {
            Some(g) => g,
            None => return Ok(None),
        };

        let rec = self.existing(class)?;
        if rec.flags.vtable_defined() {
            return Ok(Some(g));
        }

        let name = rec.name;
        let mut items = Vec::with_capacity(rec.vtable_slots.len());
        for slot in rec.vtable_slots.iter() {
            let m = self
                .decls()
                .method(slot.method)
                .ok_or(LayoutError::UnknownDeclaration(slot.method.owner))?;

            items.push(if m.is_abstract {
                LLVMConst::Null
            } else {
                LLVMConst::FunctionRef(m.symbol)
            });
        }

        let elem = self.module.opaque_pointer();
        let constant = LLVMConst::Array { elem, items };
        self.module.set_initializer(g, constant.clone());

        let rec = self.record_mut(class)?;
        rec.vtable_const = Some(constant);
        rec.flags.set_vtable_defined(true);

        tracing::info!("defined vtable of {name}");

        Ok(Some(g))
    }

    pub fn vtable_constant(&self, class: DeclID) -> LayoutResult<&LLVMConst> {
        let rec = self.existing(class)?;
        match (&rec.vtable_const, rec.flags.vtable_defined()) {
            (Some(c), true) => Ok(c),
            _ => Err(LayoutError::DispatchNotDefined {
                aggregate: rec.name,
                table: "vtable",
            }),
        }
    }
}
