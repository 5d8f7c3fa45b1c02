//! Runtime type descriptors.
//!
//! Every aggregate gets one `TypeInfo` global:
//!
//! ```text
//! TypeInfo      { ptr name, i64 size, ptr vtable, ptr base, ptr interfaces, i64 count, ptr init }
//! InterfaceInfo { ptr typeinfo, ptr table, i64 offset }
//! ```
//!
//! The global is created as soon as something needs its address, which can
//! be long before the aggregate itself is finished. Interfaces report a
//! size of 0 since they are never instantiated.

use crate::{
    decl::DeclID,
    errors::LayoutError,
    helper::interner::{Internable, SpurHelper},
    layout::{LayoutRegistry, LayoutResult},
    llvm::{GlobalID, LLVMConst, LLVMPrimitive, LoweredTypeID},
};

impl<'d> LayoutRegistry<'d> {
    pub(crate) fn type_info_type(&mut self) -> LoweredTypeID {
        if let Some(t) = self.type_info_ty {
            return t;
        }

        let ptr = self.module.opaque_pointer();
        let i64_t = self.module.primitive(LLVMPrimitive::i64_t);
        let t = self
            .module
            .named_struct("TypeInfo".intern(), &[ptr, i64_t, ptr, ptr, ptr, i64_t, ptr]);

        self.type_info_ty = Some(t);
        t
    }

    pub(crate) fn interface_info_type(&mut self) -> LoweredTypeID {
        if let Some(t) = self.interface_info_ty {
            return t;
        }

        let ptr = self.module.opaque_pointer();
        let i64_t = self.module.primitive(LLVMPrimitive::i64_t);
        let t = self
            .module
            .named_struct("InterfaceInfo".intern(), &[ptr, ptr, i64_t]);

        self.interface_info_ty = Some(t);
        t
    }

    /// The descriptor global of an aggregate, created empty on first use
    pub fn type_info_slot(&mut self, id: DeclID) -> LayoutResult<GlobalID> {
        self.declare(id)?;

        if let Some(g) = self.existing(id)?.type_info {
            return Ok(g);
        }

        let ty = self.type_info_type();
        let name = self.existing(id)?.name;
        let g = self
            .module
            .add_global(format!("{name}.__typeinfo").intern(), ty, true);

        self.record_mut(id)?.type_info = Some(g);

        Ok(g)
    }

    /// Fills the descriptor of a defined aggregate. For classes the
    /// dispatch table and interface tables have to be defined first. The
    /// result is cached
    pub fn build_type_descriptor(&mut self, id: DeclID) -> LayoutResult<LLVMConst> {
        let rec = self.defined(id)?;
        if let Some(c) = &rec.type_info_const {
            return Ok(c.clone());
        }

        let decl = self.decl(id)?;
        let name = rec.name;

        if decl.is_class() {
            if self.decls().has_virtual_behavior(id) && !rec.flags.vtable_defined() {
                return Err(LayoutError::DispatchNotDefined {
                    aggregate: name,
                    table: "vtable",
                });
            }

            if !rec.flags.interfaces_defined() {
                return Err(LayoutError::DispatchNotDefined {
                    aggregate: name,
                    table: "interface tables",
                });
            }
        }

        let size = if decl.is_interface() { 0 } else { rec.size };
        let vtable = rec.vtable;
        let interfaces = rec.interface_info_array;
        let count = rec.interface_list.len();
        let init = rec.default_init;

        let text = name.resolve();
        let name_ty = self.module.byte_array(text.len() as u64 + 1);
        let name_g = self
            .module
            .add_global(format!("{name}.__name").intern(), name_ty, true);
        self.module.set_initializer(name_g, LLVMConst::CString(name));

        let base = match decl.base {
            Some(b) if decl.is_class() => LLVMConst::GlobalRef(self.type_info_slot(b)?),
            _ => LLVMConst::Null,
        };

        let or_null = |g: Option<GlobalID>| g.map(LLVMConst::GlobalRef).unwrap_or(LLVMConst::Null);

        let ty = self.type_info_type();
        let i64_t = self.module.primitive(LLVMPrimitive::i64_t);
        let constant = LLVMConst::Struct {
            ty,
            fields: vec![
                LLVMConst::GlobalRef(name_g),
                LLVMConst::Int {
                    ty: i64_t,
                    value: size as i64,
                },
                or_null(vtable),
                base,
                or_null(interfaces),
                LLVMConst::Int {
                    ty: i64_t,
                    value: count as i64,
                },
                or_null(init),
            ],
        };

        let slot = self.type_info_slot(id)?;
        self.module.set_initializer(slot, constant.clone());
        self.record_mut(id)?.type_info_const = Some(constant.clone());

        tracing::debug!("built type descriptor of {name}");

        Ok(constant)
    }
}
