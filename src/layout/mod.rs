//! Aggregate layout records and the registry that owns them.
//!
//! A record goes through `declare` (an opaque handle exists) and `define`
//! (offsets and struct body are final). Other records may capture the handle
//! in between, which is how self and mutual reference through pointers work.

pub mod init;
pub mod offsets;

use std::collections::BTreeMap;

use itertools::Itertools;
use modular_bitfield::prelude::*;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{
    decl::{AggregateDecl, AggregateKind, DeclID, DeclTable, Member, SemType},
    dispatch::{interfaces::InterfaceImpl, vtable::VSlot},
    errors::{Diagnostic, LayoutError},
    helper::interner::{IStr, Internable},
    llvm::{GlobalID, LLVMConst, LLVMPrimitive, LoweredTypeID, Module, StructBody},
};

use offsets::{OffsetAllocator, Placement};

pub type LayoutResult<T> = Result<T, LayoutError>;

#[derive(PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy, Debug)]
pub struct RecordID(pub u32);

#[bitfield]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct RecordFlags {
    pub declared: bool,
    pub defined: bool,
    pub const_inited: bool,
    pub has_unions: bool,
    pub vtable_declared: bool,
    pub vtable_defined: bool,
    pub interfaces_defined: bool,
    #[skip]
    __: B1,
}

assert_eq_size!(RecordFlags, u8);

impl std::fmt::Debug for RecordFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordFlags")
            .field("declared", &self.declared())
            .field("defined", &self.defined())
            .field("const_inited", &self.const_inited())
            .field("has_unions", &self.has_unions())
            .field("vtable_declared", &self.vtable_declared())
            .field("vtable_defined", &self.vtable_defined())
            .field("interfaces_defined", &self.interfaces_defined())
            .finish()
    }
}

/// Points at a declared field, `index` is the position in
/// `AggregateDecl::fields` of `owner`
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct FieldRef {
    pub owner: DeclID,
    pub index: usize,
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum FieldOrigin {
    Declared(FieldRef),

    /// The hidden pointer to the class dispatch table
    VTablePointer,

    /// The hidden pointer of an interface subobject
    InterfacePointer(DeclID),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDescriptor {
    pub origin: FieldOrigin,
    pub name: IStr,
    pub ty: LoweredTypeID,
    pub size: u64,

    /// default value, filled lazily as whatever it depends on resolves
    pub init: Option<LLVMConst>,
}

/// Offset -> fields placed there. Union members share a key, and within a
/// key fields stay in declaration order
pub type OffsetMap = BTreeMap<u64, SmallVec<[FieldDescriptor; 1]>>;

#[derive(Debug)]
pub struct AggregateRecord {
    pub decl: DeclID,
    pub name: IStr,
    pub kind: AggregateKind,

    /// stable for the lifetime of the record, the body is filled in place
    pub handle: LoweredTypeID,

    pub offsets: OffsetMap,
    pub default_fields: Vec<FieldOrigin>,
    pub size: u64,
    pub align: u64,
    pub flags: RecordFlags,

    /// where the vtable pointer sits, if the class has one
    pub vptr_offset: Option<u64>,

    pub interface_map: BTreeMap<DeclID, usize>,
    pub interface_list: Vec<InterfaceImpl>,
    pub interface_info_array_ty: Option<LoweredTypeID>,
    pub interface_info_array: Option<GlobalID>,

    pub vtable_slots: Vec<VSlot>,
    pub vtable: Option<GlobalID>,
    pub vtable_const: Option<LLVMConst>,

    pub default_init: Option<GlobalID>,
    pub default_init_const: Option<LLVMConst>,

    pub type_info: Option<GlobalID>,
    pub type_info_const: Option<LLVMConst>,
}

impl AggregateRecord {
    fn new(decl: DeclID, name: IStr, kind: AggregateKind, handle: LoweredTypeID) -> AggregateRecord {
        AggregateRecord {
            decl,
            name,
            kind,
            handle,
            offsets: OffsetMap::new(),
            default_fields: Vec::new(),
            size: 0,
            align: 1,
            flags: RecordFlags::new().with_declared(true),
            vptr_offset: None,
            interface_map: BTreeMap::new(),
            interface_list: Vec::new(),
            interface_info_array_ty: None,
            interface_info_array: None,
            vtable_slots: Vec::new(),
            vtable: None,
            vtable_const: None,
            default_init: None,
            default_init_const: None,
            type_info: None,
            type_info_const: None,
        }
    }

    pub fn is_declared(&self) -> bool {
        self.flags.declared()
    }

    pub fn is_defined(&self) -> bool {
        self.flags.defined()
    }

    pub fn has_unions(&self) -> bool {
        self.flags.has_unions()
    }

    /// All fields placed at `offset`, 0..N of them
    pub fn fields_at(&self, offset: u64) -> &[FieldDescriptor] {
        self.offsets
            .get(&offset)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn field_named(&self, name: &str) -> Option<(u64, &FieldDescriptor)> {
        let name = name.intern();
        self.offsets
            .iter()
            .flat_map(|(o, v)| v.iter().map(move |f| (*o, f)))
            .find(|(_, f)| f.name == name)
    }

    pub fn interface(&self, iface: DeclID) -> Option<&InterfaceImpl> {
        self.interface_map
            .get(&iface)
            .and_then(|i| self.interface_list.get(*i))
    }
}

/// Owns every record of one compilation together with the module they
/// emit into. Records are keyed by declaration identity and live until the
/// registry is dropped.
pub struct LayoutRegistry<'d> {
    decls: &'d DeclTable,
    pub(crate) module: Module,
    pub(crate) records: Vec<AggregateRecord>,
    by_decl: FxHashMap<DeclID, RecordID>,

    /// aggregates whose definition is in progress, outermost first
    defining: Vec<DeclID>,
    pub(crate) diagnostics: Vec<Diagnostic>,

    pub(crate) type_info_ty: Option<LoweredTypeID>,
    pub(crate) interface_info_ty: Option<LoweredTypeID>,
}

impl<'d> LayoutRegistry<'d> {
    pub fn new(decls: &'d DeclTable) -> LayoutRegistry<'d> {
        LayoutRegistry {
            decls,
            module: Module::new(),
            records: Vec::new(),
            by_decl: FxHashMap::default(),
            defining: Vec::new(),
            diagnostics: Vec::new(),
            type_info_ty: None,
            interface_info_ty: None,
        }
    }

    pub fn decls(&self) -> &'d DeclTable {
        self.decls
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub(crate) fn decl(&self, id: DeclID) -> LayoutResult<&'d AggregateDecl> {
        self.decls.get(id).ok_or(LayoutError::UnknownDeclaration(id))
    }

    pub fn record(&self, id: DeclID) -> Option<&AggregateRecord> {
        self.by_decl.get(&id).map(|r| &self.records[r.0 as usize])
    }

    pub(crate) fn record_mut(&mut self, id: DeclID) -> LayoutResult<&mut AggregateRecord> {
        match self.by_decl.get(&id) {
            Some(r) => Ok(&mut self.records[r.0 as usize]),
            None => Err(LayoutError::UnknownDeclaration(id)),
        }
    }

    pub(crate) fn existing(&self, id: DeclID) -> LayoutResult<&AggregateRecord> {
        self.record(id).ok_or(LayoutError::UnknownDeclaration(id))
    }

    pub(crate) fn defined(&self, id: DeclID) -> LayoutResult<&AggregateRecord> {
        let rec = self.existing(id)?;
        if rec.is_defined() {
            Ok(rec)
        } else {
            Err(LayoutError::NotDefined { aggregate: rec.name })
        }
    }

    /// Every record in the order it was declared
    pub fn records(&self) -> impl Iterator<Item = (DeclID, &AggregateRecord)> {
        self.records.iter().map(|r| (r.decl, r))
    }

    pub fn handle(&self, id: DeclID) -> Option<LoweredTypeID> {
        self.record(id).map(|r| r.handle)
    }

    pub fn fields_at(&self, id: DeclID, offset: u64) -> &[FieldDescriptor] {
        self.record(id).map(|r| r.fields_at(offset)).unwrap_or(&[])
    }

    /// Creates the record for a declaration if needed and returns its
    /// opaque handle. Never touches the body, so it is safe to call while
    /// any other aggregate is halfway through its definition
    pub fn declare(&mut self, id: DeclID) -> LayoutResult<LoweredTypeID> {
        if let Some(r) = self.by_decl.get(&id) {
            return Ok(self.records[r.0 as usize].handle);
        }

        let decl = self.decl(id)?;
        let handle = self.module.opaque_struct(decl.name);

        tracing::debug!("declared {} ({}) as {handle}", decl.name, decl.kind);

        let rid = RecordID(self.records.len() as u32);
        self.records
            .push(AggregateRecord::new(id, decl.name, decl.kind, handle));
        self.by_decl.insert(id, rid);

        Ok(handle)
    }

    /// Finalizes the offsets and body of an aggregate. A second call is a
    /// no-op. Embedding an aggregate by value that is still being defined
    /// further up the stack is a `CyclicLayout`, and leaves every record on
    /// that cycle undefined
    pub fn define(&mut self, id: DeclID) -> LayoutResult<()> {
        self.declare(id)?;

        if self.existing(id)?.is_defined() {
            return Ok(());
        }

        if let Some(start) = self.defining.iter().position(|d| *d == id) {
            let mut path = Vec::new();
            for d in self.defining[start..].iter() {
                path.push(self.decl(*d)?.name);
            }
            path.push(self.decl(id)?.name);

            tracing::warn!("layout cycle through {}", path.iter().join(" -> "));

            return Err(LayoutError::CyclicLayout { path });
        }

        self.defining.push(id);
        let result = self.define_inner(id);
        self.defining.pop();

        result
    }

    fn define_inner(&mut self, id: DeclID) -> LayoutResult<()> {
        let decl = self.decl(id)?;
        let ptr = self.module.opaque_pointer();

        let mut alloc = OffsetAllocator::new(decl.kind == AggregateKind::Union);
        let mut inherited = Vec::new();
        let mut vptr_offset = None;

        if decl.is_class() {
            if let Some(base) = decl.base {
                let base_decl = self.decl(base)?;
                if !base_decl.is_class() {
                    return Err(LayoutError::WrongKind {
                        decl: base_decl.name,
                        expected: "class",
                        found: base_decl.kind,
                    });
                }

                self.define(base)?;
                let base_rec = self.existing(base)?;

                alloc.inherit(
                    &base_rec.offsets,
                    &base_rec.default_fields,
                    base_rec.size,
                    base_rec.align,
                    base_rec.has_unions(),
                );
                inherited = base_rec.interface_list.clone();
                vptr_offset = base_rec.vptr_offset;
            }

            if vptr_offset.is_none() && self.decls.has_virtual_behavior(id) {
                let name = "__vptr".intern();
                let offset = alloc.place_hidden(FieldOrigin::VTablePointer, name, ptr, 8, 8);
                vptr_offset = Some(offset);
            }
        }

        let mut counter = 0;
        self.lay_out_members(id, &decl.members, &mut alloc, &mut counter)?;

        let interfaces = if decl.is_class() {
            self.realize_interfaces(id, &inherited, &mut alloc, ptr)?
        } else {
            Vec::new()
        };

        let placement = alloc.finish();
        let body = self.body_for(&placement);

        // nothing above touched the record, so a failure leaves it declared only
        let handle = self.existing(id)?.handle;
        self.module.set_body(handle, body);

        let init_name = format!("{}.__init", decl.name).intern();
        let init = self.module.add_global(init_name, handle, true);

        let rec = self.record_mut(id)?;
        let Placement {
            offsets,
            default_fields,
            size,
            align,
            has_unions,
        } = placement;

        rec.offsets = offsets;
        rec.default_fields = default_fields;
        rec.size = size;
        rec.align = align;
        rec.vptr_offset = vptr_offset;
        rec.flags.set_has_unions(has_unions);
        rec.interface_map = interfaces
            .iter()
            .map(|i| (i.iface, i.index))
            .collect();
        rec.interface_list = interfaces;
        rec.default_init = Some(init);
        rec.flags.set_defined(true);

        tracing::info!(
            "defined {} with size {size}, align {align}, {} interfaces",
            decl.name,
            self.existing(id)?.interface_list.len()
        );

        self.sync_hidden_inits(id)
    }

    /// Places a member list into `alloc`. Anonymous groups are laid out on
    /// their own starting at 0 and merged at wherever the group lands
    fn lay_out_members(
        &mut self,
        owner: DeclID,
        members: &[Member],
        alloc: &mut OffsetAllocator,
        counter: &mut usize,
    ) -> LayoutResult<()> {
        let owner_name = self.decl(owner)?.name;

        for m in members {
            match m {
                Member::Field(f) => {
                    let fref = FieldRef {
                        owner,
                        index: *counter,
                    };
                    *counter += 1;

                    let ty = self.lower_embedded(&f.ty)?;
                    let (size, align) = match (self.module.size_of(ty), self.module.align_of(ty)) {
                        (Some(s), Some(a)) => (s, a),
                        _ => {
                            return Err(LayoutError::UnsizedField {
                                aggregate: owner_name,
                                field: f.name,
                            })
                        }
                    };

                    alloc.place(
                        FieldDescriptor {
                            origin: FieldOrigin::Declared(fref),
                            name: f.name,
                            ty,
                            size,
                            init: None,
                        },
                        align,
                    );
                }
                Member::Union(inner) | Member::Struct(inner) => {
                    let mut sub = OffsetAllocator::new(matches!(m, Member::Union(_)));
                    self.lay_out_members(owner, inner, &mut sub, counter)?;
                    alloc.place_group(sub.finish());
                }
            }
        }

        Ok(())
    }

    /// Lowers a type that is stored by value, so it has to have a size.
    /// Aggregates reached this way get defined on the spot
    pub(crate) fn lower_embedded(&mut self, ty: &SemType) -> LayoutResult<LoweredTypeID> {
        match ty {
            SemType::Aggregate(d) => {
                let decl = self.decl(*d)?;
                if decl.is_interface() {
                    return Err(LayoutError::WrongKind {
                        decl: decl.name,
                        expected: "struct, union or class",
                        found: decl.kind,
                    });
                }

                self.define(*d)?;
                self.declare(*d)
            }
            SemType::Array(inner, count) => {
                let elem = self.lower_embedded(inner)?;
                Ok(self.module.array_of(elem, *count))
            }
            other => self.lower_handle(other),
        }
    }

    /// Lowers a type that only needs an identity, aggregates are declared
    /// but not defined
    pub(crate) fn lower_handle(&mut self, ty: &SemType) -> LayoutResult<LoweredTypeID> {
        Ok(match ty {
            SemType::Bool => self.module.primitive(LLVMPrimitive::i1_t),
            SemType::I8 => self.module.primitive(LLVMPrimitive::i8_t),
            SemType::I16 => self.module.primitive(LLVMPrimitive::i16_t),
            SemType::I32 => self.module.primitive(LLVMPrimitive::i32_t),
            SemType::I64 => self.module.primitive(LLVMPrimitive::i64_t),
            SemType::F32 => self.module.primitive(LLVMPrimitive::f32_t),
            SemType::F64 => self.module.primitive(LLVMPrimitive::f64_t),
            SemType::Pointer(inner) => {
                let pointee = self.lower_handle(inner)?;
                self.module.pointer_to(pointee)
            }
            SemType::Array(inner, count) => {
                let elem = self.lower_handle(inner)?;
                self.module.array_of(elem, *count)
            }
            SemType::Aggregate(d) => self.declare(*d)?,
            SemType::Reference(d) => {
                let h = self.declare(*d)?;
                self.module.pointer_to(h)
            }
        })
    }

    /// The body is the representative of every offset group with explicit
    /// padding between them, so it is always packed
    fn body_for(&mut self, placement: &Placement) -> StructBody {
        let mut elements: SmallVec<[LoweredTypeID; 8]> = SmallVec::new();
        let mut cursor = 0;

        for (offset, field) in placement.representatives() {
            if offset > cursor {
                elements.push(self.module.byte_array(offset - cursor));
            }
            elements.push(field.ty);
            cursor = offset + field.size;
        }

        if placement.size > cursor {
            elements.push(self.module.byte_array(placement.size - cursor));
        }

        StructBody {
            elements,
            packed: true,
            size: placement.size,
            align: placement.align,
        }
    }

    /// Hidden pointers get their value from whichever table is
    /// declared for them so far
    pub(crate) fn sync_hidden_inits(&mut self, id: DeclID) -> LayoutResult<()> {
        let rec = self.record_mut(id)?;
        let vtable = rec.vtable;
        let tables: FxHashMap<DeclID, GlobalID> = rec
            .interface_list
            .iter()
            .filter_map(|i| i.table.map(|t| (i.iface, t)))
            .collect();

        for group in rec.offsets.values_mut() {
            for f in group.iter_mut() {
                match f.origin {
                    FieldOrigin::VTablePointer => {
                        if let Some(v) = vtable {
                            f.init = Some(LLVMConst::GlobalRef(v));
                        }
                    }
                    FieldOrigin::InterfacePointer(iface) => {
                        if let Some(t) = tables.get(&iface) {
                            f.init = Some(LLVMConst::GlobalRef(*t));
                        }
                    }
                    FieldOrigin::Declared(_) => {}
                }
            }
        }

        Ok(())
    }

    /// Runs every step for one declaration in the order the pieces depend
    /// on each other. The first failure stops that declaration
    pub fn finalize(&mut self, id: DeclID) -> LayoutResult<()> {
        self.define(id)?;

        if self.decl(id)?.is_class() {
            self.declare_vtable(id)?;
            self.build_interface_tables(id)?;
            self.define_vtable(id)?;
        }

        self.resolve_field_defaults(id)?;
        self.build_initializer(id)?;
        self.build_type_descriptor(id)?;

        Ok(())
    }
}
