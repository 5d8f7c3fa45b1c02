//! The low level target model the layout core produces into.
//!
//! Types live in an arena and are referred to by [LoweredTypeID]. Named
//! structs start out opaque and get their body filled in place later, so
//! a handle that was captured early stays valid once the layout is known.

use smallvec::SmallVec;

use crate::helper::interner::{IStr, Internable};

pub const POINTER_SIZE: u64 = 8;
pub const POINTER_ALIGN: u64 = 8;

#[derive(PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy, Debug, derive_more::Display)]
#[display(fmt = "ty#{}", _0)]
pub struct LoweredTypeID(pub u32);

#[derive(PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy, Debug, derive_more::Display)]
#[display(fmt = "global#{}", _0)]
pub struct GlobalID(pub u32);

assert_eq_size!(LoweredTypeID, u32);
assert_eq_size!(GlobalID, u32);

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, strum_macros::Display)]
pub enum LLVMPrimitive {
    #[strum(serialize = "i1")]
    i1_t,
    #[strum(serialize = "i8")]
    i8_t,
    #[strum(serialize = "i16")]
    i16_t,
    #[strum(serialize = "i32")]
    i32_t,
    #[strum(serialize = "i64")]
    i64_t,
    #[strum(serialize = "float")]
    f32_t,
    #[strum(serialize = "double")]
    f64_t,
}

impl LLVMPrimitive {
    pub fn size(self) -> u64 {
        match self {
            Self::i1_t | Self::i8_t => 1,
            Self::i16_t => 2,
            Self::i32_t | Self::f32_t => 4,
            Self::i64_t | Self::f64_t => 8,
        }
    }

    pub fn align(self) -> u64 {
        self.size()
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::f32_t | Self::f64_t)
    }

    /// Whether an integer literal can be written for this type. Both the
    /// signed and the unsigned reading of the bits are accepted
    pub fn holds(self, value: i64) -> bool {
        let bits = match self {
            Self::i1_t => 1,
            Self::f32_t | Self::f64_t => return false,
            Self::i64_t => return true,
            other => other.size() * 8,
        };

        let low = -(1i64 << (bits - 1));
        let high = (1i64 << bits) - 1;
        (low..=high).contains(&value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StructBody {
    pub elements: SmallVec<[LoweredTypeID; 8]>,
    pub packed: bool,
    pub size: u64,
    pub align: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LLVMType {
    Primitive(LLVMPrimitive),

    /// The pointee is only a handle, it never has to be complete
    Pointer(LoweredTypeID),
    Array {
        elem: LoweredTypeID,
        count: u64,
    },
    Struct {
        name: Option<IStr>,
        body: Option<StructBody>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum LLVMConst {
    Int { ty: LoweredTypeID, value: i64 },
    Float { ty: LoweredTypeID, value: f64 },
    Null,
    Zero(LoweredTypeID),
    Struct {
        ty: LoweredTypeID,
        fields: Vec<LLVMConst>,
    },
    Array {
        elem: LoweredTypeID,
        items: Vec<LLVMConst>,
    },

    /// Address of a generated code entity, by symbol
    FunctionRef(IStr),
    GlobalRef(GlobalID),

    /// Address of element `index` of an array global
    ElementRef { global: GlobalID, index: usize },
    CString(IStr),
}

#[derive(Clone, Debug)]
pub struct GlobalVar {
    pub name: IStr,
    pub ty: LoweredTypeID,
    pub init: Option<LLVMConst>,
    pub constant: bool,
}

/// Owns every type and global produced for one compilation
#[derive(Debug)]
pub struct Module {
    types: Vec<LLVMType>,
    globals: Vec<GlobalVar>,

    // primitives and common pointer/array types are uniqued
    primitives: rustc_hash::FxHashMap<LLVMPrimitive, LoweredTypeID>,
    pointers: rustc_hash::FxHashMap<LoweredTypeID, LoweredTypeID>,
    arrays: rustc_hash::FxHashMap<(LoweredTypeID, u64), LoweredTypeID>,
    opaque_ptr: Option<LoweredTypeID>,
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

impl Module {
    pub fn new() -> Module {
        Module {
            types: Vec::new(),
            globals: Vec::new(),
            primitives: Default::default(),
            pointers: Default::default(),
            arrays: Default::default(),
            opaque_ptr: None,
        }
    }

    fn push_type(&mut self, ty: LLVMType) -> LoweredTypeID {
        let id = LoweredTypeID(self.types.len() as u32);
        self.types.push(ty);
        id
    }

    pub fn ty(&self, id: LoweredTypeID) -> &LLVMType {
        &self.types[id.0 as usize]
    }

    pub fn types(&self) -> impl Iterator<Item = (LoweredTypeID, &LLVMType)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, t)| (LoweredTypeID(i as u32), t))
    }

    pub fn primitive(&mut self, p: LLVMPrimitive) -> LoweredTypeID {
        if let Some(id) = self.primitives.get(&p) {
            return *id;
        }

        let id = self.push_type(LLVMType::Primitive(p));
        self.primitives.insert(p, id);
        id
    }

    pub fn pointer_to(&mut self, pointee: LoweredTypeID) -> LoweredTypeID {
        if let Some(id) = self.pointers.get(&pointee) {
            return *id;
        }

        let id = self.push_type(LLVMType::Pointer(pointee));
        self.pointers.insert(pointee, id);
        id
    }

    /// A pointer whose pointee nobody cares about, used for code and
    /// table addresses
    pub fn opaque_pointer(&mut self) -> LoweredTypeID {
        if let Some(id) = self.opaque_ptr {
            return id;
        }

        let i8_t = self.primitive(LLVMPrimitive::i8_t);
        let id = self.pointer_to(i8_t);
        self.opaque_ptr = Some(id);
        id
    }

    pub fn array_of(&mut self, elem: LoweredTypeID, count: u64) -> LoweredTypeID {
        if let Some(id) = self.arrays.get(&(elem, count)) {
            return *id;
        }

        let id = self.push_type(LLVMType::Array { elem, count });
        self.arrays.insert((elem, count), id);
        id
    }

    pub fn byte_array(&mut self, count: u64) -> LoweredTypeID {
        let i8_t = self.primitive(LLVMPrimitive::i8_t);
        self.array_of(i8_t, count)
    }

    pub fn opaque_struct(&mut self, name: IStr) -> LoweredTypeID {
        self.push_type(LLVMType::Struct {
            name: Some(name),
            body: None,
        })
    }

    /// A named struct whose body is known up front. Stays opaque if any
    /// element is not sized yet
    pub fn named_struct(&mut self, name: IStr, elements: &[LoweredTypeID]) -> LoweredTypeID {
        let id = self.opaque_struct(name);
        if let Some(body) = self.packed_body(elements) {
            self.set_body(id, body);
        }
        id
    }

    /// Computes a packed body for the given elements. The alignment is
    /// the largest element alignment even though the body is packed,
    /// since the padding was placed by the caller
    pub fn packed_body(&self, elements: &[LoweredTypeID]) -> Option<StructBody> {
        let mut size = 0;
        let mut align = 1;

        for e in elements.iter() {
            size += self.size_of(*e)?;
            align = align.max(self.align_of(*e)?);
        }

        Some(StructBody {
            elements: elements.iter().copied().collect(),
            packed: true,
            size,
            align,
        })
    }

    /// Fills in a named struct's body. The handle keeps its identity,
    /// a body can only be set once
    pub fn set_body(&mut self, id: LoweredTypeID, new_body: StructBody) -> bool {
        match &mut self.types[id.0 as usize] {
            LLVMType::Struct { body: body @ None, .. } => {
                *body = Some(new_body);
                true
            }
            _ => false,
        }
    }

    pub fn size_of(&self, id: LoweredTypeID) -> Option<u64> {
        match self.ty(id) {
            LLVMType::Primitive(p) => Some(p.size()),
            LLVMType::Pointer(_) => Some(POINTER_SIZE),
            // bodies are packed, so elements sit back to back
            LLVMType::Array { elem, count } => Some(self.size_of(*elem)? * count),
            LLVMType::Struct { body, .. } => body.as_ref().map(|b| b.size),
        }
    }

    pub fn align_of(&self, id: LoweredTypeID) -> Option<u64> {
        match self.ty(id) {
            LLVMType::Primitive(p) => Some(p.align()),
            LLVMType::Pointer(_) => Some(POINTER_ALIGN),
            LLVMType::Array { elem, .. } => self.align_of(*elem),
            LLVMType::Struct { body, .. } => body.as_ref().map(|b| b.align),
        }
    }

    pub fn add_global(&mut self, name: IStr, ty: LoweredTypeID, constant: bool) -> GlobalID {
        let id = GlobalID(self.globals.len() as u32);
        self.globals.push(GlobalVar {
            name,
            ty,
            init: None,
            constant,
        });
        id
    }

    pub fn global(&self, id: GlobalID) -> &GlobalVar {
        &self.globals[id.0 as usize]
    }

    pub fn globals(&self) -> impl Iterator<Item = (GlobalID, &GlobalVar)> {
        self.globals
            .iter()
            .enumerate()
            .map(|(i, g)| (GlobalID(i as u32), g))
    }

    pub fn set_initializer(&mut self, id: GlobalID, init: LLVMConst) {
        self.globals[id.0 as usize].init = Some(init);
    }

    pub fn global_named(&self, name: &str) -> Option<GlobalID> {
        let name = name.intern();
        self.globals()
            .find(|(_, g)| g.name == name)
            .map(|(id, _)| id)
    }

    /// The zero value of the given type
    pub fn zero_of(&self, id: LoweredTypeID) -> LLVMConst {
        match self.ty(id) {
            LLVMType::Primitive(p) if p.is_float() => LLVMConst::Float { ty: id, value: 0.0 },
            LLVMType::Primitive(_) => LLVMConst::Int { ty: id, value: 0 },
            LLVMType::Pointer(_) => LLVMConst::Null,
            _ => LLVMConst::Zero(id),
        }
    }
}
