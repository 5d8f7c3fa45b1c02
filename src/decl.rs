//! Resolved declarations handed over by semantic analysis.
//!
//! Nothing in here is computed by the layout core, these are the inputs.
//! Every aggregate lives in a [DeclTable] and is referred to by [DeclID],
//! which is also the identity every layout record is keyed by.

use smallvec::SmallVec;

use crate::helper::interner::{IStr, Internable};

#[derive(PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy, Debug, derive_more::Display)]
#[display(fmt = "decl#{}", _0)]
pub struct DeclID(pub u32);

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum AggregateKind {
    Struct,
    Union,
    Class,
    Interface,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SemType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,

    /// A raw pointer, never needs the pointee to be complete
    Pointer(Box<SemType>),

    Array(Box<SemType>, u64),

    /// The aggregate is embedded by value, so its size must be known
    Aggregate(DeclID),

    /// A class or interface reference. Pointer sized, only needs
    /// the referenced aggregate to be declared
    Reference(DeclID),
}

impl SemType {
    pub fn pointer_to(inner: SemType) -> SemType {
        SemType::Pointer(Box::new(inner))
    }

    pub fn array_of(inner: SemType, count: u64) -> SemType {
        SemType::Array(Box::new(inner), count)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DefaultValue {
    /// The natural zero of the field type, for aggregates this is
    /// the default instance of the embedded aggregate
    Zero,
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,

    /// Not known yet, must be provided through
    /// `LayoutRegistry::set_field_default` before the initializer is built
    Deferred,
}

#[derive(Clone, Debug)]
pub struct FieldDecl {
    pub name: IStr,
    pub ty: SemType,
    pub default: DefaultValue,
}

#[derive(Clone, Debug)]
pub enum Member {
    Field(FieldDecl),

    /// An anonymous union, every member starts at the same offset
    Union(Vec<Member>),

    /// An anonymous struct, normally found inside a union
    Struct(Vec<Member>),
}

/// Identity of a method for override matching. Semantic analysis has
/// already done the matching work, so two signatures are either
/// identical or unrelated.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct MethodSig {
    pub name: IStr,
    pub ty: IStr,
}

impl std::fmt::Display for MethodSig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.ty)
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum Virtuality {
    /// Starts a new dispatch slot
    Introduces,

    /// Replaces the association of exactly one inherited slot
    Overrides,

    /// Not dispatched through the class table
    Final,
}

#[derive(Clone, Debug)]
pub struct MethodDecl {
    pub sig: MethodSig,

    /// the symbol of the generated code entity, already mangled
    pub symbol: IStr,
    pub virtuality: Virtuality,
    pub is_abstract: bool,
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct MethodRef {
    pub owner: DeclID,
    pub index: usize,
}

#[derive(Clone, Debug)]
pub struct AggregateDecl {
    pub name: IStr,
    pub kind: AggregateKind,
    pub members: Vec<Member>,

    /// for classes the base class, for nothing else
    pub base: Option<DeclID>,

    /// for classes the implemented interfaces, for interfaces the
    /// base interfaces. First entry of an interface is its primary base
    pub interfaces: SmallVec<[DeclID; 2]>,
    pub methods: Vec<MethodDecl>,
    pub is_abstract: bool,
}

impl AggregateDecl {
    pub fn new(name: &str, kind: AggregateKind) -> AggregateDecl {
        AggregateDecl {
            name: name.intern(),
            kind,
            members: Vec::new(),
            base: None,
            interfaces: SmallVec::new(),
            methods: Vec::new(),
            is_abstract: false,
        }
    }

    pub fn is_class(&self) -> bool {
        self.kind == AggregateKind::Class
    }

    pub fn is_interface(&self) -> bool {
        self.kind == AggregateKind::Interface
    }

    pub fn with_field(mut self, name: &str, ty: SemType, default: DefaultValue) -> Self {
        self.members.push(Member::Field(FieldDecl {
            name: name.intern(),
            ty,
            default,
        }));
        self
    }

    pub fn with_member(mut self, member: Member) -> Self {
        self.members.push(member);
        self
    }

    pub fn with_base(mut self, base: DeclID) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_interface(mut self, iface: DeclID) -> Self {
        self.interfaces.push(iface);
        self
    }

    pub fn with_method(
        mut self,
        name: &str,
        ty: &str,
        symbol: &str,
        virtuality: Virtuality,
    ) -> Self {
        self.methods.push(MethodDecl {
            sig: MethodSig {
                name: name.intern(),
                ty: ty.intern(),
            },
            symbol: symbol.intern(),
            virtuality,
            is_abstract: false,
        });
        self
    }

    pub fn with_abstract_method(mut self, name: &str, ty: &str, symbol: &str) -> Self {
        self.methods.push(MethodDecl {
            sig: MethodSig {
                name: name.intern(),
                ty: ty.intern(),
            },
            symbol: symbol.intern(),
            virtuality: Virtuality::Introduces,
            is_abstract: true,
        });
        self
    }

    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Walks the declared fields depth first in declaration order,
    /// flattening anonymous groups
    pub fn fields(&self) -> Vec<&FieldDecl> {
        fn walk<'a>(members: &'a [Member], into: &mut Vec<&'a FieldDecl>) {
            for m in members {
                match m {
                    Member::Field(f) => into.push(f),
                    Member::Union(inner) | Member::Struct(inner) => walk(inner, into),
                }
            }
        }

        let mut v = Vec::new();
        walk(&self.members, &mut v);
        v
    }
}

/// Append-only arena of resolved declarations
#[derive(Default, Debug)]
pub struct DeclTable {
    decls: Vec<Option<AggregateDecl>>,
}

impl DeclTable {
    pub fn new() -> DeclTable {
        Default::default()
    }

    pub fn add(&mut self, decl: AggregateDecl) -> DeclID {
        let id = DeclID(self.decls.len() as u32);
        self.decls.push(Some(decl));
        id
    }

    /// Hands out an id before the declaration exists, so that two
    /// declarations can name each other. Must be followed by `fill`
    pub fn reserve(&mut self) -> DeclID {
        let id = DeclID(self.decls.len() as u32);
        self.decls.push(None);
        id
    }

    pub fn fill(&mut self, id: DeclID, decl: AggregateDecl) {
        if let Some(slot) = self.decls.get_mut(id.0 as usize) {
            *slot = Some(decl);
        }
    }

    pub fn get(&self, id: DeclID) -> Option<&AggregateDecl> {
        self.decls.get(id.0 as usize).and_then(|d| d.as_ref())
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    pub fn method(&self, mref: MethodRef) -> Option<&MethodDecl> {
        self.get(mref.owner).and_then(|d| d.methods.get(mref.index))
    }

    /// The class followed by each of its ancestors, nearest first
    pub fn class_chain(&self, id: DeclID) -> Vec<DeclID> {
        let mut chain = vec![id];
        let mut cur = self.get(id).and_then(|d| d.base);

        while let Some(b) = cur {
            // a base cycle is reported by layout, here it only has to terminate
            if chain.contains(&b) {
                break;
            }
            chain.push(b);
            cur = self.get(b).and_then(|d| d.base);
        }

        chain
    }

    /// Whether the class or any ancestor has a dispatched method
    pub fn has_virtual_behavior(&self, id: DeclID) -> bool {
        self.class_chain(id).into_iter().any(|c| {
            self.get(c)
                .map(|d| {
                    d.is_class()
                        && d.methods
                            .iter()
                            .any(|m| m.virtuality != Virtuality::Final)
                })
                .unwrap_or(false)
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids_can_be_filled_later() {
        let mut decls = DeclTable::new();
        let a = decls.reserve();
        let b = decls.add(
            AggregateDecl::new("B", AggregateKind::Struct).with_field(
                "a",
                SemType::pointer_to(SemType::Aggregate(a)),
                DefaultValue::Null,
            ),
        );
        assert!(decls.get(a).is_none());

        decls.fill(
            a,
            AggregateDecl::new("A", AggregateKind::Struct).with_field(
                "b",
                SemType::pointer_to(SemType::Aggregate(b)),
                DefaultValue::Null,
            ),
        );
        assert!(decls.get(a).is_some());
        assert_eq!(decls.len(), 2);
    }

    #[test]
    fn anonymous_groups_flatten_in_declaration_order() {
        let decl = AggregateDecl::new("S", AggregateKind::Struct)
            .with_field("a", SemType::I8, DefaultValue::Zero)
            .with_member(Member::Union(vec![
                Member::Field(FieldDecl {
                    name: "b".intern(),
                    ty: SemType::I32,
                    default: DefaultValue::Zero,
                }),
                Member::Struct(vec![Member::Field(FieldDecl {
                    name: "c".intern(),
                    ty: SemType::I16,
                    default: DefaultValue::Zero,
                })]),
            ]));

        let names: Vec<_> = decl.fields().iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["a".intern(), "b".intern(), "c".intern()]);
    }

    #[test]
    fn class_chain_walks_nearest_first() {
        let mut decls = DeclTable::new();
        let base = fixtures::base_class(&mut decls);
        let mid = decls.add(AggregateDecl::new("Mid", AggregateKind::Class).with_base(base));
        let leaf = decls.add(AggregateDecl::new("Leaf", AggregateKind::Class).with_base(mid));

        assert_eq!(decls.class_chain(leaf), vec![leaf, mid, base]);
        assert!(decls.has_virtual_behavior(leaf));
    }
}
