//! Field offset assignment.
//!
//! Struct members get strictly increasing, naturally aligned offsets.
//! Union members all start at 0 of the union, which shows up as several
//! descriptors under one key of the [OffsetMap]. Anonymous groups are laid
//! out on their own and merged into the parent rebased by addition.

use rustc_hash::FxHashMap;

use crate::{
    helper::{align_to, interner::IStr},
    llvm::LoweredTypeID,
};

use super::{FieldDescriptor, FieldOrigin, OffsetMap};

#[derive(Clone, Debug)]
pub struct Placement {
    pub offsets: OffsetMap,
    pub default_fields: Vec<FieldOrigin>,
    pub size: u64,
    pub align: u64,
    pub has_unions: bool,
}

impl Placement {
    /// One field per offset group, ascending by offset. The first declared
    /// field of a group represents it, and groups that start inside the
    /// bytes of an earlier representative are covered by it and skipped.
    /// Zero sized fields occupy no bytes and never represent anything
    pub fn representatives(&self) -> Vec<(u64, &FieldDescriptor)> {
        representatives(&self.offsets, &self.default_fields)
    }
}

pub(crate) fn representatives<'a>(
    offsets: &'a OffsetMap,
    default_fields: &[FieldOrigin],
) -> Vec<(u64, &'a FieldDescriptor)> {
    let rank: FxHashMap<FieldOrigin, usize> = default_fields
        .iter()
        .enumerate()
        .map(|(i, o)| (*o, i))
        .collect();

    let mut reps = Vec::new();
    let mut covered = 0;

    for (offset, group) in offsets.iter() {
        if *offset < covered {
            continue;
        }

        let first = group
            .iter()
            .filter(|f| f.size > 0)
            .min_by_key(|f| rank.get(&f.origin).copied().unwrap_or(usize::MAX));

        if let Some(f) = first {
            covered = offset + f.size;
            reps.push((*offset, f));
        }
    }

    reps
}

pub struct OffsetAllocator {
    is_union: bool,
    offsets: OffsetMap,
    default_fields: Vec<FieldOrigin>,

    // end of the furthest placed byte
    cursor: u64,
    align: u64,
    has_unions: bool,
}

impl OffsetAllocator {
    pub fn new(is_union: bool) -> OffsetAllocator {
        OffsetAllocator {
            is_union,
            offsets: OffsetMap::new(),
            default_fields: Vec::new(),
            cursor: 0,
            align: 1,
            has_unions: is_union,
        }
    }

    fn next_offset(&self, align: u64) -> u64 {
        if self.is_union {
            0
        } else {
            align_to(self.cursor, align)
        }
    }

    fn insert(&mut self, offset: u64, desc: FieldDescriptor) {
        self.default_fields.push(desc.origin);
        self.offsets.entry(offset).or_default().push(desc);
    }

    pub fn place(&mut self, desc: FieldDescriptor, align: u64) -> u64 {
        let offset = self.next_offset(align);

        self.cursor = self.cursor.max(offset + desc.size);
        self.align = self.align.max(align);
        self.insert(offset, desc);

        offset
    }

    pub fn place_hidden(
        &mut self,
        origin: FieldOrigin,
        name: IStr,
        ty: LoweredTypeID,
        size: u64,
        align: u64,
    ) -> u64 {
        self.place(
            FieldDescriptor {
                origin,
                name,
                ty,
                size,
                init: None,
            },
            align,
        )
    }

    /// Merges a separately laid out group at the next suitable offset,
    /// every offset inside it is shifted by where the group lands
    pub fn place_group(&mut self, group: Placement) -> u64 {
        let base = self.next_offset(group.align);

        for origin in group.default_fields {
            self.default_fields.push(origin);
        }

        for (offset, fields) in group.offsets {
            self.offsets
                .entry(base + offset)
                .or_default()
                .extend(fields);
        }

        self.cursor = self.cursor.max(base + group.size);
        self.align = self.align.max(group.align);
        self.has_unions |= group.has_unions;

        base
    }

    /// Starts from the layout of a base class. The hidden pointers of the
    /// base point at the base's tables, so their values are dropped and
    /// refilled for the derived class
    pub fn inherit(
        &mut self,
        offsets: &OffsetMap,
        default_fields: &[FieldOrigin],
        size: u64,
        align: u64,
        has_unions: bool,
    ) {
        for (offset, fields) in offsets.iter() {
            let entry = self.offsets.entry(*offset).or_default();

            for f in fields.iter() {
                let mut f = f.clone();
                if !matches!(f.origin, FieldOrigin::Declared(_)) {
                    f.init = None;
                }
                entry.push(f);
            }
        }

        self.default_fields.extend_from_slice(default_fields);
        self.cursor = self.cursor.max(size);
        self.align = self.align.max(align);
        self.has_unions |= has_unions;
    }

    pub fn finish(self) -> Placement {
        // a union is exactly as large as its largest member
        let size = if self.is_union {
            self.cursor
        } else {
            align_to(self.cursor, self.align)
        };

        Placement {
            offsets: self.offsets,
            default_fields: self.default_fields,
            size,
            align: self.align,
            has_unions: self.has_unions,
        }
    }
}
