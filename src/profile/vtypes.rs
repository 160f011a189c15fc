//! Structure layouts and the type descriptors they are built from.
//!
//! A structure is a size plus a field table; each field is an offset and
//! a descriptor telling the object engine how to read it. Layout tables
//! are data, not code: profiles assemble them from base maps and
//! overlays merged field-by-field.

use std::collections::HashMap;

use crate::object::Object;

/// Computes an array count or string length from the enclosing object,
/// evaluated at access time.
pub type SiblingFn = fn(&Object) -> Option<usize>;

#[derive(Clone, Copy, Debug)]
pub enum Len {
    Fixed(usize),
    FromParent(SiblingFn),
}

#[derive(Clone, Debug)]
pub enum TypeDescriptor {
    /// Fixed-width little-endian integer.
    Primitive { width: u8, signed: bool },
    /// Pointer-width integer addressing `target` in the same space.
    Pointer { target: Box<TypeDescriptor> },
    Array {
        target: Box<TypeDescriptor>,
        count: Len,
    },
    /// Bits `[start, end)` of the underlying integer.
    Bitfield {
        start: u32,
        end: u32,
        base: Box<TypeDescriptor>,
    },
    Enumeration {
        base: Box<TypeDescriptor>,
        choices: &'static [(u64, &'static str)],
    },
    /// Raw bytes; string projection trims at the first NUL.
    CString { length: Len },
    /// Another profile type by name.
    Named(String),
    /// Exact byte pattern anchoring discovery scans.
    Magic(&'static [u8]),
}

impl TypeDescriptor {
    pub fn unsigned(width: u8) -> Self {
        TypeDescriptor::Primitive {
            width,
            signed: false,
        }
    }

    pub fn signed(width: u8) -> Self {
        TypeDescriptor::Primitive {
            width,
            signed: true,
        }
    }

    pub fn pointer_to(target: TypeDescriptor) -> Self {
        TypeDescriptor::Pointer {
            target: Box::new(target),
        }
    }

    pub fn array_of(target: TypeDescriptor, count: usize) -> Self {
        TypeDescriptor::Array {
            target: Box::new(target),
            count: Len::Fixed(count),
        }
    }

    pub fn array_fn(target: TypeDescriptor, count: SiblingFn) -> Self {
        TypeDescriptor::Array {
            target: Box::new(target),
            count: Len::FromParent(count),
        }
    }

    pub fn bitfield(start: u32, end: u32, base: TypeDescriptor) -> Self {
        TypeDescriptor::Bitfield {
            start,
            end,
            base: Box::new(base),
        }
    }

    pub fn enumeration(base: TypeDescriptor, choices: &'static [(u64, &'static str)]) -> Self {
        TypeDescriptor::Enumeration {
            base: Box::new(base),
            choices,
        }
    }

    pub fn string(length: usize) -> Self {
        TypeDescriptor::CString {
            length: Len::Fixed(length),
        }
    }

    pub fn string_fn(length: SiblingFn) -> Self {
        TypeDescriptor::CString {
            length: Len::FromParent(length),
        }
    }

    pub fn named(name: &str) -> Self {
        TypeDescriptor::Named(name.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct FieldDef {
    pub offset: u64,
    pub ty: TypeDescriptor,
}

#[derive(Clone, Debug, Default)]
pub struct StructDef {
    pub size: u64,
    pub fields: HashMap<&'static str, FieldDef>,
}

pub type VTypes = HashMap<&'static str, StructDef>;

/// Table shorthand for one structure definition.
pub fn structure(size: u64, fields: Vec<(&'static str, u64, TypeDescriptor)>) -> StructDef {
    StructDef {
        size,
        fields: fields
            .into_iter()
            .map(|(name, offset, ty)| (name, FieldDef { offset, ty }))
            .collect(),
    }
}

/// Merge `patch` over `base` field-by-field. A patched field replaces
/// the base's definition; untouched fields survive. A patch size of 0
/// keeps the base size. Within a generation the final value of each
/// field is the last overlay's, so repeated merges compose predictably.
pub fn merge_overlay(base: &mut VTypes, patch: VTypes) {
    for (name, def) in patch {
        match base.get_mut(name) {
            Some(existing) => {
                if def.size != 0 {
                    existing.size = def.size;
                }
                existing.fields.extend(def.fields);
            }
            None => {
                base.insert(name, def);
            }
        }
    }
}
