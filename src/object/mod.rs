//! The object factory: lazy typed views over an address space.
//!
//! Every field access is a fresh bounds-checked read through the layer
//! stack; nothing is cached on the view. A failed read produces a
//! sentinel that absorbs all further dereferences, so callers can chain
//! accesses without intermediate checks and test validity once at the
//! end.

use std::fmt;
use std::sync::Arc;

use crate::addrspace::AddressSpace;
use crate::profile::Profile;
use crate::profile::vtypes::{Len, TypeDescriptor};

#[derive(Clone)]
pub struct Object {
    state: State,
}

#[derive(Clone)]
enum State {
    Live(Box<Live>),
    Sentinel(Arc<str>),
}

#[derive(Clone)]
struct Live {
    profile: Arc<Profile>,
    vm: Arc<dyn AddressSpace>,
    ty: TypeDescriptor,
    /// Set when `ty` came from a named structure lookup.
    type_name: Option<Arc<str>>,
    offset: u64,
    /// The enclosing object, consulted by sibling-computed lengths.
    parent: Option<Arc<Object>>,
}

impl Object {
    /// Materialize a typed view of `type_name` at `offset` in `vm`.
    ///
    /// Construction is O(1) and never fails: unknown types and invalid
    /// offsets come back as sentinels.
    pub fn new(
        profile: Arc<Profile>,
        vm: Arc<dyn AddressSpace>,
        type_name: &str,
        offset: u64,
    ) -> Object {
        if profile.struct_def(type_name).is_none() {
            return Object::sentinel(format!("unknown type {type_name}"));
        }
        if !vm.is_valid_address(offset) {
            return Object::sentinel(format!("invalid offset {offset:#x} for {type_name}"));
        }
        Object {
            state: State::Live(Box::new(Live {
                ty: TypeDescriptor::Named(type_name.to_string()),
                type_name: Some(type_name.into()),
                profile,
                vm,
                offset,
                parent: None,
            })),
        }
    }

    pub(crate) fn sentinel(reason: impl Into<String>) -> Object {
        Object {
            state: State::Sentinel(reason.into().into()),
        }
    }

    fn live(&self) -> Option<&Live> {
        match &self.state {
            State::Live(live) => Some(live),
            State::Sentinel(_) => None,
        }
    }

    /// False for sentinels; this is the single check at the end of an
    /// access chain.
    pub fn is_valid(&self) -> bool {
        matches!(self.state, State::Live(_))
    }

    /// Why this view is a sentinel, if it is one.
    pub fn invalid_reason(&self) -> Option<&str> {
        match &self.state {
            State::Sentinel(reason) => Some(reason),
            State::Live(_) => None,
        }
    }

    pub fn offset(&self) -> Option<u64> {
        Some(self.live()?.offset)
    }

    pub fn type_name(&self) -> Option<&str> {
        self.live()?.type_name.as_deref()
    }

    pub fn vm(&self) -> Option<&Arc<dyn AddressSpace>> {
        Some(&self.live()?.vm)
    }

    pub fn profile(&self) -> Option<&Arc<Profile>> {
        Some(&self.live()?.profile)
    }

    /// Raw bytes of this view, `size` of its type unless overridden.
    pub fn read_bytes(&self, length: usize) -> Option<Vec<u8>> {
        let live = self.live()?;
        live.vm.read(live.offset, length)
    }

    /// Chain into a structure field.
    pub fn field(&self, name: &str) -> Object {
        let Some(live) = self.live() else {
            return self.clone();
        };
        let Some(struct_name) = live.type_name.as_deref() else {
            return Object::sentinel(format!("no member {name} on a primitive view"));
        };
        let Some(def) = live.profile.struct_def(struct_name) else {
            return Object::sentinel(format!("unknown type {struct_name}"));
        };
        let Some(field) = def.fields.get(name) else {
            return Object::sentinel(format!("{struct_name} has no member {name}"));
        };
        self.project(field.ty.clone(), live.offset + field.offset)
    }

    /// View `ty` at an absolute offset, keeping this object as parent.
    fn project(&self, ty: TypeDescriptor, offset: u64) -> Object {
        let Some(live) = self.live() else {
            return self.clone();
        };
        if !live.vm.is_valid_address(offset) {
            return Object::sentinel(format!("invalid offset {offset:#x}"));
        }
        let type_name = match &ty {
            TypeDescriptor::Named(name) => {
                if live.profile.struct_def(name).is_none() {
                    return Object::sentinel(format!("unknown type {name}"));
                }
                Some(Arc::from(name.as_str()))
            }
            _ => None,
        };
        Object {
            state: State::Live(Box::new(Live {
                profile: live.profile.clone(),
                vm: live.vm.clone(),
                ty,
                type_name,
                offset,
                parent: Some(Arc::new(self.clone())),
            })),
        }
    }

    /// Reinterpret the same offset as another type.
    pub fn cast(&self, type_name: &str) -> Object {
        let Some(live) = self.live() else {
            return self.clone();
        };
        Object::new(
            live.profile.clone(),
            live.vm.clone(),
            type_name,
            live.offset,
        )
    }

    /// An array view of `count` elements of `type_name` at an absolute
    /// offset in this object's space.
    pub fn array_at(&self, type_name: &str, offset: u64, count: usize) -> Object {
        self.project(
            TypeDescriptor::Array {
                target: Box::new(TypeDescriptor::named(type_name)),
                count: Len::Fixed(count),
            },
            offset,
        )
    }

    /// The raw little-endian integer behind this view: primitives,
    /// pointers, bitfields and enumerations all have one.
    pub fn as_u64(&self) -> Option<u64> {
        let live = self.live()?;
        read_scalar(live, &live.ty, live.offset)
    }

    /// Shorthand for [`as_u64`](Self::as_u64).
    pub fn v(&self) -> Option<u64> {
        self.as_u64()
    }

    /// Signed projection, sign-extended by the primitive's width.
    pub fn as_i64(&self) -> Option<i64> {
        let live = self.live()?;
        let value = self.as_u64()?;
        match &live.ty {
            TypeDescriptor::Primitive {
                width,
                signed: true,
            } if *width < 8 => {
                let shift = 64 - u32::from(*width) * 8;
                Some(((value << shift) as i64) >> shift)
            }
            _ => Some(value as i64),
        }
    }

    /// String projection of a `CString` view, trimmed at the first NUL.
    pub fn as_string(&self) -> Option<String> {
        let live = self.live()?;
        let TypeDescriptor::CString { length } = &live.ty else {
            return None;
        };
        let length = eval_len(live, length)?;
        let bytes = live.vm.read(live.offset, length)?;
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Symbolic representation: the enumeration name when one matches,
    /// otherwise the integer value; sentinels render their reason.
    pub fn repr(&self) -> String {
        match &self.state {
            State::Sentinel(reason) => format!("<invalid: {reason}>"),
            State::Live(live) => match &live.ty {
                TypeDescriptor::Enumeration { choices, .. } => match self.as_u64() {
                    Some(value) => choices
                        .iter()
                        .find(|(v, _)| *v == value)
                        .map(|(_, name)| (*name).to_string())
                        .unwrap_or_else(|| value.to_string()),
                    None => "<unreadable>".to_string(),
                },
                TypeDescriptor::CString { .. } => self
                    .as_string()
                    .unwrap_or_else(|| "<unreadable>".to_string()),
                _ => match self.as_u64() {
                    Some(value) => value.to_string(),
                    None => "<unreadable>".to_string(),
                },
            },
        }
    }

    /// Follow a pointer, checking the target address first.
    pub fn deref(&self) -> Object {
        let Some(live) = self.live() else {
            return self.clone();
        };
        let TypeDescriptor::Pointer { target } = &live.ty else {
            return Object::sentinel("not a pointer");
        };
        let target = (**target).clone();
        let Some(addr) = self.as_u64() else {
            return Object::sentinel("unreadable pointer");
        };
        if addr == 0 {
            return Object::sentinel("null pointer");
        }
        if !live.vm.is_valid_address(addr) {
            return Object::sentinel(format!("pointer target {addr:#x} invalid"));
        }
        match target {
            TypeDescriptor::Named(name) => {
                Object::new(live.profile.clone(), live.vm.clone(), &name, addr)
            }
            ty => self.project(ty, addr),
        }
    }

    /// Follow this value as the address of a `type_name` instance. Works
    /// on plain integers too, the way file offsets are chased inside
    /// containers.
    pub fn deref_as(&self, type_name: &str) -> Object {
        let Some(live) = self.live() else {
            return self.clone();
        };
        let Some(addr) = self.as_u64() else {
            return Object::sentinel("unreadable pointer");
        };
        if addr == 0 {
            return Object::sentinel("null pointer");
        }
        Object::new(live.profile.clone(), live.vm.clone(), type_name, addr)
    }

    /// Element count of an array view.
    pub fn count(&self) -> Option<usize> {
        let live = self.live()?;
        let TypeDescriptor::Array { count, .. } = &live.ty else {
            return None;
        };
        eval_len(live, count)
    }

    /// Index into an array view, computing the element offset lazily.
    pub fn index(&self, index: usize) -> Object {
        let Some(live) = self.live() else {
            return self.clone();
        };
        let TypeDescriptor::Array { target, .. } = &live.ty else {
            return Object::sentinel("not an array");
        };
        if let Some(count) = self.count() {
            if index >= count {
                return Object::sentinel(format!("index {index} out of bounds ({count})"));
            }
        }
        let element = live.profile.size_of(target);
        if element == 0 {
            return Object::sentinel("array of unsized elements");
        }
        self.project((**target).clone(), live.offset + index as u64 * element)
    }

    /// Iterate the elements of an array view.
    pub fn iter(&self) -> Elements {
        Elements {
            array: self.clone(),
            index: 0,
            count: self.count().unwrap_or(0),
        }
    }
}

pub struct Elements {
    array: Object,
    index: usize,
    count: usize,
}

impl Iterator for Elements {
    type Item = Object;

    fn next(&mut self) -> Option<Object> {
        if self.index >= self.count {
            return None;
        }
        let item = self.array.index(self.index);
        self.index += 1;
        Some(item)
    }
}

fn eval_len(live: &Live, len: &Len) -> Option<usize> {
    match len {
        Len::Fixed(length) => Some(*length),
        Len::FromParent(compute) => {
            let parent = live.parent.as_deref()?;
            compute(parent)
        }
    }
}

fn read_scalar(live: &Live, ty: &TypeDescriptor, offset: u64) -> Option<u64> {
    match ty {
        TypeDescriptor::Primitive { width, .. } => read_uint(&live.vm, offset, *width),
        TypeDescriptor::Pointer { .. } => read_uint(&live.vm, offset, live.profile.pointer_width),
        TypeDescriptor::Bitfield { start, end, base } => {
            let value = read_scalar(live, base, offset)?;
            let bits = end.checked_sub(*start)?;
            if bits == 0 || bits > 64 {
                return None;
            }
            let mask = if bits == 64 {
                u64::MAX
            } else {
                (1u64 << bits) - 1
            };
            Some((value >> start) & mask)
        }
        TypeDescriptor::Enumeration { base, .. } => read_scalar(live, base, offset),
        _ => None,
    }
}

fn read_uint(vm: &Arc<dyn AddressSpace>, offset: u64, width: u8) -> Option<u64> {
    if width == 0 || width > 8 {
        return None;
    }
    let bytes = vm.read(offset, width as usize)?;
    let mut value = 0u64;
    for (i, byte) in bytes.iter().enumerate() {
        value |= u64::from(*byte) << (8 * i);
    }
    Some(value)
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Sentinel(reason) => write!(f, "Object {{ invalid: {reason} }}"),
            State::Live(live) => write!(
                f,
                "Object {{ type: {}, offset: {:#x} }}",
                live.type_name.as_deref().unwrap_or("<anonymous>"),
                live.offset
            ),
        }
    }
}
