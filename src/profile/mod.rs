//! OS profiles: versioned descriptions of kernel structure layouts.
//!
//! A profile is assembled from a base vtypes map plus overlays merged
//! field-by-field, the same mechanism the shipped container types use.
//! Profiles register in a fixed order; discovery picks the first one
//! whose magic byte pattern appears in the image.

pub mod elf;
pub mod vtypes;
pub mod windows;

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;

use self::vtypes::{FieldDef, StructDef, TypeDescriptor, VTypes, merge_overlay};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchMode {
    X86,
    X86Pae,
    Amd64,
}

pub struct Profile {
    pub name: &'static str,
    pub mode: ArchMode,
    /// Pointer width in bytes.
    pub pointer_width: u8,
    /// Offset of the DTB field relative to a KDBG header match.
    pub kdbg_dtb_offset: u64,
    vtypes: VTypes,
    object_classes: HashMap<&'static str, &'static str>,
    pub constants: HashMap<&'static str, u64>,
}

impl Profile {
    pub fn get_obj_size(&self, name: &str) -> Option<u64> {
        self.vtypes.get(name).map(|def| def.size)
    }

    pub fn get_obj_offset(&self, name: &str, field: &str) -> Option<u64> {
        Some(self.field_def(name, field)?.offset)
    }

    pub fn struct_def(&self, name: &str) -> Option<&StructDef> {
        self.vtypes.get(name)
    }

    pub fn field_def(&self, name: &str, field: &str) -> Option<&FieldDef> {
        self.vtypes.get(name)?.fields.get(field)
    }

    /// Names of every known type.
    pub fn types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.vtypes.keys().copied()
    }

    /// Capability-set override registered for a type, if any. Plugins
    /// request the extended view explicitly.
    pub fn object_class(&self, name: &str) -> Option<&'static str> {
        self.object_classes.get(name).copied()
    }

    /// Storage size of a descriptor in this profile. Sibling-computed
    /// lengths have no static size and report 0.
    pub fn size_of(&self, ty: &TypeDescriptor) -> u64 {
        use self::vtypes::TypeDescriptor as T;
        match ty {
            T::Primitive { width, .. } => u64::from(*width),
            T::Pointer { .. } => u64::from(self.pointer_width),
            T::Array {
                target,
                count: vtypes::Len::Fixed(count),
            } => self.size_of(target) * *count as u64,
            T::Array { .. } => 0,
            T::Bitfield { base, .. } | T::Enumeration { base, .. } => self.size_of(base),
            T::CString {
                length: vtypes::Len::Fixed(length),
            } => *length as u64,
            T::CString { .. } => 0,
            T::Named(name) => self.get_obj_size(name).unwrap_or(0),
            T::Magic(bytes) => bytes.len() as u64,
        }
    }

    /// KDBG header byte pattern from the profile's magic overlay.
    pub fn kdbg_header(&self) -> Option<&'static [u8]> {
        match &self.field_def("VOLATILITY_MAGIC", "KDBGHeader")?.ty {
            TypeDescriptor::Magic(bytes) => Some(*bytes),
            _ => None,
        }
    }
}

/// Accumulates vtypes, overlays and class overrides into a profile.
pub struct ProfileBuilder {
    vtypes: VTypes,
    object_classes: HashMap<&'static str, &'static str>,
    constants: HashMap<&'static str, u64>,
}

impl ProfileBuilder {
    pub fn new() -> Self {
        ProfileBuilder {
            vtypes: VTypes::new(),
            object_classes: HashMap::new(),
            constants: HashMap::new(),
        }
    }

    /// Merge a vtypes map with overlay semantics.
    pub fn merge(&mut self, types: VTypes) -> &mut Self {
        merge_overlay(&mut self.vtypes, types);
        self
    }

    pub fn object_class(&mut self, type_name: &'static str, class: &'static str) -> &mut Self {
        self.object_classes.insert(type_name, class);
        self
    }

    pub fn constant(&mut self, name: &'static str, value: u64) -> &mut Self {
        self.constants.insert(name, value);
        self
    }

    pub fn build(
        self,
        name: &'static str,
        mode: ArchMode,
        pointer_width: u8,
        kdbg_dtb_offset: u64,
    ) -> Profile {
        Profile {
            name,
            mode,
            pointer_width,
            kdbg_dtb_offset,
            vtypes: self.vtypes,
            object_classes: self.object_classes,
            constants: self.constants,
        }
    }
}

impl Default for ProfileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref CONTAINERS: Arc<Profile> = Arc::new(build_containers());
    static ref REGISTERED: Vec<Arc<Profile>> = vec![
        Arc::new(windows::winxp_sp2_x86::build()),
        Arc::new(windows::vista_sp1_x86::build()),
        Arc::new(windows::win7_sp1_x64::build()),
    ];
}

/// Container-format types (ELF, crash dump, hibernation), available
/// before any OS profile has been selected.
pub fn containers() -> Arc<Profile> {
    CONTAINERS.clone()
}

/// The shipped OS profiles in registration order.
pub fn registered() -> &'static [Arc<Profile>] {
    &REGISTERED
}

pub fn by_name(name: &str) -> Option<Arc<Profile>> {
    registered()
        .iter()
        .find(|profile| profile.name.eq_ignore_ascii_case(name))
        .cloned()
}

fn build_containers() -> Profile {
    let mut builder = ProfileBuilder::new();
    let mut types = VTypes::new();
    elf::install(&mut types);
    windows::install_container_types(&mut types);
    builder.merge(types);
    builder.object_class("elf32_hdr", "ElfHdr");
    builder.object_class("elf64_hdr", "ElfHdr");
    builder.object_class("elf32_note", "ElfNote");
    builder.object_class("elf64_note", "ElfNote");
    builder.build("Containers", ArchMode::X86, 4, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order_and_lookup() {
        let names: Vec<&str> = registered().iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["WinXPSP2x86", "VistaSP1x86", "Win7SP1x64"]);
        assert!(by_name("vistasp1x86").is_some());
        assert!(by_name("nonesuch").is_none());
    }

    #[test]
    fn test_profile_accessors() {
        let profile = containers();
        assert_eq!(profile.get_obj_size("elf32_hdr"), Some(52));
        assert_eq!(profile.get_obj_offset("elf32_hdr", "e_phoff"), Some(28));
        assert_eq!(profile.object_class("elf32_hdr"), Some("ElfHdr"));
        assert!(profile.types().any(|name| name == "_DMP_HEADER"));
    }

    #[test]
    fn test_kdbg_headers_differ_per_profile() {
        let xp = by_name("WinXPSP2x86").unwrap();
        let vista = by_name("VistaSP1x86").unwrap();
        assert_eq!(
            vista.kdbg_header().unwrap(),
            b"\x00\x00\x00\x00\x00\x00\x00\x00KDBG\x30\x03"
        );
        assert_ne!(xp.kdbg_header().unwrap(), vista.kdbg_header().unwrap());
    }
}
