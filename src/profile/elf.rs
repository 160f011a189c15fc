//! ELF container types, available before any OS profile exists, plus
//! the header and note capability sets.

use super::vtypes::{TypeDescriptor as T, VTypes, structure};
use crate::object::Object;

pub const ET_CHOICES: &[(u64, &str)] = &[
    (0, "ET_NONE"),
    (1, "ET_REL"),
    (2, "ET_EXEC"),
    (3, "ET_DYN"),
    (4, "ET_CORE"),
    (0xff00, "ET_LOPROC"),
    (0xffff, "ET_HIPROC"),
];

pub const PT_CHOICES: &[(u64, &str)] = &[
    (0, "PT_NULL"),
    (1, "PT_LOAD"),
    (2, "PT_DYNAMIC"),
    (3, "PT_INTERP"),
    (4, "PT_NOTE"),
    (5, "PT_SHLIB"),
    (6, "PT_PHDR"),
    (7, "PT_TLS"),
    (0x6000_0000, "PT_LOOS"),
    (0x6fff_ffff, "PT_HIOS"),
    (0x7000_0000, "PT_LOPROC"),
    (0x7fff_ffff, "PT_HIPROC"),
];

fn note_namesz(parent: &Object) -> Option<usize> {
    parent.field("n_namesz").as_u64().map(|v| v as usize)
}

pub fn install(vtypes: &mut VTypes) {
    vtypes.insert(
        "elf32_hdr",
        structure(
            52,
            vec![
                ("e_ident", 0, T::string(16)),
                ("e_type", 16, T::enumeration(T::unsigned(2), ET_CHOICES)),
                ("e_machine", 18, T::unsigned(2)),
                ("e_version", 20, T::unsigned(4)),
                ("e_entry", 24, T::unsigned(4)),
                ("e_phoff", 28, T::unsigned(4)),
                ("e_shoff", 32, T::unsigned(4)),
                ("e_flags", 36, T::unsigned(4)),
                ("e_ehsize", 40, T::unsigned(2)),
                ("e_phentsize", 42, T::unsigned(2)),
                ("e_phnum", 44, T::unsigned(2)),
                ("e_shentsize", 46, T::unsigned(2)),
                ("e_shnum", 48, T::unsigned(2)),
                ("e_shstrndx", 50, T::unsigned(2)),
            ],
        ),
    );
    vtypes.insert(
        "elf32_phdr",
        structure(
            32,
            vec![
                ("p_type", 0, T::enumeration(T::unsigned(4), PT_CHOICES)),
                ("p_offset", 4, T::unsigned(4)),
                ("p_vaddr", 8, T::unsigned(4)),
                ("p_paddr", 12, T::unsigned(4)),
                ("p_filesz", 16, T::unsigned(4)),
                ("p_memsz", 20, T::unsigned(4)),
                ("p_flags", 24, T::unsigned(4)),
                ("p_align", 28, T::unsigned(4)),
            ],
        ),
    );
    vtypes.insert(
        "elf64_hdr",
        structure(
            64,
            vec![
                ("e_ident", 0, T::string(16)),
                ("e_type", 16, T::enumeration(T::unsigned(2), ET_CHOICES)),
                ("e_machine", 18, T::unsigned(2)),
                ("e_version", 20, T::unsigned(4)),
                ("e_entry", 24, T::unsigned(8)),
                ("e_phoff", 32, T::unsigned(8)),
                ("e_shoff", 40, T::unsigned(8)),
                ("e_flags", 48, T::unsigned(4)),
                ("e_ehsize", 52, T::unsigned(2)),
                ("e_phentsize", 54, T::unsigned(2)),
                ("e_phnum", 56, T::unsigned(2)),
                ("e_shentsize", 58, T::unsigned(2)),
                ("e_shnum", 60, T::unsigned(2)),
                ("e_shstrndx", 62, T::unsigned(2)),
            ],
        ),
    );
    vtypes.insert(
        "elf64_phdr",
        structure(
            56,
            vec![
                ("p_type", 0, T::enumeration(T::unsigned(4), PT_CHOICES)),
                ("p_flags", 4, T::unsigned(4)),
                ("p_offset", 8, T::unsigned(8)),
                ("p_vaddr", 16, T::unsigned(8)),
                ("p_paddr", 24, T::unsigned(8)),
                ("p_filesz", 32, T::unsigned(8)),
                ("p_memsz", 40, T::unsigned(8)),
                ("p_align", 48, T::unsigned(8)),
            ],
        ),
    );
    let note = structure(
        12,
        vec![
            ("n_namesz", 0, T::unsigned(4)),
            ("n_descsz", 4, T::unsigned(4)),
            ("n_type", 8, T::unsigned(4)),
            ("namesz", 12, T::string_fn(note_namesz)),
        ],
    );
    vtypes.insert("elf32_note", note.clone());
    vtypes.insert("elf64_note", note);
}

/// An ELF header view with the program-header walk.
pub struct ElfHdr(Object);

impl ElfHdr {
    pub fn new(object: Object) -> Self {
        ElfHdr(object)
    }

    pub fn object(&self) -> &Object {
        &self.0
    }

    pub fn is_core(&self) -> bool {
        self.0.field("e_type").repr() == "ET_CORE"
    }

    fn phdr_type(&self) -> &'static str {
        match self.0.type_name() {
            Some("elf64_hdr") => "elf64_phdr",
            _ => "elf32_phdr",
        }
    }

    /// Program headers as an array at `e_phoff`, sized by `e_phnum`.
    pub fn program_headers(&self) -> crate::object::Elements {
        let phoff = self.0.field("e_phoff").as_u64().unwrap_or(0);
        let count = self.0.field("e_phnum").as_u64().unwrap_or(0) as usize;
        let offset = self.0.offset().unwrap_or(0) + phoff;
        self.0.array_at(self.phdr_type(), offset, count).iter()
    }
}

/// An ELF note view. The descriptor follows the 8-byte-aligned name.
pub struct ElfNote(Object);

impl ElfNote {
    pub fn new(object: Object) -> Self {
        ElfNote(object)
    }

    pub fn object(&self) -> &Object {
        &self.0
    }

    pub fn name(&self) -> Option<String> {
        self.0.field("namesz").as_string()
    }

    pub fn n_type(&self) -> Option<u64> {
        self.0.field("n_type").as_u64()
    }

    /// Cast the note descriptor as `type_name`. The descriptor sits at a
    /// variable offset: after the fixed header and the name, which is
    /// 8-byte aligned and can be zero.
    pub fn cast_descsz(&self, type_name: &str) -> Object {
        let (Some(profile), Some(vm), Some(offset)) =
            (self.0.profile(), self.0.vm(), self.0.offset())
        else {
            return self.0.clone();
        };
        let Some(note_type) = self.0.type_name() else {
            return Object::sentinel("note view has no type");
        };
        let Some(base_size) = profile.get_obj_size(note_type) else {
            return Object::sentinel("note type has no size");
        };
        let Some(namesz) = self.0.field("n_namesz").as_u64() else {
            return Object::sentinel("unreadable n_namesz");
        };
        let aligned = if namesz == 0 {
            0
        } else {
            (((namesz - 1) >> 3) + 1) << 3
        };
        Object::new(
            profile.clone(),
            vm.clone(),
            type_name,
            offset + base_size + aligned,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrspace::buffer::BufferAddressSpace;
    use crate::profile;
    use std::sync::Arc;

    #[test]
    fn test_program_header_walk() {
        let mut bytes = vec![0u8; 0x100];
        bytes[..6].copy_from_slice(b"\x7fELF\x01\x01");
        bytes[16..18].copy_from_slice(&4u16.to_le_bytes()); // ET_CORE
        bytes[28..32].copy_from_slice(&0x34u32.to_le_bytes()); // e_phoff
        bytes[44..46].copy_from_slice(&2u16.to_le_bytes()); // e_phnum
        // phdr 0: PT_NOTE at 0x80
        bytes[0x34..0x38].copy_from_slice(&4u32.to_le_bytes());
        bytes[0x38..0x3c].copy_from_slice(&0x80u32.to_le_bytes());
        // phdr 1: PT_LOAD
        bytes[0x54..0x58].copy_from_slice(&1u32.to_le_bytes());

        let vm: Arc<dyn crate::addrspace::AddressSpace> =
            Arc::new(BufferAddressSpace::new(bytes));
        let hdr = ElfHdr::new(Object::new(profile::containers(), vm, "elf32_hdr", 0));
        assert!(hdr.is_core());
        let types: Vec<String> = hdr
            .program_headers()
            .map(|phdr| phdr.field("p_type").repr())
            .collect();
        assert_eq!(types, vec!["PT_NOTE", "PT_LOAD"]);
    }

    #[test]
    fn test_note_descriptor_cast_is_aligned() {
        let mut bytes = vec![0u8; 0x40];
        bytes[..4].copy_from_slice(&5u32.to_le_bytes()); // n_namesz
        bytes[8..12].copy_from_slice(&1u32.to_le_bytes()); // n_type
        bytes[12..17].copy_from_slice(b"CORE\0");
        // Descriptor after 12-byte header + name padded to 8.
        bytes[20..24].copy_from_slice(&0xdeadu32.to_le_bytes());

        let vm: Arc<dyn crate::addrspace::AddressSpace> =
            Arc::new(BufferAddressSpace::new(bytes));
        let note = ElfNote::new(Object::new(profile::containers(), vm, "elf32_note", 0));
        assert_eq!(note.name().as_deref(), Some("CORE"));
        assert_eq!(note.n_type(), Some(1));

        let desc = note.cast_descsz("elf32_note");
        assert_eq!(desc.offset(), Some(20));
        assert_eq!(desc.field("n_namesz").v(), Some(0xdead));
    }
}
