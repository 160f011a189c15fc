//! QEMU ELF coredump container.

use std::any::Any;
use std::sync::Arc;

use super::runs::{Run, RunTable};
use super::{AddressSpace, ProbeError, ProbeResult, probe_assert};
use crate::config::Config;
use crate::object::Object;
use crate::prelude::*;
use crate::profile;
use crate::profile::elf::{ElfHdr, ElfNote};

/// QEMU marks its core note with this type.
const NT_QEMUCORE: u64 = 0x1;

pub struct QemuCoreDumpElf {
    base: Arc<dyn AddressSpace>,
    runs: RunTable,
}

pub(super) fn probe(
    base: Option<Arc<dyn AddressSpace>>,
    _config: &Config,
) -> ProbeResult<Arc<dyn AddressSpace>> {
    let base = base.ok_or_else(|| ProbeError::skip("no base address space"))?;

    // ELF class and endianness are checked before any object is built;
    // only little-endian images are supported.
    let ident = base.read(0, 6).unwrap_or_default();
    let (hdr_type, note_type) = match ident.as_slice() {
        b"\x7fELF\x01\x01" => ("elf32_hdr", "elf32_note"),
        b"\x7fELF\x02\x01" => ("elf64_hdr", "elf64_note"),
        _ => {
            probe_assert(ident.starts_with(b"\x7fELF"), "ELF header signature invalid")?;
            return Err(ProbeError::skip("ELF class or endianness unsupported"));
        }
    };

    let elf = ElfHdr::new(Object::new(profile::containers(), base.clone(), hdr_type, 0));
    probe_assert(elf.is_core(), "ELF type is not a core file")?;

    let mut runs = Vec::new();
    let mut core_note = false;
    for phdr in elf.program_headers() {
        let p_type = phdr.field("p_type").repr();
        if p_type == "PT_NOTE" {
            // The first note should be the CORE segment.
            let note = ElfNote::new(phdr.field("p_offset").deref_as(note_type));
            if note.name().as_deref() == Some("CORE") && note.n_type() == Some(NT_QEMUCORE) {
                core_note = true;
            }
            continue;
        }
        // Only keep load segments with valid file sizes.
        if p_type != "PT_LOAD" {
            continue;
        }
        let filesz = phdr.field("p_filesz").as_u64().unwrap_or(0);
        let memsz = phdr.field("p_memsz").as_u64().unwrap_or(0);
        if filesz == 0 || filesz != memsz {
            continue;
        }
        let (Some(paddr), Some(offset)) = (
            phdr.field("p_paddr").as_u64(),
            phdr.field("p_offset").as_u64(),
        ) else {
            continue;
        };
        runs.push(Run {
            phys: paddr,
            file_offset: offset,
            length: memsz,
        });
    }
    probe_assert(core_note, "did not find any PT_NOTE segment with CORE")?;
    probe_assert(!runs.is_empty(), "did not find any LOAD segment with main RAM")?;

    let runs = RunTable::new(runs, &base).map_err(ProbeError::Fatal)?;
    debug!("ELF coredump with {} runs", runs.runs().len());
    Ok(Arc::new(QemuCoreDumpElf { base, runs }))
}

impl QemuCoreDumpElf {
    pub fn runs(&self) -> &[Run] {
        self.runs.runs()
    }
}

impl AddressSpace for QemuCoreDumpElf {
    fn name(&self) -> &'static str {
        "QemuCoreDumpElf"
    }

    fn base(&self) -> Option<&Arc<dyn AddressSpace>> {
        Some(&self.base)
    }

    fn read(&self, addr: u64, length: usize) -> Option<Vec<u8>> {
        self.runs.read(&self.base, addr, length)
    }

    fn zread(&self, addr: u64, length: usize) -> Vec<u8> {
        self.runs.zread(&self.base, addr, length)
    }

    fn is_valid_address(&self, addr: u64) -> bool {
        self.runs.is_valid(addr)
    }

    fn available_ranges(&self) -> Vec<(u64, u64)> {
        self.runs.ranges()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrspace::buffer::BufferAddressSpace;

    /// A minimal ELF32 coredump: one CORE note and one LOAD segment
    /// mapping physical 0 from file offset 0x1000.
    fn core_image(e_type: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; 0x11000];
        bytes[..6].copy_from_slice(b"\x7fELF\x01\x01");
        bytes[16..18].copy_from_slice(&e_type.to_le_bytes());
        bytes[28..32].copy_from_slice(&0x34u32.to_le_bytes()); // e_phoff
        bytes[44..46].copy_from_slice(&2u16.to_le_bytes()); // e_phnum

        // PT_NOTE at file offset 0x200
        bytes[0x34..0x38].copy_from_slice(&4u32.to_le_bytes());
        bytes[0x38..0x3c].copy_from_slice(&0x200u32.to_le_bytes());
        bytes[0x200..0x204].copy_from_slice(&5u32.to_le_bytes()); // namesz
        bytes[0x208..0x20c].copy_from_slice(&1u32.to_le_bytes()); // NT_QEMUCORE
        bytes[0x20c..0x211].copy_from_slice(b"CORE\0");

        // PT_LOAD: paddr 0, offset 0x1000, filesz == memsz == 0x10000
        let phdr = 0x34 + 32;
        bytes[phdr..phdr + 4].copy_from_slice(&1u32.to_le_bytes());
        bytes[phdr + 4..phdr + 8].copy_from_slice(&0x1000u32.to_le_bytes());
        bytes[phdr + 12..phdr + 16].copy_from_slice(&0u32.to_le_bytes());
        bytes[phdr + 16..phdr + 20].copy_from_slice(&0x10000u32.to_le_bytes());
        bytes[phdr + 20..phdr + 24].copy_from_slice(&0x10000u32.to_le_bytes());
        bytes
    }

    fn probe_over(bytes: Vec<u8>) -> ProbeResult<Arc<dyn AddressSpace>> {
        let base: Arc<dyn AddressSpace> = Arc::new(BufferAddressSpace::new(bytes));
        let config = crate::config::Config::test(std::path::Path::new("/dev/null"));
        probe(Some(base), &config)
    }

    #[test]
    fn test_core_probe_builds_runs() {
        let mut bytes = core_image(4);
        bytes[0x1000] = 0x5a;
        let space = probe_over(bytes).unwrap();
        let elf = space
            .as_any()
            .downcast_ref::<QemuCoreDumpElf>()
            .unwrap();
        assert_eq!(
            elf.runs(),
            &[Run {
                phys: 0,
                file_offset: 0x1000,
                length: 0x10000,
            }]
        );
        assert_eq!(space.read(0, 1).unwrap(), vec![0x5a]);
        assert_eq!(space.available_ranges(), vec![(0, 0x10000)]);
    }

    #[test]
    fn test_executable_fails_the_probe() {
        // ET_EXEC is not a core file; the assembler skips the layer.
        match probe_over(core_image(2)) {
            Err(ProbeError::NotApplicable(reason)) => {
                assert!(reason.contains("not a core file"), "{reason}");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("probe unexpectedly succeeded"),
        }
    }

    #[test]
    fn test_non_elf_and_big_endian_are_skipped() {
        assert!(matches!(
            probe_over(vec![0u8; 0x100]),
            Err(ProbeError::NotApplicable(_))
        ));
        let mut bytes = core_image(4);
        bytes[5] = 2; // ELFDATA2MSB
        assert!(matches!(
            probe_over(bytes),
            Err(ProbeError::NotApplicable(_))
        ));
    }

    #[test]
    fn test_missing_core_note_is_skipped() {
        let mut bytes = core_image(4);
        bytes[0x20c..0x211].copy_from_slice(b"XXXX\0");
        match probe_over(bytes) {
            Err(ProbeError::NotApplicable(reason)) => {
                assert!(reason.contains("PT_NOTE"), "{reason}");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("probe unexpectedly succeeded"),
        }
    }
}
