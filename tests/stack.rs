//! End-to-end assembly: a QEMU ELF coredump wrapping an x86 physical
//! image, from raw file to kernel virtual reads.

use std::io::Write as _;
use std::path::PathBuf;

use exhume::addrspace::{self, AddressSpace as _};
use exhume::config::Config;

const DTB: u64 = 0x9000;
const KDBG_PHYS: u64 = 0x2000;

/// Physical memory content: a KDBG anchor with the DTB at the
/// profile-specified offset, one large-page directory entry and a
/// recognizable marker.
fn physical_image() -> Vec<u8> {
    let mut phys = vec![0u8; 0x10000];
    let kdbg = KDBG_PHYS as usize;
    phys[kdbg + 8..kdbg + 14].copy_from_slice(b"KDBG\x90\x02");
    phys[kdbg + 0x40..kdbg + 0x44].copy_from_slice(&(DTB as u32).to_le_bytes());
    // PDE 0x200: 4 MiB page mapping 0x80000000 onto physical 0.
    let pde: u32 = 0x83;
    phys[(DTB as usize) + 0x800..(DTB as usize) + 0x804].copy_from_slice(&pde.to_le_bytes());
    phys[0x3000..0x3006].copy_from_slice(b"MARKER");
    phys
}

/// Wrap `phys` in a minimal little-endian ELF32 coredump.
fn elf_core_image(e_type: u16, phys: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; 0x1000 + phys.len()];
    bytes[..6].copy_from_slice(b"\x7fELF\x01\x01");
    bytes[16..18].copy_from_slice(&e_type.to_le_bytes());
    bytes[28..32].copy_from_slice(&0x34u32.to_le_bytes()); // e_phoff
    bytes[44..46].copy_from_slice(&2u16.to_le_bytes()); // e_phnum

    // PT_NOTE with the QEMU CORE marker at 0x200.
    bytes[0x34..0x38].copy_from_slice(&4u32.to_le_bytes());
    bytes[0x38..0x3c].copy_from_slice(&0x200u32.to_le_bytes());
    bytes[0x200..0x204].copy_from_slice(&5u32.to_le_bytes());
    bytes[0x208..0x20c].copy_from_slice(&1u32.to_le_bytes());
    bytes[0x20c..0x211].copy_from_slice(b"CORE\0");

    // PT_LOAD: all of physical memory from file offset 0x1000.
    let phdr = 0x54;
    bytes[phdr..phdr + 4].copy_from_slice(&1u32.to_le_bytes());
    bytes[phdr + 4..phdr + 8].copy_from_slice(&0x1000u32.to_le_bytes());
    bytes[phdr + 16..phdr + 20].copy_from_slice(&(phys.len() as u32).to_le_bytes());
    bytes[phdr + 20..phdr + 24].copy_from_slice(&(phys.len() as u32).to_le_bytes());

    bytes[0x1000..].copy_from_slice(phys);
    bytes
}

fn write_image(bytes: &[u8]) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.core");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(bytes).unwrap();
    (dir, path)
}

#[test]
fn test_full_stack_assembly_and_virtual_reads() {
    let (_dir, path) = write_image(&elf_core_image(4, &physical_image()));
    let config = Config::from_image_path(&path).unwrap();

    let ctx = addrspace::load_address_space(&config).unwrap();
    assert_eq!(
        addrspace::describe_stack(&ctx.layers),
        "FileAddressSpace -> QemuCoreDumpElf -> IA32PagedMemory"
    );
    assert_eq!(ctx.profile.name, "WinXPSP2x86");
    assert_eq!(ctx.dtb, DTB);
    assert_eq!(ctx.kdbg, Some(KDBG_PHYS));

    // Virtual reads go through the whole stack.
    assert_eq!(ctx.layers.read(0x8000_3000, 6).unwrap(), b"MARKER");
    assert_eq!(ctx.layers.vtop(0x8000_3000), Some(0x3000));
    assert_eq!(ctx.physical.read(0x3000, 6).unwrap(), b"MARKER");

    // Zread totality on every layer of the stack.
    assert_eq!(ctx.layers.zread(0x8000_0000, 0x800000).len(), 0x800000);
    assert_eq!(ctx.physical.zread(0xfff0, 0x20).len(), 0x20);
}

#[test]
fn test_dtb_override_skips_discovery() {
    let (_dir, path) = write_image(&elf_core_image(4, &physical_image()));
    let mut config = Config::from_image_path(&path).unwrap();
    config.profile = Some("WinXPSP2x86".to_string());
    config.dtb = Some(0x1234);

    let ctx = addrspace::load_address_space(&config).unwrap();
    assert_eq!(ctx.dtb, 0x1234);
}

#[test]
fn test_non_core_elf_falls_back_to_raw() {
    // ET_EXEC fails the coredump probe; only the raw layer stacks.
    let (_dir, path) = write_image(&elf_core_image(2, &physical_image()));
    let config = Config::from_image_path(&path).unwrap();

    let physical = addrspace::load_physical(&config).unwrap();
    assert_eq!(physical.name(), "FileAddressSpace");
    assert!(physical.base().is_none());

    // Without a container the KDBG anchor sits 0x1000 deeper; the
    // profile scan still finds it in the raw view.
    let ctx = addrspace::load_address_space(&config).unwrap();
    assert_eq!(ctx.kdbg, Some(KDBG_PHYS + 0x1000));
}

#[test]
fn test_unrecognized_image_is_a_fatal_configuration_error() {
    let (_dir, path) = write_image(&vec![0u8; 0x4000]);
    let config = Config::from_image_path(&path).unwrap();

    let err = addrspace::load_address_space(&config).unwrap_err();
    assert!(err.to_string().contains("no registered profile"));
}
