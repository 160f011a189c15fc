//! Two-level x86 paging, 4 KiB and 4 MiB pages.

use std::any::Any;
use std::sync::Arc;

use super::paged;
use super::{AddressSpace, ProbeResult, probe_assert};
use crate::config::Config;
use crate::profile::{ArchMode, Profile};

const PRESENT: u32 = 1;
const LARGE_PAGE: u32 = 1 << 7;

pub struct Ia32PagedMemory {
    base: Arc<dyn AddressSpace>,
    dtb: u64,
    write_enabled: bool,
}

pub(super) fn probe(
    base: Arc<dyn AddressSpace>,
    config: &Config,
    profile: &Arc<Profile>,
    dtb: u64,
) -> ProbeResult<Arc<dyn AddressSpace>> {
    probe_assert(profile.mode == ArchMode::X86, "profile is not plain x86")?;
    probe_assert(
        base.is_valid_address(dtb),
        "DTB lies outside the physical view",
    )?;
    Ok(Arc::new(Ia32PagedMemory {
        base,
        dtb,
        write_enabled: config.write,
    }))
}

impl Ia32PagedMemory {
    pub fn new(base: Arc<dyn AddressSpace>, dtb: u64) -> Self {
        Ia32PagedMemory {
            base,
            dtb,
            write_enabled: false,
        }
    }

    pub fn dtb(&self) -> u64 {
        self.dtb
    }

    fn pde(&self, index: u64) -> Option<u32> {
        self.base.read_u32((self.dtb & 0xffff_f000) + index * 4)
    }

    fn pte(&self, pde: u32, index: u64) -> Option<u32> {
        self.base.read_u32((u64::from(pde) & 0xffff_f000) + index * 4)
    }

    fn pages(&self) -> Vec<(u64, u64)> {
        let mut pages = Vec::new();
        for dir in 0..1024u64 {
            let Some(pde) = self.pde(dir) else { continue };
            if pde & PRESENT == 0 {
                continue;
            }
            if pde & LARGE_PAGE != 0 {
                pages.push((dir << 22, 0x40_0000));
                continue;
            }
            for table in 0..1024u64 {
                let Some(pte) = self.pte(pde, table) else {
                    continue;
                };
                if pte & PRESENT != 0 {
                    pages.push(((dir << 22) | (table << 12), 0x1000));
                }
            }
        }
        pages
    }
}

impl AddressSpace for Ia32PagedMemory {
    fn name(&self) -> &'static str {
        "IA32PagedMemory"
    }

    fn base(&self) -> Option<&Arc<dyn AddressSpace>> {
        Some(&self.base)
    }

    fn read(&self, addr: u64, length: usize) -> Option<Vec<u8>> {
        paged::split_read(self, addr, length)
    }

    fn zread(&self, addr: u64, length: usize) -> Vec<u8> {
        paged::split_zread(self, addr, length)
    }

    fn is_valid_address(&self, addr: u64) -> bool {
        paged::is_valid(self, addr)
    }

    fn available_ranges(&self) -> Vec<(u64, u64)> {
        paged::coalesce(self.pages())
    }

    fn vtop(&self, vaddr: u64) -> Option<u64> {
        let vaddr = vaddr & 0xffff_ffff;
        let pde = self.pde((vaddr >> 22) & 0x3ff)?;
        if pde & PRESENT == 0 {
            return None;
        }
        if pde & LARGE_PAGE != 0 {
            return Some((u64::from(pde) & 0xffc0_0000) | (vaddr & 0x3f_ffff));
        }
        let pte = self.pte(pde, (vaddr >> 12) & 0x3ff)?;
        if pte & PRESENT == 0 {
            return None;
        }
        Some((u64::from(pte) & 0xffff_f000) | (vaddr & 0xfff))
    }

    fn write(&self, addr: u64, data: &[u8]) -> bool {
        paged::split_write(self, self.write_enabled, addr, data)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrspace::buffer::BufferAddressSpace;
    use rstest::rstest;

    const DTB: u64 = 0x39000;

    /// Physical space with one 4 MiB page at 0xc0000000 -> 0x01000000
    /// and one 4 KiB page at 0xc0800000 -> 0x5000.
    fn synthetic() -> Arc<dyn AddressSpace> {
        let mut phys = vec![0u8; 0x0140_0000];
        // PDE 0x300: large page, base 0x01000000
        let pde_large: u32 = 0x0100_0000 | LARGE_PAGE | PRESENT;
        phys[(DTB as usize + 0x300 * 4)..(DTB as usize + 0x300 * 4 + 4)]
            .copy_from_slice(&pde_large.to_le_bytes());
        // PDE 0x302 -> page table at 0x3a000
        let pde_table: u32 = 0x3a000 | PRESENT;
        phys[(DTB as usize + 0x302 * 4)..(DTB as usize + 0x302 * 4 + 4)]
            .copy_from_slice(&pde_table.to_le_bytes());
        // PTE 0 -> 0x5000
        let pte: u32 = 0x5000 | PRESENT;
        phys[0x3a000..0x3a004].copy_from_slice(&pte.to_le_bytes());
        // Recognizable content in the mapped pages.
        phys[0x0100_0100] = 0x42;
        for byte in phys.iter_mut().skip(0x013f_f000).take(0x1000) {
            *byte = 0x77;
        }
        phys[0x5000] = 0x55;
        Arc::new(BufferAddressSpace::new(phys))
    }

    #[rstest]
    #[case(0xc000_0100, Some(0x0100_0100))]
    #[case(0xc000_0000, Some(0x0100_0000))]
    #[case(0xc040_0000, None)]
    #[case(0xc080_0000, Some(0x5000))]
    #[case(0xc080_1000, None)]
    fn test_vtop(#[case] vaddr: u64, #[case] expected: Option<u64>) {
        let space = Ia32PagedMemory::new(synthetic(), DTB);
        assert_eq!(space.vtop(vaddr), expected);
    }

    #[test]
    fn test_read_through_large_page() {
        let space = Ia32PagedMemory::new(synthetic(), DTB);
        assert_eq!(space.read(0xc000_0100, 1).unwrap(), vec![0x42]);
        assert!(space.is_valid_address(0xc000_0100));
        assert!(!space.is_valid_address(0xc040_0000));
    }

    #[test]
    fn test_zread_pads_unmapped_tail() {
        let space = Ia32PagedMemory::new(synthetic(), DTB);
        let buf = space.zread(0xc03f_f000, 0x2000);
        assert_eq!(buf.len(), 0x2000);
        assert!(buf[..0x1000].iter().all(|b| *b == 0x77));
        assert!(buf[0x1000..].iter().all(|b| *b == 0));
        // The strict read refuses the same request.
        assert_eq!(space.read(0xc03f_f000, 0x2000), None);
    }

    #[test]
    fn test_available_ranges_coalesce() {
        let space = Ia32PagedMemory::new(synthetic(), DTB);
        assert_eq!(
            space.available_ranges(),
            vec![(0xc000_0000, 0x40_0000), (0xc080_0000, 0x1000)]
        );
    }

    #[test]
    fn test_write_gated_and_per_page() {
        let base = synthetic();
        let read_only = Ia32PagedMemory::new(base.clone(), DTB);
        assert!(!read_only.write(0xc000_0100, &[1]));

        let writable = Ia32PagedMemory {
            base: base.clone(),
            dtb: DTB,
            write_enabled: true,
        };
        assert!(writable.write(0xc000_0100, &[0x99]));
        assert_eq!(base.read(0x0100_0100, 1).unwrap(), vec![0x99]);
        // Crossing into an unmapped page fails after the first page was
        // written.
        let two_pages = vec![0x33u8; 0x2000];
        assert!(!writable.write(0xc03f_f000, &two_pages));
        assert_eq!(base.read(0x013f_f000, 1).unwrap(), vec![0x33]);
    }
}
