//! Three-level x86 PAE paging, 4 KiB and 2 MiB pages.

use std::any::Any;
use std::sync::Arc;

use super::paged;
use super::{AddressSpace, ProbeResult, probe_assert};
use crate::config::Config;
use crate::profile::{ArchMode, Profile};

const PRESENT: u64 = 1;
const LARGE_PAGE: u64 = 1 << 7;
const ENTRY_MASK: u64 = 0x0000_ffff_ffff_f000;

pub struct Ia32PaePagedMemory {
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
    probe_assert(profile.mode == ArchMode::X86Pae, "profile is not PAE x86")?;
    probe_assert(
        base.is_valid_address(dtb),
        "DTB lies outside the physical view",
    )?;
    Ok(Arc::new(Ia32PaePagedMemory {
        base,
        dtb,
        write_enabled: config.write,
    }))
}

impl Ia32PaePagedMemory {
    pub fn new(base: Arc<dyn AddressSpace>, dtb: u64) -> Self {
        Ia32PaePagedMemory {
            base,
            dtb,
            write_enabled: false,
        }
    }

    fn pdpte(&self, index: u64) -> Option<u64> {
        self.base.read_u64((self.dtb & 0xffff_ffe0) + index * 8)
    }

    fn entry(&self, table: u64, index: u64) -> Option<u64> {
        self.base.read_u64((table & ENTRY_MASK) + index * 8)
    }

    fn pages(&self) -> Vec<(u64, u64)> {
        let mut pages = Vec::new();
        for dirptr in 0..4u64 {
            let Some(pdpte) = self.pdpte(dirptr) else {
                continue;
            };
            if pdpte & PRESENT == 0 {
                continue;
            }
            for dir in 0..512u64 {
                let Some(pde) = self.entry(pdpte, dir) else {
                    continue;
                };
                if pde & PRESENT == 0 {
                    continue;
                }
                let vbase = (dirptr << 30) | (dir << 21);
                if pde & LARGE_PAGE != 0 {
                    pages.push((vbase, 0x20_0000));
                    continue;
                }
                for table in 0..512u64 {
                    let Some(pte) = self.entry(pde, table) else {
                        continue;
                    };
                    if pte & PRESENT != 0 {
                        pages.push((vbase | (table << 12), 0x1000));
                    }
                }
            }
        }
        pages
    }
}

impl AddressSpace for Ia32PaePagedMemory {
    fn name(&self) -> &'static str {
        "IA32PagedMemoryPae"
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
        let pdpte = self.pdpte((vaddr >> 30) & 0x3)?;
        if pdpte & PRESENT == 0 {
            return None;
        }
        let pde = self.entry(pdpte, (vaddr >> 21) & 0x1ff)?;
        if pde & PRESENT == 0 {
            return None;
        }
        if pde & LARGE_PAGE != 0 {
            return Some((pde & 0x0000_ffff_ffe0_0000) | (vaddr & 0x1f_ffff));
        }
        let pte = self.entry(pde, (vaddr >> 12) & 0x1ff)?;
        if pte & PRESENT == 0 {
            return None;
        }
        Some((pte & ENTRY_MASK) | (vaddr & 0xfff))
    }

    fn write(&self, addr: u64, data: &[u8]) -> bool {
        paged::split_write(self, self.write_enabled, addr, data)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
