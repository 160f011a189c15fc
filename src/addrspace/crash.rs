//! Windows crash-dump container.

use std::any::Any;
use std::sync::Arc;

use super::runs::{Run, RunTable};
use super::{AddressSpace, PAGE_SHIFT, ProbeError, ProbeResult, probe_assert};
use crate::config::Config;
use crate::object::Object;
use crate::prelude::*;
use crate::profile;

const HEADER_SIZE: u64 = 0x1000;
/// A descriptor claiming more runs than this is garbage, not a dump.
const MAX_RUNS: u64 = 0x100;

pub struct WindowsCrashDumpSpace32 {
    base: Arc<dyn AddressSpace>,
    runs: RunTable,
    dtb: u64,
}

pub(super) fn probe(
    base: Option<Arc<dyn AddressSpace>>,
    _config: &Config,
) -> ProbeResult<Arc<dyn AddressSpace>> {
    let base = base.ok_or_else(|| ProbeError::skip("no base address space"))?;
    let signature = base.read(0, 8).unwrap_or_default();
    probe_assert(signature == b"PAGEDUMP", "crash dump signature invalid")?;

    let header = Object::new(profile::containers(), base.clone(), "_DMP_HEADER", 0);
    let dtb = header
        .field("DirectoryTableBase")
        .as_u64()
        .ok_or_else(|| ProbeError::skip("unreadable crash dump header"))?;

    let descriptor = header.field("PhysicalMemoryBlock");
    let run_count = descriptor.field("NumberOfRuns").as_u64().unwrap_or(0);
    probe_assert(run_count > 0, "crash dump has no physical memory runs")?;
    probe_assert(run_count <= MAX_RUNS, "implausible crash dump run count")?;

    // Run data follows the header page in ascending physical order.
    let mut runs = Vec::new();
    let mut file_offset = HEADER_SIZE;
    for run in descriptor.field("Run").iter() {
        let (Some(base_page), Some(page_count)) = (
            run.field("BasePage").as_u64(),
            run.field("PageCount").as_u64(),
        ) else {
            return Err(ProbeError::skip("truncated physical memory descriptor"));
        };
        let length = page_count << PAGE_SHIFT;
        runs.push(Run {
            phys: base_page << PAGE_SHIFT,
            file_offset,
            length,
        });
        file_offset += length;
    }

    let runs = RunTable::new(runs, &base).map_err(ProbeError::Fatal)?;
    debug!("Crash dump with {} runs, DTB {:#x}", runs.runs().len(), dtb);
    Ok(Arc::new(WindowsCrashDumpSpace32 { base, runs, dtb }))
}

impl WindowsCrashDumpSpace32 {
    pub fn runs(&self) -> &[Run] {
        self.runs.runs()
    }

    /// The crash-dump header, read through the object engine.
    pub fn header(&self) -> Object {
        Object::new(profile::containers(), self.base.clone(), "_DMP_HEADER", 0)
    }
}

impl AddressSpace for WindowsCrashDumpSpace32 {
    fn name(&self) -> &'static str {
        "WindowsCrashDumpSpace32"
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

    fn dtb_hint(&self) -> Option<u64> {
        (self.dtb != 0).then_some(self.dtb)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
