//! Behavior shared by the paging layers: requests split at 4 KiB
//! boundaries, zero-fill reads, gated page-granular writes, and range
//! coalescing.

use super::{AddressSpace, PAGE_SIZE};

/// Read through `vtop`, failing the whole request on any unmapped chunk.
pub(super) fn split_read(space: &dyn AddressSpace, vaddr: u64, length: usize) -> Option<Vec<u8>> {
    let base = space.base()?;
    let mut out = Vec::with_capacity(length);
    let mut addr = vaddr;
    let mut remaining = length as u64;
    while remaining > 0 {
        let chunk = (PAGE_SIZE - (addr % PAGE_SIZE)).min(remaining);
        let paddr = space.vtop(addr)?;
        out.extend_from_slice(&base.read(paddr, chunk as usize)?);
        addr += chunk;
        remaining -= chunk;
    }
    Some(out)
}

/// Read through `vtop`, substituting zeroes for unmapped chunks.
pub(super) fn split_zread(space: &dyn AddressSpace, vaddr: u64, length: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(length);
    let mut addr = vaddr;
    let mut remaining = length as u64;
    while remaining > 0 {
        let chunk = (PAGE_SIZE - (addr % PAGE_SIZE)).min(remaining);
        match (space.vtop(addr), space.base()) {
            (Some(paddr), Some(base)) => out.extend_from_slice(&base.zread(paddr, chunk as usize)),
            _ => out.resize(out.len() + chunk as usize, 0),
        }
        addr += chunk;
        remaining -= chunk;
    }
    out
}

/// Write through `vtop`, page by page. Non-transactional: a failure
/// mid-sequence returns false with earlier pages already written.
pub(super) fn split_write(
    space: &dyn AddressSpace,
    write_enabled: bool,
    vaddr: u64,
    data: &[u8],
) -> bool {
    if !write_enabled {
        return false;
    }
    let Some(base) = space.base() else {
        return false;
    };
    let mut addr = vaddr;
    let mut data = data;
    while !data.is_empty() {
        let chunk = ((PAGE_SIZE - (addr % PAGE_SIZE)).min(data.len() as u64)) as usize;
        let Some(paddr) = space.vtop(addr) else {
            return false;
        };
        if !base.write(paddr, &data[..chunk]) {
            return false;
        }
        addr += chunk as u64;
        data = &data[chunk..];
    }
    true
}

pub(super) fn is_valid(space: &dyn AddressSpace, vaddr: u64) -> bool {
    match (space.vtop(vaddr), space.base()) {
        (Some(paddr), Some(base)) => base.is_valid_address(paddr),
        _ => false,
    }
}

/// Merge adjacent `(start, size)` pages into maximal runs.
pub(crate) fn coalesce(pages: impl IntoIterator<Item = (u64, u64)>) -> Vec<(u64, u64)> {
    let mut out: Vec<(u64, u64)> = Vec::new();
    for (start, size) in pages {
        match out.last_mut() {
            Some((run_start, run_len)) if *run_start + *run_len == start => *run_len += size,
            _ => out.push((start, size)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_merges_adjacent_pages() {
        let pages = vec![
            (0x1000, 0x1000),
            (0x2000, 0x1000),
            (0x3000, 0x1000),
            (0x8000, 0x1000),
            (0x400000, 0x400000),
            (0x800000, 0x1000),
        ];
        assert_eq!(
            coalesce(pages),
            vec![(0x1000, 0x3000), (0x8000, 0x1000), (0x400000, 0x401000)]
        );
    }
}
