//! Pool-tag scanning over physical address spaces.
//!
//! A scanner slides a four-byte window across the available ranges and
//! applies its constraints in registration order; the first false
//! rejects the candidate. Offsets yielded are pool-header starts.

use std::sync::Arc;

use crate::addrspace::AddressSpace;
use crate::object::Object;
use crate::prelude::*;
use crate::profile::Profile;

pub const HIVE_SIGNATURE: u64 = 0xbee0_bee0;

/// A candidate pool allocation under constraint evaluation.
pub struct ScanContext {
    pub space: Arc<dyn AddressSpace>,
    pub profile: Arc<Profile>,
    /// Pool-header start.
    pub offset: u64,
}

impl ScanContext {
    /// The pool header at the candidate offset.
    pub fn pool_header(&self) -> Object {
        Object::new(
            self.profile.clone(),
            self.space.clone(),
            "_POOL_HEADER",
            self.offset,
        )
    }

    /// Start of the allocation body following the pool header.
    pub fn body(&self) -> u64 {
        self.offset + self.profile.get_obj_size("_POOL_HEADER").unwrap_or(8)
    }
}

pub type Constraint = Box<dyn Fn(&ScanContext) -> bool + Send + Sync>;

pub struct PoolScanner {
    pool_tag: [u8; 4],
    pool_size: u64,
    constraints: Vec<(&'static str, Constraint)>,
}

impl PoolScanner {
    pub fn new(pool_tag: [u8; 4], pool_size: u64) -> Self {
        PoolScanner {
            pool_tag,
            pool_size,
            constraints: Vec::new(),
        }
    }

    pub fn pool_size(&self) -> u64 {
        self.pool_size
    }

    pub fn add_constraint(&mut self, name: &'static str, check: Constraint) {
        self.constraints.push((name, check));
    }

    /// Offsets of every pool allocation matching all constraints.
    pub fn scan<'s>(
        &'s self,
        space: Arc<dyn AddressSpace>,
        profile: Arc<Profile>,
    ) -> impl Iterator<Item = u64> + 's {
        let tag_offset = profile.get_obj_offset("_POOL_HEADER", "PoolTag").unwrap_or(4);
        Scan {
            scanner: self,
            ranges: space.available_ranges(),
            space,
            profile,
            tag_offset,
            range_index: 0,
            cursor: 0,
            pending: Vec::new(),
        }
    }

    fn accept(&self, ctx: &ScanContext) -> bool {
        self.constraints.iter().all(|(name, check)| {
            let ok = check(ctx);
            if !ok {
                trace!("{name} rejected candidate at {:#x}", ctx.offset);
            }
            ok
        })
    }
}

const SCAN_CHUNK: u64 = 0x10000;

struct Scan<'s> {
    scanner: &'s PoolScanner,
    space: Arc<dyn AddressSpace>,
    profile: Arc<Profile>,
    ranges: Vec<(u64, u64)>,
    tag_offset: u64,
    range_index: usize,
    /// Offset into the current range.
    cursor: u64,
    /// Hits found in the current chunk, drained in order.
    pending: Vec<u64>,
}

impl Scan<'_> {
    fn refill(&mut self) -> bool {
        while self.range_index < self.ranges.len() {
            let (start, length) = self.ranges[self.range_index];
            if self.cursor >= length {
                self.range_index += 1;
                self.cursor = 0;
                continue;
            }
            let offset = start + self.cursor;
            let span = SCAN_CHUNK.min(length - self.cursor);
            self.cursor += span;

            // Overlap by the window size so boundary tags are seen once.
            let buf = self.space.zread(offset, span as usize + 3);
            let tag = &self.scanner.pool_tag;
            let mut hits = Vec::new();
            for (pos, window) in buf.windows(4).enumerate() {
                if pos as u64 >= span {
                    break;
                }
                if window != tag {
                    continue;
                }
                let Some(candidate) = (offset + pos as u64).checked_sub(self.tag_offset) else {
                    continue;
                };
                let ctx = ScanContext {
                    space: self.space.clone(),
                    profile: self.profile.clone(),
                    offset: candidate,
                };
                if self.scanner.accept(&ctx) {
                    hits.push(candidate);
                }
            }
            if !hits.is_empty() {
                hits.reverse();
                self.pending = hits;
                return true;
            }
        }
        false
    }
}

impl Iterator for Scan<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        loop {
            if let Some(hit) = self.pending.pop() {
                return Some(hit);
            }
            if !self.refill() {
                return None;
            }
        }
    }
}

/// `BlockSize` must cover exactly the scanner's pool size. Block units
/// are 8 bytes on x86 and 16 on x64.
pub fn check_blocksize_equal(pool_size: u64) -> Constraint {
    Box::new(move |ctx| {
        let shift = if ctx.profile.pointer_width == 8 { 4 } else { 3 };
        ctx.pool_header()
            .field("BlockSize")
            .as_u64()
            .map(|blocks| blocks << shift == pool_size)
            .unwrap_or(false)
    })
}

/// Freed allocations carry a zero pool type.
pub fn check_pagedpooltype() -> Constraint {
    Box::new(|ctx| {
        ctx.pool_header()
            .field("PoolType")
            .as_u64()
            .map(|pool_type| pool_type != 0)
            .unwrap_or(false)
    })
}

/// Bounded pool index. Not registered by default; callers opt in per
/// scanner.
pub fn check_poolindex(max_index: u64) -> Constraint {
    Box::new(move |ctx| {
        ctx.pool_header()
            .field("PoolIndex")
            .as_u64()
            .map(|index| index <= max_index)
            .unwrap_or(false)
    })
}

/// Hive signature at the start of the allocation body.
pub fn check_hive_sig() -> Constraint {
    Box::new(|ctx| {
        let hive = Object::new(
            ctx.profile.clone(),
            ctx.space.clone(),
            "_HHIVE",
            ctx.body(),
        );
        hive.field("Signature").v() == Some(HIVE_SIGNATURE)
    })
}

/// Scanner for `_CMHIVE` pool allocations (registry hives).
pub fn hive_scanner() -> PoolScanner {
    let mut scanner = PoolScanner::new(*b"CM10", 0x4a8);
    scanner.add_constraint("check_blocksize_equal", check_blocksize_equal(0x4a8));
    scanner.add_constraint("check_pagedpooltype", check_pagedpooltype());
    scanner.add_constraint("check_hive_sig", check_hive_sig());
    scanner
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrspace::buffer::BufferAddressSpace;
    use crate::profile;

    /// A valid hive pool allocation at `offset`.
    fn put_hive_pool(bytes: &mut [u8], offset: usize) {
        let ulong1: u32 = ((0x4a8 >> 3) << 16) | (2 << 25);
        bytes[offset..offset + 4].copy_from_slice(&ulong1.to_le_bytes());
        bytes[offset + 4..offset + 8].copy_from_slice(b"CM10");
        bytes[offset + 8..offset + 12].copy_from_slice(&[0xe0, 0xbe, 0xe0, 0xbe]);
    }

    fn space_with(bytes: Vec<u8>) -> Arc<dyn AddressSpace> {
        Arc::new(BufferAddressSpace::new(bytes))
    }

    #[test]
    fn test_hive_scan_finds_valid_header() {
        let mut bytes = vec![0u8; 0x20000];
        put_hive_pool(&mut bytes, 0x12000);
        let profile = profile::by_name("WinXPSP2x86").unwrap();

        let scanner = hive_scanner();
        let hits: Vec<u64> = scanner.scan(space_with(bytes), profile).collect();
        assert_eq!(hits, vec![0x12000]);
    }

    #[test]
    fn test_constraints_short_circuit_in_order() {
        let mut bytes = vec![0u8; 0x20000];
        // Tag present but the block size is wrong.
        put_hive_pool(&mut bytes, 0x8000);
        bytes[0x8002] = 0x01; // BlockSize bits
        // Tag present, size right, but no hive signature.
        put_hive_pool(&mut bytes, 0x10000);
        bytes[0x10008] = 0;
        // Fully valid.
        put_hive_pool(&mut bytes, 0x1a000);
        let profile = profile::by_name("WinXPSP2x86").unwrap();

        let scanner = hive_scanner();
        let hits: Vec<u64> = scanner.scan(space_with(bytes), profile).collect();
        assert_eq!(hits, vec![0x1a000]);
    }

    #[test]
    fn test_tag_across_chunk_boundary() {
        let mut bytes = vec![0u8; 0x11000];
        // Header starts just below the 0x10000 chunk boundary so the tag
        // window spans it.
        put_hive_pool(&mut bytes, 0xfffa);
        let profile = profile::by_name("WinXPSP2x86").unwrap();

        let scanner = hive_scanner();
        let hits: Vec<u64> = scanner.scan(space_with(bytes), profile).collect();
        assert_eq!(hits, vec![0xfffa]);
    }

    #[test]
    fn test_poolindex_constraint_is_optional() {
        let mut bytes = vec![0u8; 0x2000];
        put_hive_pool(&mut bytes, 0x1000);
        // Give the header an index above the cap.
        let ulong1: u32 = ((0x4a8 >> 3) << 16) | (2 << 25) | (0x7f << 9);
        bytes[0x1000..0x1004].copy_from_slice(&ulong1.to_le_bytes());
        let profile = profile::by_name("WinXPSP2x86").unwrap();

        let default = hive_scanner();
        let hits: Vec<u64> = default
            .scan(space_with(bytes.clone()), profile.clone())
            .collect();
        assert_eq!(hits, vec![0x1000]);

        let mut strict = hive_scanner();
        strict.add_constraint("check_poolindex", check_poolindex(4));
        let hits: Vec<u64> = strict.scan(space_with(bytes), profile).collect();
        assert!(hits.is_empty());
    }
}
