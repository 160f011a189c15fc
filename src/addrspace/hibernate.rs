//! Windows hibernation-file container.
//!
//! The file stores RAM as chains of memory-range tables, each followed
//! by Xpress image sets holding up to 16 compressed pages. Decoding a
//! page means locating its image set, decompressing the set, and
//! slicing the page out.

use std::any::Any;
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use super::xpress;
use super::{AddressSpace, PAGE_SHIFT, PAGE_SIZE, ProbeError, ProbeResult, paged, probe_assert};
use crate::config::Config;
use crate::object::Object;
use crate::prelude::*;
use crate::profile;

const XPRESS_SIGNATURE: &[u8] = b"\x81\x81xpress";
const XPRESS_HEADER_SIZE: u64 = 0x20;
/// Pages per image set.
const XPRESS_SET_PAGES: u64 = 0x10;
/// Range tables form a linked list; more than this is a loop.
const MAX_TABLES: usize = 0x10000;

/// Where one page of RAM lives: an image set plus an index into it.
#[derive(Clone, Copy)]
struct PageLocation {
    set_offset: u64,
    index: u16,
}

pub struct WindowsHiberFileSpace32 {
    base: Arc<dyn AddressSpace>,
    page_map: BTreeMap<u64, PageLocation>,
    /// One decoded image set, keyed by its file offset.
    set_cache: Mutex<Option<(u64, Arc<Vec<u8>>)>>,
    cr3: u64,
}

pub(super) fn probe(
    base: Option<Arc<dyn AddressSpace>>,
    _config: &Config,
) -> ProbeResult<Arc<dyn AddressSpace>> {
    let base = base.ok_or_else(|| ProbeError::skip("no base address space"))?;
    let signature = base.read(0, 4).unwrap_or_default();
    probe_assert(
        signature == b"hibr" || signature == b"HIBR",
        "hibernation signature invalid",
    )?;

    let profile = profile::containers();
    let header = Object::new(profile.clone(), base.clone(), "IMAGE_HIBER_HEADER", 0);
    let first_table = header
        .field("FirstTablePage")
        .as_u64()
        .ok_or_else(|| ProbeError::skip("unreadable hibernation header"))?;
    probe_assert(first_table != 0, "hibernation file has no memory tables")?;

    let mut page_map = BTreeMap::new();
    let mut table_page = first_table;
    let mut tables = 0usize;
    while table_page != 0 && tables < MAX_TABLES {
        tables += 1;
        let table_offset = table_page << PAGE_SHIFT;
        let table = Object::new(
            profile.clone(),
            base.clone(),
            "_PO_MEMORY_RANGE_ARRAY",
            table_offset,
        );
        let link = table.field("MemArrayLink");

        // The flattened page list this table describes, in file order.
        let mut pending: Vec<u64> = Vec::new();
        for range in table.field("RangeTable").iter() {
            let (Some(start), Some(end)) = (
                range.field("StartPage").as_u64(),
                range.field("EndPage").as_u64(),
            ) else {
                break;
            };
            // EndPage is exclusive.
            for page in start..end {
                pending.push(page);
            }
        }

        // Image sets for those pages follow the table page.
        let mut set_offset = (table_page + 1) << PAGE_SHIFT;
        let mut taken = 0usize;
        while taken < pending.len() {
            let Some((compressed, pages)) = read_set_header(&base, set_offset) else {
                warn!(
                    "Corrupt image set at {:#x}; {} pages dropped",
                    set_offset,
                    pending.len() - taken
                );
                break;
            };
            for index in 0..pages {
                if taken >= pending.len() {
                    break;
                }
                page_map.insert(
                    pending[taken],
                    PageLocation {
                        set_offset,
                        index: index as u16,
                    },
                );
                taken += 1;
            }
            // Sets are 8-byte aligned.
            set_offset = (set_offset + XPRESS_HEADER_SIZE + compressed + 7) & !7;
        }

        table_page = link.field("NextTable").as_u64().unwrap_or(0);
    }
    probe_assert(!page_map.is_empty(), "hibernation file maps no pages")?;

    let proc_state = Object::new(
        profile,
        base.clone(),
        "_KPROCESSOR_STATE",
        PAGE_SIZE,
    );
    let cr3 = proc_state
        .field("SpecialRegisters")
        .field("Cr3")
        .as_u64()
        .unwrap_or(0);

    debug!(
        "Hibernation file with {} pages across {} tables, CR3 {:#x}",
        page_map.len(),
        tables,
        cr3
    );
    Ok(Arc::new(WindowsHiberFileSpace32 {
        base,
        page_map,
        set_cache: Mutex::new(None),
        cr3,
    }))
}

/// `(compressed size, page count)` of the image set at `offset`.
fn read_set_header(base: &Arc<dyn AddressSpace>, offset: u64) -> Option<(u64, u64)> {
    let header = base.read(offset, XPRESS_HEADER_SIZE as usize)?;
    if &header[..XPRESS_SIGNATURE.len()] != XPRESS_SIGNATURE {
        return None;
    }
    let info = u32::from_le_bytes(header[8..12].try_into().unwrap());
    let pages = u64::from(info & 0xf) + 1;
    let compressed = (u64::from(info) >> 10) + 1;
    if pages > XPRESS_SET_PAGES || compressed > pages << PAGE_SHIFT {
        return None;
    }
    Some((compressed, pages))
}

impl WindowsHiberFileSpace32 {
    /// The hibernation header, read through the object engine.
    pub fn get_header(&self) -> Object {
        Object::new(
            profile::containers(),
            self.base.clone(),
            "IMAGE_HIBER_HEADER",
            0,
        )
    }

    /// The saved processor state that follows the header page.
    pub fn proc_state(&self) -> Object {
        Object::new(
            profile::containers(),
            self.base.clone(),
            "_KPROCESSOR_STATE",
            PAGE_SIZE,
        )
    }

    /// Pages a raw conversion writes: everything up to the highest
    /// mapped page, missing pages zero-filled.
    pub fn get_number_of_pages(&self) -> u64 {
        self.page_map
            .last_key_value()
            .map(|(page, _)| page + 1)
            .unwrap_or(0)
    }

    fn decode_set(&self, location: PageLocation) -> Option<Arc<Vec<u8>>> {
        if let Some((offset, data)) = &*self.set_cache.lock().unwrap() {
            if *offset == location.set_offset {
                return Some(data.clone());
            }
        }
        let (compressed, pages) = read_set_header(&self.base, location.set_offset)?;
        let raw = self
            .base
            .read(location.set_offset + XPRESS_HEADER_SIZE, compressed as usize)?;
        let expected = (pages << PAGE_SHIFT) as usize;
        // A set whose payload already spans its pages is stored raw.
        let data = if compressed as usize == expected {
            Arc::new(raw)
        } else {
            Arc::new(xpress::decode(&raw, expected))
        };
        *self.set_cache.lock().unwrap() = Some((location.set_offset, data.clone()));
        Some(data)
    }

    fn read_page_chunk(&self, addr: u64, length: usize) -> Option<Vec<u8>> {
        let location = *self.page_map.get(&(addr >> PAGE_SHIFT))?;
        let data = self.decode_set(location)?;
        let start = (u64::from(location.index) << PAGE_SHIFT) + (addr & (PAGE_SIZE - 1));
        let end = start + length as u64;
        if end > data.len() as u64 {
            return None;
        }
        Some(data[start as usize..end as usize].to_vec())
    }

    /// Stream the decompressed image into `sink`, yielding each page
    /// index as it is written. Cooperative iteration, not suspension:
    /// dropping the iterator stops the conversion.
    pub fn convert_to_raw<'a>(&'a self, sink: &'a mut dyn io::Write) -> RawConversion<'a> {
        RawConversion {
            space: self,
            sink,
            next_page: 0,
            total: self.get_number_of_pages(),
        }
    }
}

pub struct RawConversion<'a> {
    space: &'a WindowsHiberFileSpace32,
    sink: &'a mut dyn io::Write,
    next_page: u64,
    total: u64,
}

impl Iterator for RawConversion<'_> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Result<u64>> {
        if self.next_page >= self.total {
            return None;
        }
        let page = self.next_page;
        self.next_page += 1;
        let buf = self.space.zread(page << PAGE_SHIFT, PAGE_SIZE as usize);
        match self.sink.write_all(&buf) {
            Ok(()) => Some(Ok(page)),
            Err(err) => {
                self.next_page = self.total;
                Some(Err(err.into()))
            }
        }
    }
}

impl AddressSpace for WindowsHiberFileSpace32 {
    fn name(&self) -> &'static str {
        "WindowsHiberFileSpace32"
    }

    fn base(&self) -> Option<&Arc<dyn AddressSpace>> {
        Some(&self.base)
    }

    fn read(&self, addr: u64, length: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(length);
        let mut addr = addr;
        let mut remaining = length as u64;
        while remaining > 0 {
            let chunk = (PAGE_SIZE - (addr % PAGE_SIZE)).min(remaining);
            out.extend_from_slice(&self.read_page_chunk(addr, chunk as usize)?);
            addr += chunk;
            remaining -= chunk;
        }
        Some(out)
    }

    fn zread(&self, addr: u64, length: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(length);
        let mut addr = addr;
        let mut remaining = length as u64;
        while remaining > 0 {
            let chunk = (PAGE_SIZE - (addr % PAGE_SIZE)).min(remaining);
            match self.read_page_chunk(addr, chunk as usize) {
                Some(bytes) => out.extend_from_slice(&bytes),
                None => out.resize(out.len() + chunk as usize, 0),
            }
            addr += chunk;
            remaining -= chunk;
        }
        out
    }

    fn is_valid_address(&self, addr: u64) -> bool {
        self.page_map.contains_key(&(addr >> PAGE_SHIFT))
    }

    fn available_ranges(&self) -> Vec<(u64, u64)> {
        paged::coalesce(
            self.page_map
                .keys()
                .map(|page| (page << PAGE_SHIFT, PAGE_SIZE)),
        )
    }

    fn dtb_hint(&self) -> Option<u64> {
        let dtb = self.cr3 & !(PAGE_SIZE - 1);
        (dtb != 0).then_some(dtb)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrspace::buffer::BufferAddressSpace;

    /// One Xpress stream producing a page of `a` followed by a page of
    /// `b`: literal, 4095-byte run, literal, 4095-byte run. The two long
    /// matches share one length-nibble byte.
    fn compressed_pages_of(a: u8, b: u8) -> Vec<u8> {
        vec![
            0x00, 0x00, 0x00, 0x50, // indicator: lit, match, lit, match
            a, 0x07, 0x00, 0xff, 0xff, 0xfc, 0x0f, // page of `a`
            b, 0x07, 0x00, 0xff, 0xfc, 0x0f, // page of `b`
        ]
    }

    fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
        bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Hibernation image mapping physical pages 2 and 3 (stored
    /// compressed in one set) and page 8 (stored raw in a second set).
    fn hiber_image() -> Vec<u8> {
        let mut bytes = vec![0u8; 0x9000];
        bytes[..4].copy_from_slice(b"hibr");
        put_u32(&mut bytes, 0x58, 4); // FirstTablePage
        // CR3 in the processor state page.
        put_u32(&mut bytes, 0x1000 + 0x2cc + 8, 0x39063);

        // Range table at page 4: [2, 4) then [8, 9).
        let table = 0x4000;
        put_u32(&mut bytes, table + 4, 0); // NextTable: end of chain
        put_u32(&mut bytes, table + 0xc, 2); // EntryCount
        put_u32(&mut bytes, table + 0x10 + 4, 2); // StartPage
        put_u32(&mut bytes, table + 0x10 + 8, 4); // EndPage
        put_u32(&mut bytes, table + 0x20 + 4, 8);
        put_u32(&mut bytes, table + 0x20 + 8, 9);

        // Set 1 at page 5: two compressed pages (0x11 then 0x22).
        let set1 = 0x5000;
        bytes[set1..set1 + 8].copy_from_slice(XPRESS_SIGNATURE);
        let payload = compressed_pages_of(0x11, 0x22);
        let info1 = ((payload.len() as u32 - 1) << 10) | (2 - 1);
        put_u32(&mut bytes, set1 + 8, info1);
        bytes[set1 + 0x20..set1 + 0x20 + payload.len()].copy_from_slice(&payload);

        // Set 2, 8-byte aligned after set 1: one raw page of 0x33.
        let set2 = (set1 + 0x20 + payload.len() + 7) & !7;
        bytes[set2..set2 + 8].copy_from_slice(XPRESS_SIGNATURE);
        let info2 = ((0x1000u32 - 1) << 10) | (1 - 1);
        put_u32(&mut bytes, set2 + 8, info2);
        for byte in bytes.iter_mut().skip(set2 + 0x20).take(0x1000) {
            *byte = 0x33;
        }
        bytes
    }

    fn probe_over(bytes: Vec<u8>) -> Arc<dyn AddressSpace> {
        let base: Arc<dyn AddressSpace> = Arc::new(BufferAddressSpace::new(bytes));
        let config = crate::config::Config::test(std::path::Path::new("/dev/null"));
        probe(Some(base), &config).unwrap()
    }

    #[test]
    fn test_probe_maps_pages_and_cr3() {
        let space = probe_over(hiber_image());
        let hiber = space
            .as_any()
            .downcast_ref::<WindowsHiberFileSpace32>()
            .unwrap();
        assert_eq!(space.dtb_hint(), Some(0x39000));
        assert_eq!(hiber.get_number_of_pages(), 9);
        assert_eq!(
            space.available_ranges(),
            vec![(0x2000, 0x2000), (0x8000, 0x1000)]
        );
        assert_eq!(hiber.get_header().field("Signature").repr(), "hibr");
    }

    #[test]
    fn test_reads_decompress_pages() {
        let space = probe_over(hiber_image());
        assert_eq!(space.read(0x2000, 4).unwrap(), vec![0x11; 4]);
        assert_eq!(space.read(0x3ffe, 2).unwrap(), vec![0x22; 2]);
        assert_eq!(space.read(0x8abc, 4).unwrap(), vec![0x33; 4]);
        assert_eq!(space.read(0x4000, 1), None);
        // Crossing from a mapped into an unmapped page.
        assert_eq!(space.read(0x3ff8, 0x10), None);
        let buf = space.zread(0x3ff8, 0x10);
        assert_eq!(&buf[..8], &[0x22; 8]);
        assert_eq!(&buf[8..], &[0u8; 8]);
    }

    #[test]
    fn test_convert_to_raw_streams_progress() {
        let space = probe_over(hiber_image());
        let hiber = space
            .as_any()
            .downcast_ref::<WindowsHiberFileSpace32>()
            .unwrap();
        let mut sink = Vec::new();
        let pages: Vec<u64> = hiber
            .convert_to_raw(&mut sink)
            .map(|page| page.unwrap())
            .collect();
        assert_eq!(pages, (0..9).collect::<Vec<u64>>());
        assert_eq!(sink.len(), 9 * 0x1000);
        assert!(sink[..0x2000].iter().all(|b| *b == 0));
        assert!(sink[0x2000..0x3000].iter().all(|b| *b == 0x11));
        assert!(sink[0x3000..0x4000].iter().all(|b| *b == 0x22));
        assert!(sink[0x4000..0x8000].iter().all(|b| *b == 0));
        assert!(sink[0x8000..].iter().all(|b| *b == 0x33));
    }
}
