//! Run tables shared by the container layers.

use std::sync::Arc;

use itertools::Itertools;

use super::AddressSpace;
use crate::prelude::*;

/// `length` bytes of physical memory live at `file_offset` in the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub phys: u64,
    pub file_offset: u64,
    pub length: u64,
}

/// Sorted, non-overlapping run list with every byte backed by the base.
pub struct RunTable {
    runs: Vec<Run>,
}

impl RunTable {
    pub fn new(runs: Vec<Run>, base: &Arc<dyn AddressSpace>) -> Result<Self> {
        let runs: Vec<Run> = runs
            .into_iter()
            .filter(|run| run.length > 0)
            .sorted_by_key(|run| run.phys)
            .collect();
        for pair in runs.windows(2) {
            if pair[0].phys + pair[0].length > pair[1].phys {
                bail!(
                    "overlapping runs at {:#x} and {:#x}",
                    pair[0].phys,
                    pair[1].phys
                );
            }
        }
        for run in &runs {
            let last = run.file_offset + run.length - 1;
            if !base.is_valid_address(last) {
                bail!(
                    "run at {:#x} extends past the end of the base image",
                    run.phys
                );
            }
        }
        Ok(RunTable { runs })
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    fn locate(&self, paddr: u64) -> Option<&Run> {
        let idx = self.runs.partition_point(|run| run.phys <= paddr);
        if idx == 0 {
            return None;
        }
        let run = &self.runs[idx - 1];
        (paddr < run.phys + run.length).then_some(run)
    }

    /// Translate a physical address into `(base offset, bytes left in
    /// the run)`.
    pub fn translate(&self, paddr: u64) -> Option<(u64, u64)> {
        let run = self.locate(paddr)?;
        let delta = paddr - run.phys;
        Some((run.file_offset + delta, run.length - delta))
    }

    pub fn is_valid(&self, paddr: u64) -> bool {
        self.locate(paddr).is_some()
    }

    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.runs.iter().map(|run| (run.phys, run.length)).collect()
    }

    /// Read across run boundaries; any gap fails the whole read.
    pub fn read(&self, base: &Arc<dyn AddressSpace>, addr: u64, length: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(length);
        let mut addr = addr;
        let mut remaining = length as u64;
        while remaining > 0 {
            let (offset, available) = self.translate(addr)?;
            let step = remaining.min(available);
            out.extend_from_slice(&base.read(offset, step as usize)?);
            addr += step;
            remaining -= step;
        }
        Some(out)
    }

    /// Read across run boundaries, zero-filling gaps.
    pub fn zread(&self, base: &Arc<dyn AddressSpace>, addr: u64, length: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(length);
        let mut addr = addr;
        let mut remaining = length as u64;
        while remaining > 0 {
            let step = match self.translate(addr) {
                Some((offset, available)) => {
                    let step = remaining.min(available);
                    out.extend_from_slice(&base.zread(offset, step as usize));
                    step
                }
                None => {
                    // Zero-fill up to the next run, or the end of the
                    // request when none follows.
                    let next = self
                        .runs
                        .iter()
                        .map(|run| run.phys)
                        .find(|phys| *phys > addr);
                    let gap = next.map(|phys| phys - addr).unwrap_or(remaining);
                    let step = gap.min(remaining);
                    out.resize(out.len() + step as usize, 0);
                    step
                }
            };
            addr += step;
            remaining -= step;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrspace::buffer::BufferAddressSpace;

    fn base_with(bytes: Vec<u8>) -> Arc<dyn AddressSpace> {
        Arc::new(BufferAddressSpace::new(bytes))
    }

    fn table(base: &Arc<dyn AddressSpace>) -> RunTable {
        // Two runs with a one-page gap between them.
        RunTable::new(
            vec![
                Run {
                    phys: 0x2000,
                    file_offset: 0x10,
                    length: 0x10,
                },
                Run {
                    phys: 0x1000,
                    file_offset: 0,
                    length: 0x10,
                },
            ],
            base,
        )
        .unwrap()
    }

    #[test]
    fn test_translate_sorts_and_binary_searches() {
        let base = base_with((0..0x20).collect());
        let runs = table(&base);

        assert_eq!(runs.translate(0x1000), Some((0, 0x10)));
        assert_eq!(runs.translate(0x1008), Some((8, 8)));
        assert_eq!(runs.translate(0x2004), Some((0x14, 0xc)));
        assert_eq!(runs.translate(0x0fff), None);
        assert_eq!(runs.translate(0x1010), None);
        assert_eq!(runs.ranges(), vec![(0x1000, 0x10), (0x2000, 0x10)]);
    }

    #[test]
    fn test_read_fails_on_gaps_and_zread_fills_them() {
        let base = base_with((0..0x20).collect());
        let runs = table(&base);

        assert_eq!(runs.read(&base, 0x1000, 0x10).unwrap(), (0..0x10).collect::<Vec<u8>>());
        assert_eq!(runs.read(&base, 0x100e, 4), None);

        let buf = runs.zread(&base, 0x100e, 0xff4);
        assert_eq!(&buf[..2], &[0x0e, 0x0f]);
        assert!(buf[2..0xff2].iter().all(|b| *b == 0));
        assert_eq!(&buf[0xff2..], &[0x10, 0x11]);
    }

    #[test]
    fn test_rejects_overlap_and_truncated_backing() {
        let base = base_with(vec![0; 0x20]);
        let overlapping = vec![
            Run {
                phys: 0,
                file_offset: 0,
                length: 0x10,
            },
            Run {
                phys: 8,
                file_offset: 0x10,
                length: 8,
            },
        ];
        assert!(RunTable::new(overlapping, &base).is_err());

        let truncated = vec![Run {
            phys: 0,
            file_offset: 0x18,
            length: 0x10,
        }];
        assert!(RunTable::new(truncated, &base).is_err());
    }
}
