//! The raw byte source at the bottom of every stack.

use std::any::Any;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use memmap2::{Mmap, MmapMut};

use super::{AddressSpace, ProbeError, ProbeResult, probe_assert};
use crate::config::Config;
use crate::prelude::*;

enum Backing {
    ReadOnly(Mmap),
    Writable(Mutex<MmapMut>),
}

/// Direct file view. Must sit at the bottom of the stack.
pub struct FileAddressSpace {
    path: PathBuf,
    backing: Backing,
    size: u64,
    write_enabled: bool,
}

pub(super) fn probe(
    base: Option<Arc<dyn AddressSpace>>,
    config: &Config,
) -> ProbeResult<Arc<dyn AddressSpace>> {
    probe_assert(base.is_none(), "must be first address space")?;
    let space = FileAddressSpace::open(config).map_err(ProbeError::Fatal)?;
    Ok(Arc::new(space))
}

impl FileAddressSpace {
    pub fn open(config: &Config) -> Result<Self> {
        let path = config.path()?;
        let file = OpenOptions::new()
            .read(true)
            .write(config.write)
            .open(&path)
            .with_context(|| format!("cannot open image {}", path.display()))?;
        let size = file.metadata()?.len();
        // Safety: the image is treated as immutable for the lifetime of
        // the analysis; nothing else in this process touches the file.
        let backing = if config.write {
            Backing::Writable(Mutex::new(unsafe { MmapMut::map_mut(&file)? }))
        } else {
            Backing::ReadOnly(unsafe { Mmap::map(&file)? })
        };
        Ok(FileAddressSpace {
            path,
            backing,
            size,
            write_enabled: config.write,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copy of the in-bounds prefix of the requested range.
    fn copy_clipped(&self, addr: u64, length: usize) -> Vec<u8> {
        if addr >= self.size {
            return Vec::new();
        }
        let end = (addr + length as u64).min(self.size);
        let (start, end) = (addr as usize, end as usize);
        match &self.backing {
            Backing::ReadOnly(map) => map[start..end].to_vec(),
            Backing::Writable(map) => map.lock().unwrap()[start..end].to_vec(),
        }
    }
}

impl AddressSpace for FileAddressSpace {
    fn name(&self) -> &'static str {
        "FileAddressSpace"
    }

    fn base(&self) -> Option<&Arc<dyn AddressSpace>> {
        None
    }

    fn read(&self, addr: u64, length: usize) -> Option<Vec<u8>> {
        let end = addr.checked_add(length as u64)?;
        if end > self.size {
            return None;
        }
        Some(self.copy_clipped(addr, length))
    }

    fn zread(&self, addr: u64, length: usize) -> Vec<u8> {
        let mut out = self.copy_clipped(addr, length);
        out.resize(length, 0);
        out
    }

    fn is_valid_address(&self, addr: u64) -> bool {
        addr < self.size
    }

    fn available_ranges(&self) -> Vec<(u64, u64)> {
        vec![(0, self.size)]
    }

    fn write(&self, addr: u64, data: &[u8]) -> bool {
        if !self.write_enabled {
            return false;
        }
        let Some(end) = addr.checked_add(data.len() as u64) else {
            return false;
        };
        if end > self.size {
            return false;
        }
        match &self.backing {
            Backing::ReadOnly(_) => false,
            Backing::Writable(map) => {
                map.lock().unwrap()[addr as usize..end as usize].copy_from_slice(data);
                true
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn image_with(bytes: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.raw");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn test_reads_and_bounds() {
        let (_dir, path) = image_with(&[0xAA; 4096]);
        let space = FileAddressSpace::open(&Config::test(&path)).unwrap();

        assert_eq!(space.read(0, 4096).unwrap(), vec![0xAA; 4096]);
        assert_eq!(space.read(4096, 1), None);
        assert!(space.is_valid_address(4095));
        assert!(!space.is_valid_address(4096));
        assert_eq!(space.available_ranges(), vec![(0, 4096)]);
    }

    #[test]
    fn test_zread_pads_past_the_end() {
        let (_dir, path) = image_with(&[0x11; 16]);
        let space = FileAddressSpace::open(&Config::test(&path)).unwrap();

        let buf = space.zread(8, 16);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..8], &[0x11; 8]);
        assert_eq!(&buf[8..], &[0u8; 8]);
    }

    #[test]
    fn test_write_requires_consent() {
        let (_dir, path) = image_with(&[0u8; 64]);
        let space = FileAddressSpace::open(&Config::test(&path)).unwrap();
        assert!(!space.write(0, &[1, 2, 3]));

        let mut config = Config::test(&path);
        config.write = true;
        let space = FileAddressSpace::open(&config).unwrap();
        assert!(space.write(4, &[1, 2, 3]));
        assert_eq!(space.read(4, 3).unwrap(), vec![1, 2, 3]);
        assert!(!space.write(62, &[1, 2, 3]));
    }
}
