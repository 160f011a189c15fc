//! In-memory address space over a plain byte buffer.
//!
//! Not part of the probe registry; used wherever a slice of bytes needs
//! the address-space interface (synthetic spaces in tests, scratch views
//! carved out of larger spaces).

use std::any::Any;
use std::sync::{Arc, Mutex};

use super::AddressSpace;

pub struct BufferAddressSpace {
    data: Mutex<Vec<u8>>,
    base_offset: u64,
}

impl BufferAddressSpace {
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_offset(data, 0)
    }

    /// A buffer whose first byte sits at `base_offset` in its own
    /// addressing scheme.
    pub fn with_offset(data: Vec<u8>, base_offset: u64) -> Self {
        BufferAddressSpace {
            data: Mutex::new(data),
            base_offset,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn copy_clipped(&self, addr: u64, length: usize) -> Vec<u8> {
        let data = self.data.lock().unwrap();
        let Some(start) = addr.checked_sub(self.base_offset) else {
            return Vec::new();
        };
        if start >= data.len() as u64 {
            return Vec::new();
        }
        let end = (start + length as u64).min(data.len() as u64);
        data[start as usize..end as usize].to_vec()
    }
}

impl AddressSpace for BufferAddressSpace {
    fn name(&self) -> &'static str {
        "BufferAddressSpace"
    }

    fn base(&self) -> Option<&Arc<dyn AddressSpace>> {
        None
    }

    fn read(&self, addr: u64, length: usize) -> Option<Vec<u8>> {
        let end = addr.checked_add(length as u64)?;
        if addr < self.base_offset || end > self.base_offset + self.len() {
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
        addr >= self.base_offset && addr < self.base_offset + self.len()
    }

    fn available_ranges(&self) -> Vec<(u64, u64)> {
        vec![(self.base_offset, self.len())]
    }

    fn write(&self, addr: u64, data: &[u8]) -> bool {
        let Some(start) = addr.checked_sub(self.base_offset) else {
            return false;
        };
        let mut buf = self.data.lock().unwrap();
        let Some(end) = start.checked_add(data.len() as u64) else {
            return false;
        };
        if end > buf.len() as u64 {
            return false;
        }
        buf[start as usize..end as usize].copy_from_slice(data);
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
