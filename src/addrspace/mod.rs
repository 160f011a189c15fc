//! The layered address-space stack.
//!
//! An address space translates reads in one addressing scheme into reads
//! against the layer below it. The stack is linear: a raw file mapping at
//! the bottom, optionally a container decode over it, and a paging
//! translation on top. [`load_address_space`] assembles the stack from the
//! image's own contents.

pub mod amd64;
pub mod buffer;
pub mod crash;
pub mod elf_core;
pub mod file;
pub mod hibernate;
pub mod ia32;
pub mod pae;
mod paged;
pub mod runs;
pub mod xpress;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;

use crate::config::Config;
use crate::prelude::*;
use crate::profile::{self, Profile};

pub const PAGE_SIZE: u64 = 0x1000;
pub const PAGE_SHIFT: u64 = 12;

pub trait AddressSpace: Send + Sync {
    /// Short layer name, used in stack listings.
    fn name(&self) -> &'static str;

    /// The layer this one sits on, or `None` for the raw source.
    fn base(&self) -> Option<&Arc<dyn AddressSpace>>;

    /// Read `length` bytes at `addr`. `None` when any part of the range
    /// is unmapped.
    fn read(&self, addr: u64, length: usize) -> Option<Vec<u8>>;

    /// Like [`read`](Self::read), but unmapped bytes come back zeroed.
    /// Always returns exactly `length` bytes.
    fn zread(&self, addr: u64, length: usize) -> Vec<u8>;

    fn is_valid_address(&self, addr: u64) -> bool;

    /// Mapped `(start, length)` ranges in ascending order.
    fn available_ranges(&self) -> Vec<(u64, u64)>;

    /// Virtual-to-physical translation. Only paging layers translate.
    fn vtop(&self, _vaddr: u64) -> Option<u64> {
        None
    }

    /// Write `data` at `addr`. Returns false without write consent or
    /// when the target is unmapped. Paged writes are page-granular and
    /// non-transactional: a failure mid-sequence leaves earlier pages
    /// written.
    fn write(&self, _addr: u64, _data: &[u8]) -> bool {
        false
    }

    /// A DTB carried by the layer itself (hibernation CR3, crash-dump
    /// header), if any.
    fn dtb_hint(&self) -> Option<u64> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn read_u16(&self, addr: u64) -> Option<u16> {
        let b = self.read(addr, 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&self, addr: u64) -> Option<u32> {
        let b = self.read(addr, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        let b = self.read(addr, 8)?;
        Some(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

/// Raised by a layer probe. `NotApplicable` tells the assembler to skip
/// the layer and keep going; `Fatal` aborts assembly.
pub enum ProbeError {
    NotApplicable(String),
    Fatal(Error),
}

impl ProbeError {
    pub fn skip(reason: impl Into<String>) -> Self {
        ProbeError::NotApplicable(reason.into())
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::NotApplicable(reason) => write!(f, "not applicable: {reason}"),
            ProbeError::Fatal(err) => write!(f, "{err}"),
        }
    }
}

impl fmt::Debug for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

/// Probe-side assert: reject the layer without aborting assembly.
pub fn probe_assert(cond: bool, reason: &str) -> ProbeResult<()> {
    if cond {
        Ok(())
    } else {
        Err(ProbeError::skip(reason))
    }
}

/// A registered physical layer. Lower `order` probes earlier in a pass.
pub struct LayerDescriptor {
    pub name: &'static str,
    pub order: u32,
    pub probe: fn(Option<Arc<dyn AddressSpace>>, &Config) -> ProbeResult<Arc<dyn AddressSpace>>,
}

/// A registered paging layer. Probed once profile and DTB are known.
pub struct PagingDescriptor {
    pub name: &'static str,
    pub order: u32,
    pub probe:
        fn(Arc<dyn AddressSpace>, &Config, &Arc<Profile>, u64) -> ProbeResult<Arc<dyn AddressSpace>>,
}

lazy_static! {
    static ref PHYSICAL_LAYERS: Vec<LayerDescriptor> = {
        let mut layers = vec![
            LayerDescriptor {
                name: "QemuCoreDumpElf",
                order: 30,
                probe: elf_core::probe,
            },
            LayerDescriptor {
                name: "WindowsCrashDumpSpace32",
                order: 31,
                probe: crash::probe,
            },
            LayerDescriptor {
                name: "WindowsHiberFileSpace32",
                order: 40,
                probe: hibernate::probe,
            },
            // The address space of last resort.
            LayerDescriptor {
                name: "FileAddressSpace",
                order: 100,
                probe: file::probe,
            },
        ];
        layers.sort_by_key(|layer| layer.order);
        layers
    };
    static ref PAGED_LAYERS: Vec<PagingDescriptor> = {
        let mut layers = vec![
            PagingDescriptor {
                name: "IA32PagedMemoryPae",
                order: 80,
                probe: pae::probe,
            },
            PagingDescriptor {
                name: "IA32PagedMemory",
                order: 90,
                probe: ia32::probe,
            },
            PagingDescriptor {
                name: "AMD64PagedMemory",
                order: 85,
                probe: amd64::probe,
            },
        ];
        layers.sort_by_key(|layer| layer.order);
        layers
    };
}

/// Result of stack assembly: the assembled layers plus everything the
/// image itself told us.
pub struct ImageContext {
    pub config: Config,
    /// Top of the stack, a kernel virtual view.
    pub layers: Arc<dyn AddressSpace>,
    /// Top physical view, below any paging layer.
    pub physical: Arc<dyn AddressSpace>,
    pub profile: Arc<Profile>,
    pub dtb: u64,
    /// Offset of the KDBG header match in the physical view, if found.
    pub kdbg: Option<u64>,
}

impl std::fmt::Debug for ImageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageContext")
            .field("layers", &self.layers.name())
            .field("physical", &self.physical.name())
            .field("profile", &self.profile.name)
            .field("dtb", &self.dtb)
            .field("kdbg", &self.kdbg)
            .finish()
    }
}

/// Assemble the physical half of the stack: the raw source plus any
/// container decode that self-identifies.
pub fn load_physical(config: &Config) -> Result<Arc<dyn AddressSpace>> {
    let mut top: Option<Arc<dyn AddressSpace>> = None;
    let mut applied: Vec<&'static str> = Vec::new();
    loop {
        let mut grew = false;
        for layer in PHYSICAL_LAYERS.iter() {
            // At most one instance of each variant per stack.
            if applied.contains(&layer.name) {
                continue;
            }
            match (layer.probe)(top.clone(), config) {
                Ok(space) => {
                    debug!("Stacked {} (order {})", layer.name, layer.order);
                    applied.push(layer.name);
                    top = Some(space);
                    grew = true;
                    break;
                }
                Err(ProbeError::NotApplicable(reason)) => {
                    trace!("{}: {}", layer.name, reason);
                }
                Err(ProbeError::Fatal(err)) => {
                    return Err(err.context(format!("{} probe failed", layer.name)));
                }
            }
        }
        if !grew {
            break;
        }
    }
    top.ok_or_else(|| anyhow!("no address space could be stacked over {}", config.location))
}

/// Assemble the whole stack and resolve profile and DTB from the image.
///
/// Fails with a configuration error when no profile matches or no paging
/// layer can be built; plugins never see a partially assembled stack.
pub fn load_address_space(config: &Config) -> Result<ImageContext> {
    let physical = load_physical(config)?;
    let (profile, kdbg) = discover_profile(&physical, config)?;
    let dtb = discover_dtb(&physical, config, &profile, kdbg)?;
    debug!("Using DTB {dtb:#x}");

    let mut top: Option<Arc<dyn AddressSpace>> = None;
    for layer in PAGED_LAYERS.iter() {
        match (layer.probe)(physical.clone(), config, &profile, dtb) {
            Ok(space) => {
                debug!("Stacked {} (order {})", layer.name, layer.order);
                top = Some(space);
                break;
            }
            Err(ProbeError::NotApplicable(reason)) => {
                trace!("{}: {}", layer.name, reason);
            }
            Err(ProbeError::Fatal(err)) => {
                return Err(err.context(format!("{} probe failed", layer.name)));
            }
        }
    }
    let layers = top.ok_or_else(|| {
        anyhow!(
            "no paging layer could be built for profile {}",
            profile.name
        )
    })?;
    info!("Assembled stack: {}", describe_stack(&layers));

    Ok(ImageContext {
        config: config.clone(),
        layers,
        physical,
        profile,
        dtb,
        kdbg,
    })
}

/// Pick the profile whose magic byte pattern is found in the image, in
/// registration order. An explicit override skips the scan but keeps the
/// KDBG anchor lookup.
pub(crate) fn discover_profile(
    physical: &Arc<dyn AddressSpace>,
    config: &Config,
) -> Result<(Arc<Profile>, Option<u64>)> {
    if let Some(name) = &config.profile {
        let profile =
            profile::by_name(name).ok_or_else(|| anyhow!("unknown profile {name}"))?;
        let kdbg = profile
            .kdbg_header()
            .and_then(|magic| scan_bytes(physical, magic));
        return Ok((profile, kdbg));
    }
    for profile in profile::registered() {
        let Some(magic) = profile.kdbg_header() else {
            continue;
        };
        if let Some(hit) = scan_bytes(physical, magic) {
            info!("Profile {} selected (magic at {:#x})", profile.name, hit);
            return Ok((profile.clone(), Some(hit)));
        }
    }
    bail!("no registered profile matches the image; use --profile to override")
}

/// DTB discovery order: explicit override, a DTB carried by a container
/// layer, then the profile-specified offset from the KDBG anchor.
fn discover_dtb(
    physical: &Arc<dyn AddressSpace>,
    config: &Config,
    profile: &Arc<Profile>,
    kdbg: Option<u64>,
) -> Result<u64> {
    if let Some(dtb) = config.dtb {
        return Ok(dtb);
    }
    let mut cursor = Some(physical);
    while let Some(space) = cursor {
        if let Some(dtb) = space.dtb_hint() {
            debug!("DTB {:#x} carried by {}", dtb, space.name());
            return Ok(dtb);
        }
        cursor = space.base();
    }
    if let Some(kdbg) = kdbg {
        let at = kdbg + profile.kdbg_dtb_offset;
        let dtb = match profile.pointer_width {
            8 => physical.read_u64(at),
            _ => physical.read_u32(at).map(u64::from),
        };
        if let Some(dtb) = dtb.filter(|dtb| *dtb != 0) {
            return Ok(dtb);
        }
    }
    bail!("no DTB could be discovered; use --dtb to provide one")
}

/// First occurrence of `needle` in the space's available ranges.
pub(crate) fn scan_bytes(space: &Arc<dyn AddressSpace>, needle: &[u8]) -> Option<u64> {
    const CHUNK: u64 = 0x10000;
    if needle.is_empty() {
        return None;
    }
    for (start, length) in space.available_ranges() {
        let end = start + length;
        let mut offset = start;
        while offset < end {
            let span = CHUNK.min(end - offset);
            // Overlap by needle length so boundary matches are not lost.
            let buf = space.zread(offset, span as usize + needle.len() - 1);
            if let Some(pos) = buf
                .windows(needle.len())
                .position(|window| window == needle)
                .filter(|pos| (*pos as u64) < span)
            {
                return Some(offset + pos as u64);
            }
            offset += CHUNK;
        }
    }
    None
}

/// Layer names from leaf to top, joined with arrows.
pub fn describe_stack(top: &Arc<dyn AddressSpace>) -> String {
    let mut names = Vec::new();
    let mut cursor = Some(top);
    while let Some(space) = cursor {
        names.push(space.name());
        cursor = space.base();
    }
    names.reverse();
    names.join(" -> ")
}
