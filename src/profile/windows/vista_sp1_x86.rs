//! Windows Vista SP1 x86 profile.
//!
//! Same generation as the XP base; the overlay replaces the KDBG header
//! bytes with the SP1 variant.

use super::super::{ArchMode, Profile};
use super::winxp_sp2_x86::base_x86_builder;

pub const KDBG_HEADER: &[u8] = b"\x00\x00\x00\x00\x00\x00\x00\x00KDBG\x30\x03";

pub fn build() -> Profile {
    let mut builder = base_x86_builder();
    builder.merge(super::volatility_magic(KDBG_HEADER));
    builder.build("VistaSP1x86", ArchMode::X86Pae, 4, 0x40)
}
