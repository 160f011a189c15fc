//! Windows XP SP2 x86 profile.

use super::super::vtypes::VTypes;
use super::super::{ArchMode, Profile, ProfileBuilder};

pub const KDBG_HEADER: &[u8] = b"\x00\x00\x00\x00\x00\x00\x00\x00KDBG\x90\x02";

/// Shared base for the x86 generation: container decode types plus the
/// common kernel types, anchored on the XP KDBG header. Later service
/// packs overlay their own magic on top.
pub(crate) fn base_x86_builder() -> ProfileBuilder {
    let mut builder = ProfileBuilder::new();
    let mut types = VTypes::new();
    super::install_container_types(&mut types);
    super::common_x86_types(&mut types);
    builder.merge(types);
    builder.merge(super::volatility_magic(KDBG_HEADER));
    builder.object_class("_MMVAD", "VadNode");
    builder.object_class("_MMVAD_SHORT", "VadNode");
    builder
}

pub fn build() -> Profile {
    base_x86_builder().build("WinXPSP2x86", ArchMode::X86, 4, 0x40)
}
