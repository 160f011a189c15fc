//! Windows 7 SP1 x64 profile.

use super::super::vtypes::VTypes;
use super::super::{ArchMode, Profile, ProfileBuilder};

pub const KDBG_HEADER: &[u8] = b"\x00\xf8\xff\xffKDBG\x40\x03";

pub fn build() -> Profile {
    let mut builder = ProfileBuilder::new();
    let mut types = VTypes::new();
    super::install_container_types(&mut types);
    super::common_x64_types(&mut types);
    builder.merge(types);
    builder.merge(super::volatility_magic(KDBG_HEADER));
    builder.build("Win7SP1x64", ArchMode::Amd64, 8, 0x58)
}
