//! Windows kernel structure layouts shared across the shipped profiles.
//!
//! Container types (crash dump, hibernation) merge into every profile
//! and into the pre-discovery container set, the way each generation's
//! vtypes are built up from shared maps plus overlays.

pub mod vad;
pub mod vista_sp1_x86;
pub mod win7_sp1_x64;
pub mod winxp_sp2_x86;

use super::vtypes::{TypeDescriptor as T, VTypes, structure};
use crate::object::Object;

/// Types needed to decode container formats before an OS profile has
/// been selected.
pub fn install_container_types(vtypes: &mut VTypes) {
    crash_types(vtypes);
    hibernate_types(vtypes);
}

fn descriptor_run_count(parent: &Object) -> Option<usize> {
    parent.field("NumberOfRuns").as_u64().map(|v| v as usize)
}

pub(crate) fn crash_types(vtypes: &mut VTypes) {
    vtypes.insert(
        "_DMP_HEADER",
        structure(
            0x1000,
            vec![
                ("Signature", 0, T::string(4)),
                ("ValidDump", 4, T::string(4)),
                ("MajorVersion", 8, T::unsigned(4)),
                ("MinorVersion", 0xc, T::unsigned(4)),
                ("DirectoryTableBase", 0x10, T::unsigned(4)),
                ("PfnDataBase", 0x14, T::unsigned(4)),
                ("PsLoadedModuleList", 0x18, T::unsigned(4)),
                ("PsActiveProcessHead", 0x1c, T::unsigned(4)),
                ("MachineImageType", 0x20, T::unsigned(4)),
                ("NumberProcessors", 0x24, T::unsigned(4)),
                ("BugCheckCode", 0x28, T::unsigned(4)),
                (
                    "PhysicalMemoryBlock",
                    0x64,
                    T::named("_PHYSICAL_MEMORY_DESCRIPTOR"),
                ),
            ],
        ),
    );
    vtypes.insert(
        "_PHYSICAL_MEMORY_DESCRIPTOR",
        structure(
            8,
            vec![
                ("NumberOfRuns", 0, T::unsigned(4)),
                ("NumberOfPages", 4, T::unsigned(4)),
                (
                    "Run",
                    8,
                    T::array_fn(T::named("_PHYSICAL_MEMORY_RUN"), descriptor_run_count),
                ),
            ],
        ),
    );
    vtypes.insert(
        "_PHYSICAL_MEMORY_RUN",
        structure(
            8,
            vec![
                ("BasePage", 0, T::unsigned(4)),
                ("PageCount", 4, T::unsigned(4)),
            ],
        ),
    );
}

fn range_entry_count(parent: &Object) -> Option<usize> {
    parent
        .field("MemArrayLink")
        .field("EntryCount")
        .as_u64()
        .map(|v| v as usize)
}

pub(crate) fn hibernate_types(vtypes: &mut VTypes) {
    vtypes.insert(
        "IMAGE_HIBER_HEADER",
        structure(
            0xa0,
            vec![
                ("Signature", 0, T::string(4)),
                ("Version", 4, T::unsigned(4)),
                ("CheckSum", 8, T::unsigned(4)),
                ("LengthSelf", 0xc, T::unsigned(4)),
                ("PageSelf", 0x10, T::unsigned(4)),
                ("PageSize", 0x14, T::unsigned(4)),
                ("ImageType", 0x18, T::unsigned(4)),
                ("SystemTime", 0x20, T::unsigned(8)),
                ("InterruptTime", 0x28, T::unsigned(8)),
                ("FeatureFlags", 0x30, T::unsigned(4)),
                ("HiberFlags", 0x34, T::unsigned(1)),
                ("NoHiberPtes", 0x38, T::unsigned(4)),
                ("HiberVa", 0x3c, T::unsigned(4)),
                ("HiberPte", 0x40, T::unsigned(8)),
                ("NoFreePages", 0x48, T::unsigned(4)),
                ("FreeMapCheck", 0x4c, T::unsigned(4)),
                ("WakeCheck", 0x50, T::unsigned(4)),
                ("TotalPages", 0x54, T::unsigned(4)),
                ("FirstTablePage", 0x58, T::unsigned(4)),
                ("LastFilePage", 0x5c, T::unsigned(4)),
            ],
        ),
    );
    vtypes.insert(
        "_PO_MEMORY_RANGE_ARRAY",
        structure(
            0x20,
            vec![
                ("MemArrayLink", 0, T::named("_PO_MEMORY_RANGE_ARRAY_LINK")),
                (
                    "RangeTable",
                    0x10,
                    T::array_fn(T::named("_PO_MEMORY_RANGE_ARRAY_RANGE"), range_entry_count),
                ),
            ],
        ),
    );
    vtypes.insert(
        "_PO_MEMORY_RANGE_ARRAY_LINK",
        structure(
            0x10,
            vec![
                ("NextTable", 4, T::unsigned(4)),
                ("EntryCount", 0xc, T::unsigned(4)),
            ],
        ),
    );
    vtypes.insert(
        "_PO_MEMORY_RANGE_ARRAY_RANGE",
        structure(
            0x10,
            vec![
                ("StartPage", 4, T::unsigned(4)),
                ("EndPage", 8, T::unsigned(4)),
            ],
        ),
    );
    vtypes.insert(
        "_IMAGE_XPRESS_HEADER",
        structure(
            0x20,
            vec![("Signature", 0, T::string(8)), ("Info", 8, T::unsigned(4))],
        ),
    );
    vtypes.insert(
        "_KPROCESSOR_STATE",
        structure(
            0x320,
            vec![
                ("ContextFrame", 0, T::named("_CONTEXT")),
                ("SpecialRegisters", 0x2cc, T::named("_KSPECIAL_REGISTERS")),
            ],
        ),
    );
    vtypes.insert(
        "_CONTEXT",
        structure(
            0x2cc,
            vec![
                ("Eip", 0xb8, T::unsigned(4)),
                ("Esp", 0xc4, T::unsigned(4)),
            ],
        ),
    );
    vtypes.insert(
        "_KSPECIAL_REGISTERS",
        structure(
            0x54,
            vec![
                ("Cr0", 0, T::unsigned(4)),
                ("Cr2", 4, T::unsigned(4)),
                ("Cr3", 8, T::unsigned(4)),
                ("Cr4", 0xc, T::unsigned(4)),
                ("Gdtr", 0x2c, T::named("_DESCRIPTOR")),
                ("Idtr", 0x34, T::named("_DESCRIPTOR")),
                ("Tr", 0x3c, T::unsigned(2)),
                ("Ldtr", 0x3e, T::unsigned(2)),
            ],
        ),
    );
    vtypes.insert(
        "_DESCRIPTOR",
        structure(
            8,
            vec![
                ("Pad", 0, T::unsigned(2)),
                ("Limit", 2, T::unsigned(2)),
                ("Base", 4, T::unsigned(4)),
            ],
        ),
    );
}

/// Pool header and registry/VAD kernel types for the x86 generation.
pub(crate) fn common_x86_types(vtypes: &mut VTypes) {
    vtypes.insert(
        "_POOL_HEADER",
        structure(
            8,
            vec![
                ("Ulong1", 0, T::unsigned(4)),
                ("PreviousSize", 0, T::bitfield(0, 9, T::unsigned(4))),
                ("PoolIndex", 0, T::bitfield(9, 16, T::unsigned(4))),
                ("BlockSize", 0, T::bitfield(16, 25, T::unsigned(4))),
                ("PoolType", 0, T::bitfield(25, 32, T::unsigned(4))),
                ("PoolTag", 4, T::unsigned(4)),
            ],
        ),
    );
    hive_types(vtypes);
    vad_types(vtypes);
}

/// Pool header and registry kernel types for the x64 generation.
pub(crate) fn common_x64_types(vtypes: &mut VTypes) {
    vtypes.insert(
        "_POOL_HEADER",
        structure(
            0x10,
            vec![
                ("Ulong1", 0, T::unsigned(4)),
                ("PreviousSize", 0, T::bitfield(0, 8, T::unsigned(4))),
                ("PoolIndex", 0, T::bitfield(8, 16, T::unsigned(4))),
                ("BlockSize", 0, T::bitfield(16, 24, T::unsigned(4))),
                ("PoolType", 0, T::bitfield(24, 32, T::unsigned(4))),
                ("PoolTag", 4, T::unsigned(4)),
                ("ProcessBilled", 8, T::pointer_to(T::unsigned(1))),
            ],
        ),
    );
    hive_types(vtypes);
}

fn hive_types(vtypes: &mut VTypes) {
    vtypes.insert(
        "_HHIVE",
        structure(
            0x58,
            vec![
                ("Signature", 0, T::unsigned(4)),
                ("Sequence1", 4, T::unsigned(4)),
                ("Sequence2", 8, T::unsigned(4)),
                ("TimeStamp", 0xc, T::unsigned(8)),
                ("BaseBlock", 0x30, T::pointer_to(T::unsigned(1))),
            ],
        ),
    );
}

fn vad_types(vtypes: &mut VTypes) {
    let short_fields = vec![
        ("StartingVpn", 0u64, T::unsigned(4)),
        ("EndingVpn", 4, T::unsigned(4)),
        ("Parent", 8, T::pointer_to(T::named("_MMVAD"))),
        ("LeftChild", 0xc, T::pointer_to(T::named("_MMVAD"))),
        ("RightChild", 0x10, T::pointer_to(T::named("_MMVAD"))),
        ("Flags", 0x14, T::unsigned(4)),
        ("CommitCharge", 0x14, T::bitfield(0, 19, T::unsigned(4))),
        ("Protection", 0x14, T::bitfield(24, 29, T::unsigned(4))),
    ];
    let mut long_fields = short_fields.clone();
    long_fields.extend(vec![
        ("ControlArea", 0x18u64, T::pointer_to(T::named("_CONTROL_AREA"))),
        ("FirstPrototypePte", 0x1c, T::unsigned(4)),
        ("LastContiguousPte", 0x20, T::unsigned(4)),
        ("Flags2", 0x24, T::unsigned(4)),
        ("FileOffset", 0x24, T::bitfield(0, 24, T::unsigned(4))),
        ("LongVad", 0x24, T::bitfield(29, 30, T::unsigned(4))),
    ]);
    vtypes.insert("_MMVAD_SHORT", structure(0x18, short_fields));
    vtypes.insert("_MMVAD", structure(0x28, long_fields));
    vtypes.insert(
        "_CONTROL_AREA",
        structure(
            0x30,
            vec![
                ("Segment", 0, T::unsigned(4)),
                ("NumberOfSectionReferences", 8, T::unsigned(4)),
                ("NumberOfPfnReferences", 0xc, T::unsigned(4)),
                ("NumberOfMappedViews", 0x10, T::unsigned(4)),
                ("NumberOfSubsections", 0x14, T::unsigned(2)),
                ("FilePointer", 0x24, T::pointer_to(T::unsigned(1))),
            ],
        ),
    );
}

/// The discovery overlay: one magic type whose `KDBGHeader` field names
/// the exact byte pattern to find in the image.
pub(crate) fn volatility_magic(kdbg_header: &'static [u8]) -> VTypes {
    let mut vtypes = VTypes::new();
    vtypes.insert(
        "VOLATILITY_MAGIC",
        structure(
            kdbg_header.len() as u64,
            vec![("KDBGHeader", 0, T::Magic(kdbg_header))],
        ),
    );
    vtypes
}
