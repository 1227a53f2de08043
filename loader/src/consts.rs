//! Well-known names and bounds the loader hard-codes, matching the target
//! kernel's ABI. Kept as plain `const`/`static` data rather than branching
//! code so that e.g. adding a second fault handler is a one-line change.

/// Synthetic exported symbol every component receives, carrying the control
/// struct the kernel-install adapter (C9) reads back.
pub const COMP_INFO: &str = "cos_comp_info";

/// Substring identifying the initial component.
pub const INIT_COMP: &str = "c0.o";
/// Substring identifying the component graph manager.
pub const MPD_MGR: &str = "cg.o";
/// Substring identifying the scheduler configuration component.
pub const CONFIG_COMP: &str = "schedconf.o";
/// Substrings identifying the boot component (two historical spellings).
pub const BOOT_COMP: &str = "boot.o";
pub const BOOT_COMP2: &str = "bootr.o";
/// Substring identifying the init-file component, and the file it is fed.
pub const INIT_FILE: &str = "init.o";
pub const INIT_FILE_NAME: &str = "init.tar";

/// Suffix appended to an undefined symbol's name to find its client stub.
pub const CAP_CLIENT_STUB_POSTPEND: &str = "_call";
/// Suffix appended to an exported symbol's name to find its server stub.
pub const CAP_SERVER_STUB_POSTPEND: &str = "_inv";
/// Client stub used when a symbol has no dedicated `<name>_call` stub.
pub const CAP_CLIENT_STUB_DEFAULT: &str = "SS_ipc_client_marshal_args";

/// Transparent capability: the scheduler's thread-creation entry point.
pub const SCHED_CREATE_FN: &str = "sched_create_thread";

/// Fault-handler name table. Treated as data: each entry is `(symbol name,
/// fault kind)`. Currently has exactly one entry; `COS_NUM_FAULTS` below
/// reserves room for more without requiring new match arms.
pub const FAULT_HANDLERS: &[(&str, u32)] = &[("fault_page_fault_handler", 0)];

/// Reserved capacity for fault kinds; only kind `0` is defined today.
pub const COS_NUM_FAULTS: u32 = 1;

/// Sentinel `fault_num` meaning "not a fault capability".
pub const FAULT_NUM_NONE: u32 = u32::MAX;

/// Virtual-address window size per component (4 MiB).
pub const WINDOW_SIZE: u64 = 4 * 1024 * 1024;
/// Base of the component address space.
pub const BASE_ADDRESS: u64 = 0x0800_0000;
/// Host page size assumed throughout layout calculations.
pub const PAGE_SIZE: u64 = 4096;
/// Cache line size used to round boot-packaged cobjs before concatenation.
pub const CACHE_LINE: u64 = 64;

/// Maximum number of exported + undefined symbols tracked per component,
/// including the single reserved `cos_comp_info` slot.
pub const MAX_SYMBOLS: usize = 1024;
/// Maximum declared dependencies per component.
pub const MAX_DEPENDENCIES: usize = 32;
/// Maximum byte length of a symbol name (not counting the NUL terminator).
pub const MAX_SYMBOL_LEN: usize = 256;
/// Maximum byte length of an init string embedded in the config component,
/// leaving one byte for the NUL terminator within a 52-byte field.
pub const MAX_INIT_STR_LEN: usize = 51;
/// Byte width of the `init_str` field in a `component_init_str` record.
pub const INIT_STR_FIELD: usize = 52;

/// Number of atomic-region begin/end symbol pairs read out of a component.
pub const NUM_ATOMIC_SYMBS: usize = 10;
pub const ATOMIC_USER_DEF: [&str; NUM_ATOMIC_SYMBS] = [
    "cos_atomic_cmpxchg",
    "cos_atomic_cmpxchg_end",
    "cos_atomic_user1",
    "cos_atomic_user1_end",
    "cos_atomic_user2",
    "cos_atomic_user2_end",
    "cos_atomic_user3",
    "cos_atomic_user3_end",
    "cos_atomic_user4",
    "cos_atomic_user4_end",
];

/// Self-authored layout of the `cos_comp_info` control struct the
/// kernel-install adapter (C9) patches after linking. The real struct lives
/// in a kernel header this corpus never retrieved, so — the same way
/// `cobj::Cobj` fixes its own wire format against the one header
/// (`cobj_format.h`) that *was* retrieved — the loader commits to its own
/// little-endian field order here and writes consistently against it.
pub struct CompInfoLayout;

impl CompInfoLayout {
    /// `spd_id` assigned at install time.
    pub const ID_OFFSET: u64 = 0;
    /// Top of the component's heap, just past its BSS.
    pub const HEAP_TOP_OFFSET: u64 = 4;
    /// Two-word scratch array special components (§4.9 step 5) use to
    /// publish a base address and a count/length to their own code.
    pub const COS_POLY_OFFSET: u64 = 8;
    /// `NUM_ATOMIC_SYMBS` addresses, one per `ATOMIC_USER_DEF` entry.
    pub const ATOMIC_OFFSET: u64 = 16;
    /// Total byte size of the patched region.
    pub const SIZE: u64 = Self::ATOMIC_OFFSET + (NUM_ATOMIC_SYMBS as u64) * 4;
}

/// Returns the fault kind for a symbol name, if it names a fault handler.
pub fn fault_handler_num(name: &str) -> Option<u32> {
    FAULT_HANDLERS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, kind)| *kind)
}
