//! Library defaults for `HelperConfig`.
//!
//! Overridden at runtime by the `CMDBUF_*` environment variables.

/// Ring size in 32-bit entries (4 KiB ring).
pub const RING_ENTRIES: u32 = 1024;

/// Transfer arena size in bytes (1 MiB).
pub const TRANSFER_SIZE: u32 = 1024 * 1024;

/// Blocking wait deadline in milliseconds. 0 = wait forever.
pub const WAIT_DEADLINE_MS: u64 = 0;

/// Name given to shared memory objects (visible in /proc/<pid>/fd).
pub const SHM_NAME: &str = "cmdbuf";

/// Largest ring accepted by `validate()`.
pub const MAX_RING_ENTRIES: u32 = 1 << 24;
