//! Resource caps for device pools and VM sessions.
//!
//! Each cap is a compile-time default, overridable at process start via
//! an environment variable. The override is read once and cached,
//! mirroring the pattern `config::fc_version()` uses for version
//! strings: a const default, an env var that wins if set and parses.

use std::sync::OnceLock;

pub const MAX_CUSTOM_DEVICES_PER_VM: usize = 8;
pub const MAX_NULL_BLK_DEVICE_GIB: u64 = 16;
pub const MAX_NULL_BLK_TOTAL_GIB: u64 = 32;
pub const MAX_NULL_BLK_INDEX: u32 = 1024;

/// Default interval between PTY master-fd polls while a VM session is running.
pub const DEFAULT_PTY_POLL_MILLIS: u64 = 100;

fn env_override_u64(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Effective per-device null_blk cap in GiB, honoring `KDEV_MAX_NULL_BLK_DEVICE_GIB`.
pub fn max_null_blk_device_gib() -> u64 {
    static CACHED: OnceLock<u64> = OnceLock::new();
    *CACHED.get_or_init(|| env_override_u64("KDEV_MAX_NULL_BLK_DEVICE_GIB", MAX_NULL_BLK_DEVICE_GIB))
}

/// Effective aggregate null_blk cap in GiB, honoring `KDEV_MAX_NULL_BLK_TOTAL_GIB`.
pub fn max_null_blk_total_gib() -> u64 {
    static CACHED: OnceLock<u64> = OnceLock::new();
    *CACHED.get_or_init(|| env_override_u64("KDEV_MAX_NULL_BLK_TOTAL_GIB", MAX_NULL_BLK_TOTAL_GIB))
}

/// Effective per-VM custom device cap, honoring `KDEV_MAX_CUSTOM_DEVICES_PER_VM`.
pub fn max_custom_devices_per_vm() -> usize {
    static CACHED: OnceLock<usize> = OnceLock::new();
    *CACHED.get_or_init(|| {
        std::env::var("KDEV_MAX_CUSTOM_DEVICES_PER_VM")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(MAX_CUSTOM_DEVICES_PER_VM)
    })
}
