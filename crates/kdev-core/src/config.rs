/// Default VM binary name, overridable at build time via `KDEV_VNG_BIN`.
pub const VNG_BIN_DEFAULT: &str = match option_env!("KDEV_VNG_BIN") {
    Some(v) => v,
    None => "vng",
};

/// Effective VM binary name. Priority: runtime env `KDEV_VNG_BIN` >
/// compile-time default. A CLI flag can set the env var before calling
/// into the core.
pub fn vng_bin() -> String {
    std::env::var("KDEV_VNG_BIN").unwrap_or_else(|_| VNG_BIN_DEFAULT.to_string())
}

/// Check whether destructive commands should be prefixed with `sudo`.
/// Disabled only for tests or a root-owned daemon context.
pub fn use_sudo() -> bool {
    std::env::var("KDEV_NO_SUDO")
        .map(|v| !(v == "1" || v.eq_ignore_ascii_case("true")))
        .unwrap_or(true)
}

/// Orphan staleness threshold (seconds) for null_blk sweep: a
/// configfs entry younger than this is assumed to belong to a
/// sibling service instance still setting it up.
pub fn null_blk_orphan_threshold_secs() -> u64 {
    std::env::var("KDEV_NULL_BLK_ORPHAN_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60)
}
