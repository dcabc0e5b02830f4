use anyhow::{Result, bail};

/// Validate a pool, VG, LV-prefix or device-spec name: lowercase
/// alphanumeric + hyphens, 1-63 chars, no leading/trailing hyphen.
pub fn validate_id(id: &str, kind: &str) -> Result<()> {
    if id.is_empty() || id.len() > 63 {
        bail!("{} ID must be 1-63 characters, got {}", kind, id.len());
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        bail!(
            "{} ID must be lowercase alphanumeric, hyphens or underscores: {:?}",
            kind,
            id
        );
    }
    if id.starts_with('-') || id.ends_with('-') {
        bail!("{} ID must not start or end with a hyphen: {:?}", kind, id);
    }
    Ok(())
}

fn rand_hex6() -> String {
    let id = uuid::Uuid::new_v4();
    let bytes = id.as_bytes();
    format!("{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2])
}

/// Generate a VM session id: `{UTC YYYYMMDDHHMMSS}-{6 hex chars}`, 21
/// characters total.
pub fn generate_session_id() -> String {
    let ts = chrono::Utc::now().format("%Y%m%d%H%M%S");
    format!("{}-{}", ts, rand_hex6())
}

/// Generate the unique allocation prefix used for one `allocate_volumes`
/// call: `{lv_prefix}-{UTC YYYYMMDDHHMMSS}-{6 hex chars}`.
pub fn generate_allocation_prefix(lv_prefix: &str) -> String {
    let ts = chrono::Utc::now().format("%Y%m%d%H%M%S");
    format!("{}-{}-{}", lv_prefix, ts, rand_hex6())
}

/// Synthesize the full LV name for one volume within an allocation:
/// `{prefix}-{volume_name}`, where `prefix` already carries the
/// timestamp and random suffix from [`generate_allocation_prefix`].
pub fn lv_name(prefix: &str, volume_name: &str) -> String {
    format!("{}-{}", prefix, volume_name)
}

/// Boot log file name: `boot-{UTC YYYYMMDDHHMMSS}-running.log`. The
/// caller renames the `-running` suffix away once the boot completes.
pub fn boot_log_name() -> String {
    let ts = chrono::Utc::now().format("%Y%m%d%H%M%S");
    format!("boot-{}-running.log", ts)
}

/// Parse a device/volume size string: `N[KMG]` or a bare integer
/// (implicitly MiB). Returns the size in MiB, rounding up fractional
/// KiB-to-MiB conversions. Rejects zero, negative, and malformed input.
pub fn parse_size_mib(input: &str) -> Result<u64> {
    let input = input.trim();
    if input.is_empty() {
        bail!("empty size string");
    }

    let (digits, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], Some(c.to_ascii_uppercase())),
        _ => (input, None),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("malformed size string: {:?}", input))?;
    if value == 0 {
        bail!("size must be positive, got {:?}", input);
    }

    let mib = match unit {
        None | Some('M') => value,
        Some('G') => value * 1024,
        Some('K') => value.div_ceil(1024).max(1),
        Some(other) => bail!("unrecognized size unit {:?} in {:?}", other, input),
    };

    Ok(mib)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_id_accepts_lowercase_hyphenated() {
        assert!(validate_id("fstests-pool", "pool").is_ok());
        assert!(validate_id("a", "pool").is_ok());
    }

    #[test]
    fn validate_id_rejects_bad_input() {
        assert!(validate_id("", "pool").is_err());
        assert!(validate_id("UPPER", "pool").is_err());
        assert!(validate_id("-leading", "pool").is_err());
        assert!(validate_id("trailing-", "pool").is_err());
        assert!(validate_id(&"a".repeat(64), "pool").is_err());
    }

    #[test]
    fn session_id_has_expected_shape() {
        let id = generate_session_id();
        assert_eq!(id.len(), 21);
        assert_eq!(id.as_bytes()[14], b'-');
    }

    #[test]
    fn allocation_prefix_embeds_lv_prefix() {
        let prefix = generate_allocation_prefix("fstests");
        assert!(prefix.starts_with("fstests-"));
        let lv = lv_name(&prefix, "test");
        assert!(lv.ends_with("-test"));
        assert!(lv.starts_with(&prefix));
    }

    #[test]
    fn parse_size_mib_handles_units() {
        assert_eq!(parse_size_mib("10G").unwrap(), 10240);
        assert_eq!(parse_size_mib("10240M").unwrap(), 10240);
        assert_eq!(parse_size_mib("1024K").unwrap(), 1);
        assert_eq!(parse_size_mib("512").unwrap(), 512);
    }

    #[test]
    fn parse_size_mib_rounds_up_fractional_kib() {
        // 1025 KiB rounds up to 2 MiB, never truncates.
        assert_eq!(parse_size_mib("1025K").unwrap(), 2);
    }

    #[test]
    fn parse_size_mib_rejects_invalid() {
        assert!(parse_size_mib("0").is_err());
        assert!(parse_size_mib("-5M").is_err());
        assert!(parse_size_mib("abc").is_err());
        assert!(parse_size_mib("").is_err());
    }
}
