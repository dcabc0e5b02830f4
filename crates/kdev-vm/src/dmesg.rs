//! Per-line kernel log parsing and severity classification.
//!
//! Mirrors the historical `DmesgParser`: timestamp, then priority tag,
//! then subsystem prefix are stripped in that order; whatever is left
//! is the message body. Severity comes from an explicit priority tag
//! when present, otherwise from content matching against panic/oops/
//! error/warning patterns, in that priority order.

use kdev_core::model::{DmesgMessage, Severity};
use regex::Regex;
use std::sync::OnceLock;

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[\s*(\d+\.\d+)\]\s*(.*)$").unwrap())
}

fn priority_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^<(\d)>\s*(.*)$").unwrap())
}

fn subsystem_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Z][A-Z0-9_]+):\s*(.*)$").unwrap())
}

fn panic_patterns() -> &'static [Regex; 3] {
    static RE: OnceLock<[Regex; 3]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r"(?i)kernel panic").unwrap(),
            Regex::new(r"(?i)bug: unable to handle").unwrap(),
            Regex::new(r"(?i)general protection fault").unwrap(),
        ]
    })
}

fn oops_patterns() -> &'static [Regex; 3] {
    static RE: OnceLock<[Regex; 3]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r"(?i)bug:").unwrap(),
            Regex::new(r"(?i)oops:").unwrap(),
            Regex::new(r"(?i)unable to handle kernel").unwrap(),
        ]
    })
}

fn error_patterns() -> &'static [Regex; 3] {
    static RE: OnceLock<[Regex; 3]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r"(?i)\berror\b").unwrap(),
            Regex::new(r"(?i)\bfailed\b").unwrap(),
            Regex::new(r"(?i)\bfailure\b").unwrap(),
        ]
    })
}

fn warning_patterns() -> &'static [Regex; 2] {
    static RE: OnceLock<[Regex; 2]> = OnceLock::new();
    RE.get_or_init(|| {
        [Regex::new(r"(?i)\bwarning\b").unwrap(), Regex::new(r"(?i)warn").unwrap()]
    })
}

fn failed_ignoring_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)failed.*ignoring").unwrap())
}

/// Known-benign patterns that would otherwise look like real errors
/// under a virtualized boot: an init probe that fails and explicitly
/// says so is ignoring the failure, virtme-ng's early PCI probe is
/// expected to come up empty, and userspace permission errors from
/// tmpfiles.d are noise from the guest's unprivileged boot, not a
/// kernel problem.
fn is_benign_content(message: &str) -> bool {
    if failed_ignoring_re().is_match(message) {
        return true;
    }
    if message.contains("PCI: Fatal: No config space") {
        return true;
    }
    if message.contains("virtme-ng-init:") {
        return true;
    }
    if message.to_lowercase().contains("permission denied") {
        return true;
    }
    false
}

fn looks_like_call_trace(message: &str) -> bool {
    let t = message.trim_start();
    t.starts_with("Call Trace") || t.starts_with("Call trace") || t.starts_with("RIP:") || t.starts_with("Code:")
        || (t.starts_with('[') && t.contains('<'))
        || t.starts_with('?')
}

fn classify_content(message: &str) -> Option<Severity> {
    if panic_patterns().iter().any(|r| r.is_match(message)) {
        return Some(Severity::Emerg);
    }
    if oops_patterns().iter().any(|r| r.is_match(message)) {
        return Some(Severity::Crit);
    }
    if error_patterns().iter().any(|r| r.is_match(message)) {
        return Some(Severity::Err);
    }
    if warning_patterns().iter().any(|r| r.is_match(message)) {
        return Some(Severity::Warn);
    }
    None
}

/// Parse one raw dmesg line. Returns `None` only for a blank line or
/// one reduced to nothing after stripping its timestamp/priority/
/// subsystem prefixes.
pub fn parse_line(line: &str) -> Option<DmesgMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let mut rest = line.to_string();
    let mut timestamp = None;
    let has_timestamp = if let Some(caps) = timestamp_re().captures(&rest) {
        timestamp = Some(caps[1].to_string());
        rest = caps[2].to_string();
        true
    } else {
        false
    };

    let mut explicit_priority = None;
    if let Some(caps) = priority_re().captures(&rest) {
        explicit_priority = caps[1].parse::<u8>().ok();
        rest = caps[2].to_string();
    }

    let mut subsystem = None;
    if let Some(caps) = subsystem_re().captures(&rest) {
        subsystem = Some(caps[1].to_string());
        rest = caps[2].to_string();
    }

    let message = rest;
    if message.is_empty() {
        return None;
    }

    let explicit_severity = explicit_priority.and_then(Severity::from_priority);

    // An untimestamped line that isn't a recognizable call-trace frame
    // is a wrapped continuation of the previous line, not its own
    // kernel event; never let it trigger a content-based upgrade.
    if !has_timestamp && !looks_like_call_trace(&message) {
        return Some(DmesgMessage {
            timestamp,
            severity: explicit_severity.unwrap_or(Severity::Info),
            subsystem,
            message,
        });
    }

    let severity = explicit_severity.or_else(|| {
        if is_benign_content(&message) { None } else { classify_content(&message) }
    });

    Some(DmesgMessage { timestamp, severity: severity.unwrap_or(Severity::Info), subsystem, message })
}

/// Aggregated view of one boot's classified log lines.
#[derive(Debug, Default, Clone)]
pub struct ClassifiedLog {
    pub panics: Vec<DmesgMessage>,
    pub oops: Vec<DmesgMessage>,
    pub errors: Vec<DmesgMessage>,
    pub warnings: Vec<DmesgMessage>,
}

/// Classify every line of `raw_log`. `errors` is a superset that
/// includes panic/oops-severity messages alongside plain `err`/`alert`
/// ones, matching how panics and oops are themselves also errors; only
/// `warnings` is exclusive to `warn`-severity lines.
pub fn classify(raw_log: &str) -> ClassifiedLog {
    let mut result = ClassifiedLog::default();
    for line in raw_log.lines() {
        let Some(msg) = parse_line(line) else { continue };

        if panic_patterns().iter().any(|r| r.is_match(&msg.message)) {
            result.panics.push(msg.clone());
        }
        if oops_patterns().iter().any(|r| r.is_match(&msg.message)) {
            result.oops.push(msg.clone());
        }
        match msg.severity {
            Severity::Emerg | Severity::Alert | Severity::Crit | Severity::Err => result.errors.push(msg.clone()),
            Severity::Warn => result.warnings.push(msg.clone()),
            _ => {}
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timestamp_priority_subsystem() {
        let msg = parse_line("[   10.234567] <3> USB: device error: unable to enumerate").unwrap();
        assert_eq!(msg.timestamp.as_deref(), Some("10.234567"));
        assert_eq!(msg.severity, Severity::Err);
        assert_eq!(msg.subsystem.as_deref(), Some("USB"));
    }

    #[test]
    fn upgrades_to_err_on_failed_and_error_keywords() {
        let msg = parse_line("[    1.234567] Device failed: Error during initialization").unwrap();
        assert_eq!(msg.severity, Severity::Err);
    }

    #[test]
    fn kernel_panic_upgrades_to_emerg() {
        let msg = parse_line("[    5.0] Kernel panic - not syncing: VFS").unwrap();
        assert_eq!(msg.severity, Severity::Emerg);
    }

    #[test]
    fn failed_ignoring_is_not_an_error() {
        let msg = parse_line("[    0.292944] check access for rdinit=/init failed: -2, ignoring").unwrap();
        assert_ne!(msg.severity, Severity::Err);
    }

    #[test]
    fn pci_fatal_no_config_space_is_not_an_error() {
        let msg = parse_line("[    0.115953] PCI: Fatal: No config space access function found").unwrap();
        assert_ne!(msg.severity, Severity::Err);
    }

    #[test]
    fn virtme_ng_init_permission_denied_is_not_an_error() {
        let msg = parse_line(
            "[    0.467151] virtme-ng-init: Failed to read '/usr/lib/tmpfiles.d/audit.conf': Permission denied",
        )
        .unwrap();
        assert_ne!(msg.severity, Severity::Err);
    }

    #[test]
    fn untimestamped_continuation_line_is_not_an_error() {
        let msg = parse_line("               Failed to read '/usr/lib/tmpfiles.d/nordvpn.conf': Permission denied").unwrap();
        assert_ne!(msg.severity, Severity::Err);
    }

    #[test]
    fn classify_filters_false_positives_but_keeps_real_errors() {
        let log = "[    0.000000] Linux version 6.16.0\n\
[    0.292944] check access for rdinit=/init failed: -2, ignoring\n\
[    0.115953] PCI: Fatal: No config space access function found\n\
[    5.123456] Critical device initialization failed\n\
[    0.467151] virtme-ng-init: Failed to read tmpfiles: Permission denied\n\
[    5.234567] Disk I/O error detected\n";
        let classified = classify(log);
        assert_eq!(classified.errors.len(), 2);
        assert!(classified.errors.iter().any(|e| e.message.contains("Critical device initialization failed")));
        assert!(classified.errors.iter().any(|e| e.message.contains("Disk I/O error detected")));
        assert!(!classified.errors.iter().any(|e| e.message.contains("ignoring")));
        assert!(!classified.errors.iter().any(|e| e.message.contains("PCI")));
    }

    #[test]
    fn classify_counts_panics_in_errors_too() {
        let log = "[    5.0] Kernel panic - not syncing: VFS\n";
        let classified = classify(log);
        assert_eq!(classified.panics.len(), 1);
        assert_eq!(classified.errors.len(), 1);
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
    }
}
