//! Ten-check gate before adopting a raw block device as a pool.
//!
//! Each check produces a severity; the report's overall verdict is
//! the highest severity seen. A missing helper binary always yields
//! `Warning`, never a silent `Ok` — we cannot claim a check passed
//! when we could not run it.

use kdev_exec::{Exec, ExecRequest};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Ok,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Ok => "ok",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub check_name: &'static str,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub checks: Vec<CheckResult>,
    pub overall: Severity,
}

impl ValidationReport {
    pub fn blocks_pool_creation(&self) -> bool {
        self.overall == Severity::Error
    }

    /// Render the ten-check breakdown the way ExecError/SafetyError
    /// payloads carry it to the RPC boundary.
    pub fn render(&self) -> String {
        let glyph = |s: Severity| match s {
            Severity::Ok => "✓",
            Severity::Warning => "⚠",
            Severity::Error => "✗",
        };
        let mut out = format!("{} safety validation: {}\n", glyph(self.overall), self.overall);
        for check in &self.checks {
            out.push_str(&format!(
                "  {} {}: {}\n",
                glyph(check.severity),
                check.check_name,
                check.message
            ));
        }
        out
    }
}

const SYSTEM_MOUNTS: [&str; 6] = ["/", "/boot", "/boot/efi", "/home", "/var", "/usr"];
const EXTRA_SYSTEM_MOUNT: &str = "/opt";

fn tool_missing_warning(check_name: &'static str, tool: &str) -> CheckResult {
    CheckResult {
        check_name,
        severity: Severity::Warning,
        message: format!("helper tool '{}' not found; check skipped", tool),
    }
}

/// Run all ten checks against `device` and return the combined report.
/// `skip_lvm_check` allows check 6 (not-an-existing-PV) to be skipped
/// when adopting a device that is already a PV for a pool being
/// recreated in place.
pub fn validate_device(exec: &dyn Exec, device: &str, skip_lvm_check: bool) -> ValidationReport {
    let mut checks = Vec::new();

    checks.push(check_exists_and_is_block_device(device));
    checks.push(check_not_mounted(exec, device));
    checks.push(check_not_in_fstab(exec, device));
    checks.push(check_not_system_disk(exec, device));
    checks.push(check_not_raid_member(exec, device));
    if skip_lvm_check {
        checks.push(CheckResult {
            check_name: "not_lvm_pv",
            severity: Severity::Ok,
            message: "skipped: adopting an existing PV by request".to_string(),
        });
    } else {
        checks.push(check_not_lvm_pv(exec, device));
    }
    checks.push(check_not_encrypted(exec, device));
    checks.push(check_no_open_handles(exec, device));
    checks.push(check_filesystem_signatures(exec, device));
    checks.push(check_partition_table(exec, device));

    let overall = checks
        .iter()
        .map(|c| c.severity)
        .max()
        .unwrap_or(Severity::Ok);

    ValidationReport { checks, overall }
}

fn check_exists_and_is_block_device(device: &str) -> CheckResult {
    let path = std::path::Path::new(device);
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => {
            return CheckResult {
                check_name: "exists_and_is_block_device",
                severity: Severity::Error,
                message: format!("{} does not exist", device),
            };
        }
    };

    use std::os::unix::fs::FileTypeExt;
    if meta.file_type().is_block_device() {
        CheckResult {
            check_name: "exists_and_is_block_device",
            severity: Severity::Ok,
            message: format!("{} is a block device", device),
        }
    } else {
        CheckResult {
            check_name: "exists_and_is_block_device",
            severity: Severity::Error,
            message: format!("{} is not a block device", device),
        }
    }
}

fn check_not_mounted(exec: &dyn Exec, device: &str) -> CheckResult {
    match exec.exec(&ExecRequest::new(["findmnt", "-n", "-o", "TARGET", device])) {
        Ok(out) if out.success() && !out.stdout_string().is_empty() => CheckResult {
            check_name: "not_mounted",
            severity: Severity::Error,
            message: format!("{} is mounted at {}", device, out.stdout_string()),
        },
        Ok(_) => CheckResult {
            check_name: "not_mounted",
            severity: Severity::Ok,
            message: format!("{} is not mounted", device),
        },
        Err(_) => tool_missing_warning("not_mounted", "findmnt"),
    }
}

fn check_not_in_fstab(exec: &dyn Exec, device: &str) -> CheckResult {
    let fstab = match std::fs::read_to_string("/etc/fstab") {
        Ok(s) => s,
        Err(_) => {
            return CheckResult {
                check_name: "not_in_fstab",
                severity: Severity::Warning,
                message: "/etc/fstab unreadable; check skipped".to_string(),
            };
        }
    };

    if fstab.lines().any(|line| {
        let line = line.trim();
        !line.is_empty() && !line.starts_with('#') && line.contains(device)
    }) {
        return CheckResult {
            check_name: "not_in_fstab",
            severity: Severity::Error,
            message: format!("{} referenced by path in /etc/fstab", device),
        };
    }

    // Also check by UUID/LABEL via blkid, since fstab commonly refers
    // to a device that way rather than by /dev path.
    if let Ok(out) = exec.exec(&ExecRequest::new(["blkid", "-o", "value", "-s", "UUID", device])) {
        let uuid = out.stdout_string();
        if !uuid.is_empty() && fstab.contains(&uuid) {
            return CheckResult {
                check_name: "not_in_fstab",
                severity: Severity::Error,
                message: format!("{} referenced by UUID in /etc/fstab", device),
            };
        }
    }

    CheckResult {
        check_name: "not_in_fstab",
        severity: Severity::Ok,
        message: format!("{} not referenced in /etc/fstab", device),
    }
}

fn check_not_system_disk(exec: &dyn Exec, device: &str) -> CheckResult {
    match exec.exec(&ExecRequest::new(["findmnt", "-n", "-o", "TARGET", device])) {
        Ok(out) if out.success() => {
            let target = out.stdout_string();
            let mut system_mounts: Vec<&str> = SYSTEM_MOUNTS.to_vec();
            system_mounts.push(EXTRA_SYSTEM_MOUNT);
            if system_mounts.contains(&target.as_str()) {
                CheckResult {
                    check_name: "not_system_disk",
                    severity: Severity::Error,
                    message: format!("{} hosts system mount {}", device, target),
                }
            } else {
                CheckResult {
                    check_name: "not_system_disk",
                    severity: Severity::Ok,
                    message: format!("{} does not host a system mount", device),
                }
            }
        }
        Ok(_) => CheckResult {
            check_name: "not_system_disk",
            severity: Severity::Ok,
            message: format!("{} is not mounted", device),
        },
        Err(_) => tool_missing_warning("not_system_disk", "findmnt"),
    }
}

fn check_not_raid_member(exec: &dyn Exec, device: &str) -> CheckResult {
    match exec.exec(&ExecRequest::new(["mdadm", "--examine", device])) {
        Ok(out) if out.success() => CheckResult {
            check_name: "not_raid_member",
            severity: Severity::Error,
            message: format!("{} is a RAID member", device),
        },
        Ok(_) => CheckResult {
            check_name: "not_raid_member",
            severity: Severity::Ok,
            message: format!("{} is not a RAID member", device),
        },
        Err(_) => tool_missing_warning("not_raid_member", "mdadm"),
    }
}

fn check_not_lvm_pv(exec: &dyn Exec, device: &str) -> CheckResult {
    match exec.exec(&ExecRequest::new(["pvdisplay", device])) {
        Ok(out) if out.success() => CheckResult {
            check_name: "not_lvm_pv",
            severity: Severity::Error,
            message: format!("{} is already an LVM physical volume", device),
        },
        Ok(_) => CheckResult {
            check_name: "not_lvm_pv",
            severity: Severity::Ok,
            message: format!("{} is not an LVM physical volume", device),
        },
        Err(_) => tool_missing_warning("not_lvm_pv", "pvdisplay"),
    }
}

fn check_not_encrypted(exec: &dyn Exec, device: &str) -> CheckResult {
    match exec.exec(&ExecRequest::new(["cryptsetup", "isLuks", device])) {
        Ok(out) if out.success() => CheckResult {
            check_name: "not_encrypted",
            severity: Severity::Error,
            message: format!("{} is LUKS-encrypted", device),
        },
        Ok(_) => CheckResult {
            check_name: "not_encrypted",
            severity: Severity::Ok,
            message: format!("{} is not LUKS-encrypted", device),
        },
        Err(_) => tool_missing_warning("not_encrypted", "cryptsetup"),
    }
}

fn check_no_open_handles(exec: &dyn Exec, device: &str) -> CheckResult {
    match exec.exec(&ExecRequest::new(["lsof", device])) {
        Ok(out) if out.success() && !out.stdout_string().is_empty() => CheckResult {
            check_name: "no_open_handles",
            severity: Severity::Error,
            message: format!("{} has open file handles", device),
        },
        Ok(_) => CheckResult {
            check_name: "no_open_handles",
            severity: Severity::Ok,
            message: format!("{} has no open file handles", device),
        },
        Err(_) => tool_missing_warning("no_open_handles", "lsof"),
    }
}

fn check_filesystem_signatures(exec: &dyn Exec, device: &str) -> CheckResult {
    match exec.exec(&ExecRequest::new(["blkid", "-p", device])) {
        Ok(out) if out.success() && !out.stdout_string().is_empty() => CheckResult {
            check_name: "filesystem_signatures",
            severity: Severity::Warning,
            message: format!("{} has a filesystem signature: {}", device, out.stdout_string()),
        },
        Ok(_) => CheckResult {
            check_name: "filesystem_signatures",
            severity: Severity::Ok,
            message: format!("{} has no filesystem signature", device),
        },
        Err(_) => tool_missing_warning("filesystem_signatures", "blkid"),
    }
}

fn check_partition_table(exec: &dyn Exec, device: &str) -> CheckResult {
    match exec.exec(&ExecRequest::new(["sgdisk", "-p", device])) {
        Ok(out) if out.success() => CheckResult {
            check_name: "partition_table",
            severity: Severity::Warning,
            message: format!("{} has a partition table", device),
        },
        Ok(_) => match exec.exec(&ExecRequest::new(["parted", "-s", device, "print"])) {
            Ok(out) if out.success() && out.stdout_string().to_lowercase().contains("partition table") => {
                CheckResult {
                    check_name: "partition_table",
                    severity: Severity::Warning,
                    message: format!("{} has a partition table (parted)", device),
                }
            }
            Ok(_) => CheckResult {
                check_name: "partition_table",
                severity: Severity::Ok,
                message: format!("{} has no partition table", device),
            },
            Err(_) => tool_missing_warning("partition_table", "sgdisk/parted"),
        },
        Err(_) => tool_missing_warning("partition_table", "sgdisk"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdev_exec::testing::{MockExec, MockResponse};

    #[test]
    fn clean_device_reports_ok_overall() {
        let exec = MockExec::new();
        exec.on(["findmnt"], MockResponse::failure(1, ""));
        exec.on(["mdadm"], MockResponse::failure(1, ""));
        exec.on(["pvdisplay"], MockResponse::failure(1, ""));
        exec.on(["cryptsetup"], MockResponse::failure(1, ""));
        exec.on(["lsof"], MockResponse::failure(1, ""));
        exec.on(["blkid"], MockResponse::failure(1, ""));
        exec.on(["sgdisk"], MockResponse::failure(1, ""));

        // check_exists_and_is_block_device always fails for a path
        // that isn't a real block device on the test host, so this
        // test only asserts the remaining nine checks compose into a
        // non-Error overall severity.
        let report = validate_device(&exec, "/dev/does-not-exist", false);
        let non_existence_checks: Vec<_> = report
            .checks
            .iter()
            .filter(|c| c.check_name != "exists_and_is_block_device")
            .collect();
        assert!(non_existence_checks.iter().all(|c| c.severity != Severity::Error));
    }

    #[test]
    fn mounted_device_blocks_with_error() {
        let exec = MockExec::new();
        exec.on(["findmnt"], MockResponse::ok("/mnt/data\n"));
        let report = validate_device(&exec, "/dev/loop0", false);
        let mount_check = report
            .checks
            .iter()
            .find(|c| c.check_name == "not_mounted")
            .unwrap();
        assert_eq!(mount_check.severity, Severity::Error);
    }

    #[test]
    fn missing_helper_tool_yields_warning_not_ok() {
        // MockExec's default response is success-with-empty-stdout, so
        // to simulate "tool missing" a real Exec impl must return an
        // Err; the mock can't do that directly, so this test instead
        // documents the contract: an exec() that returns an error for
        // a given tool degrades that check to Warning, never Ok.
        struct AlwaysFailsExec;
        impl Exec for AlwaysFailsExec {
            fn exec(&self, _req: &ExecRequest) -> anyhow::Result<kdev_exec::ExecOutput> {
                anyhow::bail!("tool not found")
            }
        }
        let report = validate_device(&AlwaysFailsExec, "/dev/does-not-exist", false);
        for check in &report.checks {
            if check.check_name != "exists_and_is_block_device" && check.check_name != "not_in_fstab" {
                assert_eq!(check.severity, Severity::Warning, "{}", check.check_name);
            }
        }
    }

    #[test]
    fn overall_severity_is_the_max_of_all_checks() {
        let exec = MockExec::new();
        exec.on(["blkid", "-p"], MockResponse::ok("TYPE=\"ext4\"\n"));
        let report = validate_device(&exec, "/dev/loop0", false);
        assert!(report.overall >= Severity::Warning);
        assert!(!report.blocks_pool_creation());
    }
}
