//! Shared data model for the device pool, VM and fstests layers.
//!
//! These types are pure data — no I/O, no subprocess calls. Each type
//! documents the invariant its owning component is responsible for
//! upholding; this module only encodes the shape.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A persistent LVM volume group dedicated to ephemeral per-session
/// volumes. Invariant: a pool's VG exists iff the pool is present in
/// the config store — a pool holds no persistent LVs of its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pool {
    pub pool_name: String,
    pub device_path: String,
    pub vg_name: String,
    pub lv_prefix: String,
    pub created_at: String,
    pub created_by: String,
}

/// A requested volume within one `allocate_volumes` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub size: String,
    pub order: u32,
    pub env_var: Option<String>,
}

/// A materialized LV recorded in the State Store.
///
/// Invariant: every allocation listed in the store corresponds to an
/// existing LV, unless `allocator_pid` is dead, in which case the LV
/// may already be gone and the record is a sweep candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeAllocation {
    pub lv_name: String,
    pub lv_path: String,
    pub pool_name: String,
    pub vg_name: String,
    pub spec: VolumeSpec,
    pub allocator_pid: u32,
    pub allocated_at: String,
    pub session_id: String,
}

/// Backing-store selection for a sized (non-pre-existing) device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceBacking {
    DiskLoop,
    TmpfsLoop,
    NullBlk,
    LvmPool,
}

/// A single device request for a VM. Exactly one of `path` or `size`
/// is present — `Path` variants reference a pre-existing block device,
/// `Sized` variants ask the VM Device Manager to create one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceSpec {
    Path {
        path: String,
        name: Option<String>,
        order: u32,
        readonly: bool,
        env_var: Option<String>,
    },
    Sized {
        size: String,
        backing: DeviceBacking,
        name: Option<String>,
        order: u32,
        env_var: Option<String>,
    },
}

impl DeviceSpec {
    pub fn order(&self) -> u32 {
        match self {
            DeviceSpec::Path { order, .. } => *order,
            DeviceSpec::Sized { order, .. } => *order,
        }
    }

    pub fn env_var(&self) -> Option<&str> {
        match self {
            DeviceSpec::Path { env_var, .. } => env_var.as_deref(),
            DeviceSpec::Sized { env_var, .. } => env_var.as_deref(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            DeviceSpec::Path { name, .. } => name.as_deref(),
            DeviceSpec::Sized { name, .. } => name.as_deref(),
        }
    }
}

/// A resolved host device path ready to attach to the VM binary,
/// paired back to the spec that produced it.
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    pub spec: DeviceSpec,
    pub host_path: PathBuf,
}

/// One classified kernel log line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DmesgMessage {
    pub timestamp: Option<String>,
    pub severity: Severity,
    pub subsystem: Option<String>,
    pub message: String,
}

/// Kernel log priority, `emerg` highest to `debug` lowest, matching
/// syslog priority numbering 0-7.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Emerg,
    Alert,
    Crit,
    Err,
    Warn,
    Notice,
    Info,
    Debug,
}

impl Severity {
    pub fn from_priority(n: u8) -> Option<Severity> {
        Some(match n {
            0 => Severity::Emerg,
            1 => Severity::Alert,
            2 => Severity::Crit,
            3 => Severity::Err,
            4 => Severity::Warn,
            5 => Severity::Notice,
            6 => Severity::Info,
            7 => Severity::Debug,
            _ => return None,
        })
    }
}

/// Outcome of one VM boot, with classified dmesg output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootResult {
    pub boot_completed: bool,
    pub duration_secs: f64,
    pub kernel_version: Option<String>,
    pub panics: Vec<DmesgMessage>,
    pub oops: Vec<DmesgMessage>,
    pub errors: Vec<DmesgMessage>,
    pub warnings: Vec<DmesgMessage>,
    pub raw_log: String,
    pub guest_exit_status: Option<i32>,
    pub timeout_occurred: bool,
}

impl BootResult {
    pub fn has_critical_issues(&self) -> bool {
        !self.panics.is_empty() || !self.oops.is_empty()
    }

    /// A one-line glyph-prefixed summary, matching the `✓`/`⚠`/`✗`
    /// convention every tool response uses at the RPC boundary.
    pub fn summary(&self) -> String {
        if self.timeout_occurred {
            format!("✗ boot timed out after {:.1}s", self.duration_secs)
        } else if self.has_critical_issues() {
            format!(
                "✗ boot completed with {} panic(s), {} oops",
                self.panics.len(),
                self.oops.len()
            )
        } else if !self.errors.is_empty() {
            format!("⚠ boot completed with {} error(s)", self.errors.len())
        } else {
            format!("✓ boot completed cleanly in {:.1}s", self.duration_secs)
        }
    }
}

/// Outcome of a single fstests test case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResult {
    pub test_name: String,
    pub status: TestStatus,
    pub duration_secs: Option<f64>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    NotRun,
}

/// Aggregate outcome of one fstests invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResult {
    pub success: bool,
    pub total_tests: u32,
    pub passed: u32,
    pub failed: u32,
    pub notrun: u32,
    pub duration_secs: Option<f64>,
    pub test_results: Vec<TestResult>,
    pub check_log: Option<PathBuf>,
}

impl RunResult {
    pub fn test_names(&self) -> impl Iterator<Item = &str> {
        self.test_results.iter().map(|t| t.test_name.as_str())
    }
}

/// Metadata attached to a saved baseline or a git-notes record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunMetadata {
    pub kernel_version: Option<String>,
    pub fstype: Option<String>,
    pub test_selection: Option<String>,
    pub created_at: String,
}

/// A named, timestamped RunResult kept under the baseline directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Baseline {
    pub name: String,
    pub metadata: RunMetadata,
    pub result: RunResult,
}

/// A RunResult + metadata as persisted under `refs/notes/fstests`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitNoteRecord {
    pub metadata: GitNoteMetadata,
    pub results: RunResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitNoteMetadata {
    pub commit_sha: String,
    pub branch_name: Option<String>,
    pub kernel_version: Option<String>,
    pub fstype: Option<String>,
    pub test_selection: Option<String>,
    pub created_at: String,
}

/// How a test in a comparison run relates to the same test name in
/// the baseline it is compared against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComparisonResult {
    pub new_failures: Vec<String>,
    pub new_passes: Vec<String>,
    pub still_failing: Vec<String>,
    pub still_passing: Vec<String>,
    pub new_notrun: Vec<String>,
}

impl ComparisonResult {
    pub fn regression_detected(&self) -> bool {
        !self.new_failures.is_empty()
    }

    pub fn regression_count(&self) -> usize {
        self.new_failures.len()
    }

    pub fn improvement_count(&self) -> usize {
        self.new_passes.len()
    }

    pub fn summary(&self) -> String {
        if self.regression_detected() {
            format!(
                "✗ {} regression(s): {}",
                self.regression_count(),
                self.new_failures.join(", ")
            )
        } else if self.improvement_count() > 0 {
            format!("✓ {} improvement(s), no regressions", self.improvement_count())
        } else {
            "✓ no change vs baseline".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_result_summary_glyphs() {
        let mut r = BootResult {
            boot_completed: true,
            duration_secs: 1.0,
            kernel_version: None,
            panics: vec![],
            oops: vec![],
            errors: vec![],
            warnings: vec![],
            raw_log: String::new(),
            guest_exit_status: Some(0),
            timeout_occurred: false,
        };
        assert!(r.summary().starts_with('✓'));

        r.timeout_occurred = true;
        assert!(r.summary().starts_with('✗'));
    }

    #[test]
    fn device_spec_path_xor_size_is_enforced_by_the_enum_shape() {
        let spec = DeviceSpec::Path {
            path: "/dev/loop7".into(),
            name: Some("test".into()),
            order: 0,
            readonly: false,
            env_var: Some("TEST_DEV".into()),
        };
        assert_eq!(spec.order(), 0);
        assert_eq!(spec.env_var(), Some("TEST_DEV"));
    }

    #[test]
    fn comparison_result_regression_detection() {
        let cmp = ComparisonResult {
            new_failures: vec!["generic/003".into()],
            new_passes: vec![],
            still_failing: vec![],
            still_passing: vec!["generic/001".into(), "generic/002".into(), "generic/004".into()],
            new_notrun: vec![],
        };
        assert!(cmp.regression_detected());
        assert_eq!(cmp.still_passing.len(), 3);
    }
}
