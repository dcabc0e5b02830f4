//! Parses the text a fstests `./check` invocation writes to its log
//! (`check.log`, or the captured stdout of one run).
//!
//! A log can hold several concatenated runs — each new run starts with
//! its own `Kernel version:` header — and only the last one reflects
//! the most recent invocation, so earlier runs are discarded. Kernel
//! log lines from the guest's dmesg can also land in the middle of a
//! test's own output line; per-test detail lines that don't match any
//! known shape are simply not used for status, and the summary
//! (`Ran:`/`Not run:`/`Failures:`/`Passed all N tests`/`Failed M of N
//! tests`) reconciles the final per-test outcome regardless.

use kdev_core::model::{RunResult, TestResult, TestStatus};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

fn passed_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\S+/\S+)\s+([\d.]+)s$").unwrap())
}

fn notrun_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\S+/\S+)\s+\[not run\]\s*(.*)$").unwrap())
}

fn failed_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\S+/\S+)\s+-\s+(.*)$").unwrap())
}

fn ran_count_duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Ran:\s*(\d+)\s+tests?\s+in\s+([\d.]+)s\s*$").unwrap())
}

fn ran_names_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Ran:\s*(.+)$").unwrap())
}

fn not_run_names_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Not run:\s*(.+)$").unwrap())
}

fn failures_names_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Failures:\s*(.+)$").unwrap())
}

fn passed_all_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Passed all (\d+) tests?$").unwrap())
}

fn failed_of_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Failed (\d+) of (\d+) tests?$").unwrap())
}

fn kernel_version_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^Kernel version:").unwrap())
}

/// Keep only the last run in a log that concatenates several, each
/// introduced by its own `Kernel version:` header. A log with at most
/// one header (or none, e.g. captured stdout of a single invocation)
/// is returned unchanged.
fn last_run_only(raw: &str) -> &str {
    let starts: Vec<usize> = kernel_version_header_re()
        .find_iter(raw)
        .map(|m| m.start())
        .collect();
    match starts.last() {
        Some(&start) if starts.len() > 1 => &raw[start..],
        _ => raw,
    }
}

/// Recognizable substrings meaning the harness itself failed to run
/// anything at all, rather than running and reporting test outcomes.
fn is_harness_failure(raw: &str) -> bool {
    raw.contains("is empty or not defined") || raw.contains("invalid option")
}

/// Parse the text of one `check`/`check.log` run into a [`RunResult`].
pub fn parse_check_output(raw: &str) -> RunResult {
    if is_harness_failure(raw) {
        return RunResult {
            success: false,
            total_tests: 0,
            passed: 0,
            failed: 0,
            notrun: 0,
            duration_secs: None,
            test_results: Vec::new(),
            check_log: None,
        };
    }

    let run = last_run_only(raw);

    let mut test_results: Vec<TestResult> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut ran_count: Option<u32> = None;
    let mut ran_names: Option<Vec<String>> = None;
    let mut not_run_names: Vec<String> = Vec::new();
    let mut failure_names: Vec<String> = Vec::new();
    let mut duration_secs: Option<f64> = None;

    for line in run.lines() {
        let line = line.trim_end();
        if let Some(caps) = passed_line_re().captures(line) {
            let name = caps[1].to_string();
            let duration: f64 = caps[2].parse().unwrap_or(0.0);
            if seen.insert(name.clone()) {
                test_results.push(TestResult {
                    test_name: name,
                    status: TestStatus::Passed,
                    duration_secs: Some(duration),
                    failure_reason: None,
                });
            }
            continue;
        }
        if let Some(caps) = notrun_line_re().captures(line) {
            let name = caps[1].to_string();
            let reason = caps[2].trim();
            if seen.insert(name.clone()) {
                test_results.push(TestResult {
                    test_name: name,
                    status: TestStatus::NotRun,
                    duration_secs: None,
                    failure_reason: if reason.is_empty() { None } else { Some(reason.to_string()) },
                });
            }
            continue;
        }
        if let Some(caps) = failed_line_re().captures(line) {
            let name = caps[1].to_string();
            let reason = caps[2].trim();
            if seen.insert(name.clone()) {
                test_results.push(TestResult {
                    test_name: name,
                    status: TestStatus::Failed,
                    duration_secs: Some(0.0),
                    failure_reason: if reason.is_empty() { None } else { Some(reason.to_string()) },
                });
            }
            continue;
        }
        if let Some(caps) = ran_count_duration_re().captures(line) {
            ran_count = caps[1].parse().ok();
            duration_secs = caps[2].parse().ok();
            continue;
        }
        if let Some(caps) = not_run_names_re().captures(line) {
            not_run_names = caps[1].split_whitespace().map(str::to_string).collect();
            continue;
        }
        if let Some(caps) = failures_names_re().captures(line) {
            failure_names = caps[1].split_whitespace().map(str::to_string).collect();
            continue;
        }
        if let Some(caps) = ran_names_re().captures(line) {
            ran_names = Some(caps[1].split_whitespace().map(str::to_string).collect());
            continue;
        }
        // "Passed all N tests" / "Failed M of N tests" only confirm
        // totals already derivable from the Ran:/Not run:/Failures:
        // lines; parsed for forward-compatibility but not required.
        let _ = passed_all_re().captures(line);
        let _ = failed_of_re().captures(line);
    }

    if let Some(names) = ran_names {
        let not_run: std::collections::HashSet<_> = not_run_names.iter().cloned().collect();
        let failed: std::collections::HashSet<_> = failure_names.iter().cloned().collect();
        for name in names {
            if seen.insert(name.clone()) {
                let status = if not_run.contains(&name) {
                    TestStatus::NotRun
                } else if failed.contains(&name) {
                    TestStatus::Failed
                } else {
                    TestStatus::Passed
                };
                test_results.push(TestResult {
                    test_name: name,
                    status,
                    duration_secs: None,
                    failure_reason: None,
                });
            }
        }
    }

    let passed = test_results.iter().filter(|t| t.status == TestStatus::Passed).count() as u32;
    let failed = test_results.iter().filter(|t| t.status == TestStatus::Failed).count() as u32;
    let notrun = test_results.iter().filter(|t| t.status == TestStatus::NotRun).count() as u32;
    let total_tests = ran_count.unwrap_or(test_results.len() as u32).max(test_results.len() as u32);

    RunResult {
        success: total_tests > 0 && failed == 0,
        total_tests,
        passed,
        failed,
        notrun,
        duration_secs,
        test_results,
        check_log: None,
    }
}

/// Read and parse a `check.log` file, recording its path on the
/// result for later baseline storage.
pub fn parse_check_log_file(path: &Path) -> anyhow::Result<RunResult> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read check log {}: {e}", path.display()))?;
    let mut result = parse_check_output(&raw);
    result.check_log = Some(path.to_path_buf());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_mixed_run() {
        let out = "generic/001 5s\n\
                    generic/002  [not run] requires feature XYZ\n\
                    generic/003 - output mismatch (see generic/003.out.bad)\n\
                    generic/004 10s\n\
                    Ran: 4 tests in 15s\n";
        let result = parse_check_output(out);
        assert_eq!(result.total_tests, 4);
        assert_eq!(result.passed, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.notrun, 1);
        assert_eq!(result.duration_secs, Some(15.0));

        let failed = result.test_results.iter().find(|t| t.test_name == "generic/003").unwrap();
        assert!(failed.failure_reason.as_deref().unwrap().contains("output mismatch"));
    }

    #[test]
    fn summary_only_notrun() {
        let out = "Kernel version: 6.16.0+\n\
                    Wed Oct 22 03:06:22 EDT 2025\n\
                    Ran: btrfs/282\n\
                    Not run: btrfs/282\n\
                    Passed all 1 tests\n";
        let result = parse_check_output(out);
        assert_eq!(result.total_tests, 1);
        assert_eq!(result.notrun, 1);
        assert_eq!(result.passed, 0);
        assert_eq!(result.test_results[0].test_name, "btrfs/282");
        assert_eq!(result.test_results[0].status, TestStatus::NotRun);
    }

    #[test]
    fn summary_only_all_passed() {
        let out = "Kernel version: 6.16.0+\nRan: btrfs/003\nPassed all 1 tests\n";
        let result = parse_check_output(out);
        assert_eq!(result.total_tests, 1);
        assert_eq!(result.passed, 1);
        assert_eq!(result.test_results[0].status, TestStatus::Passed);
    }

    #[test]
    fn summary_mixed_statuses() {
        let out = "Kernel version: 6.16.0+\n\
                    Ran: generic/001 generic/002 generic/003\n\
                    Not run: generic/002\n\
                    Failures: generic/003\n\
                    Failed 1 of 3 tests\n";
        let result = parse_check_output(out);
        assert_eq!(result.total_tests, 3);
        assert_eq!(result.passed, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.notrun, 1);
        assert!(!result.success);
    }

    #[test]
    fn kernel_messages_interleaved_do_not_break_summary_reconciliation() {
        let out = "FSTYP         -- btrfs\n\
                    PLATFORM      -- Linux/x86_64 virtme-ng 6.16.0+\n\
                    btrfs/003       [    2.383242] run fstests btrfs/003 at 2025-10-22 02:55:38\n\
                     7s\n\
                    Ran: btrfs/003\n\
                    Passed all 1 tests\n";
        let result = parse_check_output(out);
        assert_eq!(result.total_tests, 1);
        assert_eq!(result.passed, 1);
        assert_eq!(result.failed, 0);
    }

    #[test]
    fn multiple_not_run_tests() {
        let out = "Kernel version: 6.16.0+\n\
                    Ran: btrfs/100 btrfs/200 btrfs/300\n\
                    Not run: btrfs/100 btrfs/200\n\
                    Passed all 1 tests\n";
        let result = parse_check_output(out);
        assert_eq!(result.total_tests, 3);
        assert_eq!(result.notrun, 2);
        assert_eq!(result.passed, 1);
        let passed = result.test_results.iter().find(|t| t.status == TestStatus::Passed).unwrap();
        assert_eq!(passed.test_name, "btrfs/300");
    }

    #[test]
    fn only_the_last_of_several_concatenated_runs_is_used() {
        let log = "Kernel version: 6.16.0+\n\
                    Wed Oct 22 02:46:24 EDT 2025\n\
                    Ran: btrfs/001\n\
                    Passed all 1 tests\n\
                    \n\
                    Kernel version: 6.16.0+\n\
                    Wed Oct 22 02:55:45 EDT 2025\n\
                    Ran: btrfs/003\n\
                    Passed all 1 tests\n\
                    \n\
                    Kernel version: 6.16.0+\n\
                    Wed Oct 22 03:12:36 EDT 2025\n\
                    Ran: btrfs/282\n\
                    Not run: btrfs/282\n\
                    Passed all 1 tests\n";
        let result = parse_check_output(log);
        assert_eq!(result.total_tests, 1);
        assert_eq!(result.notrun, 1);
        assert_eq!(result.test_results[0].test_name, "btrfs/282");
    }

    #[test]
    fn single_failure_summary() {
        let out = "Kernel version: 6.16.0+\nRan: btrfs/282\nFailures: btrfs/282\nFailed 1 of 1 tests\n";
        let result = parse_check_output(out);
        assert_eq!(result.total_tests, 1);
        assert_eq!(result.failed, 1);
        assert!(!result.success);
    }

    #[test]
    fn multiple_failures_summary() {
        let out = "Kernel version: 6.16.0+\n\
                    Ran: generic/001 generic/002 generic/003\n\
                    Failures: generic/001 generic/003\n\
                    Failed 2 of 3 tests\n";
        let result = parse_check_output(out);
        assert_eq!(result.total_tests, 3);
        assert_eq!(result.passed, 1);
        assert_eq!(result.failed, 2);
    }

    #[test]
    fn group_not_defined_is_a_harness_failure_not_zero_tests_passed() {
        let out = "\n=== fstests Output ===\nGroup \"btrfs/010\" is empty or not defined?\n\n=== fstests Execution Complete ===\nExit code: 1\n";
        let result = parse_check_output(out);
        assert!(!result.success);
        assert_eq!(result.total_tests, 0);
    }

    #[test]
    fn invalid_option_is_a_harness_failure() {
        let out = "check: invalid option -- 'z'\nUsage: check [options]\n";
        let result = parse_check_output(out);
        assert!(!result.success);
        assert_eq!(result.total_tests, 0);
    }

    #[test]
    fn plain_passed_run_without_kernel_version_header() {
        let out = "btrfs/010 5s\ngeneric/001 3s\nRan: 2 tests in 8s\n";
        let result = parse_check_output(out);
        assert!(result.success);
        assert_eq!(result.total_tests, 2);
        assert_eq!(result.passed, 2);
    }

    #[test]
    fn parse_check_log_file_reads_and_tags_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("check.log");
        std::fs::write(&path, "generic/001 5s\nRan: 1 tests in 5s\n").unwrap();
        let result = parse_check_log_file(&path).unwrap();
        assert_eq!(result.total_tests, 1);
        assert_eq!(result.check_log.as_deref(), Some(path.as_path()));
    }
}
