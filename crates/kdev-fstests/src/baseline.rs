//! Baseline store: one directory per named baseline under
//! `fstests-baselines/`, each holding `baseline.json` and, when the
//! original `check.log` is still available, a copy of it alongside.
//!
//! Comparisons classify every test in a new run against the same test
//! name in a stored baseline: a test that now fails but passed in the
//! baseline is a regression, one that now passes but failed before is
//! an improvement, and so on.

use anyhow::{Context, Result};
use kdev_core::model::{Baseline, ComparisonResult, RunMetadata, RunResult, TestStatus};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Reads and writes the baseline store rooted at a `fstests-baselines`
/// directory (see [`kdev_core::paths::KdevPaths::baselines_dir`]).
pub struct BaselineStore {
    root: PathBuf,
}

impl BaselineStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir_for(&self, name: &str) -> PathBuf {
        self.root.join(sanitize_name(name))
    }

    /// Persist `result` as a named baseline, atomically rewriting its
    /// `baseline.json` and copying `result.check_log` alongside it
    /// when one is set.
    pub fn save(&self, name: &str, metadata: RunMetadata, result: RunResult) -> Result<()> {
        let dir = self.dir_for(name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create baseline dir {}", dir.display()))?;

        if let Some(log) = result.check_log.as_ref() {
            if log.exists() {
                std::fs::copy(log, dir.join("check.log")).with_context(|| {
                    format!("failed to copy check log {} into baseline", log.display())
                })?;
            }
        }

        let baseline = Baseline { name: name.to_string(), metadata, result };
        let path = dir.join("baseline.json");
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .context("failed to create temp file for baseline")?;
        let json = serde_json::to_vec_pretty(&baseline).context("failed to serialize baseline")?;
        tmp.write_all(&json).context("failed to write baseline")?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("failed to replace baseline {}", path.display()))?;

        tracing::info!(baseline = name, path = %path.display(), "saved baseline");
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Option<Baseline>> {
        let path = self.dir_for(name).join("baseline.json");
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path)
            .with_context(|| format!("failed to read baseline {}", path.display()))?;
        let baseline: Baseline = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse baseline {}", path.display()))?;
        Ok(Some(baseline))
    }

    /// List every stored baseline, most recently created first.
    pub fn list(&self) -> Result<Vec<Baseline>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut baselines = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("failed to list {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join("baseline.json");
            if !path.exists() {
                continue;
            }
            let data = std::fs::read(&path)
                .with_context(|| format!("failed to read baseline {}", path.display()))?;
            let baseline: Baseline = serde_json::from_slice(&data)
                .with_context(|| format!("failed to parse baseline {}", path.display()))?;
            baselines.push(baseline);
        }
        baselines.sort_by(|a, b| b.metadata.created_at.cmp(&a.metadata.created_at));
        Ok(baselines)
    }

    /// Returns `true` if the baseline existed and was removed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let dir = self.dir_for(name);
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to remove baseline dir {}", dir.display()))?;
        tracing::info!(baseline = name, "deleted baseline");
        Ok(true)
    }
}

/// Classify every test in `current` against its outcome in
/// `baseline`, if any. A test the baseline never ran is still counted
/// as a failure or not-run, but is not reported as a regression or
/// improvement since there is nothing to regress from.
pub fn compare(current: &RunResult, baseline: &RunResult) -> ComparisonResult {
    let baseline_status: BTreeMap<&str, TestStatus> = baseline
        .test_results
        .iter()
        .map(|t| (t.test_name.as_str(), t.status))
        .collect();

    let mut result = ComparisonResult {
        new_failures: Vec::new(),
        new_passes: Vec::new(),
        still_failing: Vec::new(),
        still_passing: Vec::new(),
        new_notrun: Vec::new(),
    };

    for test in &current.test_results {
        let name = test.test_name.as_str();
        match (test.status, baseline_status.get(name).copied()) {
            (TestStatus::Failed, Some(TestStatus::Passed)) => result.new_failures.push(name.to_string()),
            (TestStatus::Passed, Some(TestStatus::Failed)) => result.new_passes.push(name.to_string()),
            (TestStatus::Failed, Some(TestStatus::Failed)) => result.still_failing.push(name.to_string()),
            (TestStatus::Passed, Some(TestStatus::Passed)) => result.still_passing.push(name.to_string()),
            (TestStatus::NotRun, Some(status)) if status != TestStatus::NotRun => {
                result.new_notrun.push(name.to_string())
            }
            (TestStatus::Failed, None) => result.new_failures.push(name.to_string()),
            (TestStatus::NotRun, None) => result.new_notrun.push(name.to_string()),
            _ => {}
        }
    }

    result
}

/// Write the failed tests from `result` to `path` as a fstests
/// exclude-list file (one test name per line, behind comment-only
/// header lines) for use with `check -E`.
pub fn generate_exclude_list(result: &RunResult, path: &Path) -> Result<()> {
    let mut text = String::new();
    text.push_str("# Generated exclude list\n");
    text.push_str(&format!("# {} failing test(s)\n", result.failed));
    for test in &result.test_results {
        if test.status == TestStatus::Failed {
            text.push_str(&test.test_name);
            text.push('\n');
        }
    }
    std::fs::write(path, text)
        .with_context(|| format!("failed to write exclude list {}", path.display()))?;
    Ok(())
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
