//! Persists fstests run results under a dedicated git-notes ref
//! (`refs/notes/fstests`) so results travel with the commit that
//! produced them instead of living only in the local baseline store.

use anyhow::{Context, Result, bail};
use kdev_core::model::GitNoteRecord;
use kdev_exec::{Exec, exec::ExecRequest};
use std::path::Path;

const NOTES_REF: &str = "refs/notes/fstests";

/// Reads and writes fstests results under [`NOTES_REF`] in a git
/// worktree, via the injected [`Exec`].
pub struct GitNotesStore<'a> {
    exec: &'a dyn Exec,
    repo_dir: std::path::PathBuf,
}

impl<'a> GitNotesStore<'a> {
    pub fn new(exec: &'a dyn Exec, repo_dir: impl Into<std::path::PathBuf>) -> Self {
        Self { exec, repo_dir: repo_dir.into() }
    }

    fn git(&self, args: &[&str]) -> ExecRequest {
        let argv: Vec<String> =
            std::iter::once("git".to_string()).chain(args.iter().map(|s| s.to_string())).collect();
        ExecRequest::new(argv).with_cwd(&self.repo_dir)
    }

    pub fn is_git_repo(&self) -> bool {
        self.exec.exec(&self.git(&["rev-parse", "--git-dir"])).map(|o| o.success()).unwrap_or(false)
    }

    pub fn current_commit(&self) -> Result<String> {
        let out = self.exec.exec_checked(&self.git(&["rev-parse", "HEAD"]))?;
        Ok(out.stdout_string())
    }

    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.exec.exec(&self.git(&["symbolic-ref", "--short", "HEAD"]))?;
        if !out.success() {
            return Ok(None);
        }
        Ok(Some(out.stdout_string()))
    }

    /// Save `record` under `commit` (defaulting to `HEAD`), overwriting
    /// any note already present there.
    pub fn save(&self, commit: Option<&str>, record: &GitNoteRecord) -> Result<()> {
        if !self.is_git_repo() {
            bail!("{} is not a git repository", self.repo_dir.display());
        }
        let target = match commit {
            Some(c) => c.to_string(),
            None => self.current_commit()?,
        };
        let json = serde_json::to_string(record).context("failed to serialize git note record")?;
        self.exec
            .exec_checked(&self.git(&["notes", "--ref", NOTES_REF, "add", "-f", "-m", &json, &target]))
            .with_context(|| format!("failed to save fstests note on {target}"))?;
        tracing::info!(commit = %target, "saved fstests results as git note");
        Ok(())
    }

    /// Load the note attached to `commit`, or `None` if it has none.
    pub fn load(&self, commit: &str) -> Result<Option<GitNoteRecord>> {
        let out = self.exec.exec(&self.git(&["notes", "--ref", NOTES_REF, "show", commit]))?;
        if !out.success() {
            return Ok(None);
        }
        let record: GitNoteRecord = serde_json::from_str(&out.stdout_string())
            .with_context(|| format!("failed to parse fstests note on {commit}"))?;
        Ok(Some(record))
    }

    /// Returns `true` if a note existed on `commit` and was removed.
    pub fn delete(&self, commit: &str) -> Result<bool> {
        if self.load(commit)?.is_none() {
            return Ok(false);
        }
        self.exec
            .exec_checked(&self.git(&["notes", "--ref", NOTES_REF, "remove", commit]))
            .with_context(|| format!("failed to remove fstests note on {commit}"))?;
        Ok(true)
    }

    /// List every commit with a note, most recent first, capped at
    /// `max_count`.
    pub fn list_commits(&self, max_count: usize) -> Result<Vec<GitNoteRecord>> {
        let out = self.exec.exec(&self.git(&["notes", "--ref", NOTES_REF, "list"]))?;
        if !out.success() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for line in out.stdout_string().lines() {
            let mut parts = line.split_whitespace();
            let (Some(_note_sha), Some(object_sha)) = (parts.next(), parts.next()) else {
                continue;
            };
            if let Some(record) = self.load(object_sha)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.metadata.created_at.cmp(&a.metadata.created_at));
        records.truncate(max_count);
        Ok(records)
    }
}

pub fn looks_like_git_repo(dir: &Path) -> bool {
    dir.join(".git").exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdev_core::model::{GitNoteMetadata, RunResult};
    use kdev_exec::testing::{MockExec, MockResponse};

    fn record() -> GitNoteRecord {
        GitNoteRecord {
            metadata: GitNoteMetadata {
                commit_sha: "abc123".to_string(),
                branch_name: Some("main".to_string()),
                kernel_version: Some("6.16.0".to_string()),
                fstype: Some("xfs".to_string()),
                test_selection: Some("-g quick".to_string()),
                created_at: "2026-01-01T00:00:00Z".to_string(),
            },
            results: RunResult {
                success: true,
                total_tests: 1,
                passed: 1,
                failed: 0,
                notrun: 0,
                duration_secs: Some(5.0),
                test_results: Vec::new(),
                check_log: None,
            },
        }
    }

    #[test]
    fn save_rejects_non_git_directories() {
        let exec = MockExec::new();
        exec.on(["git", "rev-parse", "--git-dir"], MockResponse::failure(128, "not a git repository"));
        let store = GitNotesStore::new(&exec, "/tmp");
        let err = store.save(Some("abc123"), &record()).unwrap_err();
        assert!(err.to_string().contains("not a git repository"));
    }

    #[test]
    fn save_uses_head_when_no_commit_given() {
        let exec = MockExec::new();
        exec.on(["git", "rev-parse", "--git-dir"], MockResponse::ok(".git\n"));
        exec.on(["git", "rev-parse", "HEAD"], MockResponse::ok("deadbeef\n"));
        exec.on(["git", "notes"], MockResponse::ok(""));
        let store = GitNotesStore::new(&exec, "/tmp/repo");
        store.save(None, &record()).unwrap();

        let calls = exec.calls();
        let notes_call = calls.iter().find(|c| c.contains(&"notes".to_string())).unwrap();
        assert!(notes_call.contains(&"deadbeef".to_string()));
    }

    #[test]
    fn load_returns_none_when_note_missing() {
        let exec = MockExec::new();
        exec.on(["git", "notes"], MockResponse::failure(1, "no note found"));
        let store = GitNotesStore::new(&exec, "/tmp/repo");
        assert!(store.load("abc123").unwrap().is_none());
    }

    #[test]
    fn load_parses_saved_json() {
        let exec = MockExec::new();
        let json = serde_json::to_string(&record()).unwrap();
        exec.on(["git", "notes", "--ref", NOTES_REF, "show"], MockResponse::ok(json));
        let store = GitNotesStore::new(&exec, "/tmp/repo");
        let loaded = store.load("abc123").unwrap().unwrap();
        assert_eq!(loaded.metadata.commit_sha, "abc123");
    }

    #[test]
    fn delete_returns_false_when_nothing_to_remove() {
        let exec = MockExec::new();
        exec.on(["git", "notes"], MockResponse::failure(1, "no note found"));
        let store = GitNotesStore::new(&exec, "/tmp/repo");
        assert!(!store.delete("abc123").unwrap());
    }

    #[test]
    fn list_commits_parses_note_and_object_sha_pairs() {
        let exec = MockExec::new();
        let json = serde_json::to_string(&record()).unwrap();
        exec.on(["git", "notes", "--ref", NOTES_REF, "list"], MockResponse::ok("noteabc deadbeef\n"));
        exec.on(["git", "notes", "--ref", NOTES_REF, "show", "deadbeef"], MockResponse::ok(json));
        let store = GitNotesStore::new(&exec, "/tmp/repo");
        let records = store.list_commits(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metadata.commit_sha, "abc123");
    }
}
