//! State Store: the cross-process ledger of live LV allocations.
//!
//! Every kdev instance on a host shares one `lv-state.json`, guarded by
//! an advisory file lock so two instances allocating volumes at the
//! same time don't clobber each other's writes. An allocation outlives
//! the process that requested it only until [`cleanup_orphaned_volumes`]
//! notices the allocator's pid is gone.

use anyhow::{Context, Result};
use fs2::FileExt;
use kdev_core::model::VolumeAllocation;
use kdev_exec::{Exec, ExecRequest};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    allocations: Vec<VolumeAllocation>,
}

pub struct VolumeStateStore {
    path: PathBuf,
}

impl VolumeStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<StateFile> {
        if !self.path.exists() {
            return Ok(StateFile::default());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("failed to open state store {}", self.path.display()))?;
        file.lock_shared().context("failed to acquire shared lock on state store")?;
        let data = std::fs::read(&self.path);
        FileExt::unlock(&file).ok();
        let data = data.with_context(|| format!("failed to read state store {}", self.path.display()))?;
        match serde_json::from_slice(&data) {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "state store is corrupt, treating as empty"
                );
                Ok(StateFile::default())
            }
        }
    }

    fn save(&self, state: &StateFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            tmp.lock_exclusive().context("failed to acquire exclusive lock on state store tmp file")?;
            let json = serde_json::to_vec_pretty(state).context("failed to serialize state store")?;
            let write_result = tmp.write_all(&json).and_then(|_| tmp.sync_all());
            FileExt::unlock(&tmp).ok();
            write_result.with_context(|| format!("failed to write {}", tmp_path.display()))?;
        }
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace state store {}", self.path.display()))?;
        Ok(())
    }

    pub fn register_allocation(&self, allocation: VolumeAllocation) -> Result<()> {
        let mut state = self.load()?;
        tracing::info!(lv = %allocation.lv_name, pid = allocation.allocator_pid, "registered allocation");
        state.allocations.push(allocation);
        self.save(&state)
    }

    pub fn unregister_allocation(&self, lv_name: &str) -> Result<()> {
        let mut state = self.load()?;
        state.allocations.retain(|a| a.lv_name != lv_name);
        self.save(&state)?;
        tracing::info!(lv = %lv_name, "unregistered allocation");
        Ok(())
    }

    pub fn allocations_for_session(&self, session_id: &str) -> Result<Vec<VolumeAllocation>> {
        let state = self.load()?;
        Ok(state
            .allocations
            .into_iter()
            .filter(|a| a.session_id == session_id)
            .collect())
    }

    /// Remove allocations from `pool_name` whose allocating process is
    /// no longer alive, calling `lvremove` on each. Allocations whose
    /// LV removal fails are kept in the store so a future sweep can
    /// retry.
    pub fn cleanup_orphaned_volumes(&self, exec: &dyn Exec, pool_name: &str) -> Result<Vec<String>> {
        let mut state = self.load()?;
        let mut cleaned = Vec::new();
        let mut remaining = Vec::with_capacity(state.allocations.len());

        for alloc in state.allocations.drain(..) {
            if alloc.pool_name != pool_name {
                remaining.push(alloc);
                continue;
            }
            if process_alive(alloc.allocator_pid) {
                remaining.push(alloc);
                continue;
            }

            tracing::info!(lv = %alloc.lv_name, pid = alloc.allocator_pid, "cleaning up orphaned LV from dead process");
            match exec.exec(
                &ExecRequest::new(["sudo", "lvremove", "-f", &alloc.lv_path])
                    .with_timeout(Duration::from_secs(30)),
            ) {
                Ok(out) if out.success() => cleaned.push(alloc.lv_name),
                Ok(out) => {
                    tracing::error!(lv = %alloc.lv_name, stderr = %out.stderr_string(), "failed to remove orphaned LV");
                    remaining.push(alloc);
                }
                Err(e) => {
                    tracing::error!(lv = %alloc.lv_name, error = %e, "failed to remove orphaned LV");
                    remaining.push(alloc);
                }
            }
        }

        state.allocations = remaining;
        self.save(&state)?;
        Ok(cleaned)
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 sends no signal, only checks existence/permission.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdev_core::model::VolumeSpec;
    use kdev_exec::testing::{MockExec, MockResponse};

    fn alloc(lv_name: &str, pool: &str, pid: u32, session: &str) -> VolumeAllocation {
        VolumeAllocation {
            lv_name: lv_name.to_string(),
            lv_path: format!("/dev/vg/{lv_name}"),
            pool_name: pool.to_string(),
            vg_name: "vg".to_string(),
            spec: VolumeSpec {
                name: "test".to_string(),
                size: "10G".to_string(),
                order: 0,
                env_var: None,
            },
            allocator_pid: pid,
            allocated_at: "2026-01-01T00:00:00Z".to_string(),
            session_id: session.to_string(),
        }
    }

    #[test]
    fn register_then_get_by_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = VolumeStateStore::new(dir.path().join("lv-state.json"));
        store.register_allocation(alloc("kdev-1-test", "fstests", 1, "sess-a")).unwrap();
        store.register_allocation(alloc("kdev-2-test", "fstests", 1, "sess-b")).unwrap();

        let sess_a = store.allocations_for_session("sess-a").unwrap();
        assert_eq!(sess_a.len(), 1);
        assert_eq!(sess_a[0].lv_name, "kdev-1-test");
    }

    #[test]
    fn unregister_removes_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let store = VolumeStateStore::new(dir.path().join("lv-state.json"));
        store.register_allocation(alloc("kdev-1-test", "fstests", 1, "sess-a")).unwrap();
        store.unregister_allocation("kdev-1-test").unwrap();
        assert!(store.allocations_for_session("sess-a").unwrap().is_empty());
    }

    #[test]
    fn cleanup_skips_live_process_and_removes_dead_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = VolumeStateStore::new(dir.path().join("lv-state.json"));
        // pid 1 (init) is always alive on a real system; a pid this
        // high is virtually guaranteed not to exist.
        store.register_allocation(alloc("kdev-live", "fstests", 1, "sess-a")).unwrap();
        store.register_allocation(alloc("kdev-dead", "fstests", 999_999, "sess-b")).unwrap();

        let exec = MockExec::new();
        exec.on(["sudo", "lvremove"], MockResponse::ok(""));

        let cleaned = store.cleanup_orphaned_volumes(&exec, "fstests").unwrap();
        assert_eq!(cleaned, vec!["kdev-dead".to_string()]);
        assert_eq!(store.allocations_for_session("sess-a").unwrap().len(), 1);
        assert!(store.allocations_for_session("sess-b").unwrap().is_empty());
    }

    #[test]
    fn corrupt_state_file_is_treated_as_empty_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lv-state.json");
        std::fs::write(&path, b"not valid json{{{").unwrap();
        let store = VolumeStateStore::new(&path);

        assert!(store.allocations_for_session("sess-a").unwrap().is_empty());
        store.register_allocation(alloc("kdev-1-test", "fstests", 1, "sess-a")).unwrap();
        assert_eq!(store.allocations_for_session("sess-a").unwrap().len(), 1);
    }

    #[test]
    fn cleanup_ignores_other_pools() {
        let dir = tempfile::tempdir().unwrap();
        let store = VolumeStateStore::new(dir.path().join("lv-state.json"));
        store.register_allocation(alloc("kdev-other", "other-pool", 999_999, "sess-c")).unwrap();

        let exec = MockExec::new();
        let cleaned = store.cleanup_orphaned_volumes(&exec, "fstests").unwrap();
        assert!(cleaned.is_empty());
        assert_eq!(store.allocations_for_session("sess-c").unwrap().len(), 1);
    }
}
