//! Process Registry: per-service-instance tracking of every VM this
//! instance has spawned, so `kill_hanging_vms` can reap anything left
//! running after a crashed or killed dispatcher.
//!
//! The registry file embeds this instance's own pid in its name
//! (`vm-pids-{service_pid}.json`) so sibling instances never share or
//! contend over it — unlike the State Store, there is no cross-process
//! coordination here at all.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmRegistration {
    pub pid: i32,
    pub pgid: i32,
    pub description: String,
    pub log_file_path: PathBuf,
    pub started_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    entries: Vec<VmRegistration>,
}

/// Report on one VM killed by [`ProcessRegistry::kill_hanging_vms`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillReport {
    pub pid: i32,
    pub pgid: i32,
    pub description: String,
    pub log_tail: String,
}

pub struct ProcessRegistry {
    path: PathBuf,
}

impl ProcessRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Registry file for the service instance with pid `service_pid`,
    /// under `dir`.
    pub fn for_service_pid(dir: impl Into<PathBuf>, service_pid: u32) -> Self {
        let dir = dir.into();
        Self::new(dir.join(format!("vm-pids-{service_pid}.json")))
    }

    fn load(&self) -> Result<RegistryFile> {
        if !self.path.exists() {
            return Ok(RegistryFile::default());
        }
        let data = std::fs::read(&self.path)
            .with_context(|| format!("failed to read process registry {}", self.path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse process registry {}", self.path.display()))
    }

    fn save(&self, file: &RegistryFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp_path = self.path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(file).context("failed to serialize process registry")?;
        {
            let mut tmp = std::fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            tmp.write_all(&json).and_then(|_| tmp.sync_all())
                .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        }
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace process registry {}", self.path.display()))?;
        Ok(())
    }

    pub fn register(&self, registration: VmRegistration) -> Result<()> {
        let mut file = self.load()?;
        tracing::info!(pid = registration.pid, pgid = registration.pgid, "registered VM process");
        file.entries.push(registration);
        self.save(&file)
    }

    pub fn unregister(&self, pid: i32) -> Result<()> {
        let mut file = self.load()?;
        file.entries.retain(|e| e.pid != pid);
        self.save(&file)
    }

    pub fn list(&self) -> Result<Vec<VmRegistration>> {
        Ok(self.load()?.entries)
    }

    /// Kill every live registered VM's entire process group and drop
    /// it from the registry; dead entries are dropped silently. Logs
    /// tolerate invalid UTF-8.
    pub fn kill_hanging_vms(&self) -> Result<Vec<KillReport>> {
        let file = self.load()?;
        let mut reports = Vec::new();

        for entry in &file.entries {
            if !process_alive(entry.pid) {
                continue;
            }
            tracing::warn!(pid = entry.pid, pgid = entry.pgid, description = %entry.description, "killing hanging VM");
            // SAFETY: SIGKILL to a process group id, no shared state touched.
            unsafe {
                libc::killpg(entry.pgid, libc::SIGKILL);
            }
            reports.push(KillReport {
                pid: entry.pid,
                pgid: entry.pgid,
                description: entry.description.clone(),
                log_tail: read_log_tail(&entry.log_file_path, 50),
            });
        }

        self.save(&RegistryFile::default())?;
        Ok(reports)
    }
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    // SAFETY: signal 0 sends no signal, only checks existence/permission.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    true
}

fn read_log_tail(path: &Path, max_lines: usize) -> String {
    let Ok(bytes) = std::fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
