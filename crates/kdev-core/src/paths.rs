//! On-disk layout: per-user config directory, baseline store, and
//! per-service-instance scratch/tracking directories.

use std::path::PathBuf;

/// Resolved filesystem layout for one invocation of the service.
///
/// `instance_pid` distinguishes sibling service instances running on
/// the same host (each gets its own boot-log directory and process
/// registry file so they never collide).
#[derive(Debug, Clone)]
pub struct KdevPaths {
    home: PathBuf,
    instance_pid: u32,
}

impl KdevPaths {
    /// Resolve from `$KDEV_HOME`, defaulting to `~/.kerneldev-mcp`.
    pub fn resolve(instance_pid: u32) -> Self {
        let home = std::env::var_os("KDEV_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let base = std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"));
                base.join(".kerneldev-mcp")
            });
        Self { home, instance_pid }
    }

    /// Override root directly; used by tests to root everything under
    /// a `tempfile::TempDir`.
    pub fn rooted_at(home: PathBuf, instance_pid: u32) -> Self {
        Self { home, instance_pid }
    }

    pub fn home(&self) -> &std::path::Path {
        &self.home
    }

    /// Pool config catalog: `device-pool.json`.
    pub fn pool_config_path(&self) -> PathBuf {
        self.home.join("device-pool.json")
    }

    /// State Store document: `lv-state.json`.
    pub fn state_store_path(&self) -> PathBuf {
        self.home.join("lv-state.json")
    }

    /// Baseline store root: one subdirectory per baseline.
    pub fn baselines_dir(&self) -> PathBuf {
        self.home.join("fstests-baselines")
    }

    pub fn baseline_dir(&self, name: &str) -> PathBuf {
        self.baselines_dir().join(sanitize_name(name))
    }

    /// Per-service-instance scratch directory for loop backing files
    /// and boot logs.
    pub fn instance_scratch_dir(&self) -> PathBuf {
        std::env::temp_dir()
            .join("kerneldev-mcp")
            .join(format!("instance-{}", self.instance_pid))
    }

    pub fn loop_backing_dir(&self) -> PathBuf {
        self.instance_scratch_dir().join("loop")
    }

    pub fn boot_log_dir(&self) -> PathBuf {
        self.instance_scratch_dir().join("logs")
    }

    /// Process Registry tracking file: `vm-pids-{instance_pid}.json`.
    pub fn process_registry_path(&self) -> PathBuf {
        self.instance_scratch_dir()
            .join(format!("vm-pids-{}.json", self.instance_pid))
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_and_state_store_share_home() {
        let paths = KdevPaths::rooted_at(PathBuf::from("/tmp/kdev-test"), 42);
        assert_eq!(paths.pool_config_path(), PathBuf::from("/tmp/kdev-test/device-pool.json"));
        assert_eq!(paths.state_store_path(), PathBuf::from("/tmp/kdev-test/lv-state.json"));
    }

    #[test]
    fn process_registry_embeds_instance_pid() {
        let paths = KdevPaths::rooted_at(PathBuf::from("/tmp/kdev-test"), 1234);
        assert!(paths
            .process_registry_path()
            .to_string_lossy()
            .ends_with("vm-pids-1234.json"));
    }

    #[test]
    fn baseline_dir_sanitizes_unsafe_characters() {
        let paths = KdevPaths::rooted_at(PathBuf::from("/tmp/kdev-test"), 1);
        let dir = paths.baseline_dir("my baseline/v2");
        assert!(dir.to_string_lossy().ends_with("my_baseline_v2"));
    }
}
