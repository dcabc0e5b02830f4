//! VM Runner: PTY-backed spawn of the VM binary, timeout-bounded
//! output capture, and classification of the resulting boot log.
//!
//! The VM binary refuses to start without a controlling TTY (see
//! [`kdev_exec::pty`]), so every run goes through a PTY pair rather
//! than a pipe. Output is drained on a fixed poll interval into both
//! an in-memory buffer and a rotating log file; a deadline (wall-clock
//! timeout or an external cancellation) kills the whole process group
//! and the run is still reported, not discarded.

use crate::dmesg;
use crate::process_registry::{ProcessRegistry, VmRegistration};
use anyhow::{Context, Result};
use kdev_core::model::BootResult;
use kdev_exec::pty::{DEFAULT_POLL_INTERVAL, PtyChild};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// One VM invocation request.
pub struct RunSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    pub log_path: PathBuf,
    pub description: String,
}

/// Shared flag a caller can set to request early cancellation of a
/// run in progress, checked on the same cadence as the deadline.
#[derive(Clone, Default)]
pub struct CancelToken(std::sync::Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn extract_kernel_version(raw_log: &str) -> Option<String> {
    raw_log.lines().find_map(|line| {
        let idx = line.find("Linux version ")?;
        let rest = &line[idx + "Linux version ".len()..];
        rest.split_whitespace().next().map(|s| s.to_string())
    })
}

pub struct VmRunner<'a> {
    registry: &'a ProcessRegistry,
    poll_interval: Duration,
}

impl<'a> VmRunner<'a> {
    pub fn new(registry: &'a ProcessRegistry) -> Self {
        Self { registry, poll_interval: DEFAULT_POLL_INTERVAL }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Spawn `spec.argv` under a PTY, stream its output to
    /// `spec.log_path` until it exits or `spec.timeout`/`cancel`
    /// fires, then classify the captured log.
    #[tracing::instrument(skip_all, fields(description = %spec.description, timeout_secs = spec.timeout.as_secs()))]
    pub fn run(&self, spec: &RunSpec, cancel: &CancelToken) -> Result<BootResult> {
        if let Some(parent) = spec.log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut log_file = std::fs::File::create(&spec.log_path)
            .with_context(|| format!("failed to create boot log {}", spec.log_path.display()))?;

        tracing::info!(argv = ?spec.argv, log = %spec.log_path.display(), "spawning VM under PTY");
        let child = PtyChild::spawn(&spec.argv, spec.cwd.as_deref())
            .context("failed to spawn VM under PTY")?;

        self.registry
            .register(VmRegistration {
                pid: child.pid.as_raw(),
                pgid: child.pid.as_raw(),
                description: spec.description.clone(),
                log_file_path: spec.log_path.clone(),
                started_at: kdev_core::time::utc_now(),
            })
            .context("failed to register VM in process registry")?;

        let start = Instant::now();
        let deadline = start + spec.timeout;
        let mut buffer: Vec<u8> = Vec::new();
        let mut timeout_occurred = false;
        let mut guest_exit_status = None;

        loop {
            let chunk = child.drain();
            if !chunk.is_empty() {
                buffer.extend_from_slice(&chunk);
                let _ = log_file.write_all(&chunk);
            }

            match child.try_wait() {
                Ok(Some(code)) => {
                    guest_exit_status = Some(code);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to poll VM child status");
                }
            }

            if Instant::now() >= deadline {
                tracing::warn!(description = %spec.description, "VM run exceeded deadline, killing process group");
                timeout_occurred = true;
                let _ = child.kill_group();
                break;
            }
            if cancel.is_cancelled() {
                tracing::warn!(description = %spec.description, "VM run cancelled, killing process group");
                let _ = child.kill_group();
                break;
            }

            std::thread::sleep(self.poll_interval);
        }

        // Final best-effort drain pass: the child may have buffered a
        // last burst of output between the last read and its exit.
        for _ in 0..3 {
            let chunk = child.drain();
            if chunk.is_empty() {
                break;
            }
            buffer.extend_from_slice(&chunk);
            let _ = log_file.write_all(&chunk);
        }
        let _ = log_file.sync_all();

        let _ = self.registry.unregister(child.pid.as_raw());

        let raw_log = String::from_utf8_lossy(&buffer).to_string();
        let classified = dmesg::classify(&raw_log);
        let duration_secs = start.elapsed().as_secs_f64();
        let boot_completed = !timeout_occurred && guest_exit_status == Some(0);

        tracing::info!(
            duration_secs,
            timeout_occurred,
            panics = classified.panics.len(),
            oops = classified.oops.len(),
            "VM run finished"
        );

        Ok(BootResult {
            boot_completed,
            duration_secs,
            kernel_version: extract_kernel_version(&raw_log),
            panics: classified.panics,
            oops: classified.oops,
            errors: classified.errors,
            warnings: classified.warnings,
            raw_log,
            guest_exit_status,
            timeout_occurred,
        })
    }
}

/// Read the tail of a rotating boot log file, renaming its
/// `-running` suffix away once the run it belongs to has finished.
/// Idempotent: a log already renamed is left alone.
pub fn finalize_log_name(log_path: &Path) -> PathBuf {
    let name = log_path.to_string_lossy();
    if let Some(stripped) = name.strip_suffix("-running.log") {
        let finalized = PathBuf::from(format!("{stripped}.log"));
        if std::fs::rename(log_path, &finalized).is_ok() {
            return finalized;
        }
    }
    log_path.to_path_buf()
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    fn registry(dir: &std::path::Path) -> ProcessRegistry {
        ProcessRegistry::for_service_pid(dir, std::process::id())
    }

    #[test]
    fn clean_exit_produces_boot_completed_result() {
        let dir = tempfile::tempdir().unwrap();
        let runner = VmRunner::new(&registry(dir.path()));
        let spec = RunSpec {
            argv: vec!["sh".into(), "-c".into(), "echo Linux version 6.16.0-test; exit 0".into()],
            cwd: None,
            timeout: Duration::from_secs(5),
            log_path: dir.path().join("boot.log"),
            description: "clean exit".into(),
        };
        let result = runner.run(&spec, &CancelToken::new()).unwrap();
        assert!(result.boot_completed);
        assert!(!result.timeout_occurred);
        assert_eq!(result.guest_exit_status, Some(0));
        assert_eq!(result.kernel_version.as_deref(), Some("6.16.0-test"));
    }

    #[test]
    fn nonzero_exit_is_not_boot_completed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = VmRunner::new(&registry(dir.path()));
        let spec = RunSpec {
            argv: vec!["sh".into(), "-c".into(), "exit 3".into()],
            cwd: None,
            timeout: Duration::from_secs(5),
            log_path: dir.path().join("boot.log"),
            description: "nonzero exit".into(),
        };
        let result = runner.run(&spec, &CancelToken::new()).unwrap();
        assert!(!result.boot_completed);
        assert_eq!(result.guest_exit_status, Some(3));
    }

    #[test]
    fn hang_is_killed_on_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let runner = VmRunner::new(&registry(dir.path())).with_poll_interval(Duration::from_millis(20));
        let spec = RunSpec {
            argv: vec!["sh".into(), "-c".into(), "while true; do sleep 1; done".into()],
            cwd: None,
            timeout: Duration::from_millis(200),
            log_path: dir.path().join("boot.log"),
            description: "hang".into(),
        };
        let start = Instant::now();
        let result = runner.run(&spec, &CancelToken::new()).unwrap();
        assert!(result.timeout_occurred);
        assert!(!result.boot_completed);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(registry(dir.path()).list().unwrap().is_empty());
    }

    #[test]
    fn cancellation_kills_the_run_before_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let runner = VmRunner::new(&registry(dir.path())).with_poll_interval(Duration::from_millis(20));
        let cancel = CancelToken::new();
        let spec = RunSpec {
            argv: vec!["sh".into(), "-c".into(), "while true; do sleep 1; done".into()],
            cwd: None,
            timeout: Duration::from_secs(30),
            log_path: dir.path().join("boot.log"),
            description: "cancel-me".into(),
        };

        let cancel_clone = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            cancel_clone.cancel();
        });

        let start = Instant::now();
        let result = runner.run(&spec, &cancel).unwrap();
        assert!(!result.timeout_occurred);
        assert!(!result.boot_completed);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn output_is_captured_and_written_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = VmRunner::new(&registry(dir.path()));
        let log_path = dir.path().join("boot.log");
        let spec = RunSpec {
            argv: vec!["sh".into(), "-c".into(), "echo hello-from-guest".into()],
            cwd: None,
            timeout: Duration::from_secs(5),
            log_path: log_path.clone(),
            description: "output capture".into(),
        };
        let result = runner.run(&spec, &CancelToken::new()).unwrap();
        assert!(result.raw_log.contains("hello-from-guest"));
        let on_disk = std::fs::read_to_string(&log_path).unwrap();
        assert!(on_disk.contains("hello-from-guest"));
    }

    #[test]
    fn finalize_log_name_strips_running_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let running = dir.path().join("boot-20260101000000-running.log");
        std::fs::write(&running, "x").unwrap();
        let finalized = finalize_log_name(&running);
        assert_eq!(finalized, dir.path().join("boot-20260101000000.log"));
        assert!(finalized.exists());
    }

    #[test]
    fn finalize_log_name_is_idempotent_on_already_finalized_path() {
        let dir = tempfile::tempdir().unwrap();
        let already = dir.path().join("boot-20260101000000.log");
        std::fs::write(&already, "x").unwrap();
        assert_eq!(finalize_log_name(&already), already);
    }
}
