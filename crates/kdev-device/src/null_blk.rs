//! RAM-backed block devices via the kernel's `null_blk` configfs
//! interface (`/sys/kernel/config/nullb/…`).
//!
//! Index allocation relies on `mkdir` itself acting as the lock: the
//! first caller to successfully create `nullb{i}` owns that index,
//! with no separate coordination needed even across sibling service
//! instances.

use anyhow::{Result, bail};
use kdev_core::KdevError;
use kdev_exec::{Exec, ExecRequest};
use std::path::Path;
use std::time::{Duration, Instant};

const NULLB_CONFIGFS_DIR: &str = "/sys/kernel/config/nullb";
const DEVICE_APPEAR_ATTEMPTS: u32 = 20;
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of probing whether this host can create `null_blk` devices.
/// Probing is relatively expensive (a module load attempt, a configfs
/// round-trip); callers that probe once per service instance should
/// cache the result themselves rather than calling this repeatedly.
#[derive(Debug, Clone)]
pub struct NullBlkSupport {
    pub supported: bool,
    pub message: String,
}

pub fn probe_support(exec: &dyn Exec) -> NullBlkSupport {
    if !Path::new("/sys/module/null_blk").exists() {
        match exec.exec(
            &ExecRequest::new(["modprobe", "null_blk"])
                .sudo_if_enabled()
                .with_timeout(Duration::from_secs(10)),
        ) {
            Ok(out) if out.success() => {}
            Ok(out) => {
                return NullBlkSupport {
                    supported: false,
                    message: format!("null_blk module not available: {}", out.stderr_string()),
                };
            }
            Err(e) => {
                return NullBlkSupport {
                    supported: false,
                    message: format!("failed to load null_blk module: {e}"),
                };
            }
        }
    }

    if !Path::new("/sys/kernel/config").exists() {
        return NullBlkSupport {
            supported: false,
            message: "configfs not mounted at /sys/kernel/config".to_string(),
        };
    }
    if !Path::new(NULLB_CONFIGFS_DIR).exists() {
        return NullBlkSupport {
            supported: false,
            message: format!("{NULLB_CONFIGFS_DIR} does not exist"),
        };
    }

    let probe_dir = format!("{NULLB_CONFIGFS_DIR}/kdev-probe");
    match exec.exec(
        &ExecRequest::new(["mkdir", &probe_dir])
            .sudo_if_enabled()
            .with_timeout(Duration::from_secs(5)),
    ) {
        Ok(out) if out.success() => {
            let _ = exec.exec(
                &ExecRequest::new(["rmdir", &probe_dir])
                    .sudo_if_enabled()
                    .with_timeout(Duration::from_secs(5)),
            );
            NullBlkSupport { supported: true, message: "null_blk is available".to_string() }
        }
        Ok(out) => NullBlkSupport {
            supported: false,
            message: format!("cannot create null_blk devices: {}", out.stderr_string()),
        },
        Err(e) => NullBlkSupport {
            supported: false,
            message: format!("cannot create null_blk devices: {e}"),
        },
    }
}

fn allocate_index(exec: &dyn Exec) -> Option<u32> {
    for idx in 0..kdev_core::limits::MAX_NULL_BLK_INDEX {
        let dir = format!("{NULLB_CONFIGFS_DIR}/nullb{idx}");
        match exec.exec(
            &ExecRequest::new(["mkdir", &dir]).sudo_if_enabled().with_timeout(Duration::from_secs(5)),
        ) {
            Ok(out) if out.success() => return Some(idx),
            _ => continue,
        }
    }
    None
}

fn write_attr(exec: &dyn Exec, path: &str, value: &str) -> Result<()> {
    exec.exec_checked(
        &ExecRequest::new(["sh", "-c", &format!("echo {value} > {path}")])
            .sudo_if_enabled()
            .with_timeout(Duration::from_secs(5)),
    )?;
    Ok(())
}

/// Advisory knobs whose failure must never abort device creation.
fn write_attr_optional(exec: &dyn Exec, path: &str, value: &str) {
    if let Err(e) = write_attr(exec, path, value) {
        tracing::warn!(path = %path, error = %e, "optional null_blk parameter failed, proceeding");
    }
}

fn wait_for(path: &str, want_present: bool) -> bool {
    let deadline = Instant::now() + DEVICE_APPEAR_ATTEMPTS * DEVICE_POLL_INTERVAL;
    loop {
        if Path::new(path).exists() == want_present {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(DEVICE_POLL_INTERVAL);
    }
}

/// Optional advisory knobs for [`create_device`].
#[derive(Debug, Clone, Default)]
pub struct NullBlkOptions {
    pub blocksize: Option<u32>,
    pub hw_queue_depth: Option<u32>,
    pub irqmode: Option<u32>,
    pub completion_nsec: Option<u32>,
}

/// Create a `null_blk` device of `size` (parsed via
/// `kdev_core::naming::parse_size_mib`), enforcing the per-device cap.
/// `name` is used only for logging; it has no bearing on the kernel
/// index assigned. Rolls back everything created so far on any
/// required-attribute failure.
pub fn create_device(
    exec: &dyn Exec,
    size: &str,
    name: &str,
    options: &NullBlkOptions,
) -> Result<(String, u32)> {
    let size_mib = kdev_core::naming::parse_size_mib(size)
        .map_err(|e| KdevError::Validation(e.to_string()))?;
    let cap_mib = kdev_core::limits::max_null_blk_device_gib() * 1024;
    if size_mib > cap_mib {
        return Err(KdevError::Resource(format!(
            "null_blk device size {size_mib} MiB exceeds per-device cap {cap_mib} MiB"
        ))
        .into());
    }

    let idx = allocate_index(exec)
        .ok_or_else(|| KdevError::Resource("no free null_blk index in [0, 1024)".to_string()))?;
    let dir = format!("{NULLB_CONFIGFS_DIR}/nullb{idx}");
    tracing::info!(name = %name, index = idx, size_mib, "creating null_blk device");

    let configure: Result<()> = (|| {
        write_attr(exec, &format!("{dir}/size"), &size_mib.to_string())?;
        write_attr(exec, &format!("{dir}/memory_backed"), "1")?;
        if let Some(bs) = options.blocksize {
            write_attr_optional(exec, &format!("{dir}/blocksize"), &bs.to_string());
        }
        if let Some(q) = options.hw_queue_depth {
            write_attr_optional(exec, &format!("{dir}/hw_queue_depth"), &q.to_string());
        }
        if let Some(m) = options.irqmode {
            write_attr_optional(exec, &format!("{dir}/irqmode"), &m.to_string());
        }
        if let Some(ns) = options.completion_nsec {
            write_attr_optional(exec, &format!("{dir}/completion_nsec"), &ns.to_string());
        }
        write_attr(exec, &format!("{dir}/power"), "1")?;
        Ok(())
    })();

    if let Err(e) = configure {
        let _ = exec.exec(&ExecRequest::new(["rmdir", &dir]).sudo_if_enabled().with_timeout(Duration::from_secs(5)));
        return Err(e.context(format!("failed to configure null_blk device nullb{idx}")));
    }

    let dev_path = format!("/dev/nullb{idx}");
    if !wait_for(&dev_path, true) {
        cleanup_device(exec, &dev_path, idx);
        bail!("null_blk device {dev_path} did not appear after activation");
    }

    if let Err(e) = exec.exec_checked(
        &ExecRequest::new(["chmod", "0666", &dev_path])
            .sudo_if_enabled()
            .with_timeout(Duration::from_secs(5)),
    ) {
        cleanup_device(exec, &dev_path, idx);
        return Err(e.context("failed to chmod null_blk device"));
    }

    tracing::info!(device = %dev_path, "null_blk device ready");
    Ok((dev_path, idx))
}

/// Tear down a `null_blk` device: power off, wait for the device node
/// to disappear, `rmdir` the configfs entry. Idempotent — a
/// already-removed directory is treated as success.
pub fn cleanup_device(exec: &dyn Exec, dev_path: &str, idx: u32) -> bool {
    let dir = format!("{NULLB_CONFIGFS_DIR}/nullb{idx}");
    if !Path::new(&dir).exists() {
        return !Path::new(dev_path).exists();
    }

    let _ = write_attr(exec, &format!("{dir}/power"), "0");
    wait_for(dev_path, false);

    match exec.exec(&ExecRequest::new(["rmdir", &dir]).sudo_if_enabled().with_timeout(Duration::from_secs(5))) {
        Ok(out) if out.success() => true,
        Ok(out) => {
            tracing::error!(dir = %dir, stderr = %out.stderr_string(), "failed to rmdir null_blk configfs entry");
            false
        }
        Err(e) => {
            tracing::error!(dir = %dir, error = %e, "failed to rmdir null_blk configfs entry");
            false
        }
    }
}

/// Remove `nullb*` configfs entries whose directory `mtime` is older
/// than `staleness`. Returns the count removed. A device created by a
/// sibling instance moments ago is protected by the staleness window.
pub fn cleanup_orphaned(exec: &dyn Exec, staleness: Duration) -> usize {
    let root = Path::new(NULLB_CONFIGFS_DIR);
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };

    let mut cleaned = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(idx) = name.strip_prefix("nullb").and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(meta) = entry.metadata() else { continue };
        let Some(age) = meta.modified().ok().and_then(|m| m.elapsed().ok()) else {
            continue;
        };
        if age < staleness {
            continue;
        }

        let dev_path = format!("/dev/{name}");
        tracing::info!(device = %dev_path, age_secs = age.as_secs(), "sweeping orphaned null_blk device");
        if cleanup_device(exec, &dev_path, idx) {
            cleaned += 1;
        }
    }
    cleaned
}
