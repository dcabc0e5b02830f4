//! Loop-device-backed storage: sparse backing files attached via
//! `losetup`, used both standalone and as the fstests harness's
//! `test`/`scratch`/pool device triad.
//!
//! Only the `test` device is formatted and mounted here; `scratch` and
//! the `pool` devices are handed back raw and unmounted because the
//! fstests harness itself formats and (re-)mounts them as each test
//! case requires.

use anyhow::{Context, Result, bail};
use kdev_core::KdevError;
use kdev_exec::{Exec, ExecRequest};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One attached loop device and the backing file/mount point it owns.
#[derive(Debug, Clone)]
pub struct LoopDevice {
    pub loop_dev: String,
    pub backing_file: PathBuf,
    pub mount_point: Option<PathBuf>,
}

pub fn create_backing_file(path: &Path, size_mib: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create backing file {}", path.display()))?;
    file.set_len(size_mib * 1024 * 1024)
        .with_context(|| format!("failed to size backing file {}", path.display()))?;
    Ok(())
}

pub fn attach_loop_device(exec: &dyn Exec, backing_file: &Path) -> Result<String> {
    let path_str = backing_file.to_string_lossy().to_string();
    let out = exec.exec_checked(
        &ExecRequest::new(["losetup", "-f", "--show", &path_str])
            .sudo_if_enabled()
            .with_timeout(Duration::from_secs(10)),
    )?;
    let loop_dev = out.stdout_string();
    if loop_dev.is_empty() {
        bail!("losetup did not return a loop device path for {}", path_str);
    }

    if let Err(e) = exec.exec_checked(
        &ExecRequest::new(["chmod", "666", &loop_dev])
            .sudo_if_enabled()
            .with_timeout(Duration::from_secs(5)),
    ) {
        detach_loop_device(exec, &loop_dev);
        return Err(e.context(format!("failed to chmod loop device {loop_dev}")));
    }

    Ok(loop_dev)
}

/// Detach a loop device. Falls back to `losetup -D` (detach all unused
/// devices) if the targeted detach fails, since a device can wind up
/// busy for a moment after unmount.
pub fn detach_loop_device(exec: &dyn Exec, loop_dev: &str) -> bool {
    match exec.exec(
        &ExecRequest::new(["losetup", "-d", loop_dev])
            .sudo_if_enabled()
            .with_timeout(Duration::from_secs(10)),
    ) {
        Ok(out) if out.success() => true,
        _ => {
            tracing::warn!(loop_dev = %loop_dev, "losetup -d failed, falling back to detach-all");
            exec.exec(&ExecRequest::new(["losetup", "-D"]).sudo_if_enabled().with_timeout(Duration::from_secs(10)))
                .map(|o| o.success())
                .unwrap_or(false)
        }
    }
}

fn create_and_attach(exec: &dyn Exec, backing_file: &Path, size_mib: u64) -> Result<LoopDevice> {
    create_backing_file(backing_file, size_mib)?;
    match attach_loop_device(exec, backing_file) {
        Ok(loop_dev) => Ok(LoopDevice { loop_dev, backing_file: backing_file.to_path_buf(), mount_point: None }),
        Err(e) => {
            let _ = std::fs::remove_file(backing_file);
            Err(e)
        }
    }
}

pub fn validate_block_device(path: &str) -> Result<()> {
    let meta = std::fs::metadata(path).with_context(|| format!("cannot stat {path}"))?;
    if !meta.file_type().is_block_device() {
        return Err(KdevError::Validation(format!("{path} is not a block device")).into());
    }
    Ok(())
}

pub fn is_mounted(path: &str) -> Result<bool> {
    let mounts = std::fs::read_to_string("/proc/mounts").context("failed to read /proc/mounts")?;
    Ok(mounts.lines().any(|line| line.split_whitespace().next() == Some(path)))
}

pub fn has_filesystem(exec: &dyn Exec, path: &str) -> Result<bool> {
    let out = exec.exec(&ExecRequest::new(["blkid", path]).with_timeout(Duration::from_secs(5)))?;
    Ok(out.success() && !out.stdout_string().is_empty())
}

/// Tear down one [`LoopDevice`]: unmount if mounted, detach the loop
/// device, unlink the backing file. Best-effort — logs but never
/// panics on partial failure.
pub fn teardown_loop_device(exec: &dyn Exec, device: &LoopDevice) {
    if let Some(mount_point) = &device.mount_point {
        let mp = mount_point.to_string_lossy().to_string();
        if let Ok(out) = exec.exec(&ExecRequest::new(["umount", &mp]).sudo_if_enabled().with_timeout(Duration::from_secs(15))) {
            if !out.success() {
                tracing::warn!(mount_point = %mp, stderr = %out.stderr_string(), "failed to unmount loop device");
            }
        }
    }
    if !detach_loop_device(exec, &device.loop_dev) {
        tracing::warn!(loop_dev = %device.loop_dev, "failed to detach loop device during teardown");
    }
    if let Err(e) = std::fs::remove_file(&device.backing_file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(file = %device.backing_file.display(), error = %e, "failed to remove loop backing file");
        }
    }
}

/// Spec for the fstests `test`/`scratch`/pool device triad.
#[derive(Debug, Clone)]
pub struct LoopSetupSpec {
    pub work_dir: PathBuf,
    pub test_size_mib: u64,
    pub scratch_size_mib: u64,
    pub pool_sizes_mib: Vec<u64>,
    pub fstype: String,
    pub mkfs_extra_args: Vec<String>,
}

/// Result of [`setup_loop_devices`]: `test` is formatted and mounted;
/// `scratch` and every `pool` entry are attached but left raw for the
/// fstests harness to manage itself.
#[derive(Debug, Clone)]
pub struct LoopDeviceSet {
    pub test: LoopDevice,
    pub scratch: LoopDevice,
    pub pool: Vec<LoopDevice>,
}

pub fn setup_loop_devices(exec: &dyn Exec, spec: &LoopSetupSpec) -> Result<LoopDeviceSet> {
    std::fs::create_dir_all(&spec.work_dir)
        .with_context(|| format!("failed to create {}", spec.work_dir.display()))?;

    let test = create_and_attach(exec, &spec.work_dir.join("test.img"), spec.test_size_mib)
        .context("failed to set up test device")?;

    let scratch = match create_and_attach(exec, &spec.work_dir.join("scratch.img"), spec.scratch_size_mib) {
        Ok(d) => d,
        Err(e) => {
            teardown_loop_device(exec, &test);
            return Err(e.context("failed to set up scratch device"));
        }
    };

    let mut pool = Vec::new();
    for (i, size_mib) in spec.pool_sizes_mib.iter().enumerate() {
        match create_and_attach(exec, &spec.work_dir.join(format!("pool{i}.img")), *size_mib) {
            Ok(d) => pool.push(d),
            Err(e) => {
                for d in pool.iter().rev() {
                    teardown_loop_device(exec, d);
                }
                teardown_loop_device(exec, &scratch);
                teardown_loop_device(exec, &test);
                return Err(e.context(format!("failed to set up pool device {i}")));
            }
        }
    }

    let rollback_all = |exec: &dyn Exec, pool: &[LoopDevice]| {
        for d in pool.iter().rev() {
            teardown_loop_device(exec, d);
        }
        teardown_loop_device(exec, &scratch);
        teardown_loop_device(exec, &test);
    };

    let mut mkfs_argv = vec![format!("mkfs.{}", spec.fstype)];
    mkfs_argv.extend(spec.mkfs_extra_args.iter().cloned());
    mkfs_argv.push(test.loop_dev.clone());
    if let Err(e) = exec.exec_checked(&ExecRequest::new(mkfs_argv).sudo_if_enabled().with_timeout(Duration::from_secs(120))) {
        rollback_all(exec, &pool);
        return Err(e.context("failed to format test device"));
    }

    let mount_point = spec.work_dir.join("mnt-test");
    if let Err(e) = std::fs::create_dir_all(&mount_point) {
        rollback_all(exec, &pool);
        return Err(e).context(format!("failed to create {}", mount_point.display()));
    }
    let mount_point_str = mount_point.to_string_lossy().to_string();
    if let Err(e) = exec.exec_checked(
        &ExecRequest::new(["mount", &test.loop_dev, &mount_point_str])
            .sudo_if_enabled()
            .with_timeout(Duration::from_secs(30)),
    ) {
        rollback_all(exec, &pool);
        return Err(e.context("failed to mount test device"));
    }

    let mut test = test;
    test.mount_point = Some(mount_point);

    Ok(LoopDeviceSet { test, scratch, pool })
}

pub fn teardown_loop_device_set(exec: &dyn Exec, set: &LoopDeviceSet) {
    for d in set.pool.iter().rev() {
        teardown_loop_device(exec, d);
    }
    teardown_loop_device(exec, &set.scratch);
    teardown_loop_device(exec, &set.test);
}
