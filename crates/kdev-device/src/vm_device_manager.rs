//! VM Device Manager: turns an ordered list of [`DeviceSpec`]s into an
//! ordered list of resolved host device paths, bringing each one up in
//! spec order and tearing down whatever was already created the
//! moment any step fails.

use crate::{loopback, null_blk};
use anyhow::{Context, Result, bail};
use kdev_core::KdevError;
use kdev_core::model::{DeviceBacking, DeviceSpec, ResolvedDevice};
use kdev_exec::Exec;
use std::path::PathBuf;

enum CleanupHook {
    Loop(loopback::LoopDevice),
    NullBlk { dev_path: String, idx: u32 },
    /// Pre-existing device the VM Device Manager never created and
    /// must never destroy.
    None,
}

/// Brings up and tears down the devices attached to one VM session.
pub struct DeviceManager<'a> {
    exec: &'a dyn Exec,
    work_dir: PathBuf,
    null_blk_available: Option<bool>,
    resolved: Vec<ResolvedDevice>,
    hooks: Vec<CleanupHook>,
}

impl<'a> DeviceManager<'a> {
    pub fn new(exec: &'a dyn Exec, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            exec,
            work_dir: work_dir.into(),
            null_blk_available: None,
            resolved: Vec::new(),
            hooks: Vec::new(),
        }
    }

    fn null_blk_available(&mut self) -> bool {
        *self.null_blk_available.get_or_insert_with(|| {
            let support = null_blk::probe_support(self.exec);
            if !support.supported {
                tracing::warn!(reason = %support.message, "null_blk unavailable on this host");
            }
            support.supported
        })
    }

    /// Attach every device in `specs`, in ascending `order`. On any
    /// failure, every device already created during this call is torn
    /// down in reverse order before the error is returned.
    pub fn attach(&mut self, specs: Vec<DeviceSpec>) -> Result<&[ResolvedDevice]> {
        if specs.len() > kdev_core::limits::max_custom_devices_per_vm() {
            return Err(KdevError::Resource(format!(
                "{} devices requested exceeds the per-VM cap of {}",
                specs.len(),
                kdev_core::limits::max_custom_devices_per_vm()
            ))
            .into());
        }

        let mut ordered = specs;
        ordered.sort_by_key(|s| s.order());

        let null_blk_total_mib: u64 = ordered
            .iter()
            .filter_map(|s| match s {
                DeviceSpec::Sized { size, backing: DeviceBacking::NullBlk, .. } => {
                    kdev_core::naming::parse_size_mib(size).ok()
                }
                _ => None,
            })
            .sum();
        let cap_mib = kdev_core::limits::max_null_blk_total_gib() * 1024;
        if null_blk_total_mib > cap_mib {
            return Err(KdevError::Resource(format!(
                "aggregate null_blk request {null_blk_total_mib} MiB exceeds cap {cap_mib} MiB"
            ))
            .into());
        }

        for spec in ordered {
            if let Err(e) = self.attach_one(spec) {
                self.cleanup();
                return Err(e);
            }
        }

        Ok(&self.resolved)
    }

    fn attach_one(&mut self, spec: DeviceSpec) -> Result<()> {
        match &spec {
            DeviceSpec::Path { path, .. } => {
                loopback::validate_block_device(path)
                    .with_context(|| format!("device path {path} failed validation"))?;
                let host_path = PathBuf::from(path);
                self.resolved.push(ResolvedDevice { spec, host_path });
                self.hooks.push(CleanupHook::None);
                Ok(())
            }
            DeviceSpec::Sized { size, backing: DeviceBacking::NullBlk, name, .. } => {
                self.attach_null_blk(spec.clone(), size, name.as_deref())
            }
            DeviceSpec::Sized { backing: DeviceBacking::DiskLoop, .. } => self.attach_loop(spec, false),
            DeviceSpec::Sized { backing: DeviceBacking::TmpfsLoop, .. } => self.attach_loop(spec, true),
            DeviceSpec::Sized { backing: DeviceBacking::LvmPool, .. } => Err(KdevError::Validation(
                "lvm-backed devices must be allocated via the device pool manager and attached by path".to_string(),
            )
            .into()),
        }
    }

    /// Try `null_blk` first; fall back to a tmpfs-backed loop device
    /// exactly once for this device if the probe says unsupported or
    /// creation otherwise fails. The fallback never cascades to
    /// devices after this one — each makes its own attempt.
    fn attach_null_blk(&mut self, spec: DeviceSpec, size: &str, name: Option<&str>) -> Result<()> {
        if self.null_blk_available() {
            match null_blk::create_device(self.exec, size, name.unwrap_or("device"), &null_blk::NullBlkOptions::default()) {
                Ok((dev_path, idx)) => {
                    self.resolved.push(ResolvedDevice { spec, host_path: PathBuf::from(&dev_path) });
                    self.hooks.push(CleanupHook::NullBlk { dev_path, idx });
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "null_blk device creation failed, falling back to tmpfs");
                }
            }
        }
        self.attach_loop(spec, true)
    }

    fn attach_loop(&mut self, spec: DeviceSpec, tmpfs: bool) -> Result<()> {
        let DeviceSpec::Sized { size, name, .. } = &spec else {
            bail!("attach_loop called with a non-sized device spec");
        };
        let size_mib = kdev_core::naming::parse_size_mib(size).map_err(|e| KdevError::Validation(e.to_string()))?;

        let dir = if tmpfs { self.work_dir.join("tmpfs") } else { self.work_dir.join("disk") };
        let file_name = format!("{}.img", name.clone().unwrap_or_else(|| format!("dev{}", self.resolved.len())));
        let backing_file = dir.join(file_name);

        loopback::create_backing_file(&backing_file, size_mib)?;
        let loop_dev = match loopback::attach_loop_device(self.exec, &backing_file) {
            Ok(d) => d,
            Err(e) => {
                let _ = std::fs::remove_file(&backing_file);
                return Err(e);
            }
        };

        self.resolved.push(ResolvedDevice { spec, host_path: PathBuf::from(&loop_dev) });
        self.hooks.push(CleanupHook::Loop(loopback::LoopDevice {
            loop_dev,
            backing_file,
            mount_point: None,
        }));
        Ok(())
    }

    pub fn resolved(&self) -> &[ResolvedDevice] {
        &self.resolved
    }

    /// Shell-sourceable export lines for every device that requested
    /// an `env_var`, in spec order.
    pub fn env_script(&self) -> String {
        let mut script = String::new();
        for device in &self.resolved {
            if let Some(var) = device.spec.env_var() {
                script.push_str(&format!("export {}={}\n", var, device.host_path.display()));
            }
        }
        script
    }

    /// Tear down every device this manager created, in reverse order.
    /// Pre-existing `path` devices are left untouched. Safe to call
    /// more than once.
    pub fn cleanup(&mut self) {
        while let Some(hook) = self.hooks.pop() {
            self.resolved.pop();
            match hook {
                CleanupHook::Loop(device) => loopback::teardown_loop_device(self.exec, &device),
                CleanupHook::NullBlk { dev_path, idx } => {
                    null_blk::cleanup_device(self.exec, &dev_path, idx);
                }
                CleanupHook::None => {}
            }
        }
    }
}

impl Drop for DeviceManager<'_> {
    fn drop(&mut self) {
        self.cleanup();
    }
}
