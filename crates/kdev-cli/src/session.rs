//! Orchestration glue: resolve a device profile, bring devices up,
//! boot the VM under a PTY, and (for fstests runs) parse the guest's
//! check-log back into a [`RunResult`]. This is the logic an MCP tool
//! handler would call; `kdev-cli`'s commands are the stand-in caller
//! for the RPC transport that would otherwise dispatch into it.
//!
//! The VM binary's own command-line contract is owned externally (only
//! "by convention `vng`" plus a PTY requirement is guaranteed); the
//! argv assembled in [`build_vng_argv`] follows virtme-ng's documented
//! flags as the closest real convention, the same way the Dmesg
//! Classifier's noise filters already assume `virtme-ng-init:`
//! userspace log lines.

use crate::profiles::fstests_default_profile;
use anyhow::{Context, Result, anyhow, bail};
use kdev_core::model::{BootResult, DeviceSpec, RunResult, VolumeSpec};
use kdev_core::paths::KdevPaths;
use kdev_device::DeviceManager;
use kdev_devicepool::{LvmPoolManager, PoolCatalog, VolumeStateStore};
use kdev_exec::Exec;
use kdev_fstests::{
    DeviceSetupOptions, FstestsConfig, generate_full_run_script, parse_check_log_file, validate_fstype, validate_test_args,
};
use kdev_vm::{CancelToken, ProcessRegistry, RunSpec, VmRunner};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A caller may name a device pool or hand over an explicit device
/// list, never both.
fn check_devices_xor_pool(devices: &Option<Vec<DeviceSpec>>, pool_name: &Option<String>) -> Result<()> {
    if devices.is_some() && pool_name.is_some() {
        bail!("'devices' and 'device_pool_name' are mutually exclusive");
    }
    Ok(())
}

/// Resolve the device list for one session: either the caller's
/// explicit `devices`, or an allocation against `device_pool_name`
/// (falling back to [`fstests_default_profile`] when no volume list
/// was given). Returns the pool manager handle too, so the caller can
/// release the allocation once the VM run is done.
fn resolve_device_specs<'a>(
    exec: &'a dyn Exec,
    paths: &KdevPaths,
    session_id: &str,
    devices: Option<Vec<DeviceSpec>>,
    pool_name: Option<&str>,
    pool_volumes: Option<Vec<VolumeSpec>>,
) -> Result<(Vec<DeviceSpec>, Option<(LvmPoolManager<'a>, String)>)> {
    if let Some(pool_name) = pool_name {
        let catalog = PoolCatalog::new(paths.pool_config_path());
        let state = VolumeStateStore::new(paths.state_store_path());
        let pool_mgr = LvmPoolManager::new(exec, catalog, state);
        let volumes = pool_volumes.unwrap_or_else(fstests_default_profile);
        let allocations = pool_mgr
            .allocate_volumes(pool_name, &volumes, session_id)
            .with_context(|| format!("failed to allocate volumes from pool '{pool_name}'"))?;

        let mut specs: Vec<DeviceSpec> = allocations
            .iter()
            .map(|alloc| DeviceSpec::Path {
                path: alloc.lv_path.clone(),
                name: Some(alloc.spec.name.clone()),
                order: alloc.spec.order,
                readonly: false,
                env_var: alloc.spec.env_var.clone(),
            })
            .collect();
        specs.sort_by_key(|s| s.order());
        Ok((specs, Some((pool_mgr, pool_name.to_string()))))
    } else {
        Ok((devices.unwrap_or_default(), None))
    }
}

fn release_pool(pool_state: Option<(LvmPoolManager<'_>, String)>, session_id: &str) {
    if let Some((pool_mgr, pool_name)) = pool_state {
        if let Err(e) = pool_mgr.release_volumes(session_id, false) {
            tracing::warn!(pool = %pool_name, session = %session_id, error = %e, "failed to release pool volumes");
        }
    }
}

/// Assemble the VM binary's argv: kernel, memory/cpu sizing, one
/// `--disk` per resolved device, an optional host directory shared
/// read-write at a fixed guest mount point, an optional guest script,
/// then the caller's passthrough `extra_args` last so they can
/// override anything above.
pub fn build_vng_argv(
    kernel_path: &str,
    memory_mb: u32,
    cpus: u32,
    resolved: &[kdev_core::model::ResolvedDevice],
    rwdir: Option<(&Path, &str)>,
    script_path: Option<&Path>,
    extra_args: &[String],
) -> Vec<String> {
    let mut argv = vec![
        kdev_core::config::vng_bin(),
        "--kernel".to_string(),
        kernel_path.to_string(),
        "--memory".to_string(),
        format!("{memory_mb}M"),
        "--cpus".to_string(),
        cpus.to_string(),
    ];
    for (i, dev) in resolved.iter().enumerate() {
        let name = dev.spec.name().map(str::to_string).unwrap_or_else(|| format!("disk{i}"));
        argv.push("--disk".to_string());
        argv.push(format!("name={name},file={}", dev.host_path.display()));
    }
    if let Some((host_dir, guest_path)) = rwdir {
        argv.push("--rwdir".to_string());
        argv.push(format!("{guest_path}={}", host_dir.display()));
    }
    if let Some(script) = script_path {
        argv.push("--script-host".to_string());
        argv.push(script.display().to_string());
    }
    argv.extend(extra_args.iter().cloned());
    argv
}

/// Raw boot request, no fstests orchestration: `boot_kernel_test`.
pub struct BootRequest {
    pub kernel_path: String,
    pub devices: Option<Vec<DeviceSpec>>,
    pub device_pool_name: Option<String>,
    pub device_pool_volumes: Option<Vec<VolumeSpec>>,
    pub timeout: Duration,
    pub memory_mb: u32,
    pub cpus: u32,
    pub extra_args: Vec<String>,
}

#[derive(serde::Serialize)]
pub struct BootOutcome {
    pub session_id: String,
    pub result: BootResult,
}

/// `boot_kernel_test`: allocate/attach devices, boot the VM under the
/// deadline, and guarantee every device (and, if a pool was used,
/// every allocated LV) is released before returning — success or
/// failure alike.
pub fn boot_kernel_test(exec: &dyn Exec, paths: &KdevPaths, registry: &ProcessRegistry, req: BootRequest) -> Result<BootOutcome> {
    check_devices_xor_pool(&req.devices, &req.device_pool_name)?;
    let session_id = kdev_core::naming::generate_session_id();

    let (device_specs, pool_state) = resolve_device_specs(
        exec,
        paths,
        &session_id,
        req.devices,
        req.device_pool_name.as_deref(),
        req.device_pool_volumes,
    )?;

    let work_dir = paths.instance_scratch_dir().join("sessions").join(&session_id);
    let mut device_mgr = DeviceManager::new(exec, work_dir.join("devices"));

    let outcome = (|| -> Result<BootResult> {
        device_mgr.attach(device_specs)?;
        let argv = build_vng_argv(&req.kernel_path, req.memory_mb, req.cpus, device_mgr.resolved(), None, None, &req.extra_args);

        let log_path = paths.boot_log_dir().join(kdev_core::naming::boot_log_name());
        let run_spec = RunSpec {
            argv,
            cwd: None,
            timeout: req.timeout,
            log_path: log_path.clone(),
            description: format!("boot_kernel_test {}", req.kernel_path),
        };
        let runner = VmRunner::new(registry);
        let boot = runner.run(&run_spec, &CancelToken::new())?;
        let _ = kdev_vm::runner::finalize_log_name(&log_path);
        Ok(boot)
    })();

    device_mgr.cleanup();
    release_pool(pool_state, &session_id);

    Ok(BootOutcome { session_id, result: outcome? })
}

/// Orchestrated fstests request: `fstests_vm_boot_and_run`.
pub struct FstestsRunRequest {
    pub kernel_path: String,
    pub fstests_path: String,
    pub tests: Vec<String>,
    pub fstype: String,
    pub custom_mkfs_command: Option<String>,
    pub timeout: Duration,
    pub memory_mb: u32,
    pub cpus: u32,
    pub extra_args: Vec<String>,
    pub io_scheduler: Option<String>,
    pub devices: Option<Vec<DeviceSpec>>,
    pub device_pool_name: Option<String>,
    pub device_pool_volumes: Option<Vec<VolumeSpec>>,
}

#[derive(serde::Serialize)]
pub struct FstestsRunOutcome {
    pub session_id: String,
    pub boot: BootResult,
    pub run_result: RunResult,
}

const GUEST_RESULTS_DIR: &str = "/host-results";

fn find_env_path(resolved: &[kdev_core::model::ResolvedDevice], env_var: &str) -> Option<String> {
    resolved
        .iter()
        .find(|d| d.spec.env_var() == Some(env_var))
        .map(|d| d.host_path.display().to_string())
}

/// `fstests_vm_boot_and_run`: resolve devices, synthesize the guest
/// setup script, boot, and parse whatever `check.log` the guest wrote
/// back to the shared results directory.
pub fn fstests_vm_boot_and_run(
    exec: &dyn Exec,
    paths: &KdevPaths,
    registry: &ProcessRegistry,
    req: FstestsRunRequest,
) -> Result<FstestsRunOutcome> {
    check_devices_xor_pool(&req.devices, &req.device_pool_name)?;
    validate_test_args(&req.tests).map_err(|e| anyhow!(e))?;
    validate_fstype(&req.fstype, req.custom_mkfs_command.as_deref()).map_err(|e| anyhow!(e))?;

    let session_id = kdev_core::naming::generate_session_id();
    let (device_specs, pool_state) = resolve_device_specs(
        exec,
        paths,
        &session_id,
        req.devices,
        req.device_pool_name.as_deref(),
        req.device_pool_volumes,
    )?;

    let work_dir = paths.instance_scratch_dir().join("sessions").join(&session_id);
    let results_dir = work_dir.join("results");
    std::fs::create_dir_all(&results_dir).with_context(|| format!("failed to create {}", results_dir.display()))?;

    let mut device_mgr = DeviceManager::new(exec, work_dir.join("devices"));

    let outcome = (|| -> Result<(BootResult, PathBuf)> {
        device_mgr.attach(device_specs)?;
        let resolved = device_mgr.resolved();

        let test_dev = find_env_path(resolved, "TEST_DEV").ok_or_else(|| anyhow!("no device requested TEST_DEV"))?;
        let scratch_dev = find_env_path(resolved, "SCRATCH_DEV").unwrap_or_else(|| test_dev.clone());

        let device_opts = DeviceSetupOptions {
            fstype: &req.fstype,
            test_dev_env: "$TEST_DEV",
            io_scheduler: req.io_scheduler.as_deref(),
            custom_mkfs_command: req.custom_mkfs_command.as_deref(),
        };
        let config = FstestsConfig {
            test_dev: &test_dev,
            test_dir: "/mnt/test",
            scratch_dev: &scratch_dev,
            scratch_mnt: "/mnt/scratch",
            fstyp: &req.fstype,
            mount_options: None,
            mkfs_options: None,
            additional_vars: Vec::new(),
        };

        let mut script = generate_full_run_script(&device_opts, &config, &device_mgr.env_script(), &req.fstests_path, &req.tests);
        script.push_str(&format!(
            "cp {}/check.log {GUEST_RESULTS_DIR}/check.log 2>/dev/null || true\n",
            req.fstests_path
        ));
        let script_path = work_dir.join("run.sh");
        std::fs::write(&script_path, &script).with_context(|| format!("failed to write {}", script_path.display()))?;

        let argv = build_vng_argv(
            &req.kernel_path,
            req.memory_mb,
            req.cpus,
            resolved,
            Some((&results_dir, GUEST_RESULTS_DIR)),
            Some(&script_path),
            &req.extra_args,
        );

        let log_path = paths.boot_log_dir().join(kdev_core::naming::boot_log_name());
        let run_spec = RunSpec {
            argv,
            cwd: None,
            timeout: req.timeout,
            log_path: log_path.clone(),
            description: format!("fstests_vm_boot_and_run {} {}", req.fstype, req.tests.join(" ")),
        };
        let runner = VmRunner::new(registry);
        let boot = runner.run(&run_spec, &CancelToken::new())?;
        let _ = kdev_vm::runner::finalize_log_name(&log_path);
        Ok((boot, results_dir.join("check.log")))
    })();

    device_mgr.cleanup();
    release_pool(pool_state, &session_id);

    let (boot, check_log_path) = outcome?;
    let run_result = if check_log_path.exists() {
        parse_check_log_file(&check_log_path)?
    } else {
        bail!(
            "VM exited without producing {} (boot {})",
            check_log_path.display(),
            boot.summary()
        );
    };

    Ok(FstestsRunOutcome { session_id, boot, run_result })
}

/// `fstests_vm_boot_custom`: format/mount devices the same way as an
/// orchestrated run, then hand control to the caller's own command or
/// script instead of invoking `check`. Returns the raw [`BootResult`]
/// only — there is no check-log to parse for an arbitrary payload.
pub struct FstestsCustomRequest {
    pub kernel_path: String,
    pub command: Option<String>,
    pub script_file: Option<PathBuf>,
    pub fstype: Option<String>,
    pub custom_mkfs_command: Option<String>,
    pub timeout: Duration,
    pub memory_mb: u32,
    pub cpus: u32,
    pub extra_args: Vec<String>,
    pub devices: Option<Vec<DeviceSpec>>,
    pub device_pool_name: Option<String>,
    pub device_pool_volumes: Option<Vec<VolumeSpec>>,
}

pub fn fstests_vm_boot_custom(
    exec: &dyn Exec,
    paths: &KdevPaths,
    registry: &ProcessRegistry,
    req: FstestsCustomRequest,
) -> Result<BootOutcome> {
    check_devices_xor_pool(&req.devices, &req.device_pool_name)?;
    if req.command.is_some() == req.script_file.is_some() {
        bail!("exactly one of 'command' or 'script_file' must be given");
    }

    let session_id = kdev_core::naming::generate_session_id();
    let (device_specs, pool_state) = resolve_device_specs(
        exec,
        paths,
        &session_id,
        req.devices,
        req.device_pool_name.as_deref(),
        req.device_pool_volumes,
    )?;

    let work_dir = paths.instance_scratch_dir().join("sessions").join(&session_id);
    let mut device_mgr = DeviceManager::new(exec, work_dir.join("devices"));

    let outcome = (|| -> Result<BootResult> {
        device_mgr.attach(device_specs)?;
        let resolved = device_mgr.resolved();

        let mut script = String::from("#!/bin/sh\nset -e\n");
        if let Some(fstype) = &req.fstype {
            if let Some(test_dev) = find_env_path(resolved, "TEST_DEV") {
                let device_opts = DeviceSetupOptions {
                    fstype,
                    test_dev_env: "$TEST_DEV",
                    io_scheduler: None,
                    custom_mkfs_command: req.custom_mkfs_command.as_deref(),
                };
                script.push_str(&format!("export TEST_DEV={test_dev}\n"));
                script.push_str(&kdev_fstests::generate_device_setup_script(&device_opts));
            }
        }
        script.push_str(&device_mgr.env_script());

        let payload = match (&req.command, &req.script_file) {
            (Some(cmd), None) => cmd.clone(),
            (None, Some(path)) => {
                std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
            }
            _ => unreachable!("validated above"),
        };
        script.push('\n');
        script.push_str(&payload);
        script.push('\n');

        let script_path = work_dir.join("custom.sh");
        std::fs::write(&script_path, &script).with_context(|| format!("failed to write {}", script_path.display()))?;

        let argv = build_vng_argv(&req.kernel_path, req.memory_mb, req.cpus, resolved, None, Some(&script_path), &req.extra_args);
        let log_path = paths.boot_log_dir().join(kdev_core::naming::boot_log_name());
        let run_spec = RunSpec {
            argv,
            cwd: None,
            timeout: req.timeout,
            log_path: log_path.clone(),
            description: format!("fstests_vm_boot_custom {}", req.kernel_path),
        };
        let runner = VmRunner::new(registry);
        let boot = runner.run(&run_spec, &CancelToken::new())?;
        let _ = kdev_vm::runner::finalize_log_name(&log_path);
        Ok(boot)
    })();

    device_mgr.cleanup();
    release_pool(pool_state, &session_id);

    Ok(BootOutcome { session_id, result: outcome? })
}
