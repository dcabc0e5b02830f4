//! `kdevctl`'s command surface: one [`clap`] subcommand per tool the
//! MCP boundary would otherwise expose (device_pool_*, boot_kernel_test,
//! fstests_*, kill_hanging_vms), dispatching into the core crates the
//! same way a tool handler would.

use crate::session::{self, BootRequest, FstestsCustomRequest, FstestsRunRequest};
use crate::{logging, ui};
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use kdev_core::model::{DeviceBacking, DeviceSpec, GitNoteMetadata, RunMetadata};
use kdev_core::paths::KdevPaths;
use kdev_devicepool::{LvmPoolManager, PoolCatalog, SetupOptions, VolumeStateStore};
use kdev_exec::{Exec, HostExec};
use kdev_fstests::{BaselineStore, GitNotesStore, compare, generate_exclude_list};
use kdev_vm::ProcessRegistry;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "kdevctl", about = "Operator CLI for the kernel-development automation service")]
pub struct Cli {
    #[arg(long, short = 'o', global = true, value_enum, default_value = "human")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Device Pool Manager: create, inspect and tear down LVM pools.
    #[command(subcommand)]
    DevicePool(DevicePoolCommands),

    /// Boot a kernel under a PTY-driven VM with the requested devices.
    BootKernelTest {
        kernel_path: String,
        /// `path:<path>[:name]` or `size:<size>:<backing>[:name[:env_var]]`,
        /// repeatable. Mutually exclusive with `--device-pool-name`.
        #[arg(long = "device")]
        devices: Vec<String>,
        #[arg(long)]
        device_pool_name: Option<String>,
        #[arg(long, default_value_t = 2048)]
        memory_mb: u32,
        #[arg(long, default_value_t = 2)]
        cpus: u32,
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
        #[arg(last = true)]
        extra_args: Vec<String>,
    },

    /// Fstests Orchestrator: run, baseline and git-notes subcommands.
    #[command(subcommand)]
    Fstests(FstestsCommands),

    /// Kill every VM still registered for this service instance.
    KillHangingVms,
}

#[derive(Subcommand)]
pub enum DevicePoolCommands {
    Setup {
        device: String,
        pool_name: String,
        #[arg(long)]
        vg_name: Option<String>,
        #[arg(long, default_value = "kdev")]
        lv_prefix: String,
    },
    Teardown {
        pool_name: String,
        #[arg(long)]
        wipe_data: bool,
    },
    Status {
        pool_name: String,
    },
    List,
    Cleanup {
        pool_name: String,
    },
    Resize {
        pool_name: String,
        lv_name: String,
        new_size: String,
    },
    SnapshotCreate {
        pool_name: String,
        lv_name: String,
        snapshot_name: String,
        snapshot_size: String,
    },
    SnapshotDelete {
        pool_name: String,
        snapshot_name: String,
    },
}

#[derive(Subcommand)]
pub enum FstestsCommands {
    /// Format devices, run `check`, and parse the resulting `check.log`.
    Run {
        kernel_path: String,
        fstests_path: String,
        #[arg(long)]
        device_pool_name: Option<String>,
        #[arg(long, default_value = "xfs")]
        fstype: String,
        #[arg(long)]
        custom_mkfs_command: Option<String>,
        #[arg(long)]
        io_scheduler: Option<String>,
        #[arg(long, default_value_t = 2048)]
        memory_mb: u32,
        #[arg(long, default_value_t = 2)]
        cpus: u32,
        #[arg(long, default_value_t = 1800)]
        timeout_secs: u64,
        #[arg(long = "device")]
        devices: Vec<String>,
        #[arg(last = true)]
        tests: Vec<String>,
    },
    /// Boot with devices formatted, then run an arbitrary guest command
    /// or script instead of `check`.
    Custom {
        kernel_path: String,
        #[arg(long = "device")]
        devices: Vec<String>,
        #[arg(long)]
        device_pool_name: Option<String>,
        #[arg(long)]
        fstype: Option<String>,
        #[arg(long)]
        command: Option<String>,
        #[arg(long)]
        script_file: Option<PathBuf>,
        #[arg(long, default_value_t = 2048)]
        memory_mb: u32,
        #[arg(long, default_value_t = 2)]
        cpus: u32,
        #[arg(long, default_value_t = 1800)]
        timeout_secs: u64,
    },
    BaselineSave {
        name: String,
        check_log: PathBuf,
        #[arg(long)]
        fstype: Option<String>,
        #[arg(long)]
        test_selection: Option<String>,
    },
    BaselineList,
    BaselineLoad {
        name: String,
    },
    BaselineDelete {
        name: String,
    },
    /// Compare a fresh `check.log` against a saved baseline.
    BaselineCompare {
        name: String,
        check_log: PathBuf,
        #[arg(long)]
        exclude_list_out: Option<PathBuf>,
    },
    GitSave {
        repo_dir: PathBuf,
        check_log: PathBuf,
        #[arg(long)]
        commit: Option<String>,
        #[arg(long)]
        fstype: Option<String>,
        #[arg(long)]
        test_selection: Option<String>,
    },
    GitLoad {
        repo_dir: PathBuf,
        commit: String,
    },
    GitList {
        repo_dir: PathBuf,
        #[arg(long, default_value_t = 20)]
        max_count: usize,
    },
    GitDelete {
        repo_dir: PathBuf,
        commit: String,
    },
}

fn pool_manager<'a>(exec: &'a dyn Exec, paths: &KdevPaths) -> LvmPoolManager<'a> {
    let catalog = PoolCatalog::new(paths.pool_config_path());
    let state = VolumeStateStore::new(paths.state_store_path());
    LvmPoolManager::new(exec, catalog, state)
}

fn parse_device_specs(raw: &[String]) -> Result<Vec<DeviceSpec>> {
    raw.iter()
        .enumerate()
        .map(|(i, s)| parse_one_device_spec(s, i as u32))
        .collect()
}

/// `path:/dev/loop7[:name]` or `size:10G:disk_loop[:name][:ENV_VAR]`.
fn parse_one_device_spec(raw: &str, order: u32) -> Result<DeviceSpec> {
    let parts: Vec<&str> = raw.split(':').collect();
    match parts.as_slice() {
        ["path", path] => Ok(DeviceSpec::Path { path: path.to_string(), name: None, order, readonly: false, env_var: None }),
        ["path", path, name] => {
            Ok(DeviceSpec::Path { path: path.to_string(), name: Some(name.to_string()), order, readonly: false, env_var: None })
        }
        ["size", size, backing] => Ok(DeviceSpec::Sized {
            size: size.to_string(),
            backing: parse_backing(backing)?,
            name: None,
            order,
            env_var: None,
        }),
        ["size", size, backing, name] => Ok(DeviceSpec::Sized {
            size: size.to_string(),
            backing: parse_backing(backing)?,
            name: Some(name.to_string()),
            order,
            env_var: None,
        }),
        ["size", size, backing, name, env_var] => Ok(DeviceSpec::Sized {
            size: size.to_string(),
            backing: parse_backing(backing)?,
            name: Some(name.to_string()),
            order,
            env_var: Some(env_var.to_string()),
        }),
        _ => bail!("unrecognized device spec {raw:?}, expected 'path:<path>[:name]' or 'size:<size>:<backing>[:name[:env_var]]'"),
    }
}

fn parse_backing(s: &str) -> Result<DeviceBacking> {
    Ok(match s {
        "disk_loop" => DeviceBacking::DiskLoop,
        "tmpfs_loop" => DeviceBacking::TmpfsLoop,
        "null_blk" => DeviceBacking::NullBlk,
        "lvm_pool" => DeviceBacking::LvmPool,
        other => bail!("unrecognized device backing {other:?}"),
    })
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(logging::LogFormat::Human);

    let exec = HostExec;
    let paths = KdevPaths::resolve(std::process::id());
    let registry = ProcessRegistry::for_service_pid(paths.instance_scratch_dir(), std::process::id());

    match cli.command {
        Commands::DevicePool(cmd) => run_device_pool(cmd, &exec, &paths),
        Commands::BootKernelTest { kernel_path, devices, device_pool_name, memory_mb, cpus, timeout_secs, extra_args } => {
            if !devices.is_empty() && device_pool_name.is_some() {
                bail!("--device and --device-pool-name are mutually exclusive");
            }
            let req = BootRequest {
                kernel_path,
                devices: (!devices.is_empty()).then(|| parse_device_specs(&devices)).transpose()?,
                device_pool_name,
                device_pool_volumes: None,
                timeout: Duration::from_secs(timeout_secs),
                memory_mb,
                cpus,
                extra_args,
            };
            let outcome = session::boot_kernel_test(&exec, &paths, &registry, req)?;
            let critical = outcome.result.has_critical_issues();
            match cli.output {
                OutputFormat::Json => ui::emit_json(&outcome)?,
                OutputFormat::Human => {
                    ui::info(&format!("session {}", outcome.session_id));
                    ui::render_block(&outcome.result.summary());
                }
            }
            if critical {
                bail!("boot reported panics or oops");
            }
            Ok(())
        }
        Commands::Fstests(cmd) => run_fstests(cmd, &exec, &paths, &registry, cli.output),
        Commands::KillHangingVms => {
            let reports = registry.kill_hanging_vms()?;
            if reports.is_empty() {
                ui::success("no hanging VMs found");
            } else {
                for r in &reports {
                    ui::warn(&format!("killed pid {} ({}): {}", r.pid, r.description, r.log_tail.lines().last().unwrap_or("")));
                }
            }
            Ok(())
        }
    }
}

fn run_device_pool(cmd: DevicePoolCommands, exec: &dyn Exec, paths: &KdevPaths) -> Result<()> {
    let mgr = pool_manager(exec, paths);
    match cmd {
        DevicePoolCommands::Setup { device, pool_name, vg_name, lv_prefix } => {
            let options = SetupOptions { vg_name, lv_prefix, ..SetupOptions::default() };
            let pool = mgr.setup_pool(&device, &pool_name, options)?;
            ui::success(&format!("pool '{}' ready on {} (vg {})", pool.pool_name, pool.device_path, pool.vg_name));
            Ok(())
        }
        DevicePoolCommands::Teardown { pool_name, wipe_data } => {
            if wipe_data && !ui::confirm(&format!("overwrite the first 100MB of the device backing pool '{pool_name}'?")) {
                ui::warn("cancelled");
                return Ok(());
            }
            mgr.teardown_pool(&pool_name, wipe_data)?;
            ui::success(&format!("pool '{pool_name}' removed"));
            Ok(())
        }
        DevicePoolCommands::Status { pool_name } => {
            mgr.validate_pool(&pool_name)?;
            ui::success(&format!("pool '{pool_name}' is valid"));
            Ok(())
        }
        DevicePoolCommands::List => {
            let catalog = PoolCatalog::new(paths.pool_config_path());
            for pool in catalog.load_pools()?.into_values() {
                ui::status_line(&pool.pool_name, &pool.vg_name);
            }
            Ok(())
        }
        DevicePoolCommands::Cleanup { pool_name } => {
            let cleaned = mgr.cleanup_orphaned_volumes(&pool_name)?;
            ui::info(&format!("cleaned {} orphaned volume(s)", cleaned.len()));
            Ok(())
        }
        DevicePoolCommands::Resize { pool_name, lv_name, new_size } => {
            mgr.resize_volume(&pool_name, &lv_name, &new_size)?;
            ui::success(&format!("resized {lv_name} to {new_size}"));
            Ok(())
        }
        DevicePoolCommands::SnapshotCreate { pool_name, lv_name, snapshot_name, snapshot_size } => {
            mgr.create_snapshot(&pool_name, &lv_name, &snapshot_name, &snapshot_size)?;
            ui::success(&format!("snapshot '{snapshot_name}' created from {lv_name}"));
            Ok(())
        }
        DevicePoolCommands::SnapshotDelete { pool_name, snapshot_name } => {
            mgr.delete_snapshot(&pool_name, &snapshot_name)?;
            ui::success(&format!("snapshot '{snapshot_name}' deleted"));
            Ok(())
        }
    }
}

fn run_fstests(cmd: FstestsCommands, exec: &dyn Exec, paths: &KdevPaths, registry: &ProcessRegistry, output: OutputFormat) -> Result<()> {
    match cmd {
        FstestsCommands::Run {
            kernel_path,
            fstests_path,
            device_pool_name,
            fstype,
            custom_mkfs_command,
            io_scheduler,
            memory_mb,
            cpus,
            timeout_secs,
            devices,
            tests,
        } => {
            if !devices.is_empty() && device_pool_name.is_some() {
                bail!("--device and --device-pool-name are mutually exclusive");
            }
            let req = FstestsRunRequest {
                kernel_path,
                fstests_path,
                tests,
                fstype,
                custom_mkfs_command,
                timeout: Duration::from_secs(timeout_secs),
                memory_mb,
                cpus,
                extra_args: Vec::new(),
                io_scheduler,
                devices: (!devices.is_empty()).then(|| parse_device_specs(&devices)).transpose()?,
                device_pool_name,
                device_pool_volumes: None,
            };
            let outcome = session::fstests_vm_boot_and_run(exec, paths, registry, req)?;
            let failed = !outcome.run_result.success;
            match output {
                OutputFormat::Json => ui::emit_json(&outcome)?,
                OutputFormat::Human => {
                    ui::info(&format!("session {}", outcome.session_id));
                    ui::render_block(&outcome.boot.summary());
                    ui::info(&format!(
                        "{}/{} passed, {} failed, {} not run",
                        outcome.run_result.passed, outcome.run_result.total_tests, outcome.run_result.failed, outcome.run_result.notrun
                    ));
                }
            }
            if failed {
                bail!("fstests run reported failures");
            }
            Ok(())
        }
        FstestsCommands::Custom {
            kernel_path,
            devices,
            device_pool_name,
            fstype,
            command,
            script_file,
            memory_mb,
            cpus,
            timeout_secs,
        } => {
            if !devices.is_empty() && device_pool_name.is_some() {
                bail!("--device and --device-pool-name are mutually exclusive");
            }
            let req = FstestsCustomRequest {
                kernel_path,
                command,
                script_file,
                fstype,
                custom_mkfs_command: None,
                timeout: Duration::from_secs(timeout_secs),
                memory_mb,
                cpus,
                extra_args: Vec::new(),
                devices: (!devices.is_empty()).then(|| parse_device_specs(&devices)).transpose()?,
                device_pool_name,
                device_pool_volumes: None,
            };
            let outcome = session::fstests_vm_boot_custom(exec, paths, registry, req)?;
            match output {
                OutputFormat::Json => ui::emit_json(&outcome)?,
                OutputFormat::Human => {
                    ui::info(&format!("session {}", outcome.session_id));
                    ui::render_block(&outcome.result.summary());
                }
            }
            Ok(())
        }
        FstestsCommands::BaselineSave { name, check_log, fstype, test_selection } => {
            let store = BaselineStore::new(paths.baselines_dir());
            let result = kdev_fstests::parse_check_log_file(&check_log)?;
            let metadata = RunMetadata {
                kernel_version: None,
                fstype,
                test_selection,
                created_at: kdev_core::time::utc_now(),
            };
            store.save(&name, metadata, result)?;
            ui::success(&format!("baseline '{name}' saved"));
            Ok(())
        }
        FstestsCommands::BaselineList => {
            let store = BaselineStore::new(paths.baselines_dir());
            for baseline in store.list()? {
                ui::status_line(&baseline.name, &format!("{} passed / {} failed", baseline.result.passed, baseline.result.failed));
            }
            Ok(())
        }
        FstestsCommands::BaselineLoad { name } => {
            let store = BaselineStore::new(paths.baselines_dir());
            let baseline = store.load(&name)?.ok_or_else(|| anyhow!("baseline '{name}' not found"))?;
            ui::info(&format!("{}: {} passed, {} failed, {} not run", baseline.name, baseline.result.passed, baseline.result.failed, baseline.result.notrun));
            Ok(())
        }
        FstestsCommands::BaselineDelete { name } => {
            let store = BaselineStore::new(paths.baselines_dir());
            if store.delete(&name)? {
                ui::success(&format!("baseline '{name}' deleted"));
            } else {
                ui::warn(&format!("baseline '{name}' did not exist"));
            }
            Ok(())
        }
        FstestsCommands::BaselineCompare { name, check_log, exclude_list_out } => {
            let store = BaselineStore::new(paths.baselines_dir());
            let baseline = store.load(&name)?.ok_or_else(|| anyhow!("baseline '{name}' not found"))?;
            let current = kdev_fstests::parse_check_log_file(&check_log)?;
            let comparison = compare(&current, &baseline.result);
            ui::render_block(&comparison.summary());
            if let Some(path) = exclude_list_out {
                generate_exclude_list(&current, &path).with_context(|| format!("failed to write {}", path.display()))?;
            }
            if comparison.regression_detected() {
                bail!("{} regression(s) detected vs baseline '{name}'", comparison.regression_count());
            }
            Ok(())
        }
        FstestsCommands::GitSave { repo_dir, check_log, commit, fstype, test_selection } => {
            let store = GitNotesStore::new(exec, repo_dir);
            let commit_sha = match &commit {
                Some(c) => c.clone(),
                None => store.current_commit()?,
            };
            let branch_name = store.current_branch()?;
            let results = kdev_fstests::parse_check_log_file(&check_log)?;
            let record = kdev_core::model::GitNoteRecord {
                metadata: GitNoteMetadata {
                    commit_sha,
                    branch_name,
                    kernel_version: None,
                    fstype,
                    test_selection,
                    created_at: kdev_core::time::utc_now(),
                },
                results,
            };
            store.save(commit.as_deref(), &record)?;
            ui::success("fstests results saved as a git note");
            Ok(())
        }
        FstestsCommands::GitLoad { repo_dir, commit } => {
            let store = GitNotesStore::new(exec, repo_dir);
            let record = store.load(&commit)?.ok_or_else(|| anyhow!("no fstests note on {commit}"))?;
            ui::info(&format!(
                "{}: {} passed, {} failed",
                record.metadata.commit_sha, record.results.passed, record.results.failed
            ));
            Ok(())
        }
        FstestsCommands::GitList { repo_dir, max_count } => {
            let store = GitNotesStore::new(exec, repo_dir);
            for record in store.list_commits(max_count)? {
                ui::status_line(&record.metadata.commit_sha, &format!("{} passed / {} failed", record.results.passed, record.results.failed));
            }
            Ok(())
        }
        FstestsCommands::GitDelete { repo_dir, commit } => {
            let store = GitNotesStore::new(exec, repo_dir);
            if store.delete(&commit)? {
                ui::success(&format!("fstests note on {commit} deleted"));
            } else {
                ui::warn(&format!("no fstests note on {commit}"));
            }
            Ok(())
        }
    }
}
