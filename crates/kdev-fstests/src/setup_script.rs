//! Synthesizes the shell text a guest runs before and during a fstests
//! invocation: formatting `TEST_DEV`, exporting the fstests config
//! block, and invoking `check` with the caller's validated test
//! selection. `SCRATCH_DEV` and any pool devices are left to fstests
//! itself to format, the same asymmetry as [`kdev_device::loopback`].

use std::fmt::Write as _;

/// Per-fstype `mkfs` invocation, mirroring the force flag each
/// filesystem's own mkfs tool expects.
fn mkfs_force_flag(fstype: &str) -> &'static str {
    match fstype {
        "ext4" => "-F",
        "xfs" | "btrfs" | "f2fs" => "-f",
        _ => "-f",
    }
}

/// Options controlling how the guest formats `TEST_DEV` before a run.
pub struct DeviceSetupOptions<'a> {
    pub fstype: &'a str,
    pub test_dev_env: &'a str,
    pub io_scheduler: Option<&'a str>,
    /// Overrides the `mkfs.{fstype}` invocation entirely; the literal
    /// command text is substituted as-is, with `$TEST_DEV` appended
    /// only if the command doesn't already reference it.
    pub custom_mkfs_command: Option<&'a str>,
}

/// Produce the shell fragment that formats `TEST_DEV` for `fstype`.
///
/// The fstype is baked into the generated text as a literal value
/// rather than left as a shell variable, so the `case` arm, and the
/// success/failure messages, always name the actual filesystem being
/// tested.
pub fn generate_device_setup_script(opts: &DeviceSetupOptions) -> String {
    let fstype = opts.fstype;
    let mut script = String::new();

    writeln!(script, "set -e").unwrap();
    if let Some(scheduler) = opts.io_scheduler {
        writeln!(
            script,
            "echo {scheduler} > /sys/block/$(basename {dev})/queue/scheduler 2>/dev/null || true",
            dev = opts.test_dev_env
        )
        .unwrap();
    }

    writeln!(script, "case \"{fstype}\" in").unwrap();
    writeln!(script, "{fstype})").unwrap();
    let mkfs_cmd = match opts.custom_mkfs_command {
        Some(custom) if custom.contains(opts.test_dev_env) => custom.to_string(),
        Some(custom) => format!("{custom} {dev}", dev = opts.test_dev_env),
        None => format!(
            "mkfs.{fstype} {flag} {dev}",
            flag = mkfs_force_flag(fstype),
            dev = opts.test_dev_env
        ),
    };
    writeln!(script, "    if {mkfs_cmd}; then").unwrap();
    writeln!(script, "        echo \"Formatted $TEST_DEV as {fstype}\"").unwrap();
    writeln!(script, "    else").unwrap();
    writeln!(script, "        echo \"Failed to format $TEST_DEV as {fstype}\" >&2").unwrap();
    writeln!(script, "        exit 1").unwrap();
    writeln!(script, "    fi").unwrap();
    writeln!(script, "    ;;").unwrap();
    writeln!(script, "*)").unwrap();
    writeln!(script, "    echo \"Unsupported fstype: {fstype}\" >&2").unwrap();
    writeln!(script, "    exit 1").unwrap();
    writeln!(script, "    ;;").unwrap();
    writeln!(script, "esac").unwrap();

    script
}

/// Shell-exportable fstests configuration: `TEST_DEV`/`TEST_DIR`,
/// `SCRATCH_DEV`/`SCRATCH_MNT`, `FSTYP`, and optional mount/mkfs
/// option overrides plus arbitrary additional variables.
pub struct FstestsConfig<'a> {
    pub test_dev: &'a str,
    pub test_dir: &'a str,
    pub scratch_dev: &'a str,
    pub scratch_mnt: &'a str,
    pub fstyp: &'a str,
    pub mount_options: Option<&'a str>,
    pub mkfs_options: Option<&'a str>,
    pub additional_vars: Vec<(String, String)>,
}

impl FstestsConfig<'_> {
    /// Render as a block of `export` lines, suitable for sourcing at
    /// the top of the guest's fstests invocation script.
    pub fn to_config_text(&self) -> String {
        let mut out = String::new();
        writeln!(out, "export TEST_DEV={}", self.test_dev).unwrap();
        writeln!(out, "export TEST_DIR={}", self.test_dir).unwrap();
        writeln!(out, "export SCRATCH_DEV={}", self.scratch_dev).unwrap();
        writeln!(out, "export SCRATCH_MNT={}", self.scratch_mnt).unwrap();
        writeln!(out, "export FSTYP={}", self.fstyp).unwrap();
        if let Some(opts) = self.mount_options {
            writeln!(out, "export MOUNT_OPTIONS=\"{opts}\"").unwrap();
        }
        if let Some(opts) = self.mkfs_options {
            writeln!(out, "export MKFS_OPTIONS=\"{opts}\"").unwrap();
        }
        for (key, value) in &self.additional_vars {
            writeln!(out, "export {key}=\"{value}\"").unwrap();
        }
        out
    }
}

/// Assemble the full guest script: device formatting, the fstests
/// config block, sourcing the VM Device Manager's env exports, and
/// the `check` invocation itself.
pub fn generate_full_run_script(
    device_opts: &DeviceSetupOptions,
    config: &FstestsConfig,
    device_env_script: &str,
    fstests_path: &str,
    check_args: &[String],
) -> String {
    let mut script = String::new();
    script.push_str("#!/bin/sh\n");
    script.push_str(&generate_device_setup_script(device_opts));
    script.push('\n');
    script.push_str(device_env_script);
    script.push('\n');
    script.push_str(&config.to_config_text());
    script.push('\n');
    write!(
        script,
        "cd {fstests_path} && ./check {args}\n",
        args = check_args.join(" ")
    )
    .unwrap();
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_setup_script_embeds_literal_fstype_not_a_placeholder() {
        let opts = DeviceSetupOptions {
            fstype: "xfs",
            test_dev_env: "$TEST_DEV",
            io_scheduler: None,
            custom_mkfs_command: None,
        };
        let script = generate_device_setup_script(&opts);
        assert!(script.contains("case \"xfs\" in"));
        assert!(!script.contains("{fstype}"));
        assert!(!script.contains("{{fstype}}"));
        assert!(script.contains("mkfs.xfs -f $TEST_DEV"));
        assert!(script.contains("Formatted $TEST_DEV as xfs"));
        assert!(script.contains("Failed to format $TEST_DEV as xfs"));
    }

    #[test]
    fn ext4_uses_capital_f_force_flag() {
        let opts = DeviceSetupOptions {
            fstype: "ext4",
            test_dev_env: "$TEST_DEV",
            io_scheduler: None,
            custom_mkfs_command: None,
        };
        let script = generate_device_setup_script(&opts);
        assert!(script.contains("mkfs.ext4 -F $TEST_DEV"));
    }

    #[test]
    fn btrfs_and_f2fs_use_lowercase_force_flag() {
        for fstype in ["btrfs", "f2fs"] {
            let opts = DeviceSetupOptions {
                fstype,
                test_dev_env: "$TEST_DEV",
                io_scheduler: None,
                custom_mkfs_command: None,
            };
            let script = generate_device_setup_script(&opts);
            assert!(script.contains(&format!("mkfs.{fstype} -f $TEST_DEV")));
        }
    }

    #[test]
    fn custom_mkfs_command_replaces_default_invocation_without_leaking_placeholders() {
        let opts = DeviceSetupOptions {
            fstype: "xfs",
            test_dev_env: "$TEST_DEV",
            io_scheduler: None,
            custom_mkfs_command: Some("mkfs.xfs -f -b size=1k"),
        };
        let script = generate_device_setup_script(&opts);
        assert!(script.contains("mkfs.xfs -f -b size=1k $TEST_DEV"));
        assert!(!script.contains("{fstype}"));
        assert!(script.contains("Formatted $TEST_DEV as xfs"));
    }

    #[test]
    fn custom_mkfs_command_already_referencing_test_dev_is_not_duplicated() {
        let opts = DeviceSetupOptions {
            fstype: "custom",
            test_dev_env: "$TEST_DEV",
            io_scheduler: None,
            custom_mkfs_command: Some("mkfs.myfs -f $TEST_DEV -o special"),
        };
        let script = generate_device_setup_script(&opts);
        assert!(script.contains("mkfs.myfs -f $TEST_DEV -o special"));
        let mkfs_lines: Vec<&str> = script.lines().filter(|l| l.contains("mkfs.myfs")).collect();
        assert_eq!(mkfs_lines.len(), 1);
        assert_eq!(mkfs_lines[0].matches("$TEST_DEV").count(), 1);
    }

    #[test]
    fn io_scheduler_line_is_included_when_requested() {
        let opts = DeviceSetupOptions {
            fstype: "ext4",
            test_dev_env: "$TEST_DEV",
            io_scheduler: Some("none"),
            custom_mkfs_command: None,
        };
        let script = generate_device_setup_script(&opts);
        assert!(script.contains("echo none >"));
    }

    #[test]
    fn config_text_includes_required_exports_in_order() {
        let config = FstestsConfig {
            test_dev: "/dev/loop0",
            test_dir: "/mnt/test",
            scratch_dev: "/dev/loop1",
            scratch_mnt: "/mnt/scratch",
            fstyp: "xfs",
            mount_options: None,
            mkfs_options: None,
            additional_vars: Vec::new(),
        };
        let text = config.to_config_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "export TEST_DEV=/dev/loop0");
        assert_eq!(lines[1], "export TEST_DIR=/mnt/test");
        assert_eq!(lines[2], "export SCRATCH_DEV=/dev/loop1");
        assert_eq!(lines[3], "export SCRATCH_MNT=/mnt/scratch");
        assert_eq!(lines[4], "export FSTYP=xfs");
    }

    #[test]
    fn config_text_quotes_mount_and_mkfs_options_when_present() {
        let config = FstestsConfig {
            test_dev: "/dev/loop0",
            test_dir: "/mnt/test",
            scratch_dev: "/dev/loop1",
            scratch_mnt: "/mnt/scratch",
            fstyp: "ext4",
            mount_options: Some("noatime,nobarrier"),
            mkfs_options: Some("-O metadata_csum"),
            additional_vars: vec![("FSTESTS_AIO".to_string(), "1".to_string())],
        };
        let text = config.to_config_text();
        assert!(text.contains("export MOUNT_OPTIONS=\"noatime,nobarrier\""));
        assert!(text.contains("export MKFS_OPTIONS=\"-O metadata_csum\""));
        assert!(text.contains("export FSTESTS_AIO=\"1\""));
    }

    #[test]
    fn full_run_script_wires_device_setup_env_and_config_together() {
        let device_opts = DeviceSetupOptions {
            fstype: "xfs",
            test_dev_env: "$TEST_DEV",
            io_scheduler: None,
            custom_mkfs_command: None,
        };
        let config = FstestsConfig {
            test_dev: "/dev/loop0",
            test_dir: "/mnt/test",
            scratch_dev: "/dev/loop1",
            scratch_mnt: "/mnt/scratch",
            fstyp: "xfs",
            mount_options: None,
            mkfs_options: None,
            additional_vars: Vec::new(),
        };
        let script = generate_full_run_script(
            &device_opts,
            &config,
            "export SCRATCH_DEV=/dev/loop1\n",
            "/root/fstests",
            &["-g".to_string(), "quick".to_string()],
        );
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("mkfs.xfs -f $TEST_DEV"));
        assert!(script.contains("export SCRATCH_DEV=/dev/loop1"));
        assert!(script.contains("export FSTYP=xfs"));
        assert!(script.contains("cd /root/fstests && ./check -g quick\n"));
    }
}
