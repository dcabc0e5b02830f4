//! Hands an ephemeral LV over to the invoking user after creation.
//!
//! LVM creates devices owned by root; a logical volume is useless to
//! the caller until its ownership and permissions are relaxed. This
//! grants read/write access by chown'ing the device to the invoking
//! user and the `disk` group rather than requiring the user be a
//! permanent member of `disk` (which would grant access to every block
//! device on the system, not just this one ephemeral LV).

use kdev_exec::{Exec, ExecRequest};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Number of 100ms polls to wait for the LV device node to appear
/// before giving up.
const DEVICE_SETTLE_ATTEMPTS: u32 = 20;
const DEVICE_SETTLE_INTERVAL: Duration = Duration::from_millis(100);

/// Resolve the username access should be granted to: `SUDO_USER`, then
/// `USER`, falling back to whatever the current uid resolves to.
fn invoking_username() -> String {
    if let Ok(user) = env::var("SUDO_USER") {
        if !user.is_empty() {
            return user;
        }
    }
    if let Ok(user) = env::var("USER") {
        if !user.is_empty() {
            return user;
        }
    }
    current_uid_username().unwrap_or_else(|| "root".to_string())
}

#[cfg(unix)]
fn current_uid_username() -> Option<String> {
    // SAFETY: getpwuid_r-free lookup; libc::getpwuid returns a pointer
    // into static storage that is only read here, never stored.
    unsafe {
        let uid = libc::getuid();
        let pw = libc::getpwuid(uid);
        if pw.is_null() {
            return None;
        }
        let name = std::ffi::CStr::from_ptr((*pw).pw_name);
        Some(name.to_string_lossy().into_owned())
    }
}

#[cfg(not(unix))]
fn current_uid_username() -> Option<String> {
    None
}

/// Grant the invoking user read/write access to a freshly created LV.
///
/// Waits for the device node to appear, lets `udevadm settle` finish
/// processing it, then chowns it (and its `/dev/mapper/...` symlink
/// target, if different) to `user:disk` and sets mode 0660. Returns
/// `true` only once the device has been confirmed openable read/write.
///
/// Sufficient for ephemeral LVs torn down after each run; it is not a
/// substitute for adding the user to the `disk` group for persistent
/// access.
pub fn grant_volume_access(exec: &dyn Exec, lv_path: &str) -> bool {
    let username = invoking_username();
    let device_path = Path::new(lv_path);

    let mut appeared = false;
    for _ in 0..DEVICE_SETTLE_ATTEMPTS {
        if device_path.exists() {
            appeared = true;
            break;
        }
        std::thread::sleep(DEVICE_SETTLE_INTERVAL);
    }
    if !appeared {
        tracing::error!(lv = %lv_path, "device did not appear after creation");
        return false;
    }

    match exec.exec(
        &ExecRequest::new(["sudo", "udevadm", "settle", "--timeout=5"])
            .with_timeout(Duration::from_secs(10)),
    ) {
        Ok(out) if out.success() => {}
        Ok(out) => tracing::debug!(stderr = %out.stderr_string(), "udevadm settle failed, proceeding anyway"),
        Err(_) => tracing::debug!("udevadm not found, proceeding without settle"),
    }

    let actual_path = fs::canonicalize(device_path).unwrap_or_else(|_| device_path.to_path_buf());
    if actual_path != device_path {
        tracing::debug!(from = %lv_path, to = %actual_path.display(), "resolved LV symlink");
    }
    let actual_str = actual_path.to_string_lossy().to_string();

    let chown_group = format!("{username}:disk");
    match exec.exec_checked(
        &ExecRequest::new(["sudo", "chown", &chown_group, &actual_str])
            .with_timeout(Duration::from_secs(5)),
    ) {
        Ok(_) => {}
        Err(e) => {
            tracing::error!(lv = %lv_path, error = %e, "failed to change ownership");
            return false;
        }
    }

    if actual_path != device_path {
        if let Err(e) = exec.exec_checked(
            &ExecRequest::new(["sudo", "chown", "-h", &chown_group, lv_path])
                .with_timeout(Duration::from_secs(5)),
        ) {
            tracing::error!(lv = %lv_path, error = %e, "failed to change ownership of symlink");
            return false;
        }
    }
    tracing::debug!(lv = %lv_path, user = %username, "changed ownership");

    if let Err(e) = exec.exec_checked(
        &ExecRequest::new(["sudo", "chmod", "660", &actual_str])
            .with_timeout(Duration::from_secs(5)),
    ) {
        tracing::error!(lv = %lv_path, error = %e, "failed to chmod device");
        return false;
    }

    match fs::OpenOptions::new().read(true).write(true).open(lv_path) {
        Ok(_) => {
            tracing::info!(lv = %lv_path, user = %username, "granted read/write access");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            tracing::error!(
                lv = %lv_path,
                "cannot access device even after ownership change; user may need to join the 'disk' group \
                 (this grants access to ALL block devices on the system)"
            );
            false
        }
        Err(e) => {
            tracing::error!(lv = %lv_path, error = %e, "failed to verify access");
            false
        }
    }
}
