//! Rollback guard for LVM pool setup.
//!
//! A pool is built in stages (PV, then VG, then LVs); a failure partway
//! through must not leave orphaned LVM structures or a clobbered
//! partition table behind. `TransactionGuard` snapshots the partition
//! table on construction and, unless `commit()` is called, tears
//! everything it was told about back down on `Drop`.

use kdev_exec::{Exec, ExecRequest};
use std::sync::Mutex;
use std::time::Duration;

/// Tracks PVs/VGs/LVs created while setting up a pool and undoes them
/// in reverse order if the setup is abandoned without a commit.
pub struct TransactionGuard<'a> {
    exec: &'a dyn Exec,
    device: String,
    partition_table_backup: Option<Vec<u8>>,
    created_pvs: Mutex<Vec<String>>,
    created_vgs: Mutex<Vec<String>>,
    created_lvs: Mutex<Vec<String>>,
    committed: Mutex<bool>,
}

impl<'a> TransactionGuard<'a> {
    /// Begin a transaction, backing up `device`'s partition table if
    /// `sgdisk` is available. A failed backup is logged and treated as
    /// "nothing to restore" rather than aborting the transaction.
    pub fn begin(exec: &'a dyn Exec, device: impl Into<String>) -> Self {
        let device = device.into();
        tracing::info!(device = %device, "starting transactional device setup");

        let partition_table_backup = exec
            .exec(
                &ExecRequest::new(["sgdisk", "--backup=/dev/stdout", &device])
                    .sudo_if_enabled()
                    .with_timeout(Duration::from_secs(10)),
            )
            .ok()
            .filter(|out| out.success())
            .map(|out| out.stdout);

        if partition_table_backup.is_some() {
            tracing::debug!("partition table backed up");
        } else {
            tracing::warn!("could not back up partition table; rollback will not restore it");
        }

        Self {
            exec,
            device,
            partition_table_backup,
            created_pvs: Mutex::new(Vec::new()),
            created_vgs: Mutex::new(Vec::new()),
            created_lvs: Mutex::new(Vec::new()),
            committed: Mutex::new(false),
        }
    }

    pub fn record_pv(&self, pv: impl Into<String>) {
        self.created_pvs.lock().unwrap().push(pv.into());
    }

    pub fn record_vg(&self, vg: impl Into<String>) {
        self.created_vgs.lock().unwrap().push(vg.into());
    }

    pub fn record_lv(&self, lv: impl Into<String>) {
        self.created_lvs.lock().unwrap().push(lv.into());
    }

    /// Mark the transaction as successful; `Drop` becomes a no-op.
    pub fn commit(self) {
        *self.committed.lock().unwrap() = true;
        tracing::info!(device = %self.device, "transaction completed successfully");
    }

    fn rollback(&self) {
        tracing::info!(device = %self.device, "rolling back changes");

        for lv in self.created_lvs.lock().unwrap().iter().rev() {
            match self.exec.exec(
                &ExecRequest::new(["lvremove", "-f", lv])
                    .sudo_if_enabled()
                    .with_timeout(Duration::from_secs(10)),
            ) {
                Ok(out) if out.success() => tracing::info!(lv = %lv, "removed LV"),
                Ok(out) => tracing::error!(lv = %lv, stderr = %out.stderr_string(), "failed to remove LV"),
                Err(e) => tracing::error!(lv = %lv, error = %e, "failed to remove LV"),
            }
        }

        for vg in self.created_vgs.lock().unwrap().iter().rev() {
            match self.exec.exec(
                &ExecRequest::new(["vgremove", "-f", vg])
                    .sudo_if_enabled()
                    .with_timeout(Duration::from_secs(10)),
            ) {
                Ok(out) if out.success() => tracing::info!(vg = %vg, "removed VG"),
                Ok(out) => tracing::error!(vg = %vg, stderr = %out.stderr_string(), "failed to remove VG"),
                Err(e) => tracing::error!(vg = %vg, error = %e, "failed to remove VG"),
            }
        }

        for pv in self.created_pvs.lock().unwrap().iter().rev() {
            match self.exec.exec(
                &ExecRequest::new(["pvremove", "-f", pv])
                    .sudo_if_enabled()
                    .with_timeout(Duration::from_secs(10)),
            ) {
                Ok(out) if out.success() => tracing::info!(pv = %pv, "removed PV"),
                Ok(out) => tracing::error!(pv = %pv, stderr = %out.stderr_string(), "failed to remove PV"),
                Err(e) => tracing::error!(pv = %pv, error = %e, "failed to remove PV"),
            }
        }

        if let Some(backup) = &self.partition_table_backup {
            self.restore_partition_table(backup);
        }

        tracing::info!("rollback complete");
    }

    fn restore_partition_table(&self, backup: &[u8]) {
        let Ok(mut tmp) = tempfile::NamedTempFile::new() else {
            tracing::error!("failed to create temp file for partition table restore");
            return;
        };
        use std::io::Write;
        if tmp.write_all(backup).is_err() {
            tracing::error!("failed to write partition table backup to temp file");
            return;
        }
        let backup_path = tmp.path().to_string_lossy().to_string();

        match self.exec.exec_checked(
            &ExecRequest::new([
                "sgdisk",
                &format!("--load-backup={}", backup_path),
                &self.device,
            ])
            .sudo_if_enabled()
            .with_timeout(Duration::from_secs(10)),
        ) {
            Ok(_) => tracing::info!("partition table restored"),
            Err(e) => tracing::error!(error = %e, "failed to restore partition table"),
        }
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !*self.committed.lock().unwrap() {
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdev_exec::testing::{MockExec, MockResponse};

    // Destructive commands go through `sudo_if_enabled()`, and
    // `KDEV_NO_SUDO` is a process-wide env var shared by every test in
    // this binary, so these assertions match on the `sudo <argv>`
    // prefix actually recorded rather than toggling that env var.

    #[test]
    fn commit_skips_rollback() {
        let exec = MockExec::new();
        exec.on(["sudo", "sgdisk", "--backup=/dev/stdout"], MockResponse::ok("backup-bytes"));
        let txn = TransactionGuard::begin(&exec, "/dev/loop0");
        txn.record_pv("/dev/loop0");
        txn.commit();
        assert!(!exec.was_called_with_prefix(["sudo", "pvremove"]));
    }

    #[test]
    fn drop_without_commit_removes_in_reverse_order() {
        let exec = MockExec::new();
        exec.on(["sudo", "sgdisk", "--backup=/dev/stdout"], MockResponse::ok("backup-bytes"));
        exec.on(["sudo", "lvremove"], MockResponse::ok(""));
        exec.on(["sudo", "vgremove"], MockResponse::ok(""));
        exec.on(["sudo", "pvremove"], MockResponse::ok(""));
        exec.on(["sudo", "sgdisk", "--load-backup"], MockResponse::ok(""));
        {
            let txn = TransactionGuard::begin(&exec, "/dev/loop0");
            txn.record_pv("/dev/loop0");
            txn.record_vg("vg-test");
            txn.record_lv("/dev/vg-test/lv-test");
        }
        assert!(exec.was_called_with_prefix(["sudo", "lvremove"]));
        assert!(exec.was_called_with_prefix(["sudo", "vgremove"]));
        assert!(exec.was_called_with_prefix(["sudo", "pvremove"]));

        let calls = exec.calls();
        let lv_pos = calls.iter().position(|c| c[1] == "lvremove").unwrap();
        let vg_pos = calls.iter().position(|c| c[1] == "vgremove").unwrap();
        let pv_pos = calls.iter().position(|c| c[1] == "pvremove").unwrap();
        assert!(lv_pos < vg_pos);
        assert!(vg_pos < pv_pos);
    }

    #[test]
    fn missing_backup_skips_restore_but_still_removes_structures() {
        let exec = MockExec::new();
        exec.on(["sudo", "sgdisk", "--backup=/dev/stdout"], MockResponse::failure(1, "no sgdisk"));
        exec.on(["sudo", "pvremove"], MockResponse::ok(""));
        {
            let txn = TransactionGuard::begin(&exec, "/dev/loop0");
            txn.record_pv("/dev/loop0");
        }
        assert!(exec.was_called_with_prefix(["sudo", "pvremove"]));
        assert!(!exec.was_called_with_prefix(["sudo", "sgdisk", "--load-backup"]));
    }
}
