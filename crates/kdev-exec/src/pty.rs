//! Pseudo-terminal-backed child spawn.
//!
//! The VM binary refuses to start without a controlling TTY, so a
//! plain pipe pair is not a legal substitute for its stdio. This
//! module opens a PTY pair, forks the child as a new session leader
//! with the slave end as stdin/stdout/stderr, and gives the caller a
//! drained-by-polling master fd plus the child's pid/pgid for
//! process-group-wide signal delivery.

use anyhow::{Context, Result};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::{OpenptyResult, openpty};
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, setsid};
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;

/// A running PTY-backed child. The session/process-group id equals
/// the child's pid because it was made a session leader at spawn time.
pub struct PtyChild {
    pub pid: Pid,
    master: OwnedFd,
}

impl PtyChild {
    /// Spawn `argv` with a fresh PTY as its controlling terminal,
    /// placing the child in a new session/process group.
    pub fn spawn(argv: &[String], cwd: Option<&std::path::Path>) -> Result<Self> {
        let (program, args) = argv.split_first().context("empty argv passed to PTY spawn")?;

        let OpenptyResult { master, slave } = openpty(None, None).context("openpty failed")?;

        // Nonblocking reads on the master so the poll loop never stalls
        // waiting on a quiet child.
        let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL).context("fcntl F_GETFL")?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(master.as_raw_fd(), FcntlArg::F_SETFL(flags)).context("fcntl F_SETFL")?;

        let slave_fd = slave.as_raw_fd();
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        // SAFETY: pre_exec runs in the forked child before execve; it
        // only touches fds local to this process and calls
        // setsid()/dup2(), both async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                setsid().map_err(std::io::Error::from)?;
                if libc::dup2(slave_fd, 0) < 0
                    || libc::dup2(slave_fd, 1) < 0
                    || libc::dup2(slave_fd, 2) < 0
                {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let child = cmd.spawn().with_context(|| format!("failed to spawn {:?}", argv))?;
        let pid = Pid::from_raw(child.id() as i32);
        // The slave fd is owned by `slave`, which drops (and closes)
        // here in the parent once the child has its own dup'd copies.
        drop(slave);
        std::mem::forget(child); // reaping happens via waitpid in wait()/kill_group()

        Ok(Self { pid, master })
    }

    /// Nonblocking drain of whatever the child has written since the
    /// last call. Returns an empty vec when nothing is ready.
    pub fn drain(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 8192];
        let mut out = Vec::new();
        let mut file = unsafe {
            use std::os::fd::FromRawFd;
            std::mem::ManuallyDrop::new(std::fs::File::from_raw_fd(self.master.as_raw_fd()))
        };
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        out
    }

    /// Non-blocking check of whether the child has exited.
    pub fn try_wait(&self) -> Result<Option<i32>> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::Exited(_, code) => Ok(Some(code)),
            WaitStatus::Signaled(..) => Ok(Some(-1)),
            _ => Ok(None),
        }
    }

    /// Block until the child exits, returning its exit code (or -1 if
    /// it died from a signal).
    pub fn wait(&self) -> Result<i32> {
        match waitpid(self.pid, None)? {
            WaitStatus::Exited(_, code) => Ok(code),
            _ => Ok(-1),
        }
    }

    /// Send SIGKILL to the entire process group and reap it.
    pub fn kill_group(&self) -> Result<()> {
        let _ = killpg(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
        Ok(())
    }
}

/// Default poll interval for the output-drain loop (`≈100ms`, per
/// the runner's deadline-checking cadence).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
