use anyhow::{Context, Result};
use kdev_core::KdevError;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// One subprocess invocation request.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: Option<Vec<u8>>,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Prefix the command with `sudo` when it is a privileged operation
    /// and `kdev_core::config::use_sudo()` is enabled.
    pub fn sudo_if_enabled(mut self) -> Self {
        if kdev_core::config::use_sudo() {
            self.argv.insert(0, "sudo".to_string());
        }
        self
    }
}

/// Captured result of a subprocess invocation.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Subprocess execution abstraction. Implemented for real use by
/// [`HostExec`] and faked in tests via `kdev_exec::testing::MockExec`.
pub trait Exec: Send + Sync {
    fn exec(&self, req: &ExecRequest) -> Result<ExecOutput>;

    /// Convenience wrapper: run and require a zero exit status.
    fn exec_checked(&self, req: &ExecRequest) -> Result<ExecOutput> {
        let out = self.exec(req)?;
        if !out.success() {
            return Err(KdevError::Exec {
                cmd: req.argv.clone(),
                status: out.status,
                stderr: out.stderr_string(),
            }
            .into());
        }
        Ok(out)
    }
}

/// Real subprocess execution via `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostExec;

impl Exec for HostExec {
    fn exec(&self, req: &ExecRequest) -> Result<ExecOutput> {
        let (program, args) = req
            .argv
            .split_first()
            .context("empty argv passed to exec()")?;

        tracing::debug!(argv = ?req.argv, "exec");

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &req.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(if req.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn: {}", req.argv.join(" ")))?;

        if let Some(input) = &req.stdin {
            use std::io::Write;
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(input);
            }
        }

        let output = match req.timeout {
            None => child
                .wait_with_output()
                .with_context(|| format!("failed to wait for: {}", req.argv.join(" ")))?,
            Some(timeout) => wait_with_timeout(child, timeout, &req.argv)?,
        };

        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

fn wait_with_timeout(
    mut child: std::process::Child,
    timeout: Duration,
    argv: &[String],
) -> Result<std::process::Output> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(_status) = child.try_wait()? {
            return child
                .wait_with_output()
                .with_context(|| format!("failed to collect output for: {}", argv.join(" ")));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(KdevError::Timeout(timeout).into());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_exec_runs_true_and_false() {
        let exec = HostExec;
        let out = exec.exec(&ExecRequest::new(["true"])).unwrap();
        assert!(out.success());

        let out = exec.exec(&ExecRequest::new(["false"])).unwrap();
        assert!(!out.success());
    }

    #[test]
    fn exec_checked_returns_exec_error_on_nonzero_status() {
        let exec = HostExec;
        let err = exec.exec_checked(&ExecRequest::new(["false"])).unwrap_err();
        assert!(err.to_string().contains("exited with status"));
    }

    #[test]
    fn stdout_is_captured() {
        let exec = HostExec;
        let out = exec
            .exec(&ExecRequest::new(["echo", "hello"]))
            .unwrap();
        assert_eq!(out.stdout_string(), "hello");
    }

    #[test]
    fn timeout_kills_long_running_command() {
        let exec = HostExec;
        let req = ExecRequest::new(["sleep", "5"]).with_timeout(Duration::from_millis(50));
        let err = exec.exec(&req).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
