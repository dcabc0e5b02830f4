//! Subprocess execution abstraction and PTY-backed VM spawn.
//!
//! Every component elsewhere in this workspace shells out through the
//! [`Exec`] trait rather than `std::process::Command` directly, so
//! tests can inject a fake. `exec(argv, cwd?, timeout?, stdin?)` is the
//! one subprocess primitive the rest of the system depends on.

pub mod exec;
pub mod pty;
pub mod testing;

pub use exec::{ExecOutput, ExecRequest, Exec, HostExec};
