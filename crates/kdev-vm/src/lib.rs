//! VM Runner (PTY spawn, process-group tracking, deadline/cancellation
//! enforcement), its Process Registry, and the Dmesg Classifier that
//! turns a raw boot log into panics/oops/errors/warnings.

pub mod dmesg;
pub mod process_registry;
pub mod runner;

pub use process_registry::{KillReport, ProcessRegistry, VmRegistration};
pub use runner::{CancelToken, RunSpec, VmRunner};
