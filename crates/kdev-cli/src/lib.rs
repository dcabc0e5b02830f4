//! kdev-cli: `kdevctl`'s clap command tree, orchestration glue, and
//! terminal UI. Depends on every other crate in the workspace.

pub mod commands;
pub mod logging;
pub mod profiles;
pub mod session;
pub mod ui;

pub use commands::run;
