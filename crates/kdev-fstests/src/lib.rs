//! Fstests Orchestrator: guest setup-script synthesis, check-log
//! parsing, baseline storage, and git-notes persistence.

pub mod baseline;
pub mod check_log;
pub mod git_notes;
pub mod setup_script;
pub mod validation;

pub use baseline::{BaselineStore, compare, generate_exclude_list};
pub use check_log::{parse_check_log_file, parse_check_output};
pub use git_notes::GitNotesStore;
pub use setup_script::{DeviceSetupOptions, FstestsConfig, generate_device_setup_script, generate_full_run_script};
pub use validation::{validate_fstype, validate_test_args};
