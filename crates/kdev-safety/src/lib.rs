//! Safety Validator: the gate that stands between a raw block device
//! path and turning it into an LVM pool, plus the transactional
//! rollback guard used while that pool is being created.

pub mod access;
pub mod transaction;
pub mod validator;

pub use transaction::TransactionGuard;
pub use validator::{CheckResult, Severity, ValidationReport, validate_device};
