use std::time::Duration;

/// Typed error kinds surfaced across the pool/device/VM/fstests layers.
///
/// Call sites further up the stack generally propagate these through
/// `anyhow::Result` with `.with_context(...)`; this enum exists so
/// callers that need to branch on *kind* (a caller deciding whether a
/// failure is retryable, or a report deciding severity) can `match` on
/// it instead of parsing message strings.
#[derive(Debug, thiserror::Error)]
pub enum KdevError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("precheck failed: {0}")]
    Precheck(String),

    #[error("safety check failed: {0}")]
    Safety(String),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("command {cmd:?} exited with status {status}: {stderr}")]
    Exec {
        cmd: Vec<String>,
        status: i32,
        stderr: String,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("state corruption detected: {0}")]
    Corruption(String),
}

impl KdevError {
    /// True for error kinds that represent a caller mistake (bad input,
    /// a safety check that legitimately blocked the operation) rather
    /// than an environment failure that might succeed on retry.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            KdevError::Validation(_) | KdevError::Safety(_) | KdevError::Precheck(_)
        )
    }
}
