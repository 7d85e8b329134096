//! Error taxonomy for a burn run.
//!
//! Every fatal condition in `amlburn` is funneled into one of the variants
//! below before it reaches the user. The engine is the only place that
//! decides terminality; components return these errors, they never abort on
//! their own. Each variant maps to a distinct process exit code so that CI
//! wrappers can tell a misconfigured run from a board that failed to flash.

use thiserror::Error;

/// All the ways a burn run can fail.
#[derive(Debug, Error)]
pub enum BurnError {
    /// The run was rejected before the state machine started: bad
    /// configuration, missing or truncated image, serial port not available,
    /// relay configured but unreachable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Serial open/read/write failure during the run.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened or configured.
    #[error("serial port error: {0}")]
    Port(#[from] serialport::Error),

    /// `adnl_burn_pkg` could not be started at all (binary missing,
    /// permission denied). Distinct from a flash that started and failed.
    #[error("failed to launch flashing tool: {0}")]
    SubprocessLaunch(String),

    /// The flashing tool started but reported a burn failure or exited with
    /// an error status. A domain-expected failure mode (cable, board), not a
    /// programming defect.
    #[error("flash failed: {0}")]
    FlashFailure(String),

    /// A watchdog deadline fired. Carries which deadline and the state at
    /// the time.
    #[error("timeout in state {state}: {reason}")]
    Timeout { state: String, reason: String },
}

impl BurnError {
    /// Process exit code for this error. `0` is reserved for a completed
    /// run.
    pub fn exit_code(&self) -> i32 {
        match self {
            BurnError::Validation(_) => 2,
            BurnError::Timeout { .. } => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_class() {
        assert_eq!(BurnError::Validation("x".into()).exit_code(), 2);
        assert_eq!(
            BurnError::Timeout {
                state: "INIT".into(),
                reason: "no serial data".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(BurnError::FlashFailure("x".into()).exit_code(), 1);
        assert_eq!(BurnError::SubprocessLaunch("x".into()).exit_code(), 1);
    }
}
