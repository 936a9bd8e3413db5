//! Domain errors for the control plane.
//!
//! `ControlError` is caught at every IPC handler boundary and converted to
//! the uniform `{status: "error"}` envelope; a faulty command never
//! terminates the process.

use screenpilot_ipc::error_codes;
use screenpilot_ipc::error_codes::ErrorCategory;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Already recording")]
    AlreadyRecording,
    #[error("Not recording")]
    NotRecording,
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Backend busy: {0}")]
    Busy(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Rtstream not found: {0}")]
    RtstreamNotFound(String),
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn code(&self) -> i32 {
        match self {
            ControlError::AlreadyRecording => error_codes::ALREADY_RECORDING,
            ControlError::NotRecording => error_codes::NOT_RECORDING,
            ControlError::Backend(_) => error_codes::BACKEND_ERROR,
            ControlError::Busy(_) => error_codes::BACKEND_BUSY,
            ControlError::Timeout(_) => error_codes::REQUEST_TIMEOUT,
            ControlError::RtstreamNotFound(_) => error_codes::RTSTREAM_NOT_FOUND,
            ControlError::UnknownChannel(_) => error_codes::INVALID_PARAMS,
            ControlError::Internal(_) => error_codes::GENERIC_ERROR,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        error_codes::category_for_code(self.code())
    }

    pub fn is_retryable(&self) -> bool {
        error_codes::is_retryable(self.code())
    }
}

/// Daemon startup and lifecycle errors.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to bind API listener: {0}")]
    ApiBind(String),
    #[error("Failed to bind bridge socket: {0}")]
    BridgeBind(String),
    #[error("Failed to prepare state directory: {0}")]
    StateDir(String),
    #[error("Failed to construct backend client: {0}")]
    BackendInit(String),
    #[error("Failed to setup signal handler: {0}")]
    SignalSetup(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_errors_map_to_conflict_category() {
        assert_eq!(
            ControlError::AlreadyRecording.category(),
            ErrorCategory::Conflict
        );
        assert_eq!(
            ControlError::NotRecording.category(),
            ErrorCategory::Conflict
        );
    }

    #[test]
    fn test_busy_is_retryable_conflict_is_not() {
        assert!(ControlError::Busy("previous session".into()).is_retryable());
        assert!(!ControlError::AlreadyRecording.is_retryable());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(ControlError::AlreadyRecording.to_string(), "Already recording");
        assert_eq!(ControlError::NotRecording.to_string(), "Not recording");
        assert_eq!(
            ControlError::Backend("503".into()).to_string(),
            "Backend error: 503"
        );
    }
}
