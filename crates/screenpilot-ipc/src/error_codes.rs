//! Semantic error codes for JSON-RPC and envelope errors.
//!
//! Error codes follow the JSON-RPC 2.0 specification:
//! - -32700 to -32600: reserved protocol errors
//! - -32000 to -32099: server errors (domain errors live in -32001..-32010)

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;

// Domain errors
pub const ALREADY_RECORDING: i32 = -32001;
pub const NOT_RECORDING: i32 = -32002;
pub const BACKEND_ERROR: i32 = -32003;
pub const BACKEND_BUSY: i32 = -32004;
pub const RTSTREAM_NOT_FOUND: i32 = -32005;
pub const REQUEST_TIMEOUT: i32 = -32006;
pub const UNKNOWN_TOOL: i32 = -32007;

pub const GENERIC_ERROR: i32 = -32000;

/// Error category for programmatic handling by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    InvalidInput,
    Conflict,
    Internal,
    External,
    Timeout,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Internal => "internal",
            ErrorCategory::External => "external",
            ErrorCategory::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returns whether an error code represents a transient condition.
pub fn is_retryable(code: i32) -> bool {
    matches!(code, BACKEND_BUSY | REQUEST_TIMEOUT | GENERIC_ERROR)
}

pub fn category_for_code(code: i32) -> ErrorCategory {
    match code {
        RTSTREAM_NOT_FOUND | UNKNOWN_TOOL | METHOD_NOT_FOUND => ErrorCategory::NotFound,
        INVALID_PARAMS | INVALID_REQUEST | PARSE_ERROR => ErrorCategory::InvalidInput,
        ALREADY_RECORDING | NOT_RECORDING | BACKEND_BUSY => ErrorCategory::Conflict,
        BACKEND_ERROR => ErrorCategory::External,
        REQUEST_TIMEOUT => ErrorCategory::Timeout,
        _ => ErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_retryable() {
        assert!(is_retryable(BACKEND_BUSY));
        assert!(is_retryable(REQUEST_TIMEOUT));
    }

    #[test]
    fn test_conflicts_are_not_retryable() {
        assert!(!is_retryable(ALREADY_RECORDING));
        assert!(!is_retryable(NOT_RECORDING));
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            category_for_code(ALREADY_RECORDING),
            ErrorCategory::Conflict
        );
        assert_eq!(category_for_code(BACKEND_ERROR), ErrorCategory::External);
        assert_eq!(category_for_code(REQUEST_TIMEOUT), ErrorCategory::Timeout);
        assert_eq!(
            category_for_code(METHOD_NOT_FOUND),
            ErrorCategory::NotFound
        );
        assert_eq!(category_for_code(-1), ErrorCategory::Internal);
    }
}
