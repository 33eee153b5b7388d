//! Exit codes for the ke-core CLI.
//!
//! Exit codes communicate the outcome class without requiring output
//! parsing. They follow the decade grouping of [`Error::code`].

use ke_common::Error;

/// Exit codes for ke-core operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success
    Ok = 0,

    /// Configuration error (bad config file, invalid source registration)
    ConfigError = 10,

    /// Input error (no usable observations, bad request, bad horizon)
    InputError = 20,

    /// Numerical instability beyond repair
    NumericalError = 30,

    /// Lifecycle error (not initialized, already initialized, stale calibration)
    LifecycleError = 40,

    /// Persistence failure; the cycle was not committed and may be retried
    PersistenceError = 50,

    /// Internal/unknown error
    InternalError = 99,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Ok
    }

    /// Retrying the same command may succeed.
    pub fn is_retryable(self) -> bool {
        self == ExitCode::PersistenceError
    }
}

impl From<&Error> for ExitCode {
    fn from(err: &Error) -> Self {
        match err.code() / 10 {
            1 => ExitCode::ConfigError,
            // I/O and JSON errors at the CLI boundary come from reading input
            2 | 6 => ExitCode::InputError,
            3 => ExitCode::NumericalError,
            4 => ExitCode::LifecycleError,
            5 => ExitCode::PersistenceError,
            _ => ExitCode::InternalError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code.as_i32()
    }
}
