use crate::runtime::ExitStatus;
use crate::transport::{TeamId, TransportError};
use std::backtrace::Backtrace;
use std::process;

/// Errors returned by the public tasking API.
///
/// Resource exhaustion is deliberately absent: a full task pool is handled by
/// back-pressure, never reported to the caller.
#[derive(thiserror::Error, Debug)]
pub enum TaskingError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown team {0}")]
    InvalidTeam(TeamId),

    #[error("No tasking runtime is active on this thread")]
    NoRuntime,

    #[error("Cannot create a new Runtime: a runtime is already active on this thread")]
    AlreadyActive,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("An unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

impl TaskingError {
    /// Returns true if retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskingError::Transport(e) if e.is_retryable())
    }

    /// Returns true if the runtime on this thread can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskingError::Other(_))
    }
}

/// Reports a broken runtime invariant and terminates the process.
///
/// Invariant violations are bugs. Continuing would corrupt the task graph, so
/// we log with a captured backtrace and exit with a code distinct from the
/// cooperative cancellation path.
#[cold]
#[track_caller]
pub(crate) fn invariant_violation(msg: impl AsRef<str>) -> ! {
    let location = std::panic::Location::caller();
    let backtrace = Backtrace::force_capture();

    tracing::error!(
        %location,
        "tasking invariant violated: {}\n{backtrace}",
        msg.as_ref()
    );
    eprintln!(
        "tasking invariant violated at {location}: {}\n{backtrace}",
        msg.as_ref()
    );

    process::exit(ExitStatus::InvariantFailure.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UnitId;
    use static_assertions::assert_impl_all;

    assert_impl_all!(TaskingError: Send, Sync, std::error::Error);

    #[test]
    fn test_error_classification() {
        let err = TaskingError::from(TransportError::Busy);
        assert!(err.is_retryable());
        assert!(!err.is_fatal());

        let err = TaskingError::from(TransportError::UnknownUnit(UnitId(7)));
        assert!(!err.is_retryable());

        let err = TaskingError::from(anyhow::anyhow!("thread spawn failed"));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("thread spawn failed"));
    }
}
