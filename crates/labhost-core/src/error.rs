//! Error types for host operations.
//!
//! The taxonomy mirrors how failures are treated by the repair and update
//! flows:
//!
//! - [`HostError::NotApplicable`] is flow control for the repair escalation
//!   chain and is never counted as a failure.
//! - [`HostError::TransientInfra`] is eligible for bounded retry with
//!   devserver re-resolution.
//! - [`HostError::Verification`] ends the current attempt; the repair chain
//!   may escalate, nothing retries it in place.
//! - [`HostError::ConsistencyViolation`] marks a state that will fail later
//!   (for example a wrong kernel priority) and is never retried.
//! - [`HostError::Timeout`] is a bounded wait that ran out.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::rpc::RpcError;

/// Errors raised by host, tunnel, update and repair operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// The operation cannot run with the host's current capabilities.
    #[error("not applicable: {reason}")]
    NotApplicable {
        /// Why the operation does not apply.
        reason: String,
    },

    /// Devserver or network flakiness.
    #[error("transient infrastructure error: {reason}")]
    TransientInfra {
        /// What went wrong.
        reason: String,
    },

    /// The post-operation state does not match what was expected.
    #[error("verification failed: {reason}")]
    Verification {
        /// What did not match.
        reason: String,
    },

    /// The host is in a state that will cause a later failure.
    #[error("consistency invariant violated: {reason}")]
    ConsistencyViolation {
        /// The violated invariant.
        reason: String,
    },

    /// A bounded wait exceeded its budget.
    #[error("timed out after {}s waiting for {what}", timeout.as_secs())]
    Timeout {
        /// What was being waited for.
        what: String,
        /// The budget that was exceeded.
        timeout: Duration,
    },

    /// Lab infrastructure could not provide what the operation needs.
    #[error("infrastructure error: {reason}")]
    Infra {
        /// What is missing.
        reason: String,
    },

    /// A command on the host exited with a non-zero status.
    #[error("command `{command}` failed with exit status {exit_status}: {stderr}")]
    CommandFailed {
        /// The command that was run.
        command: String,
        /// Its exit status.
        exit_status: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// The transport session itself failed (ssh could not connect, etc.).
    #[error("transport error on {hostname}: {reason}")]
    Transport {
        /// Host the session targets.
        hostname: String,
        /// What failed.
        reason: String,
    },

    /// An RPC call failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// A local I/O operation failed.
    #[error("I/O error while {context}: {source}")]
    Io {
        /// What was being done.
        context: &'static str,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Every repair action was exhausted without restoring the host.
    #[error("{}", RepairFailures(.failures))]
    RepairTotalFailure {
        /// Host that could not be repaired.
        hostname: String,
        /// One entry per repair action, in escalation order.
        failures: Vec<RepairFailure>,
    },
}

/// One repair action's failure reason, as carried by
/// [`HostError::RepairTotalFailure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairFailure {
    /// Name of the repair action.
    pub action: String,
    /// Whether the action was skipped as not applicable.
    pub not_applicable: bool,
    /// The recorded error message.
    pub message: String,
}

struct RepairFailures<'a>(&'a [RepairFailure]);

impl fmt::Display for RepairFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "All attempts at repairing the device failed:")?;
        for failure in self.0 {
            write!(f, "\n{}: {}", failure.action, failure.message)?;
        }
        Ok(())
    }
}

impl HostError {
    /// Creates a not-applicable error.
    #[must_use]
    pub fn not_applicable(reason: impl Into<String>) -> Self {
        Self::NotApplicable {
            reason: reason.into(),
        }
    }

    /// Creates a transient infrastructure error.
    #[must_use]
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientInfra {
            reason: reason.into(),
        }
    }

    /// Creates a verification failure.
    #[must_use]
    pub fn verification(reason: impl Into<String>) -> Self {
        Self::Verification {
            reason: reason.into(),
        }
    }

    /// Creates a consistency invariant violation.
    #[must_use]
    pub fn consistency(reason: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            reason: reason.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout,
        }
    }

    /// Creates an infrastructure error.
    #[must_use]
    pub fn infra(reason: impl Into<String>) -> Self {
        Self::Infra {
            reason: reason.into(),
        }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(hostname: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            hostname: hostname.into(),
            reason: reason.into(),
        }
    }

    /// Creates an I/O error with context.
    #[must_use]
    pub const fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Returns true for [`HostError::NotApplicable`].
    #[must_use]
    pub const fn is_not_applicable(&self) -> bool {
        matches!(self, Self::NotApplicable { .. })
    }

    /// Returns true when retrying against different infrastructure could
    /// succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientInfra { .. } => true,
            Self::Rpc(err) => err.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_failure_lists_actions_in_order() {
        let err = HostError::RepairTotalFailure {
            hostname: "dut1".to_string(),
            failures: vec![
                RepairFailure {
                    action: "reboot".to_string(),
                    not_applicable: true,
                    message: "not applicable: DUT unreachable for reboot".to_string(),
                },
                RepairFailure {
                    action: "install".to_string(),
                    not_applicable: false,
                    message: "verification failed: wrong build".to_string(),
                },
            ],
        };

        assert_eq!(
            err.to_string(),
            "All attempts at repairing the device failed:\n\
             reboot: not applicable: DUT unreachable for reboot\n\
             install: verification failed: wrong build"
        );
    }

    #[test]
    fn test_classification() {
        assert!(HostError::not_applicable("no servo").is_not_applicable());
        assert!(!HostError::verification("bad").is_not_applicable());
        assert!(HostError::transient("devserver flake").is_transient());
        assert!(!HostError::consistency("kernel priority").is_transient());
    }
}
