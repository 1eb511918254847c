use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exertion::ExertionId;
use crate::lease::Cookie;

/// Errors raised by context path access, writes and link resolution.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextError {
    #[error("path not found: '{0}'")]
    PathNotFound(String),

    #[error("path '{0}' is input-only and cannot be written by a provider")]
    DirectionViolation(String),

    #[error("link at '{path}' is broken: target context {target} is unavailable")]
    BrokenLink { path: String, target: String },

    #[error("circular link at '{0}'")]
    CircularLink(String),

    #[error("invalid path: '{0}'")]
    InvalidPath(String),

    #[error("value at '{path}' is not {expected}")]
    TypeMismatch { path: String, expected: String },
}

/// Errors raised while evaluating an If/While condition.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionError {
    #[error("condition '{expression}' references unbound variable '{variable}'")]
    UnboundVariable { expression: String, variable: String },

    #[error("variable '{variable}' could not be read: {source}")]
    Binding {
        variable: String,
        #[source]
        source: ContextError,
    },

    #[error("condition '{expression}' failed to evaluate: {message}")]
    Evaluation { expression: String, message: String },
}

/// Raised when a pull submission is never claimed, or a synchronous wait
/// exceeds its bound.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("dispatch of {exertion} timed out after {waited:?} (claimed: {claimed})")]
pub struct DispatchTimeoutError {
    pub exertion: ExertionId,
    pub waited: Duration,
    pub claimed: bool,
}

/// Operation on a lease cookie the manager does not hold.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("unknown lease: {0}")]
pub struct UnknownLeaseError(pub Cookie);

/// Errors raised by [`crate::ExertionMonitor`] operations.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorError {
    #[error("exertion {0} is not monitored")]
    NotMonitored(ExertionId),

    #[error(transparent)]
    UnknownLease(#[from] UnknownLeaseError),
}

/// Errors raised while turning an exertion into an execution schedule.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchError {
    #[error("no provider for signature {signature}")]
    ProviderNotFound { signature: String },

    #[error("provider invocation {signature} failed: {message}")]
    Invocation { signature: String, message: String },

    #[error("upstream dependency failed: {upstream} did not complete before {exertion}")]
    UpstreamFailed { exertion: String, upstream: String },

    #[error("{exertion} was cancelled before it started")]
    Cancelled { exertion: String },

    #[error("invalid composition: {0}")]
    InvalidComposition(String),

    #[error("pull dispatch requested for {exertion} but no exertion space is configured")]
    NoSpace { exertion: String },

    #[error("exertion space error: {0}")]
    Space(String),

    #[error("{exertion} exceeded its iteration limit of {limit}")]
    IterationLimit { exertion: String, limit: u64 },

    #[error("lease for {exertion} ended: {reason}")]
    LeaseEnded { exertion: String, reason: String },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Condition(#[from] ConditionError),
}

/// Invalid engine configuration value.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Umbrella error stored in a control context's exception list.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExertError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Timeout(#[from] DispatchTimeoutError),

    #[error(transparent)]
    UnknownLease(#[from] UnknownLeaseError),

    #[error(transparent)]
    Condition(#[from] ConditionError),
}

impl ExertError {
    /// Short, stable label used for log fields and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ExertError::Context(_) => "context",
            ExertError::Dispatch(DispatchError::UpstreamFailed { .. }) => {
                "upstream_failed"
            }
            ExertError::Dispatch(DispatchError::Cancelled { .. }) => "cancelled",
            ExertError::Dispatch(_) => "dispatch",
            ExertError::Timeout(_) => "timeout",
            ExertError::UnknownLease(_) => "unknown_lease",
            ExertError::Condition(_) => "condition",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_reports_claim_state() {
        let err = DispatchTimeoutError {
            exertion: ExertionId::new(),
            waited: Duration::from_millis(500),
            claimed: false,
        };
        assert!(err.to_string().contains("claimed: false"));

        let err = DispatchTimeoutError { claimed: true, ..err };
        assert!(err.to_string().contains("claimed: true"));
    }

    #[test]
    fn test_error_kind_labels() {
        let upstream: ExertError = DispatchError::UpstreamFailed {
            exertion: "t2".into(),
            upstream: "t1".into(),
        }
        .into();
        assert_eq!(upstream.kind(), "upstream_failed");

        let missing: ExertError =
            ContextError::PathNotFound("arg/x".into()).into();
        assert_eq!(missing.kind(), "context");
    }

    #[test]
    fn test_context_error_wraps_into_dispatch_error() {
        let err: DispatchError =
            ContextError::DirectionViolation("arg/x1".into()).into();
        assert_eq!(
            err.to_string(),
            "path 'arg/x1' is input-only and cannot be written by a provider"
        );
    }
}
