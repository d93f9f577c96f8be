//! Resubmission filter for failed legs.
//!
//! A connection classifies every failure it hands out (see
//! [`FailureClass`]). This module decides what the resubmit loop does with
//! one: send the request again, move on to the next proxy, or surface it.

use crate::base::neterror::{FailureClass, NetError, RequestFailure};

/// Why a leg is being sent again. Used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// Server closed connection unexpectedly
    ConnectionReset,
    /// Connection was closed before a response
    ConnectionClosed,
    /// A reused connection had gone away
    KeepAliveFailure,
    /// An earlier request on the same pipeline failed
    PipelineFailure,
    /// Connection was aborted
    ConnectionAborted,
    /// Connect attempt failed
    ConnectFailure,
    Other,
}

impl RetryReason {
    pub fn from_error(error: &NetError) -> Self {
        match error {
            NetError::ConnectionReset => Self::ConnectionReset,
            NetError::ConnectionClosed | NetError::EmptyResponse => Self::ConnectionClosed,
            NetError::KeepAliveFailure => Self::KeepAliveFailure,
            NetError::PipelineFailure => Self::PipelineFailure,
            NetError::ConnectionAborted => Self::ConnectionAborted,
            e if e.is_connect_failure() => Self::ConnectFailure,
            _ => Self::Other,
        }
    }
}

/// What the resubmit loop does with a failed leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Send the same leg again on another connection.
    Resubmit(RetryReason),
    /// The proxy is unusable; try the next one in the chain.
    Failover,
    /// Give the failure to the caller.
    Surface,
}

/// Decide what to do with `failure`.
///
/// Isolated failures always go again. Recoverable ones go again only if
/// the request has not failed before. A service-point failure moves to
/// the next proxy when there is one.
pub fn failure_action(failure: &RequestFailure, once_failed: bool, has_next_proxy: bool) -> FailureAction {
    match failure.class {
        FailureClass::ServicePointFatal if has_next_proxy => FailureAction::Failover,
        FailureClass::ServicePointFatal => FailureAction::Surface,
        FailureClass::RequestFatal => FailureAction::Surface,
        _ if failure.may_resubmit(once_failed) => FailureAction::Resubmit(RetryReason::from_error(&failure.error)),
        _ => FailureAction::Surface,
    }
}

/// The failure the caller eventually sees. A fatal failure is never
/// replaced by a later non-fatal one.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureRecord {
    last: Option<RequestFailure>,
}

impl FailureRecord {
    pub fn record(&mut self, failure: RequestFailure) {
        let keep_existing = matches!(self.last, Some(last) if last.is_fatal() && !failure.is_fatal());
        if !keep_existing {
            self.last = Some(failure);
        }
    }

    pub fn last(&self) -> Option<RequestFailure> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolated_always_resubmits() {
        let f = RequestFailure::isolated(NetError::KeepAliveFailure);
        assert_eq!(failure_action(&f, true, false), FailureAction::Resubmit(RetryReason::KeepAliveFailure));
    }

    #[test]
    fn test_recoverable_resubmits_once() {
        let f = RequestFailure::recoverable(NetError::ConnectionReset);
        assert_eq!(failure_action(&f, false, false), FailureAction::Resubmit(RetryReason::ConnectionReset));
        assert_eq!(failure_action(&f, true, false), FailureAction::Surface);
    }

    #[test]
    fn test_service_point_failure_fails_over() {
        let f = RequestFailure::new(NetError::ProxyConnectionFailed, FailureClass::ServicePointFatal);
        assert_eq!(failure_action(&f, true, true), FailureAction::Failover);
        assert_eq!(failure_action(&f, false, false), FailureAction::Surface);
    }

    #[test]
    fn test_fatal_surfaces() {
        let f = RequestFailure::fatal(NetError::ReadTimedOut);
        assert_eq!(failure_action(&f, false, true), FailureAction::Surface);
    }

    #[test]
    fn test_fatal_is_not_replaced() {
        let mut record = FailureRecord::default();
        record.record(RequestFailure::fatal(NetError::ResponseHeadersTooBig));
        record.record(RequestFailure::recoverable(NetError::ConnectionReset));
        assert_eq!(record.last().unwrap().error, NetError::ResponseHeadersTooBig);

        record.record(RequestFailure::fatal(NetError::TimedOut));
        assert_eq!(record.last().unwrap().error, NetError::TimedOut);
    }
}
