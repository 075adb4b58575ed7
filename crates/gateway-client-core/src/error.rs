//! Error taxonomy for the session layer.

use std::time::Duration;

use thiserror::Error;

use crate::envelope::{HandleId, RemoteFault, SessionId};

/// Failure of a single request/response exchange.
///
/// Surfaced to the caller that issued the request; never retried
/// automatically.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The gateway answered with an explicit error status.
    #[error("remote error {code}: {reason}")]
    Remote {
        /// Numeric code reported by the gateway.
        code: i64,
        /// Human-readable reason reported by the gateway.
        reason: String,
    },
    /// No correlated reply arrived within the configured window.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// The outbound channel is closed or the session is gone.
    #[error("transport channel closed")]
    Disconnected,
    /// A success reply was missing a required field.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(&'static str),
    /// Attach was called on a handle that already holds a remote identifier.
    #[error("handle already attached")]
    AlreadyAttached,
}

impl RequestError {
    /// Numeric remote error code, if this is a remote error.
    #[must_use]
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<RemoteFault> for RequestError {
    fn from(fault: RemoteFault) -> Self {
        Self::Remote {
            code: fault.code,
            reason: fault.reason,
        }
    }
}

/// Misrouted inbound message.
///
/// Raised synchronously from `receive` dispatch: there is no pending caller
/// to reject, and the condition indicates a wiring defect in the embedding
/// application or a push arriving after its cleanup grace window.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// The message names a session other than this one.
    #[error("message for session {got} delivered to session {expected}")]
    SessionMismatch {
        /// Our session identifier.
        expected: SessionId,
        /// The identifier carried by the message.
        got: SessionId,
    },
    /// The message's sender has no registered handle.
    #[error("no handle registered for sender {0}")]
    UnknownSender(HandleId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_from_fault() {
        let fault = RemoteFault {
            code: 460,
            reason: "No such plugin 'x'".into(),
        };
        let err = RequestError::from(fault);
        assert_eq!(err.code(), Some(460));
        assert_eq!(err.to_string(), "remote error 460: No such plugin 'x'");
    }

    #[test]
    fn test_timeout_has_no_code() {
        let err = RequestError::Timeout(Duration::from_secs(5));
        assert_eq!(err.code(), None);
    }
}
