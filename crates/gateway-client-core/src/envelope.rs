//! Wire protocol for the gateway signalling channel.
//!
//! The session layer never touches a socket. It produces [`Envelope`] values
//! for a transport collaborator to serialize and send, and consumes decoded
//! [`Inbound`] values one at a time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Remote-assigned session identifier.
pub type SessionId = u64;

/// Remote-assigned handle identifier.
pub type HandleId = u64;

/// Operation requested from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Create a new remote session.
    Create,
    /// Destroy the remote session.
    Destroy,
    /// Attach a plugin handle to the session.
    Attach,
    /// Detach a plugin handle.
    Detach,
    /// Deliver a plugin-scoped message (optionally with a negotiation offer).
    Message,
    /// Deliver an ICE candidate.
    Trickle,
    /// Tear down the media connection without detaching.
    Hangup,
    /// Idle keepalive.
    Keepalive,
}

/// Outgoing request envelope.
///
/// `transaction` and `session_id` are stamped by the session's `send`;
/// `handle_id` is stamped by the owning handle for handle-scoped operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Requested operation.
    pub op: RequestKind,
    /// Session identifier, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Handle identifier, for handle-scoped operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<HandleId>,
    /// Correlation token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    /// Capability name, attach only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    /// Operation-specific body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Negotiation offer or answer (SDP-like).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiation: Option<Value>,
    /// ICE candidate, trickle only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
}

impl Envelope {
    /// Create a bare envelope for the given operation.
    #[must_use]
    pub const fn new(op: RequestKind) -> Self {
        Self {
            op,
            session_id: None,
            handle_id: None,
            transaction: None,
            plugin: None,
            body: None,
            negotiation: None,
            candidate: None,
        }
    }

    /// Attach a capability name (attach requests).
    #[must_use]
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    /// Attach an operation-specific body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Attach a negotiation offer.
    #[must_use]
    pub fn with_negotiation(mut self, negotiation: Value) -> Self {
        self.negotiation = Some(negotiation);
        self
    }

    /// Attach an ICE candidate.
    #[must_use]
    pub fn with_candidate(mut self, candidate: Value) -> Self {
        self.candidate = Some(candidate);
        self
    }
}

/// Reply discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// Final successful reply to a request.
    Success,
    /// The request failed; `error` carries the fault.
    Error,
    /// Synchronous acknowledgment; a final reply follows as an event.
    Ack,
    /// Unsolicited push or the deferred final reply of a negotiation.
    Event,
}

/// Remote-assigned identifier carried by creation and attach replies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReplyData {
    /// The assigned identifier.
    pub id: u64,
}

/// Structured remote error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFault {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable reason.
    pub reason: String,
}

/// Incoming message, one per decoded transport frame.
///
/// Carries either a `transaction` (settling a pending request) or a `sender`
/// (routing an unsolicited push to a handle); a message with neither is not
/// actionable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbound {
    /// Reply discriminator.
    pub status: ReplyStatus,
    /// Correlation token echoed from the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    /// Session the message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Handle that originated an unsolicited push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<HandleId>,
    /// Remote-assigned identifier, on create/attach success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ReplyData>,
    /// Fault details, on error status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFault>,
    /// Plugin event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Negotiated answer, on events that settle a negotiation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negotiation: Option<Value>,
}

impl Inbound {
    /// Remote-assigned identifier, if the reply carries one.
    #[must_use]
    pub fn assigned_id(&self) -> Option<u64> {
        self.data.map(|d| d.id)
    }

    /// Fault details, if the reply signals an error.
    #[must_use]
    pub fn fault(&self) -> Option<&RemoteFault> {
        if self.status == ReplyStatus::Error {
            self.error.as_ref()
        } else {
            None
        }
    }

    /// Whether the reply signals an error status.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == ReplyStatus::Error
    }
}
