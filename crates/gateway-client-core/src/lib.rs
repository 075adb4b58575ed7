//! Core types for the gateway signalling client.
//!
//! This crate provides the building blocks shared by the session layer and
//! any embedding application:
//! - `Envelope` / `Inbound` - wire types for outgoing requests and incoming replies
//! - `RequestError` / `RoutingError` - error taxonomy
//! - `SessionConfig` - timeout, keepalive, and cleanup tuning
//! - `SessionEvent` - out-of-band notifications (keepalive failures, plugin lifecycle)

pub mod config;
pub mod envelope;
pub mod error;
pub mod event;

pub use config::SessionConfig;
pub use envelope::{Envelope, HandleId, Inbound, RemoteFault, ReplyData, ReplyStatus, RequestKind, SessionId};
pub use error::{RequestError, RoutingError};
pub use event::SessionEvent;
