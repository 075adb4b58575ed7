//! Session and handle layer for the gateway signalling client.
//!
//! Provides:
//! - `Session` - transaction correlation, push dispatch, keepalive
//! - `Handle` - one attached plugin capability on a session
//! - `Capability` - extension-point trait for concrete plugins

pub mod handle;
pub mod session;

pub use handle::{Capability, Handle};
pub use session::{Session, SessionChannels};
