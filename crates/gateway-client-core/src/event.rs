//! Out-of-band session notifications.

use crate::envelope::{HandleId, Inbound};
use crate::error::RequestError;

/// Notifications emitted on the session's event channel.
///
/// These cover conditions with no awaiting caller: plugin lifecycle for
/// observers, keepalive failures, and pushes that could not be routed.
#[derive(Debug)]
pub enum SessionEvent {
    /// A plugin handle completed attachment and is registered.
    PluginAttached {
        /// Remote-assigned handle identifier.
        handle_id: HandleId,
        /// Capability name of the plugin.
        plugin: String,
    },
    /// A plugin handle detached; its registry entry lingers for the
    /// configured grace period.
    PluginDetached {
        /// Remote-assigned handle identifier.
        handle_id: HandleId,
    },
    /// An idle keepalive request failed. Not raised: no caller awaits it.
    KeepaliveFailed(RequestError),
    /// A push arrived for a sender with no registered handle.
    UnroutablePush(Inbound),
}
