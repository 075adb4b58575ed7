//! Plugin handle: one attached capability on a session.

use std::sync::{
    Arc, Mutex, OnceLock, Weak,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use gateway_client_core::{Envelope, HandleId, Inbound, RequestError, RequestKind};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::session::Session;

/// Extension point for concrete plugins.
///
/// A [`Handle`] composes a boxed delegate implementing this trait; the
/// defaults make every hook optional.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Interpret a push message addressed to this handle.
    async fn on_push(&self, push: Inbound) {
        tracing::debug!(sender = ?push.sender, "unhandled push");
    }

    /// Runs after a successful attach.
    async fn on_attached(&self) {}

    /// Runs after detach settles.
    async fn on_detached(&self) {}
}

/// One attached capability on a [`Session`].
///
/// All requests flow through the owning session's transaction mechanism;
/// pushes addressed to this handle's remote identifier are dispatched back
/// through [`Capability::on_push`].
pub struct Handle {
    /// Capability name known to the gateway; immutable.
    plugin: String,
    delegate: Box<dyn Capability>,
    /// Back-reference only; the session owns the authoritative registry.
    session: OnceLock<Weak<Session>>,
    /// Remote-assigned identifier; immutable once set by attach.
    remote_id: OnceLock<HandleId>,
    attached: AtomicBool,
    /// One-shot detached signal; the sender fires at most once, the
    /// receiver is taken by the session at registration.
    detached_tx: Mutex<Option<oneshot::Sender<()>>>,
    detached_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Handle {
    /// Create a handle for the named capability.
    #[must_use]
    pub fn new(plugin: impl Into<String>, delegate: impl Capability + 'static) -> Arc<Self> {
        let (detached_tx, detached_rx) = oneshot::channel();
        Arc::new(Self {
            plugin: plugin.into(),
            delegate: Box::new(delegate),
            session: OnceLock::new(),
            remote_id: OnceLock::new(),
            attached: AtomicBool::new(false),
            detached_tx: Mutex::new(Some(detached_tx)),
            detached_rx: Mutex::new(Some(detached_rx)),
        })
    }

    /// Capability name this handle represents.
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Remote-assigned identifier, once attached.
    #[must_use]
    pub fn id(&self) -> Option<HandleId> {
        self.remote_id.get().copied()
    }

    /// Whether this handle is currently attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Take the one-shot detached receiver; the session consumes it at
    /// registration to drive grace-period cleanup.
    pub(crate) fn detached_signal(&self) -> Option<oneshot::Receiver<()>> {
        self.detached_rx.lock().unwrap().take()
    }

    /// Attach this handle to the given session.
    pub(crate) async fn attach(
        self: &Arc<Self>,
        session: &Arc<Session>,
    ) -> Result<Inbound, RequestError> {
        if self.remote_id.get().is_some() {
            return Err(RequestError::AlreadyAttached);
        }
        let _ = self.session.set(Arc::downgrade(session));

        let reply = session
            .send(Envelope::new(RequestKind::Attach).with_plugin(self.plugin.clone()))
            .await?;
        let id = reply
            .assigned_id()
            .ok_or(RequestError::UnexpectedReply("attach reply missing id"))?;
        let _ = self.remote_id.set(id);
        self.attached.store(true, Ordering::Release);

        self.delegate.on_attached().await;
        Ok(reply)
    }

    /// Detach from the gateway.
    ///
    /// On settlement, successful or not, the handle is marked detached, the
    /// post-detach hook runs, and the one-shot detached signal fires.
    ///
    /// # Errors
    /// Propagates the detach exchange's failure.
    pub async fn detach(&self) -> Result<(), RequestError> {
        if !self.is_attached() {
            return Ok(());
        }

        let result = self.send(Envelope::new(RequestKind::Detach)).await;

        self.attached.store(false, Ordering::Release);
        self.delegate.on_detached().await;
        if let Some(tx) = self.detached_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }

        result.map(|_| ())
    }

    /// Send a request scoped to this handle through the owning session.
    ///
    /// # Errors
    /// `Disconnected` if the owning session is gone; otherwise the
    /// exchange's failure.
    pub async fn send(&self, mut envelope: Envelope) -> Result<Inbound, RequestError> {
        envelope.handle_id = self.id();
        let session = self
            .session
            .get()
            .and_then(Weak::upgrade)
            .ok_or(RequestError::Disconnected)?;
        session.send(envelope).await
    }

    /// Submit a plugin message.
    ///
    /// # Errors
    /// Propagates the exchange's failure.
    pub async fn message(&self, body: Value) -> Result<Inbound, RequestError> {
        self.send(Envelope::new(RequestKind::Message).with_body(body))
            .await
    }

    /// Submit a plugin message carrying a negotiation offer.
    ///
    /// The gateway acknowledges synchronously and delivers the negotiated
    /// answer later as an event under the same token; the returned future
    /// settles on that event.
    ///
    /// # Errors
    /// Propagates the exchange's failure.
    pub async fn message_with_offer(
        &self,
        body: Value,
        offer: Value,
    ) -> Result<Inbound, RequestError> {
        self.send(
            Envelope::new(RequestKind::Message)
                .with_body(body)
                .with_negotiation(offer),
        )
        .await
    }

    /// Submit an ICE candidate.
    ///
    /// # Errors
    /// Propagates the exchange's failure.
    pub async fn trickle(&self, candidate: Value) -> Result<Inbound, RequestError> {
        self.send(Envelope::new(RequestKind::Trickle).with_candidate(candidate))
            .await
    }

    /// Tear down the media connection without detaching.
    ///
    /// # Errors
    /// Propagates the exchange's failure.
    pub async fn hangup(&self) -> Result<Inbound, RequestError> {
        self.send(Envelope::new(RequestKind::Hangup)).await
    }

    /// Dispatch a push message addressed to this handle.
    pub(crate) async fn receive(&self, msg: Inbound) {
        self.delegate.on_push(msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Null;

    #[async_trait]
    impl Capability for Null {}

    #[tokio::test]
    async fn test_send_without_session_is_disconnected() {
        let handle = Handle::new("x.plugin.echo", Null);
        let result = handle.send(Envelope::new(RequestKind::Message)).await;
        assert!(matches!(result, Err(RequestError::Disconnected)));
    }

    #[tokio::test]
    async fn test_detach_before_attach_is_a_no_op() {
        let handle = Handle::new("x.plugin.echo", Null);
        assert!(handle.detach().await.is_ok());
        assert!(!handle.is_attached());
    }
}
