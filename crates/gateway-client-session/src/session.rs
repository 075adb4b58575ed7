//! Session: transaction correlation, push dispatch, and keepalive.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use gateway_client_core::{
    Envelope, HandleId, Inbound, ReplyStatus, RequestError, RequestKind, RoutingError,
    SessionConfig, SessionEvent, SessionId,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};

use crate::handle::Handle;

/// Receiving ends handed to the transport collaborator and the embedder.
///
/// The transport serializes and transmits every envelope popped from
/// `outbound`, and calls [`Session::receive`] once per decoded inbound frame.
pub struct SessionChannels {
    /// Envelopes to transmit, in order.
    pub outbound: mpsc::UnboundedReceiver<Envelope>,
    /// Out-of-band notifications.
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// One in-flight request/response exchange.
struct PendingRequest {
    reply_tx: oneshot::Sender<Result<Inbound, RequestError>>,
    /// Timer that fails the exchange if no reply correlates in time.
    timeout: Option<JoinHandle<()>>,
    /// The original outgoing envelope; needed to recognize the deferred
    /// ack/event settlement of negotiation requests.
    request: Envelope,
}

/// Registry entry for an attached handle.
struct RegisteredHandle {
    handle: Arc<Handle>,
    /// Task awaiting the handle's detached signal, then running the
    /// grace-period timer before the entry is deleted.
    detach_watch: Option<JoinHandle<()>>,
}

/// Client-side session on the gateway.
///
/// Multiplexes any number of concurrent request/response exchanges over one
/// duplex channel, routes unsolicited pushes to attached [`Handle`]s, and
/// keeps the remote session alive while idle.
pub struct Session {
    config: SessionConfig,
    /// Remote-assigned identifier; immutable once set by `create`.
    session_id: OnceLock<SessionId>,
    /// Source of correlation tokens; never reused within the session.
    next_token: AtomicU64,
    pending: Mutex<HashMap<String, PendingRequest>>,
    handles: Mutex<HashMap<HandleId, RegisteredHandle>>,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    /// Last outgoing traffic; the keepalive loop sleeps against this.
    last_activity: Mutex<Instant>,
    /// At most one live keepalive task per session.
    keepalive: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Session {
    /// Create a session and the channels its collaborators consume.
    #[must_use]
    pub fn new(config: SessionConfig) -> (Arc<Self>, SessionChannels) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            config,
            session_id: OnceLock::new(),
            next_token: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            outbound_tx,
            event_tx,
            last_activity: Mutex::new(Instant::now()),
            keepalive: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        let channels = SessionChannels {
            outbound: outbound_rx,
            events: event_rx,
        };

        (session, channels)
    }

    /// Remote-assigned session identifier, once `create` has succeeded.
    #[must_use]
    pub fn id(&self) -> Option<SessionId> {
        self.session_id.get().copied()
    }

    /// Number of in-flight request/response exchanges.
    #[must_use]
    pub fn pending_transactions(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Number of handles currently registered for push routing.
    #[must_use]
    pub fn registered_handles(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Create the remote session.
    ///
    /// On success the returned identifier is stored and the keepalive loop
    /// starts.
    ///
    /// # Errors
    /// Returns the remote fault, a timeout, or `UnexpectedReply` if the
    /// success reply carries no identifier.
    pub async fn create(self: &Arc<Self>) -> Result<Inbound, RequestError> {
        let reply = self.send(Envelope::new(RequestKind::Create)).await?;
        let id = reply
            .assigned_id()
            .ok_or(RequestError::UnexpectedReply("create reply missing id"))?;
        let _ = self.session_id.set(id);
        tracing::debug!(session_id = id, "session created");
        self.start_keepalive();
        Ok(reply)
    }

    /// Attach a plugin handle and register it for push routing.
    ///
    /// Registration happens only after the attach reply assigns an
    /// identifier; the handle cannot receive pushes before that point. The
    /// handle's one-shot detached signal is watched so the registry entry
    /// outlives detachment by the configured grace period, absorbing late
    /// in-flight pushes.
    ///
    /// # Errors
    /// Propagates whatever the handle's attach raises.
    pub async fn attach_plugin(
        self: &Arc<Self>,
        handle: Arc<Handle>,
    ) -> Result<Inbound, RequestError> {
        let reply = handle.attach(self).await?;
        let handle_id = handle
            .id()
            .ok_or(RequestError::UnexpectedReply("attach reply missing id"))?;

        let detach_watch = handle
            .detached_signal()
            .map(|signal| self.spawn_detach_watch(handle_id, signal));

        self.handles.lock().unwrap().insert(
            handle_id,
            RegisteredHandle {
                handle: Arc::clone(&handle),
                detach_watch,
            },
        );

        tracing::debug!(handle_id, plugin = handle.plugin(), "plugin attached");
        self.emit(SessionEvent::PluginAttached {
            handle_id,
            plugin: handle.plugin().to_owned(),
        });

        Ok(reply)
    }

    /// Destroy the remote session.
    ///
    /// Every registered handle is asked to detach first, concurrently, and
    /// all detach completions are awaited before the destroy request goes
    /// out. Afterwards the session is inert: keepalive stopped, registry and
    /// cleanup timers cleared. Already in-flight exchanges keep running
    /// until their own timeout.
    ///
    /// # Errors
    /// Returns the destroy exchange's failure; local teardown happens
    /// regardless.
    pub async fn destroy(self: &Arc<Self>) -> Result<Inbound, RequestError> {
        let attached: Vec<Arc<Handle>> = self
            .handles
            .lock()
            .unwrap()
            .values()
            .map(|r| Arc::clone(&r.handle))
            .collect();

        let results = futures::future::join_all(attached.iter().map(|h| h.detach())).await;
        for (handle, result) in attached.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(plugin = handle.plugin(), error = %e, "detach during destroy failed");
            }
        }

        let reply = self.send(Envelope::new(RequestKind::Destroy)).await;

        self.destroyed.store(true, Ordering::Release);
        self.stop_keepalive();
        let drained: Vec<RegisteredHandle> = {
            let mut handles = self.handles.lock().unwrap();
            handles.drain().map(|(_, r)| r).collect()
        };
        for registered in drained {
            if let Some(watch) = registered.detach_watch {
                watch.abort();
            }
        }

        tracing::debug!(session_id = ?self.id(), "session destroyed");
        reply
    }

    /// Send a request and await its correlated reply.
    ///
    /// Stamps a fresh correlation token and the session identifier (once
    /// known), registers a pending exchange with a timeout, and emits the
    /// envelope on the outbound channel. The returned future settles exactly
    /// once: with the correlated reply, with the remote fault, or with
    /// `Timeout`.
    ///
    /// # Errors
    /// `Disconnected` if the outbound channel is closed; otherwise the
    /// remote fault or a timeout.
    pub async fn send(self: &Arc<Self>, mut envelope: Envelope) -> Result<Inbound, RequestError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed).to_string();
        envelope.transaction = Some(token.clone());
        if envelope.session_id.is_none() {
            envelope.session_id = self.id();
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            token.clone(),
            PendingRequest {
                reply_tx,
                timeout: None,
                request: envelope.clone(),
            },
        );

        if self.outbound_tx.send(envelope).is_err() {
            self.pending.lock().unwrap().remove(&token);
            return Err(RequestError::Disconnected);
        }
        self.bump_activity();

        let timer = self.spawn_request_timeout(token.clone());
        match self.pending.lock().unwrap().get_mut(&token) {
            Some(entry) => entry.timeout = Some(timer),
            // Settled before the timer was even registered.
            None => timer.abort(),
        }

        match reply_rx.await {
            Ok(settled) => settled,
            Err(_) => Err(RequestError::Disconnected),
        }
    }

    /// Inbound entry point, called once per decoded message by the
    /// transport collaborator, serially.
    ///
    /// Dispatch order: session-id check, then correlation-token settlement,
    /// then sender routing. A message with neither token nor sender is
    /// ignored. A bare ack for a request that carried a negotiation payload
    /// leaves the exchange pending: the final answer arrives later as an
    /// event under the same token.
    ///
    /// # Errors
    /// `SessionMismatch` if the message names another session;
    /// `UnknownSender` if a push has no registered handle (also surfaced as
    /// an [`SessionEvent::UnroutablePush`] event).
    pub async fn receive(self: &Arc<Self>, msg: Inbound) -> Result<(), RoutingError> {
        if let (Some(expected), Some(got)) = (self.id(), msg.session_id) {
            if expected != got {
                tracing::error!(expected, got, "inbound message for a different session");
                return Err(RoutingError::SessionMismatch { expected, got });
            }
        }

        if let Some(token) = msg.transaction.clone() {
            enum Matched {
                Settle(PendingRequest),
                Deferred,
                NoEntry,
            }

            let matched = {
                let mut pending = self.pending.lock().unwrap();
                let deferred = msg.status == ReplyStatus::Ack
                    && pending
                        .get(&token)
                        .is_some_and(|entry| entry.request.negotiation.is_some());
                if deferred {
                    Matched::Deferred
                } else {
                    pending
                        .remove(&token)
                        .map_or(Matched::NoEntry, Matched::Settle)
                }
            };

            match matched {
                Matched::Deferred => {
                    tracing::debug!(token, "ack for negotiation request, awaiting event");
                    return Ok(());
                }
                Matched::Settle(entry) => {
                    if let Some(timer) = entry.timeout {
                        timer.abort();
                    }
                    let outcome = match msg.fault().cloned() {
                        Some(fault) => Err(RequestError::from(fault)),
                        None => Ok(msg),
                    };
                    // The caller may be gone; a dropped receiver is fine.
                    let _ = entry.reply_tx.send(outcome);
                    return Ok(());
                }
                Matched::NoEntry => {
                    if msg.sender.is_none() {
                        tracing::debug!(token, "no pending exchange for token, dropping late reply");
                        return Ok(());
                    }
                }
            }
        }

        if let Some(sender) = msg.sender {
            let handle = self
                .handles
                .lock()
                .unwrap()
                .get(&sender)
                .map(|r| Arc::clone(&r.handle));

            if let Some(handle) = handle {
                handle.receive(msg).await;
                Ok(())
            } else {
                tracing::warn!(sender, "push for unregistered handle");
                self.emit(SessionEvent::UnroutablePush(msg));
                Err(RoutingError::UnknownSender(sender))
            }
        } else {
            tracing::debug!("ignoring message with neither transaction nor sender");
            Ok(())
        }
    }

    fn spawn_request_timeout(self: &Arc<Self>, token: String) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = weak.upgrade() else { return };
            if let Some(entry) = session.pending.lock().unwrap().remove(&token) {
                tracing::warn!(token, "request timed out");
                let _ = entry.reply_tx.send(Err(RequestError::Timeout(timeout)));
            }
        })
    }

    fn spawn_detach_watch(
        self: &Arc<Self>,
        handle_id: HandleId,
        signal: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let grace = self.config.detach_grace;
        tokio::spawn(async move {
            // Sender dropped without detaching: nothing to clean up.
            if signal.await.is_err() {
                return;
            }
            if let Some(session) = weak.upgrade() {
                session.emit(SessionEvent::PluginDetached { handle_id });
            }
            tokio::time::sleep(grace).await;
            if let Some(session) = weak.upgrade() {
                session.handles.lock().unwrap().remove(&handle_id);
                tracing::debug!(handle_id, "registry entry expired after grace period");
            }
        })
    }

    /// Record outgoing traffic; postpones the next keepalive.
    fn bump_activity(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Start the keepalive loop. Idempotent; a no-op once destroyed.
    fn start_keepalive(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let mut slot = self.keepalive.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.config.keepalive_interval;
        *slot = Some(tokio::spawn(async move {
            loop {
                let deadline = match weak.upgrade() {
                    Some(session) => *session.last_activity.lock().unwrap() + interval,
                    None => return,
                };
                tokio::time::sleep_until(deadline).await;
                let Some(session) = weak.upgrade() else { return };
                // Outgoing traffic since we armed the timer postpones us.
                if session.last_activity.lock().unwrap().elapsed() < interval {
                    continue;
                }
                if let Err(e) = session.send(Envelope::new(RequestKind::Keepalive)).await {
                    tracing::warn!(error = %e, "keepalive failed");
                    session.emit(SessionEvent::KeepaliveFailed(e));
                }
            }
        }));
    }

    /// Cancel the keepalive loop outright.
    fn stop_keepalive(&self) {
        if let Some(task) = self.keepalive.lock().unwrap().take() {
            task.abort();
        }
    }

    fn emit(&self, event: SessionEvent) {
        // Embedders that drop the event receiver opt out of notifications.
        let _ = self.event_tx.send(event);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.keepalive.lock().unwrap().take() {
            task.abort();
        }
        for registered in self.handles.lock().unwrap().values_mut() {
            if let Some(watch) = registered.detach_watch.take() {
                watch.abort();
            }
        }
        for entry in self.pending.lock().unwrap().values_mut() {
            if let Some(timer) = entry.timeout.take() {
                timer.abort();
            }
        }
    }
}
