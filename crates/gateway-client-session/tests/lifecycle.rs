//! End-to-end lifecycle tests driving a session over loopback channels,
//! playing the gateway side by hand.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gateway_client_core::{
    Envelope, Inbound, RemoteFault, ReplyData, ReplyStatus, RequestError, RequestKind,
    RoutingError, SessionConfig, SessionEvent,
};
use gateway_client_session::{Capability, Handle, Session, SessionChannels};
use serde_json::json;

fn success(env: &Envelope, id: Option<u64>) -> Inbound {
    Inbound {
        status: ReplyStatus::Success,
        transaction: env.transaction.clone(),
        session_id: env.session_id,
        sender: None,
        data: id.map(|id| ReplyData { id }),
        error: None,
        payload: None,
        negotiation: None,
    }
}

fn remote_error(env: &Envelope, code: i64, reason: &str) -> Inbound {
    Inbound {
        status: ReplyStatus::Error,
        transaction: env.transaction.clone(),
        session_id: env.session_id,
        sender: None,
        data: None,
        error: Some(RemoteFault {
            code,
            reason: reason.into(),
        }),
        payload: None,
        negotiation: None,
    }
}

fn push(sender: u64, payload: serde_json::Value) -> Inbound {
    Inbound {
        status: ReplyStatus::Event,
        transaction: None,
        session_id: None,
        sender: Some(sender),
        data: None,
        error: None,
        payload: Some(payload),
        negotiation: None,
    }
}

/// Capability that records every push it receives.
struct Recording {
    pushes: Arc<Mutex<Vec<Inbound>>>,
}

#[async_trait]
impl Capability for Recording {
    async fn on_push(&self, push: Inbound) {
        self.pushes.lock().unwrap().push(push);
    }
}

/// Drive `create` to completion against a hand-rolled gateway reply.
async fn create_session(config: SessionConfig) -> (Arc<Session>, SessionChannels) {
    let (session, mut channels) = Session::new(config);
    let task = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.create().await }
    });
    let env = channels.outbound.recv().await.unwrap();
    assert_eq!(env.op, RequestKind::Create);
    session.receive(success(&env, Some(1234))).await.unwrap();
    task.await.unwrap().unwrap();
    (session, channels)
}

/// Attach a recording handle and reply with the given remote id.
async fn attach_recording(
    session: &Arc<Session>,
    channels: &mut SessionChannels,
    id: u64,
) -> (Arc<Handle>, Arc<Mutex<Vec<Inbound>>>) {
    let pushes = Arc::new(Mutex::new(Vec::new()));
    let handle = Handle::new(
        "x.plugin.valid",
        Recording {
            pushes: Arc::clone(&pushes),
        },
    );
    let task = tokio::spawn({
        let session = Arc::clone(session);
        let handle = Arc::clone(&handle);
        async move { session.attach_plugin(handle).await }
    });
    let env = channels.outbound.recv().await.unwrap();
    assert_eq!(env.op, RequestKind::Attach);
    session.receive(success(&env, Some(id))).await.unwrap();
    task.await.unwrap().unwrap();
    (handle, pushes)
}

#[tokio::test]
async fn test_create_assigns_session_id() {
    let (session, mut channels) = Session::new(SessionConfig::default());
    let task = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.create().await }
    });

    let env = channels.outbound.recv().await.unwrap();
    assert_eq!(env.op, RequestKind::Create);
    assert!(env.transaction.is_some());
    assert!(env.session_id.is_none());

    session.receive(success(&env, Some(1234))).await.unwrap();
    let reply = task.await.unwrap().unwrap();
    assert_eq!(reply.assigned_id(), Some(1234));
    assert_eq!(session.id(), Some(1234));
}

#[tokio::test]
async fn test_concurrent_sends_settle_with_their_own_reply() {
    let (session, mut channels) = Session::new(SessionConfig::default());

    let mut tasks = Vec::new();
    for i in 0..3_i64 {
        tasks.push(tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                let reply = session
                    .send(Envelope::new(RequestKind::Message).with_body(json!({ "i": i })))
                    .await
                    .unwrap();
                (i, reply)
            }
        }));
    }

    let mut envs = Vec::new();
    for _ in 0..3 {
        envs.push(channels.outbound.recv().await.unwrap());
    }

    // Tokens are unique across in-flight exchanges.
    let mut tokens: Vec<_> = envs.iter().map(|e| e.transaction.clone().unwrap()).collect();
    tokens.sort();
    tokens.dedup();
    assert_eq!(tokens.len(), 3);

    // Reply out of order, echoing each request's body.
    for env in envs.iter().rev() {
        let mut reply = success(env, None);
        reply.payload = Some(json!({ "echo": env.body.as_ref().unwrap()["i"] }));
        session.receive(reply).await.unwrap();
    }

    for task in tasks {
        let (i, reply) = task.await.unwrap();
        assert_eq!(reply.payload.unwrap()["echo"], json!(i));
    }
    assert_eq!(session.pending_transactions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_rejects_and_clears_the_table() {
    let config = SessionConfig::default().with_request_timeout(Duration::from_millis(20));
    let (session, mut channels) = Session::new(config);

    let result = session.send(Envelope::new(RequestKind::Message)).await;
    assert!(matches!(
        result,
        Err(RequestError::Timeout(d)) if d == Duration::from_millis(20)
    ));
    assert_eq!(session.pending_transactions(), 0);

    // The envelope still went out; only the local exchange failed.
    let env = channels.outbound.recv().await.unwrap();
    assert_eq!(env.op, RequestKind::Message);
}

#[tokio::test]
async fn test_attach_registers_handle_and_emits_event() {
    let (session, mut channels) = create_session(SessionConfig::default()).await;
    let (handle, _pushes) = attach_recording(&session, &mut channels, 55).await;

    assert_eq!(handle.id(), Some(55));
    assert!(handle.is_attached());
    assert_eq!(session.registered_handles(), 1);

    match channels.events.recv().await.unwrap() {
        SessionEvent::PluginAttached { handle_id, plugin } => {
            assert_eq!(handle_id, 55);
            assert_eq!(plugin, "x.plugin.valid");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_attach_unknown_plugin_rejects_with_remote_error() {
    let (session, mut channels) = create_session(SessionConfig::default()).await;

    let handle = Handle::new("x.plugin.bogus", Recording {
        pushes: Arc::new(Mutex::new(Vec::new())),
    });
    let task = tokio::spawn({
        let session = Arc::clone(&session);
        let handle = Arc::clone(&handle);
        async move { session.attach_plugin(handle).await }
    });

    let env = channels.outbound.recv().await.unwrap();
    session
        .receive(remote_error(&env, 460, "No such plugin 'x'"))
        .await
        .unwrap();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.code(), Some(460));
    assert!(!handle.is_attached());
    assert_eq!(session.registered_handles(), 0);
}

#[tokio::test]
async fn test_push_routed_to_attached_handle() {
    let (session, mut channels) = create_session(SessionConfig::default()).await;
    let (_handle, pushes) = attach_recording(&session, &mut channels, 55).await;

    session
        .receive(push(55, json!({ "state": "talking" })))
        .await
        .unwrap();

    let recorded = pushes.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].payload, Some(json!({ "state": "talking" })));
}

#[tokio::test]
async fn test_push_for_unknown_sender_is_a_routing_error() {
    let (session, mut channels) = create_session(SessionConfig::default()).await;

    let result = session.receive(push(99, json!({}))).await;
    assert!(matches!(result, Err(RoutingError::UnknownSender(99))));

    match channels.events.recv().await.unwrap() {
        SessionEvent::UnroutablePush(msg) => assert_eq!(msg.sender, Some(99)),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_detached_handle_stays_routable_for_the_grace_period() {
    let config = SessionConfig::default().with_detach_grace(Duration::from_millis(100));
    let (session, mut channels) = create_session(config).await;
    let (handle, pushes) = attach_recording(&session, &mut channels, 55).await;

    let task = tokio::spawn({
        let handle = Arc::clone(&handle);
        async move { handle.detach().await }
    });
    let env = channels.outbound.recv().await.unwrap();
    assert_eq!(env.op, RequestKind::Detach);
    assert_eq!(env.handle_id, Some(55));
    session.receive(success(&env, None)).await.unwrap();
    task.await.unwrap().unwrap();
    assert!(!handle.is_attached());

    // Within the grace window late pushes still route.
    session.receive(push(55, json!({ "late": 1 }))).await.unwrap();
    assert_eq!(pushes.lock().unwrap().len(), 1);

    // Once the window elapses the registry entry is gone.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(session.registered_handles(), 0);
    let result = session.receive(push(55, json!({ "late": 2 }))).await;
    assert!(matches!(result, Err(RoutingError::UnknownSender(55))));
    assert_eq!(pushes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_negotiation_ack_defers_settlement_until_the_event() {
    let (session, mut channels) = create_session(SessionConfig::default()).await;
    let (handle, _pushes) = attach_recording(&session, &mut channels, 55).await;

    let task = tokio::spawn({
        let handle = Arc::clone(&handle);
        async move {
            handle
                .message_with_offer(json!({ "request": "call" }), json!({ "type": "offer" }))
                .await
        }
    });

    let env = channels.outbound.recv().await.unwrap();
    assert!(env.negotiation.is_some());

    // Bare ack: the exchange stays pending.
    let mut ack = success(&env, None);
    ack.status = ReplyStatus::Ack;
    session.receive(ack).await.unwrap();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!task.is_finished());
    assert_eq!(session.pending_transactions(), 1);

    // The event under the same token carries the answer and settles it.
    let answer = Inbound {
        status: ReplyStatus::Event,
        transaction: env.transaction.clone(),
        session_id: env.session_id,
        sender: Some(55),
        data: None,
        error: None,
        payload: Some(json!({ "result": "accepted" })),
        negotiation: Some(json!({ "type": "answer" })),
    };
    session.receive(answer).await.unwrap();

    let reply = task.await.unwrap().unwrap();
    assert_eq!(reply.status, ReplyStatus::Event);
    assert_eq!(reply.negotiation, Some(json!({ "type": "answer" })));
    assert_eq!(session.pending_transactions(), 0);
}

#[tokio::test]
async fn test_session_id_mismatch_is_fatal() {
    let (session, _channels) = create_session(SessionConfig::default()).await;

    let mut msg = push(55, json!({}));
    msg.session_id = Some(999);
    let result = session.receive(msg).await;
    assert!(matches!(
        result,
        Err(RoutingError::SessionMismatch {
            expected: 1234,
            got: 999
        })
    ));
}

#[tokio::test]
async fn test_message_with_neither_token_nor_sender_is_ignored() {
    let (session, _channels) = create_session(SessionConfig::default()).await;

    let msg = Inbound {
        status: ReplyStatus::Event,
        transaction: None,
        session_id: None,
        sender: None,
        data: None,
        error: None,
        payload: None,
        negotiation: None,
    };
    assert!(session.receive(msg).await.is_ok());
}

#[tokio::test]
async fn test_destroy_detaches_handles_before_the_destroy_request() {
    let (session, mut channels) = create_session(SessionConfig::default()).await;
    let (handle, _pushes) = attach_recording(&session, &mut channels, 55).await;

    let task = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.destroy().await }
    });

    let env = channels.outbound.recv().await.unwrap();
    assert_eq!(env.op, RequestKind::Detach);
    session.receive(success(&env, None)).await.unwrap();

    let env = channels.outbound.recv().await.unwrap();
    assert_eq!(env.op, RequestKind::Destroy);
    session.receive(success(&env, None)).await.unwrap();

    task.await.unwrap().unwrap();
    assert!(!handle.is_attached());
    assert_eq!(session.registered_handles(), 0);
    assert_eq!(session.pending_transactions(), 0);
}
