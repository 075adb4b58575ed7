//! Demonstration client wired to an in-process mock gateway.
//!
//! Run with: cargo run -p loopback-client-example
//!
//! The mock gateway answers every envelope the way the remote side would,
//! including a pushed plugin event after attach, so the full lifecycle
//! (create, attach, message, trickle, detach, destroy) plays out over the
//! loopback channels.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gateway_client_core::{
    Envelope, Inbound, ReplyData, ReplyStatus, RequestKind, SessionConfig,
};
use gateway_client_session::{Capability, Handle, Session, SessionChannels};
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Capability that just logs whatever the gateway pushes at it.
struct EchoPlugin;

#[async_trait::async_trait]
impl Capability for EchoPlugin {
    async fn on_push(&self, push: Inbound) {
        tracing::info!(payload = ?push.payload, "push received");
    }

    async fn on_attached(&self) {
        tracing::info!("echo plugin attached");
    }

    async fn on_detached(&self) {
        tracing::info!("echo plugin detached");
    }
}

fn reply_to(env: &Envelope) -> Inbound {
    Inbound {
        status: ReplyStatus::Success,
        transaction: env.transaction.clone(),
        session_id: env.session_id,
        sender: None,
        data: None,
        error: None,
        payload: None,
        negotiation: None,
    }
}

/// Answer envelopes the way the remote gateway would.
async fn mock_gateway(session: Arc<Session>, mut outbound: mpsc::UnboundedReceiver<Envelope>) {
    let mut next_id = 1233_u64;

    while let Some(env) = outbound.recv().await {
        if let Ok(wire) = serde_json::to_string(&env) {
            tracing::debug!(%wire, "wire out");
        }

        let mut reply = reply_to(&env);
        match env.op {
            RequestKind::Create | RequestKind::Attach => {
                next_id += 1;
                reply.data = Some(ReplyData { id: next_id });
            }
            RequestKind::Message => {
                reply.payload = env.body.clone();
            }
            _ => {}
        }

        let attached = matches!(env.op, RequestKind::Attach).then_some(next_id);
        if let Err(e) = session.receive(reply).await {
            tracing::error!(error = %e, "gateway reply not routable");
        }

        // A freshly attached plugin gets greeted with a push.
        if let Some(handle_id) = attached {
            let push = Inbound {
                status: ReplyStatus::Event,
                transaction: None,
                session_id: None,
                sender: Some(handle_id),
                data: None,
                error: None,
                payload: Some(json!({ "greeting": "welcome" })),
                negotiation: None,
            };
            if let Err(e) = session.receive(push).await {
                tracing::error!(error = %e, "push not routable");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,loopback_client_example=debug".into()),
        )
        .init();

    let (session, channels) = Session::new(SessionConfig::default());
    let SessionChannels {
        outbound,
        mut events,
    } = channels;

    tokio::spawn(mock_gateway(Arc::clone(&session), outbound));
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(?event, "session event");
        }
    });

    let created = session.create().await?;
    tracing::info!(session_id = ?session.id(), reply = ?created.assigned_id(), "created");

    let handle = Handle::new("x.plugin.echo", EchoPlugin);
    session.attach_plugin(Arc::clone(&handle)).await?;
    tracing::info!(handle_id = ?handle.id(), "attached");

    let echoed = handle.message(json!({ "request": "echo", "text": "hello" })).await?;
    tracing::info!(payload = ?echoed.payload, "message answered");

    handle.trickle(json!({ "candidate": "candidate:0 1 UDP 1 127.0.0.1 9 typ host" }))
        .await?;

    // Give the greeting push a moment to arrive before tearing down.
    tokio::time::sleep(Duration::from_millis(50)).await;

    session.destroy().await?;
    tracing::info!("destroyed");

    Ok(())
}
