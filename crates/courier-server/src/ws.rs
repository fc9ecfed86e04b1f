//! Real-time socket endpoint.
//!
//! Frames are JSON text `{"event", "data"}`. The server pushes
//! `chat-message`; clients send `submit-signal-message` (base64 envelope,
//! answered with a base64 response on the same event) and `confirm-received`
//! (comma-separated message ids).

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use courier_shared::constants::{EVENT_CONFIRM_RECEIVED, EVENT_SUBMIT_SIGNAL_MESSAGE};
use courier_shared::protocol::{Envelope, EnvelopeHeader, EnvelopeResponse};

use crate::api::AppState;
use crate::auth::Caller;
use crate::error::ServerError;
use crate::registry::SocketFrame;

const OUTBOUND_BUFFER: usize = 64;

pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    caller: Caller,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, caller))
}

async fn handle_socket(socket: WebSocket, state: AppState, caller: Caller) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<SocketFrame>(OUTBOUND_BUFFER);

    let socket_id = state
        .registry
        .connect(caller.phone(), &caller.session_id, tx.clone())
        .await;

    let ping_interval = state.config.ws_ping_interval;
    let forward_task = tokio::spawn(async move {
        let mut ping_ticker = tokio::time::interval(ping_interval);
        ping_ticker.tick().await;

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode socket frame");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ping_ticker.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Some(reply) = handle_frame(&state, &caller, &text).await {
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(user = caller.phone(), error = %e, "Socket error");
                break;
            }
        }
    }

    state.registry.disconnect(caller.phone(), socket_id).await;
    forward_task.abort();
    info!(user = caller.phone(), session = %caller.session_id, "Socket closed");
}

/// Handle one client frame, returning the reply to send back, if any.
async fn handle_frame(state: &AppState, caller: &Caller, text: &str) -> Option<SocketFrame> {
    let frame: SocketFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(user = caller.phone(), error = %e, "Malformed socket frame");
            return None;
        }
    };

    match frame.event.as_str() {
        EVENT_SUBMIT_SIGNAL_MESSAGE => {
            let response = submit(state, caller, &frame.data).await;
            match response.to_base64() {
                Ok(data) => Some(SocketFrame::new(EVENT_SUBMIT_SIGNAL_MESSAGE, data)),
                Err(e) => {
                    warn!(error = %e, "Failed to encode envelope response");
                    None
                }
            }
        }
        EVENT_CONFIRM_RECEIVED => {
            let ids: Vec<String> = frame.data.split(',').map(str::to_string).collect();
            if let Err(e) = state.messaging.confirm_received(caller, &ids) {
                warn!(user = caller.phone(), error = %e, "Confirm received failed");
            }
            None
        }
        other => {
            debug!(user = caller.phone(), event = other, "Ignoring unknown socket event");
            None
        }
    }
}

async fn submit(state: &AppState, caller: &Caller, data: &str) -> EnvelopeResponse {
    let envelope = match Envelope::from_base64(data) {
        Ok(envelope) => envelope,
        Err(e) => return rejected(EnvelopeHeader::default(), &ServerError::from(e)),
    };
    let header = envelope.header.clone();
    match state.messaging.send(caller, envelope).await {
        Ok(response) => response,
        Err(e) => {
            warn!(user = caller.phone(), error = %e, "Socket submit rejected");
            rejected(header, &e)
        }
    }
}

fn rejected(header: EnvelopeHeader, err: &ServerError) -> EnvelopeResponse {
    EnvelopeResponse {
        header,
        code: err.status().as_u16(),
        content: err.to_string().into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use courier_shared::protocol::MessageKind;
    use courier_shared::types::{ThreadId, ThreadKind};

    use super::*;
    use crate::protocol::tests::client_envelope;
    use crate::testkit::{caller, TestServer};

    fn submit_frame(envelope: &Envelope) -> String {
        serde_json::to_string(&SocketFrame::new(
            EVENT_SUBMIT_SIGNAL_MESSAGE,
            envelope.to_base64().unwrap(),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn submit_frame_is_answered_with_response() {
        let server = TestServer::new();
        server.seed_user("alice", &["a1"]);
        server.seed_user("bob", &["b1"]);
        let alice = caller(&server.state, "alice", "a1");

        let envelope = client_envelope(
            "alice",
            "a1",
            "bob",
            ThreadId::solo("alice", "bob"),
            ThreadKind::Solo,
            MessageKind::Text,
            "m1",
            b"hi",
        );
        let reply = handle_frame(&server.state, &alice, &submit_frame(&envelope))
            .await
            .unwrap();
        assert_eq!(reply.event, EVENT_SUBMIT_SIGNAL_MESSAGE);
        let response = EnvelopeResponse::from_base64(&reply.data).unwrap();
        assert_eq!(response.code, 200);
        assert!(response.server_date().is_some());
    }

    #[tokio::test]
    async fn rejected_submit_carries_error_code() {
        let server = TestServer::new();
        server.seed_user("alice", &["a1"]);
        let alice = caller(&server.state, "alice", "a1");

        let forged = client_envelope(
            "bob",
            "b1",
            "alice",
            ThreadId::solo("alice", "bob"),
            ThreadKind::Solo,
            MessageKind::Text,
            "m1",
            b"hi",
        );
        let reply = handle_frame(&server.state, &alice, &submit_frame(&forged))
            .await
            .unwrap();
        let response = EnvelopeResponse::from_base64(&reply.data).unwrap();
        assert_eq!(response.code, 403);

        let garbage = serde_json::to_string(&SocketFrame::new(EVENT_SUBMIT_SIGNAL_MESSAGE, "%%%")).unwrap();
        let reply = handle_frame(&server.state, &alice, &garbage).await.unwrap();
        assert_eq!(EnvelopeResponse::from_base64(&reply.data).unwrap().code, 400);
    }

    #[tokio::test]
    async fn confirm_frame_acknowledges_ids() {
        let server = TestServer::new();
        server.seed_user("alice", &["a1"]);
        server.seed_user("bob", &["b1"]);
        let alice = caller(&server.state, "alice", "a1");
        let bob = caller(&server.state, "bob", "b1");

        let envelope = client_envelope(
            "alice",
            "a1",
            "bob",
            ThreadId::solo("alice", "bob"),
            ThreadKind::Solo,
            MessageKind::Text,
            "m1",
            b"hi",
        );
        server.state.messaging.send(&alice, envelope).await.unwrap();

        let confirm = serde_json::to_string(&SocketFrame::new(EVENT_CONFIRM_RECEIVED, "m1,unknown")).unwrap();
        assert!(handle_frame(&server.state, &bob, &confirm).await.is_none());

        let stored = server.store().call(|db| db.get_message("m1")).unwrap().unwrap();
        assert!(stored.received_sessions.contains("b1"));
    }
}
