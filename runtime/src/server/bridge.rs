//! WebSocket endpoint for the language server bridge.
//!
//! Each text or binary WebSocket message carries one JSON-RPC message.
//! Outbound payloads go out as text when they are valid UTF-8.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use capsules_lsp_bridge::Bridge;
use futures_util::{future, SinkExt, Stream, StreamExt};
use session_registry::SessionRegistry;
use tracing::debug;

use super::{AppState, ErrorResponse};
use crate::audit::{ApiAuditor, SandboxMetrics};

pub fn routes() -> Router {
    Router::new().route("/lsp", get(lsp_upgrade))
}

/// GET /api/lsp
async fn lsp_upgrade(
    Extension(state): Extension<AppState>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(bridge) = state.bridge.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new(
                "language server bridge is not configured",
                "BRIDGE_DISABLED",
            )),
        )
            .into_response();
    };
    let Some(ws) = ws else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                "expected a WebSocket upgrade request",
                "WEBSOCKET_UPGRADE_REQUIRED",
            )),
        )
            .into_response();
    };

    let max_message = bridge.launcher().spec().max_frame_bytes;
    let registry = state.registry.clone();
    ws.max_message_size(max_message)
        .on_upgrade(move |socket| run_session(bridge, registry, socket))
}

async fn run_session(bridge: Bridge, registry: SessionRegistry, socket: WebSocket) {
    let (mut sender, receiver) = socket.split();
    let mut client_rx = client_messages(receiver);

    let end = {
        let mut client_tx = (&mut sender)
            .with(|payload: Vec<u8>| future::ready(Ok::<_, axum::Error>(outbound(payload))));
        bridge.serve(&mut client_rx, &mut client_tx).await
    };

    ApiAuditor::emit_event(&ApiAuditor::bridge_session_ended(&end));
    SandboxMetrics::record_active_sessions(&registry);

    if let Some(reason) = end.close_reason() {
        let frame = CloseFrame {
            code: close_code::ERROR,
            reason: reason.into(),
        };
        if let Err(err) = sender.send(Message::Close(Some(frame))).await {
            debug!(error = %err, "failed to send close frame");
        }
    }
    let _ = sender.close().await;
}

/// Payloads of client data messages, ending at the first close frame or
/// transport error. Control frames are skipped.
fn client_messages<S>(receiver: S) -> impl Stream<Item = Vec<u8>> + Unpin
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    receiver
        .take_while(|message| {
            future::ready(match message {
                Ok(Message::Close(_)) => false,
                Ok(_) => true,
                Err(err) => {
                    debug!(error = %err, "client connection failed");
                    false
                }
            })
        })
        .filter_map(|message| future::ready(message.ok().and_then(inbound)))
}

fn inbound(message: Message) -> Option<Vec<u8>> {
    match message {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

fn outbound(payload: Vec<u8>) -> Message {
    match String::from_utf8(payload) {
        Ok(text) => Message::Text(text),
        Err(err) => Message::Binary(err.into_bytes()),
    }
}
