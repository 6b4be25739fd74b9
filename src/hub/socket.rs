use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::coordinator::Hub;

pub async fn validator_socket(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_validator(socket, hub))
}

pub async fn hub_health(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "connected_validators": hub.registry().len(),
        "outstanding_probes": hub.callbacks().len(),
    }))
}

/// Drive one validator socket until it closes.
///
/// Inbound frames are handled in order on this task; outbound frames are
/// queued on an unbounded channel and written by a dedicated task so
/// dispatch never waits on a slow peer.
async fn serve_validator(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound, mut frames) = mpsc::unbounded_channel::<String>();
    let mut session = hub.open_session(outbound);
    debug!("Socket {} opened", session.id);

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                // Protocol errors are logged; the socket stays open
                if let Err(e) = hub.handle_frame(&mut session, &text).await {
                    warn!("⚠️  Bad frame on socket {}: {}", session.id, e);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                error!("❌ Socket {} failed: {}", session.id, e);
                break;
            }
        }
    }

    hub.close_session(&session).await;
    writer.abort();
    debug!("Socket {} closed", session.id);
}
