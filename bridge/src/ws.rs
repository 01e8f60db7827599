//! Dashboard WebSocket endpoint.
//!
//! Each upgraded socket is registered with the [`ConnectionRegistry`] and
//! served by two tasks: a writer draining the connection's delivery queue onto
//! the socket under a send deadline, and a reader watching for the peer going
//! away. Whichever finishes first closes the connection.

use crate::registry::{CloseReason, ConnectionRegistry};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<ConnectionRegistry>,
    pub send_timeout: Duration,
}

pub fn create_router(state: WsState) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<WsState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: WsState) {
    let (connection, queue) = match state.registry.register(addr.to_string()) {
        Ok(registered) => registered,
        Err(e) => {
            warn!("Rejecting consumer {}: {}", addr, e);
            let _ = timeout(state.send_timeout, socket.close()).await;
            return;
        }
    };

    let id = connection.id();
    let (sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(write_queue(sender, queue, state.send_timeout));

    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(_)) | Ok(Message::Binary(_)) => {
                    debug!(connection_id = id, "Ignoring message from consumer");
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(connection_id = id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    let reason = tokio::select! {
        outcome = &mut send_task => {
            recv_task.abort();
            outcome.ok().flatten()
        }
        _ = &mut recv_task => {
            send_task.abort();
            Some(CloseReason::PeerClosed)
        }
    };

    // None means the registry already closed us (shutdown or eviction).
    if let Some(reason) = reason {
        connection.close(reason);
    }
}

/// Forwards queued payloads to the socket, in queue order.
///
/// Returns the reason the connection must close, or `None` once the registry
/// has dropped the queue's sender and a Close frame has been sent.
async fn write_queue<S>(
    mut sender: S,
    mut queue: mpsc::Receiver<Bytes>,
    send_timeout: Duration,
) -> Option<CloseReason>
where
    S: Sink<Message> + Unpin,
{
    while let Some(payload) = queue.recv().await {
        match timeout(send_timeout, sender.send(frame(payload))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Some(CloseReason::SendFailed),
            Err(_) => return Some(CloseReason::SendTimeout),
        }
    }

    let _ = timeout(send_timeout, sender.send(Message::Close(None))).await;
    None
}

/// Payload bytes are forwarded untouched; JSON from devices goes out as a
/// text frame, anything that is not UTF-8 as binary.
fn frame(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}
