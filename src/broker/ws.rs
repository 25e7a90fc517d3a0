//! HTTP surface of the broker: the WebSocket endpoint and a health probe.
//!
//! Each socket gets an outbound queue drained by a dedicated send task, so a
//! slow peer never blocks frame handling for anyone else.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::Broker;

/// Router serving WebSocket upgrades on `/` and `/ws`, and `GET /health`.
pub fn router(broker: Broker) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    broker: Broker,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(broker))
        .with_graceful_shutdown(shutdown)
        .await
}

/// `GET /health` — liveness probe with routing counters.
async fn health(State(broker): State<Broker>) -> Json<Value> {
    let stats = broker.stats().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "channels": stats.channels,
        "connections": stats.connections,
        "workers": stats.workers,
        "pendingCommands": stats.pending_commands,
    }))
}

async fn ws_upgrade(State(broker): State<Broker>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, broker))
}

async fn handle_socket(socket: WebSocket, broker: Broker) {
    let (conn_id, mut outbox_rx) = broker.accept().await;
    let span = info_span!("connection", conn_id = %conn_id);

    async move {
        info!("Client connected");
        let (mut ws_sink, mut ws_stream) = socket.split();

        // Forward queued frames to the WS sink
        let send_task = tokio::spawn(
            async move {
                while let Some(frame) = outbox_rx.recv().await {
                    let text = match frame.to_text() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize outbound frame: {e}");
                            continue;
                        }
                    };
                    if ws_sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sink.close().await;
            }
            .in_current_span(),
        );

        while let Some(msg) = ws_stream.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    debug!("WebSocket read error: {e}");
                    break;
                }
            };
            match msg {
                Message::Text(text) => {
                    // A panic while handling one frame must not take the
                    // connection down.
                    let handled = AssertUnwindSafe(broker.handle_text(&conn_id, text.as_str()))
                        .catch_unwind()
                        .await;
                    if handled.is_err() {
                        error!("Frame handler panicked; frame dropped");
                    }
                }
                Message::Binary(_) => warn!("Binary frame ignored"),
                Message::Close(_) => break,
                _ => {}
            }
        }

        broker.disconnect(&conn_id).await;
        send_task.abort();
        info!("Client disconnected");
    }
    .instrument(span)
    .await;
}
