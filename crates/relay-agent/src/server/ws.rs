//! WebSocket upgrade handler.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::StreamExt;
use log::debug;

use super::AppState;
use crate::conn::{Connection, Inbound};
use crate::error::AgentError;
use crate::router::{MessageRouter, serve_connection};

pub(super) async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.router))
}

async fn handle_socket(socket: WebSocket, router: Arc<MessageRouter>) {
    let (sink, stream) = socket.split();
    let conn = Connection::new(sink);
    let frames = stream.map(|frame| frame.map(Inbound::from).map_err(AgentError::from));

    serve_connection(router, conn.clone(), frames).await;

    conn.close().await;
    debug!("websocket {} finished", conn.id());
}
