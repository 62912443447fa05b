//! WebSocket connection handle shared by sessions.
//!
//! A [`Connection`] owns the write half of one WebSocket behind an async
//! mutex. Every writer serialises a whole message while holding it, so
//! messages from concurrent sessions interleave but never tear.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{self as axum_ws, WebSocket};
use bytes::Bytes;
use futures::SinkExt;
use futures::stream::SplitSink;
use relay_protocol::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite;

use crate::error::{AgentError, Result};

/// Process-unique identifier of a live connection.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Write half of a WebSocket.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, axum_ws::Message> {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.send(axum_ws::Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        SinkExt::close(self).await?;
        Ok(())
    }
}

#[async_trait]
impl<S> FrameSink for SplitSink<WebSocketStream<S>, tungstenite::Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.send(tungstenite::Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        SinkExt::close(self).await?;
        Ok(())
    }
}

/// An inbound WebSocket frame reduced to what the agent acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Text or binary payload expected to hold one JSON message.
    Data(Bytes),
    /// The peer sent a close frame.
    Close,
    /// Ping, pong and raw frames.
    Ignored,
}

impl From<axum_ws::Message> for Inbound {
    fn from(msg: axum_ws::Message) -> Self {
        match msg {
            axum_ws::Message::Text(text) => {
                Inbound::Data(Bytes::copy_from_slice(text.as_str().as_bytes()))
            }
            axum_ws::Message::Binary(data) => Inbound::Data(data),
            axum_ws::Message::Close(_) => Inbound::Close,
            axum_ws::Message::Ping(_) | axum_ws::Message::Pong(_) => Inbound::Ignored,
        }
    }
}

impl From<tungstenite::Message> for Inbound {
    fn from(msg: tungstenite::Message) -> Self {
        match msg {
            tungstenite::Message::Text(text) => {
                Inbound::Data(Bytes::copy_from_slice(text.as_str().as_bytes()))
            }
            tungstenite::Message::Binary(data) => Inbound::Data(data),
            tungstenite::Message::Close(_) => Inbound::Close,
            tungstenite::Message::Ping(_)
            | tungstenite::Message::Pong(_)
            | tungstenite::Message::Frame(_) => Inbound::Ignored,
        }
    }
}

struct Inner {
    id: ConnId,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    closed: AtomicBool,
}

/// Cloneable handle to the write side of one WebSocket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn new(sink: impl FrameSink + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                sink: tokio::sync::Mutex::new(Box::new(sink)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Serialise and write one message.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let text = serde_json::to_string(msg)?;
        let mut sink = self.inner.sink.lock().await;
        if self.is_closed() {
            return Err(AgentError::ConnectionClosed);
        }
        sink.send_text(text).await
    }

    /// Send a close frame. Later sends fail with `ConnectionClosed`.
    pub async fn close(&self) {
        let mut sink = self.inner.sink.lock().await;
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = sink.close().await {
            log::debug!("closing connection {}: {}", self.inner.id, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory connection for unit tests.

    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub struct ChannelSink(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl FrameSink for ChannelSink {
        async fn send_text(&mut self, text: String) -> Result<()> {
            let msg = serde_json::from_str(&text)?;
            self.0.send(msg).map_err(|_| AgentError::ConnectionClosed)
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    pub fn channel_connection() -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(ChannelSink(tx)), rx)
    }

    pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("connection channel closed")
    }

    /// Collect messages until an `exit` or `error` for `id` arrives.
    pub async fn until_finished(
        rx: &mut mpsc::UnboundedReceiver<Message>,
        id: &str,
    ) -> Vec<Message> {
        let mut out = Vec::new();
        loop {
            let msg = next_message(rx).await;
            let last = msg.id == id
                && matches!(
                    msg.kind,
                    relay_protocol::MessageType::Exit | relay_protocol::MessageType::Error
                );
            out.push(msg);
            if last {
                return out;
            }
        }
    }
}
