//! Backend side of the protocol.
//!
//! An [`AgentConn`] is one WebSocket to an agent, dialed (forward mode) or
//! accepted (reverse mode). Many bridged sessions share it: a single
//! reader task routes each inbound message by `id` to the session that
//! registered it, and a bridge turns a session into a raw byte stream in
//! the Docker hijacked-connection format.

mod registry;

use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::SplitStream;
use log::{debug, info, warn};
use relay_protocol::{Message, MessageType, StdioFrame, StdioFrameCodec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthState, query_param};
use crate::conn::{Connection, Inbound};
use crate::error::{AgentError, Result};

pub use registry::AgentRegistry;

/// Buffered messages per bridged session before new ones are dropped.
pub const SESSION_CHANNEL_CAPACITY: usize = 64;

const INPUT_CHUNK_SIZE: usize = 32 * 1024;

type Routes = DashMap<String, mpsc::Sender<Message>>;

/// A multiplexed connection to one agent.
#[derive(Debug)]
pub struct AgentConn {
    conn: Connection,
    sessions: Arc<Routes>,
    done: CancellationToken,
}

impl AgentConn {
    /// Dial an agent's forward-mode listener at `addr` (`host:port`).
    pub async fn dial(addr: &str, token: &str) -> Result<Self> {
        let socket = crate::reverse::dial(&format!("ws://{addr}/ws"), token).await?;
        Ok(Self::from_socket(socket))
    }

    /// Complete the server side of an agent's reverse dial-in.
    ///
    /// The handshake is refused with 401 unless the request carries
    /// `token` as a bearer header or `token` query parameter. Returns the
    /// connection and the `id` query parameter, if any.
    pub async fn accept<S>(stream: S, token: &str) -> Result<(Self, Option<String>)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let auth = AuthState::new(token);
        let mut container_id = None;

        let callback = |req: &Request, resp: Response| {
            let header = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|h| h.to_str().ok());
            let query = req.uri().query();
            if let Err(e) = auth.authorize(header, query) {
                warn!("rejecting agent dial-in: {}", e);
                let mut reject = ErrorResponse::new(Some(e.to_string()));
                *reject.status_mut() = StatusCode::UNAUTHORIZED;
                return Err(reject);
            }
            container_id = query.and_then(|q| query_param(q, "id"));
            Ok(resp)
        };

        let socket = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        Ok((Self::from_socket(socket), container_id))
    }

    /// Wrap an established WebSocket and start its reader task.
    pub fn from_socket<S>(socket: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let conn = Connection::new(sink);
        let sessions: Arc<Routes> = Arc::new(DashMap::new());
        let done = CancellationToken::new();

        tokio::spawn(read_loop(stream, sessions.clone(), done.clone()));

        Self {
            conn,
            sessions,
            done,
        }
    }

    /// Cancelled when the socket drops or [`close`](Self::close) is called.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Number of sessions currently bridged over this connection.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Send a raw message, e.g. a `signal` or `resize` for a bridged session.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        self.conn.send(msg).await
    }

    pub async fn close(&self) {
        self.done.cancel();
        self.conn.close().await;
    }

    /// Start `cmd` in the agent and bridge it to `stream` until it exits.
    ///
    /// Returns the exit code, or -1 if the session ended any other way.
    pub async fn bridge_exec<S>(
        &self,
        stream: S,
        id: &str,
        cmd: Vec<String>,
        env: Vec<String>,
        workdir: Option<String>,
        tty: bool,
    ) -> i32
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let start = Message::exec(id, cmd, env, workdir, tty);
        self.bridge(stream, start, tty).await
    }

    /// Attach `stream` to the agent's main process.
    pub async fn bridge_attach<S>(&self, stream: S, id: &str, tty: bool) -> i32
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        self.bridge(stream, Message::attach(id), tty).await
    }

    async fn bridge<S>(&self, stream: S, start: Message, tty: bool) -> i32
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let id = start.id.clone();
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        self.sessions.insert(id.clone(), tx);
        let _route = RouteGuard {
            sessions: &self.sessions,
            id: &id,
        };

        if let Err(e) = self.conn.send(&start).await {
            warn!("failed to start session {}: {}", id, e);
            return -1;
        }
        debug!("bridging session {} (tty={})", id, tty);

        let (reader, writer) = tokio::io::split(stream);
        let code = tokio::select! {
            biased;
            code = forward_output(&id, rx, writer, tty) => code,
            _ = self.done.cancelled() => -1,
            _ = self.forward_input(&id, reader) => -1,
        };

        debug!("session {} bridged to completion with code {}", id, code);
        code
    }

    /// Client to agent. Never resolves, so the output side decides when
    /// the bridge is over.
    async fn forward_input<R>(&self, id: &str, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; INPUT_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = self.conn.send(&Message::stdin(id, &buf[..n])).await {
                        debug!("session {} stdin not forwarded: {}", id, e);
                        break;
                    }
                }
                Err(e) => {
                    debug!("session {} input read failed: {}", id, e);
                    break;
                }
            }
        }
        if let Err(e) = self.conn.send(&Message::close_stdin(id)).await {
            debug!("session {} close_stdin not forwarded: {}", id, e);
        }
        std::future::pending::<()>().await
    }
}

/// Agent to client: raw bytes for TTY sessions, stdio frames otherwise.
async fn forward_output<W>(
    id: &str,
    mut rx: mpsc::Receiver<Message>,
    mut writer: W,
    tty: bool,
) -> i32
where
    W: AsyncWrite + Unpin,
{
    let mut codec = StdioFrameCodec;
    let mut frame_buf = BytesMut::new();

    while let Some(msg) = rx.recv().await {
        match msg.kind {
            MessageType::Stdout | MessageType::Stderr => {
                let data = match msg.payload() {
                    Ok(data) => data,
                    Err(e) => {
                        debug!("session {} sent undecodable output: {}", id, e);
                        continue;
                    }
                };
                let written = if tty {
                    writer.write_all(&data).await
                } else {
                    let Some(stream) = msg.stream() else {
                        continue;
                    };
                    frame_buf.clear();
                    if let Err(e) = codec.encode(StdioFrame::new(stream, data), &mut frame_buf) {
                        debug!("session {} output not framed: {}", id, e);
                        continue;
                    }
                    writer.write_all(&frame_buf).await
                };
                if let Err(e) = written.and(writer.flush().await) {
                    debug!("session {} client write failed: {}", id, e);
                }
            }
            MessageType::Exit => return msg.code.unwrap_or(0),
            MessageType::Error => {
                warn!(
                    "session {} failed: {}",
                    id,
                    msg.message.as_deref().unwrap_or("unknown error")
                );
                return -1;
            }
            _ => {}
        }
    }
    -1
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    sessions: Arc<Routes>,
    done: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = done.cancelled() => break,
        };
        let bytes = match frame {
            Some(Ok(frame)) => match Inbound::from(frame) {
                Inbound::Data(bytes) => bytes,
                Inbound::Ignored => continue,
                Inbound::Close => break,
            },
            Some(Err(e)) => {
                debug!("agent connection read failed: {}", e);
                break;
            }
            None => break,
        };
        let msg: Message = match serde_json::from_slice(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping undecodable agent message: {}", e);
                continue;
            }
        };
        route(&sessions, msg);
    }

    done.cancel();
    // Dropping the senders ends every bridge still waiting for output.
    sessions.clear();
    info!("agent connection closed");
}

/// Deliver `msg` to the session registered for its id without blocking.
fn route(sessions: &Routes, msg: Message) {
    if msg.id.is_empty() {
        return;
    }
    let Some(tx) = sessions.get(&msg.id).map(|entry| entry.value().clone()) else {
        debug!("dropping {} for unknown session {}", msg.kind, msg.id);
        return;
    };
    if let Err(mpsc::error::TrySendError::Full(msg)) = tx.try_send(msg) {
        debug!("session {} channel full; dropping {}", msg.id, msg.kind);
    }
}

struct RouteGuard<'a> {
    sessions: &'a Routes,
    id: &'a str,
}

impl Drop for RouteGuard<'_> {
    fn drop(&mut self) {
        self.sessions.remove(self.id);
    }
}
