//! Message dispatch and the per-connection read loop.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use log::{debug, warn};
use relay_protocol::{HealthStatus, Message, MessageType};
use tokio::sync::watch;

use crate::conn::{Connection, Inbound};
use crate::error::{AgentError, Result};
use crate::health::HealthChecker;
use crate::process::MainProcess;
use crate::session::{AttachSession, ExecSession, Session, SessionRegistry};

/// Turns decoded messages into session operations.
///
/// One router is shared by every connection of an agent; per-connection
/// state lives in the [`Connection`] and the registry.
#[derive(Debug)]
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    main: Option<Arc<MainProcess>>,
    health: Option<Arc<HealthChecker>>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        main: Option<Arc<MainProcess>>,
        health: Option<Arc<HealthChecker>>,
    ) -> Self {
        Self {
            registry,
            main,
            health,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn main_process(&self) -> Option<&Arc<MainProcess>> {
        self.main.as_ref()
    }

    pub fn health(&self) -> Option<&Arc<HealthChecker>> {
        self.health.as_ref()
    }

    /// Handle one message from `conn`.
    ///
    /// Validation and construction failures are reported to the client as
    /// `error` messages; nothing here tears down the connection.
    pub async fn dispatch(&self, conn: &Connection, msg: Message) {
        match msg.kind {
            MessageType::Exec => self.handle_exec(conn, msg).await,
            MessageType::Attach => self.handle_attach(conn, msg).await,
            MessageType::Stdin => self.handle_stdin(msg).await,
            MessageType::CloseStdin => self.handle_close_stdin(msg).await,
            MessageType::Signal => self.handle_signal(conn, msg).await,
            MessageType::Resize => self.handle_resize(msg),
            other => {
                let err = AgentError::UnknownMessageType(other.to_string());
                send_error(conn, &msg.id, &err).await;
            }
        }
    }

    async fn handle_exec(&self, conn: &Connection, msg: Message) {
        match ExecSession::start(&msg, conn.clone()) {
            Ok(session) => self.track(session, conn).await,
            Err(e) => send_error(conn, &msg.id, &e).await,
        }
    }

    async fn handle_attach(&self, conn: &Connection, msg: Message) {
        if msg.id.is_empty() {
            send_error(conn, "", &AgentError::MissingId("attach")).await;
            return;
        }
        let Some(main) = &self.main else {
            send_error(conn, &msg.id, &AgentError::NoMainProcess).await;
            return;
        };
        let session = AttachSession::start(msg.id, main.clone(), conn.clone());
        self.track(session, conn).await;
    }

    /// Register `session` for `conn` and release it once it finishes, so
    /// long-lived connections do not accumulate dead sessions.
    async fn track(&self, session: Arc<dyn Session>, conn: &Connection) {
        self.registry.register(session.clone(), conn.id()).await;
        let registry = self.registry.clone();
        tokio::spawn(async move {
            session.wait().await;
            if registry.release(&session).await {
                debug!("session {} finished and released", session.id());
            }
        });
    }

    async fn handle_stdin(&self, msg: Message) {
        let Some(session) = self.registry.get(&msg.id) else {
            debug!("stdin for unknown session {}", msg.id);
            return;
        };
        let data = match msg.payload() {
            Ok(data) => data,
            Err(e) => {
                warn!("session {} sent undecodable stdin: {}", msg.id, e);
                return;
            }
        };
        if let Err(e) = session.write_stdin(&data).await {
            debug!("session {} stdin write failed: {}", msg.id, e);
        }
    }

    async fn handle_close_stdin(&self, msg: Message) {
        let Some(session) = self.registry.get(&msg.id) else {
            return;
        };
        if let Err(e) = session.close_stdin().await {
            debug!("session {} close_stdin failed: {}", msg.id, e);
        }
    }

    fn handle_resize(&self, msg: Message) {
        let Some(session) = self.registry.get(&msg.id) else {
            return;
        };
        let (width, height) = (msg.width.unwrap_or(0), msg.height.unwrap_or(0));
        if let Err(e) = session.resize(width, height) {
            debug!("session {} resize failed: {}", msg.id, e);
        }
    }

    async fn handle_signal(&self, conn: &Connection, msg: Message) {
        let Some(session) = self.registry.get(&msg.id) else {
            return;
        };
        let name = msg.signal.as_deref().unwrap_or_default();
        match session.signal(name) {
            Ok(()) => {}
            Err(e @ AgentError::UnknownSignal(_)) => send_error(conn, &msg.id, &e).await,
            Err(e) => debug!("session {} signal {} failed: {}", msg.id, name, e),
        }
    }
}

async fn send_error(conn: &Connection, id: &str, err: &AgentError) {
    warn!("sending error to client: id={:?} error={}", id, err);
    if let Err(e) = conn.send(&Message::error(id, err.to_string())).await {
        debug!("could not deliver error for {:?}: {}", id, e);
    }
}

/// Read frames from one WebSocket until it closes, dispatching each
/// message. Health transitions are pushed to the peer as they happen.
///
/// Every session the connection owns is closed before this returns.
#[tracing::instrument(name = "connection", skip_all, fields(conn = conn.id()))]
pub async fn serve_connection<S>(router: Arc<MessageRouter>, conn: Connection, mut frames: S)
where
    S: Stream<Item = Result<Inbound>> + Unpin + Send,
{
    let mut health_rx = router.health().map(|h| h.subscribe());
    debug!("connection {} established", conn.id());

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Inbound::Data(bytes))) => match serde_json::from_slice::<Message>(&bytes) {
                    Ok(msg) => router.dispatch(&conn, msg).await,
                    Err(e) => warn!("connection {} sent an invalid message: {}", conn.id(), e),
                },
                Some(Ok(Inbound::Ignored)) => {}
                Some(Ok(Inbound::Close)) | None => {
                    debug!("connection {} closed by peer", conn.id());
                    break;
                }
                Some(Err(e)) => {
                    warn!("connection {} read failed: {}", conn.id(), e);
                    break;
                }
            },
            status = health_changed(&mut health_rx) => {
                if let Some(checker) = router.health() {
                    let msg = Message::health(status, checker.log());
                    if let Err(e) = conn.send(&msg).await {
                        debug!("connection {} missed health update: {}", conn.id(), e);
                    }
                }
            }
        }
    }

    router.registry().cleanup_conn(conn.id()).await;
    debug!("connection {} cleaned up", conn.id());
}

/// Resolve on the next status transition; pend forever without a checker.
async fn health_changed(rx: &mut Option<watch::Receiver<HealthStatus>>) -> HealthStatus {
    if let Some(inner) = rx {
        if inner.changed().await.is_ok() {
            return *inner.borrow_and_update();
        }
        *rx = None;
    }
    std::future::pending().await
}
