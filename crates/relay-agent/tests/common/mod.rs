//! Test utilities and common setup.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_agent::server::{self, AppState};
use relay_agent::{MainProcess, MessageRouter, SessionRegistry};
use relay_protocol::{Message, MessageType};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A forward-mode agent listening on an ephemeral port.
pub struct TestAgent {
    pub addr: SocketAddr,
    pub router: Arc<MessageRouter>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TestAgent {
    pub async fn start(token: &str) -> Self {
        Self::with_main(token, None).await
    }

    pub async fn with_main(token: &str, main: Option<Arc<MainProcess>>) -> Self {
        let router = Arc::new(MessageRouter::new(
            Arc::new(SessionRegistry::new()),
            main,
            None,
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();

        let state = AppState::new(router.clone(), token);
        let task = tokio::spawn(async move {
            server::serve(listener, state, async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
        });

        Self {
            addr,
            router,
            stop: Some(stop),
            task: Some(task),
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn connect(&self, token: &str) -> Socket {
        let mut request = self.ws_url().into_client_request().unwrap();
        if !token.is_empty() {
            request.headers_mut().insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
            );
        }
        let (socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        socket
    }

    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(TIMEOUT, task).await;
        }
    }
}

pub async fn send(socket: &mut Socket, msg: &Message) {
    let text = serde_json::to_string(msg).unwrap();
    socket.send(WsMessage::Text(text.into())).await.unwrap();
}

/// Next protocol message, skipping control frames.
pub async fn recv(socket: &mut Socket) -> Message {
    loop {
        let frame = tokio::time::timeout(TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for agent")
            .expect("agent closed the socket")
            .unwrap();
        match frame {
            WsMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            WsMessage::Binary(data) => return serde_json::from_slice(&data).unwrap(),
            _ => continue,
        }
    }
}

/// Collect messages until `exit` or `error` for `id`.
pub async fn until_finished(socket: &mut Socket, id: &str) -> Vec<Message> {
    let mut out = Vec::new();
    loop {
        let msg = recv(socket).await;
        let last = msg.id == id && matches!(msg.kind, MessageType::Exit | MessageType::Error);
        out.push(msg);
        if last {
            return out;
        }
    }
}

/// Concatenated payloads of one stream for one session.
pub fn output_of(messages: &[Message], id: &str, kind: MessageType) -> Vec<u8> {
    messages
        .iter()
        .filter(|m| m.id == id && m.kind == kind)
        .flat_map(|m| m.payload().unwrap())
        .collect()
}

pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
