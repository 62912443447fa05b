//! Reverse mode: dial out to the backend instead of listening.
//!
//! The agent opens one WebSocket to the callback URL and serves it with
//! the same read loop as forward mode. When the socket drops it redials
//! with exponential backoff until the attempt budget runs out, the main
//! process exits, or shutdown is requested.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::conn::{Connection, Inbound};
use crate::error::{AgentError, Result};
use crate::router::{MessageRouter, serve_connection};

pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Where and how to dial.
#[derive(Debug, Clone)]
pub struct ReverseOptions {
    pub callback_url: String,
    pub token: String,
    /// Consecutive failed dials tolerated before giving up.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReverseOptions {
    pub fn new(callback_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            callback_url: callback_url.into(),
            token: token.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Rewrite an http(s) callback URL to the matching ws(s) scheme.
pub fn callback_ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// Doubling delay, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// The delay to wait now; the following call returns twice as much.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Open one WebSocket to `url`, presenting `token` as a bearer credential.
pub async fn dial(url: &str, token: &str) -> Result<ClientSocket> {
    let mut request = url.into_client_request()?;
    if !token.is_empty() {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| AgentError::Transport(format!("invalid token header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (socket, _response) = connect_async(request).await?;
    Ok(socket)
}

/// Run the reverse connection loop.
///
/// Returns `Ok` when stopped by the main process exiting or by `shutdown`,
/// and `ReconnectExhausted` once `max_retries` consecutive dials failed.
pub async fn run(
    options: ReverseOptions,
    router: Arc<MessageRouter>,
    shutdown: CancellationToken,
) -> Result<()> {
    let url = callback_ws_url(&options.callback_url);
    let main_done = router
        .main_process()
        .map(|m| m.done().clone())
        .unwrap_or_default();
    let mut backoff = Backoff::new(options.base_backoff, options.max_backoff);
    let mut failures = 0u32;

    loop {
        if main_done.is_cancelled() {
            info!("main process exited; not reconnecting");
            return Ok(());
        }

        match dial(&url, &options.token).await {
            Ok(socket) => {
                info!("connected to {}", url);
                failures = 0;
                backoff.reset();

                let (sink, stream) = socket.split();
                let conn = Connection::new(sink);
                let frames = stream.map(|frame| frame.map(Inbound::from).map_err(AgentError::from));

                tokio::select! {
                    _ = serve_connection(router.clone(), conn.clone(), frames) => {
                        warn!("reverse connection to {} lost", url);
                    }
                    _ = shutdown.cancelled() => {
                        router.registry().cleanup_conn(conn.id()).await;
                        conn.close().await;
                        return Ok(());
                    }
                }
                conn.close().await;
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "dial {} failed (attempt {}/{}): {}",
                    url, failures, options.max_retries, e
                );
                if failures >= options.max_retries {
                    return Err(AgentError::ReconnectExhausted {
                        attempts: failures,
                        last: e.to_string(),
                    });
                }
            }
        }

        let delay = backoff.next_delay();
        debug!("reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = main_done.cancelled() => {
                info!("main process exited; not reconnecting");
                return Ok(());
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}
