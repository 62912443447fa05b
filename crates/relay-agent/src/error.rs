//! Agent error types.

use relay_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by sessions, the router and the transport layers.
///
/// The `Display` text of the validation variants is sent verbatim to the
/// client in `error` messages.
#[derive(Debug, Error)]
pub enum AgentError {
    /// `exec` or `attach` arrived without a session id.
    #[error("{0} requires id")]
    MissingId(&'static str),

    /// `exec` arrived with an empty argv.
    #[error("exec requires cmd")]
    MissingCommand,

    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    /// `attach` while the agent supervises no main process.
    #[error("no main process to attach to")]
    NoMainProcess,

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Starting a child process failed.
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Pseudo-terminal setup or resize failed.
    #[error("pty error: {0}")]
    Pty(String),

    /// WebSocket handshake, read or write failure.
    #[error("websocket error: {0}")]
    Transport(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The process has no open stdin.
    #[error("stdin not available")]
    StdinUnavailable,

    #[error("connection closed")]
    ConnectionClosed,

    /// The reverse dial loop gave up.
    #[error("reverse connect failed after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: String },

    #[error("main process exited")]
    MainProcessExited,

    /// No agent registered for the container within the deadline.
    #[error("timed out waiting for agent {0}")]
    AgentTimeout(String),

    /// The agent did not disconnect within the deadline.
    #[error("timed out waiting for agent {0} to disconnect")]
    DisconnectTimeout(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AgentError::Transport(err.to_string())
    }
}

impl From<axum::Error> for AgentError {
    fn from(err: axum::Error) -> Self {
        AgentError::Transport(err.to_string())
    }
}

/// Result alias used throughout the agent.
pub type Result<T, E = AgentError> = std::result::Result<T, E>;
