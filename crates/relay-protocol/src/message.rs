//! The message envelope.
//!
//! A single flat record carries every kind of event in both directions.
//! Only `type` and `id` are always present; the remaining fields are set
//! according to the tag.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ProtocolError;
use crate::health::{HealthLogEntry, HealthStatus};

// ============================================================================
// Type tag
// ============================================================================

/// The `type` tag of a [`Message`].
///
/// Tags this crate does not know are preserved verbatim in
/// [`MessageType::Other`] so the receiver can report them back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    // -- client -> agent --
    /// Start a subprocess.
    Exec,
    /// Attach to the main process.
    Attach,
    /// Deliver input bytes.
    Stdin,
    /// Close input.
    CloseStdin,
    /// Send an OS signal.
    Signal,
    /// Resize the PTY.
    Resize,

    // -- agent -> client --
    /// Output bytes on stdout.
    Stdout,
    /// Output bytes on stderr.
    Stderr,
    /// Process exit with code.
    Exit,
    /// Session error.
    Error,
    /// Health status update.
    Health,

    /// Any tag not listed above.
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Exec => "exec",
            MessageType::Attach => "attach",
            MessageType::Stdin => "stdin",
            MessageType::CloseStdin => "close_stdin",
            MessageType::Signal => "signal",
            MessageType::Resize => "resize",
            MessageType::Stdout => "stdout",
            MessageType::Stderr => "stderr",
            MessageType::Exit => "exit",
            MessageType::Error => "error",
            MessageType::Health => "health",
            MessageType::Other(tag) => tag,
        }
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        match tag {
            "exec" => MessageType::Exec,
            "attach" => MessageType::Attach,
            "stdin" => MessageType::Stdin,
            "close_stdin" => MessageType::CloseStdin,
            "signal" => MessageType::Signal,
            "resize" => MessageType::Resize,
            "stdout" => MessageType::Stdout,
            "stderr" => MessageType::Stderr,
            "exit" => MessageType::Exit,
            "error" => MessageType::Error,
            "health" => MessageType::Health,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match MessageType::from(tag.as_str()) {
            MessageType::Other(_) => MessageType::Other(tag),
            known => known,
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two output streams of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl StdStream {
    /// Stream id used in the Docker multiplex frame header.
    pub fn frame_id(self) -> u8 {
        match self {
            StdStream::Stdout => 1,
            StdStream::Stderr => 2,
        }
    }

    pub fn from_frame_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(StdStream::Stdout),
            2 => Some(StdStream::Stderr),
            _ => None,
        }
    }

    pub fn message_type(self) -> MessageType {
        match self {
            StdStream::Stdout => MessageType::Stdout,
            StdStream::Stderr => MessageType::Stderr,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StdStream::Stdout => "stdout",
            StdStream::Stderr => "stderr",
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// The sole wire record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Event tag.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Session identifier.
    #[serde(default)]
    pub id: String,

    /// Ordered argv for `exec`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,

    /// Ordered `KEY=VALUE` strings added to the inherited environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tty: bool,

    /// Base64 of the raw byte chunk for `stdin`, `stdout` and `stderr`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    /// Symbolic signal name, e.g. `TERM` or `sigint`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,

    /// Exit code carried by `exit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,

    /// Human readable error text carried by `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Health status carried by `health`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u16>,

    /// Recent health probe results carried by `health`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Vec<HealthLogEntry>>,
}

impl Message {
    /// A bare message with only the tag and id set.
    pub fn new(kind: MessageType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            cmd: Vec::new(),
            env: Vec::new(),
            workdir: None,
            tty: false,
            data: None,
            signal: None,
            code: None,
            message: None,
            status: None,
            width: None,
            height: None,
            log: None,
        }
    }

    pub fn exec(
        id: impl Into<String>,
        cmd: Vec<String>,
        env: Vec<String>,
        workdir: Option<String>,
        tty: bool,
    ) -> Self {
        Self {
            cmd,
            env,
            workdir,
            tty,
            ..Self::new(MessageType::Exec, id)
        }
    }

    pub fn attach(id: impl Into<String>) -> Self {
        Self::new(MessageType::Attach, id)
    }

    pub fn stdin(id: impl Into<String>, data: &[u8]) -> Self {
        Self {
            data: Some(STANDARD.encode(data)),
            ..Self::new(MessageType::Stdin, id)
        }
    }

    pub fn close_stdin(id: impl Into<String>) -> Self {
        Self::new(MessageType::CloseStdin, id)
    }

    pub fn signal(id: impl Into<String>, signal: impl Into<String>) -> Self {
        Self {
            signal: Some(signal.into()),
            ..Self::new(MessageType::Signal, id)
        }
    }

    pub fn resize(id: impl Into<String>, width: u16, height: u16) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::new(MessageType::Resize, id)
        }
    }

    /// A `stdout` or `stderr` chunk.
    pub fn output(stream: StdStream, id: impl Into<String>, data: &[u8]) -> Self {
        Self {
            data: Some(STANDARD.encode(data)),
            ..Self::new(stream.message_type(), id)
        }
    }

    pub fn exit(id: impl Into<String>, code: i32) -> Self {
        Self {
            code: Some(code),
            ..Self::new(MessageType::Exit, id)
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(MessageType::Error, id)
        }
    }

    pub fn health(status: HealthStatus, log: Vec<HealthLogEntry>) -> Self {
        Self {
            status: Some(status.as_str().to_string()),
            log: Some(log),
            ..Self::new(MessageType::Health, "")
        }
    }

    /// Decode `data` into the raw byte chunk. A missing field is an empty chunk.
    pub fn payload(&self) -> Result<Vec<u8>, ProtocolError> {
        match &self.data {
            Some(encoded) => Ok(STANDARD.decode(encoded)?),
            None => Ok(Vec::new()),
        }
    }

    /// The output stream this message carries, if it is `stdout` or `stderr`.
    pub fn stream(&self) -> Option<StdStream> {
        match self.kind {
            MessageType::Stdout => Some(StdStream::Stdout),
            MessageType::Stderr => Some(StdStream::Stderr),
            _ => None,
        }
    }
}
