//! Wire types shared by the relay agent and the backends that drive it.
//!
//! Every event crossing an agent WebSocket is a single JSON [`Message`]
//! tagged by its `type` field. Opaque stdio payloads are carried base64
//! encoded so binary output survives the JSON envelope unchanged.
//!
//! The [`frame`] module holds the Docker stdio multiplex codec used when a
//! non-TTY session is bridged back onto a raw Docker client stream.

mod error;
pub mod frame;
pub mod health;
pub mod message;

pub use error::ProtocolError;
pub use frame::{FRAME_HEADER_LEN, StdioFrame, StdioFrameCodec};
pub use health::{HealthLogEntry, HealthStatus};
pub use message::{Message, MessageType, StdStream};
