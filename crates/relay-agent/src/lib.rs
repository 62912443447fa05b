//! In-container agent that exposes process execution over WebSocket.
//!
//! The agent either listens for backend connections (forward mode) or
//! dials out to a callback URL (reverse mode). Either way each connection
//! carries JSON messages that start `exec` sessions, `attach` to the
//! supervised main process, and stream stdin and output as base64.
//!
//! The [`client`] module is the other end of the wire: it bridges a
//! Docker-style hijacked stream onto a multiplexed agent connection.

pub mod auth;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod health;
pub mod process;
pub mod reverse;
pub mod router;
pub mod server;
pub mod session;

pub use client::{AgentConn, AgentRegistry};
pub use config::AgentConfig;
pub use conn::Connection;
pub use error::{AgentError, Result};
pub use health::{HealthChecker, HealthcheckConfig};
pub use process::MainProcess;
pub use router::MessageRouter;
pub use server::AppState;
pub use session::SessionRegistry;
