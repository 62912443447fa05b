//! Exec and attach sessions.
//!
//! Both kinds are driven through the [`Session`] capability set so the
//! registry and router never need to know which one they hold.

mod attach;
mod exec;
mod registry;

use async_trait::async_trait;

use crate::error::Result;

pub use attach::AttachSession;
pub use exec::ExecSession;
pub use registry::SessionRegistry;

/// How long `close` waits for a killed child to be reaped.
pub const CLOSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Operations every session supports.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> &str;

    async fn write_stdin(&self, data: &[u8]) -> Result<()>;

    async fn close_stdin(&self) -> Result<()>;

    /// Deliver a signal by symbolic name (`TERM`, `sigint`, ...).
    fn signal(&self, name: &str) -> Result<()>;

    fn resize(&self, width: u16, height: u16) -> Result<()>;

    /// Resolve once the session has finished streaming.
    async fn wait(&self);

    /// Tear the session down. Must be idempotent.
    async fn close(&self);
}
