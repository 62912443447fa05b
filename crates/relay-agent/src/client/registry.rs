//! Index of reverse agent connections by container id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};
use tokio_util::sync::CancellationToken;

use super::AgentConn;
use crate::error::{AgentError, Result};

#[derive(Debug, Default)]
struct Inner {
    conns: HashMap<String, Arc<AgentConn>>,
    /// Cancelled when an agent registers; created by the first waiter.
    ready: HashMap<String, CancellationToken>,
    /// Cancelled when the agent is removed; created by prepare or register.
    gone: HashMap<String, CancellationToken>,
}

/// Tracks which containers have a live agent dialed in.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    inner: Mutex<Inner>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Expect an agent for `container_id`, so that
    /// [`wait_for_disconnect`](Self::wait_for_disconnect) blocks even
    /// before it dials in.
    pub fn prepare(&self, container_id: &str) {
        self.lock()
            .gone
            .entry(container_id.to_string())
            .or_default();
    }

    /// Store an agent connection and wake anyone waiting for it.
    pub fn register(&self, container_id: &str, conn: Arc<AgentConn>) {
        let mut inner = self.lock();
        inner.conns.insert(container_id.to_string(), conn);
        inner.gone.entry(container_id.to_string()).or_default();
        if let Some(ready) = inner.ready.remove(container_id) {
            ready.cancel();
        }
        info!("agent registered for container {}", container_id);
    }

    pub fn get(&self, container_id: &str) -> Option<Arc<AgentConn>> {
        self.lock().conns.get(container_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().conns.is_empty()
    }

    /// Drop and close the agent for `container_id`, waking disconnect waiters.
    pub async fn remove(&self, container_id: &str) {
        let (conn, gone) = {
            let mut inner = self.lock();
            (
                inner.conns.remove(container_id),
                inner.gone.remove(container_id),
            )
        };
        if let Some(conn) = conn {
            conn.close().await;
            debug!("agent for container {} closed", container_id);
        }
        if let Some(gone) = gone {
            gone.cancel();
        }
    }

    /// Wait until an agent registers for `container_id`.
    pub async fn wait_for_agent(
        &self,
        container_id: &str,
        timeout: Duration,
    ) -> Result<Arc<AgentConn>> {
        let ready = {
            let mut inner = self.lock();
            if let Some(conn) = inner.conns.get(container_id) {
                return Ok(conn.clone());
            }
            inner
                .ready
                .entry(container_id.to_string())
                .or_default()
                .clone()
        };

        if tokio::time::timeout(timeout, ready.cancelled()).await.is_err() {
            return Err(AgentError::AgentTimeout(container_id.to_string()));
        }
        self.get(container_id).ok_or(AgentError::ConnectionClosed)
    }

    /// Wait until the agent for `container_id` is removed. Returns at once
    /// when nothing is registered or prepared under that id.
    pub async fn wait_for_disconnect(&self, container_id: &str, timeout: Duration) -> Result<()> {
        let Some(gone) = self.lock().gone.get(container_id).cloned() else {
            return Ok(());
        };
        tokio::time::timeout(timeout, gone.cancelled())
            .await
            .map_err(|_| AgentError::DisconnectTimeout(container_id.to_string()))
    }
}
