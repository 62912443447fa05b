//! Connection-scoped session index.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use log::debug;

use super::Session;
use crate::conn::ConnId;

struct Entry {
    session: Arc<dyn Session>,
    conn: ConnId,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Entry>,
    by_conn: HashMap<ConnId, Vec<String>>,
}

impl Inner {
    /// Unlink `id` from both indexes and return its session.
    fn take(&mut self, id: &str) -> Option<Arc<dyn Session>> {
        let entry = self.sessions.remove(id)?;
        if let Some(ids) = self.by_conn.get_mut(&entry.conn) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                self.by_conn.remove(&entry.conn);
            }
        }
        Some(entry.session)
    }
}

/// Maps session ids to sessions and connections to the ids they own.
///
/// Every registered session belongs to exactly one connection. Sessions
/// are always closed outside the lock.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("SessionRegistry")
            .field("sessions", &inner.sessions.len())
            .field("connections", &inner.by_conn.len())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `session` under its id for `conn`.
    ///
    /// A session already registered under the same id is unlinked and
    /// closed.
    pub async fn register(&self, session: Arc<dyn Session>, conn: ConnId) {
        let id = session.id().to_string();
        let displaced = {
            let mut inner = self.lock();
            let displaced = inner.take(&id);
            inner.by_conn.entry(conn).or_default().push(id.clone());
            inner.sessions.insert(id.clone(), Entry { session, conn });
            displaced
        };

        if let Some(old) = displaced {
            debug!("session {} replaced, closing previous instance", id);
            old.close().await;
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Session>> {
        self.lock().sessions.get(id).map(|entry| entry.session.clone())
    }

    /// Unregister and close a session. Returns false if the id was unknown.
    pub async fn remove(&self, id: &str) -> bool {
        let session = self.lock().take(id);
        match session {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Unregister and close `session` if it is still the one registered
    /// under its id. A successor that reused the id is left alone.
    pub async fn release(&self, session: &Arc<dyn Session>) -> bool {
        let taken = {
            let mut inner = self.lock();
            let current = inner.sessions.get(session.id()).is_some_and(|entry| {
                std::ptr::addr_eq(Arc::as_ptr(&entry.session), Arc::as_ptr(session))
            });
            if current { inner.take(session.id()) } else { None }
        };
        match taken {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every session owned by `conn`.
    pub async fn cleanup_conn(&self, conn: ConnId) {
        let sessions: Vec<_> = {
            let mut inner = self.lock();
            let ids = inner.by_conn.remove(&conn).unwrap_or_default();
            ids.iter()
                .filter_map(|id| inner.sessions.remove(id).map(|entry| entry.session))
                .collect()
        };

        if !sessions.is_empty() {
            debug!("closing {} session(s) of connection {}", sessions.len(), conn);
            join_all(sessions.iter().map(|session| session.close())).await;
        }
    }

    /// Close every session of every connection.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = {
            let mut inner = self.lock();
            inner.by_conn.clear();
            inner.sessions.drain().map(|(_, entry)| entry.session).collect()
        };
        join_all(sessions.iter().map(|session| session.close())).await;
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids owned by `conn`, in registration order.
    pub fn conn_sessions(&self, conn: ConnId) -> Vec<String> {
        self.lock().by_conn.get(&conn).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSession {
        id: String,
        closes: AtomicUsize,
    }

    impl FakeSession {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                closes: AtomicUsize::new(0),
            })
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Session for FakeSession {
        fn id(&self) -> &str {
            &self.id
        }
        async fn write_stdin(&self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn close_stdin(&self) -> Result<()> {
            Ok(())
        }
        fn signal(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        fn resize(&self, _width: u16, _height: u16) -> Result<()> {
            Ok(())
        }
        async fn wait(&self) {}
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn register_get_remove() {
        let registry = SessionRegistry::new();
        let session = FakeSession::new("a");
        registry.register(session.clone(), 1).await;

        assert_eq!(registry.get("a").unwrap().id(), "a");
        assert_eq!(registry.conn_sessions(1), vec!["a".to_string()]);

        assert!(registry.remove("a").await);
        assert!(!registry.remove("a").await);
        assert!(registry.get("a").is_none());
        assert!(registry.conn_sessions(1).is_empty());
        assert_eq!(session.closes(), 1);
    }

    #[tokio::test]
    async fn cleanup_only_touches_owning_connection() {
        let registry = SessionRegistry::new();
        let a = FakeSession::new("a");
        let b = FakeSession::new("b");
        let c = FakeSession::new("c");
        registry.register(a.clone(), 1).await;
        registry.register(b.clone(), 1).await;
        registry.register(c.clone(), 2).await;

        registry.cleanup_conn(1).await;

        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_none());
        assert!(registry.get("c").is_some());
        assert_eq!((a.closes(), b.closes(), c.closes()), (1, 1, 0));

        registry.cleanup_conn(1).await;
        assert_eq!(a.closes(), 1);
    }

    #[tokio::test]
    async fn reusing_an_id_moves_ownership() {
        let registry = SessionRegistry::new();
        let first = FakeSession::new("dup");
        let second = FakeSession::new("dup");
        registry.register(first.clone(), 1).await;
        registry.register(second.clone(), 2).await;

        assert_eq!(first.closes(), 1);
        assert!(registry.conn_sessions(1).is_empty());
        assert_eq!(registry.conn_sessions(2), vec!["dup".to_string()]);

        registry.cleanup_conn(1).await;
        assert_eq!(second.closes(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn release_ignores_a_successor() {
        let registry = SessionRegistry::new();
        let first: Arc<dyn Session> = FakeSession::new("dup");
        let second = FakeSession::new("dup");
        registry.register(first.clone(), 1).await;
        registry.register(second.clone(), 1).await;

        assert!(!registry.release(&first).await);
        assert_eq!(registry.len(), 1);
        assert_eq!(second.closes(), 0);

        let second: Arc<dyn Session> = second;
        assert!(registry.release(&second).await);
        assert!(registry.is_empty());
        assert!(registry.conn_sessions(1).is_empty());
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let registry = SessionRegistry::new();
        let a = FakeSession::new("a");
        let b = FakeSession::new("b");
        registry.register(a.clone(), 1).await;
        registry.register(b.clone(), 2).await;

        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!((a.closes(), b.closes()), (1, 1));
    }
}
