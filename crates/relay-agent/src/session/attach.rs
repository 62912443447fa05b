//! Attach sessions: a viewer of the main process.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use relay_protocol::{Message, StdStream};
use tokio_util::sync::CancellationToken;

use super::Session;
use crate::conn::Connection;
use crate::error::Result;
use crate::process::{MainProcess, Signal, SubscriberKey, Subscription};

/// Replays the main process's buffered output, then streams it live.
///
/// Any number of attach sessions may watch the same process; each owns an
/// independent subscription.
#[derive(Debug)]
pub struct AttachSession {
    id: String,
    main: Arc<MainProcess>,
    key: SubscriberKey,
    done: CancellationToken,
}

impl AttachSession {
    /// Subscribe to `main` and start streaming to `conn`.
    pub fn start(id: impl Into<String>, main: Arc<MainProcess>, conn: Connection) -> Arc<Self> {
        let id = id.into();
        let subscription = main.subscribe(&id);
        let session = Arc::new(Self {
            id: id.clone(),
            main: main.clone(),
            key: subscription.key,
            done: CancellationToken::new(),
        });

        let done = session.done.clone();
        tokio::spawn(async move {
            stream(&id, &main, subscription, &conn).await;
            done.cancel();
        });

        debug!("attach session {} started", session.id);
        session
    }
}

async fn stream(id: &str, main: &MainProcess, mut sub: Subscription, conn: &Connection) {
    if !sub.stdout.is_empty() {
        send(conn, Message::output(StdStream::Stdout, id, &sub.stdout)).await;
    }
    if !sub.stderr.is_empty() {
        send(conn, Message::output(StdStream::Stderr, id, &sub.stderr)).await;
    }

    if let Some(code) = sub.exit_code {
        send(conn, Message::exit(id, code)).await;
        return;
    }

    while let Some(event) = sub.events.recv().await {
        send(conn, Message::output(event.stream, id, &event.data)).await;
    }

    // The channel also closes on unsubscribe; only report a real exit.
    if let Some(code) = main.exit_code() {
        send(conn, Message::exit(id, code)).await;
    }
    debug!("attach session {} stream finished", id);
}

async fn send(conn: &Connection, msg: Message) {
    if let Err(e) = conn.send(&msg).await {
        debug!("attach session {} dropped {}: {}", msg.id, msg.kind, e);
    }
}

#[async_trait]
impl Session for AttachSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        self.main.write_stdin(data).await
    }

    async fn close_stdin(&self) -> Result<()> {
        self.main.close_stdin().await;
        Ok(())
    }

    fn signal(&self, name: &str) -> Result<()> {
        self.main.signal(Signal::parse(name)?)
    }

    /// The main process has no terminal.
    fn resize(&self, _width: u16, _height: u16) -> Result<()> {
        Ok(())
    }

    async fn wait(&self) {
        self.done.cancelled().await;
    }

    async fn close(&self) {
        self.main.unsubscribe(self.key);
        debug!("attach session {} closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testing::{channel_connection, next_message, until_finished};
    use relay_protocol::MessageType;
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn replays_then_streams_live_output() {
        let main = MainProcess::spawn(&sh("echo pre; sleep 0.3; echo post"), &[]).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (conn, mut rx) = channel_connection();
        let _session = AttachSession::start("a1", main.clone(), conn);

        let first = next_message(&mut rx).await;
        assert_eq!(first.kind, MessageType::Stdout);
        assert_eq!(first.payload().unwrap(), b"pre\n");

        let rest = until_finished(&mut rx, "a1").await;
        let live: Vec<u8> = rest
            .iter()
            .filter(|m| m.kind == MessageType::Stdout)
            .flat_map(|m| m.payload().unwrap())
            .collect();
        assert_eq!(live, b"post\n");
        assert_eq!(rest.last().unwrap().code, Some(0));
    }

    #[tokio::test]
    async fn attach_after_exit_reports_final_state() {
        let main = MainProcess::spawn(&sh("echo done; echo warn >&2; exit 4"), &[]).unwrap();
        main.wait().await;

        let (conn, mut rx) = channel_connection();
        let session = AttachSession::start("late", main, conn);
        let messages = until_finished(&mut rx, "late").await;

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].kind, MessageType::Stdout);
        assert_eq!(messages[0].payload().unwrap(), b"done\n");
        assert_eq!(messages[1].kind, MessageType::Stderr);
        assert_eq!(messages[1].payload().unwrap(), b"warn\n");
        assert_eq!(messages[2], Message::exit("late", 4));
        session.wait().await;
    }

    #[tokio::test]
    async fn concurrent_attachers_each_get_full_stream() {
        let main = MainProcess::spawn(&sh("echo a; sleep 0.2; echo b"), &[]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (conn1, mut rx1) = channel_connection();
        let (conn2, mut rx2) = channel_connection();
        let _s1 = AttachSession::start("v1", main.clone(), conn1);
        let _s2 = AttachSession::start("v2", main.clone(), conn2);

        for (rx, id) in [(&mut rx1, "v1"), (&mut rx2, "v2")] {
            let messages = until_finished(rx, id).await;
            let out: Vec<u8> = messages
                .iter()
                .filter(|m| m.kind == MessageType::Stdout)
                .flat_map(|m| m.payload().unwrap())
                .collect();
            assert_eq!(out, b"a\nb\n");
        }
    }

    #[tokio::test]
    async fn close_unsubscribes_without_exit() {
        let main = MainProcess::spawn(&sh("sleep 30"), &[]).unwrap();
        let (conn, mut rx) = channel_connection();
        let session = AttachSession::start("c", main.clone(), conn);
        assert_eq!(main.subscriber_count(), 1);

        session.close().await;
        session.wait().await;
        assert_eq!(main.subscriber_count(), 0);
        assert!(rx.try_recv().is_err());

        session.signal("KILL").unwrap();
        main.wait().await;
    }

    #[tokio::test]
    async fn closing_a_replaced_session_keeps_its_successor() {
        let main = MainProcess::spawn(&sh("echo pre; sleep 0.3; echo post"), &[]).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (conn, mut rx) = channel_connection();
        let first = AttachSession::start("ctr", main.clone(), conn.clone());
        let second = AttachSession::start("ctr", main.clone(), conn);
        first.close().await;
        first.wait().await;
        assert_eq!(main.subscriber_count(), 1);

        // Both replays arrive before the successor's live output.
        let messages = until_finished(&mut rx, "ctr").await;
        let out: Vec<u8> = messages
            .iter()
            .filter(|m| m.kind == MessageType::Stdout)
            .flat_map(|m| m.payload().unwrap())
            .collect();
        assert_eq!(out, b"pre\npre\npost\n");
        assert_eq!(messages.last().unwrap(), &Message::exit("ctr", 0));
        second.wait().await;
    }

    #[tokio::test]
    async fn stdin_forwards_to_main_process() {
        let main = MainProcess::spawn(&["cat".to_string()], &[]).unwrap();
        let (conn, mut rx) = channel_connection();
        let session = AttachSession::start("in", main, conn);

        session.write_stdin(b"echo\n").await.unwrap();
        session.close_stdin().await.unwrap();
        session.resize(80, 24).unwrap();

        let messages = until_finished(&mut rx, "in").await;
        let out: Vec<u8> = messages
            .iter()
            .filter(|m| m.kind == MessageType::Stdout)
            .flat_map(|m| m.payload().unwrap())
            .collect();
        assert_eq!(out, b"echo\n");
    }
}
