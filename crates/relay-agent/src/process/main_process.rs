//! Supervisor for the long-lived user process.
//!
//! The main process runs in its own process group with piped stdio. Two
//! reader tasks copy stdout and stderr into per-stream ring buffers and
//! fan every chunk out to the current subscribers; a third task waits for
//! the exit, latches the code and closes all subscriber channels.
//!
//! Fan-out never blocks the reader: a subscriber whose channel is full
//! simply misses that chunk.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use relay_protocol::StdStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{READ_CHUNK_SIZE, READER_DRAIN_TIMEOUT, RingBuffer, Signal, exit_code, parse_env};
use crate::error::{AgentError, Result};

/// Per-subscriber channel capacity.
pub const SUBSCRIBER_CAPACITY: usize = 256;

const DEFAULT_SHELL: &str = "/bin/sh";

/// One chunk of main-process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub stream: StdStream,
    pub data: Bytes,
}

/// Identifies one subscription, independent of the session id it serves.
///
/// Two attach sessions may share an id while one replaces the other; the
/// key keeps the older one from unsubscribing its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberKey(u64);

/// Replay state and live channel handed to a new subscriber.
#[derive(Debug)]
pub struct Subscription {
    pub key: SubscriberKey,
    /// Buffered stdout at the moment of subscribing.
    pub stdout: Vec<u8>,
    /// Buffered stderr at the moment of subscribing.
    pub stderr: Vec<u8>,
    /// Live output. Closed when the process exits.
    pub events: mpsc::Receiver<OutputEvent>,
    /// Set when the process had already exited at subscribe time.
    pub exit_code: Option<i32>,
}

#[derive(Debug)]
struct Listener {
    id: String,
    tx: mpsc::Sender<OutputEvent>,
}

#[derive(Debug, Default)]
struct State {
    listeners: HashMap<SubscriberKey, Listener>,
    next_key: u64,
    exit_code: Option<i32>,
}

impl State {
    fn next_key(&mut self) -> SubscriberKey {
        let key = SubscriberKey(self.next_key);
        self.next_key += 1;
        key
    }

    fn add_listener(&mut self, id: &str, tx: mpsc::Sender<OutputEvent>) -> SubscriberKey {
        let key = self.next_key();
        self.listeners.insert(
            key,
            Listener {
                id: id.to_string(),
                tx,
            },
        );
        key
    }

    fn fan_out(&self, event: &OutputEvent) {
        for Listener { id, tx } in self.listeners.values() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!("subscriber {} is full, dropping {} chunk", id, event.stream.as_str());
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Output buffers and subscriber table shared with the reader tasks.
#[derive(Debug)]
struct Shared {
    stdout: RingBuffer,
    stderr: RingBuffer,
    state: Mutex<State>,
}

impl Shared {
    fn new() -> Self {
        Self {
            stdout: RingBuffer::new(),
            stderr: RingBuffer::new(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ring(&self, stream: StdStream) -> &RingBuffer {
        match stream {
            StdStream::Stdout => &self.stdout,
            StdStream::Stderr => &self.stderr,
        }
    }

    /// Record a chunk and broadcast it.
    ///
    /// The buffer write and the fan-out happen under the state lock so a
    /// concurrent subscriber sees each chunk exactly once, either in its
    /// snapshot or on its channel.
    fn publish(&self, stream: StdStream, data: Bytes) {
        let state = self.state();
        self.ring(stream).write(&data);
        state.fan_out(&OutputEvent { stream, data });
    }
}

/// The supervised main process.
#[derive(Debug)]
pub struct MainProcess {
    pid: u32,
    shared: Arc<Shared>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    done: CancellationToken,
}

impl MainProcess {
    /// Start the main process. An empty argv runs `/bin/sh`.
    ///
    /// `env` entries are `KEY=VALUE` strings added to the inherited
    /// environment.
    pub fn spawn(args: &[String], env: &[String]) -> Result<Arc<Self>> {
        let (program, rest) = match args.split_first() {
            Some((program, rest)) => (program.as_str(), rest),
            None => (DEFAULT_SHELL, &[][..]),
        };

        let mut command = Command::new(program);
        command
            .args(rest)
            .envs(parse_env(env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command.spawn().map_err(|source| AgentError::Spawn {
            command: program.to_string(),
            source,
        })?;
        let pid = child.id().ok_or(AgentError::MainProcessExited)?;

        let shared = Arc::new(Shared::new());
        let done = CancellationToken::new();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, StdStream::Stdout, shared.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, StdStream::Stderr, shared.clone()));
        }
        let stdin = child.stdin.take();

        info!("main process started: pid={} cmd={:?}", pid, program);

        let wait_shared = shared.clone();
        let wait_done = done.clone();
        tokio::spawn(async move {
            let code = exit_code(child.wait().await);

            for reader in readers {
                let abort = reader.abort_handle();
                if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                    debug!("main process reader still open after exit, abandoning it");
                    abort.abort();
                }
            }

            {
                let mut state = wait_shared.state();
                state.exit_code = Some(code);
                // Dropping the senders closes every subscriber channel.
                state.listeners.clear();
            }
            info!("main process exited: pid={} code={}", pid, code);
            wait_done.cancel();
        });

        Ok(Arc::new(Self {
            pid,
            shared,
            stdin: tokio::sync::Mutex::new(stdin),
            done,
        }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Register a subscriber and snapshot both buffers atomically.
    ///
    /// After exit the returned channel is already closed and `exit_code`
    /// is set.
    pub fn subscribe(&self, id: &str) -> Subscription {
        let mut state = self.shared.state();
        let (tx, events) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let stdout = self.shared.stdout.bytes();
        let stderr = self.shared.stderr.bytes();

        // After exit the sender is dropped here, closing the channel.
        let key = if state.exit_code.is_none() {
            state.add_listener(id, tx)
        } else {
            state.next_key()
        };
        trace!("subscriber {} registered for {}", key.0, id);

        Subscription {
            key,
            stdout,
            stderr,
            events,
            exit_code: state.exit_code,
        }
    }

    /// Drop one subscription. Unknown or already removed keys are ignored.
    pub fn unsubscribe(&self, key: SubscriberKey) {
        if let Some(listener) = self.shared.state().listeners.remove(&key) {
            trace!("subscriber {} for {} removed", key.0, listener.id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.state().listeners.len()
    }

    pub async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(AgentError::StdinUnavailable)?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close stdin so the process reads EOF. Closing twice is a no-op.
    pub async fn close_stdin(&self) {
        if self.stdin.lock().await.take().is_some() {
            debug!("main process stdin closed");
        }
    }

    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.done.is_cancelled() {
            return Err(AgentError::MainProcessExited);
        }
        super::send_signal(self.pid, signal.as_raw())?;
        Ok(())
    }

    /// The latched exit code, or `None` while running.
    pub fn exit_code(&self) -> Option<i32> {
        self.shared.state().exit_code
    }

    pub fn has_exited(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Cancelled exactly once, after the exit code is latched.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Wait for exit and return the code.
    pub async fn wait(&self) -> i32 {
        self.done.cancelled().await;
        self.exit_code().unwrap_or(1)
    }

    /// Snapshot of buffered stdout.
    pub fn stdout_snapshot(&self) -> Vec<u8> {
        self.shared.stdout.bytes()
    }

    /// Snapshot of buffered stderr.
    pub fn stderr_snapshot(&self) -> Vec<u8> {
        self.shared.stderr.bytes()
    }
}

fn spawn_reader<R>(mut reader: R, stream: StdStream, shared: Arc<Shared>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => shared.publish(stream, Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    warn!("main process {} read failed: {}", stream.as_str(), e);
                    break;
                }
            }
        }
    })
}
