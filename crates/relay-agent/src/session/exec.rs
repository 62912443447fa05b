//! Exec sessions: one short-lived child per session.
//!
//! Non-TTY children get three pipes and two output readers. TTY children
//! run on the slave side of a pseudo-terminal; the master is read by a
//! blocking thread and everything it yields is tagged as stdout.

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use relay_protocol::{Message, StdStream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{CLOSE_TIMEOUT, Session};
use crate::conn::Connection;
use crate::error::{AgentError, Result};
use crate::process::{
    READ_CHUNK_SIZE, READER_DRAIN_TIMEOUT, Signal, exit_code, parse_env, send_signal,
    signal_process_group,
};

const DEFAULT_PTY_ROWS: u16 = 24;
const DEFAULT_PTY_COLS: u16 = 80;

type PtyWriter = Arc<Mutex<Box<dyn Write + Send>>>;

enum Stdin {
    Pipe(ChildStdin),
    Pty(PtyWriter),
}

/// A running `exec` request.
pub struct ExecSession {
    id: String,
    pid: u32,
    stdin: tokio::sync::Mutex<Option<Stdin>>,
    /// Present for TTY sessions until closed.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    done: CancellationToken,
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("done", &self.done.is_cancelled())
            .finish()
    }
}

impl ExecSession {
    /// Spawn the child described by an `exec` message and start streaming
    /// its output to `conn`.
    pub fn start(msg: &Message, conn: Connection) -> Result<Arc<Self>> {
        if msg.id.is_empty() {
            return Err(AgentError::MissingId("exec"));
        }
        if msg.cmd.is_empty() {
            return Err(AgentError::MissingCommand);
        }

        let session = if msg.tty {
            Self::start_pty(msg, conn)?
        } else {
            Self::start_pipes(msg, conn)?
        };
        debug!(
            "exec session {} started: pid={} tty={} cmd={:?}",
            session.id, session.pid, msg.tty, msg.cmd
        );
        Ok(session)
    }

    fn start_pipes(msg: &Message, conn: Connection) -> Result<Arc<Self>> {
        let mut command = Command::new(&msg.cmd[0]);
        command
            .args(&msg.cmd[1..])
            .envs(parse_env(&msg.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = msg.workdir.as_deref().filter(|d| !d.is_empty()) {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| AgentError::Spawn {
            command: msg.cmd[0].clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| missing_pid(&msg.cmd[0]))?;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_pipe_reader(
                stdout,
                StdStream::Stdout,
                msg.id.clone(),
                conn.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_pipe_reader(
                stderr,
                StdStream::Stderr,
                msg.id.clone(),
                conn.clone(),
            ));
        }

        let session = Arc::new(Self {
            id: msg.id.clone(),
            pid,
            stdin: tokio::sync::Mutex::new(child.stdin.take().map(Stdin::Pipe)),
            master: Mutex::new(None),
            done: CancellationToken::new(),
        });

        let id = msg.id.clone();
        let done = session.done.clone();
        tokio::spawn(async move {
            let code = exit_code(child.wait().await);
            drain(readers).await;
            notify_exit(&conn, &id, code).await;
            done.cancel();
        });

        Ok(session)
    }

    fn start_pty(msg: &Message, conn: Connection) -> Result<Arc<Self>> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_PTY_ROWS,
                cols: DEFAULT_PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(pty_error)?;

        let mut builder = CommandBuilder::new(&msg.cmd[0]);
        builder.args(&msg.cmd[1..]);
        for (key, value) in parse_env(&msg.env) {
            builder.env(key, value);
        }
        // Without an explicit cwd the builder would start in $HOME.
        match msg.workdir.as_deref().filter(|d| !d.is_empty()) {
            Some(dir) => builder.cwd(Path::new(dir)),
            None => {
                if let Ok(dir) = std::env::current_dir() {
                    builder.cwd(dir);
                }
            }
        }

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| AgentError::Spawn {
                command: msg.cmd[0].clone(),
                source: io::Error::other(e.to_string()),
            })?;
        // The child holds its own slave fd; ours would keep the master from
        // seeing EOF.
        drop(pair.slave);

        let pid = child.process_id().ok_or_else(|| missing_pid(&msg.cmd[0]))?;
        let reader = pair.master.try_clone_reader().map_err(pty_error)?;
        let writer = pair.master.take_writer().map_err(pty_error)?;

        let forwarder = spawn_pty_reader(reader, msg.id.clone(), conn.clone());

        let session = Arc::new(Self {
            id: msg.id.clone(),
            pid,
            stdin: tokio::sync::Mutex::new(Some(Stdin::Pty(Arc::new(Mutex::new(writer))))),
            master: Mutex::new(Some(pair.master)),
            done: CancellationToken::new(),
        });

        let id = msg.id.clone();
        let done = session.done.clone();
        tokio::spawn(async move {
            let code = match tokio::task::spawn_blocking(move || child.wait()).await {
                Ok(Ok(status)) => i32::try_from(status.exit_code()).unwrap_or(1),
                Ok(Err(e)) => {
                    debug!("exec session {} wait failed: {}", id, e);
                    1
                }
                Err(e) => {
                    debug!("exec session {} wait task failed: {}", id, e);
                    1
                }
            };
            drain(vec![forwarder]).await;
            notify_exit(&conn, &id, code).await;
            done.cancel();
        });

        Ok(session)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_tty(&self) -> bool {
        self.master().is_some()
    }

    pub fn has_exited(&self) -> bool {
        self.done.is_cancelled()
    }

    fn master(&self) -> MutexGuard<'_, Option<Box<dyn MasterPty + Send>>> {
        self.master.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Session for ExecSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        match guard.as_mut() {
            Some(Stdin::Pipe(pipe)) => {
                pipe.write_all(data).await?;
                pipe.flush().await?;
                Ok(())
            }
            Some(Stdin::Pty(writer)) => {
                let writer = writer.clone();
                let data = data.to_vec();
                tokio::task::spawn_blocking(move || {
                    let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
                    writer.write_all(&data)?;
                    writer.flush()
                })
                .await
                .map_err(io::Error::other)??;
                Ok(())
            }
            None => Err(AgentError::StdinUnavailable),
        }
    }

    async fn close_stdin(&self) -> Result<()> {
        if let Some(stdin) = self.stdin.lock().await.take() {
            match stdin {
                Stdin::Pipe(mut pipe) => {
                    let _ = pipe.shutdown().await;
                }
                // Dropping the PTY writer sends EOF to the terminal.
                Stdin::Pty(writer) => {
                    let _ = tokio::task::spawn_blocking(move || drop(writer)).await;
                }
            }
            trace!("exec session {} stdin closed", self.id);
        }
        Ok(())
    }

    fn signal(&self, name: &str) -> Result<()> {
        let signal = Signal::parse(name)?;
        if self.done.is_cancelled() {
            debug!("exec session {} already exited, not sending {}", self.id, signal);
            return Ok(());
        }
        send_signal(self.pid, signal.as_raw())?;
        debug!("exec session {} sent {}", self.id, signal);
        Ok(())
    }

    fn resize(&self, width: u16, height: u16) -> Result<()> {
        match self.master().as_ref() {
            Some(master) => master
                .resize(PtySize {
                    rows: height,
                    cols: width,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(pty_error),
            None => Ok(()),
        }
    }

    /// Resolves once the exit message has been sent.
    async fn wait(&self) {
        self.done.cancelled().await;
    }

    async fn close(&self) {
        if !self.done.is_cancelled() {
            let killed = signal_process_group(self.pid, libc::SIGKILL);
            if let Err(e) = killed {
                trace!("exec session {} kill: {}", self.id, e);
            }
        }
        // Dropping the master hangs up the terminal.
        let master = self.master().take();
        drop(master);
        let _ = self.close_stdin().await;

        if tokio::time::timeout(CLOSE_TIMEOUT, self.done.cancelled())
            .await
            .is_err()
        {
            debug!("exec session {} did not finish within {:?}", self.id, CLOSE_TIMEOUT);
        }
        debug!("exec session {} closed", self.id);
    }
}

fn missing_pid(command: &str) -> AgentError {
    AgentError::Spawn {
        command: command.to_string(),
        source: io::Error::other("child exited before its pid was read"),
    }
}

fn pty_error(err: impl std::fmt::Display) -> AgentError {
    AgentError::Pty(err.to_string())
}

fn spawn_pipe_reader<R>(
    mut reader: R,
    stream: StdStream,
    id: String,
    conn: Connection,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    // Keep draining after a send failure so the child never
                    // blocks on a full pipe.
                    if let Err(e) = conn.send(&Message::output(stream, &id, &buf[..n])).await {
                        trace!("exec session {} dropped {} chunk: {}", id, stream.as_str(), e);
                    }
                }
            }
        }
    })
}

fn spawn_pty_reader(mut reader: Box<dyn Read + Send>, id: String, conn: Connection) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(64);

    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // EIO once the last slave fd is closed.
                Err(_) => break,
            }
        }
    });

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = conn.send(&Message::output(StdStream::Stdout, &id, &chunk)).await {
                trace!("exec session {} dropped pty chunk: {}", id, e);
            }
        }
    })
}

/// Let the readers flush what the child wrote before it exited.
async fn drain(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            abort.abort();
        }
    }
}

async fn notify_exit(conn: &Connection, id: &str, code: i32) {
    debug!("exec session {} exited with code {}", id, code);
    if let Err(e) = conn.send(&Message::exit(id, code)).await {
        debug!("exec session {} could not report exit: {}", id, e);
    }
}
