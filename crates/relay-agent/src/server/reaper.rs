//! Zombie reaping for when the agent runs as PID 1.

use log::{debug, warn};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;

/// True when this process is the container's init.
pub fn is_init_process() -> bool {
    std::process::id() == 1
}

/// Collect every exited child without blocking. Returns how many were reaped.
pub fn reap_zombies() -> usize {
    let mut reaped = 0;
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: waitpid with WNOHANG only writes to `status`, which is a
        // valid local.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            return reaped;
        }
        debug!("reaped orphan pid {}", pid);
        reaped += 1;
    }
}

/// Reap on every SIGCHLD until the runtime shuts down.
pub fn spawn_reaper() -> std::io::Result<JoinHandle<()>> {
    let mut sigchld = signal(SignalKind::child())?;
    Ok(tokio::spawn(async move {
        while sigchld.recv().await.is_some() {
            reap_zombies();
        }
        warn!("SIGCHLD stream ended; zombie reaping stopped");
    }))
}
