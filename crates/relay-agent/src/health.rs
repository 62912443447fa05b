//! Periodic health probe for the supervised workload.
//!
//! The probe follows Docker `HEALTHCHECK` semantics: `["CMD-SHELL", s]`
//! runs `s` through `/bin/sh -c`, `["CMD", argv...]` execs argv directly,
//! `["NONE"]` disables checking and anything else is exec'd as-is.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use relay_protocol::{HealthLogEntry, HealthStatus};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::process::{exit_code, signal_process_group};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRIES: u32 = 3;

/// Number of probe results retained.
pub const HEALTH_LOG_LIMIT: usize = 5;

/// Maximum bytes of probe output kept per log entry.
pub const OUTPUT_LIMIT: usize = 4096;

pub const TIMEOUT_OUTPUT: &str = "health check timed out";

/// Probe definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthcheckConfig {
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub start_period: Duration,
    pub retries: u32,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            test: Vec::new(),
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            start_period: Duration::ZERO,
            retries: DEFAULT_RETRIES,
        }
    }
}

impl HealthcheckConfig {
    /// Replace zero interval, timeout and retries with the defaults.
    pub fn normalized(mut self) -> Self {
        if self.interval.is_zero() {
            self.interval = DEFAULT_INTERVAL;
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.retries == 0 {
            self.retries = DEFAULT_RETRIES;
        }
        self
    }

    /// True when no probe would ever run.
    pub fn is_disabled(&self) -> bool {
        probe_command(&self.test).is_none()
    }
}

/// Resolve a Docker-style test vector into program and arguments.
pub fn probe_command(test: &[String]) -> Option<(&str, &[String])> {
    let (kind, rest) = test.split_first()?;
    match kind.as_str() {
        "NONE" => None,
        "CMD-SHELL" => rest.first().map(|script| ("/bin/sh", std::slice::from_ref(script))),
        "CMD" => {
            let (program, args) = rest.split_first()?;
            Some((program.as_str(), args))
        }
        _ => Some((kind.as_str(), rest)),
    }
}

#[derive(Debug)]
struct HealthState {
    status: HealthStatus,
    failing_streak: u32,
    log: VecDeque<HealthLogEntry>,
}

/// Runs the probe on an interval and tracks the resulting status.
#[derive(Debug)]
pub struct HealthChecker {
    config: RwLock<HealthcheckConfig>,
    state: Mutex<HealthState>,
    status_tx: watch::Sender<HealthStatus>,
    stop: CancellationToken,
}

impl HealthChecker {
    pub fn new(config: HealthcheckConfig) -> Arc<Self> {
        let (status_tx, _) = watch::channel(HealthStatus::Starting);
        Arc::new(Self {
            config: RwLock::new(config.normalized()),
            state: Mutex::new(HealthState {
                status: HealthStatus::Starting,
                failing_streak: 0,
                log: VecDeque::with_capacity(HEALTH_LOG_LIMIT),
            }),
            status_tx,
            stop: CancellationToken::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> HealthcheckConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the probe command; the next check uses it.
    pub fn set_test(&self, test: Vec<String>) {
        debug!("health check test set to {:?}", test);
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .test = test;
    }

    pub fn status(&self) -> HealthStatus {
        self.state().status
    }

    pub fn failing_streak(&self) -> u32 {
        self.state().failing_streak
    }

    /// Retained probe results, oldest first.
    pub fn log(&self) -> Vec<HealthLogEntry> {
        self.state().log.iter().cloned().collect()
    }

    /// Receiver notified on every status transition.
    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.status_tx.subscribe()
    }

    /// Launch the periodic loop: wait out the start period, check once
    /// immediately, then once per interval until stopped.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let checker = self.clone();
        tokio::spawn(async move { checker.run().await })
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    async fn run(&self) {
        let HealthcheckConfig {
            interval,
            start_period,
            ..
        } = self.config();

        if !start_period.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(start_period) => {}
                _ = self.stop.cancelled() => return,
            }
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.check().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check().await,
                _ = self.stop.cancelled() => {
                    debug!("health checker stopped");
                    return;
                }
            }
        }
    }

    /// Run the probe once and record the result.
    pub async fn check(&self) {
        let config = self.config();
        let Some((program, args)) = probe_command(&config.test) else {
            return;
        };

        let start = Utc::now();
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.record(start, 1, e.to_string());
                return;
            }
        };

        let output = Arc::new(Mutex::new(Vec::new()));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = {
            let output = output.clone();
            async move {
                tokio::join!(
                    collect_output(stdout, output.clone()),
                    collect_output(stderr, output)
                );
            }
        };

        let finished = tokio::time::timeout(config.timeout, async {
            collect.await;
            child.wait().await
        })
        .await;

        match finished {
            Ok(result) => {
                let text = {
                    let output = output.lock().unwrap_or_else(PoisonError::into_inner);
                    String::from_utf8_lossy(&output).into_owned()
                };
                self.record(start, exit_code(result), text);
            }
            Err(_) => {
                if let Some(pid) = child.id() {
                    let _ = signal_process_group(pid, libc::SIGKILL);
                }
                let _ = child.kill().await;
                self.record(start, 1, TIMEOUT_OUTPUT.to_string());
            }
        }
    }

    pub(crate) fn record(&self, start: DateTime<Utc>, exit_code: i32, output: String) {
        let entry = HealthLogEntry {
            start,
            end: Utc::now(),
            exit_code,
            output: truncate_output(output, OUTPUT_LIMIT),
        };
        let retries = self.config().retries;

        let (status, streak) = {
            let mut state = self.state();
            state.log.push_back(entry);
            while state.log.len() > HEALTH_LOG_LIMIT {
                state.log.pop_front();
            }

            if exit_code == 0 {
                state.failing_streak = 0;
                state.status = HealthStatus::Healthy;
            } else {
                state.failing_streak += 1;
                if state.failing_streak >= retries {
                    state.status = HealthStatus::Unhealthy;
                }
            }
            (state.status, state.failing_streak)
        };

        debug!(
            "health check completed: status={} exit_code={} failing_streak={}",
            status, exit_code, streak
        );

        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!("health status changed to {}", status);
        }
    }
}

async fn collect_output<R>(reader: Option<R>, output: Arc<Mutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let mut output = output.lock().unwrap_or_else(PoisonError::into_inner);
                // Keep draining past the limit so the probe never blocks.
                let room = OUTPUT_LIMIT.saturating_sub(output.len());
                output.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
}

/// Cut `output` to at most `max` bytes on a char boundary.
pub fn truncate_output(mut output: String, max: usize) -> String {
    if output.len() > max {
        let mut end = max;
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        output.truncate(end);
    }
    output
}
