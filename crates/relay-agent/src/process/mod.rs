//! Process supervision primitives.

mod main_process;
mod ring_buffer;
mod signal;

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

pub use main_process::{
    MainProcess, OutputEvent, SUBSCRIBER_CAPACITY, SubscriberKey, Subscription,
};
pub use ring_buffer::{RING_BUFFER_SIZE, RingBuffer};
pub use signal::{Signal, send_signal, signal_process_group};

/// Largest chunk read from a child pipe or PTY in one call.
pub const READ_CHUNK_SIZE: usize = 32 * 1024;

/// How long output readers may keep draining after the child exited.
///
/// A grandchild holding the pipe open would otherwise stall the exit
/// notification forever.
pub const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Exit code reported for a finished wait.
///
/// A normal exit reports its status, a signal death reports `128 + signal`
/// and a failed wait reports 1.
pub fn exit_code(result: io::Result<ExitStatus>) -> i32 {
    match result {
        Ok(status) => status_code(status),
        Err(_) => 1,
    }
}

pub fn status_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        1
    }
}

/// Split `KEY=VALUE` strings into pairs. Entries without `=` are skipped.
pub fn parse_env(env: &[String]) -> Vec<(String, String)> {
    env.iter()
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_policy() {
        assert_eq!(exit_code(Ok(ExitStatus::from_raw(0))), 0);
        // Raw wait status: exit code lives in the high byte.
        assert_eq!(exit_code(Ok(ExitStatus::from_raw(7 << 8))), 7);
        assert_eq!(exit_code(Ok(ExitStatus::from_raw(libc::SIGTERM))), 143);
        assert_eq!(exit_code(Err(io::Error::other("wait failed"))), 1);
    }

    #[test]
    fn parse_env_splits_on_first_equals() {
        let env = vec![
            "FOO=bar".to_string(),
            "EMPTY=".to_string(),
            "URL=a=b".to_string(),
            "NOEQUALS".to_string(),
            "=nokey".to_string(),
        ];
        assert_eq!(
            parse_env(&env),
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("EMPTY".to_string(), String::new()),
                ("URL".to_string(), "a=b".to_string()),
            ]
        );
    }
}
