//! Short-lived helper commands (package installers) with a timeout.
//!
//! Only the end of each output stream is kept: installer failures report their
//! cause last, and a chatty `pip` run must not grow memory without bound.

use std::collections::VecDeque;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Result of one helper run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperOutput {
    /// `None` when killed by a signal (including the timeout kill).
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout_tail: String,
    pub stderr_tail: String,
    /// Bytes dropped from the front of both streams.
    pub dropped_bytes: usize,
}

impl HelperOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Stderr tail, or the stdout tail when stderr is blank.
    pub fn failure_text(&self) -> &str {
        if self.stderr_tail.trim().is_empty() {
            &self.stdout_tail
        } else {
            &self.stderr_tail
        }
    }
}

type TailReader = JoinHandle<Result<(Vec<u8>, usize)>>;

/// Run `cmd` with null stdin, killing it after `timeout`.
///
/// Both pipes are drained on their own threads while the child runs, keeping
/// the last `tail_bytes` of each.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_helper(mut cmd: Command, timeout: Duration, tail_bytes: usize) -> Result<HelperOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().context("spawn helper")?;

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("helper stdout not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("helper stderr not piped"))?;
    let stdout_reader: TailReader = thread::spawn(move || keep_tail(stdout, tail_bytes));
    let stderr_reader: TailReader = thread::spawn(move || keep_tail(stderr, tail_bytes));

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for helper")? {
        Some(status) => (status, false),
        None => {
            warn!("helper timed out; killing");
            child.kill().context("kill helper")?;
            (child.wait().context("reap helper")?, true)
        }
    };

    let (stdout, dropped_out) = finish(stdout_reader).context("collect helper stdout")?;
    let (stderr, dropped_err) = finish(stderr_reader).context("collect helper stderr")?;
    debug!(exit_code = ?status.code(), timed_out, "helper finished");

    Ok(HelperOutput {
        exit_code: status.code(),
        timed_out,
        stdout_tail: String::from_utf8_lossy(&stdout).into_owned(),
        stderr_tail: String::from_utf8_lossy(&stderr).into_owned(),
        dropped_bytes: dropped_out + dropped_err,
    })
}

fn finish(reader: TailReader) -> Result<(Vec<u8>, usize)> {
    reader
        .join()
        .map_err(|_| anyhow!("pipe reader panicked"))?
}

/// Read `reader` to the end, keeping its last `limit` bytes and counting the rest.
fn keep_tail<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut tail: VecDeque<u8> = VecDeque::with_capacity(limit.min(64 * 1024));
    let mut dropped = 0usize;
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).context("read helper pipe")?;
        if n == 0 {
            break;
        }
        tail.extend(&chunk[..n]);
        let excess = tail.len().saturating_sub(limit);
        if excess > 0 {
            tail.drain(..excess);
            dropped += excess;
        }
    }
    Ok((tail.into(), dropped))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn failure_text_prefers_stderr() {
        let out = run_helper(
            sh("echo progress; echo 'No matching distribution' >&2; exit 1"),
            Duration::from_secs(5),
            1_000,
        )
        .expect("run");
        assert_eq!(out.exit_code, Some(1));
        assert!(!out.succeeded());
        assert_eq!(out.stdout_tail, "progress\n");
        assert_eq!(out.failure_text(), "No matching distribution\n");
    }

    #[test]
    fn falls_back_to_stdout_when_stderr_is_blank() {
        let out = run_helper(sh("echo 'npm ERR! 404'; exit 1"), Duration::from_secs(5), 1_000)
            .expect("run");
        assert_eq!(out.failure_text(), "npm ERR! 404\n");
    }

    #[test]
    fn keeps_only_the_end_of_long_output() {
        let out = run_helper(sh("printf 'abcdefghij'"), Duration::from_secs(5), 4).expect("run");
        assert!(out.succeeded());
        assert_eq!(out.stdout_tail, "ghij");
        assert_eq!(out.dropped_bytes, 6);
    }

    #[test]
    fn timeout_kills_the_helper() {
        let out = run_helper(sh("sleep 5"), Duration::from_millis(200), 100).expect("run");
        assert!(out.timed_out);
        assert!(!out.succeeded());
    }

    #[test]
    fn missing_program_is_an_error() {
        let err = run_helper(
            Command::new("definitely-not-a-real-program-xyz"),
            Duration::from_secs(1),
            100,
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn helper"));
    }
}
