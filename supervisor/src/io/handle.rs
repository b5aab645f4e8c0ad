//! Process-handle capability used by the registry, reaper and sampler.
//!
//! [`ProcessHandle`] decouples supervision from `std::process::Child` so tests
//! can use scripted handles without spawning anything.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::io::os;

const WAIT_POLL: Duration = Duration::from_millis(50);

/// OS-level control over one launched process.
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    fn pid(&self) -> u32;

    /// Whether the process is still running. Exited or zombie processes are not.
    fn is_alive(&self) -> bool;

    /// Exit code once the process has exited (`None` while running or when killed by a signal).
    fn exit_code(&self) -> Option<i32>;

    /// Send a graceful terminate request. Already-exited processes are a no-op.
    fn terminate(&self);

    /// Force the process to exit. Already-exited processes are a no-op.
    fn kill(&self);

    /// Wait up to `timeout` for exit. Returns `true` once the process has exited.
    fn wait(&self, timeout: Duration) -> bool;

    /// Descendant PIDs, deepest first.
    fn children(&self) -> Vec<u32>;

    /// Process group to sweep after the tree walk, where the platform has one.
    fn process_group(&self) -> Option<u32> {
        None
    }
}

/// What to run for one launch attempt.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Interpreter argv prefix; the entry path is appended.
    pub program: Vec<String>,
    pub entry_path: PathBuf,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// A hosted script started by this supervisor.
pub struct OsProcess {
    pid: u32,
    child: Mutex<Child>,
    group_leader: bool,
}

impl fmt::Debug for OsProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsProcess")
            .field("pid", &self.pid)
            .field("group_leader", &self.group_leader)
            .finish()
    }
}

impl OsProcess {
    /// Spawn the hosted script with stdout and stderr redirected to `log`.
    ///
    /// On unix the script leads a new process group.
    pub fn spawn(request: &SpawnRequest, log: &File) -> std::io::Result<Self> {
        let (program, args) = request.program.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty runtime command")
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&request.entry_path)
            .current_dir(&request.work_dir)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log.try_clone()?));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn()?;
        let pid = child.id();
        debug!(pid, entry = %request.entry_path.display(), "hosted script spawned");
        Ok(Self {
            pid,
            child: Mutex::new(child),
            group_leader: cfg!(unix),
        })
    }

    fn try_exit(&self) -> Option<std::process::ExitStatus> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.try_wait() {
            Ok(status) => status,
            Err(err) => {
                warn!(pid = self.pid, err = %err, "try_wait failed; assuming still running");
                None
            }
        }
    }
}

impl ProcessHandle for OsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.try_exit().is_none()
    }

    fn exit_code(&self) -> Option<i32> {
        self.try_exit().and_then(|status| status.code())
    }

    fn terminate(&self) {
        if self.is_alive() {
            os::terminate_pid(self.pid);
        }
    }

    fn kill(&self) {
        if !self.is_alive() {
            return;
        }
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = child.kill() {
            debug!(pid = self.pid, err = %err, "kill after exit");
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(WAIT_POLL.min(deadline - now));
        }
    }

    fn children(&self) -> Vec<u32> {
        os::descendants(self.pid)
    }

    fn process_group(&self) -> Option<u32> {
        self.group_leader.then_some(self.pid)
    }
}

/// Build the environment for a hosted script: the tenant secret plus unbuffered output.
pub fn script_env(secret_env: &str, secret: Option<&str>) -> Vec<(String, String)> {
    let mut env = vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())];
    if let Some(secret) = secret.filter(|s| !s.is_empty()) {
        env.push((secret_env.to_string(), secret.to_string()));
    }
    env
}

/// Resolve `entry` under `work_dir` to an absolute path when it exists.
pub fn resolve_entry(work_dir: &Path, entry: &str) -> Result<Option<PathBuf>> {
    let candidate = work_dir.join(entry);
    if !candidate.is_file() {
        return Ok(None);
    }
    let absolute = candidate
        .canonicalize()
        .with_context(|| format!("canonicalize {}", candidate.display()))?;
    Ok(Some(absolute))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::logs::{open_truncated, read_tail};

    fn sh_request(dir: &Path, script: &str) -> SpawnRequest {
        let entry = dir.join("main.sh");
        std::fs::write(&entry, script).expect("write script");
        SpawnRequest {
            program: vec!["sh".to_string()],
            entry_path: entry,
            work_dir: dir.to_path_buf(),
            env: script_env("BOT_TOKEN", Some("s3cret")),
        }
    }

    #[test]
    fn output_goes_to_log_and_env_is_passed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("out.log");
        let log = open_truncated(&log_path).expect("log");
        let process = OsProcess::spawn(&sh_request(temp.path(), "echo token=$BOT_TOKEN; exit 4"), &log)
            .expect("spawn");

        assert!(process.wait(Duration::from_secs(5)));
        assert!(!process.is_alive());
        assert_eq!(process.exit_code(), Some(4));
        assert!(read_tail(&log_path, 100).expect("tail").contains("token=s3cret"));
    }

    #[test]
    fn kill_stops_a_running_process() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = open_truncated(&temp.path().join("out.log")).expect("log");
        let process = OsProcess::spawn(&sh_request(temp.path(), "sleep 30"), &log).expect("spawn");

        assert!(process.is_alive());
        assert!(!process.wait(Duration::from_millis(100)));
        process.kill();
        assert!(process.wait(Duration::from_secs(5)));
        process.kill();
        process.terminate();
    }

    #[test]
    fn empty_command_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = open_truncated(&temp.path().join("out.log")).expect("log");
        let mut request = sh_request(temp.path(), "true");
        request.program.clear();
        assert!(OsProcess::spawn(&request, &log).is_err());
    }

    #[test]
    fn missing_entry_resolves_to_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(resolve_entry(temp.path(), "nope.py").expect("resolve").is_none());
    }
}
