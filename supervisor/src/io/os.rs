//! OS process primitives shared by the process handle, reaper and sampler.
//!
//! Process enumeration goes through `sysinfo` on every platform. Signals use
//! `kill(2)` on unix; elsewhere `sysinfo` delivers a terminate request when the
//! platform supports one and falls back to a hard kill.

use std::collections::{HashMap, VecDeque};

use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, RefreshKind, System};
use tracing::{debug, warn};

/// PIDs that are never signalled.
const PROTECTED_PIDS: [u32; 2] = [0, 1];

pub fn is_protected(pid: u32) -> bool {
    PROTECTED_PIDS.contains(&pid)
}

fn process_table() -> System {
    let mut system = System::new_with_specifics(RefreshKind::nothing());
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());
    system
}

/// All descendants of `root`, deepest first.
pub fn descendants(root: u32) -> Vec<u32> {
    let system = process_table();
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }
    for list in children.values_mut() {
        list.sort_unstable();
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if child == root || found.contains(&child) {
                continue;
            }
            found.push(child);
            queue.push_back(child);
        }
    }
    // BFS yields parents before children.
    found.reverse();
    debug!(root, count = found.len(), "enumerated descendants");
    found
}

/// Whether `pid` exists and is not a zombie.
pub fn pid_alive(pid: u32) -> bool {
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new_with_specifics(RefreshKind::nothing());
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system
        .process(target)
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}

/// Ask `pid` to exit. Returns `false` when it was already gone.
pub fn terminate_pid(pid: u32) -> bool {
    if is_protected(pid) {
        warn!(pid, "refusing to signal protected pid");
        return false;
    }
    signal_terminate(pid)
}

/// Force `pid` to exit. Returns `false` when it was already gone.
pub fn kill_pid(pid: u32) -> bool {
    if is_protected(pid) {
        warn!(pid, "refusing to signal protected pid");
        return false;
    }
    signal_kill(pid)
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> bool {
    send_unix(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
fn signal_kill(pid: u32) -> bool {
    send_unix(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send_unix(pid: u32, sig: nix::sys::signal::Signal) -> bool {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match nix::sys::signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) => {
            debug!(pid, signal = ?sig, "signal sent");
            true
        }
        Err(Errno::ESRCH) => {
            debug!(pid, signal = ?sig, "process already gone");
            false
        }
        Err(err) => {
            warn!(pid, signal = ?sig, err = %err, "failed to signal process");
            false
        }
    }
}

/// Kill every member of the process group led by `pgid`.
#[cfg(unix)]
pub fn kill_group(pgid: u32) -> bool {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    if is_protected(pgid) {
        return false;
    }
    let Ok(raw) = i32::try_from(pgid) else {
        return false;
    };
    match nix::sys::signal::killpg(Pid::from_raw(raw), nix::sys::signal::Signal::SIGKILL) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            warn!(pgid, err = %err, "failed to kill process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_terminate(pid: u32) -> bool {
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new_with_specifics(RefreshKind::nothing());
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    match system.process(target) {
        Some(process) => process
            .kill_with(sysinfo::Signal::Term)
            .unwrap_or_else(|| process.kill()),
        None => false,
    }
}

#[cfg(not(unix))]
fn signal_kill(pid: u32) -> bool {
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new_with_specifics(RefreshKind::nothing());
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system.process(target).is_some_and(|process| process.kill())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn finds_grandchildren() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & wait")
            .spawn()
            .expect("spawn");
        thread::sleep(Duration::from_millis(300));

        let found = descendants(child.id());
        assert!(!found.is_empty(), "expected the sleep grandchild");

        for pid in &found {
            kill_pid(*pid);
        }
        kill_pid(child.id());
        let _ = child.wait();
    }

    #[test]
    fn protected_pids_are_never_signalled() {
        assert!(!terminate_pid(0));
        assert!(!kill_pid(1));
    }

    #[test]
    fn exited_pid_is_not_alive() {
        let mut child = Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(!pid_alive(pid));
    }
}
