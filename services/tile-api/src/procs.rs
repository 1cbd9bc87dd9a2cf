//! OS process inspection and termination helpers.
//!
//! The job manager never trusts a child handle alone: renderer processes
//! fork helpers, and an abort must take the whole tree down even when the
//! server that spawned it is gone. Everything here works from a fresh
//! process-table snapshot.

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tracing::{debug, warn};

/// Take a process-table snapshot with command lines.
pub fn snapshot() -> System {
    System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    )
}

/// Whether a pid is currently alive.
pub fn pid_alive(pid: u32) -> bool {
    snapshot().process(Pid::from_u32(pid)).is_some()
}

/// Pids whose full command line contains every needle.
pub fn pids_with_cmdline(sys: &System, needles: &[&str]) -> Vec<u32> {
    sys.processes()
        .iter()
        .filter(|(_, proc)| {
            let cmdline = proc.cmd().join(" ");
            !cmdline.is_empty() && needles.iter().all(|needle| cmdline.contains(needle))
        })
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// Transitive descendants of the given roots (roots excluded).
pub fn descendants_of(sys: &System, roots: &[u32]) -> Vec<u32> {
    let mut result: Vec<u32> = Vec::new();
    let mut frontier: Vec<u32> = roots.to_vec();
    while let Some(parent) = frontier.pop() {
        for (pid, proc) in sys.processes() {
            if proc.parent().map(|p| p.as_u32()) == Some(parent) {
                let child = pid.as_u32();
                if !result.contains(&child) && !roots.contains(&child) {
                    result.push(child);
                    frontier.push(child);
                }
            }
        }
    }
    result
}

/// Force-kill a set of pids. Best effort; missing pids are skipped.
pub fn kill_pids(sys: &System, pids: &[u32]) {
    for pid in pids {
        if let Some(proc) = sys.process(Pid::from_u32(*pid)) {
            if proc.kill() {
                debug!(pid, "Killed process");
            } else {
                warn!(pid, "Kill signal not delivered");
            }
        }
    }
}

/// Send the platform's terminate signal to a child's process group so the
/// renderer and its direct helpers get a chance to exit cleanly.
#[cfg(unix)]
pub fn terminate_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid as NixPid;

    if let Err(e) = killpg(NixPid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, error = %e, "killpg failed, falling back to single-process TERM");
        let _ = nix::sys::signal::kill(NixPid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
pub fn terminate_group(pid: u32) {
    let sys = snapshot();
    if let Some(proc) = sys.process(Pid::from_u32(pid)) {
        proc.kill();
    }
}

/// RSS of this process in bytes.
pub fn own_rss_bytes() -> u64 {
    let mut sys = System::new();
    if let Ok(pid) = sysinfo::get_current_pid() {
        sys.refresh_process(pid);
        if let Some(proc) = sys.process(pid) {
            return proc.memory();
        }
    }
    0
}

/// Total system memory in bytes.
pub fn total_memory_bytes() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_pid_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn test_bogus_pid_dead() {
        // Max pid space on Linux defaults to well below this.
        assert!(!pid_alive(u32::MAX - 7));
    }

    #[test]
    fn test_total_memory_nonzero() {
        assert!(total_memory_bytes() > 0);
    }
}
