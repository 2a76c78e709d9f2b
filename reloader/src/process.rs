//! Spawning and stopping the launched program.
//!
//! On Unix the program is started as the leader of a fresh session (`setsid`),
//! so signals reach everything it spawns and a Ctrl+C typed at the supervisor's
//! terminal is not delivered to it directly.  On Linux the kernel also sends it
//! SIGTERM if the supervisor dies without cleaning up (`PR_SET_PDEATHSIG`).
//!
//! Stopping sends SIGTERM to the process group, waits for a grace period, then
//! escalates to SIGKILL.  The group is swept the same way after the leader has
//! been reaped, so members it backgrounded do not outlive a stop.  "No such process" and "permission denied" while
//! signalling are expected races with a program that is already exiting and are
//! not errors.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long to wait for the kernel to reap a SIGKILLed process group.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a leaderless process group is checked for remaining members.
#[cfg(unix)]
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How a [`ChildProcess::terminate`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The program had already exited before it was signalled.
    AlreadyExited(ExitStatus),
    /// The program exited within the grace period.
    Exited(ExitStatus),
    /// The program ignored the graceful signal and was killed.
    Killed(ExitStatus),
}

impl Termination {
    pub fn status(&self) -> ExitStatus {
        match *self {
            Termination::AlreadyExited(s) | Termination::Exited(s) | Termination::Killed(s) => s,
        }
    }
}

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("failed to wait for process {pid}: {source}")]
    Wait { pid: u32, source: io::Error },
    #[error("process {pid} did not exit within {timeout:?} of SIGKILL")]
    Unreaped { pid: u32, timeout: Duration },
}

/// A launched program.  Dropping it kills the process.
#[derive(Debug)]
pub struct ChildProcess {
    pid: u32,
    child: Child,
}

/// Launches `argv[0]` with the remaining elements as arguments.
///
/// stdin is closed; stdout and stderr are shared with the supervisor so the
/// program's output appears in the same terminal.
pub fn spawn(argv: &[String], dir: Option<&Path>) -> io::Result<ChildProcess> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty run command"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }

    #[cfg(unix)]
    unsafe {
        // Only async-signal-safe syscalls between fork and exec.
        command.pre_exec(|| {
            nix::unistd::setsid()?;
            #[cfg(target_os = "linux")]
            nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGTERM)?;
            Ok(())
        });
    }

    let child = command.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spawned child has no pid"))?;
    debug!(pid, program = %program, "Spawned process");
    Ok(ChildProcess { pid, child })
}

impl ChildProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Stops the process and reaps it.
    ///
    /// Returns only once the process has been waited on, so the caller may
    /// immediately start a replacement.  Whatever the program left running in
    /// its process group is stopped too, even when the leader itself had
    /// already exited.
    ///
    /// On [`TerminateError::Unreaped`] the handle is still live and the call
    /// may be retried.
    pub async fn terminate(&mut self, grace: Duration) -> Result<Termination, TerminateError> {
        let pid = self.pid;
        let outcome = match self.child.try_wait() {
            Ok(Some(status)) => Termination::AlreadyExited(status),
            Ok(None) => self.stop_leader(grace).await?,
            Err(source) => return Err(TerminateError::Wait { pid, source }),
        };
        #[cfg(unix)]
        clear_group(pid, grace).await;
        Ok(outcome)
    }

    async fn stop_leader(&mut self, grace: Duration) -> Result<Termination, TerminateError> {
        let pid = self.pid;
        if self.request_stop() {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => return Ok(Termination::Exited(status)),
                Ok(Err(source)) => return Err(TerminateError::Wait { pid, source }),
                Err(_) => warn!(pid, ?grace, "Process ignored SIGTERM, sending SIGKILL"),
            }
        }

        self.force_kill();
        match tokio::time::timeout(KILL_REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => Ok(Termination::Killed(status)),
            Ok(Err(source)) => Err(TerminateError::Wait { pid, source }),
            Err(_) => Err(TerminateError::Unreaped {
                pid,
                timeout: KILL_REAP_TIMEOUT,
            }),
        }
    }

    /// Sends SIGTERM to the process group.  Returns `false` if the signal could
    /// not be delivered for an unexpected reason and the caller should kill instead.
    #[cfg(unix)]
    fn request_stop(&self) -> bool {
        signal_group(self.pid, nix::sys::signal::Signal::SIGTERM)
    }

    /// Windows has no graceful signal for console-less programs; go straight to kill.
    #[cfg(not(unix))]
    fn request_stop(&self) -> bool {
        false
    }

    fn force_kill(&mut self) {
        #[cfg(unix)]
        signal_group(self.pid, nix::sys::signal::Signal::SIGKILL);
        // Covers a leader that left its group; harmless if already dead.
        if let Err(e) = self.child.start_kill() {
            debug!(pid = self.pid, "start_kill: {e}");
        }
    }
}

/// Stops what is left of the group led by `pid` after the leader was reaped:
/// SIGTERM, up to `grace` for the members to go, then SIGKILL.
///
/// Members that already exited but are not yet reaped by their new parent
/// still count, so an unreaped group costs the full grace period.
#[cfg(unix)]
async fn clear_group(pid: u32, grace: Duration) {
    if group_is_empty(pid) {
        return;
    }
    debug!(pid, "Leader gone, stopping the rest of its process group");
    signal_group(pid, nix::sys::signal::Signal::SIGTERM);

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if group_is_empty(pid) {
            return;
        }
        tokio::time::sleep(GROUP_POLL_INTERVAL).await;
    }
    warn!(pid, ?grace, "Process group outlived SIGTERM, sending SIGKILL");
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(unix)]
fn group_is_empty(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    matches!(
        nix::sys::signal::killpg(Pid::from_raw(pid as i32), None),
        Err(Errno::ESRCH)
    )
}

/// Delivers `signal` to the process group led by `pid`.
///
/// ESRCH (group already gone) and EPERM (group members exiting or recycled)
/// count as delivered.  Anything else is logged and reported as a failure.
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    match nix::sys::signal::killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => {
            debug!(pid, ?signal, "Signalled process group");
            true
        }
        Err(Errno::ESRCH) => {
            debug!(pid, ?signal, "Process group already exited");
            true
        }
        Err(Errno::EPERM) => {
            debug!(pid, ?signal, "Permission denied signalling process group (likely exiting)");
            true
        }
        Err(e) => {
            warn!(pid, ?signal, "Failed to signal process group: {e}");
            false
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    /// Checks the OS process table; zombies count as gone.
    fn is_running(pid: u32) -> bool {
        use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

        let mut sys = System::new();
        let pid = Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid)
            .is_some_and(|p| p.status() != ProcessStatus::Zombie)
    }

    /// SIGKILL is asynchronous; give the kernel a moment to finish the job.
    async fn wait_gone(pid: u32) -> bool {
        for _ in 0..40 {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// Runs `script` in a fresh directory and returns the pid it writes to
    /// `bg.pid`.
    async fn spawn_with_background(script: &str) -> (ChildProcess, u32, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let child = spawn(&argv(&["sh", "-c", script]), Some(dir.path())).unwrap();
        let pid_file = dir.path().join("bg.pid");
        let bg = loop {
            if let Some(pid) = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
            {
                break pid;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        (child, bg, dir)
    }

    #[tokio::test]
    async fn spawned_process_leads_its_own_group() {
        let mut child = spawn(&argv(&["sleep", "30"]), None).unwrap();
        let pid = nix::unistd::Pid::from_raw(child.pid() as i32);
        assert_eq!(nix::unistd::getpgid(Some(pid)).unwrap(), pid);
        assert_ne!(nix::unistd::getpgrp(), pid);
        child.terminate(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn terminate_reaps_a_cooperative_process() {
        let mut child = spawn(&argv(&["sleep", "30"]), None).unwrap();
        let pid = child.pid();
        let outcome = child.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, Termination::Exited(_)));
        assert!(!outcome.status().success());
        assert!(!is_running(pid));
    }

    #[tokio::test]
    async fn terminate_kills_a_process_that_ignores_sigterm() {
        let mut child = spawn(
            &argv(&["sh", "-c", "trap '' TERM; while :; do sleep 1; done"]),
            None,
        )
        .unwrap();
        let pid = child.pid();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = child.terminate(Duration::from_millis(300)).await.unwrap();
        assert!(matches!(outcome, Termination::Killed(_)));
        assert!(!is_running(pid));
    }

    #[tokio::test]
    async fn terminate_after_exit_is_not_an_error() {
        let mut child = spawn(&argv(&["true"]), None).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = child.terminate(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(outcome, Termination::AlreadyExited(s) if s.success()));
    }

    #[tokio::test]
    async fn terminate_stops_background_members_after_leader_exit() {
        let (mut child, bg, _dir) =
            spawn_with_background("sleep 30 & echo $! > bg.pid; exit 0").await;
        // Let the leader exit so the sweep starts from the already-exited path.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(is_running(bg));

        let outcome = child.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(outcome, Termination::AlreadyExited(s) if s.success()));
        assert!(wait_gone(bg).await, "group member {bg} outlived terminate()");
    }

    #[tokio::test]
    async fn terminate_kills_background_members_that_ignore_sigterm() {
        let (mut child, bg, _dir) = spawn_with_background(
            "(trap '' TERM; while :; do sleep 1; done) & echo $! > bg.pid; exec sleep 30",
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = child.terminate(Duration::from_millis(300)).await.unwrap();
        assert!(matches!(outcome, Termination::Exited(_)));
        assert!(wait_gone(bg).await, "group member {bg} outlived terminate()");
    }

    #[test]
    fn missing_group_is_empty() {
        assert!(group_is_empty(i32::MAX as u32));
    }

    #[test]
    fn signalling_a_missing_group_counts_as_delivered() {
        // Far above any pid_max the kernel allows.
        assert!(signal_group(i32::MAX as u32, nix::sys::signal::Signal::SIGTERM));
    }

    #[tokio::test]
    async fn spawn_missing_program_fails() {
        let err = spawn(&argv(&["/nonexistent/reloader-test-binary"]), None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn spawn_empty_argv_is_rejected() {
        let err = spawn(&[], None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn spawn_honours_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn(&argv(&["touch", "here"]), Some(dir.path())).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let outcome = child.terminate(Duration::from_secs(1)).await.unwrap();
        assert!(outcome.status().success());
        assert!(dir.path().join("here").exists());
    }
}
