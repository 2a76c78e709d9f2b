/// The build → launch → wait → rebuild loop.
///
/// A [`Supervisor`] owns at most one running program.  Every reload stops and
/// reaps the current program before the build starts, so two copies never run
/// side by side (and never fight over a window, port or serial device).
///
/// All work happens on the caller's task: while a build or a stop is in
/// progress no further trigger is looked at.
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

use crate::builder::{BuildCommand, BuildError};
use crate::config::{Config, DEFAULT_STOP_TIMEOUT_SECS};
use crate::event::Trigger;
use crate::process::{self, ChildProcess, TerminateError, Termination};
use crate::status::{self, SupervisorState, SupervisorStatus};

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("previous program (pid {pid}) has not exited; not starting another")]
    StillRunning { pid: u32 },
}

pub struct Supervisor {
    build: BuildCommand,
    run_command: Vec<String>,
    working_dir: Option<PathBuf>,
    stop_timeout: Duration,
    child: Option<ChildProcess>,
    status: SupervisorStatus,
    status_path: Option<PathBuf>,
}

impl Supervisor {
    pub fn new(build: BuildCommand, run_command: Vec<String>) -> Self {
        Self {
            build,
            run_command,
            working_dir: None,
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
            child: None,
            status: SupervisorStatus::new(),
            status_path: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut supervisor = Self::new(
            BuildCommand::new(config.build.command.clone(), None),
            config.run.command.clone(),
        )
        .with_stop_timeout(config.run.stop_timeout());
        if let Some(dir) = &config.working_dir {
            supervisor = supervisor.with_working_dir(dir.clone());
        }
        if let Some(path) = &config.status_file {
            supervisor = supervisor.with_status_file(config.resolve(path));
        }
        supervisor
    }

    /// Directory both the build command and the program run in.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.build = self.build.with_dir(dir.clone());
        self.working_dir = Some(dir);
        self
    }

    /// Grace period between SIGTERM and SIGKILL.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_status_file(mut self, path: PathBuf) -> Self {
        self.status_path = Some(path);
        self
    }

    /// PID of the running program, if one is running.
    pub fn child_pid(&self) -> Option<u32> {
        self.child.as_ref().map(ChildProcess::pid)
    }

    pub fn status(&self) -> &SupervisorStatus {
        &self.status
    }

    /// Builds the program and, if the build succeeds, launches it.
    ///
    /// A program that is already running is stopped first; if it cannot be
    /// reaped nothing new is launched.  On failure nothing new is running
    /// afterwards and the error has already been logged.
    pub async fn start(&mut self) -> Result<u32, StartError> {
        if self.child.is_some() {
            self.stop().await;
        }
        self.ensure_stopped()?;

        self.set_state(SupervisorState::Building);
        if !self.build.is_noop() {
            info!("Compiling...");
        }
        match self.build.run().await {
            Ok(elapsed) => {
                info!("Build succeeded in {:.1}s", elapsed.as_secs_f64());
                self.status.record_build(true);
            }
            Err(e) => {
                error!("Build failed: {e}");
                self.status.record_build(false);
                self.status.error = Some(e.to_string());
                self.set_state(SupervisorState::Idle);
                return Err(e.into());
            }
        }

        let program = self.run_command.first().cloned().unwrap_or_default();
        match process::spawn(&self.run_command, self.working_dir.as_deref()) {
            Ok(child) => {
                let pid = child.pid();
                info!(pid, "Launched {program}");
                self.child = Some(child);
                self.status.pid = Some(pid);
                self.status.error = None;
                self.set_state(SupervisorState::Running);
                Ok(pid)
            }
            Err(source) => {
                error!("Failed to launch {program}: {source}");
                self.status.error = Some(format!("Failed to launch {program}: {source}"));
                self.set_state(SupervisorState::Idle);
                Err(StartError::Spawn { program, source })
            }
        }
    }

    /// Stops the running program and waits until it has been reaped.
    ///
    /// Does nothing when no program is running.  Stop failures are logged and
    /// otherwise ignored.  A program that survived SIGKILL keeps its handle, so
    /// the next stop retries and [`start`](Self::start) refuses to launch.
    pub async fn stop(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let pid = child.pid();
        let result = child.terminate(self.stop_timeout).await;
        match result {
            Ok(outcome) => {
                let status = outcome.status();
                match outcome {
                    Termination::AlreadyExited(_) => info!(pid, "Program had already exited ({status})"),
                    Termination::Exited(_) => info!(pid, "Program stopped ({status})"),
                    Termination::Killed(_) => {
                        warn!(pid, "Program killed after ignoring SIGTERM ({status})")
                    }
                }
            }
            Err(e @ TerminateError::Unreaped { .. }) => {
                error!(pid, "Failed to stop program: {e}; it may still be running");
                self.status.error = Some(e.to_string());
                self.set_state(SupervisorState::Running);
                return;
            }
            Err(e) => error!(pid, "Failed to stop program: {e}"),
        }
        self.child = None;
        self.status.pid = None;
        self.set_state(SupervisorState::Idle);
    }

    /// Stops the running program (if any), rebuilds, and relaunches.
    pub async fn reload(&mut self) -> Result<u32, StartError> {
        self.status.reloads += 1;
        self.stop().await;
        self.start().await
    }

    /// Runs until a [`Trigger::Shutdown`] arrives or every sender is dropped.
    ///
    /// Builds and launches once up front, then handles one trigger at a time.
    /// The program is always stopped before this returns.
    pub async fn run(&mut self, triggers: &mut mpsc::Receiver<Trigger>) {
        // Failures are logged inside start(); keep listening so the operator
        // can fix the source and reload.
        let _ = self.start().await;

        if !drain_reloads(triggers) {
            while let Some(trigger) = triggers.recv().await {
                match trigger {
                    Trigger::Reload(source) => {
                        info!("Reloading ({source})");
                        let _ = self.reload().await;
                        if drain_reloads(triggers) {
                            break;
                        }
                    }
                    Trigger::Shutdown => break,
                }
            }
        }

        info!("Exiting");
        self.stop().await;
        self.set_state(SupervisorState::Stopped);
    }

    /// Refuses to launch while a previous program could not be reaped.
    fn ensure_stopped(&mut self) -> Result<(), StartError> {
        let Some(pid) = self.child_pid() else {
            return Ok(());
        };
        error!(pid, "Previous program has not exited; not starting another");
        self.status.error = Some(format!("process {pid} could not be stopped"));
        Err(StartError::StillRunning { pid })
    }

    fn set_state(&mut self, state: SupervisorState) {
        self.status.state = state;
        if let Some(path) = &self.status_path {
            status::write_status(path, &self.status);
        }
    }
}

/// Discards reload triggers that queued up while the supervisor was busy; one
/// rebuild already covers them.
///
/// Returns `true` if a shutdown was queued (or every sender is gone), in which
/// case the caller should exit.
fn drain_reloads(triggers: &mut mpsc::Receiver<Trigger>) -> bool {
    loop {
        match triggers.try_recv() {
            Ok(Trigger::Reload(source)) => debug!("Dropping queued reload ({source})"),
            Ok(Trigger::Shutdown) | Err(TryRecvError::Disconnected) => return true,
            Err(TryRecvError::Empty) => return false,
        }
    }
}
