use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build command exited with {0}")]
    Failed(ExitStatus),
    #[error("failed to run build command: {0}")]
    Spawn(#[source] io::Error),
}

/// The compile step, run through the platform shell exactly as written.
///
/// Compiler output goes straight to the supervisor's terminal; only the exit
/// status is inspected.
#[derive(Debug, Clone)]
pub struct BuildCommand {
    command: String,
    dir: Option<PathBuf>,
}

impl BuildCommand {
    pub fn new(command: impl Into<String>, dir: Option<PathBuf>) -> Self {
        Self {
            command: command.into(),
            dir,
        }
    }

    /// Runs the command in `dir` instead of the inherited directory.
    pub fn with_dir(mut self, dir: PathBuf) -> Self {
        self.dir = Some(dir);
        self
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// True when there is nothing to run and every build trivially succeeds.
    pub fn is_noop(&self) -> bool {
        self.command.trim().is_empty()
    }

    /// Runs the command to completion and returns how long it took.
    pub async fn run(&self) -> Result<Duration, BuildError> {
        if self.is_noop() {
            return Ok(Duration::ZERO);
        }

        let started = Instant::now();
        let mut command = shell(&self.command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }

        debug!(command = %self.command, "Running build command");
        let status = command.status().await.map_err(BuildError::Spawn)?;
        if status.success() {
            Ok(started.elapsed())
        } else {
            Err(BuildError::Failed(status))
        }
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
