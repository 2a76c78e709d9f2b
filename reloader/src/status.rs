use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Current lifecycle state of the supervised program.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// No program is running (not yet built, or the last build failed).
    Idle,
    /// The build command is running.
    Building,
    /// The program is running.
    Running,
    /// The supervisor has shut down.
    Stopped,
}

/// Runtime status written to the configured `status_file` on every transition,
/// for editors and scripts that want to show what the supervisor is doing.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SupervisorStatus {
    /// Supervisor binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: SupervisorState,
    /// PID of the running program, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Number of reloads handled since startup.
    pub reloads: u64,
    /// RFC 3339 timestamp of the most recent build attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build_succeeded: Option<bool>,
    /// Human-readable description of the most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SupervisorStatus {
    /// Constructs the initial idle status on startup.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: SupervisorState::Idle,
            pid: None,
            reloads: 0,
            last_build_at: None,
            last_build_succeeded: None,
            error: None,
        }
    }

    /// Records the outcome of a build attempt, stamped with the current local time.
    pub fn record_build(&mut self, succeeded: bool) {
        self.last_build_at = Some(chrono::Local::now().to_rfc3339());
        self.last_build_succeeded = Some(succeeded);
    }
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged; a status write never stops the supervisor.
pub fn write_status(path: &Path, status: &SupervisorStatus) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Failed to create status directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!("Failed to write status file {}: {e}", path.display());
            }
        }
        Err(e) => warn!("Failed to serialize status: {e}"),
    }
}
