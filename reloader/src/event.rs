use std::fmt;
use std::path::PathBuf;

/// Events consumed by the supervisor's main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Stop the running program, rebuild it, and launch it again.
    Reload(ReloadSource),
    /// Ctrl+C or SIGTERM received; stop the program and exit.
    Shutdown,
}

/// What asked for a reload. Only used for log output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadSource {
    /// The global reload hotkey was pressed.
    Hotkey,
    /// A watched file was created, modified or removed.
    FileChange(PathBuf),
    /// SIGUSR1 received (Unix only).
    Signal,
}

impl fmt::Display for ReloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadSource::Hotkey => f.write_str("hotkey"),
            ReloadSource::FileChange(path) => write!(f, "change to {}", path.display()),
            ReloadSource::Signal => f.write_str("SIGUSR1"),
        }
    }
}
