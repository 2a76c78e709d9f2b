use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hotkey::Hotkey;

pub const DEFAULT_CONFIG_FILE: &str = "reloader.toml";
/// Compiles the desktop simulator with its SDL2 renderer.
pub const DEFAULT_BUILD_COMMAND: &str = "g++ -std=c++11 \
     desktop/main.cpp \
     desktop/sdl_renderer.cpp \
     desktop/desktop_stubs.cpp \
     main/pages/home/home_page.cpp \
     main/pages/files/files_page.cpp \
     -I./desktop -I./main \
     -lSDL2 -o soil_sim";
pub const DEFAULT_RUN_PROGRAM: &str = "./soil_sim";
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
pub const DEFAULT_HOTKEY: &str = "Alt+Shift+T";

/// Root configuration structure, deserialized from `reloader.toml`.
///
/// Read once at startup; changes to the file take effect on the next launch.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Directory the build and run commands execute in. Relative paths
    /// elsewhere in the config are resolved against it.
    pub working_dir: Option<PathBuf>,
    /// Where to write the machine-readable status document, if anywhere.
    pub status_file: Option<PathBuf>,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub triggers: TriggerConfig,
}

#[derive(Debug, Deserialize)]
pub struct BuildConfig {
    /// Shell command line; an empty string skips the build step.
    #[serde(default = "default_build_command")]
    pub command: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: default_build_command(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RunConfig {
    /// Program followed by its arguments. Not passed through a shell.
    #[serde(default = "default_run_command")]
    pub command: Vec<String>,
    /// Grace period between SIGTERM and SIGKILL when stopping the program.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            command: default_run_command(),
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
        }
    }
}

impl RunConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct TriggerConfig {
    /// Reload key combination, e.g. "Alt+Shift+T". Empty disables it.
    #[serde(default = "default_hotkey")]
    pub hotkey: Option<String>,
    /// Paths whose changes trigger a reload. Watched recursively.
    #[serde(default)]
    pub watch: Vec<PathBuf>,
    /// Paths under `watch` whose changes are ignored.
    #[serde(default)]
    pub ignore: Vec<PathBuf>,
    /// Quiet period used to coalesce bursts of file events.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            hotkey: default_hotkey(),
            watch: Vec::new(),
            ignore: Vec::new(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl TriggerConfig {
    /// Returns the configured hotkey, treating a blank string as disabled.
    pub fn effective_hotkey(&self) -> Option<&str> {
        self.hotkey.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Config {
    /// Resolves `path` against `working_dir` unless it is already absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Location of the built artifact, when the run program is given as a path.
    ///
    /// A bare program name (looked up on `PATH`) has no artifact to ignore.
    pub fn artifact_path(&self) -> Option<PathBuf> {
        let program = Path::new(self.run.command.first()?);
        if program.components().count() > 1 {
            Some(self.resolve(program))
        } else {
            None
        }
    }

    /// Paths excluded from file watching: the configured ignores plus the artifact.
    pub fn ignored_paths(&self) -> Vec<PathBuf> {
        let mut ignored: Vec<PathBuf> =
            self.triggers.ignore.iter().map(|p| self.resolve(p)).collect();
        ignored.extend(self.artifact_path());
        ignored
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.triggers.watch.iter().map(|p| self.resolve(p)).collect()
    }

    /// Rejects configurations the supervisor cannot act on.
    pub fn validate(&self) -> Result<()> {
        match self.run.command.first() {
            None => bail!("run.command must name a program to launch"),
            Some(program) if program.trim().is_empty() => {
                bail!("run.command must name a program to launch")
            }
            Some(_) => {}
        }
        if self.run.stop_timeout_secs == 0 {
            bail!("run.stop_timeout_secs must be at least 1");
        }
        if let Some(combo) = self.triggers.effective_hotkey() {
            Hotkey::parse(combo).with_context(|| format!("Invalid triggers.hotkey {combo:?}"))?;
        }
        Ok(())
    }
}

/// Loads and validates the config file at `path`, returning `Config::default()`
/// if the file does not exist.
/// Returns an error if the file exists but cannot be read, parsed or validated.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

fn default_build_command() -> String {
    DEFAULT_BUILD_COMMAND.to_string()
}

fn default_run_command() -> Vec<String> {
    vec![DEFAULT_RUN_PROGRAM.to_string()]
}

fn default_stop_timeout() -> u64 {
    DEFAULT_STOP_TIMEOUT_SECS
}

fn default_hotkey() -> Option<String> {
    Some(DEFAULT_HOTKEY.to_string())
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn default_config_reproduces_simulator_setup() {
        let c = Config::default();
        assert!(c.build.command.starts_with("g++ -std=c++11 "));
        assert!(c.build.command.ends_with("-lSDL2 -o soil_sim"));
        assert_eq!(c.run.command, vec![DEFAULT_RUN_PROGRAM.to_string()]);
        assert_eq!(c.run.stop_timeout_secs, DEFAULT_STOP_TIMEOUT_SECS);
        assert_eq!(c.triggers.debounce_ms, DEFAULT_DEBOUNCE_MS);
        assert!(c.triggers.watch.is_empty());
        assert!(c.working_dir.is_none());
        assert!(c.status_file.is_none());
    }

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn default_build_command_lists_every_translation_unit() {
        for unit in [
            "desktop/main.cpp",
            "desktop/sdl_renderer.cpp",
            "desktop/desktop_stubs.cpp",
            "main/pages/home/home_page.cpp",
            "main/pages/files/files_page.cpp",
        ] {
            assert!(DEFAULT_BUILD_COMMAND.contains(unit), "missing {unit}");
        }
    }

    // ── load_or_default ───────────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let config = load_or_default(&path).unwrap();
        assert_eq!(config.build.command, DEFAULT_BUILD_COMMAND);
        assert_eq!(config.run.command, vec![DEFAULT_RUN_PROGRAM.to_string()]);
    }

    #[test]
    fn load_or_default_parses_valid_toml() {
        let (_dir, path) = write_config(
            r#"
working_dir = "/tmp/project"
status_file = "status.toml"

[build]
command = "make sim"

[run]
command = ["./build/sim", "--windowed"]
stop_timeout_secs = 2

[triggers]
hotkey = ""
watch = ["src", "include"]
ignore = ["src/generated"]
debounce_ms = 150
"#,
        );

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp/project")));
        assert_eq!(config.status_file, Some(PathBuf::from("status.toml")));
        assert_eq!(config.build.command, "make sim");
        assert_eq!(config.run.command, vec!["./build/sim", "--windowed"]);
        assert_eq!(config.run.stop_timeout(), Duration::from_secs(2));
        assert_eq!(config.triggers.effective_hotkey(), None);
        assert_eq!(
            config.triggers.watch,
            vec![PathBuf::from("src"), PathBuf::from("include")]
        );
        assert_eq!(config.triggers.debounce(), Duration::from_millis(150));
    }

    #[test]
    fn load_or_default_partial_toml_uses_field_defaults() {
        let (_dir, path) = write_config("[run]\ncommand = [\"./app\"]\n");

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.run.command, vec!["./app"]);
        assert_eq!(config.run.stop_timeout_secs, DEFAULT_STOP_TIMEOUT_SECS);
        assert_eq!(config.build.command, DEFAULT_BUILD_COMMAND);
        assert_eq!(config.triggers.hotkey.as_deref(), Some(DEFAULT_HOTKEY));
    }

    #[test]
    fn default_hotkey_is_alt_shift_t() {
        let config = Config::default();
        assert_eq!(config.triggers.effective_hotkey(), Some("Alt+Shift+T"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let (_dir, path) = write_config("this is not valid toml ][[[");
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn load_or_default_rejects_empty_run_command() {
        let (_dir, path) = write_config("[run]\ncommand = []\n");
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn load_or_default_rejects_zero_stop_timeout() {
        let (_dir, path) = write_config("[run]\nstop_timeout_secs = 0\n");
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn load_or_default_rejects_unparseable_hotkey() {
        let (_dir, path) = write_config("[triggers]\nhotkey = \"Alt+Shift+Banana\"\n");
        let err = load_or_default(&path).unwrap_err();
        assert!(format!("{err:#}").contains("triggers.hotkey"));
    }

    // ── path resolution ───────────────────────────────────────────────────────

    #[test]
    fn resolve_joins_relative_paths_onto_working_dir() {
        let config = Config {
            working_dir: Some(PathBuf::from("/work")),
            ..Config::default()
        };
        assert_eq!(config.resolve(Path::new("src")), PathBuf::from("/work/src"));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_leaves_absolute_paths_alone() {
        let config = Config {
            working_dir: Some(PathBuf::from("/work")),
            ..Config::default()
        };
        assert_eq!(config.resolve(Path::new("/etc")), PathBuf::from("/etc"));
    }

    #[test]
    fn resolve_without_working_dir_is_identity() {
        let config = Config::default();
        assert_eq!(config.resolve(Path::new("src")), PathBuf::from("src"));
    }

    #[test]
    fn artifact_is_always_ignored() {
        let mut config = Config {
            working_dir: Some(PathBuf::from("/work")),
            ..Config::default()
        };
        config.triggers.ignore = vec![PathBuf::from("build")];
        assert_eq!(
            config.ignored_paths(),
            vec![PathBuf::from("/work/build"), PathBuf::from("/work/./soil_sim")]
        );
    }

    #[test]
    fn bare_program_name_has_no_artifact() {
        let mut config = Config::default();
        config.run.command = vec!["sleep".to_string(), "30".to_string()];
        assert_eq!(config.artifact_path(), None);
    }
}
