use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use reloader::config::{self, DEFAULT_CONFIG_FILE};
use reloader::event::Trigger;
use reloader::hotkey::{self, Hotkey};
use reloader::supervisor::Supervisor;
use reloader::{logging, signals, watch};

/// Rebuilds and relaunches a native program on a global hotkey or source change.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file; built-in defaults are used if it does not exist.
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Emit log lines as JSON.
    #[arg(long)]
    log_json: bool,
}

// One control thread: builds, stops and launches all happen in order on it.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_json);

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = config::load_or_default(&args.config)?;
    if !args.config.exists() {
        info!("{} not found, using built-in defaults", args.config.display());
    }

    let (trigger_tx, mut trigger_rx) = mpsc::channel::<Trigger>(32);

    // ── Trigger sources ───────────────────────────────────────────────────────
    // Any of these failing means the operator could not drive the supervisor,
    // so setup errors end the program before anything is built.
    signals::spawn(trigger_tx.clone())?;

    let hotkey_handle = match config.triggers.effective_hotkey() {
        Some(combo) => {
            let binding =
                Hotkey::parse(combo).with_context(|| format!("Invalid hotkey {combo:?}"))?;
            let handle = hotkey::start(binding, trigger_tx.clone())
                .with_context(|| {
                    format!(
                        "Failed to register reload hotkey {binding} \
                         (set triggers.hotkey = \"\" to run without one)"
                    )
                })?;
            info!("Press {binding} to rebuild and relaunch");
            Some(handle)
        }
        None => None,
    };

    let watch_task = if config.triggers.watch.is_empty() {
        None
    } else {
        Some(watch::start(
            &config.watched_paths(),
            &config.ignored_paths(),
            config.triggers.debounce(),
            trigger_tx.clone(),
        )?)
    };

    if hotkey_handle.is_none() && watch_task.is_none() {
        #[cfg(unix)]
        info!(
            "No hotkey or watch paths configured; send SIGUSR1 to pid {} to reload",
            std::process::id()
        );
        #[cfg(not(unix))]
        tracing::warn!("No hotkey or watch paths configured; the program can only be stopped");
    }

    // Only the trigger sources hold senders from here on.
    drop(trigger_tx);

    info!("reloader v{} started", env!("CARGO_PKG_VERSION"));

    // ── Supervisor loop ───────────────────────────────────────────────────────
    let mut supervisor = Supervisor::from_config(&config);
    supervisor.run(&mut trigger_rx).await;

    if let Some(task) = watch_task {
        task.abort();
    }
    if let Some(handle) = hotkey_handle {
        handle.stop();
    }
    Ok(())
}
