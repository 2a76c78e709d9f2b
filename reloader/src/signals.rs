//! Process signals as supervisor triggers.
//!
//! - Ctrl+C (and SIGTERM on Unix) → [`Trigger::Shutdown`]
//! - SIGUSR1 (Unix) → [`Trigger::Reload`], for scripts and editors without the hotkey
use anyhow::Result;
use tokio::sync::mpsc;

use crate::event::Trigger;
#[cfg(unix)]
use crate::event::ReloadSource;

/// Registers the signal handlers and spawns the tasks that forward them to `tx`.
///
/// Registration happens before this returns, so a failure here is reported
/// instead of surfacing later as a signal that silently kills the process.
pub fn spawn(tx: mpsc::Sender<Trigger>) -> Result<()> {
    #[cfg(unix)]
    {
        use anyhow::Context;
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
        let mut usr1 =
            signal(SignalKind::user_defined1()).context("Failed to register SIGUSR1 handler")?;

        let shutdown_tx = tx.clone();
        tokio::spawn(async move {
            if term.recv().await.is_some() {
                let _ = shutdown_tx.send(Trigger::Shutdown).await;
            }
        });

        let reload_tx = tx.clone();
        tokio::spawn(async move {
            while usr1.recv().await.is_some() {
                if reload_tx
                    .send(Trigger::Reload(ReloadSource::Signal))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    // Graceful shutdown on Ctrl+C.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(Trigger::Shutdown).await;
        }
    });

    Ok(())
}
