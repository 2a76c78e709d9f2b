use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::{ReloadSource, Trigger};

/// Starts watching `paths` recursively and returns the task that forwards
/// changes to `tx` as reload triggers.
///
/// Each burst of file events (an editor save, a `git checkout`) produces one
/// trigger: after the first relevant event the task waits `debounce` and
/// discards whatever else arrived in the meantime.  Events that only touch
/// paths under `ignored` are dropped.
///
/// Fails if the watcher cannot be created or any path cannot be watched.
pub fn start(
    paths: &[PathBuf],
    ignored: &[PathBuf],
    debounce: Duration,
    tx: mpsc::Sender<Trigger>,
) -> Result<JoinHandle<()>> {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(64);

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let _ = watch_tx.blocking_send(event);
            }
            Err(e) => warn!("File watcher error: {e}"),
        },
        NotifyConfig::default(),
    )
    .context("Failed to create file watcher")?;

    for path in paths {
        let root = absolutize(path);
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        info!("Watching {} for changes", root.display());
    }
    let ignored: Vec<PathBuf> = ignored.iter().map(|p| absolutize(p)).collect();

    Ok(tokio::spawn(async move {
        // Dropping the watcher stops the OS-level watch.
        let _watcher = watcher;

        while let Some(event) = watch_rx.recv().await {
            let Some(path) = relevant_path(&event, &ignored) else {
                continue;
            };

            tokio::time::sleep(debounce).await;
            let mut coalesced = 0usize;
            while watch_rx.try_recv().is_ok() {
                coalesced += 1;
            }
            debug!(path = %path.display(), coalesced, "Source change detected");

            if tx
                .send(Trigger::Reload(ReloadSource::FileChange(path)))
                .await
                .is_err()
            {
                break;
            }
        }
    }))
}

/// Returns the first path in `event` worth reloading for, if any.
///
/// Only content changes count (create, modify, remove); access notifications
/// and paths under an `ignored` prefix are skipped.
pub fn relevant_path(event: &notify::Event, ignored: &[PathBuf]) -> Option<PathBuf> {
    let is_change = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    if !is_change {
        return None;
    }
    event
        .paths
        .iter()
        .find(|p| !ignored.iter().any(|ig| p.starts_with(ig)))
        .cloned()
}

/// Makes `path` absolute against the current directory and drops `.` components,
/// so watch roots and ignore prefixes compare equal to the paths the OS reports.
fn absolutize(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    joined
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        paths
            .iter()
            .fold(notify::Event::new(kind), |e, p| e.add_path(PathBuf::from(p)))
    }

    #[test]
    fn content_changes_are_relevant() {
        for kind in [
            EventKind::Create(CreateKind::File),
            EventKind::Modify(ModifyKind::Any),
            EventKind::Remove(RemoveKind::File),
        ] {
            let e = event(kind, &["/src/main.cpp"]);
            assert_eq!(relevant_path(&e, &[]), Some(PathBuf::from("/src/main.cpp")));
        }
    }

    #[test]
    fn access_events_are_ignored() {
        let e = event(EventKind::Access(AccessKind::Any), &["/src/main.cpp"]);
        assert_eq!(relevant_path(&e, &[]), None);
    }

    #[test]
    fn ignored_prefixes_are_skipped() {
        let ignored = vec![PathBuf::from("/src/build")];
        let e = event(
            EventKind::Modify(ModifyKind::Any),
            &["/src/build/main.o", "/src/main.cpp"],
        );
        assert_eq!(relevant_path(&e, &ignored), Some(PathBuf::from("/src/main.cpp")));

        let only_ignored = event(EventKind::Create(CreateKind::File), &["/src/build/app"]);
        assert_eq!(relevant_path(&only_ignored, &ignored), None);
    }

    #[test]
    fn absolutize_drops_current_dir_components() {
        let abs = absolutize(Path::new("./soil_sim"));
        assert!(abs.is_absolute());
        assert!(abs.ends_with("soil_sim"));
        assert!(!abs.components().any(|c| matches!(c, Component::CurDir)));
    }

    #[tokio::test]
    async fn file_write_produces_one_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = start(
            &[dir.path().to_path_buf()],
            &[],
            Duration::from_millis(100),
            tx,
        )
        .unwrap();

        std::fs::write(dir.path().join("main.cpp"), "int main() {}").unwrap();
        std::fs::write(dir.path().join("main.cpp"), "int main() { return 0; }").unwrap();

        let trigger = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no reload within timeout")
            .unwrap();
        assert!(matches!(trigger, Trigger::Reload(ReloadSource::FileChange(_))));

        handle.abort();
    }

    #[tokio::test]
    async fn missing_watch_root_is_an_error() {
        let (tx, _rx) = mpsc::channel(8);
        let missing = PathBuf::from("/nonexistent/reloader-watch-root");
        assert!(start(&[missing], &[], Duration::from_millis(10), tx).is_err());
    }
}
