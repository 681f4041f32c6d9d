use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::config::{directive_from_path, is_worker_config};
use super::{SupervisorError, WorkerSupervisor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    Start(PathBuf),
    Stop(String),
}

/// Maps a filesystem event in the worker config directory to supervisor actions.
///
/// Starts wait for a completed write or a rename into the directory, so a
/// half-written file is never parsed.
pub fn classify(event: &Event) -> Vec<WatchAction> {
    let start = |p: &PathBuf| is_worker_config(p).then(|| WatchAction::Start(p.clone()));
    let stop = |p: &PathBuf| {
        if is_worker_config(p) {
            directive_from_path(p).map(WatchAction::Stop)
        } else {
            None
        }
    };

    match &event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write))
        | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().filter_map(start).collect()
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().filter_map(stop).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event
            .paths
            .first()
            .and_then(stop)
            .into_iter()
            .chain(event.paths.get(1).and_then(start))
            .collect(),
        _ => Vec::new(),
    }
}

/// Watches `dir` and applies changes to `supervisor` until it shuts down.
pub fn spawn_watcher(
    supervisor: Arc<WorkerSupervisor>,
    dir: &Path,
) -> Result<JoinHandle<()>, SupervisorError> {
    std::fs::create_dir_all(dir).map_err(|source| SupervisorError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let _ = tx.send(res);
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    debug!("Watching worker configs in {}", dir.display());

    let token = supervisor.shutdown_token();
    let handle = tokio::spawn(async move {
        // Dropping the watcher stops event delivery.
        let _watcher = watcher;
        loop {
            let res = tokio::select! {
                res = rx.recv() => match res {
                    Some(res) => res,
                    None => break,
                },
                _ = token.cancelled() => break,
            };
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    error!("Worker directory watch error: {}", e);
                    continue;
                }
            };
            trace!(?event, "Worker directory event");

            for action in classify(&event) {
                apply(&supervisor, action).await;
            }
        }
        debug!("Worker directory watch stopped");
    });
    Ok(handle)
}

async fn apply(supervisor: &Arc<WorkerSupervisor>, action: WatchAction) {
    match action {
        WatchAction::Start(path) => {
            debug!("New worker config detected: {}", path.display());
            if let Err(e) = supervisor.start_path(&path) {
                error!("Cannot start worker from {}: {}", path.display(), e);
            }
        }
        WatchAction::Stop(directive) => {
            debug!("Worker config removed: {}", directive);
            if let Err(e) = supervisor.stop(&directive).await {
                warn!("Cannot stop worker '{}': {}", directive, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn test_close_write_starts() {
        let actions = classify(&event(
            EventKind::Access(AccessKind::Close(AccessMode::Write)),
            &["/w/echo.toml"],
        ));
        assert_eq!(actions, vec![WatchAction::Start(PathBuf::from("/w/echo.toml"))]);
    }

    #[test]
    fn test_remove_stops() {
        let actions = classify(&event(EventKind::Remove(RemoveKind::File), &["/w/echo.toml"]));
        assert_eq!(actions, vec![WatchAction::Stop("echo".to_string())]);
    }

    #[test]
    fn test_rename_both() {
        let actions = classify(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/w/old.toml", "/w/new.toml"],
        ));
        assert_eq!(
            actions,
            vec![
                WatchAction::Stop("old".to_string()),
                WatchAction::Start(PathBuf::from("/w/new.toml")),
            ]
        );
    }

    #[test]
    fn test_editor_swap_files_and_partial_writes_are_ignored() {
        assert!(classify(&event(
            EventKind::Access(AccessKind::Close(AccessMode::Write)),
            &["/w/.echo.toml.swp"],
        ))
        .is_empty());
        assert!(classify(&event(EventKind::Create(CreateKind::File), &["/w/echo.toml"])).is_empty());
        assert!(classify(&event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/w/echo.toml"],
        ))
        .is_empty());
    }
}
