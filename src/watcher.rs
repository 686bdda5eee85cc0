use std::path::Path;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::{FileEvent, FileEventKind};

/// Raw filesystem event source. Dropping it tears the subscription down.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    event_rx: UnboundedReceiver<FileEvent>,
}

impl FileWatcher {
    pub fn new<P: AsRef<Path>>(path: P, mode: RecursiveMode) -> Result<Self> {
        let root = path.as_ref();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<FileEvent>();

        // Create the notify watcher
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for file_event in file_events(event) {
                        if event_tx.send(file_event).is_err() {
                            break; // Receiver dropped
                        }
                    }
                }
                Err(err) => {
                    tracing::error!("File watcher error: {}", err);
                }
            }
        })
        .context("Failed to create file system watcher")?;

        watcher
            .watch(root, mode)
            .with_context(|| format!("Failed to start watching {}", root.display()))?;

        tracing::debug!("Watching {} ({:?})", root.display(), mode);

        Ok(Self {
            _watcher: watcher,
            event_rx,
        })
    }

    pub async fn recv(&mut self) -> Option<FileEvent> {
        self.event_rx.recv().await
    }
}

/// Split one notify event into per-path events.
fn file_events(event: Event) -> Vec<FileEvent> {
    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        // paths are [from, to]
        let mut paths = event.paths.into_iter();
        return paths
            .next()
            .map(|from| FileEvent::new(from, FileEventKind::Deleted))
            .into_iter()
            .chain(paths.next().map(|to| FileEvent::new(to, FileEventKind::Created)))
            .collect();
    }

    let Some(kind) = FileEventKind::from_notify(&event.kind) else {
        return Vec::new();
    };
    event
        .paths
        .into_iter()
        .map(|path| FileEvent::new(path, kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use notify::event::{AccessKind, DataChange};

    #[test]
    fn test_rename_both_splits_into_delete_and_create() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/w/old.rs"))
            .add_path(PathBuf::from("/w/new.rs"));

        let events = file_events(event);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].path, PathBuf::from("/w/old.rs"));
        assert_eq!(events[0].kind, FileEventKind::Deleted);
        assert_eq!(events[1].path, PathBuf::from("/w/new.rs"));
        assert_eq!(events[1].kind, FileEventKind::Created);
    }

    #[test]
    fn test_modify_and_access_events() {
        let event = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Any)))
            .add_path(PathBuf::from("/w/a.rs"));
        let events = file_events(event);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FileEventKind::Modified);

        let event =
            Event::new(EventKind::Access(AccessKind::Any)).add_path(PathBuf::from("/w/a.rs"));
        assert!(file_events(event).is_empty());
    }

    #[tokio::test]
    async fn test_watch_missing_directory_fails() {
        let result = FileWatcher::new("/nonexistent/watchprompt/12345", RecursiveMode::Recursive);
        assert!(result.is_err());
    }
}
