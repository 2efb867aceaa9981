//! File-change watches for hot reload.
//!
//! Bridges the platform notifier into the hub's event channel. The hub keeps
//! the per-slot state machine (modify then close-write triggers a reload, an
//! invalidated watch is ignored from then on); this module only classifies
//! raw notifications.

use crate::error::{HubError, Result};
use crate::events::{FileEvent, HubEvent, WatchSlot};
use flume::Sender;
use notify::event::{AccessKind, AccessMode, EventKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use tracing::debug;

/// Running watcher; dropping it stops all notifications.
pub struct SettingsMonitor {
    _watcher: RecommendedWatcher,
}

/// Watch the given files and forward classified events to the hub.
///
/// Files that do not exist yet are skipped with a log line; every watch
/// entry is optional.
pub fn install(paths: Vec<(WatchSlot, PathBuf)>, events: Sender<HubEvent>) -> Result<SettingsMonitor> {
    let table: Vec<(WatchSlot, PathBuf)> = paths
        .iter()
        .filter(|(_, path)| path.exists())
        .cloned()
        .collect();
    let lookup = table.clone();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(_) => return,
        };
        let Some(kind) = classify(&event.kind) else {
            return;
        };
        for path in &event.paths {
            for (slot, watched) in &lookup {
                let same_file = path == watched
                    || watched
                        .file_name()
                        .is_some_and(|name| path.file_name() == Some(name));
                if same_file {
                    let _ = events.send(HubEvent::File {
                        slot: *slot,
                        event: kind,
                    });
                }
            }
        }
    })
    .map_err(|e| HubError::config(format!("watcher setup failed: {e}")))?;

    for (slot, path) in &table {
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| HubError::config(format!("cannot watch {}: {e}", path.display())))?;
        debug!(?slot, path = %path.display(), "watching for changes");
    }

    Ok(SettingsMonitor { _watcher: watcher })
}

fn classify(kind: &EventKind) -> Option<FileEvent> {
    match kind {
        EventKind::Modify(_) | EventKind::Create(_) => Some(FileEvent::Modified),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(FileEvent::CloseWrite),
        EventKind::Remove(_) => Some(FileEvent::Ignored),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Any))),
            Some(FileEvent::Modified)
        );
        assert_eq!(
            classify(&EventKind::Access(AccessKind::Close(AccessMode::Write))),
            Some(FileEvent::CloseWrite)
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File)),
            Some(FileEvent::Ignored)
        );
        assert_eq!(classify(&EventKind::Create(CreateKind::File)), Some(FileEvent::Modified));
        assert_eq!(
            classify(&EventKind::Access(AccessKind::Read)),
            None
        );
    }
}
