//! File change notifications for the auth log.
//!
//! Wraps a `notify` watcher on the log file itself. Events are forwarded
//! from the watcher thread over a bounded channel and reduced to
//! [`WatchSignal`]s for the event loop.

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 100;

/// Which notify backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    /// inotify on Linux
    Native,
    /// Periodic stat of the file
    Poll(Duration),
}

/// What a notification means for the reader.
#[derive(Debug)]
pub enum WatchSignal {
    /// New data may be available
    Changed,
    /// The file was moved or deleted
    Rotated,
    /// The watcher reported an error
    Error(notify::Error),
}

/// Watch on a single file path.
pub struct FileWatcher {
    path: PathBuf,
    watcher: Box<dyn Watcher + Send>,
    events: mpsc::Receiver<notify::Result<Event>>,
    watching: bool,
}

impl FileWatcher {
    /// Create a watcher for `path`. Call [`watch`](Self::watch) to arm it.
    pub fn new<P: AsRef<Path>>(path: P, kind: WatcherKind) -> notify::Result<Self> {
        let (tx, events) = mpsc::channel::<notify::Result<Event>>(CHANNEL_CAPACITY);

        let handler = move |res| {
            let _ = tx.blocking_send(res);
        };

        let watcher: Box<dyn Watcher + Send> = match kind {
            WatcherKind::Native => Box::new(RecommendedWatcher::new(handler, Config::default())?),
            WatcherKind::Poll(interval) => Box::new(PollWatcher::new(
                handler,
                Config::default().with_poll_interval(interval),
            )?),
        };

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            watcher,
            events,
            watching: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_watching(&self) -> bool {
        self.watching
    }

    pub fn watch(&mut self) -> notify::Result<()> {
        self.watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        self.watching = true;
        debug!("watching {}", self.path.display());
        Ok(())
    }

    pub fn unwatch(&mut self) {
        if !self.watching {
            return;
        }
        // The kernel drops the watch by itself when the file goes away
        if let Err(e) = self.watcher.unwatch(&self.path) {
            debug!("unwatch {}: {}", self.path.display(), e);
        }
        self.watching = false;
    }

    /// Wait for the next notification. `None` once the watcher is gone.
    pub async fn next_signal(&mut self) -> Option<WatchSignal> {
        let res = self.events.recv().await?;
        Some(match res {
            Ok(event) => signal_for(&event),
            Err(e) => WatchSignal::Error(e),
        })
    }

    /// Throw away notifications queued for a file we no longer read.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.events.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Reduce a notify event to what the reader cares about.
pub fn signal_for(event: &Event) -> WatchSignal {
    match event.kind {
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => WatchSignal::Rotated,
        _ => WatchSignal::Changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind, RenameMode};

    #[test]
    fn test_signal_for_event_kinds() {
        let rotated = [
            EventKind::Remove(RemoveKind::File),
            EventKind::Remove(RemoveKind::Any),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            EventKind::Modify(ModifyKind::Name(RenameMode::Any)),
        ];
        for kind in rotated {
            assert!(matches!(signal_for(&Event::new(kind)), WatchSignal::Rotated));
        }

        let changed = [
            EventKind::Modify(ModifyKind::Data(DataChange::Any)),
            EventKind::Modify(ModifyKind::Any),
            EventKind::Create(CreateKind::File),
            EventKind::Any,
        ];
        for kind in changed {
            assert!(matches!(signal_for(&Event::new(kind)), WatchSignal::Changed));
        }
    }

    #[tokio::test]
    async fn test_watch_reports_appends() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        std::fs::write(&path, "").unwrap();

        let mut watcher = FileWatcher::new(&path, WatcherKind::Native).unwrap();
        watcher.watch().unwrap();
        assert!(watcher.is_watching());

        std::fs::write(&path, "line\n").unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(5), watcher.next_signal())
            .await
            .unwrap();
        assert!(matches!(signal, Some(WatchSignal::Changed)));

        watcher.unwatch();
        assert!(!watcher.is_watching());
    }
}
