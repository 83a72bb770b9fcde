//! Directory event source.
//!
//! [`DirWatcher`] wraps a non-recursive `notify` watcher whose backend thread
//! only forwards raw events over a `crossbeam-channel`. All dispatch happens
//! on the caller's thread through [`DirWatcher::process_events`], so the
//! consumers never need locking.
//!
//! Registering a directory replays its current listing as `Created` events
//! before any live event, which lets consumers use one code path for "what
//! is already there" and "what shows up later".

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};

use crate::core::errors::{Result, WardenError};

/// A normalized filesystem notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// An entry appeared.
    Created(PathBuf),
    /// An entry went away.
    Deleted(PathBuf),
    /// An entry's content or metadata changed.
    Modified(PathBuf),
}

impl WatchEvent {
    /// Path the event refers to.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Created(path) | Self::Deleted(path) | Self::Modified(path) => path,
        }
    }
}

/// Callbacks invoked by [`DirWatcher::process_events`].
///
/// An error aborts the current batch and is returned to the loop; the event
/// that failed is not redelivered.
pub trait WatchHandler {
    /// An entry appeared, or was already there when its directory got watched.
    fn on_created(&mut self, path: &Path) -> Result<()>;

    /// An entry went away.
    fn on_deleted(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }

    /// An entry was written to.
    fn on_modified(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Batched, bounded event source over a set of directories.
pub struct DirWatcher {
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    pending: VecDeque<WatchEvent>,
    watched: BTreeSet<PathBuf>,
}

impl DirWatcher {
    /// Create a watcher with nothing registered.
    pub fn new() -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let watcher = notify::recommended_watcher(tx)?;
        Ok(Self {
            watcher,
            rx,
            pending: VecDeque::new(),
            watched: BTreeSet::new(),
        })
    }

    /// Start watching `dir` and queue its current entries as `Created`.
    ///
    /// Registering an already watched directory does nothing.
    pub fn watch(&mut self, dir: &Path) -> Result<()> {
        if self.watched.contains(dir) {
            return Ok(());
        }
        if let Err(err) = self.watcher.watch(dir, RecursiveMode::NonRecursive) {
            return Err(match err.kind {
                notify::ErrorKind::PathNotFound => WardenError::io(
                    dir,
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                ),
                notify::ErrorKind::Io(io) => WardenError::io(dir, io),
                kind => notify::Error::new(kind).add_path(dir.to_path_buf()).into(),
            });
        }
        self.watched.insert(dir.to_path_buf());

        let entries = std::fs::read_dir(dir).map_err(|err| WardenError::io(dir, err))?;
        let mut existing = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| WardenError::io(dir, err))?;
            existing.push(entry.path());
        }
        existing.sort();
        tracing::debug!(dir = %dir.display(), replayed = existing.len(), "watching directory");
        self.pending
            .extend(existing.into_iter().map(WatchEvent::Created));
        Ok(())
    }

    /// Stop watching `dir`. Unknown or already deleted directories are ignored.
    pub fn unwatch(&mut self, dir: &Path) {
        if self.watched.remove(dir) {
            if let Err(err) = self.watcher.unwatch(dir) {
                tracing::debug!(dir = %dir.display(), error = %err, "unwatch after removal");
            }
        }
    }

    /// Whether `dir` is currently registered.
    #[must_use]
    pub fn is_watching(&self, dir: &Path) -> bool {
        self.watched.contains(dir)
    }

    /// Block up to `timeout` until at least one event is pending.
    pub fn wait_for_events(&mut self, timeout: Duration) -> bool {
        if !self.pending.is_empty() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(raw) => {
                self.accept(raw);
                self.drain_channel();
                // A raw event can translate to nothing (e.g. access events).
                !self.pending.is_empty()
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Dispatch at most `max_events` queued events (all when `None`).
    ///
    /// Never blocks: only events already delivered by the backend are
    /// considered. Returns the number of events dispatched.
    pub fn process_events<H: WatchHandler + ?Sized>(
        &mut self,
        handler: &mut H,
        max_events: Option<usize>,
    ) -> Result<usize> {
        self.drain_channel();
        let budget = max_events.unwrap_or(usize::MAX);
        let mut dispatched = 0;
        while dispatched < budget {
            let Some(event) = self.pending.pop_front() else {
                break;
            };
            dispatched += 1;
            match &event {
                WatchEvent::Created(path) => handler.on_created(path)?,
                WatchEvent::Deleted(path) => handler.on_deleted(path)?,
                WatchEvent::Modified(path) => handler.on_modified(path)?,
            }
        }
        Ok(dispatched)
    }

    /// Number of events waiting for dispatch.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn drain_channel(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(raw) => self.accept(raw),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    fn accept(&mut self, raw: notify::Result<Event>) {
        match raw {
            Ok(event) => self.pending.extend(translate(event)),
            Err(err) => tracing::warn!(error = %err, "dropping watch backend error"),
        }
    }
}

/// Map a backend event onto zero or more [`WatchEvent`]s.
///
/// Renames become a delete of the old name and a create of the new one.
pub(crate) fn translate(event: Event) -> Vec<WatchEvent> {
    let Event { kind, paths, .. } = event;
    match kind {
        EventKind::Create(_) => paths.into_iter().map(WatchEvent::Created).collect(),
        EventKind::Remove(_) => paths.into_iter().map(WatchEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.into_iter().map(WatchEvent::Deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.into_iter().map(WatchEvent::Created).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let mut paths = paths.into_iter();
            let from = paths.next().map(WatchEvent::Deleted);
            let to = paths.next().map(WatchEvent::Created);
            from.into_iter().chain(to).collect()
        }
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .into_iter()
            .map(|path| {
                if path.exists() {
                    WatchEvent::Created(path)
                } else {
                    WatchEvent::Deleted(path)
                }
            })
            .collect(),
        EventKind::Modify(_) => paths.into_iter().map(WatchEvent::Modified).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<WatchEvent>,
    }

    impl WatchHandler for Recorder {
        fn on_created(&mut self, path: &Path) -> Result<()> {
            self.seen.push(WatchEvent::Created(path.to_path_buf()));
            Ok(())
        }

        fn on_deleted(&mut self, path: &Path) -> Result<()> {
            self.seen.push(WatchEvent::Deleted(path.to_path_buf()));
            Ok(())
        }

        fn on_modified(&mut self, path: &Path) -> Result<()> {
            self.seen.push(WatchEvent::Modified(path.to_path_buf()));
            Ok(())
        }
    }

    #[test]
    fn watch_replays_existing_entries_once() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("b")).unwrap();
        std::fs::create_dir(tmp.path().join("a")).unwrap();

        let mut watcher = DirWatcher::new().unwrap();
        watcher.watch(tmp.path()).unwrap();
        watcher.watch(tmp.path()).unwrap();
        assert!(watcher.wait_for_events(Duration::ZERO));

        let mut recorder = Recorder::default();
        let count = watcher.process_events(&mut recorder, None).unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            recorder.seen,
            vec![
                WatchEvent::Created(tmp.path().join("a")),
                WatchEvent::Created(tmp.path().join("b")),
            ]
        );
    }

    #[test]
    fn process_events_honours_budget() {
        let tmp = TempDir::new().unwrap();
        for name in ["x", "y", "z"] {
            std::fs::write(tmp.path().join(name), "").unwrap();
        }
        let mut watcher = DirWatcher::new().unwrap();
        watcher.watch(tmp.path()).unwrap();

        let mut recorder = Recorder::default();
        assert_eq!(watcher.process_events(&mut recorder, Some(2)).unwrap(), 2);
        assert_eq!(watcher.pending_len(), 1);
        assert_eq!(watcher.process_events(&mut recorder, Some(2)).unwrap(), 1);
        assert_eq!(recorder.seen.len(), 3);
    }

    #[test]
    fn live_creation_is_delivered() {
        let tmp = TempDir::new().unwrap();
        let mut watcher = DirWatcher::new().unwrap();
        watcher.watch(tmp.path()).unwrap();

        let created = tmp.path().join("late");
        std::fs::write(&created, "").unwrap();

        let mut recorder = Recorder::default();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline
            && !recorder.seen.contains(&WatchEvent::Created(created.clone()))
        {
            if watcher.wait_for_events(Duration::from_millis(100)) {
                watcher.process_events(&mut recorder, None).unwrap();
            }
        }
        assert!(recorder.seen.contains(&WatchEvent::Created(created)));
    }

    #[test]
    fn wait_times_out_without_events() {
        let tmp = TempDir::new().unwrap();
        let mut watcher = DirWatcher::new().unwrap();
        watcher.watch(tmp.path()).unwrap();
        assert!(!watcher.wait_for_events(Duration::from_millis(50)));
    }

    #[test]
    fn translate_splits_renames() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/d/old"))
            .add_path(PathBuf::from("/d/new"));
        assert_eq!(
            translate(event),
            vec![
                WatchEvent::Deleted(PathBuf::from("/d/old")),
                WatchEvent::Created(PathBuf::from("/d/new")),
            ]
        );
    }

    #[test]
    fn translate_maps_basic_kinds() {
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/d/a"));
        let remove = Event::new(EventKind::Remove(RemoveKind::Any)).add_path(PathBuf::from("/d/a"));
        let write = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Any)))
            .add_path(PathBuf::from("/d/a"));
        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/d/a"));

        assert_eq!(translate(create), vec![WatchEvent::Created(PathBuf::from("/d/a"))]);
        assert_eq!(translate(remove), vec![WatchEvent::Deleted(PathBuf::from("/d/a"))]);
        assert_eq!(translate(write), vec![WatchEvent::Modified(PathBuf::from("/d/a"))]);
        assert!(translate(access).is_empty());
    }
}
