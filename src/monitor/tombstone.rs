//! Tombstone dispatch.
//!
//! The supervisor layer drops one file per unit exit into a tombstone
//! directory, named `<id>,<timestamp>,<return_code>,<signal>`. Every watched
//! directory is bound to one action; a tombstone is deleted once its action
//! reports success, so each record is handled at most once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;

use crate::core::config::{PathsConfig, TombstoneBinding};
use crate::core::errors::{Result, WardenError};
use crate::core::fsops;
use crate::monitor::actions::{ContainerCleanupAction, ContainerDownAction, NodeDownAction};
use crate::supervisor::control::SupervisorControl;
use crate::watchdog::Watchdog;
use crate::watcher::{DirWatcher, WatchHandler};

static TOMBSTONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+),(\d+(?:\.\d+)?),(-?\d+),(-?\d+)$").expect("tombstone pattern is valid")
});

/// One parsed tombstone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tombstone {
    /// Identifier of the unit that exited.
    pub id: String,
    /// Exit time in seconds since the epoch.
    pub timestamp: f64,
    /// Return code of the exit.
    pub return_code: i32,
    /// Terminating signal as reported by the supervisor.
    pub signal: i32,
}

impl Tombstone {
    /// Parse a tombstone file name. Returns `None` for anything malformed.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let caps = TOMBSTONE_RE.captures(name)?;
        Some(Self {
            id: caps[1].to_string(),
            timestamp: caps[2].parse().ok()?,
            return_code: caps[3].parse().ok()?,
            signal: caps[4].parse().ok()?,
        })
    }
}

/// Handler bound to a tombstone directory.
pub trait TombstoneAction {
    /// `Ok(true)` consumes the tombstone; `Ok(false)` leaves it for a later
    /// sweep.
    fn execute(&mut self, tombstone: &Tombstone) -> Result<bool>;
}

/// What action constructors may use.
#[derive(Clone)]
pub struct ActionContext {
    /// Where node-down markers go.
    pub watchdog: Watchdog,
    /// Supervisor control shared by every action.
    pub control: Rc<dyn SupervisorControl>,
    /// Scan root of running containers.
    pub running_dir: PathBuf,
    /// Requested-cleanup directory.
    pub cleanup_dir: PathBuf,
}

impl ActionContext {
    /// Context over the configured node layout.
    #[must_use]
    pub fn new(paths: &PathsConfig, control: Rc<dyn SupervisorControl>) -> Self {
        Self {
            watchdog: Watchdog::new(&paths.watchdog_dir),
            control,
            running_dir: paths.running_dir.clone(),
            cleanup_dir: paths.cleanup_dir.clone(),
        }
    }
}

type ActionConstructor = Box<dyn Fn(&ActionContext) -> Result<Box<dyn TombstoneAction>>>;

/// Action key to constructor table.
pub struct ActionRegistry {
    constructors: BTreeMap<String, ActionConstructor>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ActionRegistry {
    /// Registry without any action.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// `node-down`, `container-cleanup` and `container-down`.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("node-down", |ctx| {
            Ok(Box::new(NodeDownAction::new(ctx.watchdog.clone())))
        });
        registry.register("container-cleanup", |ctx| {
            Ok(Box::new(ContainerCleanupAction::new(
                &ctx.running_dir,
                &ctx.cleanup_dir,
                Rc::clone(&ctx.control),
            )))
        });
        registry.register("container-down", |ctx| {
            Ok(Box::new(ContainerDownAction::new(
                &ctx.running_dir,
                Rc::clone(&ctx.control),
            )))
        });
        registry
    }

    /// Add or replace the constructor behind `key`.
    pub fn register<F>(&mut self, key: &str, constructor: F)
    where
        F: Fn(&ActionContext) -> Result<Box<dyn TombstoneAction>> + 'static,
    {
        self.constructors
            .insert(key.to_string(), Box::new(constructor));
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Construct the action for `key`; unknown keys are an error.
    pub fn build(&self, key: &str, ctx: &ActionContext) -> Result<Box<dyn TombstoneAction>> {
        let constructor = self
            .constructors
            .get(key)
            .ok_or_else(|| WardenError::UnknownAction {
                key: key.to_string(),
            })?;
        constructor(ctx)
    }
}

struct Dispatch {
    actions: BTreeMap<PathBuf, (String, Box<dyn TombstoneAction>)>,
}

impl Dispatch {
    fn bind(
        bindings: &[TombstoneBinding],
        registry: &ActionRegistry,
        ctx: &ActionContext,
    ) -> Result<Self> {
        let mut actions = BTreeMap::new();
        for binding in bindings {
            let action = registry.build(&binding.action, ctx)?;
            actions.insert(binding.path.clone(), (binding.action.clone(), action));
        }
        Ok(Self { actions })
    }

    /// Handle one tombstone path. Returns whether it was consumed.
    fn handle(&mut self, path: &Path) -> Result<bool> {
        let Some(dir) = path.parent() else {
            return Ok(false);
        };
        let Some((key, action)) = self.actions.get_mut(dir) else {
            return Ok(false);
        };
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return Ok(false);
        };
        if fsops::is_hidden(name) {
            return Ok(false);
        }
        // Consumed by an earlier pass or removed by an operator.
        if !fsops::entry_exists(path) {
            return Ok(false);
        }
        let Some(tombstone) = Tombstone::parse(name) else {
            tracing::warn!(path = %path.display(), "removing malformed tombstone");
            fsops::remove_file_if_exists(path)?;
            return Ok(false);
        };

        match action.execute(&tombstone) {
            Ok(true) => {
                fsops::remove_file_if_exists(path)?;
                tracing::info!(
                    action = %key,
                    id = %tombstone.id,
                    return_code = tombstone.return_code,
                    signal = tombstone.signal,
                    "tombstone handled"
                );
                Ok(true)
            }
            Ok(false) => {
                tracing::debug!(action = %key, id = %tombstone.id, "tombstone kept for retry");
                Ok(false)
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(action = %key, id = %tombstone.id, error = %err, "tombstone action will be retried");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

impl WatchHandler for Dispatch {
    fn on_created(&mut self, path: &Path) -> Result<()> {
        self.handle(path).map(|_| ())
    }
}

/// Watch loop over every bound tombstone directory.
pub struct TombstoneMonitor {
    watcher: DirWatcher,
    dispatch: Dispatch,
    registry: ActionRegistry,
    ctx: ActionContext,
    max_events_per_cycle: usize,
    last_sweep: Instant,
}

impl TombstoneMonitor {
    /// Bind every directory to its action. Unknown action keys fail here.
    pub fn new(
        bindings: &[TombstoneBinding],
        registry: ActionRegistry,
        ctx: ActionContext,
        max_events_per_cycle: usize,
    ) -> Result<Self> {
        let dispatch = Dispatch::bind(bindings, &registry, &ctx)?;
        Ok(Self {
            watcher: DirWatcher::new()?,
            dispatch,
            registry,
            ctx,
            max_events_per_cycle,
            last_sweep: Instant::now(),
        })
    }

    /// Directories currently bound, with their action keys.
    pub fn bindings(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.dispatch
            .actions
            .iter()
            .map(|(dir, (key, _))| (dir.as_path(), key.as_str()))
    }

    /// Replace the bindings. Newly bound directories are watched and their
    /// backlog replayed; directories no longer bound are released.
    pub fn reload(&mut self, bindings: &[TombstoneBinding]) -> Result<()> {
        let dispatch = Dispatch::bind(bindings, &self.registry, &self.ctx)?;
        for dir in self.dispatch.actions.keys() {
            if !dispatch.actions.contains_key(dir) {
                self.watcher.unwatch(dir);
            }
        }
        self.dispatch = dispatch;
        tracing::info!(bindings = bindings.len(), "tombstone bindings reloaded");
        self.start()
    }

    /// Watch every bound directory and handle its backlog.
    pub fn start(&mut self) -> Result<()> {
        for dir in self.dispatch.actions.keys() {
            fsops::ensure_dir(dir)?;
            self.watcher.watch(dir)?;
        }
        self.watcher.process_events(&mut self.dispatch, None)?;
        Ok(())
    }

    /// Handle one batch of events, then sweep for tombstones left by failed
    /// actions if the last sweep is at least `timeout` old. Returns the
    /// number of events dispatched plus the number consumed by the sweep.
    pub fn run_once(&mut self, timeout: Duration) -> Result<usize> {
        let mut handled = 0;
        if self.watcher.wait_for_events(timeout) {
            handled = self
                .watcher
                .process_events(&mut self.dispatch, Some(self.max_events_per_cycle))?;
        }
        if self.last_sweep.elapsed() >= timeout {
            handled += self.sweep()?;
        }
        Ok(handled)
    }

    /// Handle the tombstone at `path` as if it had just been created.
    /// Returns whether it was consumed.
    pub fn handle(&mut self, path: &Path) -> Result<bool> {
        self.dispatch.handle(path)
    }

    /// Retry every tombstone still present. Returns how many were consumed.
    pub fn sweep(&mut self) -> Result<usize> {
        self.last_sweep = Instant::now();
        let dirs: Vec<PathBuf> = self.dispatch.actions.keys().cloned().collect();
        let mut consumed = 0;
        for dir in dirs {
            for name in fsops::list_visible(&dir)? {
                if self.dispatch.handle(&dir.join(name))? {
                    consumed += 1;
                }
            }
        }
        Ok(consumed)
    }

    /// Loop until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool, idle: Duration) -> Result<()> {
        self.start()?;
        while !shutdown.load(Ordering::Relaxed) {
            self.run_once(idle)?;
        }
        tracing::info!("tombstone monitor exiting");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::control::{SvcAction, SvcWait, SvscanAction};
    use std::cell::{Cell, RefCell};
    use tempfile::TempDir;

    struct NullControl;

    impl SupervisorControl for NullControl {
        fn control_service(
            &self,
            _dir: &Path,
            _actions: &[SvcAction],
            _wait: Option<SvcWait>,
            _timeout: Option<Duration>,
        ) -> Result<bool> {
            Ok(true)
        }

        fn wait_service(
            &self,
            _dirs: &[PathBuf],
            _wait: SvcWait,
            _all: bool,
            _timeout: Option<Duration>,
        ) -> Result<bool> {
            Ok(true)
        }

        fn control_svscan(&self, _scan_dir: &Path, _actions: &[SvscanAction]) -> Result<()> {
            Ok(())
        }

        fn is_supervised(&self, _dir: &Path) -> Result<bool> {
            Ok(true)
        }
    }

    /// Records every tombstone; answers from a script of outcomes.
    struct Scripted {
        seen: Rc<RefCell<Vec<Tombstone>>>,
        outcomes: Rc<RefCell<Vec<Result<bool>>>>,
    }

    impl TombstoneAction for Scripted {
        fn execute(&mut self, tombstone: &Tombstone) -> Result<bool> {
            self.seen.borrow_mut().push(tombstone.clone());
            let mut outcomes = self.outcomes.borrow_mut();
            if outcomes.is_empty() {
                Ok(true)
            } else {
                outcomes.remove(0)
            }
        }
    }

    struct Fixture {
        _tmp: TempDir,
        dir: PathBuf,
        monitor: TombstoneMonitor,
        seen: Rc<RefCell<Vec<Tombstone>>>,
        outcomes: Rc<RefCell<Vec<Result<bool>>>>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("tombstones");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let mut registry = ActionRegistry::empty();
        let (s, o) = (Rc::clone(&seen), Rc::clone(&outcomes));
        registry.register("scripted", move |_| {
            Ok(Box::new(Scripted {
                seen: Rc::clone(&s),
                outcomes: Rc::clone(&o),
            }))
        });
        let ctx = ActionContext {
            watchdog: Watchdog::new(tmp.path().join("watchdogs")),
            control: Rc::new(NullControl),
            running_dir: tmp.path().join("running"),
            cleanup_dir: tmp.path().join("cleanup"),
        };
        let bindings = vec![TombstoneBinding {
            path: dir.clone(),
            action: "scripted".to_string(),
        }];
        let monitor = TombstoneMonitor::new(&bindings, registry, ctx, 16).unwrap();
        Fixture {
            _tmp: tmp,
            dir,
            monitor,
            seen,
            outcomes,
        }
    }

    #[test]
    fn parses_tombstone_names() {
        let stone = Tombstone::parse("app-1,1700000000.25,1,-1").unwrap();
        assert_eq!(stone.id, "app-1");
        assert!((stone.timestamp - 1_700_000_000.25).abs() < 1e-6);
        assert_eq!(stone.return_code, 1);
        assert_eq!(stone.signal, -1);
        // Ids may themselves contain commas; the last three fields win.
        assert_eq!(Tombstone::parse("a,b,10,0,9").unwrap().id, "a,b");
        assert!(Tombstone::parse("nope").is_none());
        assert!(Tombstone::parse("x,ten,0,0").is_none());
    }

    #[test]
    fn unknown_action_key_fails_binding() {
        let tmp = TempDir::new().unwrap();
        let ctx = ActionContext {
            watchdog: Watchdog::new(tmp.path()),
            control: Rc::new(NullControl),
            running_dir: tmp.path().join("running"),
            cleanup_dir: tmp.path().join("cleanup"),
        };
        let bindings = vec![TombstoneBinding {
            path: tmp.path().join("t"),
            action: "explode".to_string(),
        }];
        let err = TombstoneMonitor::new(&bindings, ActionRegistry::with_builtin(), ctx, 8)
            .err()
            .unwrap();
        assert!(matches!(err, WardenError::UnknownAction { .. }));
    }

    #[test]
    fn builtin_registry_knows_three_actions() {
        let keys: Vec<_> = ActionRegistry::with_builtin().keys().map(str::to_string).collect();
        assert_eq!(keys, vec!["container-cleanup", "container-down", "node-down"]);
    }

    #[test]
    fn backlog_is_consumed_once_and_deleted() {
        let mut fx = fixture();
        std::fs::create_dir_all(&fx.dir).unwrap();
        std::fs::write(fx.dir.join("web,10,1,0"), "").unwrap();
        std::fs::write(fx.dir.join(".web,11,1,0"), "").unwrap();

        fx.monitor.start().unwrap();
        assert_eq!(fx.seen.borrow().len(), 1);
        assert!(!fx.dir.join("web,10,1,0").exists());
        assert!(fx.dir.join(".web,11,1,0").exists());

        // A duplicate delivery of the same path finds nothing to do.
        assert!(!fx.monitor.dispatch.handle(&fx.dir.join("web,10,1,0")).unwrap());
        assert_eq!(fx.seen.borrow().len(), 1);
    }

    #[test]
    fn declined_and_retryable_failures_keep_the_tombstone() {
        let mut fx = fixture();
        std::fs::create_dir_all(&fx.dir).unwrap();
        std::fs::write(fx.dir.join("db,10,1,0"), "").unwrap();
        fx.outcomes.borrow_mut().extend([
            Ok(false),
            Err(WardenError::ControlLocked {
                path: PathBuf::from("/x"),
                attempts: 3,
            }),
        ]);

        fx.monitor.start().unwrap();
        assert!(fx.dir.join("db,10,1,0").exists());
        assert_eq!(fx.monitor.sweep().unwrap(), 0);
        assert!(fx.dir.join("db,10,1,0").exists());
        assert_eq!(fx.monitor.sweep().unwrap(), 1);
        assert!(!fx.dir.join("db,10,1,0").exists());
        assert_eq!(fx.seen.borrow().len(), 3);
    }

    #[test]
    fn retry_sweep_still_runs_under_a_steady_event_stream() {
        let mut fx = fixture();
        std::fs::create_dir_all(&fx.dir).unwrap();
        let stone = fx.dir.join("db,10,1,0");
        std::fs::write(&stone, "").unwrap();
        fx.outcomes.borrow_mut().push(Err(WardenError::ControlLocked {
            path: PathBuf::from("/x"),
            attempts: 3,
        }));
        fx.monitor.start().unwrap();
        assert!(stone.exists());

        // Hidden files are ignored by dispatch but keep events flowing.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut tick = 0;
        while stone.exists() && Instant::now() < deadline {
            std::fs::write(fx.dir.join(format!(".noise-{tick}")), "").unwrap();
            tick += 1;
            fx.monitor.run_once(Duration::from_millis(30)).unwrap();
        }
        assert!(!stone.exists());
        assert_eq!(fx.seen.borrow().len(), 2);
    }

    #[test]
    fn fatal_failure_propagates() {
        let mut fx = fixture();
        std::fs::create_dir_all(&fx.dir).unwrap();
        std::fs::write(fx.dir.join("db,10,1,0"), "").unwrap();
        fx.outcomes.borrow_mut().push(Err(WardenError::NotSupervised {
            path: PathBuf::from("/x"),
        }));
        assert!(fx.monitor.start().is_err());
        assert!(fx.dir.join("db,10,1,0").exists());
    }

    #[test]
    fn malformed_tombstones_are_removed_unhandled() {
        let mut fx = fixture();
        std::fs::create_dir_all(&fx.dir).unwrap();
        std::fs::write(fx.dir.join("garbage"), "").unwrap();
        fx.monitor.start().unwrap();
        assert!(!fx.dir.join("garbage").exists());
        assert!(fx.seen.borrow().is_empty());
    }

    #[test]
    fn reload_rebinds_directories() {
        let mut fx = fixture();
        fx.monitor.start().unwrap();
        let other = fx.dir.with_file_name("other");
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        fx.monitor.registry.register("count", move |_| {
            counter.set(counter.get() + 1);
            Ok(Box::new(Scripted {
                seen: Rc::new(RefCell::new(Vec::new())),
                outcomes: Rc::new(RefCell::new(Vec::new())),
            }))
        });
        fx.monitor
            .reload(&[TombstoneBinding {
                path: other.clone(),
                action: "count".to_string(),
            }])
            .unwrap();
        assert_eq!(calls.get(), 1);
        let bound: Vec<_> = fx.monitor.bindings().map(|(dir, _)| dir.to_path_buf()).collect();
        assert_eq!(bound, vec![other.clone()]);
        assert!(other.is_dir());
    }
}
