//! Supervision monitors.
//!
//! [`Monitor`] drives the restart policy over every unit of one scan root and
//! escalates definitive failures through a [`DownAction`].
//! [`tombstone::TombstoneMonitor`] is the action-dispatch loop over tombstone
//! directories.

pub mod actions;
pub mod policy;
pub mod tombstone;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::core::config::MonitorConfig;
use crate::core::errors::Result;
use crate::core::fsops;
use crate::supervisor::control::{SupervisorControl, SvcAction};
use crate::watchdog::Watchdog;
use crate::watcher::{DirWatcher, WatchHandler};

pub use policy::{FailReason, MonitorPolicy, PolicyOutcome, RestartPolicy};

/// Aggregated failures of one monitor batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DownReason {
    /// One entry per failed unit, in evaluation order.
    pub failures: Vec<FailReason>,
}

impl fmt::Display for DownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, failure) in self.failures.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

/// Reaction to units that definitively failed.
pub trait DownAction {
    /// Returns whether the monitor keeps running.
    fn execute(&mut self, reason: &DownReason) -> Result<bool>;
}

/// Marks the node down through an already-expired watchdog marker and keeps
/// the monitor running so further failures are still reported.
#[derive(Debug, Clone)]
pub struct NodeDown {
    watchdog: Watchdog,
}

impl NodeDown {
    /// Write markers into `watchdog`.
    #[must_use]
    pub fn new(watchdog: Watchdog) -> Self {
        Self { watchdog }
    }
}

impl DownAction for NodeDown {
    fn execute(&mut self, reason: &DownReason) -> Result<bool> {
        let first = reason
            .failures
            .first()
            .map_or("unknown", |failure| failure.service.as_str());
        let content = format!(
            "Node down at {}: {reason}\n",
            chrono::Utc::now().to_rfc3339()
        );
        tracing::error!(%reason, "units failed permanently, marking node down");
        self.watchdog
            .create(&format!("Monitor-{first}"), Duration::ZERO, &content)?;
        Ok(true)
    }
}

/// Builds a fresh policy for every unit the monitor discovers.
pub type PolicyFactory = Box<dyn FnMut() -> Box<dyn MonitorPolicy>>;

/// Loop tuning.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Upper bound on events handled per batch.
    pub max_events_per_cycle: usize,
    /// Run-path lease timeout; the loop heartbeats at half of it.
    pub watchdog_timeout: Duration,
    /// Name of the run-path lease.
    pub lease_name: String,
}

impl MonitorOptions {
    /// Options from `[monitor]`, holding a lease named `lease_name`.
    #[must_use]
    pub fn from_config(config: &MonitorConfig, lease_name: &str) -> Self {
        Self {
            max_events_per_cycle: config.max_events_per_cycle,
            watchdog_timeout: config.watchdog_timeout(),
            lease_name: lease_name.to_string(),
        }
    }
}

struct Unit {
    dir: PathBuf,
    watch_path: PathBuf,
    policy: Box<dyn MonitorPolicy>,
}

/// Everything the event handler mutates; kept apart from the watcher so
/// both can be borrowed during dispatch.
struct MonitorState<C> {
    scan_dir: PathBuf,
    policy_factory: PolicyFactory,
    units: BTreeMap<String, Unit>,
    watch_index: HashMap<PathBuf, String>,
    dirty: BTreeSet<String>,
    /// Restarts the supervisor could not take yet; retried every cycle.
    pending_up: BTreeSet<String>,
    to_watch: Vec<PathBuf>,
    to_unwatch: Vec<PathBuf>,
    reasons: Vec<FailReason>,
    control: C,
    down_action: Box<dyn DownAction>,
}

/// Restart-policy monitor over one scan root.
pub struct Monitor<C: SupervisorControl> {
    watcher: DirWatcher,
    state: MonitorState<C>,
    options: MonitorOptions,
    watchdog: Option<Watchdog>,
}

impl<C: SupervisorControl> Monitor<C> {
    /// Monitor `scan_dir`; nothing is watched until [`Monitor::start`].
    pub fn new(
        scan_dir: impl Into<PathBuf>,
        policy_factory: PolicyFactory,
        down_action: Box<dyn DownAction>,
        control: C,
        options: MonitorOptions,
    ) -> Result<Self> {
        Ok(Self {
            watcher: DirWatcher::new()?,
            state: MonitorState {
                scan_dir: scan_dir.into(),
                policy_factory,
                units: BTreeMap::new(),
                watch_index: HashMap::new(),
                dirty: BTreeSet::new(),
                pending_up: BTreeSet::new(),
                to_watch: Vec::new(),
                to_unwatch: Vec::new(),
                reasons: Vec::new(),
                control,
                down_action,
            },
            options,
            watchdog: None,
        })
    }

    /// Hold a run-path lease in `watchdog` while [`Monitor::run`] loops.
    #[must_use]
    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Names of the units currently monitored.
    pub fn units(&self) -> impl Iterator<Item = &str> {
        self.state.units.keys().map(String::as_str)
    }

    /// Attach to the scan root: every existing unit is registered and
    /// evaluated once. Returns `false` if the down-action asked to stop.
    pub fn start(&mut self) -> Result<bool> {
        fsops::ensure_dir(&self.state.scan_dir)?;
        self.watcher.watch(&self.state.scan_dir)?;
        tracing::info!(scan_dir = %self.state.scan_dir.display(), "monitor started");
        self.cycle(None)
    }

    /// Wait up to `timeout` for events and handle one bounded batch.
    /// Returns `false` if the down-action asked to stop.
    pub fn run_once(&mut self, timeout: Duration) -> Result<bool> {
        if !self.watcher.wait_for_events(timeout) && self.state.pending_up.is_empty() {
            return Ok(true);
        }
        self.cycle(Some(self.options.max_events_per_cycle))
    }

    /// Loop until `shutdown` is set or the down-action stops the monitor,
    /// heartbeating the run-path lease at half its timeout.
    ///
    /// The lease is only removed on a clean exit; an error leaves it to
    /// expire.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let timeout = self.options.watchdog_timeout;
        let lease = match &self.watchdog {
            Some(watchdog) => Some(watchdog.create(
                &self.options.lease_name,
                timeout,
                &format!("{} monitor loop stalled", self.state.scan_dir.display()),
            )?),
            None => None,
        };
        let heartbeat = timeout / 2;

        let mut running = self.start()?;
        while running && !shutdown.load(Ordering::Relaxed) {
            running = self.run_once(heartbeat)?;
            if let Some(lease) = &lease {
                lease.heartbeat()?;
            }
        }
        tracing::info!(stopped_by_action = !running, "monitor loop exiting");
        if let Some(lease) = lease {
            lease.remove()?;
        }
        Ok(())
    }

    fn cycle(&mut self, budget: Option<usize>) -> Result<bool> {
        self.watcher.process_events(&mut self.state, budget)?;
        for path in self.state.to_unwatch.drain(..) {
            self.watcher.unwatch(&path);
        }
        for path in std::mem::take(&mut self.state.to_watch) {
            if let Err(err) = self.watcher.watch(&path) {
                if !err.is_not_found() {
                    return Err(err);
                }
                tracing::debug!(path = %path.display(), "unit vanished before it could be watched");
            }
        }
        self.state.evaluate()
    }
}

impl<C: SupervisorControl> MonitorState<C> {
    fn register(&mut self, dir: &Path, name: &str) -> Result<()> {
        let mut policy = (self.policy_factory)();
        let watch_path = policy.register(dir)?;
        tracing::info!(service = name, watch = %watch_path.display(), "monitoring unit");
        self.watch_index.insert(watch_path.clone(), name.to_string());
        self.to_watch.push(watch_path.clone());
        self.units.insert(
            name.to_string(),
            Unit {
                dir: dir.to_path_buf(),
                watch_path,
                policy,
            },
        );
        self.dirty.insert(name.to_string());
        Ok(())
    }

    fn forget(&mut self, name: &str) {
        if let Some(unit) = self.units.remove(name) {
            tracing::info!(service = name, "unit removed, dropping its policy");
            self.watch_index.remove(&unit.watch_path);
            self.to_unwatch.push(unit.watch_path);
            self.dirty.remove(name);
            self.pending_up.remove(name);
        }
    }

    /// Evaluate every unit touched by the batch once, then escalate.
    fn evaluate(&mut self) -> Result<bool> {
        let mut restarts = std::mem::take(&mut self.pending_up);
        for name in std::mem::take(&mut self.dirty) {
            let Some(unit) = self.units.get_mut(&name) else {
                continue;
            };
            match unit.policy.process()? {
                PolicyOutcome::Noop => {}
                PolicyOutcome::Restart => {
                    restarts.insert(name);
                }
                PolicyOutcome::Fail => {
                    if let Some(reason) = unit.policy.fail_reason() {
                        self.reasons.push(reason.clone());
                    }
                }
            }
        }
        for name in restarts {
            let Some(unit) = self.units.get(&name) else {
                continue;
            };
            tracing::info!(service = %name, "restarting unit");
            match self
                .control
                .control_service(&unit.dir, &[SvcAction::Up], None, None)
            {
                Ok(_) => {}
                Err(err) if err.is_retryable() => {
                    tracing::warn!(service = %name, error = %err, "restart deferred to the next cycle");
                    self.pending_up.insert(name);
                }
                Err(err) => return Err(err),
            }
        }

        if self.reasons.is_empty() {
            return Ok(true);
        }
        let reason = DownReason {
            failures: std::mem::take(&mut self.reasons),
        };
        self.down_action.execute(&reason)
    }
}

fn child_name<'a>(parent: &Path, path: &'a Path) -> Option<&'a str> {
    if path.parent()? != parent {
        return None;
    }
    let name = path.file_name()?.to_str()?;
    (!fsops::is_hidden(name)).then_some(name)
}

impl<C: SupervisorControl> WatchHandler for MonitorState<C> {
    fn on_created(&mut self, path: &Path) -> Result<()> {
        if let Some(name) = child_name(&self.scan_dir, path) {
            if !self.units.contains_key(name) && path.is_dir() {
                let name = name.to_string();
                self.register(path, &name)?;
            }
            return Ok(());
        }
        let owner = path
            .parent()
            .and_then(|parent| self.watch_index.get(parent))
            .cloned();
        if let Some(owner) = owner {
            let visible = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| !fsops::is_hidden(name));
            if visible {
                self.dirty.insert(owner);
            }
        }
        Ok(())
    }

    fn on_deleted(&mut self, path: &Path) -> Result<()> {
        if let Some(name) = child_name(&self.scan_dir, path) {
            let name = name.to_string();
            self.forget(&name);
        }
        Ok(())
    }
}
