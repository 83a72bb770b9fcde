//! Requested/actual convergence.
//!
//! The requested directory declares which units should exist (one symlink or
//! manifest per instance); the actual directory is a scan root holding the
//! provisioned units. [`Reconciler::sync`] makes the latter match the former
//! and the watch loop keeps it that way entry by entry.

pub mod provision;
pub mod runtime;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::core::config::{ReconcilerConfig, RequestKind};
use crate::core::errors::{Result, WardenError};
use crate::core::fsops;
use crate::supervisor::control::{SupervisorControl, SvscanAction};
use crate::supervisor::service::ScanDir;
use crate::watchdog::Watchdog;
use crate::watcher::{DirWatcher, WatchHandler};

pub use provision::{ManifestProvisioner, SymlinkProvisioner, UnitProvisioner};
pub use runtime::{CommandRuntime, FinishError, Runtime};

/// Build the provisioner matching the configured request kind.
#[must_use]
pub fn provisioner_for(config: &ReconcilerConfig) -> Box<dyn UnitProvisioner> {
    match config.request_kind {
        RequestKind::Symlink => Box::new(SymlinkProvisioner::new(config.cleanup_command.clone())),
        RequestKind::Manifest => Box::new(ManifestProvisioner::new(&config.manifest_extension)),
    }
}

/// Loop tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Upper bound on events handled per batch.
    pub max_events_per_cycle: usize,
    /// Run-path lease timeout.
    pub watchdog_timeout: Duration,
    /// Lease timeout guarding each `finish()`.
    pub finish_timeout: Duration,
    /// Name of the run-path lease.
    pub lease_name: String,
}

impl ReconcilerOptions {
    /// Options from `[reconciler]` with the given run-path timeout.
    #[must_use]
    pub fn from_config(config: &ReconcilerConfig, watchdog_timeout: Duration) -> Self {
        Self {
            max_events_per_cycle: config.max_events_per_cycle,
            watchdog_timeout,
            finish_timeout: config.finish_watchdog_timeout(),
            lease_name: "reconciler".to_string(),
        }
    }
}

/// What one full sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Units provisioned.
    pub created: Vec<String>,
    /// Units torn down.
    pub removed: Vec<String>,
}

impl SyncReport {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty()
    }
}

struct Convergence<C> {
    requested_dir: PathBuf,
    scan: ScanDir,
    provisioner: Box<dyn UnitProvisioner>,
    runtime: Box<dyn Runtime>,
    control: C,
    watchdog: Watchdog,
    finish_timeout: Duration,
    /// A scanner notification was refused while locked.
    rescan_pending: bool,
}

/// Keeps a scan root in line with a requested directory.
pub struct Reconciler<C: SupervisorControl> {
    watcher: DirWatcher,
    inner: Convergence<C>,
    options: ReconcilerOptions,
}

impl<C: SupervisorControl> Reconciler<C> {
    /// Reconciler over `requested_dir` and `scan`; nothing is watched until [`Reconciler::start`].
    pub fn new(
        requested_dir: impl Into<PathBuf>,
        scan: ScanDir,
        provisioner: Box<dyn UnitProvisioner>,
        runtime: Box<dyn Runtime>,
        control: C,
        watchdog: Watchdog,
        options: ReconcilerOptions,
    ) -> Result<Self> {
        Ok(Self {
            watcher: DirWatcher::new()?,
            inner: Convergence {
                requested_dir: requested_dir.into(),
                scan,
                provisioner,
                runtime,
                control,
                watchdog,
                finish_timeout: options.finish_timeout,
                rescan_pending: false,
            },
            options,
        })
    }

    /// Provision `name` if it is requested and not already a valid unit.
    /// Returns whether a unit was created.
    pub fn ensure_present(&mut self, name: &str) -> Result<bool> {
        self.inner.ensure_present(name)
    }

    /// Tear `name` down and drop its request. Returns whether a unit existed.
    pub fn ensure_absent(&mut self, name: &str) -> Result<bool> {
        self.inner.ensure_absent(name)
    }

    /// Full pass over both directories.
    pub fn sync(&mut self) -> Result<SyncReport> {
        self.inner.sync()
    }

    /// Prepare both directories, watch the requested one and run a full sync.
    pub fn start(&mut self) -> Result<SyncReport> {
        fsops::ensure_dir(&self.inner.requested_dir)?;
        self.inner.scan.write()?;
        self.watcher.watch(&self.inner.requested_dir)?;
        let report = self.inner.sync()?;
        tracing::info!(
            requested = %self.inner.requested_dir.display(),
            actual = %self.inner.scan.root().display(),
            created = report.created.len(),
            removed = report.removed.len(),
            "reconciler started"
        );
        Ok(report)
    }

    /// Handle one bounded batch of requested-directory events, then retry a
    /// scanner notification deferred by lock contention.
    pub fn run_once(&mut self, timeout: Duration) -> Result<usize> {
        let dispatched = if self.watcher.wait_for_events(timeout) {
            self.watcher
                .process_events(&mut self.inner, Some(self.options.max_events_per_cycle))?
        } else {
            0
        };
        self.inner.retry_rescan()?;
        Ok(dispatched)
    }

    /// Loop until `shutdown` is set, heartbeating a run-path lease.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let timeout = self.options.watchdog_timeout;
        let lease = self.inner.watchdog.create(
            &self.options.lease_name,
            timeout,
            &format!("{} reconciler stalled", self.inner.requested_dir.display()),
        )?;
        self.start()?;
        while !shutdown.load(Ordering::Relaxed) {
            self.run_once(timeout / 2)?;
            lease.heartbeat()?;
        }
        tracing::info!("reconciler exiting");
        lease.remove()
    }
}

impl<C: SupervisorControl> Convergence<C> {
    fn requested_names(&self) -> Result<BTreeSet<String>> {
        Ok(fsops::list_visible(&self.requested_dir)?
            .iter()
            .filter_map(|entry| self.provisioner.instance_name(entry))
            .collect())
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.requested_dir.join(self.provisioner.entry_name(name))
    }

    fn sync(&mut self) -> Result<SyncReport> {
        let requested = self.requested_names()?;
        let actual: BTreeSet<String> = self.scan.service_names()?.into_iter().collect();
        let mut report = SyncReport::default();

        for name in &requested {
            match self.ensure_present(name) {
                Ok(true) => report.created.push(name.clone()),
                Ok(false) => {}
                Err(err) if is_bad_request(&err) => {
                    tracing::error!(instance = %name, error = %err, "skipping unusable request");
                }
                Err(err) => return Err(err),
            }
        }
        for name in actual.difference(&requested) {
            if self.ensure_absent(name)? {
                report.removed.push(name.clone());
            }
        }
        Ok(report)
    }

    fn ensure_present(&mut self, name: &str) -> Result<bool> {
        let entry = self.entry_path(name);
        if !fsops::entry_exists(&entry) {
            tracing::debug!(instance = name, "request withdrawn before provisioning");
            return Ok(false);
        }
        if self.scan.is_valid_service(name) {
            return Ok(false);
        }
        let unit_dir = self.scan.service_dir(name);
        if fsops::entry_exists(&unit_dir) {
            tracing::warn!(instance = name, "replacing incomplete unit");
            self.scan.remove_service(name)?;
        }

        let request = self.provisioner.service_request(name, &entry, &unit_dir)?;
        self.scan.create_service(request)?;
        self.notify_scanner(&[SvscanAction::Alarm])?;
        tracing::info!(instance = name, "unit provisioned");
        Ok(true)
    }

    fn ensure_absent(&mut self, name: &str) -> Result<bool> {
        let unit_dir = self.scan.service_dir(name);
        let existed = fsops::entry_exists(&unit_dir);
        if existed {
            if let Some(backing) = provision::backing_dir(&unit_dir)? {
                self.finish(name, &backing)?;
            }
            self.scan.remove_service(name)?;
            self.notify_scanner(&[SvscanAction::Alarm, SvscanAction::Nuke])?;
            tracing::info!(instance = name, "unit torn down");
        }
        // Last, so an interrupted teardown is retried from the request.
        fsops::remove_file_if_exists(&self.entry_path(name))?;
        Ok(existed)
    }

    /// Ask the scanner to pick up changes. A locked scanner is asked again by
    /// the next loop iteration instead of failing the caller.
    fn notify_scanner(&mut self, actions: &[SvscanAction]) -> Result<()> {
        match self.control.control_svscan(self.scan.root(), actions) {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => {
                tracing::warn!(error = %err, "scanner notification deferred to the next cycle");
                self.rescan_pending = true;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn retry_rescan(&mut self) -> Result<()> {
        if std::mem::take(&mut self.rescan_pending) {
            self.notify_scanner(&[SvscanAction::Alarm, SvscanAction::Nuke])?;
        }
        Ok(())
    }

    /// Release the unit's resources under a finish-path lease. The lease is
    /// left to expire when the failure is fatal.
    fn finish(&self, name: &str, backing: &Path) -> Result<()> {
        let lease = self.watchdog.create(
            &format!("finish-{name}"),
            self.finish_timeout,
            &format!("finish of {name} on {} stalled", backing.display()),
        )?;
        match self.runtime.finish(backing) {
            Ok(()) => {
                tracing::info!(instance = name, backing = %backing.display(), "resources released");
            }
            Err(FinishError::InvalidDirectory(dir)) => {
                tracing::info!(instance = name, dir = %dir.display(), "backing directory already gone");
            }
            Err(FinishError::Failed(details)) if !backing.exists() => {
                tracing::info!(instance = name, %details, "finish failed but backing directory is gone");
            }
            Err(FinishError::Failed(details)) => {
                tracing::error!(instance = name, backing = %backing.display(), %details, "finish failed");
                return Err(WardenError::FinishFailed {
                    name: name.to_string(),
                    details,
                });
            }
        }
        lease.remove()
    }
}

fn is_bad_request(err: &WardenError) -> bool {
    matches!(
        err,
        WardenError::InvalidConfig { .. }
            | WardenError::ConfigParse { .. }
            | WardenError::UnknownUser { .. }
    )
}

impl<C: SupervisorControl> Convergence<C> {
    fn provision_at(&mut self, path: &Path) -> Result<()> {
        let Some(name) = self.instance_at(path) else {
            return Ok(());
        };
        match self.ensure_present(&name) {
            Err(err) if is_bad_request(&err) => {
                tracing::error!(instance = %name, error = %err, "skipping unusable request");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}

impl<C: SupervisorControl> WatchHandler for Convergence<C> {
    fn on_created(&mut self, path: &Path) -> Result<()> {
        self.provision_at(path)
    }

    /// A request may still be half written when its creation is seen; the
    /// write that completes it is retried here.
    fn on_modified(&mut self, path: &Path) -> Result<()> {
        self.provision_at(path)
    }

    fn on_deleted(&mut self, path: &Path) -> Result<()> {
        match self.instance_at(path) {
            Some(name) => self.ensure_absent(&name).map(|_| ()),
            None => Ok(()),
        }
    }
}

impl<C> Convergence<C> {
    fn instance_at(&self, path: &Path) -> Option<String> {
        if path.parent()? != self.requested_dir {
            return None;
        }
        self.provisioner.instance_name(path.file_name()?.to_str()?)
    }
}
