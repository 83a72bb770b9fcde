//! Daemon entry points: build each loop from configuration and run it until a
//! termination signal arrives.

pub mod signals;

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::monitor::tombstone::{ActionContext, ActionRegistry, TombstoneMonitor};
use crate::monitor::{Monitor, MonitorOptions, MonitorPolicy, NodeDown, RestartPolicy};
use crate::reconcile::{self, CommandRuntime, Reconciler, ReconcilerOptions};
use crate::supervisor::control::S6Control;
use crate::supervisor::service::{MonitorPolicyConfig, ScanDir};
use crate::watchdog::Watchdog;

pub use signals::SignalFlags;

/// Run the restart-policy monitor over `scan_dir` (the configured scan root
/// when `None`).
pub fn run_monitor(config: &Config, scan_dir: Option<PathBuf>, flags: &SignalFlags) -> Result<()> {
    let scan_dir = scan_dir.unwrap_or_else(|| config.paths.scan_dir.clone());
    let watchdog = Watchdog::new(&config.paths.watchdog_dir);
    let defaults = MonitorPolicyConfig {
        limit: config.monitor.policy_limit,
        interval: config.monitor.policy_interval_secs,
    };
    let lease_name = format!("monitor-{}", lease_suffix(&scan_dir));
    let mut monitor = Monitor::new(
        &scan_dir,
        Box::new(move || Box::new(RestartPolicy::new(defaults)) as Box<dyn MonitorPolicy>),
        Box::new(NodeDown::new(watchdog.clone())),
        S6Control::from_config(&config.supervisor),
        MonitorOptions::from_config(&config.monitor, &lease_name),
    )?
    .with_watchdog(watchdog);
    monitor.run(flags.shutdown())
}

/// Run the tombstone dispatch loop. `SIGHUP` re-reads the bindings from
/// `config_path`.
pub fn run_tombstones(config_path: Option<&Path>, config: &Config, flags: &SignalFlags) -> Result<()> {
    let ctx = ActionContext::new(
        &config.paths,
        Rc::new(S6Control::from_config(&config.supervisor)),
    );
    let watchdog = ctx.watchdog.clone();
    let mut monitor = TombstoneMonitor::new(
        &config.tombstones.bindings,
        ActionRegistry::with_builtin(),
        ctx,
        config.monitor.max_events_per_cycle,
    )?;

    let timeout = config.monitor.watchdog_timeout();
    let lease = watchdog.create("tombstones", timeout, "tombstone dispatch stalled")?;
    monitor.start()?;
    while !flags.shutdown().load(std::sync::atomic::Ordering::Relaxed) {
        if flags.take_reload() {
            let fresh = Config::load(config_path)?;
            monitor.reload(&fresh.tombstones.bindings)?;
        }
        monitor.run_once(timeout / 2)?;
        lease.heartbeat()?;
    }
    lease.remove()
}

/// Build the reconciler configured under `[reconciler]`.
pub fn build_reconciler(config: &Config) -> Result<Reconciler<S6Control>> {
    let settings = &config.reconciler;
    Reconciler::new(
        &settings.requested_dir,
        ScanDir::new(&settings.actual_dir, config.supervisor.finish_timeout()),
        reconcile::provisioner_for(settings),
        Box::new(CommandRuntime::new(settings.finish_command.clone())),
        S6Control::from_config(&config.supervisor),
        Watchdog::new(&config.paths.watchdog_dir),
        ReconcilerOptions::from_config(settings, config.monitor.watchdog_timeout()),
    )
}

/// Run the reconciler until shutdown.
pub fn run_reconciler(config: &Config, flags: &SignalFlags) -> Result<()> {
    build_reconciler(config)?.run(flags.shutdown())
}

/// Leases in the watchdog directory whose deadline passed `grace` ago.
pub fn stale_leases(config: &Config, grace: Duration) -> Result<Vec<crate::watchdog::ExpiredLease>> {
    let now = std::time::SystemTime::now()
        .checked_sub(grace)
        .unwrap_or(std::time::UNIX_EPOCH);
    Watchdog::new(&config.paths.watchdog_dir).expired(now)
}

fn lease_suffix(dir: &Path) -> String {
    dir.file_name()
        .map_or_else(|| "root".to_string(), |name| name.to_string_lossy().into_owned())
}
