//! TOML configuration: directory layout, control-protocol tuning, monitor
//! defaults, tombstone bindings and reconciler settings.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, WardenError};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nodewarden/config.toml";

/// Full daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub supervisor: SupervisorConfig,
    pub monitor: MonitorConfig,
    pub tombstones: TombstoneConfig,
    pub reconciler: ReconcilerConfig,
}

/// Node directory layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Scan root of the supervised service tree.
    pub scan_dir: PathBuf,
    /// Where watchdog leases and node-down markers live.
    pub watchdog_dir: PathBuf,
    /// Scan root holding one symlink per running container.
    pub running_dir: PathBuf,
    /// Requested-cleanup directory (symlinks to container dirs).
    pub cleanup_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let root = PathBuf::from("/var/lib/nodewarden");
        Self {
            scan_dir: root.join("init"),
            watchdog_dir: root.join("watchdogs"),
            running_dir: root.join("running"),
            cleanup_dir: root.join("cleanup"),
        }
    }
}

/// External process supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Directory holding the `s6-*` binaries; `None` searches `PATH`.
    pub bin_dir: Option<PathBuf>,
    /// Attempts made while the control socket reports it is locked; unset
    /// retries until the lock clears.
    pub lock_retry_attempts: Option<u32>,
    /// Upper bound of the jittered sleep between locked attempts.
    pub lock_retry_max_sleep_ms: u64,
    /// Timeout applied to wait actions that do not carry their own.
    pub wait_timeout_secs: u64,
    /// Finish-script timeout shared by every unit of a scan root.
    pub finish_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bin_dir: None,
            lock_retry_attempts: None,
            lock_retry_max_sleep_ms: 1_000,
            wait_timeout_secs: 30,
            finish_timeout_ms: 5_000,
        }
    }
}

impl SupervisorConfig {
    #[must_use]
    pub const fn lock_retry_max_sleep(&self) -> Duration {
        Duration::from_millis(self.lock_retry_max_sleep_ms)
    }

    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    #[must_use]
    pub const fn finish_timeout(&self) -> Duration {
        Duration::from_millis(self.finish_timeout_ms)
    }
}

/// Restart-policy monitor defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Exits tolerated inside one interval when a unit has no `policy.json`.
    pub policy_limit: u32,
    pub policy_interval_secs: u64,
    /// Upper bound on events dispatched per loop iteration.
    pub max_events_per_cycle: usize,
    /// Run-path watchdog timeout; the loop heartbeats at half of it.
    pub watchdog_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            policy_limit: 3,
            policy_interval_secs: 60,
            max_events_per_cycle: 64,
            watchdog_timeout_secs: 60,
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub const fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }
}

/// Tombstone directory to action bindings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TombstoneConfig {
    pub bindings: Vec<TombstoneBinding>,
}

/// One tombstone directory handled by one named action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TombstoneBinding {
    pub path: PathBuf,
    pub action: String,
}

/// How requested entries are expressed on disk.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// One symlink per instance, pointing at its backing directory.
    #[default]
    Symlink,
    /// One `<name>.<manifest_extension>` JSON manifest per instance.
    Manifest,
}

/// Reconciler settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub requested_dir: PathBuf,
    /// Scan root the reconciler provisions units into.
    pub actual_dir: PathBuf,
    pub request_kind: RequestKind,
    pub manifest_extension: String,
    /// Command run by provisioned cleanup units; the backing dir is appended.
    pub cleanup_command: Vec<String>,
    /// Command releasing a unit's resources; the backing dir is appended.
    pub finish_command: Vec<String>,
    /// Generous watchdog timeout guarding `finish()`.
    pub finish_watchdog_timeout_secs: u64,
    pub max_events_per_cycle: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        let root = PathBuf::from("/var/lib/nodewarden");
        Self {
            requested_dir: root.join("cleanup"),
            actual_dir: root.join("cleanup_apps"),
            request_kind: RequestKind::Symlink,
            manifest_extension: "json".to_string(),
            cleanup_command: vec!["nwd-cleanup".to_string()],
            finish_command: vec!["nwd-finish".to_string()],
            finish_watchdog_timeout_secs: 300,
            max_events_per_cycle: 64,
        }
    }
}

impl ReconcilerConfig {
    #[must_use]
    pub const fn finish_watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.finish_watchdog_timeout_secs)
    }
}

impl Config {
    /// Load configuration from `path`, or the default location when `None`.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = path.map_or_else(
            || (PathBuf::from(DEFAULT_CONFIG_PATH), false),
            |p| (p.to_path_buf(), true),
        );
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if explicit {
                    return Err(WardenError::MissingConfig { path });
                }
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(err) => return Err(WardenError::io(&path, err)),
        };
        Self::from_toml(&raw)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.supervisor.lock_retry_attempts == Some(0) {
            return Err(invalid("supervisor.lock_retry_attempts must be at least 1"));
        }
        if self.monitor.max_events_per_cycle == 0 || self.reconciler.max_events_per_cycle == 0 {
            return Err(invalid("max_events_per_cycle must be at least 1"));
        }
        if self.monitor.watchdog_timeout_secs < 2 {
            return Err(invalid("monitor.watchdog_timeout_secs must be at least 2"));
        }
        if self.reconciler.finish_watchdog_timeout_secs < self.monitor.watchdog_timeout_secs {
            return Err(invalid(
                "reconciler.finish_watchdog_timeout_secs must not be shorter than the run-path timeout",
            ));
        }
        if self.reconciler.request_kind == RequestKind::Manifest
            && self.reconciler.manifest_extension.trim_start_matches('.').is_empty()
        {
            return Err(invalid("reconciler.manifest_extension must not be empty"));
        }
        if self.reconciler.requested_dir == self.reconciler.actual_dir {
            return Err(invalid(
                "reconciler.requested_dir and reconciler.actual_dir must differ",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for binding in &self.tombstones.bindings {
            if !seen.insert(&binding.path) {
                return Err(invalid(&format!(
                    "tombstone directory {} is bound twice",
                    binding.path.display()
                )));
            }
        }
        Ok(())
    }
}

fn invalid(details: &str) -> WardenError {
    WardenError::InvalidConfig {
        details: details.to_string(),
    }
}
