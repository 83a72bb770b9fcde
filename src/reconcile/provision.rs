//! Turning requested entries into unit definitions.
//!
//! Both provisioners record the unit's backing directory in the unit's
//! environment as [`BACKING_DIR_VAR`], which is where teardown finds it again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::errors::{Result, WardenError};
use crate::core::fsops;
use crate::supervisor::service::{
    DATA_DIR, ENV_DIR, MonitorPolicyConfig, ServiceRequest, TraceConfig,
};

/// Environment variable holding a unit's backing directory.
pub const BACKING_DIR_VAR: &str = "NWD_BACKING_DIR";

/// Maps requested entries to units.
pub trait UnitProvisioner {
    /// Instance declared by the requested entry `entry`, if it is a request.
    fn instance_name(&self, entry: &str) -> Option<String>;

    /// File name of the requested entry for `instance`.
    fn entry_name(&self, instance: &str) -> String;

    /// Build the unit for `instance`. `entry` is the requested entry path and
    /// `unit_dir` where the unit will live.
    fn service_request(&self, instance: &str, entry: &Path, unit_dir: &Path)
    -> Result<ServiceRequest>;
}

/// Backing directory recorded in a provisioned unit, if any.
pub fn backing_dir(unit_dir: &Path) -> Result<Option<PathBuf>> {
    let path = unit_dir.join(ENV_DIR).join(BACKING_DIR_VAR);
    match std::fs::read_to_string(&path) {
        Ok(raw) => {
            let raw = raw.lines().next().unwrap_or_default().trim();
            Ok((!raw.is_empty()).then(|| PathBuf::from(raw)))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(WardenError::io(&path, err)),
    }
}

/// Requested entries are symlinks to the directory a cleanup unit works on.
#[derive(Debug, Clone)]
pub struct SymlinkProvisioner {
    cleanup_command: Vec<String>,
}

impl SymlinkProvisioner {
    /// Units run `cleanup_command` on the symlink target.
    #[must_use]
    pub fn new(cleanup_command: Vec<String>) -> Self {
        Self { cleanup_command }
    }
}

impl UnitProvisioner for SymlinkProvisioner {
    fn instance_name(&self, entry: &str) -> Option<String> {
        (!fsops::is_hidden(entry)).then(|| entry.to_string())
    }

    fn entry_name(&self, instance: &str) -> String {
        instance.to_string()
    }

    fn service_request(
        &self,
        instance: &str,
        entry: &Path,
        _unit_dir: &Path,
    ) -> Result<ServiceRequest> {
        let target = fsops::read_link_if_exists(entry)?.ok_or_else(|| {
            WardenError::InvalidConfig {
                details: format!("requested entry {} is not a symlink", entry.display()),
            }
        })?;
        let target = if target.is_relative() {
            entry.parent().map_or(target.clone(), |parent| parent.join(&target))
        } else {
            target
        };

        let mut command = self
            .cleanup_command
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        if command.is_empty() {
            return Err(WardenError::InvalidConfig {
                details: "cleanup command is empty".to_string(),
            });
        }
        command.push_str(&format!(" \"${BACKING_DIR_VAR}\""));

        Ok(ServiceRequest {
            name: instance.to_string(),
            app_run_script: format!("#!/bin/sh\nexec {command}\n"),
            environ: BTreeMap::from([(
                BACKING_DIR_VAR.to_string(),
                target.display().to_string(),
            )]),
            ..ServiceRequest::default()
        })
    }
}

/// On-disk manifest of a requested unit.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    command: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    environ: BTreeMap<String, String>,
    #[serde(default)]
    finish: Option<String>,
    #[serde(default)]
    log_run: Option<String>,
    #[serde(default)]
    down: bool,
    #[serde(default)]
    monitor_policy: Option<MonitorPolicyConfig>,
    #[serde(default)]
    trace: Option<TraceConfig>,
    #[serde(default)]
    notification_fd: Option<u32>,
    #[serde(default)]
    backing_dir: Option<PathBuf>,
}

/// Requested entries are `<name>.<extension>` JSON manifests.
#[derive(Debug, Clone)]
pub struct ManifestProvisioner {
    suffix: String,
}

impl ManifestProvisioner {
    /// Requests are files ending in `.<extension>`.
    #[must_use]
    pub fn new(extension: &str) -> Self {
        Self {
            suffix: format!(".{}", extension.trim_start_matches('.')),
        }
    }
}

impl UnitProvisioner for ManifestProvisioner {
    fn instance_name(&self, entry: &str) -> Option<String> {
        if fsops::is_hidden(entry) {
            return None;
        }
        entry
            .strip_suffix(&self.suffix)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }

    fn entry_name(&self, instance: &str) -> String {
        format!("{instance}{}", self.suffix)
    }

    fn service_request(
        &self,
        instance: &str,
        entry: &Path,
        unit_dir: &Path,
    ) -> Result<ServiceRequest> {
        let raw = std::fs::read(entry).map_err(|err| WardenError::io(entry, err))?;
        let manifest: Manifest =
            serde_json::from_slice(&raw).map_err(|err| WardenError::ConfigParse {
                context: "manifest",
                details: format!("{}: {err}", entry.display()),
            })?;

        let backing = manifest
            .backing_dir
            .unwrap_or_else(|| unit_dir.join(DATA_DIR));
        let mut environ = manifest.environ;
        environ.insert(BACKING_DIR_VAR.to_string(), backing.display().to_string());

        Ok(ServiceRequest {
            name: instance.to_string(),
            app_run_script: format!("#!/bin/sh\nexec {}\n", manifest.command),
            user: manifest.user,
            environ,
            finish_script: manifest.finish,
            log_run_script: manifest.log_run,
            default_down: manifest.down,
            monitor_policy: manifest.monitor_policy,
            trace: manifest.trace,
            notification_fd: manifest.notification_fd,
        })
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
