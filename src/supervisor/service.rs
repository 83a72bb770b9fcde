//! Service model: supervised units and the scan directory that groups them.
//!
//! On-disk layout of one unit under a scan root:
//!
//! ```text
//! <root>/<name>/run              wrapper exec'ing data/app_start
//! <root>/<name>/finish           records the exit, then runs the unit's finish
//! <root>/<name>/down             present => starts stopped
//! <root>/<name>/notification-fd  readiness fd
//! <root>/<name>/timeout-finish   finish timeout in ms
//! <root>/<name>/env/<VAR>        one file per variable
//! <root>/<name>/data/            app_start, policy.json, trace.json, exits/
//! <root>/<name>/log/run          logger run script
//! ```
//!
//! `supervise/` and `event/` belong to the external supervisor and are never
//! written here, so re-provisioning a unit leaves its supervision state alone.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, WardenError};
use crate::core::fsops;

/// Run wrapper.
pub const RUN_FILE: &str = "run";
/// Finish script.
pub const FINISH_FILE: &str = "finish";
/// Marker that keeps the unit stopped.
pub const DOWN_FILE: &str = "down";
/// Readiness fd number.
pub const NOTIFICATION_FD_FILE: &str = "notification-fd";
/// Finish timeout in milliseconds.
pub const TIMEOUT_FINISH_FILE: &str = "timeout-finish";
/// One file per environment variable.
pub const ENV_DIR: &str = "env";
/// Unit data owned by this crate.
pub const DATA_DIR: &str = "data";
/// Logger sub-unit.
pub const LOG_DIR: &str = "log";
/// Exit log under [`DATA_DIR`].
pub const EXITS_DIR: &str = "exits";
/// Program the run wrapper execs.
pub const APP_START_FILE: &str = "app_start";
/// Restart budget.
pub const POLICY_FILE: &str = "policy.json";
/// Trace identity.
pub const TRACE_FILE: &str = "trace.json";
const SVSCAN_CONTROL_DIR: &str = ".s6-svscan";

/// Kind of supervised unit. Only long-running units exist today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// Restarted by the supervisor whenever it dies.
    #[default]
    LongRun,
}

/// Restart budget stored in `data/policy.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorPolicyConfig {
    /// Exits tolerated inside one interval; `0` makes every exit fatal.
    pub limit: u32,
    /// Interval in seconds.
    pub interval: u64,
}

/// Trace identity stored in `data/trace.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Instance the unit belongs to.
    pub instance_id: String,
    /// Identifier unique across restarts of the instance.
    pub unique_id: String,
    /// Service name reported in traces.
    pub service: String,
}

/// A supervised unit as written under a scan root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Directory name under the scan root.
    pub name: String,
    /// Supervision kind.
    pub service_type: ServiceType,
    /// Rendered `run` wrapper.
    pub run_script: String,
    /// Program the wrapper execs, stored as `data/app_start`.
    pub app_run_script: String,
    /// Unit-specific finish commands, appended after the exit is recorded.
    pub finish_script: Option<String>,
    /// Written to `env/`.
    pub environ: BTreeMap<String, String>,
    /// Logger run script, if the unit has a logger.
    pub log_run_script: Option<String>,
    /// Start stopped.
    pub default_down: bool,
    /// Restart budget; monitor defaults apply when `None`.
    pub monitor_policy: Option<MonitorPolicyConfig>,
    /// Trace identity.
    pub trace: Option<TraceConfig>,
    /// Readiness fd.
    pub notification_fd: Option<u32>,
}

/// Everything a caller supplies to provision a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Directory name under the scan root.
    pub name: String,
    /// Program run by the unit.
    pub app_run_script: String,
    /// Run-as user; must resolve on the host.
    pub user: Option<String>,
    /// Environment variables.
    pub environ: BTreeMap<String, String>,
    /// Unit-specific finish commands.
    pub finish_script: Option<String>,
    /// Logger run script.
    pub log_run_script: Option<String>,
    /// Start stopped.
    pub default_down: bool,
    /// Restart budget.
    pub monitor_policy: Option<MonitorPolicyConfig>,
    /// Trace identity.
    pub trace: Option<TraceConfig>,
    /// Readiness fd.
    pub notification_fd: Option<u32>,
}

impl Service {
    /// Write every file of the unit under `root`. Returns whether anything
    /// on disk changed.
    pub fn write(&self, root: &Path, finish_timeout: Duration) -> Result<bool> {
        let dir = root.join(&self.name);
        let data_dir = dir.join(DATA_DIR);
        let env_dir = dir.join(ENV_DIR);
        fsops::ensure_dir(&data_dir.join(EXITS_DIR))?;
        fsops::ensure_dir(&env_dir)?;

        let mut changed = false;
        changed |= fsops::write_script(&dir.join(RUN_FILE), &self.run_script)?;
        changed |= fsops::write_script(&dir.join(FINISH_FILE), &self.render_finish())?;
        changed |= fsops::write_script(&data_dir.join(APP_START_FILE), &self.app_run_script)?;
        changed |= fsops::write_if_changed(
            &dir.join(TIMEOUT_FINISH_FILE),
            format!("{}\n", finish_timeout.as_millis()).as_bytes(),
        )?;

        changed |= if self.default_down {
            fsops::touch(&dir.join(DOWN_FILE))?
        } else {
            fsops::remove_file_if_exists(&dir.join(DOWN_FILE))?
        };

        let fd_file = dir.join(NOTIFICATION_FD_FILE);
        changed |= match self.notification_fd {
            Some(fd) => fsops::write_if_changed(&fd_file, format!("{fd}\n").as_bytes())?,
            None => fsops::remove_file_if_exists(&fd_file)?,
        };

        changed |= write_json_or_remove(&data_dir.join(POLICY_FILE), self.monitor_policy.as_ref())?;
        changed |= write_json_or_remove(&data_dir.join(TRACE_FILE), self.trace.as_ref())?;

        for existing in fsops::list_visible(&env_dir)? {
            if !self.environ.contains_key(&existing) {
                changed |= fsops::remove_file_if_exists(&env_dir.join(&existing))?;
            }
        }
        for (key, value) in &self.environ {
            changed |= fsops::write_if_changed(&env_dir.join(key), value.as_bytes())?;
        }

        if let Some(log_run) = &self.log_run_script {
            let log_dir = dir.join(LOG_DIR);
            fsops::ensure_dir(&log_dir)?;
            changed |= fsops::write_script(&log_dir.join(RUN_FILE), log_run)?;
        }
        Ok(changed)
    }

    /// The `finish` script. The supervisor passes the exit code and the
    /// signal number as `$1` and `$2`.
    fn render_finish(&self) -> String {
        let mut script = String::from(
            "#!/bin/sh\n\
             if [ -d data/exits ]; then\n\
             \x20   touch \"data/exits/$(date +%s.%3N),$1,$2\"\n\
             fi\n",
        );
        if let Some(extra) = &self.finish_script {
            script.push_str(extra);
            if !extra.ends_with('\n') {
                script.push('\n');
            }
        }
        script
    }
}

fn write_json_or_remove<T: Serialize>(path: &Path, value: Option<&T>) -> Result<bool> {
    match value {
        Some(value) => {
            let mut body = serde_json::to_vec_pretty(value)?;
            body.push(b'\n');
            fsops::write_if_changed(path, &body)
        }
        None => fsops::remove_file_if_exists(path),
    }
}

/// Read the unit's restart budget, `None` when it has no `policy.json`.
pub fn read_monitor_policy(service_dir: &Path) -> Result<Option<MonitorPolicyConfig>> {
    let path = service_dir.join(DATA_DIR).join(POLICY_FILE);
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(WardenError::io(&path, err)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|err| WardenError::InvalidPolicy {
            path,
            details: err.to_string(),
        })
}

/// A scan root and the finish timeout shared by all of its units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanDir {
    root: PathBuf,
    finish_timeout: Duration,
}

impl ScanDir {
    /// Scan root at `root`; `finish_timeout` is written into every unit.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, finish_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            finish_timeout,
        }
    }

    /// Scan root path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of unit `name`, whether or not it exists.
    #[must_use]
    pub fn service_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Create the scan root and the scanner's own control directory.
    pub fn write(&self) -> Result<()> {
        let control = self.root.join(SVSCAN_CONTROL_DIR);
        fsops::ensure_dir(&control)?;
        fsops::write_script(&control.join(FINISH_FILE), "#!/bin/sh\nexit 0\n")?;
        Ok(())
    }

    /// Names of the units present under the root, sorted.
    pub fn service_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for name in fsops::list_visible(&self.root)? {
            if self.root.join(&name).is_dir() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// A unit is valid once its `run` script exists.
    #[must_use]
    pub fn is_valid_service(&self, name: &str) -> bool {
        self.service_dir(name).join(RUN_FILE).is_file()
    }

    /// Provision (or re-provision) a unit.
    ///
    /// Fails before touching the disk when the name is unusable or the run-as
    /// user does not resolve.
    pub fn create_service(&self, request: ServiceRequest) -> Result<Service> {
        validate_name("service", &request.name)?;
        for key in request.environ.keys() {
            validate_name("environment variable", key)?;
        }
        if let Some(user) = &request.user {
            resolve_user(user)?;
        }

        let service = Service {
            run_script: render_run(request.user.as_deref()),
            name: request.name,
            service_type: ServiceType::LongRun,
            app_run_script: request.app_run_script,
            finish_script: request.finish_script,
            environ: request.environ,
            log_run_script: request.log_run_script,
            default_down: request.default_down,
            monitor_policy: request.monitor_policy,
            trace: request.trace,
            notification_fd: request.notification_fd,
        };
        let changed = service.write(&self.root, self.finish_timeout)?;
        tracing::debug!(
            root = %self.root.display(),
            service = %service.name,
            changed,
            "provisioned service"
        );
        Ok(service)
    }

    /// Remove a unit's directory. Returns `false` if it was already gone.
    pub fn remove_service(&self, name: &str) -> Result<bool> {
        validate_name("service", name)?;
        fsops::remove_dir_all_if_exists(&self.service_dir(name))
    }
}

fn render_run(user: Option<&str>) -> String {
    let setuid = user.map_or_else(String::new, |user| format!(" s6-setuidgid {user}"));
    format!("#!/bin/sh\nexec 2>&1\nexec s6-envdir ./{ENV_DIR}{setuid} ./{DATA_DIR}/{APP_START_FILE}\n")
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || fsops::is_hidden(name) {
        return Err(WardenError::InvalidConfig {
            details: format!("invalid {what} name {name:?}"),
        });
    }
    Ok(())
}

/// Check that `user` exists on this host.
#[cfg(unix)]
pub fn resolve_user(user: &str) -> Result<()> {
    match nix::unistd::User::from_name(user) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(WardenError::UnknownUser {
            user: user.to_string(),
        }),
        Err(errno) => {
            tracing::warn!(user, error = %errno, "user lookup failed");
            Err(WardenError::UnknownUser {
                user: user.to_string(),
            })
        }
    }
}

/// Check that `user` exists on this host.
#[cfg(not(unix))]
pub fn resolve_user(user: &str) -> Result<()> {
    Err(WardenError::UnsupportedPlatform {
        details: format!("cannot resolve user {user} on this platform"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(name: &str) -> ServiceRequest {
        ServiceRequest {
            name: name.to_string(),
            app_run_script: "#!/bin/sh\nexec sleep 1000\n".to_string(),
            environ: BTreeMap::from([("APP".to_string(), "web".to_string())]),
            monitor_policy: Some(MonitorPolicyConfig {
                limit: 3,
                interval: 30,
            }),
            ..ServiceRequest::default()
        }
    }

    fn scan_dir(tmp: &TempDir) -> ScanDir {
        let scan = ScanDir::new(tmp.path().join("scan"), Duration::from_secs(5));
        scan.write().unwrap();
        scan
    }

    #[test]
    fn create_service_writes_layout() {
        let tmp = TempDir::new().unwrap();
        let scan = scan_dir(&tmp);
        let mut req = request("web");
        req.default_down = true;
        req.notification_fd = Some(3);
        req.log_run_script = Some("#!/bin/sh\nexec s6-log ./main\n".to_string());
        scan.create_service(req).unwrap();

        let dir = scan.service_dir("web");
        assert!(dir.join(RUN_FILE).is_file());
        assert!(dir.join(FINISH_FILE).is_file());
        assert!(dir.join(DOWN_FILE).is_file());
        assert_eq!(std::fs::read_to_string(dir.join(NOTIFICATION_FD_FILE)).unwrap(), "3\n");
        assert_eq!(std::fs::read_to_string(dir.join(TIMEOUT_FINISH_FILE)).unwrap(), "5000\n");
        assert_eq!(std::fs::read_to_string(dir.join("env/APP")).unwrap(), "web");
        assert!(dir.join("data/exits").is_dir());
        assert!(dir.join("log/run").is_file());
        assert_eq!(
            read_monitor_policy(&dir).unwrap(),
            Some(MonitorPolicyConfig {
                limit: 3,
                interval: 30
            })
        );
        assert!(scan.is_valid_service("web"));
        assert_eq!(scan.service_names().unwrap(), vec!["web"]);
    }

    #[test]
    fn reprovisioning_rewrites_config_but_keeps_supervise_state() {
        let tmp = TempDir::new().unwrap();
        let scan = scan_dir(&tmp);
        scan.create_service(request("web")).unwrap();
        let dir = scan.service_dir("web");
        std::fs::create_dir(dir.join("supervise")).unwrap();
        std::fs::write(dir.join("supervise/status"), "up").unwrap();

        let mut again = request("web");
        again.environ = BTreeMap::from([("OTHER".to_string(), "1".to_string())]);
        again.monitor_policy = None;
        scan.create_service(again).unwrap();

        assert!(!dir.join("env/APP").exists());
        assert_eq!(std::fs::read_to_string(dir.join("env/OTHER")).unwrap(), "1");
        assert!(read_monitor_policy(&dir).unwrap().is_none());
        assert_eq!(std::fs::read_to_string(dir.join("supervise/status")).unwrap(), "up");
    }

    #[test]
    fn identical_reprovisioning_changes_nothing() {
        let tmp = TempDir::new().unwrap();
        let scan = scan_dir(&tmp);
        let service = scan.create_service(request("web")).unwrap();
        assert!(!service.write(scan.root(), Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn unknown_user_fails_before_writing() {
        let tmp = TempDir::new().unwrap();
        let scan = scan_dir(&tmp);
        let mut req = request("web");
        req.user = Some("no-such-user-nodewarden-test".to_string());
        let err = scan.create_service(req).unwrap_err();
        assert!(matches!(err, WardenError::UnknownUser { .. }));
        assert!(!scan.service_dir("web").exists());
    }

    #[test]
    fn run_script_switches_user_when_requested() {
        assert!(render_run(Some("proid")).contains("s6-setuidgid proid ./data/app_start"));
        assert!(!render_run(None).contains("s6-setuidgid"));
    }

    #[test]
    fn malformed_policy_is_a_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("svc");
        std::fs::create_dir_all(dir.join(DATA_DIR)).unwrap();
        std::fs::write(dir.join(DATA_DIR).join(POLICY_FILE), "{\"limit\": \"x\"}").unwrap();
        let err = read_monitor_policy(&dir).unwrap_err();
        assert_eq!(err.code(), "NWD-1102");
    }

    #[test]
    fn hidden_and_nested_names_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let scan = scan_dir(&tmp);
        assert!(scan.create_service(request(".tmp")).is_err());
        assert!(scan.create_service(request("a/b")).is_err());
        assert!(scan.service_names().unwrap().is_empty());
    }

    #[test]
    fn remove_service_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let scan = scan_dir(&tmp);
        scan.create_service(request("web")).unwrap();
        assert!(scan.remove_service("web").unwrap());
        assert!(!scan.remove_service("web").unwrap());
    }
}
