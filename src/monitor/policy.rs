//! Restart policy: a count-within-interval budget evaluated over a unit's
//! exit log.
//!
//! The unit's `finish` script leaves one empty file per exit under
//! `data/exits/`, named `<timestamp>,<return_code>,<signal>`. Each evaluation
//! reads that log oldest-first and decides:
//!
//! * `limit == 0`: any exit fails the unit;
//! * at most `limit` exits: restart;
//! * otherwise the `(N - limit)`-th exit counted from the oldest is the
//!   cutoff; if it happened less than `interval` before the latest exit the
//!   unit fails, else it restarts and every record older than the `2 * limit`
//!   most recent ones is deleted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::core::errors::{Result, WardenError};
use crate::core::fsops;
use crate::supervisor::service::{self, MonitorPolicyConfig};

/// Decision for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyOutcome {
    /// Nothing new happened.
    Noop,
    /// The unit is within budget and is brought back up.
    Restart,
    /// The budget is exhausted; see [`MonitorPolicy::fail_reason`].
    Fail,
}

/// Why a unit definitively failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailReason {
    /// Unit name.
    pub service: String,
    /// Return code of the exit that exhausted the budget.
    pub return_code: i32,
    /// Signal that ended the process, as reported by the supervisor.
    pub signal: i32,
    /// Exit time in seconds since the epoch.
    pub timestamp: f64,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} exited with return code {} (signal {}) at {:.3}",
            self.service, self.return_code, self.signal, self.timestamp
        )
    }
}

/// A pluggable per-unit policy owned by the monitor loop.
pub trait MonitorPolicy {
    /// Attach to the unit at `service_dir`; returns the directory the
    /// monitor must watch for this unit's termination events.
    fn register(&mut self, service_dir: &Path) -> Result<PathBuf>;

    /// Evaluate the unit after a termination event.
    fn process(&mut self) -> Result<PolicyOutcome>;

    /// Details of the last `Fail` outcome.
    fn fail_reason(&self) -> Option<&FailReason>;
}

/// One entry of a unit's exit log.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitRecord {
    /// Exit time in seconds since the epoch.
    pub timestamp: f64,
    /// Return code reported to the finish script.
    pub return_code: i32,
    /// Terminating signal as reported by the supervisor.
    pub signal: i32,
}

impl ExitRecord {
    /// Parse `<timestamp>,<rc>,<signal>`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.split(',');
        let timestamp = parts.next()?.parse::<f64>().ok()?;
        let return_code = parts.next()?.parse().ok()?;
        let signal = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !timestamp.is_finite() {
            return None;
        }
        Some(Self {
            timestamp,
            return_code,
            signal,
        })
    }

    /// File name under `data/exits/`; zero-padded so names sort by time.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{:014.3},{},{}", self.timestamp, self.return_code, self.signal)
    }
}

/// Count-within-interval restart policy backed by `data/exits/`.
#[derive(Debug)]
pub struct RestartPolicy {
    defaults: MonitorPolicyConfig,
    service: Option<Registration>,
    last_exit: Option<ExitRecord>,
    last_seen: Option<String>,
    fail_reason: Option<FailReason>,
}

#[derive(Debug)]
struct Registration {
    name: String,
    dir: PathBuf,
    exits_dir: PathBuf,
    policy: MonitorPolicyConfig,
}

impl RestartPolicy {
    /// `defaults` apply to units without a `policy.json`.
    #[must_use]
    pub fn new(defaults: MonitorPolicyConfig) -> Self {
        Self {
            defaults,
            service: None,
            last_exit: None,
            last_seen: None,
            fail_reason: None,
        }
    }

    /// Most recent exit seen by the last evaluation.
    #[must_use]
    pub fn last_exit(&self) -> Option<&ExitRecord> {
        self.last_exit.as_ref()
    }

    /// Budget currently in force.
    #[must_use]
    pub fn limits(&self) -> MonitorPolicyConfig {
        self.service.as_ref().map_or(self.defaults, |reg| reg.policy)
    }

    /// Exit log, oldest first, with the file name of each record.
    fn exit_log(exits_dir: &Path) -> Result<Vec<(String, ExitRecord)>> {
        let mut log = Vec::new();
        for name in fsops::list_visible(exits_dir)? {
            match ExitRecord::parse(&name) {
                Some(record) => log.push((name, record)),
                None => tracing::warn!(
                    dir = %exits_dir.display(),
                    file = %name,
                    "ignoring malformed exit record"
                ),
            }
        }
        log.sort_by(|left, right| left.1.timestamp.total_cmp(&right.1.timestamp));
        Ok(log)
    }
}

impl MonitorPolicy for RestartPolicy {
    fn register(&mut self, service_dir: &Path) -> Result<PathBuf> {
        let name = service_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| WardenError::InvalidConfig {
                details: format!("service directory {} has no name", service_dir.display()),
            })?;
        let policy = service::read_monitor_policy(service_dir)?.unwrap_or(self.defaults);
        let exits_dir = service_dir.join(service::DATA_DIR).join(service::EXITS_DIR);
        fsops::ensure_dir(&exits_dir)?;
        tracing::debug!(
            service = %name,
            limit = policy.limit,
            interval = policy.interval,
            "registered restart policy"
        );
        self.service = Some(Registration {
            name,
            dir: service_dir.to_path_buf(),
            exits_dir: exits_dir.clone(),
            policy,
        });
        Ok(exits_dir)
    }

    fn process(&mut self) -> Result<PolicyOutcome> {
        let Some(reg) = self.service.as_mut() else {
            return Err(WardenError::Runtime {
                details: "restart policy evaluated before registration".to_string(),
            });
        };
        // Pick up a re-provisioned budget.
        reg.policy = service::read_monitor_policy(&reg.dir)?.unwrap_or(self.defaults);

        let log = Self::exit_log(&reg.exits_dir)?;
        let Some((last_name, last)) = log.last() else {
            return Ok(PolicyOutcome::Noop);
        };
        if self.last_seen.as_deref() == Some(last_name.as_str()) {
            return Ok(PolicyOutcome::Noop);
        }
        self.last_seen = Some(last_name.clone());
        self.last_exit = Some(last.clone());

        let total = log.len();
        let limit = reg.policy.limit as usize;
        let interval = Duration::from_secs(reg.policy.interval).as_secs_f64();

        let fail = if limit == 0 {
            true
        } else if total <= limit {
            false
        } else {
            let cutoff = &log[total - limit - 1].1;
            cutoff.timestamp + interval > last.timestamp
        };

        if fail {
            let reason = FailReason {
                service: reg.name.clone(),
                return_code: last.return_code,
                signal: last.signal,
                timestamp: last.timestamp,
            };
            tracing::warn!(
                service = %reg.name,
                exits = total,
                limit,
                interval_secs = reg.policy.interval,
                "restart budget exhausted"
            );
            self.fail_reason = Some(reason);
            return Ok(PolicyOutcome::Fail);
        }

        self.fail_reason = None;
        let keep = limit * 2;
        if total > limit && total > keep {
            for (name, _) in &log[..total - keep] {
                fsops::remove_file_if_exists(&reg.exits_dir.join(name))?;
            }
            tracing::debug!(service = %reg.name, removed = total - keep, "trimmed exit log");
        }
        Ok(PolicyOutcome::Restart)
    }

    fn fail_reason(&self) -> Option<&FailReason> {
        self.fail_reason.as_ref()
    }
}
