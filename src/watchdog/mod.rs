//! Heartbeat leases stored as files.
//!
//! A lease is a file named after the lease whose body is the timeout string
//! followed by a free-text description, and whose mtime is the deadline. An
//! external reaper lists the directory and treats any lease whose deadline
//! has passed as a node failure. Node-down markers are simply leases created
//! with a zero timeout.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use regex::Regex;

use crate::core::errors::{Result, WardenError};
use crate::core::fsops;

static TIMEOUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*(ms|s|m|h)?\s*$").expect("timeout pattern is valid")
});

/// Parse `"300s"`, `"500ms"`, `"5m"`, `"1h"` or bare seconds.
pub fn parse_timeout(raw: &str) -> Result<Duration> {
    let invalid = || WardenError::InvalidConfig {
        details: format!("invalid timeout {raw:?}"),
    };
    let caps = TIMEOUT_RE.captures(raw).ok_or_else(invalid)?;
    let value: u64 = caps[1].parse().map_err(|_| invalid())?;
    let duration = match caps.get(2).map(|m| m.as_str()) {
        Some("ms") => Duration::from_millis(value),
        Some("m") => Duration::from_secs(value.saturating_mul(60)),
        Some("h") => Duration::from_secs(value.saturating_mul(3600)),
        _ => Duration::from_secs(value),
    };
    Ok(duration)
}

/// Inverse of [`parse_timeout`]; whole seconds render as `"<n>s"`.
#[must_use]
pub fn format_timeout(timeout: Duration) -> String {
    if timeout.subsec_millis() == 0 {
        format!("{}s", timeout.as_secs())
    } else {
        format!("{}ms", timeout.as_millis())
    }
}

/// Directory of leases.
#[derive(Debug, Clone)]
pub struct Watchdog {
    dir: PathBuf,
}

/// A live lease. Dropping it does not remove the file: only an explicit
/// [`Lease::remove`] tells the reaper the owner shut down cleanly.
#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    name: String,
    timeout: Duration,
    body: String,
}

/// A lease whose deadline passed, as seen by the reaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredLease {
    /// Lease file name.
    pub name: String,
    /// Timeout the lease was created with.
    pub timeout: String,
    /// Failure description written by the owner.
    pub content: String,
    /// When the lease expired.
    pub deadline: SystemTime,
}

impl Watchdog {
    /// Leases live directly under `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Lease directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create (or take over) the lease `name` with a deadline `timeout` from now.
    pub fn create(&self, name: &str, timeout: Duration, content: &str) -> Result<Lease> {
        if name.is_empty() || name.contains('/') || fsops::is_hidden(name) {
            return Err(WardenError::InvalidConfig {
                details: format!("invalid watchdog name {name:?}"),
            });
        }
        fsops::ensure_dir(&self.dir)?;
        let lease = Lease {
            path: self.dir.join(name),
            name: name.to_string(),
            timeout,
            body: format!("{}\n{content}", format_timeout(timeout)),
        };
        fsops::write_atomic(&lease.path, lease.body.as_bytes())?;
        lease.push_deadline()?;
        tracing::debug!(lease = name, timeout = %format_timeout(timeout), "watchdog lease created");
        Ok(lease)
    }

    /// Reaper scan: every lease whose deadline is at or before `now`.
    pub fn expired(&self, now: SystemTime) -> Result<Vec<ExpiredLease>> {
        let now = FileTime::from_system_time(now);
        let mut expired = Vec::new();
        for name in fsops::list_visible(&self.dir)? {
            let path = self.dir.join(&name);
            let meta = match std::fs::metadata(&path) {
                Ok(meta) => meta,
                // Removed between listing and stat.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(WardenError::io(&path, err)),
            };
            let deadline = FileTime::from_last_modification_time(&meta);
            if deadline > now {
                continue;
            }
            let body = match std::fs::read_to_string(&path) {
                Ok(body) => body,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(WardenError::io(&path, err)),
            };
            let (timeout, content) = body.split_once('\n').unwrap_or((body.as_str(), ""));
            expired.push(ExpiredLease {
                name,
                timeout: timeout.to_string(),
                content: content.to_string(),
                deadline: meta.modified().map_err(|err| WardenError::io(&path, err))?,
            });
        }
        Ok(expired)
    }
}

impl Lease {
    /// Lease file name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Time granted by each heartbeat.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Move the deadline to `timeout` from now. A lease file removed behind
    /// our back is recreated.
    pub fn heartbeat(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::warn!(lease = %self.name, "watchdog lease vanished, recreating");
            fsops::write_atomic(&self.path, self.body.as_bytes())?;
        }
        self.push_deadline()
    }

    /// Cancel monitoring of this lease.
    pub fn remove(self) -> Result<()> {
        fsops::remove_file_if_exists(&self.path)?;
        tracing::debug!(lease = %self.name, "watchdog lease removed");
        Ok(())
    }

    fn push_deadline(&self) -> Result<()> {
        let deadline = SystemTime::now() + self.timeout;
        filetime::set_file_mtime(&self.path, FileTime::from_system_time(deadline))
            .map_err(|err| WardenError::io(&self.path, err))
    }
}
