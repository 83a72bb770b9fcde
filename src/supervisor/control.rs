//! Control protocol client for the external process supervisor and scanner.
//!
//! Actions are encoded as single flag characters and combined into one
//! invocation, e.g. `s6-svc -kx -wD -T 5000 <dir>`. Exit codes of the control
//! binaries map onto results as follows:
//!
//! | code | meaning                   | result                          |
//! |------|---------------------------|---------------------------------|
//! | 0    | done                      | `Ok(true)`                      |
//! | 99   | wait timed out            | `Ok(false)`                     |
//! | 100  | target not supervised     | `Err(NotSupervised)`            |
//! | 111  | temporarily locked        | retried with jitter, then error |
//! | else | unexpected                | `Err(ControlFailed)`            |

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use rand::Rng as _;

use crate::core::config::SupervisorConfig;
use crate::core::errors::{Result, WardenError};

/// Exit code of a wait that timed out.
pub const EXIT_TIMEOUT: i32 = 99;
/// Exit code when no supervisor runs on the target.
pub const EXIT_NOT_SUPERVISED: i32 = 100;
/// Exit code while the target's control is temporarily locked.
pub const EXIT_LOCKED: i32 = 111;

/// Control actions understood by the process supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SvcAction {
    /// Start the unit and restart it when it dies.
    Up,
    /// Stop the unit and keep it stopped.
    Down,
    /// Send `SIGKILL`.
    Kill,
    /// Make the supervisor exit once the unit is down.
    Exit,
    /// Start the unit without restarting it.
    Once,
    /// Do not restart the unit after it next dies.
    OnceAtMost,
}

impl SvcAction {
    /// Command-line letter.
    #[must_use]
    pub const fn flag(self) -> char {
        match self {
            Self::Up => 'u',
            Self::Down => 'd',
            Self::Kill => 'k',
            Self::Exit => 'x',
            Self::Once => 'o',
            Self::OnceAtMost => 'O',
        }
    }
}

/// States a caller can block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SvcWait {
    /// Wait until the process is started.
    Up,
    /// Wait until the process is dead.
    Down,
    /// Wait until the unit reported readiness.
    ReallyUp,
    /// Wait until the finish script completed.
    ReallyDown,
}

impl SvcWait {
    /// Command-line letter.
    #[must_use]
    pub const fn flag(self) -> char {
        match self {
            Self::Up => 'u',
            Self::Down => 'd',
            Self::ReallyUp => 'U',
            Self::ReallyDown => 'D',
        }
    }
}

/// Control actions understood by the scan-directory scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SvscanAction {
    /// Rescan the directory now.
    Alarm,
    /// Drop supervisors of units that disappeared.
    Nuke,
    /// Stop the scanner.
    Quit,
}

impl SvscanAction {
    /// Command-line letter.
    #[must_use]
    pub const fn flag(self) -> char {
        match self {
            Self::Alarm => 'a',
            Self::Nuke => 'n',
            Self::Quit => 'q',
        }
    }
}

/// Seam between the loops and the supervisor binaries.
pub trait SupervisorControl {
    /// Send `actions` to the unit at `dir`, optionally blocking until `wait`
    /// is satisfied. `Ok(false)` means the wait timed out.
    fn control_service(
        &self,
        dir: &Path,
        actions: &[SvcAction],
        wait: Option<SvcWait>,
        timeout: Option<Duration>,
    ) -> Result<bool>;

    /// Block until one (or `all`) of `dirs` reach `wait`.
    fn wait_service(
        &self,
        dirs: &[PathBuf],
        wait: SvcWait,
        all: bool,
        timeout: Option<Duration>,
    ) -> Result<bool>;

    /// Send `actions` to the scanner of `scan_dir`.
    fn control_svscan(&self, scan_dir: &Path, actions: &[SvscanAction]) -> Result<()>;

    /// Whether a supervisor is attached to `dir`.
    fn is_supervised(&self, dir: &Path) -> Result<bool>;
}

/// Retry policy for "temporarily locked" answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetry {
    /// Give up with [`WardenError::ControlLocked`] after this many attempts;
    /// `None` retries until the lock clears.
    pub attempts: Option<u32>,
    /// Upper bound of the jittered sleep between attempts.
    pub max_sleep: Duration,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            attempts: None,
            max_sleep: Duration::from_secs(1),
        }
    }
}

impl LockRetry {
    fn jitter(&self) -> Duration {
        let ms = u64::try_from(self.max_sleep.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..ms))
    }
}

/// [`SupervisorControl`] backed by the `s6-*` binaries.
#[derive(Debug, Clone, Default)]
pub struct S6Control {
    bin_dir: Option<PathBuf>,
    retry: LockRetry,
    wait_timeout: Option<Duration>,
}

enum Outcome {
    Done,
    TimedOut,
}

impl S6Control {
    /// Control through the binaries in `bin_dir`, or on `PATH` when `None`.
    #[must_use]
    pub fn new(bin_dir: Option<PathBuf>, retry: LockRetry) -> Self {
        Self {
            bin_dir,
            retry,
            wait_timeout: None,
        }
    }

    /// Timeout applied to wait actions whose caller gives none.
    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Control configured from `[supervisor]`.
    #[must_use]
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(
            config.bin_dir.clone(),
            LockRetry {
                attempts: config.lock_retry_attempts,
                max_sleep: config.lock_retry_max_sleep(),
            },
        )
        .with_wait_timeout(config.wait_timeout())
    }

    fn program(&self, name: &str) -> PathBuf {
        self.bin_dir
            .as_ref()
            .map_or_else(|| PathBuf::from(name), |dir| dir.join(name))
    }

    /// Run a control binary, retrying while it reports the target locked.
    fn invoke(&self, program: &str, args: &[String], target: &Path) -> Result<Outcome> {
        let path = self.program(program);
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let status = Command::new(&path)
                .args(args)
                .status()
                .map_err(|err| WardenError::io(&path, err))?;
            match status.code() {
                Some(0) => return Ok(Outcome::Done),
                Some(EXIT_TIMEOUT) => return Ok(Outcome::TimedOut),
                Some(EXIT_NOT_SUPERVISED) => {
                    return Err(WardenError::NotSupervised {
                        path: target.to_path_buf(),
                    });
                }
                Some(EXIT_LOCKED) if self.retry.attempts.is_none_or(|max| attempt < max) => {
                    let pause = self.retry.jitter();
                    tracing::debug!(
                        program,
                        target = %target.display(),
                        attempt,
                        pause_ms = pause.as_millis(),
                        "control target locked, retrying"
                    );
                    std::thread::sleep(pause);
                }
                Some(EXIT_LOCKED) => {
                    return Err(WardenError::ControlLocked {
                        path: target.to_path_buf(),
                        attempts: attempt,
                    });
                }
                code => {
                    return Err(WardenError::ControlFailed {
                        command: format!("{} {}", path.display(), args.join(" ")),
                        code,
                    });
                }
            }
        }
    }
}

fn timeout_args(args: &mut Vec<String>, timeout: Option<Duration>) {
    if let Some(timeout) = timeout {
        args.push("-T".to_string());
        args.push(timeout.as_millis().to_string());
    }
}

/// Encode `svc` actions and an optional wait as `s6-svc` arguments.
#[must_use]
pub fn svc_args(
    dir: &Path,
    actions: &[SvcAction],
    wait: Option<SvcWait>,
    timeout: Option<Duration>,
) -> Vec<String> {
    let mut args = Vec::new();
    if !actions.is_empty() {
        let mut flags = String::from("-");
        for action in actions {
            flags.push(action.flag());
        }
        args.push(flags);
    }
    if let Some(wait) = wait {
        let mut flag = String::from("-w");
        flag.push(wait.flag());
        args.push(flag);
        timeout_args(&mut args, timeout);
    }
    args.push(dir.display().to_string());
    args
}

impl SupervisorControl for S6Control {
    fn control_service(
        &self,
        dir: &Path,
        actions: &[SvcAction],
        wait: Option<SvcWait>,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let args = svc_args(dir, actions, wait, timeout.or(self.wait_timeout));
        match self.invoke("s6-svc", &args, dir)? {
            Outcome::Done => Ok(true),
            Outcome::TimedOut => {
                tracing::info!(dir = %dir.display(), ?wait, "wait for service timed out");
                Ok(false)
            }
        }
    }

    fn wait_service(
        &self,
        dirs: &[PathBuf],
        wait: SvcWait,
        all: bool,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let mut args = vec![if all { "-a" } else { "-o" }.to_string()];
        args.push(format!("-{}", wait.flag()));
        timeout_args(&mut args, timeout.or(self.wait_timeout));
        args.extend(dirs.iter().map(|dir| dir.display().to_string()));
        let target = dirs.first().map_or_else(PathBuf::new, Clone::clone);
        match self.invoke("s6-svwait", &args, &target)? {
            Outcome::Done => Ok(true),
            Outcome::TimedOut => Ok(false),
        }
    }

    fn control_svscan(&self, scan_dir: &Path, actions: &[SvscanAction]) -> Result<()> {
        let mut flags = String::from("-");
        for action in actions {
            flags.push(action.flag());
        }
        let args = vec![flags, scan_dir.display().to_string()];
        match self.invoke("s6-svscanctl", &args, scan_dir)? {
            Outcome::Done => Ok(()),
            Outcome::TimedOut => Err(WardenError::ControlFailed {
                command: format!("s6-svscanctl {}", args.join(" ")),
                code: Some(EXIT_TIMEOUT),
            }),
        }
    }

    fn is_supervised(&self, dir: &Path) -> Result<bool> {
        let path = self.program("s6-svok");
        let status = Command::new(&path)
            .arg(dir)
            .status()
            .map_err(|err| WardenError::io(&path, err))?;
        Ok(status.success())
    }
}
