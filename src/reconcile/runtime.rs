//! Resource release for torn-down units.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

/// Why `finish()` did not complete.
#[derive(Debug, Error)]
pub enum FinishError {
    /// The backing directory is missing or not a directory.
    #[error("invalid backing directory {0}")]
    InvalidDirectory(PathBuf),

    /// Release failed; carries the runtime's diagnostics.
    #[error("{0}")]
    Failed(String),
}

/// Releases whatever a unit's backing directory holds on to.
pub trait Runtime {
    /// Release every resource held on behalf of `dir`.
    fn finish(&self, dir: &Path) -> Result<(), FinishError>;
}

/// Runs an external program with the backing directory appended to its
/// arguments.
#[derive(Debug, Clone)]
pub struct CommandRuntime {
    command: Vec<String>,
}

impl CommandRuntime {
    /// Run `command` with the backing directory appended.
    #[must_use]
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Runtime for CommandRuntime {
    fn finish(&self, dir: &Path) -> Result<(), FinishError> {
        if !dir.is_dir() {
            return Err(FinishError::InvalidDirectory(dir.to_path_buf()));
        }
        let Some((program, args)) = self.command.split_first() else {
            return Err(FinishError::Failed("no finish command configured".to_string()));
        };
        tracing::debug!(program = %program, dir = %dir.display(), "running finish command");
        let status = Command::new(program)
            .args(args)
            .arg(dir)
            .status()
            .map_err(|err| FinishError::Failed(format!("cannot run {program}: {err}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(FinishError::Failed(format!("{program} exited with {status}")))
        }
    }
}
