//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::rc::Rc;
use std::time::Duration;

use nodewarden::Result;
use nodewarden::supervisor::control::{SupervisorControl, SvcAction, SvcWait, SvscanAction};

/// One control call as seen by [`FakeControl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    Service(PathBuf, Vec<SvcAction>),
    Svscan(PathBuf, Vec<SvscanAction>),
}

/// Records every control call and answers success.
#[derive(Debug, Default, Clone)]
pub struct FakeControl {
    calls: Rc<RefCell<Vec<ControlCall>>>,
}

impl FakeControl {
    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.borrow().clone()
    }

    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn ups(&self) -> Vec<PathBuf> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                ControlCall::Service(dir, actions) if actions.contains(&SvcAction::Up) => {
                    Some(dir.clone())
                }
                _ => None,
            })
            .collect()
    }
}

impl SupervisorControl for FakeControl {
    fn control_service(
        &self,
        dir: &Path,
        actions: &[SvcAction],
        _wait: Option<SvcWait>,
        _timeout: Option<Duration>,
    ) -> Result<bool> {
        self.calls
            .borrow_mut()
            .push(ControlCall::Service(dir.to_path_buf(), actions.to_vec()));
        Ok(true)
    }

    fn wait_service(
        &self,
        _dirs: &[PathBuf],
        _wait: SvcWait,
        _all: bool,
        _timeout: Option<Duration>,
    ) -> Result<bool> {
        Ok(true)
    }

    fn control_svscan(&self, scan_dir: &Path, actions: &[SvscanAction]) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(ControlCall::Svscan(scan_dir.to_path_buf(), actions.to_vec()));
        Ok(())
    }

    fn is_supervised(&self, _dir: &Path) -> Result<bool> {
        Ok(true)
    }
}

/// Captured run of the `nwd` binary.
pub struct CliResult {
    pub status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run `nwd` with `args`, logging disabled.
pub fn run_cli(args: &[&str]) -> CliResult {
    let Output {
        status,
        stdout,
        stderr,
    } = Command::new(env!("CARGO_BIN_EXE_nwd"))
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("nwd binary runs");
    CliResult {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    }
}
