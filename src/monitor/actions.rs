//! Built-in tombstone actions.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::core::errors::{Result, WardenError};
use crate::core::fsops;
use crate::monitor::tombstone::{Tombstone, TombstoneAction};
use crate::supervisor::control::{SupervisorControl, SvcAction, SvscanAction};
use crate::supervisor::service::DOWN_FILE;
use crate::watchdog::Watchdog;

/// Declares the whole node down through an already-expired watchdog marker.
#[derive(Debug, Clone)]
pub struct NodeDownAction {
    watchdog: Watchdog,
}

impl NodeDownAction {
    /// Write markers into `watchdog`.
    #[must_use]
    pub fn new(watchdog: Watchdog) -> Self {
        Self { watchdog }
    }
}

impl TombstoneAction for NodeDownAction {
    fn execute(&mut self, tombstone: &Tombstone) -> Result<bool> {
        let content = format!(
            "{} exited with return code {} (signal {}) at {}\n",
            tombstone.id,
            tombstone.return_code,
            tombstone.signal,
            describe_timestamp(tombstone.timestamp)
        );
        tracing::error!(id = %tombstone.id, return_code = tombstone.return_code, "critical unit exited, marking node down");
        self.watchdog
            .create(&format!("Node-{}", tombstone.id), Duration::ZERO, &content)?;
        Ok(true)
    }
}

fn describe_timestamp(timestamp: f64) -> String {
    #[allow(clippy::cast_possible_truncation)]
    let millis = (timestamp * 1000.0) as i64;
    chrono::DateTime::from_timestamp_millis(millis)
        .map_or_else(|| format!("{timestamp:.3}"), |at| at.to_rfc3339())
}

/// Moves a stopped container from the running scan root to the cleanup scan
/// root and asks the running scanner to forget it.
pub struct ContainerCleanupAction {
    running_dir: PathBuf,
    cleanup_dir: PathBuf,
    control: Rc<dyn SupervisorControl>,
}

impl ContainerCleanupAction {
    /// Move containers from `running_dir` to `cleanup_dir`.
    pub fn new(running_dir: &Path, cleanup_dir: &Path, control: Rc<dyn SupervisorControl>) -> Self {
        Self {
            running_dir: running_dir.to_path_buf(),
            cleanup_dir: cleanup_dir.to_path_buf(),
            control,
        }
    }
}

impl TombstoneAction for ContainerCleanupAction {
    fn execute(&mut self, tombstone: &Tombstone) -> Result<bool> {
        let running = self.running_dir.join(&tombstone.id);
        let cleanup = self.cleanup_dir.join(&tombstone.id);

        match fsops::read_link_if_exists(&running)? {
            Some(target) => {
                fsops::ensure_dir(&self.cleanup_dir)?;
                if fsops::read_link_if_exists(&cleanup)?.is_none() {
                    fsops::symlink(&target, &cleanup)?;
                }
                fsops::remove_file_if_exists(&running)?;
                tracing::info!(id = %tombstone.id, target = %target.display(), "container moved to cleanup");
            }
            None if !fsops::entry_exists(&cleanup) => {
                tracing::debug!(id = %tombstone.id, "container already cleaned up");
                return Ok(true);
            }
            None => {}
        }

        self.control
            .control_svscan(&self.running_dir, &[SvscanAction::Alarm, SvscanAction::Nuke])?;
        Ok(true)
    }
}

/// Stops a container in place and keeps it down across supervisor restarts.
pub struct ContainerDownAction {
    running_dir: PathBuf,
    control: Rc<dyn SupervisorControl>,
}

impl ContainerDownAction {
    /// Hold down containers under `running_dir`.
    pub fn new(running_dir: &Path, control: Rc<dyn SupervisorControl>) -> Self {
        Self {
            running_dir: running_dir.to_path_buf(),
            control,
        }
    }
}

impl TombstoneAction for ContainerDownAction {
    fn execute(&mut self, tombstone: &Tombstone) -> Result<bool> {
        let dir = self.running_dir.join(&tombstone.id);
        if !dir.is_dir() {
            tracing::debug!(id = %tombstone.id, "container already gone");
            return Ok(true);
        }
        fsops::touch(&dir.join(DOWN_FILE))?;
        match self
            .control
            .control_service(&dir, &[SvcAction::Down], None, None)
        {
            Ok(_) => {}
            Err(WardenError::NotSupervised { .. }) => {
                tracing::debug!(id = %tombstone.id, "container not supervised, down marker is enough");
            }
            Err(err) => return Err(err),
        }
        tracing::info!(id = %tombstone.id, "container held down");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::control::SvcWait;
    use std::cell::RefCell;
    use std::time::SystemTime;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        svscan: RefCell<Vec<Vec<SvscanAction>>>,
        services: RefCell<Vec<(PathBuf, Vec<SvcAction>)>>,
        not_supervised: bool,
    }

    impl SupervisorControl for Recorder {
        fn control_service(
            &self,
            dir: &Path,
            actions: &[SvcAction],
            _wait: Option<SvcWait>,
            _timeout: Option<Duration>,
        ) -> Result<bool> {
            if self.not_supervised {
                return Err(WardenError::NotSupervised {
                    path: dir.to_path_buf(),
                });
            }
            self.services
                .borrow_mut()
                .push((dir.to_path_buf(), actions.to_vec()));
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

        fn control_svscan(&self, _scan_dir: &Path, actions: &[SvscanAction]) -> Result<()> {
            self.svscan.borrow_mut().push(actions.to_vec());
            Ok(())
        }

        fn is_supervised(&self, _dir: &Path) -> Result<bool> {
            Ok(!self.not_supervised)
        }
    }

    fn stone(id: &str) -> Tombstone {
        Tombstone {
            id: id.to_string(),
            timestamp: 1_700_000_000.5,
            return_code: 137,
            signal: 9,
        }
    }

    #[test]
    fn node_down_marker_is_expired_and_descriptive() {
        let tmp = TempDir::new().unwrap();
        let watchdog = Watchdog::new(tmp.path());
        let mut action = NodeDownAction::new(watchdog.clone());
        assert!(action.execute(&stone("etcd")).unwrap());

        let expired = watchdog
            .expired(SystemTime::now() + Duration::from_millis(1))
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].name, "Node-etcd");
        assert!(expired[0].content.contains("etcd exited with return code 137"));
        assert!(expired[0].content.contains("2023-11-14"));
    }

    #[cfg(unix)]
    #[test]
    fn cleanup_moves_running_link_and_nukes() {
        let tmp = TempDir::new().unwrap();
        let running = tmp.path().join("running");
        let cleanup = tmp.path().join("cleanup");
        let backing = tmp.path().join("apps/web");
        std::fs::create_dir_all(&backing).unwrap();
        std::fs::create_dir_all(&running).unwrap();
        fsops::symlink(&backing, &running.join("web")).unwrap();

        let control = Rc::new(Recorder::default());
        let mut action = ContainerCleanupAction::new(&running, &cleanup, control.clone());
        assert!(action.execute(&stone("web")).unwrap());

        assert!(!fsops::entry_exists(&running.join("web")));
        assert_eq!(
            fsops::read_link_if_exists(&cleanup.join("web")).unwrap(),
            Some(backing)
        );
        assert_eq!(
            *control.svscan.borrow(),
            vec![vec![SvscanAction::Alarm, SvscanAction::Nuke]]
        );
    }

    #[test]
    fn cleanup_of_absent_container_is_success_without_control() {
        let tmp = TempDir::new().unwrap();
        let control = Rc::new(Recorder::default());
        let mut action = ContainerCleanupAction::new(
            &tmp.path().join("running"),
            &tmp.path().join("cleanup"),
            control.clone(),
        );
        assert!(action.execute(&stone("ghost")).unwrap());
        assert!(control.svscan.borrow().is_empty());
    }

    #[test]
    fn down_marks_and_stops_the_container() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("web");
        std::fs::create_dir_all(&dir).unwrap();
        let control = Rc::new(Recorder::default());
        let mut action = ContainerDownAction::new(tmp.path(), control.clone());

        assert!(action.execute(&stone("web")).unwrap());
        assert!(dir.join(DOWN_FILE).exists());
        assert_eq!(
            *control.services.borrow(),
            vec![(dir, vec![SvcAction::Down])]
        );
    }

    #[test]
    fn down_tolerates_missing_or_unsupervised_containers() {
        let tmp = TempDir::new().unwrap();
        let control = Rc::new(Recorder {
            not_supervised: true,
            ..Recorder::default()
        });
        let mut action = ContainerDownAction::new(tmp.path(), control);
        assert!(action.execute(&stone("ghost")).unwrap());

        std::fs::create_dir_all(tmp.path().join("web")).unwrap();
        assert!(action.execute(&stone("web")).unwrap());
    }
}
