//! Tombstone dispatch with the built-in actions.

#![cfg(unix)]

mod common;

use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use common::{ControlCall, FakeControl};
use nodewarden::core::config::TombstoneBinding;
use nodewarden::monitor::tombstone::{ActionContext, ActionRegistry, TombstoneMonitor};
use nodewarden::supervisor::{SvcAction, SvscanAction};
use nodewarden::watchdog::Watchdog;
use tempfile::TempDir;

struct Node {
    tmp: TempDir,
    control: FakeControl,
    monitor: TombstoneMonitor,
}

impl Node {
    fn new(bindings: &[(&str, &str)]) -> Self {
        let tmp = TempDir::new().unwrap();
        let control = FakeControl::default();
        let ctx = ActionContext {
            watchdog: Watchdog::new(tmp.path().join("watchdogs")),
            control: Rc::new(control.clone()),
            running_dir: tmp.path().join("running"),
            cleanup_dir: tmp.path().join("cleanup"),
        };
        let bindings: Vec<_> = bindings
            .iter()
            .map(|(dir, action)| TombstoneBinding {
                path: tmp.path().join(dir),
                action: (*action).to_string(),
            })
            .collect();
        let monitor =
            TombstoneMonitor::new(&bindings, ActionRegistry::with_builtin(), ctx, 16).unwrap();
        Self {
            tmp,
            control,
            monitor,
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.tmp.path().join(rel)
    }
}

#[test]
fn duplicate_delivery_does_not_repeat_the_side_effect() {
    let mut node = Node::new(&[("tombstones/down", "container-down")]);
    std::fs::create_dir_all(node.path("running/app-1")).unwrap();
    std::fs::create_dir_all(node.path("tombstones/down")).unwrap();
    let stone = node.path("tombstones/down/app-1,1700000000.5,1,0");
    std::fs::write(&stone, "").unwrap();

    assert!(node.monitor.handle(&stone).unwrap());
    assert!(!stone.exists());
    assert!(!node.monitor.handle(&stone).unwrap());

    assert_eq!(
        node.control.calls(),
        vec![ControlCall::Service(
            node.path("running/app-1"),
            vec![SvcAction::Down]
        )]
    );
    assert!(node.path("running/app-1/down").exists());
}

#[test]
fn backlog_is_processed_at_start_and_not_again_by_sweep() {
    let mut node = Node::new(&[("tombstones/cleanup", "container-cleanup")]);
    std::fs::create_dir_all(node.path("apps/app-2")).unwrap();
    std::fs::create_dir_all(node.path("running")).unwrap();
    std::os::unix::fs::symlink(node.path("apps/app-2"), node.path("running/app-2")).unwrap();
    std::fs::create_dir_all(node.path("tombstones/cleanup")).unwrap();
    std::fs::write(node.path("tombstones/cleanup/app-2,12,0,15"), "").unwrap();

    node.monitor.start().unwrap();
    assert_eq!(
        std::fs::read_link(node.path("cleanup/app-2")).unwrap(),
        node.path("apps/app-2")
    );
    assert_eq!(
        node.control.calls(),
        vec![ControlCall::Svscan(
            node.path("running"),
            vec![SvscanAction::Alarm, SvscanAction::Nuke]
        )]
    );

    assert_eq!(node.monitor.sweep().unwrap(), 0);
    assert_eq!(node.control.calls().len(), 1);
}

#[test]
fn node_down_tombstone_leaves_an_expired_marker() {
    let mut node = Node::new(&[("tombstones/critical", "node-down")]);
    std::fs::create_dir_all(node.path("tombstones/critical")).unwrap();
    std::fs::write(node.path("tombstones/critical/etcd,1700000000,134,6"), "").unwrap();

    node.monitor.start().unwrap();
    let expired = Watchdog::new(node.path("watchdogs"))
        .expired(SystemTime::now() + Duration::from_millis(1))
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].name, "Node-etcd");
    assert!(!node.path("tombstones/critical/etcd,1700000000,134,6").exists());
}

#[test]
fn new_tombstones_are_picked_up_by_the_watch_loop() {
    let mut node = Node::new(&[("tombstones/down", "container-down")]);
    std::fs::create_dir_all(node.path("running/app-3")).unwrap();
    node.monitor.start().unwrap();

    let stone = node.path("tombstones/down/app-3,99,0,9");
    std::fs::write(&stone, "").unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while stone.exists() && std::time::Instant::now() < deadline {
        node.monitor.run_once(Duration::from_millis(100)).unwrap();
    }
    assert!(!stone.exists());
    assert_eq!(node.control.calls().len(), 1);
}
