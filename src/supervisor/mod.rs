//! Supervised-unit model and the control protocol of the external process
//! supervisor.

pub mod control;
pub mod service;

pub use control::{S6Control, SupervisorControl, SvcAction, SvcWait, SvscanAction};
pub use service::{ScanDir, Service, ServiceRequest};
