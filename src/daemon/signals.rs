//! Process signals mapped onto flags polled by the loops.
//!
//! `SIGTERM`/`SIGINT` request shutdown, `SIGHUP` requests a configuration
//! reload.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

use crate::core::errors::{Result, WardenError};

/// Flags flipped by the installed handlers.
#[derive(Debug, Clone, Default)]
pub struct SignalFlags {
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl SignalFlags {
    /// Register the handlers.
    pub fn install() -> Result<Self> {
        let flags = Self::default();
        for signal in [SIGTERM, SIGINT] {
            signal_hook::flag::register(signal, Arc::clone(&flags.shutdown))
                .map_err(|err| WardenError::io("signal handler", err))?;
        }
        signal_hook::flag::register(SIGHUP, Arc::clone(&flags.reload))
            .map_err(|err| WardenError::io("signal handler", err))?;
        Ok(flags)
    }

    /// Flag the loops poll for shutdown.
    #[must_use]
    pub fn shutdown(&self) -> &AtomicBool {
        &self.shutdown
    }

    /// Consume a pending reload request.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::Relaxed)
    }

    /// Ask the loops to stop, as a termination signal would.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
