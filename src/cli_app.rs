//! Top-level CLI definition and dispatch.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::core::config::Config;
use crate::daemon::{self, SignalFlags};
use crate::watchdog::parse_timeout;

/// Keep supervised units alive and escalate node failure.
#[derive(Parser)]
#[command(name = "nwd", version, about)]
pub struct Cli {
    /// Configuration file (defaults to /etc/nodewarden/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Run the restart-policy monitor over a scan root.
    Monitor {
        /// Scan root to monitor instead of `paths.scan_dir`.
        #[arg(long)]
        scan_dir: Option<PathBuf>,
    },
    /// Run the tombstone dispatch loop (SIGHUP reloads bindings).
    Tombstones,
    /// Converge the actual scan root to the requested directory.
    Reconcile {
        /// Run one full sync and exit.
        #[arg(long)]
        once: bool,
    },
    /// List watchdog leases whose deadline has passed.
    Reap {
        /// Only report leases expired for at least this long (e.g. "30s").
        #[arg(long, default_value = "0s")]
        grace: String,
    },
    /// Show or check configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// `nwd config` subcommands.
#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML.
    Show,
    /// Validate the configuration file and exit.
    Check,
}

/// Dispatch CLI commands.
///
/// # Errors
/// Returns an error if configuration loading or the selected loop fails.
pub fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(cli.config.as_deref())?;
    match &cli.command {
        Command::Monitor { scan_dir } => {
            let flags = SignalFlags::install()?;
            daemon::run_monitor(&config, scan_dir.clone(), &flags)?;
        }
        Command::Tombstones => {
            let flags = SignalFlags::install()?;
            daemon::run_tombstones(cli.config.as_deref(), &config, &flags)?;
        }
        Command::Reconcile { once: true } => {
            let report = daemon::build_reconciler(&config)?.start()?;
            println!(
                "created: {}; removed: {}",
                report.created.len(),
                report.removed.len()
            );
        }
        Command::Reconcile { once: false } => {
            let flags = SignalFlags::install()?;
            daemon::run_reconciler(&config, &flags)?;
        }
        Command::Reap { grace } => {
            for lease in daemon::stale_leases(&config, parse_timeout(grace)?)? {
                let deadline: chrono::DateTime<chrono::Utc> = lease.deadline.into();
                println!(
                    "{}\t{}\t{}\t{}",
                    lease.name,
                    lease.timeout,
                    deadline.to_rfc3339(),
                    lease.content.trim_end()
                );
            }
        }
        Command::Config(ConfigCommand::Show) => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Command::Config(ConfigCommand::Check) => {
            println!("configuration ok");
        }
    }
    Ok(())
}
