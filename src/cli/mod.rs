//! Command-line interface
//!
//! `run` starts the control loop; `ctl` talks to a running one over HTTP.

pub mod client;
pub mod ctl;
pub mod levels;
pub mod output;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use crate::coordinator::ControllerMode;
use crate::domain::Side;
use crate::exchange::VenueKind;

#[derive(Parser)]
#[command(name = "gridpilot")]
#[command(version)]
#[command(about = "Level selection and risk control loop for grid trading", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration directory (default.toml, <env>.toml)
    #[arg(short, long, global = true, default_value = "config", env = "GRIDPILOT_CONFIG_DIR")]
    pub config_dir: PathBuf,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control loop
    Run {
        /// Override the configured start mode
        #[arg(long)]
        mode: Option<ControllerMode>,
        /// Override the configured venue (paper, bridge)
        #[arg(long)]
        venue: Option<VenueKind>,
        /// Do not start the HTTP API
        #[arg(long)]
        no_api: bool,
    },
    /// Load and validate the configuration
    CheckConfig,
    /// Expand scenarios into levels and print them
    Levels {
        /// Scenario file; defaults to levels.scenarios_path
        #[arg(long)]
        scenarios: Option<PathBuf>,
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        side: Option<Side>,
    },
    /// Query or control a running instance
    Ctl {
        /// API base URL
        #[arg(long, env = "GRIDPILOT_API_URL", default_value = "http://127.0.0.1:8787")]
        url: String,
        /// Admin bearer token for control commands
        #[arg(long, env = "GRIDPILOT_API_TOKEN")]
        token: Option<String>,
        /// Recorded as the operator on control actions
        #[arg(long, env = "USER")]
        operator: Option<String>,
        #[command(subcommand)]
        command: CtlCommands,
    },
}

#[derive(Subcommand)]
pub enum CtlCommands {
    /// Component health, mode and risk level
    Status,
    /// Decision history
    Decisions {
        /// RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Plans awaiting confirmation
    Pending,
    /// Current risk state
    Risk,
    /// Levels currently working at the venue
    Active,
    /// Latest score breakdown for a level
    Score { level_id: String },
    /// Switch controller mode
    Mode {
        mode: ControllerMode,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Dispatch a pending plan
    Confirm { id: Uuid },
    /// Discard a pending plan
    Reject { id: Uuid },
    /// Run a decision cycle now
    Cycle,
    /// Clear the emergency latch (controller must be disabled)
    ResetEmergency,
}
