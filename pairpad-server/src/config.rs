//! Command-line configuration.
//!
//! Every flag falls back to an environment variable and then to the library
//! defaults, so `pairpad serve` with no arguments runs an in-memory hub.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use pairpad_collab::{HubConfig, ServerConfig, StoreConfig};
use pairpad_exec::{RuntimeConfig, SupervisorConfig};

#[derive(Debug, Parser)]
#[command(name = "pairpad")]
#[command(about = "Collaborative code pad: room sync hub, HTTP API and code runner")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the WebSocket sync hub and the HTTP API
    Serve(ServeArgs),

    /// Run a script through the execution supervisor and stream its output
    Run(RunArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// WebSocket listen address (rooms at /ws/{room_id})
    #[arg(long, env = "PAIRPAD_WS_ADDR", default_value = "127.0.0.1:9090")]
    pub ws_addr: String,

    /// HTTP API listen address
    #[arg(long, env = "PAIRPAD_HTTP_ADDR", default_value = "127.0.0.1:8000")]
    pub http_addr: String,

    /// RocksDB directory for room snapshots (in-memory if omitted)
    #[arg(long, env = "PAIRPAD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Seconds an empty room lives before it is persisted and collected
    #[arg(long, env = "PAIRPAD_GRACE_SECS", default_value_t = 30)]
    pub grace_secs: u64,

    /// Per-room broadcast buffer; slower connections resync from a snapshot
    #[arg(long, env = "PAIRPAD_BROADCAST_CAPACITY", default_value_t = 256)]
    pub broadcast_capacity: usize,
}

impl ServeArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.ws_addr.clone(),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            grace_period: Duration::from_secs(self.grace_secs),
            broadcast_capacity: self.broadcast_capacity.max(1),
            ..HubConfig::default()
        }
    }

    pub fn store_config(&self) -> Option<StoreConfig> {
        self.data_dir.as_ref().map(|path| StoreConfig {
            path: path.clone(),
            ..StoreConfig::default()
        })
    }
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Script to run
    pub file: PathBuf,

    /// Interpreter binary
    #[arg(long, env = "PAIRPAD_INTERPRETER", default_value = "python3")]
    pub program: String,

    /// Cancel the run after this many seconds
    #[arg(long, env = "PAIRPAD_TIME_LIMIT_SECS")]
    pub time_limit_secs: Option<u64>,
}

impl RunArgs {
    pub fn runtime_config(&self) -> RuntimeConfig {
        let base = if self.program.ends_with("sh") {
            RuntimeConfig::shell()
        } else {
            RuntimeConfig::default()
        };
        RuntimeConfig {
            program: self.program.clone(),
            ..base
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            run_time_limit: self.time_limit_secs.map(Duration::from_secs),
            ..SupervisorConfig::default()
        }
    }
}
