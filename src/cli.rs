//! Shared CLI definitions for rftp and rftpd

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ClientConfig, ServerConfig};

/// Options for the rftpd daemon. Flags override values from `--config`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "rftp daemon - serves one directory tree over TCP")]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Root directory to serve
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Serve connections concurrently instead of one at a time
    #[arg(long)]
    pub concurrent: bool,

    /// Close sessions idle for this many seconds
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl DaemonOpts {
    /// Apply command-line overrides on top of a loaded config.
    pub fn apply(&self, mut config: ServerConfig) -> ServerConfig {
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if self.concurrent {
            config.concurrent_sessions = true;
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.timeouts.idle_ms = secs.saturating_mul(1000);
        }
        config
    }
}

/// Options for the rftp client.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "rftp client - talks to an rftpd server")]
pub struct ClientOpts {
    /// Server address (host:port)
    pub server: String,

    /// Directory downloads are written to
    #[arg(long, default_value = ".")]
    pub download_dir: PathBuf,

    /// Change to this remote directory before running the command
    #[arg(long)]
    pub cwd: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: ClientCommand,
}

impl ClientOpts {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            download_dir: self.download_dir.clone(),
            ..ClientConfig::new(self.server.clone())
        }
    }
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// List the remote working directory
    Ls,
    /// Print the remote working directory
    Pwd,
    /// Download a file from the remote working directory
    Get { name: String },
    /// Upload a local file
    Put {
        path: PathBuf,
        /// Store under a different remote name
        #[arg(long = "as")]
        remote_name: Option<String>,
    },
    /// Create a remote directory
    Mkdir { name: String },
    /// Remove a remote directory and everything in it
    Rmdir { name: String },
    /// Delete a remote file
    Rm { name: String },
}
