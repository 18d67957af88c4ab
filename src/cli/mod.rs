pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::AppConfig;
use crate::error::Result;

#[derive(Parser)]
#[command(name = "agentlink")]
#[command(version)]
#[command(about = "SSH connectivity core for bot-instance agents")]
#[command(long_about = "Pooled SSH connections, local port-forwarding tunnels and managed key rotation for agent containers.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON instead of styled text
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the managed key pair (or replace it with --force)
    Keygen {
        /// Replace an existing key, keeping the previous one as a backup
        #[arg(short, long)]
        force: bool,
    },

    /// Show the SHA256 fingerprint of the managed key or a key file
    Fingerprint {
        /// Private or public key file (default: the managed key)
        path: Option<PathBuf>,
    },

    /// Connect to an instance, run a health check and report its state
    Connect {
        /// Instance identifier
        instance: String,

        /// Host to dial (default: resolved through the orchestrator)
        #[arg(long)]
        host: Option<String>,

        /// SSH port used with --host
        #[arg(short, long, default_value = "22")]
        port: u16,

        /// Authenticate with this private key instead of the managed one
        #[arg(short = 'i', long)]
        key: Option<PathBuf>,
    },

    /// Forward a local port to a port on the instance until interrupted
    Tunnel {
        /// Instance identifier
        instance: String,

        /// Port on the instance
        #[arg(short, long)]
        remote_port: u16,

        /// Local port (default: any free port)
        #[arg(short, long)]
        local_port: Option<u16>,

        /// Tunnel label
        #[arg(long, default_value = "default")]
        label: String,
    },

    /// Rotate the managed key across instances
    Rotate {
        /// Instances to include (they are connected first)
        #[arg(short, long = "instance")]
        instances: Vec<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Print the configuration file path
    Path,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let json = self.json;
        match self.command {
            Commands::Keygen { force } => {
                let config = AppConfig::load()?;
                commands::keys::keygen(&config, force, json)
            }
            Commands::Fingerprint { path } => {
                let config = AppConfig::load()?;
                commands::keys::fingerprint(&config, path, json)
            }
            Commands::Connect {
                instance,
                host,
                port,
                key,
            } => {
                let config = AppConfig::load()?;
                commands::connect::execute(&config, &instance, host, port, key, json).await
            }
            Commands::Tunnel {
                instance,
                remote_port,
                local_port,
                label,
            } => {
                let config = AppConfig::load()?;
                commands::tunnel::execute(&config, &instance, &label, remote_port, local_port, json)
                    .await
            }
            Commands::Rotate { instances } => {
                let config = AppConfig::load()?;
                commands::rotate::execute(&config, instances, json).await
            }
            Commands::Config { command } => match command {
                ConfigCommands::Show => commands::config::show(json),
                ConfigCommands::Path => commands::config::path(),
            },
        }
    }
}
