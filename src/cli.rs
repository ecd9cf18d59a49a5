//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// Messenger node - peer-to-peer chat over plain TCP
///
/// Listens for peers, keeps track of who is online through periodic
/// heartbeats, and relays chat lines typed into the interactive shell.
#[derive(Parser, Debug)]
#[command(name = "messenger-node")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node and the interactive shell
    Run {
        /// Name announced to peers
        name: Option<String>,

        /// TCP port to listen on
        port: Option<u16>,

        /// Path to configuration file
        #[arg(short, long, env = "MESSENGER_CONFIG")]
        config: Option<String>,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Write a commented default configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
