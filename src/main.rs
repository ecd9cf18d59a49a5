//! Messenger node - peer-to-peer chat over plain TCP
//!
//! Entry point for the `messenger-node` binary: parses the command line,
//! loads configuration, starts the node and hands the terminal to the
//! interactive shell.

mod cli;

use clap::Parser;
use tracing::{error, info};

use messenger_node::config::{self, NodeConfig};
use messenger_node::error::{Error, Result};
use messenger_node::node::{EventSink, Node, NodeOptions};
use messenger_node::{logging, shell, version};

use crate::cli::{Cli, Commands, ConfigSubcommand};

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    let (name, port, config_path) = match cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand);
        }
        Commands::Run { name, port, config } => (name, port, config),
    };

    // CLI arguments take precedence over file and environment
    let config = match NodeConfig::load(config_path.as_deref())
        .and_then(|mut cfg| cfg.apply_cli_overrides(name, port).map(|()| cfg))
    {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting messenger node"
    );

    if let Err(e) = run_node(config) {
        error!(error = %e.format_for_log(), "Node failed");
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }

    Ok(())
}

/// Build the runtime and run the node until the shell exits
fn run_node(config: NodeConfig) -> Result<()> {
    info!(
        name = %config.node.name,
        bind = %format!("{}:{}", config.node.bind_host, config.node.listen_port),
        advertise = %config.node.advertise_host,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 4))
        .thread_name("messenger-node")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async_node_main(config))
}

async fn async_node_main(config: NodeConfig) -> Result<()> {
    let (events, event_rx) = EventSink::channel(config.node.event_buffer);
    let node = Node::start(NodeOptions::from_config(&config), events).await?;

    shell::run(&node, event_rx).await;

    node.shutdown().await;
    Ok(())
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = NodeConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            config::init_config(path.as_deref(), force)?;
        }
        ConfigSubcommand::Validate { config } => match NodeConfig::load(config.as_deref()) {
            Ok(_) => println!("Configuration is valid."),
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }

    Ok(())
}
