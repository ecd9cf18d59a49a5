//! Interactive command shell
//!
//! Reads commands from stdin and resolves the first word through a
//! static table. Node notifications are printed by a separate task as
//! they arrive, so incoming chat shows up while the prompt waits.
//!
//! ```text
//! connect 127.0.0.1 5001
//! m bob hello there
//! mx 127.0.0.1 5001 hello there
//! peers
//! exit
//! ```

use chrono::Local;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Error;
use crate::node::{Node, NodeEvent};
use crate::protocol::PeerIdentity;

/// Errors a command can produce; none of them end the shell
#[derive(Error, Debug)]
pub enum ShellError {
    #[error("unknown command '{name}'. Type 'help' for a list")]
    UnknownCommand { name: String },

    #[error("usage: {usage}")]
    Usage { usage: &'static str },

    #[error("invalid port '{value}'")]
    InvalidPort { value: String },

    #[error(transparent)]
    Node(#[from] Error),
}

impl ShellError {
    pub fn format_for_terminal(&self) -> String {
        match self {
            ShellError::Node(e) => e.format_for_terminal(),
            other => format!("\x1b[31mError\x1b[0m: {}\n", other),
        }
    }
}

/// What the loop does after a command
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Exit,
}

type Handler = for<'a> fn(&'a Node, &'a str) -> BoxFuture<'a, Result<Reply, ShellError>>;

/// One entry of the command table
pub struct ShellCommand {
    pub name: &'static str,
    pub usage: &'static str,
    pub summary: &'static str,
    handler: Handler,
}

pub static COMMANDS: &[ShellCommand] = &[
    ShellCommand {
        name: "connect",
        usage: "connect <host> <port>",
        summary: "introduce ourselves to a node",
        handler: |node, args| Box::pin(connect(node, args)),
    },
    ShellCommand {
        name: "disconnect",
        usage: "disconnect",
        summary: "leave the network but keep listening",
        handler: |node, args| Box::pin(disconnect(node, args)),
    },
    ShellCommand {
        name: "m",
        usage: "m <name> <text...>",
        summary: "message every peer with that name",
        handler: |node, args| Box::pin(message_by_name(node, args)),
    },
    ShellCommand {
        name: "mx",
        usage: "mx <host> <port> <text...>",
        summary: "message the peer at an exact address",
        handler: |node, args| Box::pin(message_by_address(node, args)),
    },
    ShellCommand {
        name: "peers",
        usage: "peers",
        summary: "list connected peers",
        handler: |node, args| Box::pin(peers(node, args)),
    },
    ShellCommand {
        name: "help",
        usage: "help",
        summary: "show this list",
        handler: |node, args| Box::pin(help(node, args)),
    },
    ShellCommand {
        name: "exit",
        usage: "exit",
        summary: "disconnect and quit",
        handler: |node, args| Box::pin(exit(node, args)),
    },
];

/// Find a command by name, ignoring case
pub fn lookup(name: &str) -> Option<&'static ShellCommand> {
    COMMANDS.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

/// Parse and run one input line
pub async fn execute(node: &Node, line: &str) -> Result<Reply, ShellError> {
    let line = line.trim();
    let (word, args) = line
        .split_once(char::is_whitespace)
        .unwrap_or((line, ""));

    let command = lookup(word).ok_or_else(|| ShellError::UnknownCommand {
        name: word.to_string(),
    })?;
    (command.handler)(node, args.trim_start()).await
}

/// Run the shell until `exit`, end of input, or Ctrl+C
pub async fn run(node: &Node, mut events: mpsc::Receiver<NodeEvent>) {
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", render_event(&event));
        }
    });

    let identity = node.local_identity();
    println!(
        "Messenger node {} listening on {}. Type 'help' for commands.",
        identity,
        node.local_addr()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            result = lines.next_line() => match result {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read input");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match execute(node, &line).await {
            Ok(Reply::Text(text)) => println!("{}", text),
            Ok(Reply::Exit) => break,
            Err(e) => eprint!("{}", e.format_for_terminal()),
        }
    }

    node.shutdown().await;
    printer.abort();
}

/// Format a notification with a local timestamp
pub fn render_event(event: &NodeEvent) -> String {
    let stamp = Local::now().format("%H:%M:%S");
    match event {
        NodeEvent::PeerOnline { peer } => format!("[{}] {} is online", stamp, peer),
        NodeEvent::PeerOffline { peer, reason } => {
            format!("[{}] {} went offline ({})", stamp, peer, reason)
        }
        NodeEvent::MessageReceived { from, body } => format!("[{}] {}: {}", stamp, from, body),
        NodeEvent::Error { context, message } => {
            format!("[{}] error {}: {}", stamp, context, message)
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────

fn parse_port(value: &str) -> Result<u16, ShellError> {
    value.parse().map_err(|_| ShellError::InvalidPort {
        value: value.to_string(),
    })
}

/// Split off the first whitespace-separated word
fn next_word(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    let (word, rest) = input.split_once(char::is_whitespace).unwrap_or((input, ""));
    Some((word, rest.trim_start()))
}

async fn connect(node: &Node, args: &str) -> Result<Reply, ShellError> {
    let usage = ShellError::Usage {
        usage: "connect <host> <port>",
    };
    let Some((host, rest)) = next_word(args) else {
        return Err(usage);
    };
    let Some((port, _)) = next_word(rest) else {
        return Err(usage);
    };

    let port = parse_port(port)?;
    node.connect_to(host, port).await?;
    Ok(Reply::Text(format!("Poked {}:{}", host, port)))
}

async fn disconnect(node: &Node, _args: &str) -> Result<Reply, ShellError> {
    let report = node.disconnect_all().await;
    Ok(Reply::Text(format!(
        "Disconnected from {} peer(s)",
        report.delivered.len() + report.failed.len()
    )))
}

async fn message_by_name(node: &Node, args: &str) -> Result<Reply, ShellError> {
    let Some((name, text)) = next_word(args) else {
        return Err(ShellError::Usage {
            usage: "m <name> <text...>",
        });
    };

    let sent = node.send_message_by_name(name, text).await?;
    Ok(Reply::Text(if sent == 0 {
        format!("No peer named '{}'", name)
    } else {
        format!("Sent to {} peer(s)", sent)
    }))
}

async fn message_by_address(node: &Node, args: &str) -> Result<Reply, ShellError> {
    let usage = ShellError::Usage {
        usage: "mx <host> <port> <text...>",
    };
    let Some((host, rest)) = next_word(args) else {
        return Err(usage);
    };
    let Some((port, text)) = next_word(rest) else {
        return Err(usage);
    };

    let target = PeerIdentity::unnamed(host, parse_port(port)?).map_err(Error::from)?;
    node.send_message(&target, text).await?;
    Ok(Reply::Text(format!("Sent to {}", target)))
}

async fn peers(node: &Node, _args: &str) -> Result<Reply, ShellError> {
    let peers = node.list_peers();
    if peers.is_empty() {
        return Ok(Reply::Text("No peers connected".to_string()));
    }

    let lines: Vec<String> = peers.iter().map(|p| format!("  {}", p)).collect();
    Ok(Reply::Text(format!(
        "{} peer(s):\n{}",
        peers.len(),
        lines.join("\n")
    )))
}

async fn help(_node: &Node, _args: &str) -> Result<Reply, ShellError> {
    let width = COMMANDS.iter().map(|c| c.usage.len()).max().unwrap_or(0);
    let lines: Vec<String> = COMMANDS
        .iter()
        .map(|c| format!("  {:width$}  {}", c.usage, c.summary, width = width))
        .collect();
    Ok(Reply::Text(lines.join("\n")))
}

async fn exit(node: &Node, _args: &str) -> Result<Reply, ShellError> {
    node.shutdown().await;
    Ok(Reply::Exit)
}
