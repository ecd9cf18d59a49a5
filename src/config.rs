//! Configuration system for the messenger node
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (MESSENGER_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity and listening socket
    pub node: NodeSettings,

    /// Heartbeat and timeout settings
    pub liveness: LivenessSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Identity and listening socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Name announced to peers (defaults to the host name)
    pub name: String,

    /// Host written into our own POKE messages; peers dial it back
    pub advertise_host: String,

    /// Interface the listener binds
    pub bind_host: String,

    /// TCP port for incoming peer connections (0 = any free port)
    pub listen_port: u16,

    /// Capacity of the channel carrying events to the shell
    pub event_buffer: usize,
}

/// Heartbeat and timeout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSettings {
    /// Period of the liveness sweep
    pub sweep_interval_ms: u64,

    /// Silence after which a peer counts as stale
    pub probe_after_ms: u64,

    /// Silence after which a peer is evicted
    pub expire_after_ms: u64,

    /// Bound on opening an outbound connection
    pub connect_timeout_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Rotation period for the log file: hourly, daily, never
    pub rotation: String,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            advertise_host: "127.0.0.1".to_string(),
            bind_host: "0.0.0.0".to_string(),
            listen_port: 6734,
            event_buffer: 256,
        }
    }
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 30_000,
            probe_after_ms: 30_000,
            expire_after_ms: 60_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            rotation: "daily".to_string(),
            max_files: 5,
            json_format: false,
        }
    }
}

impl LivenessSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn probe_after(&self) -> Duration {
        Duration::from_millis(self.probe_after_ms)
    }

    pub fn expire_after(&self) -> Duration {
        Duration::from_millis(self.expire_after_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Host name with whitespace replaced, so it is usable on the wire
fn default_node_name() -> String {
    let name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node".to_string());
    name.split_whitespace().collect::<Vec<_>>().join("-")
}

impl NodeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
            config = toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Apply the launcher's positional arguments and validate again
    pub fn apply_cli_overrides(&mut self, name: Option<String>, port: Option<u16>) -> Result<()> {
        if let Some(name) = name {
            self.node.name = name;
        }
        if let Some(port) = port {
            self.node.listen_port = port;
        }
        self.validate()
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // An explicit path must exist
        if let Some(path) = explicit_path {
            let expanded = shellexpand::tilde(path);
            let path = PathBuf::from(expanded.as_ref());
            if path.exists() {
                return Ok(Some(path));
            } else {
                return Err(Error::Config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
        }

        let search_paths = [
            PathBuf::from("messenger.toml"),
            dirs::config_dir()
                .map(|p| p.join("messenger").join("node.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".messenger").join("node.toml"))
                .unwrap_or_default(),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Node settings
        if let Ok(val) = std::env::var("MESSENGER_NODE_NAME") {
            self.node.name = val;
        }
        if let Ok(val) = std::env::var("MESSENGER_ADVERTISE_HOST") {
            self.node.advertise_host = val;
        }
        if let Ok(val) = std::env::var("MESSENGER_BIND_HOST") {
            self.node.bind_host = val;
        }
        if let Ok(val) = std::env::var("MESSENGER_PORT") {
            if let Ok(n) = val.parse() {
                self.node.listen_port = n;
            }
        }

        // Liveness settings
        if let Ok(val) = std::env::var("MESSENGER_SWEEP_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                self.liveness.sweep_interval_ms = n;
            }
        }
        if let Ok(val) = std::env::var("MESSENGER_PROBE_AFTER_MS") {
            if let Ok(n) = val.parse() {
                self.liveness.probe_after_ms = n;
            }
        }
        if let Ok(val) = std::env::var("MESSENGER_EXPIRE_AFTER_MS") {
            if let Ok(n) = val.parse() {
                self.liveness.expire_after_ms = n;
            }
        }
        if let Ok(val) = std::env::var("MESSENGER_CONNECT_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.liveness.connect_timeout_ms = n;
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("MESSENGER_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("MESSENGER_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("MESSENGER_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.name.chars().any(char::is_whitespace) {
            return Err(Error::config_field_invalid(
                "node.name",
                format!("'{}' must not contain whitespace", self.node.name),
            ));
        }
        for (field, host) in [
            ("node.advertise_host", &self.node.advertise_host),
            ("node.bind_host", &self.node.bind_host),
        ] {
            if host.is_empty() {
                return Err(Error::config_field_invalid(field, "must not be empty"));
            }
            if host.chars().any(char::is_whitespace) {
                return Err(Error::config_field_invalid(
                    field,
                    format!("'{}' must not contain whitespace", host),
                ));
            }
        }
        if self.node.event_buffer == 0 {
            return Err(Error::config_field_invalid("node.event_buffer", "must be at least 1"));
        }

        let liveness = &self.liveness;
        for (field, value) in [
            ("liveness.sweep_interval_ms", liveness.sweep_interval_ms),
            ("liveness.probe_after_ms", liveness.probe_after_ms),
            ("liveness.connect_timeout_ms", liveness.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::config_field_invalid(field, "must be greater than 0"));
            }
        }
        if liveness.expire_after_ms <= liveness.probe_after_ms {
            return Err(Error::config_field_invalid(
                "liveness.expire_after_ms",
                format!(
                    "must be greater than probe_after_ms ({} <= {})",
                    liveness.expire_after_ms, liveness.probe_after_ms
                ),
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }
        let valid_rotations = ["hourly", "daily", "never"];
        if !valid_rotations.contains(&self.logging.rotation.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.rotation",
                format!(
                    "Invalid rotation '{}'. Must be one of: {}",
                    self.logging.rotation,
                    valid_rotations.join(", ")
                ),
            ));
        }

        Ok(())
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<()> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".messenger")
                .join("node.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
    }

    fs::write(&config_path, generate_default_config())
        .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

    println!("Configuration file created: {}", config_path.display());
    Ok(())
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# Messenger Node Configuration

[node]
# Name announced to peers (defaults to the host name; no whitespace)
# name = "alice"

# Host written into our POKE messages so peers can dial us back
advertise_host = "127.0.0.1"

# Interface the listener binds
bind_host = "0.0.0.0"

# TCP port for incoming peer connections
listen_port = 6734

# Pending notifications kept for the shell before new ones are dropped
event_buffer = 256

[liveness]
# How often peers are probed and checked for expiry
sweep_interval_ms = 30000

# Silence after which a peer is considered stale
probe_after_ms = 30000

# Silence after which a peer is dropped (must exceed probe_after_ms)
expire_after_ms = 60000

# Timeout for opening an outbound connection
connect_timeout_ms = 5000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.messenger/logs/node.log"

# Rotation period for the log file: hourly, daily, never
rotation = "daily"

# Number of rotated log files to keep
max_files = 5

# Use JSON format for logs
json_format = false
"#
    .to_string()
}
