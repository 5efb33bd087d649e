//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address the control API listens on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

/// Encoder lifecycle timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleConfig {
    /// Upper bound for the bring-up phase before the encoder is marked as errored
    #[serde(default = "default_bring_up_timeout_secs")]
    pub bring_up_timeout_secs: u64,
    /// Upper bound for the tear-down phase
    #[serde(default = "default_tear_down_timeout_secs")]
    pub tear_down_timeout_secs: u64,
}

fn default_bring_up_timeout_secs() -> u64 {
    30
}

fn default_tear_down_timeout_secs() -> u64 {
    15
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            bring_up_timeout_secs: default_bring_up_timeout_secs(),
            tear_down_timeout_secs: default_tear_down_timeout_secs(),
        }
    }
}

/// Step delays for the built-in simulated encoding engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_acquire_input_ms")]
    pub acquire_input_ms: u64,
    #[serde(default = "default_negotiate_outputs_ms")]
    pub negotiate_outputs_ms: u64,
    #[serde(default = "default_warm_up_ms")]
    pub warm_up_ms: u64,
    #[serde(default = "default_tear_down_ms")]
    pub tear_down_ms: u64,
}

fn default_acquire_input_ms() -> u64 {
    500
}

fn default_negotiate_outputs_ms() -> u64 {
    500
}

fn default_warm_up_ms() -> u64 {
    1000
}

fn default_tear_down_ms() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            acquire_input_ms: default_acquire_input_ms(),
            negotiate_outputs_ms: default_negotiate_outputs_ms(),
            warm_up_ms: default_warm_up_ms(),
            tear_down_ms: default_tear_down_ms(),
        }
    }
}

/// Which ad decision server implementation to wire in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionServerKind {
    /// Fills every break without a network round trip
    Static,
    /// Fetches the VAST document over HTTP
    Http,
}

impl Default for DecisionServerKind {
    fn default() -> Self {
        Self::Static
    }
}

impl std::str::FromStr for DecisionServerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "http" => Ok(Self::Http),
            _ => Err(()),
        }
    }
}

/// Server-side ad insertion configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SsaiConfig {
    /// Reject ad breaks for encoders that are not running (default true)
    #[serde(default = "default_require_running")]
    pub require_running: bool,
    #[serde(default)]
    pub decision_server: DecisionServerKind,
    /// Used when the per-encoder SSAI settings carry no timeout
    #[serde(default = "default_decision_timeout_secs")]
    pub decision_timeout_secs: u64,
}

fn default_require_running() -> bool {
    true
}

fn default_decision_timeout_secs() -> u64 {
    10
}

impl Default for SsaiConfig {
    fn default() -> Self {
        Self {
            require_running: default_require_running(),
            decision_server: DecisionServerKind::default(),
            decision_timeout_secs: default_decision_timeout_secs(),
        }
    }
}

/// Configuration document persistence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory for per-encoder JSON documents (memory only if None)
    pub state_dir: Option<PathBuf>,
    /// Number of superseded versions kept per encoder
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    16
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            history_limit: default_history_limit(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub ssai: SsaiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ENCODER_CONTROL_BIND_ADDRESS -> server.bind_address
    /// - ENCODER_CONTROL_BRING_UP_TIMEOUT_SECS -> lifecycle.bring_up_timeout_secs
    /// - ENCODER_CONTROL_TEAR_DOWN_TIMEOUT_SECS -> lifecycle.tear_down_timeout_secs
    /// - ENCODER_CONTROL_REQUIRE_RUNNING -> ssai.require_running
    /// - ENCODER_CONTROL_DECISION_SERVER -> ssai.decision_server
    /// - ENCODER_CONTROL_STATE_DIR -> storage.state_dir
    /// - ENCODER_CONTROL_HISTORY_LIMIT -> storage.history_limit
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ENCODER_CONTROL_BIND_ADDRESS") {
            if !val.trim().is_empty() {
                self.server.bind_address = val;
            }
        }

        if let Ok(val) = env::var("ENCODER_CONTROL_BRING_UP_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.lifecycle.bring_up_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("ENCODER_CONTROL_TEAR_DOWN_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.lifecycle.tear_down_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("ENCODER_CONTROL_REQUIRE_RUNNING") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.ssai.require_running = true,
                "false" | "0" | "no" => self.ssai.require_running = false,
                _ => {}
            }
        }

        if let Ok(val) = env::var("ENCODER_CONTROL_DECISION_SERVER") {
            if let Ok(kind) = val.parse::<DecisionServerKind>() {
                self.ssai.decision_server = kind;
            }
        }

        if let Ok(val) = env::var("ENCODER_CONTROL_STATE_DIR") {
            if val.trim().is_empty() {
                self.storage.state_dir = None;
            } else {
                self.storage.state_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("ENCODER_CONTROL_HISTORY_LIMIT") {
            if let Ok(limit) = val.parse::<usize>() {
                self.storage.history_limit = limit;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}
