//! Bridge configuration
//!
//! Defaults cover the common case; an optional TOML file and the
//! `SESSION_BRIDGE_AGENT_BIN` environment variable override them.

use crate::{BridgeError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent binary used when nothing else is configured
pub const DEFAULT_AGENT_BIN: &str = "codex";

/// Time allowed for the `initialize` response
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest message or tool output kept verbatim for display
pub const DEFAULT_MAX_ITEM_TEXT: usize = 20_000;

/// Number of most recent tool items that keep their full output
pub const DEFAULT_TOOL_OUTPUT_WINDOW: usize = 40;

const AGENT_BIN_ENV: &str = "SESSION_BRIDGE_AGENT_BIN";

/// Configuration for the bridge
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Agent executable to launch per workspace
    pub agent_bin: String,

    /// Arguments passed to the agent executable
    pub agent_args: Vec<String>,

    /// Client name reported in `initialize`
    pub client_name: String,

    /// Client version reported in `initialize`
    pub client_version: String,

    /// How long to wait for the `initialize` response
    pub handshake_timeout: Duration,

    /// Optional per-request timeout; `None` waits until the channel closes
    pub request_timeout: Option<Duration>,

    /// Truncation threshold for message and tool-output text
    pub max_item_text: usize,

    /// How many recent tool items keep their full output
    pub tool_output_window: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            agent_bin: DEFAULT_AGENT_BIN.to_string(),
            agent_args: vec!["app-server".to_string()],
            client_name: "session-bridge".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: None,
            max_item_text: DEFAULT_MAX_ITEM_TEXT,
            tool_output_window: DEFAULT_TOOL_OUTPUT_WINDOW,
        }
    }
}

/// On-disk shape of the config file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    agent: Option<AgentToml>,
    handshake_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    max_item_text: Option<usize>,
    tool_output_window: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentToml {
    bin: Option<String>,
    args: Option<Vec<String>>,
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<config_dir>/session-bridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("session-bridge").join("config.toml"))
    }

    /// Load the config file at `path`, falling back to defaults when it does
    /// not exist. The agent-binary environment override is applied last.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml_str(&content)?
        } else {
            Self::default()
        };
        if let Ok(bin) = std::env::var(AGENT_BIN_ENV) {
            if !bin.trim().is_empty() {
                config.agent_bin = bin;
            }
        }
        Ok(config)
    }

    /// Parse config from TOML text on top of the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let parsed: ConfigToml =
            toml::from_str(content).map_err(|e| BridgeError::Config(e.to_string()))?;
        let mut config = Self::default();
        if let Some(agent) = parsed.agent {
            if let Some(bin) = agent.bin.filter(|bin| !bin.trim().is_empty()) {
                config.agent_bin = bin;
            }
            if let Some(args) = agent.args {
                config.agent_args = args;
            }
        }
        if let Some(secs) = parsed.handshake_timeout_secs {
            config.handshake_timeout = Duration::from_secs(secs);
        }
        config.request_timeout = parsed.request_timeout_secs.map(Duration::from_secs);
        if let Some(max) = parsed.max_item_text {
            config.max_item_text = max;
        }
        if let Some(window) = parsed.tool_output_window {
            config.tool_output_window = window;
        }
        Ok(config)
    }

    pub fn with_agent_bin(mut self, bin: impl Into<String>) -> Self {
        self.agent_bin = bin.into();
        self
    }

    pub fn with_agent_args(mut self, args: Vec<String>) -> Self {
        self.agent_args = args;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_item_text(mut self, max: usize) -> Self {
        self.max_item_text = max;
        self
    }

    pub fn with_tool_output_window(mut self, window: usize) -> Self {
        self.tool_output_window = window;
        self
    }
}
