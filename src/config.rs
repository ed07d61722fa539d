//! Configuration file support for livedebug
//!
//! Config is loaded from `~/.livedebug/config.toml` (or `$LIVEDEBUG_HOME/config.toml`)
//! Environment variables override config file settings.

use crate::storage::livedebug_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global config instance (loaded once on first access)
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::load)
}

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Debugger feature flags
    pub debugger: DebuggerConfig,

    /// Port reservation for forked processes
    pub ports: PortsConfig,

    /// How the forked copy of the application is launched
    pub fork: ForkConfig,

    /// Script-debugging connection to the forked process
    pub bridge: BridgeConfig,

    /// HTTP request replay
    pub replay: ReplayConfig,

    /// Orphan session detection
    pub orphan: OrphanConfig,

    /// Persistent connection to the remote controller
    pub controller: ControllerConfig,

    /// Capture criteria refresh
    pub capture: CaptureConfig,
}

/// Debugger feature flags. Everything is off by default.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Allow debugging sessions at all (default: false)
    pub enabled: bool,
    /// Allow live source editing in the forked process (default: false)
    pub edit_source: bool,
    /// Allow expression evaluation (default: false)
    pub eval_expression: bool,
    /// Root of the working tree exposed to directory listing (default: cwd)
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// First port of the private reservation range
    pub range_start: u16,
    /// Last port of the private reservation range (inclusive)
    pub range_end: u16,
    /// Bind attempts per port before the reservation fails
    pub retries: u32,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: 40000,
            range_end: 59999,
            retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    /// Program to run (default: the current executable)
    pub command: Option<String>,
    /// Arguments (default: the current process arguments).
    /// `{debug_port}` and `{callback_port}` are substituted.
    pub args: Option<Vec<String>>,
    /// Ports the application listens on; each gets a reassigned port in the fork
    pub listen_ports: Vec<u16>,
    /// Wait for the child to report ready on the callback port (default: true)
    pub wait_for_ready: bool,
    /// Seconds to wait for the ready signal
    pub ready_timeout_secs: u64,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: None,
            listen_ports: vec![8080],
            wait_for_ready: true,
            ready_timeout_secs: 15,
        }
    }
}

impl ForkConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Seconds to wait for the debug port to accept a connection
    pub attach_timeout_secs: u64,
    /// Seconds before a single protocol call is abandoned
    pub call_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            attach_timeout_secs: 10,
            call_timeout_secs: 10,
        }
    }
}

impl BridgeConfig {
    pub fn attach_timeout(&self) -> Duration {
        Duration::from_secs(self.attach_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Seconds before a replayed request times out. Long, since the
    /// request may sit on a breakpoint while someone steps through it.
    pub timeout_secs: u64,
    /// Seconds to wait for the child to acknowledge pushed session data
    pub session_ack_timeout_secs: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            session_ack_timeout_secs: 5,
        }
    }
}

impl ReplayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn session_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.session_ack_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanConfig {
    /// Seconds between liveness checks
    pub check_interval_secs: u64,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
        }
    }
}

impl OrphanConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// WebSocket URL of the controller (e.g. "wss://router.example.com/agent")
    pub url: Option<String>,
    /// Auth token sent in the hello handshake (prefer LIVEDEBUG_TOKEN env var)
    pub token: Option<String>,
    /// Name this agent reports to the controller
    pub client_name: String,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay_ms: u64,
    /// Seconds to wait for the welcome message
    pub handshake_timeout_secs: u64,
    /// Seconds before an outgoing call to the controller is abandoned
    pub call_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            client_name: "livedebug".to_string(),
            reconnect_delay_ms: 2000,
            handshake_timeout_secs: 10,
            call_timeout_secs: 10,
        }
    }
}

impl ControllerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.max(100))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Seconds between capture criteria refreshes
    pub refresh_interval_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
        }
    }
}

impl Config {
    /// Get the config file path
    pub fn path() -> Option<PathBuf> {
        livedebug_dir().ok().map(|d| d.join("config.toml"))
    }

    /// Load config from file, with environment variable overrides
    pub fn load() -> Self {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    /// Parse a TOML document (no env overrides)
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str::<Self>(content)?)
    }

    fn load_from_file() -> Option<Self> {
        let path = Self::path()?;
        if !path.exists() {
            return None;
        }

        let content = std::fs::read_to_string(&path).ok()?;
        match Self::from_toml_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                crate::logging::error(&format!("Failed to parse config file: {}", e));
                None
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        // Debugger flags
        if let Ok(v) = std::env::var("LIVEDEBUG_ENABLED") {
            if let Some(parsed) = parse_env_bool(&v) {
                self.debugger.enabled = parsed;
            }
        }
        if let Ok(v) = std::env::var("LIVEDEBUG_EDIT_SOURCE") {
            if let Some(parsed) = parse_env_bool(&v) {
                self.debugger.edit_source = parsed;
            }
        }
        if let Ok(v) = std::env::var("LIVEDEBUG_EVAL_EXPRESSION") {
            if let Some(parsed) = parse_env_bool(&v) {
                self.debugger.eval_expression = parsed;
            }
        }
        if let Ok(v) = std::env::var("LIVEDEBUG_WORKING_DIR") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.debugger.working_dir = Some(PathBuf::from(trimmed));
            }
        }

        // Ports
        if let Ok(v) = std::env::var("LIVEDEBUG_PORT_RANGE") {
            if let Some((start, end)) = parse_port_range(&v) {
                self.ports.range_start = start;
                self.ports.range_end = end;
            }
        }

        // Fork
        if let Ok(v) = std::env::var("LIVEDEBUG_FORK_COMMAND") {
            let trimmed = v.trim().to_string();
            if !trimmed.is_empty() {
                self.fork.command = Some(trimmed);
            }
        }
        if let Ok(v) = std::env::var("LIVEDEBUG_LISTEN_PORTS") {
            let ports: Vec<u16> = v
                .split(',')
                .filter_map(|p| p.trim().parse().ok())
                .collect();
            if !ports.is_empty() {
                self.fork.listen_ports = ports;
            }
        }

        // Orphan checks
        if let Ok(v) = std::env::var("LIVEDEBUG_ORPHAN_INTERVAL") {
            if let Ok(secs) = v.trim().parse::<u64>() {
                self.orphan.check_interval_secs = secs;
            }
        }

        // Controller
        if let Ok(v) = std::env::var("LIVEDEBUG_CONTROLLER_URL") {
            let trimmed = v.trim().to_string();
            if !trimmed.is_empty() {
                self.controller.url = Some(trimmed);
            }
        }
        if let Ok(v) = std::env::var("LIVEDEBUG_TOKEN") {
            let trimmed = v.trim().to_string();
            if !trimmed.is_empty() {
                self.controller.token = Some(trimmed);
            }
        }
        if let Ok(v) = std::env::var("LIVEDEBUG_RECONNECT_DELAY_MS") {
            if let Ok(ms) = v.trim().parse::<u64>() {
                self.controller.reconnect_delay_ms = ms;
            }
        }
    }

    /// Root directory exposed to `list_directory`
    pub fn working_dir(&self) -> PathBuf {
        self.debugger
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Create a default config file with comments
    pub fn create_default_config_file() -> anyhow::Result<PathBuf> {
        let path = Self::path().ok_or_else(|| anyhow::anyhow!("No config path"))?;

        if let Some(parent) = path.parent() {
            crate::storage::ensure_dir(parent)?;
        }

        let default_content = r#"# livedebug configuration file
# Location: ~/.livedebug/config.toml
#
# Environment variables (LIVEDEBUG_*) override these settings.

[debugger]
# Allow the controller to start debugging sessions (default: false)
enabled = false
# Allow editing script source in the forked process (default: false)
edit_source = false
# Allow evaluating expressions in the forked process (default: false)
eval_expression = false
# Root of the tree exposed to directory listing (default: current directory)
# working_dir = "/srv/app"

[ports]
# Private range used for reassigned, callback and debug ports
range_start = 40000
range_end = 59999
# Bind attempts per port before giving up
retries = 5

[fork]
# Program and arguments for the forked copy (default: re-run this executable)
# {debug_port} and {callback_port} are substituted in args.
# command = "node"
# args = ["--inspect=127.0.0.1:{debug_port}", "server.js"]
# Ports the application listens on
listen_ports = [8080]
# Wait for the child to report ready on the callback port
wait_for_ready = true
ready_timeout_secs = 15

[bridge]
attach_timeout_secs = 10
call_timeout_secs = 10

[replay]
timeout_secs = 600
session_ack_timeout_secs = 5

[orphan]
check_interval_secs = 30

[controller]
# url = "wss://router.example.com/agent"
# token = ""  # prefer LIVEDEBUG_TOKEN env var
client_name = "livedebug"
reconnect_delay_ms = 2000
handshake_timeout_secs = 10
call_timeout_secs = 10

[capture]
refresh_interval_secs = 300
"#;

        std::fs::write(&path, default_content)?;
        Ok(path)
    }

    /// Get config as a formatted string for display
    pub fn display_string(&self) -> String {
        let path = Self::path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        format!(
            r#"Configuration ({})

Debugger:
- Enabled: {}
- Edit source: {}
- Eval expression: {}
- Working dir: {}

Ports:
- Range: {}-{}
- Retries: {}

Fork:
- Command: {}
- Listen ports: {:?}
- Wait for ready: {} ({}s)

Controller:
- URL: {}
- Token: {}
- Reconnect delay: {}ms

Orphan check interval: {}s
Replay timeout: {}s
"#,
            path,
            self.debugger.enabled,
            self.debugger.edit_source,
            self.debugger.eval_expression,
            self.working_dir().display(),
            self.ports.range_start,
            self.ports.range_end,
            self.ports.retries,
            self.fork.command.as_deref().unwrap_or("(current executable)"),
            self.fork.listen_ports,
            self.fork.wait_for_ready,
            self.fork.ready_timeout_secs,
            self.controller.url.as_deref().unwrap_or("(not set)"),
            if self.controller.token.is_some() {
                "set"
            } else {
                "(not set)"
            },
            self.controller.reconnect_delay_ms,
            self.orphan.check_interval_secs,
            self.replay.timeout_secs,
        )
    }
}

fn parse_env_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_port_range(raw: &str) -> Option<(u16, u16)> {
    let (start, end) = raw.trim().split_once('-')?;
    let start: u16 = start.trim().parse().ok()?;
    let end: u16 = end.trim().parse().ok()?;
    if start == 0 || start > end {
        return None;
    }
    Some((start, end))
}
