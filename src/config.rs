use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where persistent state lives
    #[serde(default)]
    pub state: StateConfig,

    /// The supervised gateway backend
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Password protecting the /setup namespace.
    /// When unset, every authenticated setup endpoint answers 500.
    pub setup_password: Option<String>,

    /// Maximum idle connections kept to the gateway (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for the gateway's response head, in seconds (default: 120)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            setup_password: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StateConfig {
    /// State directory (default: ~/.wakegate)
    pub dir: Option<PathBuf>,

    /// Workspace directory handed to the gateway (default: <state>/workspace)
    pub workspace_dir: Option<PathBuf>,

    /// The gateway's own configuration file. Its existence is what
    /// "configured" means (default: <state>/gateway.json)
    pub config_path: Option<PathBuf>,
}

impl StateConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(default_state_dir)
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.workspace_dir
            .clone()
            .unwrap_or_else(|| self.state_dir().join("workspace"))
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("gateway.json"))
    }

    pub fn token_path(&self) -> PathBuf {
        self.state_dir().join(TOKEN_FILE_NAME)
    }
}

/// Name of the persisted token file inside the state directory
pub const TOKEN_FILE_NAME: &str = "gateway.token";

/// Configuration for the supervised gateway process
///
/// # Security Warning
///
/// `command`, `entry` and `args` are executed directly. Configuration files
/// must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Program to execute (default: node)
    #[serde(default = "default_gateway_command")]
    pub command: String,

    /// Optional first argument, e.g. the gateway's entry script
    pub entry: Option<String>,

    /// Launch arguments. `{port}` and `{token}` are substituted.
    #[serde(default = "default_gateway_args")]
    pub args: Vec<String>,

    /// Extra environment variables for the gateway
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Loopback host the gateway listens on (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,

    /// Internal port the gateway listens on (default: 18789)
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Explicit gateway token; takes priority over the persisted one
    pub token: Option<String>,

    /// Readiness deadline in milliseconds (default: 20000)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,

    /// Readiness poll interval in milliseconds (default: 250)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Path requested by the readiness probe (default: /)
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Time to let a terminated gateway release its port, in milliseconds (default: 750)
    #[serde(default = "default_restart_grace")]
    pub restart_grace_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command: default_gateway_command(),
            entry: None,
            args: default_gateway_args(),
            env: HashMap::new(),
            host: default_gateway_host(),
            port: default_gateway_port(),
            token: None,
            startup_timeout_ms: default_startup_timeout(),
            probe_interval_ms: default_probe_interval(),
            probe_path: default_probe_path(),
            restart_grace_ms: default_restart_grace(),
        }
    }
}

impl GatewayConfig {
    /// The fixed address the proxy forwards to
    pub fn target(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid gateway host '{}': {}", self.host, e))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    /// Full argument list for the gateway, placeholders substituted
    pub fn launch_args(&self, token: &str) -> Vec<String> {
        let port = self.port.to_string();
        self.entry
            .iter()
            .cloned()
            .chain(
                self.args
                    .iter()
                    .map(|arg| arg.replace("{port}", &port).replace("{token}", token)),
            )
            .collect()
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.command.trim().is_empty() {
            errors.push("gateway: 'command' must not be empty".to_string());
        }
        if self.port == 0 {
            errors.push("gateway: 'port' must be greater than 0".to_string());
        }
        if self.host.parse::<IpAddr>().is_err() {
            errors.push(format!(
                "gateway: 'host' must be an IP address, got '{}'",
                self.host
            ));
        }
        if self.probe_interval_ms == 0 {
            errors.push("gateway: 'probe_interval_ms' must be greater than 0".to_string());
        } else if self.probe_interval_ms >= self.startup_timeout_ms {
            errors.push(
                "gateway: 'probe_interval_ms' must be smaller than 'startup_timeout_ms'"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    120
}

fn default_state_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".wakegate")
}

fn default_gateway_command() -> String {
    "node".to_string()
}

fn default_gateway_args() -> Vec<String> {
    [
        "gateway", "run", "--bind", "loopback", "--port", "{port}", "--auth", "token", "--token",
        "{token}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    18789
}

fn default_startup_timeout() -> u64 {
    20_000
}

fn default_probe_interval() -> u64 {
    250
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_restart_grace() -> u64 {
    750
}

impl Config {
    /// Load configuration from a TOML file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Overlay environment variables on top of the file configuration.
    ///
    /// Takes a lookup function so callers can pass `std::env::var(..).ok()`
    /// or a fixed map. Blank values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(port) = get("WAKEGATE_PUBLIC_PORT").or_else(|| get("PORT")) {
            self.server.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid public port '{}': {}", port, e))?;
        }
        if let Some(bind) = get("WAKEGATE_BIND") {
            self.server.bind = bind;
        }
        if let Some(password) = get("SETUP_PASSWORD") {
            self.server.setup_password = Some(password);
        }
        if let Some(dir) = get("WAKEGATE_STATE_DIR") {
            self.state.dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = get("WAKEGATE_WORKSPACE_DIR") {
            self.state.workspace_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = get("WAKEGATE_CONFIG_PATH") {
            self.state.config_path = Some(PathBuf::from(path));
        }
        if let Some(token) = get("WAKEGATE_GATEWAY_TOKEN") {
            self.gateway.token = Some(token);
        }
        if let Some(host) = get("INTERNAL_GATEWAY_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = get("INTERNAL_GATEWAY_PORT") {
            self.gateway.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid gateway port '{}': {}", port, e))?;
        }
        if let Some(command) = get("WAKEGATE_GATEWAY_COMMAND") {
            self.gateway.command = command;
        }
        if let Some(entry) = get("WAKEGATE_GATEWAY_ENTRY") {
            self.gateway.entry = Some(entry);
        }

        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }
        if let Err(gateway_errors) = self.gateway.validate() {
            errors.extend(gateway_errors);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
