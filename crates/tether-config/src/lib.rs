//! Multi-tier TOML configuration for Tether.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > explicit config file > global config file > defaults

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_client::{ClientConfig, ReconnectPolicy};
use tether_transport::TransportConfig;
use tether_types::schema::{
    ClientCapabilities, Implementation, ListChangedCapability, Root, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Errors raised while loading or resolving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Unknown server '{name}' (configured: {available})")]
    UnknownServer { name: String, available: String },

    #[error("Missing required configuration: {key}")]
    MissingKey { key: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerSettings>,
}

/// `[client]` section. Unset fields fall through to the next tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSettings {
    pub name: Option<String>,
    pub version: Option<String>,
    pub protocol_version: Option<String>,
    /// Per-request timeout; 0 disables it.
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub capabilities: CapabilitySettings,
    /// Roots exposed to servers through `roots/list`.
    #[serde(default)]
    pub roots: Vec<Root>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySettings {
    pub roots_list_changed: Option<bool>,
    pub sampling: Option<bool>,
}

/// `[servers.<name>]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Ping interval on persistent transports; absent disables the heartbeat.
    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,
    /// Overrides `[client].request_timeout_ms` for this server.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_jitter() -> f64 {
    0.25
}

/// `[servers.<name>.reconnect]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default)]
    pub enabled: bool,
    /// 0 means unlimited.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl ReconnectSettings {
    fn to_policy(&self, server: &str) -> Result<ReconnectPolicy, ConfigError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidValue {
                key: format!("servers.{server}.reconnect.jitter"),
                message: format!("{} is outside 0.0..=1.0", self.jitter),
            });
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: format!("servers.{server}.reconnect.base_delay_ms"),
                message: format!(
                    "{} exceeds max_delay_ms ({})",
                    self.base_delay_ms, self.max_delay_ms
                ),
            });
        }
        Ok(ReconnectPolicy {
            enabled: self.enabled,
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        })
    }
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Explicit config file (`--config`).
    pub config_file: Option<PathBuf>,
    pub request_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
}

/// Everything needed to connect to one server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub transport: TransportConfig,
    pub client: ClientConfig,
    pub roots: Vec<Root>,
}

/// Merged configuration from every tier.
#[derive(Debug, Clone)]
pub struct TetherConfig {
    pub config_dir: PathBuf,
    pub settings: SettingsFile,
    overrides: CliOverrides,
}

impl TetherConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Explicit config file (`--config`)
    /// 3. Global config (~/.tether/config.toml)
    /// 4. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        Self::load_from(config_dir(), overrides)
    }

    /// Like [`load`](Self::load) with an explicit config directory.
    pub fn load_from(config_dir: PathBuf, overrides: CliOverrides) -> Result<Self, ConfigError> {
        let global = load_settings_file(&config_dir.join("config.toml"));
        let settings = match &overrides.config_file {
            Some(path) => read_settings_file(path)?.layered_over(global),
            None => global,
        };
        Ok(Self {
            config_dir,
            settings,
            overrides,
        })
    }

    /// Names of every configured server, sorted.
    pub fn server_names(&self) -> Vec<String> {
        self.settings.servers.keys().cloned().collect()
    }

    /// Resolve the runtime configuration for server `name`.
    pub fn server(&self, name: &str) -> Result<ServerConfig, ConfigError> {
        let server = self
            .settings
            .servers
            .get(name)
            .ok_or_else(|| ConfigError::UnknownServer {
                name: name.to_string(),
                available: match self.server_names() {
                    names if names.is_empty() => "none".to_string(),
                    names => names.join(", "),
                },
            })?;

        if let TransportConfig::Stdio(stdio) = &server.transport {
            if stdio.command.trim().is_empty() {
                return Err(ConfigError::MissingKey {
                    key: format!("servers.{name}.command"),
                });
            }
        }

        let client = &self.settings.client;
        let defaults = ClientConfig::default();

        let protocol_version = client
            .protocol_version
            .clone()
            .unwrap_or(defaults.protocol_version);
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&protocol_version.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "client.protocol_version".into(),
                message: format!(
                    "'{protocol_version}' is not one of {}",
                    SUPPORTED_PROTOCOL_VERSIONS.join(", ")
                ),
            });
        }

        // Resolve timeout: CLI > server > client > default
        let request_timeout = self
            .overrides
            .request_timeout_ms
            .or(server.request_timeout_ms)
            .or(client.request_timeout_ms)
            .map(|ms| (ms > 0).then(|| Duration::from_millis(ms)))
            .unwrap_or(defaults.request_timeout);

        let heartbeat_interval = self
            .overrides
            .heartbeat_interval_ms
            .or(server.heartbeat_interval_ms)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let mut capabilities = ClientCapabilities::default();
        if client.capabilities.roots_list_changed.is_some() || !client.roots.is_empty() {
            capabilities.roots = Some(ListChangedCapability {
                list_changed: Some(client.capabilities.roots_list_changed.unwrap_or(true)),
            });
        }
        if client.capabilities.sampling == Some(true) {
            capabilities.sampling = Some(Default::default());
        }

        Ok(ServerConfig {
            name: name.to_string(),
            transport: server.transport.clone(),
            client: ClientConfig {
                client_info: Implementation::new(
                    client
                        .name
                        .clone()
                        .unwrap_or(defaults.client_info.name),
                    client
                        .version
                        .clone()
                        .unwrap_or(defaults.client_info.version),
                ),
                capabilities,
                protocol_version,
                request_timeout,
                heartbeat_interval,
                reconnect: server.reconnect.to_policy(name)?,
            },
            roots: client.roots.clone(),
        })
    }
}

impl SettingsFile {
    /// Merge `self` over `lower`: set fields win, servers merge by name.
    fn layered_over(self, lower: SettingsFile) -> SettingsFile {
        let upper = self.client;
        let lower_client = lower.client;
        let mut servers = lower.servers;
        servers.extend(self.servers);

        SettingsFile {
            client: ClientSettings {
                name: upper.name.or(lower_client.name),
                version: upper.version.or(lower_client.version),
                protocol_version: upper.protocol_version.or(lower_client.protocol_version),
                request_timeout_ms: upper.request_timeout_ms.or(lower_client.request_timeout_ms),
                capabilities: CapabilitySettings {
                    roots_list_changed: upper
                        .capabilities
                        .roots_list_changed
                        .or(lower_client.capabilities.roots_list_changed),
                    sampling: upper
                        .capabilities
                        .sampling
                        .or(lower_client.capabilities.sampling),
                },
                roots: if upper.roots.is_empty() {
                    lower_client.roots
                } else {
                    upper.roots
                },
            },
            servers,
        }
    }
}

/// Get the Tether config directory path (~/.tether/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TETHER_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
}

/// Load and parse the global settings file, returning defaults on any error.
fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}

/// Load a file the user asked for by name. Unlike the global file, any
/// failure here is an error.
fn read_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
