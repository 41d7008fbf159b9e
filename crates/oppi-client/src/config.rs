//! Client configuration.
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `OPPI__SECTION__KEY` environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::command::CommandSettings;
use crate::router::RouterSettings;
use crate::sources::{CredentialsProvider, StaticCredentials};
use crate::timeline::TimelineLimits;
use crate::transport::{SendPolicy, WsSettings};

pub const APP_NAME: &str = "oppi";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub commands: CommandsConfig,
    pub sync: SyncConfig,
    pub limits: LimitsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token for the stream endpoint.
    pub token: Option<String>,
    pub tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7749,
            token: None,
            tls: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub send_wait_timeout_ms: u64,
    pub send_poll_interval_ms: u64,
    pub send_timeout_ms: u64,
    /// Exponent base of the reconnect backoff.
    pub reconnect_base: f64,
    pub reconnect_max_delay_ms: u64,
    /// 0 retries forever.
    pub max_reconnect_attempts: u32,
    pub inbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_wait_timeout_ms: 5_000,
            send_poll_interval_ms: 100,
            send_timeout_ms: 10_000,
            reconnect_base: 2.0,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 0,
            inbound_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub ack_timeout_ms: u64,
    pub max_send_attempts: u32,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 15_000,
            max_send_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub freshness_threshold_secs: u64,
    pub unsubscribe_grace_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            freshness_threshold_secs: 60,
            unsubscribe_grace_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub tool_output_item_bytes: usize,
    pub tool_output_total_bytes: usize,
    pub tool_args_item_bytes: usize,
    pub tool_args_total_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = TimelineLimits::default();
        Self {
            tool_output_item_bytes: limits.tool_output_item_bytes,
            tool_output_total_bytes: limits.tool_output_total_bytes,
            tool_args_item_bytes: limits.tool_args_item_bytes,
            tool_args_total_bytes: limits.tool_args_total_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ClientConfig {
    pub fn credentials(&self) -> StaticCredentials {
        StaticCredentials {
            host: self.server.host.clone(),
            port: self.server.port,
            token: self.server.token.clone(),
            tls: self.server.tls,
        }
    }

    pub fn ws_settings(&self) -> WsSettings {
        let transport = &self.transport;
        WsSettings {
            url: self.credentials().stream_url(),
            send: SendPolicy {
                wait_timeout: Duration::from_millis(transport.send_wait_timeout_ms),
                poll_interval: Duration::from_millis(transport.send_poll_interval_ms),
                send_timeout: Duration::from_millis(transport.send_timeout_ms),
            },
            reconnect_base: transport.reconnect_base,
            reconnect_max_delay: Duration::from_millis(transport.reconnect_max_delay_ms),
            max_reconnect_attempts: (transport.max_reconnect_attempts > 0)
                .then_some(transport.max_reconnect_attempts),
            inbound_buffer: transport.inbound_buffer.max(1),
        }
    }

    pub fn command_settings(&self) -> CommandSettings {
        CommandSettings {
            ack_timeout: Duration::from_millis(self.commands.ack_timeout_ms),
            max_send_attempts: self.commands.max_send_attempts.max(1),
        }
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            unsubscribe_grace: Duration::from_millis(self.sync.unsubscribe_grace_ms),
            freshness_threshold: Duration::from_secs(self.sync.freshness_threshold_secs),
        }
    }

    pub fn timeline_limits(&self) -> TimelineLimits {
        TimelineLimits {
            tool_output_item_bytes: self.limits.tool_output_item_bytes,
            tool_output_total_bytes: self.limits.tool_output_total_bytes,
            tool_args_item_bytes: self.limits.tool_args_item_bytes,
            tool_args_total_bytes: self.limits.tool_args_total_bytes,
        }
    }
}

/// Load the configuration, writing a default file first if none exists.
pub fn load_or_init_config(config_file: &Path) -> Result<ClientConfig> {
    if !config_file.exists() {
        write_default_config(config_file)?;
    }
    load_config(config_file)
}

/// Load the configuration without touching the filesystem.
pub fn load_config(config_file: &Path) -> Result<ClientConfig> {
    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 7749_i64)?
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()
        .with_context(|| format!("loading config from {}", config_file.display()))?;

    let config: ClientConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;
    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = ClientConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}

/// The `--config` override (expanded), or the default location.
pub fn resolve_config_path(override_path: Option<&Path>) -> Result<PathBuf> {
    match override_path {
        Some(path) => expand_path(path),
        None => Ok(default_config_dir()?.join("config.toml")),
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => expand_str_path(text),
        None => Ok(path.to_path_buf()),
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 7749);
        assert_eq!(config.commands.max_send_attempts, 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_file_overrides_section() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[server]\nhost = \"pi.local\"\ntls = true\n\n[commands]\nack_timeout_ms = 500\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.host, "pi.local");
        assert!(config.server.tls);
        assert_eq!(config.server.port, 7749);
        assert_eq!(
            config.command_settings().ack_timeout,
            Duration::from_millis(500)
        );
        assert_eq!(config.transport.reconnect_base, 2.0);
    }

    #[test]
    fn test_default_file_written_and_reloadable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = load_or_init_config(&path).unwrap();
        assert!(path.exists());

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for oppi"));
        assert!(body.contains("[server]"));
        assert_eq!(config.sync.unsubscribe_grace_ms, 30_000);
    }

    #[test]
    fn test_ws_settings_mapping() {
        let mut config = ClientConfig::default();
        config.server.token = Some("t0k".to_string());
        config.transport.max_reconnect_attempts = 0;
        let ws = config.ws_settings();
        assert_eq!(ws.url, "ws://127.0.0.1:7749/stream?token=t0k");
        assert_eq!(ws.max_reconnect_attempts, None);

        config.transport.max_reconnect_attempts = 5;
        assert_eq!(config.ws_settings().max_reconnect_attempts, Some(5));
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "OPPI");
    }
}
