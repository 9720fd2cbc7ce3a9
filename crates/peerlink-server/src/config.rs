//! Relay configuration: TOML file + CLI overrides.

use peerlink_core::{RelayError, RelayResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub sessions: SessionsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            read_chunk_size: default_read_chunk_size(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// `[engine]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default = "default_data_channel_label")]
    pub data_channel_label: String,
    #[serde(default = "default_gathering_timeout")]
    pub gathering_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            data_channel_label: default_data_channel_label(),
            gathering_timeout_secs: default_gathering_timeout(),
        }
    }
}

/// `[sessions]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default)]
    pub ttl_secs: u64,
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
    #[serde(default)]
    pub evict_on_disconnect: bool,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            ttl_secs: 0,
            gc_interval_secs: default_gc_interval(),
            evict_on_disconnect: false,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_read_chunk_size() -> usize {
    1024
}
fn default_max_frame_size() -> usize {
    peerlink_core::DEFAULT_MAX_FRAME_SIZE
}
fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
fn default_data_channel_label() -> String {
    "dataChannel".to_string()
}
fn default_gathering_timeout() -> u64 {
    30
}
fn default_gc_interval() -> u64 {
    60
}

/// Values given on the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub stun_servers: Vec<String>,
    pub gathering_timeout_secs: Option<u64>,
    pub session_ttl_secs: Option<u64>,
    pub evict_on_disconnect: bool,
}

/// Resolved relay configuration (file loaded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    pub read_chunk_size: usize,
    pub max_frame_size: usize,
    pub stun_servers: Vec<String>,
    pub data_channel_label: String,
    pub gathering_timeout: Option<Duration>,
    pub session_ttl: Option<Duration>,
    pub gc_interval: Duration,
    pub evict_on_disconnect: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), &CliOverrides::default())
    }
}

impl RelayConfig {
    /// Load config from TOML file, then apply CLI overrides and validate.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::from_file(file_config, cli);
        config.validate()?;
        Ok(config)
    }

    fn from_file(file: ConfigFile, cli: &CliOverrides) -> Self {
        let stun_servers = if cli.stun_servers.is_empty() {
            file.engine.stun_servers
        } else {
            cli.stun_servers.clone()
        };
        let gathering_timeout_secs = cli
            .gathering_timeout_secs
            .unwrap_or(file.engine.gathering_timeout_secs);
        let ttl_secs = cli.session_ttl_secs.unwrap_or(file.sessions.ttl_secs);

        Self {
            bind: cli.bind.clone().unwrap_or(file.server.bind),
            port: cli.port.unwrap_or(file.server.port),
            read_chunk_size: file.server.read_chunk_size,
            max_frame_size: file.server.max_frame_size,
            stun_servers,
            data_channel_label: file.engine.data_channel_label,
            gathering_timeout: non_zero_secs(gathering_timeout_secs),
            session_ttl: non_zero_secs(ttl_secs),
            gc_interval: Duration::from_secs(file.sessions.gc_interval_secs.max(1)),
            evict_on_disconnect: cli.evict_on_disconnect || file.sessions.evict_on_disconnect,
        }
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> RelayResult<()> {
        if self.stun_servers.is_empty() {
            return Err(RelayError::Config(
                "at least one STUN server is required".to_string(),
            ));
        }
        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(RelayError::Config(format!(
                    "STUN server must start with stun: or stuns:, got {url}"
                )));
            }
        }
        if self.read_chunk_size == 0 {
            return Err(RelayError::Config("read_chunk_size must be non-zero".into()));
        }
        if self.read_chunk_size > self.max_frame_size {
            return Err(RelayError::Config(format!(
                "read_chunk_size ({}) exceeds max_frame_size ({})",
                self.read_chunk_size, self.max_frame_size
            )));
        }
        if self.data_channel_label.is_empty() {
            return Err(RelayError::Config("data_channel_label must not be empty".into()));
        }
        Ok(())
    }

    /// `bind:port` for the control listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
