use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

const ENV_PREFIX: &str = "FAULTLINE";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Process configuration: defaults, then an optional TOML file, then
/// `FAULTLINE_*` environment variables (`FAULTLINE_RECOVERY__SKIP_FRAMES=2`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub recovery: RecoveryConfig,
    pub body: BodyConfig,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Frames to drop from the top of a panic stack, counted from the first
    /// frame below the panic runtime.
    pub skip_frames: usize,
    pub sink: SinkKind,
    pub sentinel_on_missing_source: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BodyConfig {
    /// Largest request body buffered for diagnostics, in bytes.
    pub limit: usize,
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self { limit: 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Tracing,
    Stdout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build()?.try_deserialize()?;
        Ok(cfg)
    }
}
