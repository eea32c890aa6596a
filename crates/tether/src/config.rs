//! Layered runtime configuration.
//!
//! Precedence, lowest to highest: built-in defaults, an optional TOML file
//! (`$XDG_CONFIG_HOME/tether/config.toml` or an explicit `--config` path),
//! then `TETHER__*` environment variables with `__` as the section
//! separator (`TETHER__SERVER__PORT=9000`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "TETHER";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Initial reconnect backoff in milliseconds.
    pub backoff_base_ms: u64,
    /// Reconnect backoff ceiling in milliseconds.
    pub backoff_cap_ms: u64,
    /// Frames buffered while a dialing transport is disconnected.
    pub buffer_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    /// Default tool timeout in milliseconds.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub transport: TransportSettings,
    pub tools: ToolSettings,
}

impl Settings {
    /// Load settings, layering file and environment over defaults.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let path = match config_file {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path(),
        };

        let mut builder = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 7617_i64)?
            .set_default("transport.backoff_base_ms", 1_000_i64)?
            .set_default("transport.backoff_cap_ms", 30_000_i64)?
            .set_default("transport.buffer_cap", 1_000_i64)?
            .set_default("tools.timeout_ms", 120_000_i64)?;

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.as_path())
                    .format(FileFormat::Toml)
                    .required(config_file.is_some()),
            );
        }

        builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize()
            .context("invalid configuration")
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 7617,
            },
            transport: TransportSettings {
                backoff_base_ms: 1_000,
                backoff_cap_ms: 30_000,
                buffer_cap: 1_000,
            },
            tools: ToolSettings {
                timeout_ms: 120_000,
            },
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tether").join("config.toml"))
}
