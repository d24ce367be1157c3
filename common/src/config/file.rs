use config::{Config, ConfigError, Environment, File};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_PATHS: [&str; 3] = [
    "/etc/pgshuttle/pgshuttle.toml",
    "~/.config/pgshuttle/pgshuttle.toml",
    "pgshuttle.toml",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ShuttleConfig {
    pub tools: ToolsConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ToolsConfig {
    /// Directory holding one `<major>/bin` tree per PostgreSQL version
    pub root: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Chunks buffered between two pipeline stages
    pub channel_capacity: usize,
    /// Connect timeout for remote archives, in seconds
    pub http_connect_timeout_secs: u64,
}

impl ShuttleConfig {
    /// Tools root with a leading `~` expanded.
    pub fn tools_root(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.tools.root).into_owned())
    }

    /// Effective configuration as TOML.
    pub fn render(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Loads the configuration. Later sources override earlier ones: built-in
/// defaults, the well-known config files, `explicit`, then `PGSHUTTLE_*`
/// environment variables (`PGSHUTTLE_TOOLS__ROOT`, ...).
pub fn load_config(explicit: Option<&Path>) -> Result<ShuttleConfig, ConfigError> {
    let config_builder = Config::builder()
        .set_default("tools.root", "/usr/lib/postgresql")?
        .set_default("pipeline.channel_capacity", 16)?
        .set_default("pipeline.http_connect_timeout_secs", 30)?;

    let config_builder = CONFIG_PATHS.iter().fold(config_builder, |builder, path| {
        let path = shellexpand::tilde(path).into_owned();
        if Path::new(&path).exists() {
            debug!("Reading configuration from {path}");
            builder.add_source(File::with_name(&path))
        } else {
            builder
        }
    });

    let config_builder = match explicit {
        Some(path) => {
            info!("Reading configuration from {}", path.display());
            config_builder.add_source(File::from(path).required(true))
        }
        None => config_builder,
    };

    config_builder
        .add_source(
            Environment::with_prefix("PGSHUTTLE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
