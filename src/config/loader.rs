//! Config loader facade over the `config` crate.

use super::sources::{add_global_file, add_workspace_files};
use super::BotConfig;
use crate::error::CoreError;
use config::{Config, Environment, File};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable prefix; nesting uses `__`
/// (e.g. `NETRICSA__STREAM__FLUSH_INTERVAL_MS=500`).
pub const ENV_PREFIX: &str = "NETRICSA";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with full precedence:
    /// defaults < global file < workspace files < environment.
    pub fn load(workspace_root: &Path) -> Result<BotConfig, CoreError> {
        let builder = Config::builder();
        let builder = add_global_file(builder)?;
        let builder = add_workspace_files(builder, workspace_root)?;
        let config = builder.add_source(env_source()).build()?;

        let bot_config: BotConfig = config.try_deserialize()?;
        debug!(workspace_root = %workspace_root.display(), "Configuration loaded");
        Ok(bot_config)
    }

    /// Load a single explicit file (still overridable from the environment).
    pub fn load_from_file(path: &Path) -> Result<BotConfig, CoreError> {
        if !path.exists() {
            return Err(CoreError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        let config = Config::builder()
            .add_source(File::from(PathBuf::from(path)).required(true))
            .add_source(env_source())
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Parse TOML text directly, without file or environment sources.
    pub fn from_toml_str(text: &str) -> Result<BotConfig, CoreError> {
        toml::from_str(text).map_err(|e| CoreError::Config(format!("Invalid TOML: {}", e)))
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
