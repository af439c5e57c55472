pub mod config_cmd;
pub mod events;
pub mod parse_action;

use std::path::Path;

use toolwright_config::{ConfigError, RuntimeConfig};

/// Load the config from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, ConfigError> {
    match path {
        Some(path) => {
            let mut config = RuntimeConfig::load_from(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok())?;
            config.validate()?;
            Ok(config)
        }
        None => RuntimeConfig::load(),
    }
}
