mod settings;

use std::path::Path;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BrokerSettings, ServerSettings, Settings};

/// Default configuration file, resolved relative to the working directory.
/// Any extension supported by the `config` crate is accepted.
pub const DEFAULT_CONFIG_FILE: &str = "config/default";

/// Prefix for environment overrides, e.g. `BROKE_SERVER__PORT=1884`.
pub const ENV_PREFIX: &str = "BROKE";

/// Loads the configuration from the default file and environment variables
/// and merges it with default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(Path::new(DEFAULT_CONFIG_FILE))
}

/// Like [`load_config`] but reads the file at `path` (optional, may be
/// missing) instead of the default location.
pub fn load_config_from(path: &Path) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::from(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
