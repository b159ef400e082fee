mod settings;

use config::{Config, Environment, File};

use settings::PartialSettings;

pub use config::ConfigError;
pub use settings::{BrokerSettings, LoggingSettings, ServerSettings, Settings};

/// Environment variables with this prefix override file values,
/// e.g. `TIDEMQ_SERVER__PORT=5000`.
pub const ENV_PREFIX: &str = "TIDEMQ";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing the server, broker and logging configurations
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
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
