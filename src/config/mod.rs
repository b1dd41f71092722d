mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, LogSettings, PartialSettings, ServerSettings, Settings, TransportSettings,
};

/// Prefix of environment overrides, e.g. `TIDEMQ__SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "TIDEMQ";

/// Loads the configuration from `config/default` (if present) and
/// environment variables, merged over `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}
