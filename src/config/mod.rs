mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    ConsumerSettings, LoggingSettings, PartialSettings, RedeliverySettings, Settings,
};

/// Environment variables look like `MQDISPATCH_CONSUMER__PREFETCH_LIMIT=50`.
pub const ENV_PREFIX: &str = "MQDISPATCH";

/// Loads the configuration from `config/default` (any format the `config`
/// crate understands, optional) and `MQDISPATCH_*` environment variables,
/// then merges what was found over the defaults.
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

    Ok(partial.merge_onto(Settings::default()))
}
