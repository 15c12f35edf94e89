mod settings;

use config::{Config, Environment, File};

use crate::config::settings::PartialSettings;
use crate::utils::HubError;

pub use settings::{HubSettings, LogSettings, RouteSettings, ServerSettings, Settings};

/// Prefix for environment overrides, e.g. `CHATHUB__SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "CHATHUB";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing the server, hub and log configurations
pub fn load_config() -> Result<Settings, HubError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.allowed_origins")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merge(partial))
}

#[cfg(test)]
mod tests;
