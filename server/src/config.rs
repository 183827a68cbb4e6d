use config::load_config;
use config::shared::ServerConfig;

/// Loads the server configuration from `./configuration` and the environment.
///
/// Validation runs as part of loading, see [`config::Config::validate`].
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
    let config = load_config::<ServerConfig>()?;

    Ok(config)
}
