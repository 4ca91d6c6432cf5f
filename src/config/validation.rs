use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use garde::Validate;

use super::SessionConfig;

/// Load configuration with the embedded-defaults / file / env hierarchy.
///
/// All values are fixed at process start; there is no runtime mutation
/// surface. Validation failures (including a missing or malformed cipher
/// key) are fatal.
pub fn load_config() -> Result<SessionConfig> {
    let env_name =
        std::env::var("ENVIRONMENT").unwrap_or_else(|_| "production".to_string());

    let figment = Figment::new()
        // 1. Embedded defaults (lowest priority)
        .merge(Serialized::defaults(SessionConfig::default()))
        // 2. Default config file
        .merge(Toml::file("config/default.toml").nested())
        // 3. Environment-specific config
        .merge(Toml::file(format!("config/{}.toml", env_name)).nested())
        // 4. Environment variables with PROMPTER_ prefix (highest priority)
        .merge(Env::prefixed("PROMPTER_").split("__"));

    let config: SessionConfig = figment.extract()?;

    config.validate()?;

    Ok(config)
}
