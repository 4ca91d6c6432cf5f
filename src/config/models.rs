use garde::Validate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
pub struct SessionConfig {
    #[garde(dive)]
    #[serde(default)]
    pub cache: CacheSettings,

    #[garde(dive)]
    #[serde(default)]
    pub identity: IdentitySettings,

    #[garde(dive)]
    #[serde(default)]
    pub credentials: CredentialSettings,

    #[garde(dive)]
    #[serde(default)]
    pub cipher: CipherSettings,

    #[garde(dive)]
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings for the app-level generic cache.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CacheSettings {
    #[garde(range(min = 16, max = 1_000_000))]
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    #[garde(range(min = 1, max = 86_400))]
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_seconds: u64,

    #[garde(range(min = 1, max = 3_600))]
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl_seconds: 300,
            sweep_interval_seconds: 60,
        }
    }
}

/// Settings for the session identity cache.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct IdentitySettings {
    #[garde(range(min = 1, max = 86_400))]
    #[serde(default = "default_identity_ttl")]
    pub ttl_seconds: u64,

    #[garde(range(min = 16, max = 1_000_000))]
    #[serde(default = "default_identity_max_entries")]
    pub max_entries: usize,
}

fn default_identity_ttl() -> u64 {
    300
}

fn default_identity_max_entries() -> usize {
    10_000
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            max_entries: 10_000,
        }
    }
}

/// Settings for the per-identity credential/client cache.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CredentialSettings {
    #[garde(range(min = 1, max = 86_400))]
    #[serde(default = "default_credential_ttl")]
    pub ttl_seconds: u64,

    #[garde(range(min = 1, max = 100_000))]
    #[serde(default = "default_max_identities")]
    pub max_identities: usize,

    #[garde(range(min = 1, max = 64))]
    #[serde(default = "default_max_clients")]
    pub max_clients_per_identity: usize,
}

fn default_credential_ttl() -> u64 {
    600
}

fn default_max_identities() -> usize {
    500
}

fn default_max_clients() -> usize {
    8
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 600,
            max_identities: 500,
            max_clients_per_identity: 8,
        }
    }
}

/// Symmetric key for credential encryption at rest.
///
/// The key is a hard startup precondition: an empty or malformed value fails
/// validation and the process must not start.
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
pub struct CipherSettings {
    #[garde(custom(validate_cipher_key))]
    #[serde(default)]
    pub key_hex: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoggingConfig {
    #[garde(length(min = 1))]
    #[serde(default = "default_log_level")]
    pub level: String, // trace, debug, info, warn, error

    #[garde(pattern(r"^(json|pretty)$"))]
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

// AES-256 key: exactly 32 bytes, hex-encoded.
fn validate_cipher_key(value: &str, _: &()) -> garde::Result {
    if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(garde::Error::new(
            "cipher key must be 64 hex characters (32 bytes)",
        ));
    }
    Ok(())
}
