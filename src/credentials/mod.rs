//! Per-identity AI provider credentials
//!
//! Encrypted API keys live in the durable store; this module decrypts them,
//! validates their shape, and wraps them in ready-to-use provider clients
//! cached per identity.

mod cache;
pub mod cipher;
pub mod client;

pub use cache::{CachedHandle, ClientOutcome, CredentialCache, CredentialCacheConfig};
pub use cipher::SecretCipher;
pub use client::{build_client, AiClient, ClientError, GenerateRequest, GenerateResponse};

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Supported AI providers.
///
/// Serialized lowercase; the same strings are used as store column values,
/// cache-key segments, and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::OpenAi, Provider::Anthropic, Provider::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
        }
    }

    /// Shape check for a decrypted API key.
    ///
    /// Catches corrupt or truncated secrets before a client is built with
    /// them; it is not an authenticity check.
    pub fn key_matches(&self, key: &str) -> bool {
        self.key_pattern().is_match(key)
    }

    fn key_pattern(&self) -> &'static Regex {
        // Anthropic keys also start with "sk-", so its pattern must be the
        // more specific one and is checked on its own variant only.
        static OPENAI: OnceLock<Regex> = OnceLock::new();
        static ANTHROPIC: OnceLock<Regex> = OnceLock::new();
        static GEMINI: OnceLock<Regex> = OnceLock::new();

        match self {
            Provider::OpenAi => OPENAI.get_or_init(|| {
                Regex::new(r"^sk-[A-Za-z0-9_-]{20,}$").expect("openai key pattern is valid")
            }),
            Provider::Anthropic => ANTHROPIC.get_or_init(|| {
                Regex::new(r"^sk-ant-[A-Za-z0-9_-]{20,}$")
                    .expect("anthropic key pattern is valid")
            }),
            Provider::Gemini => GEMINI.get_or_init(|| {
                Regex::new(r"^AIza[A-Za-z0-9_-]{30,}$").expect("gemini key pattern is valid")
            }),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strip whitespace and control characters a copy-paste or a lossy store
/// round trip may have introduced into a decrypted secret.
pub fn sanitize_secret(raw: &str) -> String {
    raw.trim().chars().filter(|c| !c.is_control()).collect()
}
