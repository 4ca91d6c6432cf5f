//! Session and credential resolution layer for a prompt-authoring service.
//!
//! The layer sits between route handlers and the durable store. It resolves
//! session ids to identities, hands out ready-to-use AI provider clients
//! built from encrypted per-user API keys, and keeps the caches in front of
//! both coherent through an explicit invalidation bus.
//!
//! Wiring is explicit: build a [`SessionComponents`] from configuration and
//! store handles, call `start()` to run the background sweepers, and hand
//! the components to your handlers.

pub mod auth;
pub mod cache;
pub mod components;
pub mod config;
pub mod credentials;
pub mod error;
pub mod invalidation;
pub mod logging;
pub mod observability;
pub mod services;

#[cfg(feature = "benchmarks")]
pub mod benchmarks;

pub use auth::{AuthContext, AuthContextResolver, Identity, ResolvedIdentity, ResolverConfig};
pub use cache::{CacheConfig, CacheEvent, CacheStats, GenericCache};
pub use components::{MockHarness, SessionComponents};
pub use config::{load_config, SessionConfig};
pub use credentials::{
    AiClient, ClientOutcome, CredentialCache, CredentialCacheConfig, Provider, SecretCipher,
};
pub use error::{CipherError, CredentialError, ResolveError, StoreError};
pub use invalidation::{CacheKeyBuilder, InvalidationBus, RecordKind};
pub use services::{IdentityStore, SecretStore};
