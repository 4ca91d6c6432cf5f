//! Service-object wiring for the session layer
//!
//! Everything is built once from validated configuration and handed to
//! collaborators explicitly; there are no global mutable singletons. The
//! components own the lifecycle of the background sweep tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::auth::{AuthContextResolver, ResolverConfig};
use crate::cache::{CacheConfig, GenericCache};
use crate::config::SessionConfig;
use crate::credentials::{CredentialCache, CredentialCacheConfig, SecretCipher};
use crate::invalidation::InvalidationBus;
use crate::services::{IdentityStore, MockIdentityStore, MockSecretStore, SecretStore};

/// The fully wired session layer.
pub struct SessionComponents {
    pub app_cache: GenericCache<serde_json::Value>,
    pub resolver: Arc<AuthContextResolver>,
    pub credentials: Arc<CredentialCache>,
    pub invalidation: Arc<InvalidationBus>,
    shutdown: Option<watch::Sender<bool>>,
    sweepers: Vec<JoinHandle<()>>,
}

impl SessionComponents {
    /// Build the layer from validated configuration and store handles.
    ///
    /// Fails fast on a malformed cipher key: a deployment that cannot
    /// decrypt credentials must not start.
    pub fn new(
        config: &SessionConfig,
        identity_store: Arc<dyn IdentityStore>,
        secret_store: Arc<dyn SecretStore>,
    ) -> anyhow::Result<Self> {
        let cipher = SecretCipher::from_hex_key(&config.cipher.key_hex)
            .context("credential cipher key is unusable")?;

        let sweep_interval = Duration::from_secs(config.cache.sweep_interval_seconds);

        let app_cache = GenericCache::new(CacheConfig {
            name: "app",
            max_entries: config.cache.max_entries,
            default_ttl: Duration::from_secs(config.cache.default_ttl_seconds),
            sweep_interval,
        });

        let resolver = Arc::new(AuthContextResolver::new(
            identity_store,
            ResolverConfig {
                ttl: Duration::from_secs(config.identity.ttl_seconds),
                max_entries: config.identity.max_entries,
                sweep_interval,
            },
        ));

        let credentials = Arc::new(CredentialCache::new(
            secret_store,
            cipher,
            CredentialCacheConfig {
                ttl: Duration::from_secs(config.credentials.ttl_seconds),
                max_identities: config.credentials.max_identities,
                max_clients_per_identity: config.credentials.max_clients_per_identity,
                sweep_interval,
            },
        ));

        let invalidation = Arc::new(InvalidationBus::new(
            app_cache.clone(),
            Arc::clone(&resolver),
            Arc::clone(&credentials),
        ));

        Ok(Self {
            app_cache,
            resolver,
            credentials,
            invalidation,
            shutdown: None,
            sweepers: Vec::new(),
        })
    }

    /// Spawn the background sweep tasks. Idempotent: a second call while
    /// running does nothing.
    pub fn start(&mut self) {
        if self.shutdown.is_some() {
            return;
        }

        let (tx, rx) = watch::channel(false);
        self.sweepers.push(self.app_cache.spawn_sweeper(rx.clone()));
        self.sweepers.push(self.resolver.spawn_sweeper(rx.clone()));
        self.sweepers.push(self.credentials.spawn_sweeper(rx));
        self.shutdown = Some(tx);

        info!("session layer started");
    }

    /// Signal the sweep tasks to stop and wait for them to finish.
    pub async fn shutdown(&mut self) {
        let Some(tx) = self.shutdown.take() else {
            return;
        };

        // Receivers outlive the send because the sweepers hold them.
        let _ = tx.send(true);
        for sweeper in self.sweepers.drain(..) {
            let _ = sweeper.await;
        }

        info!("session layer stopped");
    }

    /// Wire the layer against in-memory stores with a generated key.
    ///
    /// The harness exposes the stores and a cipher sharing the generated
    /// key, so tests can seed encrypted secrets the layer can decrypt.
    pub fn new_mock() -> anyhow::Result<MockHarness> {
        let identity_store = Arc::new(MockIdentityStore::new());
        let secret_store = Arc::new(MockSecretStore::new());

        let mut config = SessionConfig::default();
        config.cipher.key_hex = SecretCipher::generate_key();
        let cipher = SecretCipher::from_hex_key(&config.cipher.key_hex)
            .context("generated cipher key should be usable")?;

        let components = Self::new(
            &config,
            Arc::clone(&identity_store) as _,
            Arc::clone(&secret_store) as _,
        )?;

        Ok(MockHarness {
            components,
            identity_store,
            secret_store,
            cipher,
        })
    }
}

/// A fully wired layer over in-memory stores, for tests and development.
pub struct MockHarness {
    pub components: SessionComponents,
    pub identity_store: Arc<MockIdentityStore>,
    pub secret_store: Arc<MockSecretStore>,
    pub cipher: SecretCipher,
}
