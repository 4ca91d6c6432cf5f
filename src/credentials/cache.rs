//! Per-identity client cache with LRU eviction and request coalescing
//!
//! Building a client means a store round trip plus an AES-GCM decrypt, so
//! handles are cached per (identity, provider) pair. Unlike the identity
//! cache's insertion-order eviction, identities here are evicted strictly
//! least-recently-used: a burst of new identities must not push out an
//! identity whose clients are in active use.
//!
//! "No credential configured" is itself a cached outcome. Without negative
//! caching an identity with no stored key would hit the store on every
//! prompt it sends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CredentialError;
use crate::observability::record_credential_lookup;
use crate::services::SecretStore;

use super::client::{build_client, AiClient};
use super::{sanitize_secret, Provider, SecretCipher};

/// The cached result of a credential lookup.
///
/// `Unavailable` covers every non-error miss: no stored secret, a secret
/// that fails to decrypt, and a decrypted value that is not a plausible key.
#[derive(Clone)]
pub enum ClientOutcome {
    Ready(Arc<dyn AiClient>),
    Unavailable,
}

impl ClientOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ClientOutcome::Ready(_))
    }

    pub fn client(&self) -> Option<Arc<dyn AiClient>> {
        match self {
            ClientOutcome::Ready(client) => Some(Arc::clone(client)),
            ClientOutcome::Unavailable => None,
        }
    }
}

impl std::fmt::Debug for ClientOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientOutcome::Ready(client) => write!(f, "Ready({})", client.provider()),
            ClientOutcome::Unavailable => write!(f, "Unavailable"),
        }
    }
}

/// One cached outcome plus the instant it was stored, for TTL checks and
/// oldest-first eviction within an identity.
#[derive(Clone)]
pub struct CachedHandle {
    outcome: ClientOutcome,
    stored_at: Instant,
}

impl CachedHandle {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() >= ttl
    }
}

struct IdentityEntry {
    handles: HashMap<Provider, CachedHandle>,
    last_access: Instant,
}

#[derive(Debug, Clone)]
pub struct CredentialCacheConfig {
    /// How long a built client (or a negative outcome) stays cached
    pub ttl: Duration,
    /// Identity slots; least-recently-used identity is evicted at capacity
    pub max_identities: usize,
    /// Handle slots per identity; oldest handle is evicted at capacity
    pub max_clients_per_identity: usize,
    pub sweep_interval: Duration,
}

impl Default for CredentialCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            max_identities: 500,
            max_clients_per_identity: 8,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

type SharedLookup = Shared<BoxFuture<'static, Result<ClientOutcome, CredentialError>>>;
type PendingMap = Arc<Mutex<HashMap<(String, Provider), SharedLookup>>>;

struct PendingGuard {
    pending: PendingMap,
    key: (String, Provider),
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        pending.remove(&self.key);
    }
}

/// Caches decrypted, ready-to-use provider clients per identity.
pub struct CredentialCache {
    store: Arc<dyn SecretStore>,
    cipher: SecretCipher,
    entries: Arc<tokio::sync::RwLock<HashMap<String, IdentityEntry>>>,
    pending: PendingMap,
    config: CredentialCacheConfig,
}

impl CredentialCache {
    pub fn new(
        store: Arc<dyn SecretStore>,
        cipher: SecretCipher,
        config: CredentialCacheConfig,
    ) -> Self {
        Self {
            store,
            cipher,
            entries: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Get (or build) the client handle for one identity and provider.
    ///
    /// Concurrent callers for the same pair share a single store fetch.
    /// Store failures propagate to every waiter and are never cached; all
    /// other outcomes, including `Unavailable`, are cached for the full TTL.
    pub async fn get_client(
        &self,
        identity_id: &str,
        provider: Provider,
    ) -> Result<ClientOutcome, CredentialError> {
        let start = Instant::now();

        if let Some(handle) = self.cached_handle(identity_id, provider).await {
            record_credential_lookup(provider.as_str(), "cached", start.elapsed());
            return Ok(handle.outcome);
        }

        let lookup = self.attach_or_start(identity_id, provider);
        let outcome = lookup.await;

        let label = match &outcome {
            Ok(ClientOutcome::Ready(_)) => "ready",
            Ok(ClientOutcome::Unavailable) => "unavailable",
            Err(_) => "error",
        };
        record_credential_lookup(provider.as_str(), label, start.elapsed());
        outcome
    }

    /// Cache probe that also refreshes the identity's recency.
    async fn cached_handle(&self, identity_id: &str, provider: Provider) -> Option<CachedHandle> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(identity_id)?;

        let handle = entry.handles.get(&provider)?;
        if handle.is_expired(self.config.ttl) {
            entry.handles.remove(&provider);
            return None;
        }

        let handle = handle.clone();
        entry.last_access = Instant::now();
        Some(handle)
    }

    fn attach_or_start(&self, identity_id: &str, provider: Provider) -> SharedLookup {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let key = (identity_id.to_string(), provider);
        if let Some(existing) = pending.get(&key) {
            debug!(identity = %identity_id, %provider, "attaching to in-flight credential lookup");
            return existing.clone();
        }

        let store = Arc::clone(&self.store);
        let cipher = self.cipher.clone();
        let entries = Arc::clone(&self.entries);
        let config = self.config.clone();
        let id = identity_id.to_string();
        let guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            key: key.clone(),
        };

        let lookup: SharedLookup = async move {
            let _guard = guard;

            let row = store.get_encrypted_secret(&id, provider).await.map_err(|err| {
                warn!(identity = %id, %provider, error = %err, "secret store lookup failed");
                CredentialError::from(err)
            })?;

            let outcome = match row {
                None => ClientOutcome::Unavailable,
                Some(encrypted) => match cipher.decrypt(&encrypted) {
                    Err(err) => {
                        // A key that no longer decrypts (rotated master key,
                        // corrupt row) is treated as absent, not as a hard
                        // failure that would block the owning request.
                        warn!(identity = %id, %provider, error = %err, "stored secret failed to decrypt");
                        ClientOutcome::Unavailable
                    }
                    Ok(plaintext) => {
                        let secret = sanitize_secret(&plaintext);
                        if provider.key_matches(&secret) {
                            ClientOutcome::Ready(build_client(provider, secret))
                        } else {
                            warn!(identity = %id, %provider, "decrypted secret does not look like a valid key");
                            ClientOutcome::Unavailable
                        }
                    }
                },
            };

            Self::insert_handle(&entries, &config, &id, provider, outcome.clone()).await;
            Ok(outcome)
        }
        .boxed()
        .shared();

        pending.insert(key, lookup.clone());
        tokio::spawn(lookup.clone());

        lookup
    }

    /// Store an outcome, evicting at both capacity bounds.
    async fn insert_handle(
        entries: &tokio::sync::RwLock<HashMap<String, IdentityEntry>>,
        config: &CredentialCacheConfig,
        identity_id: &str,
        provider: Provider,
        outcome: ClientOutcome,
    ) {
        let mut entries = entries.write().await;

        if !entries.contains_key(identity_id) && entries.len() >= config.max_identities {
            let lru = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(id, _)| id.clone());
            if let Some(id) = lru {
                debug!(identity = %id, "evicting least-recently-used identity");
                entries.remove(&id);
            }
        }

        let entry = entries
            .entry(identity_id.to_string())
            .or_insert_with(|| IdentityEntry {
                handles: HashMap::new(),
                last_access: Instant::now(),
            });

        if !entry.handles.contains_key(&provider)
            && entry.handles.len() >= config.max_clients_per_identity
        {
            let oldest = entry
                .handles
                .iter()
                .min_by_key(|(_, handle)| handle.stored_at)
                .map(|(provider, _)| *provider);
            if let Some(provider) = oldest {
                entry.handles.remove(&provider);
            }
        }

        entry.handles.insert(
            provider,
            CachedHandle {
                outcome,
                stored_at: Instant::now(),
            },
        );
        entry.last_access = Instant::now();
    }

    /// Drop every cached handle for one identity. Called on key rotation,
    /// key removal, and identity deletion.
    pub async fn clear_identity(&self, identity_id: &str) -> bool {
        let removed = self.entries.write().await.remove(identity_id).is_some();
        if removed {
            info!(identity = %identity_id, "cleared cached credentials");
        }
        removed
    }

    pub async fn clear_all(&self) -> usize {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        entries.clear();
        count
    }

    /// Probe every provider concurrently and report which have a usable key.
    ///
    /// Populates the cache as a side effect; a store failure for one
    /// provider reports that provider as unavailable rather than failing
    /// the whole listing.
    pub async fn list_available_providers(&self, identity_id: &str) -> Vec<Provider> {
        let probes = Provider::ALL
            .iter()
            .map(|provider| async move {
                match self.get_client(identity_id, *provider).await {
                    Ok(outcome) if outcome.is_ready() => Some(*provider),
                    _ => None,
                }
            })
            .collect::<Vec<_>>();

        join_all(probes).await.into_iter().flatten().collect()
    }

    pub async fn identity_count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn handle_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .map(|entry| entry.handles.len())
            .sum()
    }

    /// Remove expired handles and identities left with none.
    pub async fn sweep_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let mut entries = self.entries.write().await;
        let mut removed = 0;

        entries.retain(|_, entry| {
            let before = entry.handles.len();
            entry.handles.retain(|_, handle| !handle.is_expired(ttl));
            removed += before - entry.handles.len();
            !entry.handles.is_empty()
        });

        if removed > 0 {
            debug!(removed, "swept expired credential handles");
        }
        removed
    }

    /// Periodic sweep so abandoned identities don't pin client handles (and
    /// the keys inside them) in memory for longer than the TTL.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.sweep_expired().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("credential sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MockSecretStore;

    const OPENAI_KEY: &str = "sk-abcdefghijklmnopqrst1234";
    const ANTHROPIC_KEY: &str = "sk-ant-REDACTED";
    const GEMINI_KEY: &str = "AIzaSyA1234567890abcdefghijklmnopqrs";

    fn test_cipher() -> SecretCipher {
        SecretCipher::from_hex_key(&SecretCipher::generate_key()).unwrap()
    }

    fn config(ttl_ms: u64) -> CredentialCacheConfig {
        CredentialCacheConfig {
            ttl: Duration::from_millis(ttl_ms),
            max_identities: 100,
            max_clients_per_identity: 8,
            sweep_interval: Duration::from_secs(60),
        }
    }

    async fn seed(
        store: &MockSecretStore,
        cipher: &SecretCipher,
        identity: &str,
        provider: Provider,
        key: &str,
    ) {
        store
            .insert_secret(identity, provider, cipher.encrypt(key).unwrap())
            .await;
    }

    #[tokio::test]
    async fn test_ready_client_is_built_and_cached() {
        let store = Arc::new(MockSecretStore::new());
        let cipher = test_cipher();
        seed(&store, &cipher, "u1", Provider::OpenAi, OPENAI_KEY).await;
        let cache = CredentialCache::new(Arc::clone(&store) as _, cipher, config(60_000));

        let outcome = cache.get_client("u1", Provider::OpenAi).await.unwrap();
        let client = outcome.client().unwrap();
        assert_eq!(client.provider(), Provider::OpenAi);

        // Second lookup is served from cache.
        assert!(cache.get_client("u1", Provider::OpenAi).await.unwrap().is_ready());
        assert_eq!(store.fetches(), 1);
    }

    #[tokio::test]
    async fn test_missing_secret_is_negatively_cached() {
        let store = Arc::new(MockSecretStore::new());
        let cache = CredentialCache::new(Arc::clone(&store) as _, test_cipher(), config(60_000));

        assert!(!cache.get_client("u1", Provider::Gemini).await.unwrap().is_ready());
        assert!(!cache.get_client("u1", Provider::Gemini).await.unwrap().is_ready());

        // Within the TTL the absence itself is the cached answer.
        assert_eq!(store.fetches(), 1);
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_undecryptable_secret_is_unavailable() {
        let store = Arc::new(MockSecretStore::new());
        let cipher = test_cipher();
        // Sealed under a different key.
        let foreign = test_cipher().encrypt(OPENAI_KEY).unwrap();
        store.insert_secret("u1", Provider::OpenAi, foreign).await;
        let cache = CredentialCache::new(Arc::clone(&store) as _, cipher, config(60_000));

        let outcome = cache.get_client("u1", Provider::OpenAi).await.unwrap();
        assert!(!outcome.is_ready());

        // The failure is logged, the plaintext never is.
        assert!(logs_contain("failed to decrypt"));
        assert!(!logs_contain(OPENAI_KEY));
    }

    #[tokio::test]
    async fn test_implausible_key_is_unavailable() {
        let store = Arc::new(MockSecretStore::new());
        let cipher = test_cipher();
        seed(&store, &cipher, "u1", Provider::Anthropic, "not-a-key").await;
        let cache = CredentialCache::new(Arc::clone(&store) as _, cipher, config(60_000));

        let outcome = cache.get_client("u1", Provider::Anthropic).await.unwrap();
        assert!(!outcome.is_ready());
    }

    #[tokio::test]
    async fn test_whitespace_around_key_is_tolerated() {
        let store = Arc::new(MockSecretStore::new());
        let cipher = test_cipher();
        seed(
            &store,
            &cipher,
            "u1",
            Provider::OpenAi,
            &format!("  {OPENAI_KEY}\n"),
        )
        .await;
        let cache = CredentialCache::new(Arc::clone(&store) as _, cipher, config(60_000));

        assert!(cache.get_client("u1", Provider::OpenAi).await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_burst_coalesces_to_one_fetch() {
        let store = Arc::new(MockSecretStore::new());
        let cipher = test_cipher();
        seed(&store, &cipher, "u1", Provider::OpenAi, OPENAI_KEY).await;
        store.set_delay(Some(Duration::from_millis(50))).await;

        let cache = Arc::new(CredentialCache::new(
            Arc::clone(&store) as _,
            cipher,
            config(60_000),
        ));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.get_client("u1", Provider::OpenAi).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_ready());
        }

        assert_eq!(store.fetches(), 1);
        assert_eq!(cache.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_different_providers_do_not_coalesce_together() {
        let store = Arc::new(MockSecretStore::new());
        let cipher = test_cipher();
        seed(&store, &cipher, "u1", Provider::OpenAi, OPENAI_KEY).await;
        seed(&store, &cipher, "u1", Provider::Anthropic, ANTHROPIC_KEY).await;
        let cache = CredentialCache::new(Arc::clone(&store) as _, cipher, config(60_000));

        cache.get_client("u1", Provider::OpenAi).await.unwrap();
        cache.get_client("u1", Provider::Anthropic).await.unwrap();
        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test]
    async fn test_store_failure_propagates_and_is_not_cached() {
        let store = Arc::new(MockSecretStore::new());
        let cipher = test_cipher();
        seed(&store, &cipher, "u1", Provider::OpenAi, OPENAI_KEY).await;
        store.set_failing(true);

        let cache = CredentialCache::new(Arc::clone(&store) as _, cipher, config(60_000));
        assert!(cache.get_client("u1", Provider::OpenAi).await.is_err());
        assert_eq!(cache.pending_len(), 0);

        store.set_failing(false);
        assert!(cache.get_client("u1", Provider::OpenAi).await.unwrap().is_ready());
        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test]
    async fn test_identity_eviction_is_lru_not_fifo() {
        let store = Arc::new(MockSecretStore::new());
        let cipher = test_cipher();
        seed(&store, &cipher, "a", Provider::OpenAi, OPENAI_KEY).await;
        seed(&store, &cipher, "b", Provider::OpenAi, OPENAI_KEY).await;
        seed(&store, &cipher, "c", Provider::OpenAi, OPENAI_KEY).await;

        let cache = CredentialCache::new(
            Arc::clone(&store) as _,
            cipher,
            CredentialCacheConfig {
                max_identities: 2,
                ..config(60_000)
            },
        );

        cache.get_client("a", Provider::OpenAi).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.get_client("b", Provider::OpenAi).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Re-access "a": under FIFO it would still be the eviction victim,
        // under LRU the victim becomes "b".
        cache.get_client("a", Provider::OpenAi).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.get_client("c", Provider::OpenAi).await.unwrap();

        assert_eq!(store.fetches(), 3);
        assert_eq!(cache.identity_count().await, 2);

        // "a" survived; "b" was evicted and needs a refetch.
        cache.get_client("a", Provider::OpenAi).await.unwrap();
        assert_eq!(store.fetches(), 3);
        cache.get_client("b", Provider::OpenAi).await.unwrap();
        assert_eq!(store.fetches(), 4);
    }

    #[tokio::test]
    async fn test_oldest_handle_evicted_at_per_identity_capacity() {
        let store = Arc::new(MockSecretStore::new());
        let cipher = test_cipher();
        seed(&store, &cipher, "u1", Provider::OpenAi, OPENAI_KEY).await;
        seed(&store, &cipher, "u1", Provider::Anthropic, ANTHROPIC_KEY).await;

        let cache = CredentialCache::new(
            Arc::clone(&store) as _,
            cipher,
            CredentialCacheConfig {
                max_clients_per_identity: 1,
                ..config(60_000)
            },
        );

        cache.get_client("u1", Provider::OpenAi).await.unwrap();
        cache.get_client("u1", Provider::Anthropic).await.unwrap();
        assert_eq!(cache.handle_count().await, 1);

        // The OpenAI handle was pushed out.
        cache.get_client("u1", Provider::OpenAi).await.unwrap();
        assert_eq!(store.fetches(), 3);
    }

    #[tokio::test]
    async fn test_expired_handle_is_refetched() {
        let store = Arc::new(MockSecretStore::new());
        let cipher = test_cipher();
        seed(&store, &cipher, "u1", Provider::OpenAi, OPENAI_KEY).await;
        let cache = CredentialCache::new(Arc::clone(&store) as _, cipher, config(40));

        cache.get_client("u1", Provider::OpenAi).await.unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;
        cache.get_client("u1", Provider::OpenAi).await.unwrap();

        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test]
    async fn test_clear_identity_forces_refetch_after_rotation() {
        let store = Arc::new(MockSecretStore::new());
        let cipher = test_cipher();
        seed(&store, &cipher, "u1", Provider::Anthropic, ANTHROPIC_KEY).await;
        let cache = CredentialCache::new(Arc::clone(&store) as _, cipher.clone(), config(60_000));

        cache.get_client("u1", Provider::Anthropic).await.unwrap();

        // Rotate the stored key, then clear the cached handle.
        seed(&store, &cipher, "u1", Provider::Anthropic, ANTHROPIC_KEY).await;
        assert!(cache.clear_identity("u1").await);
        assert!(!cache.clear_identity("u1").await);

        cache.get_client("u1", Provider::Anthropic).await.unwrap();
        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test]
    async fn test_list_available_providers() {
        let store = Arc::new(MockSecretStore::new());
        let cipher = test_cipher();
        seed(&store, &cipher, "u1", Provider::OpenAi, OPENAI_KEY).await;
        seed(&store, &cipher, "u1", Provider::Gemini, GEMINI_KEY).await;
        let cache = CredentialCache::new(Arc::clone(&store) as _, cipher, config(60_000));

        let mut available = cache.list_available_providers("u1").await;
        available.sort_by_key(|p| p.as_str());
        assert_eq!(available, vec![Provider::Gemini, Provider::OpenAi]);

        // The probe populated the cache, negatives included.
        assert_eq!(store.fetches(), 3);
        cache.get_client("u1", Provider::Anthropic).await.unwrap();
        assert_eq!(store.fetches(), 3);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_handles_and_empty_identities() {
        let store = Arc::new(MockSecretStore::new());
        let cipher = test_cipher();
        seed(&store, &cipher, "u1", Provider::OpenAi, OPENAI_KEY).await;
        let cache = CredentialCache::new(Arc::clone(&store) as _, cipher, config(30));

        cache.get_client("u1", Provider::OpenAi).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.sweep_expired().await, 1);
        assert_eq!(cache.identity_count().await, 0);
    }

    #[tokio::test]
    async fn test_sweeper_task_stops_on_shutdown() {
        let store = Arc::new(MockSecretStore::new());
        let cache = Arc::new(CredentialCache::new(
            Arc::clone(&store) as _,
            test_cipher(),
            CredentialCacheConfig {
                sweep_interval: Duration::from_millis(20),
                ..config(30)
            },
        ));

        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = cache.spawn_sweeper(rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop promptly")
            .unwrap();
    }
}
