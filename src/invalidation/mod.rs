//! Domain-event driven cache invalidation
//!
//! Route handlers call one hook immediately after the triggering mutation
//! commits and before their response is sent; every hook awaits its
//! invalidations, so no later reader can observe stale app-cache state for
//! that mutation.

use std::sync::Arc;

use tracing::info;

use crate::auth::AuthContextResolver;
use crate::cache::GenericCache;
use crate::credentials::CredentialCache;

/// Kinds of user-owned records whose listings are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Prompt,
    Folder,
    Tag,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Prompt => "prompt",
            RecordKind::Folder => "folder",
            RecordKind::Tag => "tag",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds app-cache keys and invalidation patterns with one escaping rule,
/// so a crafted identifier cannot widen a pattern match.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Key for one record listing: `user:{id}:{kind}:{view}`.
    pub fn record_listing(identity_id: &str, kind: RecordKind, view: &str) -> String {
        format!(
            "user:{}:{}:{}",
            Self::escape(identity_id),
            kind,
            Self::escape(view)
        )
    }

    /// Key for one cross-user aggregate: `summary:{name}`.
    pub fn summary(name: &str) -> String {
        format!("summary:{}", Self::escape(name))
    }

    /// Pattern matching everything cached for one identity.
    pub fn user_pattern(identity_id: &str) -> String {
        format!("user:{}:*", Self::escape(identity_id))
    }

    /// Pattern matching one identity's listings of one record kind.
    pub fn record_pattern(identity_id: &str, kind: RecordKind) -> String {
        format!("user:{}:{}:*", Self::escape(identity_id), kind)
    }

    /// Pattern matching every aggregate key.
    pub fn summary_pattern() -> String {
        "summary:*".to_string()
    }

    fn escape(input: &str) -> String {
        input
            .replace('*', "%2A")
            .replace(':', "%3A")
            .replace('?', "%3F")
    }
}

/// Maps domain events to deterministic invalidation actions across the app
/// cache, the identity cache, and the credential cache.
pub struct InvalidationBus {
    app_cache: GenericCache<serde_json::Value>,
    resolver: Arc<AuthContextResolver>,
    credentials: Arc<CredentialCache>,
}

impl InvalidationBus {
    pub fn new(
        app_cache: GenericCache<serde_json::Value>,
        resolver: Arc<AuthContextResolver>,
        credentials: Arc<CredentialCache>,
    ) -> Self {
        Self {
            app_cache,
            resolver,
            credentials,
        }
    }

    /// A new identity exists; cross-user aggregates are stale.
    pub async fn on_identity_created(&self, identity_id: &str) {
        let removed = self
            .app_cache
            .invalidate_pattern(&CacheKeyBuilder::summary_pattern())
            .await;
        info!(identity = %identity_id, removed, "invalidated summaries for new identity");
    }

    /// An identity row changed; its cached data, sessions, and clients are
    /// all stale.
    pub async fn on_identity_changed(&self, identity_id: &str) {
        let removed = self
            .app_cache
            .invalidate_pattern(&CacheKeyBuilder::user_pattern(identity_id))
            .await;
        let sessions = self.resolver.invalidate_identity(identity_id).await;
        self.credentials.clear_identity(identity_id).await;
        info!(identity = %identity_id, removed, sessions, "invalidated caches for changed identity");
    }

    /// An identity was deleted; as for a change, plus aggregates.
    pub async fn on_identity_deleted(&self, identity_id: &str) {
        self.on_identity_changed(identity_id).await;
        let removed = self
            .app_cache
            .invalidate_pattern(&CacheKeyBuilder::summary_pattern())
            .await;
        info!(identity = %identity_id, removed, "invalidated summaries for deleted identity");
    }

    /// A credential was added, removed, or rotated. Cached clients for the
    /// identity must not survive, and adoption aggregates are stale.
    pub async fn on_credential_changed(&self, identity_id: &str) {
        self.credentials.clear_identity(identity_id).await;
        let removed = self
            .app_cache
            .invalidate_pattern(&CacheKeyBuilder::summary_pattern())
            .await;
        info!(identity = %identity_id, removed, "invalidated caches for changed credential");
    }

    /// A user-owned record was created, updated, or deleted.
    pub async fn on_record_changed(&self, identity_id: &str, kind: RecordKind) {
        let listings = self
            .app_cache
            .invalidate_pattern(&CacheKeyBuilder::record_pattern(identity_id, kind))
            .await;
        let summaries = self
            .app_cache
            .invalidate_pattern(&CacheKeyBuilder::summary_pattern())
            .await;
        info!(identity = %identity_id, %kind, listings, summaries, "invalidated caches for record change");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, ResolverConfig};
    use crate::cache::CacheConfig;
    use crate::credentials::{CredentialCacheConfig, Provider, SecretCipher};
    use crate::services::{MockIdentityStore, MockSecretStore};
    use serde_json::json;
    use std::time::Duration;

    fn identity(id: &str) -> Identity {
        Identity::new(id, format!("{id}@example.com"), "google")
    }

    struct Fixture {
        bus: InvalidationBus,
        app_cache: GenericCache<serde_json::Value>,
        resolver: Arc<AuthContextResolver>,
        credentials: Arc<CredentialCache>,
        identity_store: Arc<MockIdentityStore>,
        secret_store: Arc<MockSecretStore>,
        cipher: SecretCipher,
    }

    fn fixture() -> Fixture {
        let identity_store = Arc::new(MockIdentityStore::new());
        let secret_store = Arc::new(MockSecretStore::new());
        let cipher = SecretCipher::from_hex_key(&SecretCipher::generate_key()).unwrap();

        let app_cache = GenericCache::new(CacheConfig {
            name: "app",
            max_entries: 100,
            default_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        });
        let resolver = Arc::new(AuthContextResolver::new(
            Arc::clone(&identity_store) as _,
            ResolverConfig::default(),
        ));
        let credentials = Arc::new(CredentialCache::new(
            Arc::clone(&secret_store) as _,
            cipher.clone(),
            CredentialCacheConfig::default(),
        ));

        Fixture {
            bus: InvalidationBus::new(
                app_cache.clone(),
                Arc::clone(&resolver),
                Arc::clone(&credentials),
            ),
            app_cache,
            resolver,
            credentials,
            identity_store,
            secret_store,
            cipher,
        }
    }

    #[test]
    fn test_key_builder_formats_and_escaping() {
        assert_eq!(
            CacheKeyBuilder::record_listing("u1", RecordKind::Prompt, "recent"),
            "user:u1:prompt:recent"
        );
        assert_eq!(CacheKeyBuilder::summary("adoption"), "summary:adoption");
        assert_eq!(CacheKeyBuilder::user_pattern("u1"), "user:u1:*");
        assert_eq!(
            CacheKeyBuilder::record_pattern("u1", RecordKind::Tag),
            "user:u1:tag:*"
        );

        // A crafted id cannot widen the pattern.
        assert_eq!(CacheKeyBuilder::user_pattern("u:*"), "user:u%3A%2A:*");
    }

    #[tokio::test]
    async fn test_identity_created_clears_summaries_only() {
        let f = fixture();
        f.app_cache
            .set(&CacheKeyBuilder::summary("adoption"), json!(1), None)
            .await;
        f.app_cache
            .set(
                &CacheKeyBuilder::record_listing("u1", RecordKind::Prompt, "all"),
                json!([]),
                None,
            )
            .await;

        f.bus.on_identity_created("u2").await;

        assert!(f
            .app_cache
            .get(&CacheKeyBuilder::summary("adoption"))
            .await
            .is_none());
        assert!(f
            .app_cache
            .get(&CacheKeyBuilder::record_listing("u1", RecordKind::Prompt, "all"))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_identity_changed_clears_sessions_data_and_clients() {
        let f = fixture();
        f.identity_store.insert_session("sess-1", identity("u1")).await;
        f.secret_store
            .insert_secret(
                "u1",
                Provider::OpenAi,
                f.cipher.encrypt("sk-abcdefghijklmnopqrst1234").unwrap(),
            )
            .await;

        f.resolver.resolve("sess-1").await.unwrap();
        f.credentials.get_client("u1", Provider::OpenAi).await.unwrap();
        f.app_cache
            .set(
                &CacheKeyBuilder::record_listing("u1", RecordKind::Prompt, "all"),
                json!([]),
                None,
            )
            .await;

        f.bus.on_identity_changed("u1").await;

        // Session must be re-resolved, client re-fetched, app keys gone.
        f.resolver.resolve("sess-1").await.unwrap();
        assert_eq!(f.identity_store.session_lookups(), 2);
        f.credentials.get_client("u1", Provider::OpenAi).await.unwrap();
        assert_eq!(f.secret_store.fetches(), 2);
        assert_eq!(f.app_cache.size().await, 0);
    }

    #[tokio::test]
    async fn test_credential_changed_forces_fresh_fetch() {
        let f = fixture();
        f.secret_store
            .insert_secret(
                "u3",
                Provider::Anthropic,
                f.cipher
                    .encrypt("sk-ant-REDACTED")
                    .unwrap(),
            )
            .await;

        f.credentials
            .get_client("u3", Provider::Anthropic)
            .await
            .unwrap();
        assert_eq!(f.secret_store.fetches(), 1);

        f.bus.on_credential_changed("u3").await;

        f.credentials
            .get_client("u3", Provider::Anthropic)
            .await
            .unwrap();
        assert_eq!(f.secret_store.fetches(), 2);
    }

    #[tokio::test]
    async fn test_record_changed_clears_kind_listings_and_summaries() {
        let f = fixture();
        f.app_cache
            .set(
                &CacheKeyBuilder::record_listing("u1", RecordKind::Prompt, "all"),
                json!([]),
                None,
            )
            .await;
        f.app_cache
            .set(
                &CacheKeyBuilder::record_listing("u1", RecordKind::Folder, "all"),
                json!([]),
                None,
            )
            .await;
        f.app_cache
            .set(&CacheKeyBuilder::summary("counts"), json!(0), None)
            .await;

        f.bus.on_record_changed("u1", RecordKind::Prompt).await;

        assert!(f
            .app_cache
            .get(&CacheKeyBuilder::record_listing("u1", RecordKind::Prompt, "all"))
            .await
            .is_none());
        assert!(f
            .app_cache
            .get(&CacheKeyBuilder::record_listing("u1", RecordKind::Folder, "all"))
            .await
            .is_some());
        assert!(f
            .app_cache
            .get(&CacheKeyBuilder::summary("counts"))
            .await
            .is_none());
    }
}
