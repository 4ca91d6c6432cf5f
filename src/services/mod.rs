//! Durable-store collaborator interfaces
//!
//! The session layer never talks to the database directly; route handlers
//! hand it implementations of these traits. The mock implementations count
//! their calls so tests can assert the coalescing invariant (exactly one
//! store round-trip per burst).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::auth::Identity;
use crate::credentials::Provider;
use crate::error::StoreError;

/// Durable identity lookups.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Resolve a session id to its identity row, or None for an unknown or
    /// anonymous session.
    async fn get_identity_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Identity>, StoreError>;

    /// Fetch an identity by its id.
    async fn get_identity_by_id(&self, id: &str) -> Result<Option<Identity>, StoreError>;
}

/// Durable encrypted-credential lookups.
///
/// Values are opaque `iv:authTag:ciphertext` hex strings; this layer only
/// reads and decrypts them, never persists.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_encrypted_secret(
        &self,
        identity_id: &str,
        provider: Provider,
    ) -> Result<Option<String>, StoreError>;
}

/// In-memory identity store for tests and development.
#[derive(Default)]
pub struct MockIdentityStore {
    sessions: RwLock<HashMap<String, Identity>>,
    lookups: AtomicU64,
    fail: AtomicBool,
    /// Artificial latency so tests can hold a lookup in flight
    delay: RwLock<Option<Duration>>,
}

impl MockIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_session(&self, session_id: &str, identity: Identity) {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), identity);
    }

    pub async fn remove_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Number of `get_identity_by_session` calls that reached the store.
    pub fn session_lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().await = delay;
    }
}

#[async_trait]
impl IdentityStore for MockIdentityStore {
    async fn get_identity_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Identity>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = *self.delay.read().await {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("mock store failing".to_string()));
        }

        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn get_identity_by_id(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("mock store failing".to_string()));
        }

        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|identity| identity.id == id)
            .cloned())
    }
}

/// In-memory secret store for tests and development.
#[derive(Default)]
pub struct MockSecretStore {
    secrets: RwLock<HashMap<(String, Provider), String>>,
    fetches: AtomicU64,
    fail: AtomicBool,
    delay: RwLock<Option<Duration>>,
}

impl MockSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_secret(&self, identity_id: &str, provider: Provider, encrypted: String) {
        self.secrets
            .write()
            .await
            .insert((identity_id.to_string(), provider), encrypted);
    }

    pub async fn remove_secret(&self, identity_id: &str, provider: Provider) {
        self.secrets
            .write()
            .await
            .remove(&(identity_id.to_string(), provider));
    }

    /// Number of `get_encrypted_secret` calls that reached the store.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().await = delay;
    }
}

#[async_trait]
impl SecretStore for MockSecretStore {
    async fn get_encrypted_secret(
        &self,
        identity_id: &str,
        provider: Provider,
    ) -> Result<Option<String>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = *self.delay.read().await {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("mock store failing".to_string()));
        }

        Ok(self
            .secrets
            .read()
            .await
            .get(&(identity_id.to_string(), provider))
            .cloned())
    }
}
