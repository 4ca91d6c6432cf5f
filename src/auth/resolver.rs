//! Session-to-identity resolution with request coalescing
//!
//! Resolution flow per session id: identity cache -> in-flight map ->
//! durable store. For any session id at most one store query is ever in
//! flight; every concurrent caller attaches to it and receives the identical
//! outcome, success or failure. The underlying lookup is spawned, so a
//! caller disconnecting never cancels work other waiters depend on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tracing::{debug, warn};

use crate::auth::{AuthContext, ResolvedIdentity};
use crate::cache::{CacheConfig, CacheStats, GenericCache};
use crate::error::ResolveError;
use crate::observability::record_resolution;
use crate::services::IdentityStore;

type SharedResolution = Shared<BoxFuture<'static, Result<ResolvedIdentity, ResolveError>>>;
type PendingMap = Arc<Mutex<HashMap<String, SharedResolution>>>;

/// Configuration for the identity resolver, fixed at construction.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// How long a resolved identity stays bound to its session id
    pub ttl: Duration,
    pub max_entries: usize,
    pub sweep_interval: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 10_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Removes the pending-map entry when the resolution future finishes.
///
/// Dropping inside the future body guarantees cleanup on every exit path,
/// including store errors, so a failure can never leave a session id
/// permanently "in flight".
struct PendingGuard {
    pending: PendingMap,
    key: String,
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

/// Resolves session ids to caller identities.
pub struct AuthContextResolver {
    store: Arc<dyn IdentityStore>,
    cache: GenericCache<ResolvedIdentity>,
    pending: PendingMap,
    ttl: Duration,
}

impl AuthContextResolver {
    pub fn new(store: Arc<dyn IdentityStore>, config: ResolverConfig) -> Self {
        let cache = GenericCache::new(CacheConfig {
            name: "identity",
            max_entries: config.max_entries,
            default_ttl: config.ttl,
            sweep_interval: config.sweep_interval,
        });

        Self {
            store,
            cache,
            pending: Arc::new(Mutex::new(HashMap::new())),
            ttl: config.ttl,
        }
    }

    /// Resolve a session id to an identity or Anonymous.
    ///
    /// All concurrent callers for the same session id share a single store
    /// query and observe the identical outcome. Store failures propagate to
    /// every waiter and are never cached.
    pub async fn resolve(&self, session_id: &str) -> Result<ResolvedIdentity, ResolveError> {
        let start = Instant::now();

        if let Some(resolved) = self.cache.get(session_id).await {
            record_resolution("cache", start.elapsed());
            return Ok(resolved);
        }

        let resolution = self.attach_or_start(session_id);
        let outcome = resolution.await;
        record_resolution("store", start.elapsed());
        outcome
    }

    /// Reset the request's identity binding, resolve, and bind the outcome.
    ///
    /// The reset happens before any resolution so a pooled request object
    /// can never carry a binding over from a previous cycle.
    pub async fn bind_request(
        &self,
        ctx: &mut AuthContext,
        session_id: &str,
    ) -> Result<ResolvedIdentity, ResolveError> {
        ctx.reset();
        let resolved = self.resolve(session_id).await?;
        ctx.bind(resolved.clone());
        Ok(resolved)
    }

    /// Attach to the in-flight resolution for this session id, or start one.
    ///
    /// The lock is synchronous and never held across an await; check-and-
    /// insert is therefore atomic with respect to other callers.
    fn attach_or_start(&self, session_id: &str) -> SharedResolution {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = pending.get(session_id) {
            debug!(session = %session_id, "attaching to in-flight resolution");
            return existing.clone();
        }

        let store = Arc::clone(&self.store);
        let cache = self.cache.clone();
        let ttl = self.ttl;
        let sid = session_id.to_string();
        let map_key = sid.clone();
        let guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            key: sid.clone(),
        };

        let resolution: SharedResolution = async move {
            let _guard = guard;

            let row = store.get_identity_by_session(&sid).await.map_err(|err| {
                warn!(session = %sid, error = %err, "identity store lookup failed");
                ResolveError::from(err)
            })?;

            let resolved = match row {
                Some(identity) => ResolvedIdentity::Known(identity),
                None => ResolvedIdentity::Anonymous,
            };

            // Anonymous is a resolved outcome and is cached like any other;
            // only store failures skip the cache.
            cache.set(&sid, resolved.clone(), Some(ttl)).await;
            Ok(resolved)
        }
        .boxed()
        .shared();

        pending.insert(map_key, resolution.clone());

        // Run to completion even if every caller disconnects; waiters that
        // attached before the drop still get the result, and the guard still
        // clears the map entry.
        tokio::spawn(resolution.clone());

        resolution
    }

    /// Drop the cached resolution for one session (e.g. on logout).
    pub async fn invalidate_session(&self, session_id: &str) -> bool {
        self.cache.delete(session_id).await
    }

    /// Drop every cached session bound to the given identity. Used when the
    /// identity row itself changes or is deleted.
    pub async fn invalidate_identity(&self, identity_id: &str) -> usize {
        self.cache
            .invalidate_where(|_, resolved| {
                resolved
                    .identity()
                    .is_some_and(|identity| identity.id == identity_id)
            })
            .await
    }

    pub async fn stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Spawn the identity-cache sweeper; bounds memory for abandoned
    /// sessions that are never looked up again.
    pub fn spawn_sweeper(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        self.cache.spawn_sweeper(shutdown)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
