//! Benchmarks for the hot paths of the session layer: cache reads, session
//! resolution, and coalesced bursts.

#[cfg(feature = "benchmarks")]
use criterion::{black_box, criterion_group, Criterion};
#[cfg(feature = "benchmarks")]
use std::sync::Arc;
#[cfg(feature = "benchmarks")]
use std::time::Duration;
#[cfg(feature = "benchmarks")]
use tokio::runtime::Runtime;

#[cfg(feature = "benchmarks")]
use crate::auth::{AuthContextResolver, Identity, ResolverConfig};
#[cfg(feature = "benchmarks")]
use crate::cache::{CacheConfig, GenericCache};
#[cfg(feature = "benchmarks")]
use crate::services::MockIdentityStore;

#[cfg(feature = "benchmarks")]
fn bench_generic_cache(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cache: GenericCache<String> = GenericCache::new(CacheConfig {
        name: "bench",
        max_entries: 10_000,
        default_ttl: Duration::from_secs(300),
        sweep_interval: Duration::from_secs(60),
    });

    c.bench_function("generic_cache_set", |b| {
        let mut counter = 0u64;
        b.to_async(&rt).iter(|| {
            counter += 1;
            let key = format!("user:{}:prompt:recent", counter % 1000);
            let cache = cache.clone();
            async move {
                black_box(cache.set(&key, "value".to_string(), None).await);
            }
        })
    });

    c.bench_function("generic_cache_get", |b| {
        let mut counter = 0u64;
        b.to_async(&rt).iter(|| {
            counter += 1;
            let key = format!("user:{}:prompt:recent", counter % 1000);
            let cache = cache.clone();
            async move {
                black_box(cache.get(&key).await);
            }
        })
    });

    c.bench_function("generic_cache_invalidate_pattern", |b| {
        b.to_async(&rt).iter(|| {
            let cache = cache.clone();
            async move {
                black_box(cache.invalidate_pattern("user:1:*").await);
            }
        })
    });
}

#[cfg(feature = "benchmarks")]
fn bench_resolution(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let store = Arc::new(MockIdentityStore::new());
    rt.block_on(async {
        for i in 0..100 {
            store
                .insert_session(
                    &format!("sess-{i}"),
                    Identity::new(format!("u{i}"), format!("u{i}@example.com"), "google"),
                )
                .await;
        }
    });
    let resolver = Arc::new(AuthContextResolver::new(
        Arc::clone(&store) as _,
        ResolverConfig::default(),
    ));

    c.bench_function("resolve_cached_session", |b| {
        let mut counter = 0u64;
        b.to_async(&rt).iter(|| {
            counter += 1;
            let resolver = Arc::clone(&resolver);
            let session = format!("sess-{}", counter % 100);
            async move {
                black_box(resolver.resolve(&session).await.unwrap());
            }
        })
    });

    c.bench_function("resolve_coalesced_burst_of_10", |b| {
        let mut counter = 0u64;
        b.to_async(&rt).iter(|| {
            counter += 1;
            let resolver = Arc::clone(&resolver);
            // A session id outside the seeded range misses the cache.
            let session = format!("burst-{counter}");
            async move {
                let tasks: Vec<_> = (0..10)
                    .map(|_| {
                        let resolver = Arc::clone(&resolver);
                        let session = session.clone();
                        tokio::spawn(async move { resolver.resolve(&session).await })
                    })
                    .collect();
                for task in tasks {
                    black_box(task.await.unwrap().unwrap());
                }
            }
        })
    });
}

#[cfg(feature = "benchmarks")]
criterion_group!(benches, bench_generic_cache, bench_resolution);
